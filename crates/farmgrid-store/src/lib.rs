//! farmgrid-store — keyed store for FarmGrid.
//!
//! Maps hierarchical keys (sequences of path segments) onto a real
//! directory tree, so state survives restarts and can be inspected or
//! edited by hand.
//!
//! # Caching
//!
//! Directory listings are cached and re-read once older than a TTL, so
//! they may lag external changes by up to that long. File payloads are
//! decoded lazily through the codec registered for the file's suffix and
//! cached against the file's modification stamp; every read re-checks the
//! stamp, so a read never returns content older than the last completed
//! write.
//!
//! # Locking
//!
//! Writes take a per-file advisory lock: a sibling marker directory
//! `.lock_<name>` created with an atomic `mkdir`. Entries with that prefix
//! are hidden from listings. In single-process mode the marker is skipped.

pub mod codec;
pub mod error;
pub mod lock;
pub mod store;

pub use codec::{Codec, JsonCodec, Payload, RawCodec};
pub use error::{StoreError, StoreResult};
pub use lock::{FileLock, LOCK_PREFIX};
pub use store::{Entry, EntryKind, Store, StoreOptions};
