//! farmgrid-agent — the render node side of FarmGrid.
//!
//! A node polls the coordinator's `/farm` endpoint, runs one render
//! process per configured slot and keeps the coordinator informed of
//! progress. Lost exchanges are retried with exponential backoff and the
//! node never forgets a finished frame until the coordinator has heard
//! about it.
//!
//! # Architecture
//!
//! ```text
//!                  ┌───────────────┐
//!                  │   NodeAgent   │  cycle → sleep → cycle …
//!                  └──┬─────────┬──┘
//!                     │         │
//!            ┌────────▼───┐  ┌──▼──────────┐
//!            │ Transport  │  │  Worker × N │── render process
//!            │ (HTTP/1.1) │  └─────────────┘
//!            └────────────┘
//! ```

pub mod agent;
pub mod backoff;
pub mod error;
pub mod paths;
pub mod render;
pub mod transport;
pub mod worker;

pub use agent::NodeAgent;
pub use backoff::poll_interval;
pub use error::{LaunchError, TransportError};
pub use paths::PathMap;
pub use render::{RenderCommand, parse_progress};
pub use transport::{ExchangeFuture, HttpTransport, Transport};
pub use worker::Worker;
