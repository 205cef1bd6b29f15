//! farmgrid-scheduler — render job scheduling.
//!
//! Jobs and node records live as JSON files in two keyed stores. Every
//! operation reads the records it needs, mutates them, and writes them
//! back; there is no in-memory queue, so several coordinator processes can
//! share one data directory. The scheduler:
//!
//! - Creates jobs, optionally ordering their frames by bisection
//! - Tracks node identities and a decayed per-capability rate estimate
//! - Draws tasks with a two-stage (project, then job) weighted lottery
//! - Refreshes, adopts, or rejects in-flight work on progress reports
//! - Returns work from silent nodes to the queue (or marks it failed)
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── jobs: Store      (<id>.json per job)
//!   ├── nodes: Store     (<ident>.json per node)
//!   ├── CapabilityRates  (process-wide, decayed per announcement)
//!   ├── ProjectDirectory (project priority, render time history)
//!   └── Clock            (wall clock, or manual in tests)
//! ```

pub mod bisect;
pub mod clock;
pub mod error;
pub mod job;
pub mod projects;
pub mod rates;
pub mod scheduler;
pub mod selection;

pub use bisect::bisection_order;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{SchedulerError, SchedulerResult};
pub use job::{Job, JobProgress, JobSnapshot, NewJob, NodeRecord, WorkItem};
pub use projects::{ProjectDirectory, StaticProjects, StoreProjects};
pub use rates::CapabilityRates;
pub use scheduler::{ReapReport, Scheduler, Task};
