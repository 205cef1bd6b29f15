pub mod config;
pub mod protocol;
pub mod types;

pub use config::{FarmConfig, NodeConfig};
pub use protocol::{Command, Request, TaskAssignment, Tuning};
pub use types::*;
