//! Node ↔ coordinator wire protocol.
//!
//! A node POSTs a JSON array of [`Request`]s and receives a JSON array of
//! [`Command`]s. Both are objects discriminated by their `id` field:
//!
//! ```text
//! → [{"id":"identity","name":"n1","provides":["gpu"]},
//!    {"id":"info"},
//!    {"id":"task","paths":["shows"],"provides":["gpu"],"count":2}]
//! ← [{"id":"info","heartbeat":4.0,...},
//!    {"id":"task","uuid":"…","frame":17,"file":"shows::a.blend",...}]
//! ```

use serde::{Deserialize, Serialize};

use crate::types::FrameSpec;

/// A message sent by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "lowercase")]
pub enum Request {
    /// Announce who the node is and what it provides. Must precede
    /// `task` and `report` in a batch.
    Identity {
        name: String,
        #[serde(default)]
        provides: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    /// Ask for polling/backoff tuning.
    Info,
    /// Ask for up to `count` tasks.
    Task {
        paths: Vec<String>,
        #[serde(default)]
        provides: Vec<String>,
        count: u32,
    },
    /// Progress heartbeat for a running task.
    Report {
        uuid: String,
        frame: FrameSpec,
        #[serde(default)]
        done: u32,
        #[serde(default = "default_total")]
        total: u32,
    },
    /// A task finished successfully after `time` seconds.
    Done {
        uuid: String,
        frame: FrameSpec,
        time: f64,
    },
}

fn default_total() -> u32 {
    1
}

impl Request {
    /// The `(job, frame)` a report or done message is about.
    pub fn task_key(&self) -> Option<(&str, FrameSpec)> {
        match self {
            Request::Report { uuid, frame, .. } | Request::Done { uuid, frame, .. } => {
                Some((uuid.as_str(), *frame))
            }
            _ => None,
        }
    }
}

/// A command sent back to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "lowercase")]
pub enum Command {
    Info(Tuning),
    Task(TaskAssignment),
    Kill { uuid: String, frame: FrameSpec },
}

/// Polling parameters handed to nodes in reply to `info`. All values are
/// seconds except `error_scale`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tuning {
    /// Base polling interval.
    pub heartbeat: f64,
    /// Upper bound of the random jitter added to every sleep.
    pub arrhythmia: f64,
    /// Multiplier applied per consecutive transport failure.
    pub error_scale: f64,
    /// Ceiling for any sleep.
    pub hibernation: f64,
    /// How long the tuning stays valid before the node asks again.
    pub memory: f64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            heartbeat: 4.0,
            arrhythmia: 1.0,
            error_scale: 2.0,
            hibernation: 600.0,
            memory: 600.0,
        }
    }
}

/// A unit of work handed to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    /// Job id.
    pub uuid: String,
    pub frame: FrameSpec,
    /// File reference, `<path ident>::<relative path>`.
    pub file: String,
    /// Unix time the task was issued.
    pub issued: f64,
    #[serde(default)]
    pub requires: Vec<String>,
}
