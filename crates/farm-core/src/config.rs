//! farm.toml / node.toml configuration parsers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::protocol::Tuning;

/// Coordinator configuration (`farm.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base directory; the per-store directories default to children of it.
    pub data_dir: PathBuf,
    pub jobs_dir: Option<PathBuf>,
    pub nodes_dir: Option<PathBuf>,
    pub projects_dir: Option<PathBuf>,
    /// Skip cross-process file locks. Only safe when a single coordinator
    /// process touches the data directory.
    pub single_process: bool,
    /// How long a directory listing is trusted before it is re-read.
    pub dir_cache_secs: f64,
    /// Lock markers older than this are considered abandoned.
    pub lock_timeout_secs: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/farmgrid"),
            jobs_dir: None,
            nodes_dir: None,
            projects_dir: None,
            single_process: false,
            dir_cache_secs: 30.0,
            lock_timeout_secs: 30.0,
        }
    }
}

impl StoreConfig {
    pub fn jobs_path(&self) -> PathBuf {
        self.jobs_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("jobs"))
    }

    pub fn nodes_path(&self) -> PathBuf {
        self.nodes_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("nodes"))
    }

    pub fn projects_path(&self) -> PathBuf {
        self.projects_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("projects"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Re-issue frames whose node stopped heartbeating; when false they are
    /// marked failed instead.
    pub retry: bool,
    /// Hand out frames in breadth-first bisection order.
    pub bisection_order: bool,
    /// Announcements needed for a capability rate estimate to halve.
    pub require_half_life: f64,
    /// Render time (seconds) below which jobs are not throttled.
    pub min_render_time: f64,
    /// Divisor applied to jobs with frames in flight but none finished.
    pub unknown_render_time: f64,
    /// Multiplier for a job whose first frame has not been issued yet.
    pub first_frame_boost: f64,
    /// Task timeout, as a multiple of the heartbeat.
    pub timeout_scale: f64,
    /// Nodes unseen for this long are dropped from the node list.
    pub node_timeout_secs: f64,
    /// How often the coordinator sweeps timed out work.
    pub reap_interval_secs: f64,
    /// Priority of projects the project directory does not know.
    pub default_project_priority: f64,
    /// Largest frame range a single job may request.
    pub max_frames: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry: true,
            bisection_order: true,
            require_half_life: 64.0,
            min_render_time: 10.0,
            unknown_render_time: 4.0,
            first_frame_boost: 1024.0,
            timeout_scale: 8.0,
            node_timeout_secs: 3600.0,
            reap_interval_secs: 30.0,
            default_project_priority: 1.0,
            max_frames: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Polling interval floor handed to nodes.
    pub heartbeat_secs: f64,
    /// Active nodes per second of heartbeat the coordinator accepts before
    /// slowing everyone down.
    pub rate_control: f64,
    pub hibernation_secs: f64,
    pub arrhythmia_secs: f64,
    pub error_scale: f64,
    pub memory_secs: f64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        let tuning = Tuning::default();
        Self {
            heartbeat_secs: tuning.heartbeat,
            rate_control: 10.0,
            hibernation_secs: tuning.hibernation,
            arrhythmia_secs: tuning.arrhythmia,
            error_scale: tuning.error_scale,
            memory_secs: tuning.memory,
        }
    }
}

impl ProtocolConfig {
    /// Tuning for a fleet with `active_nodes` recently seen nodes:
    /// the heartbeat grows with the fleet, never below the configured floor
    /// nor above the hibernation ceiling.
    pub fn tuning_for(&self, active_nodes: usize) -> Tuning {
        let load_floor = if self.rate_control > 0.0 {
            active_nodes as f64 / self.rate_control
        } else {
            0.0
        };
        let heartbeat = self
            .heartbeat_secs
            .max(load_floor)
            .min(self.hibernation_secs);

        Tuning {
            heartbeat,
            arrhythmia: self.arrhythmia_secs,
            error_scale: self.error_scale,
            hibernation: self.hibernation_secs,
            memory: self.memory_secs,
        }
    }
}

impl FarmConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FarmConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Seconds without a heartbeat after which in-flight work is timed out.
    pub fn task_timeout_secs(&self) -> f64 {
        self.protocol.heartbeat_secs * self.scheduler.timeout_scale
    }
}

/// Worker node configuration (`node.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity announced to the coordinator; a random one is generated
    /// when absent.
    pub name: Option<String>,
    /// Base URL of the coordinator, e.g. `http://farm:8080`.
    pub server: String,
    pub provides: Vec<String>,
    pub version: Option<String>,
    /// One entry per render slot: the thread count handed to that slot.
    pub slots: Vec<u32>,
    /// Take one batch of work, finish it and exit.
    pub single_use: bool,
    /// Upper bound of the random delay before the first poll.
    pub jitter_secs: f64,
    /// Path identifier → local mount point.
    pub paths: HashMap<String, PathBuf>,
    pub render: RenderConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            server: "http://127.0.0.1:8080".to_string(),
            provides: Vec::new(),
            version: None,
            slots: vec![1],
            single_use: false,
            jitter_secs: 0.0,
            paths: HashMap::new(),
            render: RenderConfig::default(),
        }
    }
}

/// How a render process is launched. `args` may contain the placeholders
/// `{file}`, `{start}`, `{end}` and `{threads}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Run through `nice -n <value>` when set.
    pub nice: Option<i32>,
    pub env: HashMap<String, String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("blender"),
            args: ["-t", "{threads}", "-y", "-b", "{file}", "-s", "{start}", "-e", "{end}", "-a"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            nice: Some(10),
            env: HashMap::new(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }
}
