//! The node loop.
//!
//! Every cycle the node sends one batch to the coordinator:
//!
//! 1. its identity,
//! 2. messages retained from cycles that failed to get through,
//! 3. an `info` request when the current tuning has expired,
//! 4. a `report` (or `done`) per busy slot,
//! 5. a `task` request covering every idle slot.
//!
//! It then applies the returned commands and sleeps for a heartbeat, waking
//! early when a render exits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use farm_core::config::{NodeConfig, RenderConfig};
use farm_core::{Command, Request, TaskAssignment, Tuning};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use crate::backoff::poll_interval;
use crate::error::{LaunchError, TransportError};
use crate::paths::PathMap;
use crate::render::RenderCommand;
use crate::transport::Transport;
use crate::worker::Worker;

/// A render node talking to one coordinator.
pub struct NodeAgent<T: Transport> {
    transport: T,
    name: String,
    provides: Vec<String>,
    version: Option<String>,
    single_use: bool,
    jitter: f64,
    paths: PathMap,
    render: RenderConfig,
    workers: Vec<Worker>,
    exited: Arc<Notify>,
    tuning: Tuning,
    /// When `tuning` was last refreshed; `None` until the first `info`.
    tuning_at: Option<Instant>,
    /// Consecutive failed exchanges.
    failures: u32,
    /// `report`/`done` messages that have not reached the coordinator yet.
    retained: Vec<Request>,
    connected_once: bool,
    rng: StdRng,
}

impl<T: Transport> NodeAgent<T> {
    /// Build an agent from its config. A node without a configured name
    /// gets a random one.
    pub fn new(config: NodeConfig, transport: T) -> Self {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let slots = if config.slots.is_empty() {
            warn!("no render slots configured, using a single one");
            vec![1]
        } else {
            config.slots.clone()
        };
        let workers = slots
            .iter()
            .enumerate()
            .map(|(slot, &threads)| Worker::new(slot, threads))
            .collect();

        Self {
            transport,
            name,
            provides: config.provides,
            version: config.version,
            single_use: config.single_use,
            jitter: config.jitter_secs,
            paths: PathMap::new(config.paths),
            render: config.render,
            workers,
            exited: Arc::new(Notify::new()),
            tuning: Tuning::default(),
            tuning_at: None,
            failures: 0,
            retained: Vec::new(),
            connected_once: false,
            rng: StdRng::from_entropy(),
        }
    }

    /// Make jitter reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn retained(&self) -> &[Request] {
        &self.retained
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn busy_slots(&self) -> usize {
        self.workers.iter().filter(|w| w.is_busy()).count()
    }

    /// A single-use node is finished once it has been served, every render
    /// has been collected and nothing is left to deliver.
    pub fn finished(&self) -> bool {
        self.single_use
            && self.connected_once
            && self.busy_slots() == 0
            && self.retained.is_empty()
    }

    fn tuning_expired(&self) -> bool {
        self.tuning_at
            .is_none_or(|at| at.elapsed().as_secs_f64() >= self.tuning.memory)
    }

    /// Hold on to an undelivered message. A newer message about the same
    /// task replaces any retained `report` for it.
    fn retain(&mut self, message: Request) {
        let Some((uuid, frame)) = message.task_key() else {
            return;
        };
        self.retained.retain(|old| {
            !(matches!(old, Request::Report { .. }) && old.task_key() == Some((uuid, frame)))
        });
        self.retained.push(message);
    }

    /// One exchange with the coordinator.
    pub async fn cycle(&mut self) -> Result<(), TransportError> {
        let mut batch = vec![Request::Identity {
            name: self.name.clone(),
            provides: self.provides.clone(),
            version: self.version.clone(),
        }];

        let retained = std::mem::take(&mut self.retained);
        batch.extend(retained.iter().cloned());

        if self.tuning_expired() {
            batch.push(Request::Info);
        }

        let mut fresh = Vec::new();
        for worker in &mut self.workers {
            if let Some(message) = worker.poll() {
                fresh.push(message);
            }
        }
        batch.extend(fresh.iter().cloned());

        let idle = self.workers.len() - self.busy_slots();
        if idle > 0 && !(self.single_use && self.connected_once) {
            debug!(count = idle, "requesting tasks");
            batch.push(Request::Task {
                paths: self.paths.idents(),
                provides: self.provides.clone(),
                count: u32::try_from(idle).unwrap_or(u32::MAX),
            });
        }

        let commands = match self.transport.exchange(&batch).await {
            Ok(commands) => commands,
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                for message in retained.into_iter().chain(fresh) {
                    self.retain(message);
                }
                warn!(
                    failures = self.failures,
                    retained = self.retained.len(),
                    error = %e,
                    "exchange with coordinator failed"
                );
                return Err(e);
            }
        };

        self.failures = 0;
        self.connected_once = true;
        for command in commands {
            self.apply(command).await;
        }
        Ok(())
    }

    async fn apply(&mut self, command: Command) {
        match command {
            Command::Info(tuning) => {
                if tuning != self.tuning {
                    info!(heartbeat = tuning.heartbeat, "tuning updated");
                }
                self.tuning = tuning;
                self.tuning_at = Some(Instant::now());
            }
            Command::Task(task) => {
                let (job_id, frame) = (task.uuid.clone(), task.frame);
                if let Err(e) = self.start(task) {
                    warn!(%job_id, %frame, error = %e, "cannot start render");
                }
            }
            Command::Kill { uuid, frame } => {
                let mut killed = false;
                for worker in &mut self.workers {
                    killed |= worker.kill(&uuid, frame).await;
                }
                if !killed {
                    debug!(job_id = %uuid, %frame, "kill for a task not running here");
                }
            }
        }
    }

    fn start(&mut self, task: TaskAssignment) -> Result<(), LaunchError> {
        let Some(worker) = self.workers.iter_mut().find(|w| !w.is_busy()) else {
            warn!(job_id = %task.uuid, frame = %task.frame, "task received with no idle slot");
            return Ok(());
        };
        let file = self.paths.resolve(&task.file)?;
        let command = RenderCommand::build(&self.render, &file, task.frame, worker.threads());
        worker.launch(task, &command, Arc::clone(&self.exited))
    }

    /// Delay before the next cycle.
    pub fn next_sleep(&mut self) -> Duration {
        let jitter = self.rng.gen_range(0.0..1.0);
        poll_interval(&self.tuning, self.failures, jitter)
    }

    /// Run until `shutdown` fires or, for single-use nodes, until the work
    /// is done. Running renders are killed on the way out.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            node = %self.name,
            slots = self.workers.len(),
            paths = ?self.paths.idents(),
            "node starting"
        );

        if self.jitter > 1e-3 {
            let delay = Duration::try_from_secs_f64(self.rng.gen_range(0.0..self.jitter))?;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }

        loop {
            if let Err(e) = self.cycle().await {
                debug!(failures = self.failures, error = %e, "retrying with backoff");
            }

            if self.finished() {
                info!(node = %self.name, "single-use node done");
                break;
            }

            let sleep = self.next_sleep();
            let exited = Arc::clone(&self.exited);
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = exited.notified() => debug!("render exited, polling early"),
                _ = shutdown.changed() => {
                    info!(node = %self.name, "node shutting down");
                    break;
                }
            }
        }

        for worker in &mut self.workers {
            worker.stop().await;
        }
        Ok(())
    }
}
