//! Render slots.
//!
//! Each [`Worker`] owns at most one render process. The process itself is
//! driven by a spawned task that waits for it to exit (or kills it on
//! request) and then reports back through a oneshot channel, so the node
//! loop can poll slots without blocking.

use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use farm_core::{FrameSpec, Request, TaskAssignment};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Notify, oneshot};
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, info, warn};

use crate::error::LaunchError;
use crate::render::{RenderCommand, parse_progress};

/// How a render process ended.
#[derive(Debug)]
struct Exit {
    /// `None` when the process was killed or could not be waited on.
    status: Option<ExitStatus>,
    at: Instant,
}

struct Running {
    task: TaskAssignment,
    started: Instant,
    /// Frame the renderer last announced; only updated for ranges.
    progress: Arc<AtomicI64>,
    exit: oneshot::Receiver<Exit>,
    kill: Option<oneshot::Sender<()>>,
}

impl Running {
    fn report(&self) -> Request {
        let (done, total) = if self.task.frame.is_range() {
            let total = self.task.frame.len();
            let current = self.progress.load(Ordering::Relaxed);
            let done = (current - self.task.frame.first()).clamp(0, total as i64) as u64;
            (done, total)
        } else {
            (0, 1)
        };
        Request::Report {
            uuid: self.task.uuid.clone(),
            frame: self.task.frame,
            done: u32::try_from(done).unwrap_or(u32::MAX),
            total: u32::try_from(total).unwrap_or(u32::MAX),
        }
    }
}

#[derive(Default)]
enum SlotState {
    #[default]
    Idle,
    Running(Running),
}

/// One render slot.
pub struct Worker {
    slot: usize,
    threads: u32,
    state: SlotState,
}

impl Worker {
    pub fn new(slot: usize, threads: u32) -> Self {
        Self {
            slot,
            threads,
            state: SlotState::Idle,
        }
    }

    pub fn threads(&self) -> u32 {
        self.threads
    }

    /// True while a task is assigned and its outcome has not been
    /// collected by [`Worker::poll`].
    pub fn is_busy(&self) -> bool {
        matches!(self.state, SlotState::Running(_))
    }

    /// The task this slot is working on.
    pub fn task(&self) -> Option<&TaskAssignment> {
        match &self.state {
            SlotState::Running(run) => Some(&run.task),
            SlotState::Idle => None,
        }
    }

    /// Start rendering `task`. `exited` is notified when the process ends.
    pub fn launch(
        &mut self,
        task: TaskAssignment,
        command: &RenderCommand,
        exited: Arc<Notify>,
    ) -> Result<(), LaunchError> {
        let video = task.frame.is_range();
        let mut child = command.command(video).spawn()?;

        let progress = Arc::new(AtomicI64::new(task.frame.first()));
        if let Some(stdout) = child.stdout.take() {
            let progress = Arc::clone(&progress);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(frame) = parse_progress(&line) {
                        progress.store(frame, Ordering::Relaxed);
                    }
                }
            });
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let slot = self.slot;
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status.ok(),
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(slot, error = %e, "failed to kill render process");
                    }
                    None
                }
            };
            let _ = exit_tx.send(Exit {
                status,
                at: Instant::now(),
            });
            exited.notify_one();
        });

        info!(
            slot = self.slot,
            job_id = %task.uuid,
            frame = %task.frame,
            file = %task.file,
            "render started"
        );
        self.state = SlotState::Running(Running {
            task,
            started: Instant::now(),
            progress,
            exit: exit_rx,
            kill: Some(kill_tx),
        });
        Ok(())
    }

    /// The message this slot owes the coordinator, if any.
    ///
    /// A running render yields a `report`; a successful exit yields `done`
    /// and frees the slot. A failed render frees the slot silently so the
    /// coordinator times the work out and re-issues it.
    pub fn poll(&mut self) -> Option<Request> {
        let SlotState::Running(mut run) = std::mem::take(&mut self.state) else {
            return None;
        };

        match run.exit.try_recv() {
            Err(TryRecvError::Empty) => {
                let report = run.report();
                self.state = SlotState::Running(run);
                Some(report)
            }
            Ok(Exit {
                status: Some(status),
                at,
            }) if status.success() => {
                let time = at.duration_since(run.started).as_secs_f64();
                info!(
                    slot = self.slot,
                    job_id = %run.task.uuid,
                    frame = %run.task.frame,
                    seconds = time,
                    "render finished"
                );
                Some(Request::Done {
                    uuid: run.task.uuid,
                    frame: run.task.frame,
                    time,
                })
            }
            Ok(Exit { status, .. }) => {
                warn!(
                    slot = self.slot,
                    job_id = %run.task.uuid,
                    frame = %run.task.frame,
                    ?status,
                    "render failed"
                );
                None
            }
            Err(TryRecvError::Closed) => {
                warn!(slot = self.slot, job_id = %run.task.uuid, "render supervisor vanished");
                None
            }
        }
    }

    /// Kill the render if it is working on `(uuid, frame)`, waiting for the
    /// process to go away. Returns whether anything was killed.
    pub async fn kill(&mut self, uuid: &str, frame: FrameSpec) -> bool {
        let matches = matches!(
            &self.state,
            SlotState::Running(run) if run.task.uuid == uuid && run.task.frame == frame
        );
        if !matches {
            return false;
        }
        self.stop().await;
        info!(slot = self.slot, job_id = %uuid, %frame, "render killed");
        true
    }

    /// Kill whatever is running.
    pub async fn stop(&mut self) {
        let SlotState::Running(mut run) = std::mem::take(&mut self.state) else {
            return;
        };
        if let Some(kill) = run.kill.take() {
            let _ = kill.send(());
        }
        if run.exit.await.is_err() {
            debug!(slot = self.slot, "render supervisor gone before kill completed");
        }
    }
}
