//! Job and node records, and the frame state transitions on a job.
//!
//! Every requested frame sits in exactly one of `todo`, `working`, `done`
//! or `failed`. Video jobs are handed out whole: while one is running its
//! `working` list holds a single range entry and `todo` is empty.

use std::collections::BTreeSet;

use farm_core::FrameSpec;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A frame (or a video range) assigned to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub frame: FrameSpec,
    pub node: String,
    /// Unix time of the owner's last heartbeat for this work.
    pub last_seen: f64,
}

/// A render job, as persisted in `<id>.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub created_at: f64,
    /// File reference, `<path ident>::<relative path>`.
    pub file: String,
    /// Path identifier part of `file`.
    pub path: String,
    pub priority: f64,
    pub project: String,
    /// Project asset whose render time history receives samples.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset: Option<String>,
    pub video: bool,
    pub requires: BTreeSet<String>,
    pub paused: bool,
    pub first: i64,
    pub last: i64,
    pub todo: Vec<i64>,
    pub working: Vec<WorkItem>,
    pub done: Vec<i64>,
    pub failed: Vec<i64>,
    pub mean_render_time: f64,
    pub rendered_count: u64,
    pub errors: u64,
    /// Poller tags that have already been shown this job.
    pub tagged_by: BTreeSet<String>,
}

/// Parameters for a new job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub project: String,
    pub file: String,
    pub first: i64,
    pub last: i64,
    /// Defaults to the project's priority.
    #[serde(default)]
    pub priority: Option<f64>,
    #[serde(default)]
    pub video: bool,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub asset: Option<String>,
}

/// A node, as persisted in `<ident>.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeRecord {
    pub ident: String,
    pub provides: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub paused: bool,
    /// Unix time of the last identity announcement.
    pub seen: f64,
}

/// Frame counts for display.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total: u64,
    pub todo: u64,
    pub working: u64,
    pub done: u64,
    pub failed: u64,
    pub percent: f64,
}

/// Summary of a job handed to pollers and the management API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub name: String,
    pub created_at: f64,
    pub file: String,
    pub project: String,
    pub priority: f64,
    pub video: bool,
    pub paused: bool,
    pub requires: Vec<String>,
    pub frames: FrameSpec,
    pub errors: u64,
    pub mean_render_time: f64,
    pub progress: JobProgress,
}

impl Job {
    /// The full requested range.
    pub fn range(&self) -> FrameSpec {
        FrameSpec::Range(self.first, self.last)
    }

    pub fn total_frames(&self) -> u64 {
        self.range().len()
    }

    /// Whether `frame` lies inside the requested range.
    pub fn covers(&self, frame: FrameSpec) -> bool {
        frame.first() >= self.first && frame.last() <= self.last && !frame.is_empty()
    }

    fn is_expired(item: &WorkItem, now: f64, timeout: f64) -> bool {
        item.last_seen < now - timeout
    }

    /// Whether a working entry has gone without a heartbeat for longer than
    /// `timeout`.
    pub fn has_expired_work(&self, now: f64, timeout: f64) -> bool {
        self.working
            .iter()
            .any(|item| Self::is_expired(item, now, timeout))
    }

    /// Whether `select` could hand anything out right now.
    pub fn has_work(&self, now: f64, timeout: f64, retry: bool) -> bool {
        !self.todo.is_empty() || (retry && self.has_expired_work(now, timeout))
    }

    /// Whether the job can run on a node with these paths and capabilities.
    pub fn runnable_on(&self, paths: &[String], provides: &[String]) -> bool {
        !self.paused
            && paths.iter().any(|p| *p == self.path)
            && self
                .requires
                .iter()
                .all(|cap| provides.iter().any(|p| p == cap))
    }

    /// Take the next piece of work for `node`: the front of `todo`, or the
    /// longest silent expired entry when `todo` is empty and `retry` is set.
    /// Returns the work and whether it was a retry.
    pub fn pop_work(
        &mut self,
        node: &str,
        now: f64,
        timeout: f64,
        retry: bool,
    ) -> Option<(FrameSpec, bool)> {
        if !self.todo.is_empty() {
            let frame = if self.video {
                self.todo.clear();
                self.range()
            } else {
                FrameSpec::Single(self.todo.remove(0))
            };
            self.working.push(WorkItem {
                frame,
                node: node.to_string(),
                last_seen: now,
            });
            return Some((frame, false));
        }

        if !retry {
            return None;
        }
        let (index, _) = self
            .working
            .iter()
            .enumerate()
            .filter(|(_, item)| Self::is_expired(item, now, timeout))
            .min_by(|(_, a), (_, b)| a.last_seen.total_cmp(&b.last_seen))?;

        let item = &mut self.working[index];
        item.node = node.to_string();
        item.last_seen = now;
        let frame = item.frame;
        self.errors += 1;
        if self.video {
            self.done.clear();
        }
        Some((frame, true))
    }

    /// Apply a progress heartbeat from `node`. Returns `false` when another
    /// node owns the work and `node` must abort.
    pub fn heartbeat(&mut self, node: &str, frame: FrameSpec, done: u64, now: f64) -> bool {
        if !self.covers(frame) {
            warn!(job_id = %self.id, %node, %frame, range = %self.range(), "report outside job range");
            return false;
        }
        if self.video {
            return self.video_heartbeat(node, done, now);
        }

        let frame = frame.first();
        if let Some(item) = self
            .working
            .iter_mut()
            .find(|item| item.frame.first() == frame)
        {
            if item.node != node {
                return false;
            }
            item.last_seen = now;
            return true;
        }

        // Unowned: adopt it, unless it already finished elsewhere.
        if !self.done.contains(&frame) {
            self.todo.retain(|f| *f != frame);
            self.failed.retain(|f| *f != frame);
            self.working.push(WorkItem {
                frame: FrameSpec::Single(frame),
                node: node.to_string(),
                last_seen: now,
            });
        }
        true
    }

    fn video_heartbeat(&mut self, node: &str, done: u64, now: f64) -> bool {
        match self.working.first_mut() {
            Some(item) if item.node != node => return false,
            Some(item) => item.last_seen = now,
            None => {
                self.todo.clear();
                self.failed.clear();
                self.working.push(WorkItem {
                    frame: self.range(),
                    node: node.to_string(),
                    last_seen: now,
                });
            }
        }
        let done = done.min(self.total_frames()) as i64;
        self.done = (self.first..self.first + done).collect();
        true
    }

    /// Record a finished frame (or the whole video). Returns the render
    /// time history key to record the sample under, or `None` when the work
    /// had already been counted.
    pub fn complete(&mut self, frame: FrameSpec, elapsed: f64) -> Option<String> {
        if !self.covers(frame) {
            warn!(job_id = %self.id, %frame, range = %self.range(), "completion outside job range ignored");
            return None;
        }
        let key = if self.video {
            if self.working.is_empty() && self.done.len() as u64 == self.total_frames() {
                return None;
            }
            self.todo.clear();
            self.working.clear();
            self.failed.clear();
            self.done = self.range().frames().collect();
            "video".to_string()
        } else {
            let frame = frame.first();
            if let Some(index) = self
                .working
                .iter()
                .position(|item| item.frame.first() == frame)
            {
                self.working.remove(index);
            } else if self.done.contains(&frame) {
                return None;
            } else {
                self.todo.retain(|f| *f != frame);
                self.failed.retain(|f| *f != frame);
            }
            self.done.push(frame);
            frame.to_string()
        };

        self.rendered_count += 1;
        self.mean_render_time += (elapsed - self.mean_render_time) / self.rendered_count as f64;
        Some(key)
    }

    /// Move expired work back to `todo` (retry) or to `failed`. Returns the
    /// number of entries moved.
    pub fn reap(&mut self, now: f64, timeout: f64, retry: bool) -> usize {
        let (expired, alive): (Vec<WorkItem>, Vec<WorkItem>) = self
            .working
            .drain(..)
            .partition(|item| Self::is_expired(item, now, timeout));
        self.working = alive;

        for item in &expired {
            self.errors += 1;
            if self.video {
                self.done.clear();
                let frames = self.range().frames();
                if retry {
                    self.todo = frames.collect();
                } else {
                    self.failed = frames.collect();
                }
            } else if retry {
                self.todo.insert(0, item.frame.first());
            } else {
                self.failed.push(item.frame.first());
            }
        }
        expired.len()
    }

    pub fn progress(&self) -> JobProgress {
        let total = self.total_frames();
        let working = if self.video {
            if self.working.is_empty() {
                0
            } else {
                total.saturating_sub(self.done.len() as u64)
            }
        } else {
            self.working.len() as u64
        };
        let done = self.done.len() as u64;
        JobProgress {
            total,
            todo: self.todo.len() as u64,
            working,
            done,
            failed: self.failed.len() as u64,
            percent: if total == 0 {
                0.0
            } else {
                done as f64 * 100.0 / total as f64
            },
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            file: self.file.clone(),
            project: self.project.clone(),
            priority: self.priority,
            video: self.video,
            paused: self.paused,
            requires: self.requires.iter().cloned().collect(),
            frames: self.range(),
            errors: self.errors,
            mean_render_time: self.mean_render_time,
            progress: self.progress(),
        }
    }
}
