//! Scheduler — jobs, nodes, and task selection over two keyed stores.
//!
//! Each call reads the records it needs from the stores, mutates them, and
//! writes them back. Nothing spans calls except the capability rate
//! estimates, so concurrent callers (threads or processes) only contend on
//! individual job files. Two selections racing on the same job are resolved
//! last-writer-wins; the loser finds out on its next `task_alive`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use farm_core::config::{FarmConfig, SchedulerConfig};
use farm_core::{FrameSpec, TaskAssignment, split_file_ref};
use farmgrid_store::{Entry, JsonCodec, LOCK_PREFIX, Store, StoreOptions};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bisect::bisection_order;
use crate::clock::{Clock, SystemClock};
use crate::error::{SchedulerError, SchedulerResult};
use crate::job::{Job, JobSnapshot, NewJob, NodeRecord};
use crate::projects::{ProjectDirectory, StoreProjects};
use crate::rates::CapabilityRates;
use crate::selection::{job_weight, project_weight, weighted_pick};

/// A task handed to a node.
pub type Task = TaskAssignment;

const RECORD_SUFFIX: &str = ".json";

/// Outcome of a [`Scheduler::reap_expired`] sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapReport {
    /// Jobs that had expired work.
    pub jobs: usize,
    /// Work entries returned to `todo`.
    pub requeued: usize,
    /// Work entries moved to `failed`.
    pub failed: usize,
}

/// The render job scheduler.
pub struct Scheduler {
    jobs: Store,
    nodes: Store,
    projects: Arc<dyn ProjectDirectory>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    /// Seconds without a heartbeat after which work is considered lost.
    task_timeout: f64,
    rates: Mutex<CapabilityRates>,
    rng: Mutex<StdRng>,
}

fn record_name(key: &str) -> String {
    format!("{key}{RECORD_SUFFIX}")
}

/// Node identities become file names, so they must be a single plain
/// path segment.
fn validate_ident(ident: &str) -> SchedulerResult<()> {
    if ident.is_empty()
        || ident == "."
        || ident == ".."
        || ident.contains('/')
        || ident.contains('\\')
        || ident.starts_with(LOCK_PREFIX)
    {
        return Err(SchedulerError::InvalidIdentity(ident.to_string()));
    }
    Ok(())
}

fn store_options(config: &FarmConfig) -> StoreOptions {
    let defaults = StoreOptions::default();
    StoreOptions {
        single_process: config.store.single_process,
        dir_ttl: Duration::try_from_secs_f64(config.store.dir_cache_secs)
            .unwrap_or(defaults.dir_ttl),
        lock_timeout: Duration::try_from_secs_f64(config.store.lock_timeout_secs)
            .unwrap_or(defaults.lock_timeout),
    }
}

impl Scheduler {
    /// Create a scheduler over existing stores. Both stores must have the
    /// JSON codec registered.
    pub fn new(
        jobs: Store,
        nodes: Store,
        projects: Arc<dyn ProjectDirectory>,
        config: SchedulerConfig,
        task_timeout: f64,
    ) -> Self {
        let rates = CapabilityRates::new(config.require_half_life);
        Self {
            jobs,
            nodes,
            projects,
            clock: Arc::new(SystemClock),
            config,
            task_timeout,
            rates: Mutex::new(rates),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Open the jobs, nodes and projects stores named by `config`.
    pub fn open(config: &FarmConfig) -> SchedulerResult<Self> {
        let options = store_options(config);
        let jobs = Store::open(&config.store.jobs_path(), options.clone())?.with_codec(JsonCodec);
        let nodes =
            Store::open(&config.store.nodes_path(), options.clone())?.with_codec(JsonCodec);
        let projects =
            Store::open(&config.store.projects_path(), options)?.with_codec(JsonCodec);

        info!(
            jobs = ?config.store.jobs_path(),
            nodes = ?config.store.nodes_path(),
            task_timeout = config.task_timeout_secs(),
            "scheduler opened"
        );
        Ok(Self::new(
            jobs,
            nodes,
            Arc::new(StoreProjects::new(
                projects,
                config.scheduler.default_project_priority,
            )),
            config.scheduler.clone(),
            config.task_timeout_secs(),
        ))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Make the selection lottery reproducible.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn task_timeout(&self) -> f64 {
        self.task_timeout
    }

    /// Current rate estimate for a capability.
    pub fn capability_rate(&self, capability: &str) -> Option<f64> {
        self.rates.lock().get(capability)
    }

    fn now(&self) -> f64 {
        self.clock.now()
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Create a job and return its id.
    pub fn add_job(&self, new: NewJob) -> SchedulerResult<String> {
        let span = new.last.checked_sub(new.first);
        if !span.is_some_and(|span| span >= 0 && span.unsigned_abs() < self.config.max_frames) {
            return Err(SchedulerError::InvalidRange {
                first: new.first,
                last: new.last,
            });
        }
        let path = split_file_ref(&new.file)
            .map(|(ident, _)| ident.to_string())
            .ok_or_else(|| SchedulerError::InvalidFileRef(new.file.clone()))?;

        let frames: Vec<i64> = (new.first..=new.last).collect();
        let todo = if self.config.bisection_order && !new.video {
            bisection_order(&frames)
        } else {
            frames
        };
        let priority = new
            .priority
            .unwrap_or_else(|| self.projects.priority(&new.project));

        let id = Uuid::new_v4().simple().to_string();
        let job = Job {
            id: id.clone(),
            name: new.name,
            created_at: self.now(),
            file: new.file,
            path,
            priority,
            project: new.project,
            asset: new.asset,
            video: new.video,
            requires: new.requires.into_iter().collect(),
            first: new.first,
            last: new.last,
            todo,
            ..Job::default()
        };

        self.jobs
            .create_json_file(&self.jobs.root(), &record_name(&id), &job)?;
        info!(
            job_id = %id,
            name = %job.name,
            project = %job.project,
            frames = %job.range(),
            video = job.video,
            "job added"
        );
        Ok(id)
    }

    fn load_job(&self, id: &str) -> SchedulerResult<Option<(Entry, Job)>> {
        let entry = match self.jobs.get(&[record_name(id)]) {
            Ok(entry) => entry,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match self.jobs.read_json::<Job>(&entry) {
            Ok(Some(mut job)) => {
                job.id = id.to_string();
                Ok(Some((entry, job)))
            }
            Ok(None) => Ok(None),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read, mutate and write back one job. `None` if the job is gone.
    fn update_job<T>(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Job) -> T,
    ) -> SchedulerResult<Option<T>> {
        let Some((entry, mut job)) = self.load_job(id)? else {
            return Ok(None);
        };
        let out = mutate(&mut job);
        self.jobs.write_json(&entry, &job)?;
        Ok(Some(out))
    }

    pub fn job(&self, id: &str) -> SchedulerResult<Job> {
        self.load_job(id)?
            .map(|(_, job)| job)
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))
    }

    pub fn job_exists(&self, id: &str) -> bool {
        matches!(self.load_job(id), Ok(Some(_)))
    }

    /// Every decodable job, oldest first. Unreadable files are skipped.
    pub fn jobs(&self) -> SchedulerResult<Vec<Job>> {
        let mut jobs = Vec::new();
        for entry in self.jobs.children(&self.jobs.root())? {
            let Some(id) = entry
                .name()
                .and_then(|name| name.strip_suffix(RECORD_SUFFIX))
            else {
                continue;
            };
            if !entry.is_file() {
                continue;
            }
            match self.jobs.read_json::<Job>(&entry) {
                Ok(Some(mut job)) => {
                    job.id = id.to_string();
                    jobs.push(job);
                }
                Ok(None) => debug!(job_id = %id, "skipping undecodable job"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(job_id = %id, error = %e, "failed to read job"),
            }
        }
        jobs.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        Ok(jobs)
    }

    pub fn remove_job(&self, id: &str) -> SchedulerResult<()> {
        let Some((entry, _)) = self.load_job(id)? else {
            return Err(SchedulerError::JobNotFound(id.to_string()));
        };
        self.jobs.remove(&entry)?;
        info!(job_id = %id, "job removed");
        Ok(())
    }

    pub fn set_job_paused(&self, id: &str, paused: bool) -> SchedulerResult<()> {
        self.update_job(id, |job| job.paused = paused)?
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;
        info!(job_id = %id, paused, "job pause state changed");
        Ok(())
    }

    pub fn set_job_priority(&self, id: &str, priority: f64) -> SchedulerResult<()> {
        self.update_job(id, |job| job.priority = priority)?
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))?;
        info!(job_id = %id, priority, "job priority changed");
        Ok(())
    }

    // ── Nodes ──────────────────────────────────────────────────────

    fn load_node(&self, ident: &str) -> SchedulerResult<Option<(Entry, NodeRecord)>> {
        if validate_ident(ident).is_err() {
            return Ok(None);
        }
        let entry = match self.nodes.get(&[record_name(ident)]) {
            Ok(entry) => entry,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match self.nodes.read_json::<NodeRecord>(&entry) {
            Ok(Some(node)) => Ok(Some((entry, node))),
            Ok(None) => Ok(None),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Record a node's announcement and fold its capabilities into the
    /// rate estimates. A paused node stays paused.
    pub fn report_identity(
        &self,
        ident: &str,
        provides: &[String],
        version: Option<&str>,
    ) -> SchedulerResult<()> {
        validate_ident(ident)?;
        let mut record = self
            .load_node(ident)?
            .map(|(_, record)| record)
            .unwrap_or_default();
        let is_new = record.ident.is_empty();

        record.ident = ident.to_string();
        record.provides = provides.iter().cloned().collect();
        record.version = version.map(str::to_string);
        record.seen = self.now();
        self.nodes
            .create_json_file(&self.nodes.root(), &record_name(ident), &record)?;

        self.rates.lock().report(provides);
        if is_new {
            info!(node = %ident, provides = ?provides, "node joined");
        } else {
            debug!(node = %ident, "node identity refreshed");
        }
        Ok(())
    }

    /// Known nodes, sorted by identity. Nodes silent for longer than the
    /// node timeout are deleted on the way.
    pub fn nodes(&self) -> SchedulerResult<Vec<NodeRecord>> {
        let now = self.now();
        let mut nodes = Vec::new();
        for entry in self.nodes.children(&self.nodes.root())? {
            if !entry.is_file() || !entry.name().is_some_and(|n| n.ends_with(RECORD_SUFFIX)) {
                continue;
            }
            let node = match self.nodes.read_json::<NodeRecord>(&entry) {
                Ok(Some(node)) => node,
                Ok(None) => continue,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    warn!(error = %e, "failed to read node record");
                    continue;
                }
            };

            if now - node.seen > self.config.node_timeout_secs {
                match self.nodes.remove(&entry) {
                    Ok(()) => info!(node = %node.ident, "silent node purged"),
                    Err(e) => debug!(node = %node.ident, error = %e, "node purge skipped"),
                }
                continue;
            }
            nodes.push(node);
        }
        nodes.sort_by(|a, b| a.ident.cmp(&b.ident));
        Ok(nodes)
    }

    pub fn node(&self, ident: &str) -> SchedulerResult<NodeRecord> {
        self.load_node(ident)?
            .map(|(_, node)| node)
            .ok_or_else(|| SchedulerError::NodeNotFound(ident.to_string()))
    }

    pub fn set_node_paused(&self, ident: &str, paused: bool) -> SchedulerResult<()> {
        let (entry, mut node) = self
            .load_node(ident)?
            .ok_or_else(|| SchedulerError::NodeNotFound(ident.to_string()))?;
        node.paused = paused;
        self.nodes.write_json(&entry, &node)?;
        info!(node = %ident, paused, "node pause state changed");
        Ok(())
    }

    /// Pause or resume every known node. Returns how many were changed.
    pub fn set_all_nodes_paused(&self, paused: bool) -> SchedulerResult<usize> {
        let mut changed = 0;
        for node in self.nodes()? {
            if node.paused != paused {
                self.set_node_paused(&node.ident, paused)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Nodes heard from within the task timeout.
    pub fn active_node_count(&self) -> SchedulerResult<usize> {
        let cutoff = self.now() - self.task_timeout;
        Ok(self
            .nodes()?
            .iter()
            .filter(|node| node.seen >= cutoff)
            .count())
    }

    // ── Task flow ──────────────────────────────────────────────────

    /// Draw a task for `ident`, or `None` if nothing it can run has work.
    ///
    /// A project is drawn first, weighted by its priority over the work it
    /// already has in flight, then a job within it by [`job_weight`]. The
    /// chosen job is re-read before a frame is taken from it.
    pub fn select_task(
        &self,
        ident: &str,
        paths: &[String],
        provides: &[String],
    ) -> SchedulerResult<Option<Task>> {
        if let Some((_, node)) = self.load_node(ident)? {
            if node.paused {
                debug!(node = %ident, "node paused, no task");
                return Ok(None);
            }
        }

        let now = self.now();
        let retry = self.config.retry;
        let eligible: Vec<Job> = self
            .jobs()?
            .into_iter()
            .filter(|job| {
                job.runnable_on(paths, provides) && job.has_work(now, self.task_timeout, retry)
            })
            .collect();
        if eligible.is_empty() {
            return Ok(None);
        }

        let mut by_project: BTreeMap<&str, Vec<&Job>> = BTreeMap::new();
        for job in &eligible {
            by_project.entry(job.project.as_str()).or_default().push(job);
        }

        let groups: Vec<(Vec<(&str, f64)>, f64)> = {
            let rates = self.rates.lock();
            by_project
                .into_iter()
                .map(|(project, jobs)| {
                    let working: usize = jobs.iter().map(|job| job.working.len()).sum();
                    let weight = project_weight(self.projects.priority(project), working);
                    let jobs = jobs
                        .into_iter()
                        .map(|job| (job.id.as_str(), job_weight(job, &rates, &self.config)))
                        .collect();
                    (jobs, weight)
                })
                .collect()
        };

        let chosen = {
            let mut rng = self.rng.lock();
            let group = if groups.len() == 1 {
                groups.first().map(|(jobs, _)| jobs)
            } else {
                weighted_pick(&mut *rng, &groups)
            };
            group
                .and_then(|jobs| weighted_pick(&mut *rng, jobs))
                .map(|id| id.to_string())
        };
        let Some(job_id) = chosen else {
            return Ok(None);
        };

        let Some((entry, mut job)) = self.load_job(&job_id)? else {
            debug!(%job_id, "chosen job vanished");
            return Ok(None);
        };
        let Some((frame, retried)) = job.pop_work(ident, now, self.task_timeout, retry) else {
            debug!(%job_id, "chosen job ran out of work");
            return Ok(None);
        };
        self.jobs.write_json(&entry, &job)?;

        if retried {
            info!(%job_id, %frame, node = %ident, errors = job.errors, "expired task reissued");
        } else {
            debug!(%job_id, %frame, node = %ident, "task assigned");
        }
        Ok(Some(Task {
            uuid: job.id.clone(),
            frame,
            file: job.file.clone(),
            issued: now,
            requires: job.requires.iter().cloned().collect(),
        }))
    }

    /// Progress heartbeat. `false` tells the caller to abort: the job is
    /// gone or another node owns the frame.
    pub fn task_alive(
        &self,
        ident: &str,
        job_id: &str,
        frame: FrameSpec,
        done: u64,
        total: u64,
    ) -> SchedulerResult<bool> {
        let Some((entry, mut job)) = self.load_job(job_id)? else {
            debug!(%job_id, node = %ident, "heartbeat for unknown job");
            return Ok(false);
        };
        if !job.heartbeat(ident, frame, done, self.now()) {
            info!(%job_id, %frame, node = %ident, "report rejected, node must stop");
            return Ok(false);
        }
        self.jobs.write_json(&entry, &job)?;
        debug!(%job_id, %frame, node = %ident, done, total, "task alive");
        Ok(true)
    }

    /// Completion report. Reports for removed jobs, or repeated reports for
    /// the same work, are ignored.
    pub fn task_done(&self, job_id: &str, frame: FrameSpec, elapsed: f64) -> SchedulerResult<()> {
        let Some((entry, mut job)) = self.load_job(job_id)? else {
            debug!(%job_id, %frame, "completion for unknown job ignored");
            return Ok(());
        };
        let Some(key) = job.complete(frame, elapsed) else {
            debug!(%job_id, %frame, "repeated completion ignored");
            return Ok(());
        };
        self.jobs.write_json(&entry, &job)?;
        info!(
            %job_id,
            %frame,
            elapsed,
            mean = job.mean_render_time,
            "task done"
        );

        if let Some(asset) = &job.asset {
            if let Err(e) =
                self.projects
                    .record_render_time(&job.project, asset, &key, elapsed, self.now())
            {
                warn!(%job_id, %asset, error = %e, "failed to record render time");
            }
        }
        Ok(())
    }

    /// Jobs `tag` has not been shown yet; each is tagged as it is returned.
    pub fn potential_jobs(&self, tag: &str) -> SchedulerResult<Vec<JobSnapshot>> {
        let mut snapshots = Vec::new();
        for job in self.jobs()? {
            if job.tagged_by.contains(tag) {
                continue;
            }
            let snapshot = self.update_job(&job.id, |job| {
                job.tagged_by.insert(tag.to_string());
                job.snapshot()
            })?;
            snapshots.extend(snapshot);
        }
        debug!(%tag, count = snapshots.len(), "potential jobs listed");
        Ok(snapshots)
    }

    /// Return work from silent nodes to `todo`, or to `failed` when retry
    /// is disabled.
    pub fn reap_expired(&self) -> SchedulerResult<ReapReport> {
        let now = self.now();
        let retry = self.config.retry;
        let mut report = ReapReport::default();

        for job in self.jobs()? {
            if !job.has_expired_work(now, self.task_timeout) {
                continue;
            }
            let Some(moved) =
                self.update_job(&job.id, |job| job.reap(now, self.task_timeout, retry))?
            else {
                continue;
            };
            if moved == 0 {
                continue;
            }
            report.jobs += 1;
            if retry {
                report.requeued += moved;
            } else {
                report.failed += moved;
            }
            info!(job_id = %job.id, moved, retry, "expired work reaped");
        }
        Ok(report)
    }
}
