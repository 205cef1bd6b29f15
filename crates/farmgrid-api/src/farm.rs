//! Node protocol endpoints.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use farm_core::config::ProtocolConfig;
use farm_core::{Command, Request};
use farmgrid_scheduler::Scheduler;
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::{ApiState, blocking};

/// Upper bound on tasks handed out for one `task` request.
const MAX_TASKS_PER_REQUEST: u32 = 64;

/// Process one request batch in order and collect the replies.
///
/// `identity` must come before any `task` or `report` in the same batch.
/// A `task` request without its own capability list uses the one from the
/// identity. Paused nodes get no tasks.
///
/// Protocol misuse and identity failures refuse the whole batch. A store
/// failure while serving one message is logged and that message skipped,
/// so the replies to the rest of the batch still reach the node.
pub fn handle_batch(
    scheduler: &Scheduler,
    protocol: &ProtocolConfig,
    batch: Vec<Request>,
) -> Result<Vec<Command>, ProtocolError> {
    let mut identity: Option<(String, Vec<String>)> = None;
    let mut commands = Vec::new();

    for request in batch {
        match request {
            Request::Identity {
                name,
                provides,
                version,
            } => {
                scheduler.report_identity(&name, &provides, version.as_deref())?;
                identity = Some((name, provides));
            }
            Request::Info => match scheduler.active_node_count() {
                Ok(active) => commands.push(Command::Info(protocol.tuning_for(active))),
                Err(e) => warn!(error = %e, "cannot count active nodes, info skipped"),
            },
            Request::Task {
                paths,
                provides,
                count,
            } => {
                let (name, announced) = identity
                    .as_ref()
                    .ok_or(ProtocolError::IdentityRequired("task"))?;
                let provides = if provides.is_empty() {
                    announced
                } else {
                    &provides
                };
                for _ in 0..count.min(MAX_TASKS_PER_REQUEST) {
                    match scheduler.select_task(name, &paths, provides) {
                        Ok(Some(task)) => commands.push(Command::Task(task)),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(node = %name, error = %e, "task selection failed");
                            break;
                        }
                    }
                }
            }
            Request::Report {
                uuid,
                frame,
                done,
                total,
            } => {
                let (name, _) = identity
                    .as_ref()
                    .ok_or(ProtocolError::IdentityRequired("report"))?;
                match scheduler.task_alive(name, &uuid, frame, u64::from(done), u64::from(total)) {
                    Ok(true) => {}
                    Ok(false) => commands.push(Command::Kill { uuid, frame }),
                    Err(e) => {
                        warn!(node = %name, job_id = %uuid, %frame, error = %e, "report skipped")
                    }
                }
            }
            Request::Done { uuid, frame, time } => {
                if let Err(e) = scheduler.task_done(&uuid, frame, time) {
                    warn!(job_id = %uuid, %frame, error = %e, "completion skipped");
                }
            }
        }
    }
    Ok(commands)
}

/// POST /farm
pub async fn farm(State(state): State<ApiState>, body: Bytes) -> Response {
    let batch: Vec<Request> = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(e) => return ProtocolError::Malformed(e.to_string()).into_response(),
    };
    debug!(requests = batch.len(), "farm batch received");

    let protocol = state.protocol.clone();
    match blocking(&state, move |scheduler| {
        handle_batch(scheduler, &protocol, batch)
    })
    .await
    {
        Ok(Ok(commands)) => Json(commands).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => ProtocolError::from(e).into_response(),
    }
}

/// POST /potential
///
/// Body is a JSON string naming the poller.
pub async fn potential(State(state): State<ApiState>, body: Bytes) -> Response {
    let tag: String = match serde_json::from_slice(&body) {
        Ok(tag) => tag,
        Err(e) => return ProtocolError::Malformed(e.to_string()).into_response(),
    };

    match blocking(&state, move |scheduler| scheduler.potential_jobs(&tag)).await {
        Ok(Ok(jobs)) => Json(jobs).into_response(),
        Ok(Err(e)) => ProtocolError::from(e).into_response(),
        Err(e) => ProtocolError::from(e).into_response(),
    }
}
