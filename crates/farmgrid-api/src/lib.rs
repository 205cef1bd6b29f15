//! farmgrid-api — HTTP API for FarmGrid.
//!
//! Serves the node protocol and a JSON management API over a shared
//! [`Scheduler`]. Scheduler calls touch the filesystem, so every handler
//! runs them on tokio's blocking pool.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/farm` | Node protocol batch (requests in, commands out) |
//! | POST | `/potential` | Jobs not yet shown to a poller tag |
//! | GET | `/api/v1/jobs` | List job summaries |
//! | POST | `/api/v1/jobs` | Submit a job |
//! | GET | `/api/v1/jobs/{id}` | Full job record |
//! | DELETE | `/api/v1/jobs/{id}` | Remove a job |
//! | POST | `/api/v1/jobs/{id}/pause` | Pause or resume a job |
//! | POST | `/api/v1/jobs/{id}/priority` | Change a job's priority |
//! | GET | `/api/v1/nodes` | List known nodes |
//! | POST | `/api/v1/nodes/pause` | Pause or resume every node |
//! | POST | `/api/v1/nodes/{id}/pause` | Pause or resume one node |

pub mod error;
pub mod farm;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use farm_core::config::ProtocolConfig;
use farmgrid_scheduler::Scheduler;

pub use error::ProtocolError;
pub use farm::handle_batch;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub protocol: ProtocolConfig,
}

impl ApiState {
    pub fn new(scheduler: Arc<Scheduler>, protocol: ProtocolConfig) -> Self {
        Self {
            scheduler,
            protocol,
        }
    }
}

/// Run a scheduler call on the blocking pool.
pub(crate) async fn blocking<T, F>(
    state: &ApiState,
    call: F,
) -> Result<T, tokio::task::JoinError>
where
    F: FnOnce(&Scheduler) -> T + Send + 'static,
    T: Send + 'static,
{
    let scheduler = Arc::clone(&state.scheduler);
    tokio::task::spawn_blocking(move || call(&scheduler)).await
}

/// Build the complete router (node protocol + management API).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/jobs", get(handlers::list_jobs).post(handlers::create_job))
        .route("/jobs/{id}", get(handlers::get_job).delete(handlers::delete_job))
        .route("/jobs/{id}/pause", post(handlers::pause_job))
        .route("/jobs/{id}/priority", post(handlers::set_job_priority))
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/pause", post(handlers::pause_all_nodes))
        .route("/nodes/{id}/pause", post(handlers::pause_node))
        .with_state(state.clone());

    Router::new()
        .route("/farm", post(farm::farm))
        .route("/potential", post(farm::potential))
        .with_state(state)
        .nest("/api/v1", api_routes)
}
