//! Queue routes: the invocation contract plus read-only inspection.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cadence_common::error::AppError;
use cadence_common::types::{EmailSend, SendQueue, SendStatus};
use cadence_worker::driver::{InvocationOutcome, InvocationRequest};

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/queues/{id}", get(get_queue))
        .route("/api/queues/{id}/process", post(process_queue))
        .route("/api/queues/{id}/sends", get(list_sends))
}

/// Body returned by a successful invocation.
#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub success: bool,
    pub queue_id: Uuid,
    pub processed: u32,
    pub sent: u32,
    pub failed: u32,
    pub skipped: u32,
    pub deferred: u32,
    pub completed: bool,
    pub continued: bool,
    pub chain_limit_reached: bool,
}

impl From<InvocationOutcome> for ProcessResponse {
    fn from(outcome: InvocationOutcome) -> Self {
        Self {
            success: true,
            queue_id: outcome.queue_id,
            processed: outcome.processed(),
            sent: outcome.report.sent,
            failed: outcome.report.failed,
            skipped: outcome.report.skipped,
            deferred: outcome.report.deferred,
            completed: outcome.completed,
            continued: outcome.continuation.is_some(),
            chain_limit_reached: outcome.chain_limit_reached,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListSendsQuery {
    pub status: Option<String>,
}

/// Load a queue the caller is allowed to touch.
pub(crate) async fn authorized_queue(
    state: &AppState,
    auth: &AuthUser,
    queue_id: Uuid,
) -> Result<SendQueue, AppError> {
    let queue = state
        .store()
        .get_queue(queue_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Queue {} not found", queue_id)))?;
    auth.ensure_can_access(queue.user_id)?;
    Ok(queue)
}

/// POST /api/queues/:id/process — Run one invocation for the queue.
async fn process_queue(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ProcessResponse>, AppError> {
    authorized_queue(&state, &auth, id).await?;

    let outcome = state.driver.invoke(InvocationRequest::new(id)).await?;
    Ok(Json(ProcessResponse::from(outcome)))
}

/// GET /api/queues/:id — Queue status and counters.
async fn get_queue(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<SendQueue>, AppError> {
    let queue = authorized_queue(&state, &auth, id).await?;
    Ok(Json(queue))
}

/// GET /api/queues/:id/sends — Sends of a queue, optionally filtered by status.
async fn list_sends(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Query(query): Query<ListSendsQuery>,
) -> Result<Json<Vec<EmailSend>>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<SendStatus>)
        .transpose()
        .map_err(AppError::Validation)?;

    authorized_queue(&state, &auth, id).await?;

    let sends = state.store().list_sends(id, status).await?;
    Ok(Json(sends))
}
