//! Manual recovery for individual sends.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use cadence_common::error::AppError;

use crate::middleware::auth::AuthUser;
use crate::routes::queues::authorized_queue;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/sends/{id}/requeue", post(requeue_send))
}

/// POST /api/sends/:id/requeue — Move a failed send back to queued.
///
/// A completed parent queue is reopened so the next invocation picks the
/// send up. Queue counters keep the earlier failure.
async fn requeue_send(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, AppError> {
    let send = state
        .store()
        .get_send(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Send {} not found", id)))?;

    let queue_id = send
        .queue_id()
        .ok_or_else(|| AppError::Validation(format!("Send {} does not belong to a queue", id)))?;
    authorized_queue(&state, &auth, queue_id).await?;

    if !state.store().requeue_send(id, Utc::now()).await? {
        return Err(AppError::Validation(format!(
            "Send {} is {}, only failed sends can be re-queued",
            id, send.status
        )));
    }

    let reopened = state.store().reopen_queue(queue_id).await?;
    tracing::info!(send_id = %id, queue_id = %queue_id, reopened, "Send re-queued manually");

    Ok(Json(json!({
        "requeued": true,
        "queue_id": queue_id,
        "queue_reopened": reopened
    })))
}
