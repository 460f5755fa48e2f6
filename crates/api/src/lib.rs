//! HTTP surface of the send worker.
//!
//! Endpoints:
//! - GET  /health
//! - POST /api/queues/{id}/process — run one invocation inline
//! - GET  /api/queues/{id} — queue status and counters
//! - GET  /api/queues/{id}/sends — sends of a queue, `?status=` filter
//! - POST /api/sends/{id}/requeue — move a failed send back to queued

pub mod middleware;
pub mod routes;
pub mod state;
