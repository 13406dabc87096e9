//! Axum admin surface for Relayflow.
//!
//! Operators and dashboards use these routes to inspect and resolve the
//! dead-letter queue and to read pipeline metrics:
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | `GET` | `/health` | [`handlers::health_check`] |
//! | `GET` | `/metrics` | [`handlers::prometheus_metrics`] |
//! | `GET` | `/admin/events/dead-letter` | [`handlers::dead_letter::list`] |
//! | `POST` | `/admin/events/dead-letter/{id}/retry` | [`handlers::dead_letter::retry`] |
//! | `POST` | `/admin/events/dead-letter/{id}/discard` | [`handlers::dead_letter::discard`] |
//! | `GET` | `/admin/events/metrics` | [`handlers::dead_letter::metrics_snapshot`] |
//!
//! Errors are JSON `{code, message}` bodies; see [`AppError`].
//!
//! # Example
//!
//! ```ignore
//! use relayflow_web::{AppState, router};
//!
//! let app = router(AppState::new(admin, prometheus));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod handlers;
pub mod state;

pub use error::AppError;
pub use state::AppState;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Build the admin router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/admin/events/dead-letter", get(handlers::dead_letter::list))
        .route(
            "/admin/events/dead-letter/:id/retry",
            post(handlers::dead_letter::retry),
        )
        .route(
            "/admin/events/dead-letter/:id/discard",
            post(handlers::dead_letter::discard),
        )
        .route(
            "/admin/events/metrics",
            get(handlers::dead_letter::metrics_snapshot),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
