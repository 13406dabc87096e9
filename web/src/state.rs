//! Application state for Axum handlers.

use relayflow_runtime::{DeadLetterAdmin, PrometheusExporter};
use std::sync::Arc;

/// State shared by every admin handler.
///
/// Cheap to clone (required by Axum).
#[derive(Clone)]
pub struct AppState {
    admin: Arc<DeadLetterAdmin>,
    prometheus: PrometheusExporter,
}

impl AppState {
    /// Create the state.
    #[must_use]
    pub fn new(admin: DeadLetterAdmin, prometheus: PrometheusExporter) -> Self {
        Self {
            admin: Arc::new(admin),
            prometheus,
        }
    }

    /// Dead-letter administration.
    #[must_use]
    pub fn admin(&self) -> &DeadLetterAdmin {
        &self.admin
    }

    /// Prometheus recorder handle.
    #[must_use]
    pub const fn prometheus(&self) -> &PrometheusExporter {
        &self.prometheus
    }
}
