//! Dead-letter administration endpoints.
//!
//! ```text
//! GET  /admin/events/dead-letter?tenant_id=..&resolved=..&event_type=..&limit=..&offset=..
//! POST /admin/events/dead-letter/{id}/retry
//! POST /admin/events/dead-letter/{id}/discard   {"reason": "..."}
//! GET  /admin/events/metrics
//! ```

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
};
use relayflow_core::dead_letter::{DEFAULT_PAGE_SIZE, DeadLetterPage, DeadLetterQuery};
use relayflow_runtime::{MetricsSnapshot, ResolutionReceipt};
use serde::Deserialize;
use uuid::Uuid;

/// Query string of the list endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Required.
    pub tenant_id: Option<String>,
    /// `true` resolved only, `false` unresolved only.
    pub resolved: Option<bool>,
    /// Restrict to one event type.
    pub event_type: Option<String>,
    /// Page size (default 50, clamped to 1..=500).
    pub limit: Option<i64>,
    /// Rows to skip (default 0).
    pub offset: Option<i64>,
}

impl ListParams {
    fn into_query(self) -> Result<DeadLetterQuery, AppError> {
        let tenant_id = self
            .tenant_id
            .filter(|tenant| !tenant.trim().is_empty())
            .ok_or_else(|| AppError::bad_request("tenant_id is required"))?;

        Ok(DeadLetterQuery {
            tenant_id,
            resolved: self.resolved,
            event_type: self.event_type.filter(|t| !t.is_empty()),
            limit: self.limit.unwrap_or(DEFAULT_PAGE_SIZE),
            offset: self.offset.unwrap_or(0),
        })
    }
}

/// Body of the discard endpoint.
#[derive(Debug, Deserialize)]
pub struct DiscardRequest {
    /// Why the operator is dropping the event.
    pub reason: String,
}

fn parse_id(id: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(id).map_err(|_| AppError::bad_request(format!("Invalid dead-letter id: {id}")))
}

/// List dead-letter rows of a tenant, newest failure first.
///
/// # Errors
///
/// 400 without `tenant_id`, 500 if the store fails.
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<DeadLetterPage>, AppError> {
    let query = params.into_query()?;
    Ok(Json(state.admin().list(query).await?))
}

/// Re-queue a dead-letter row as a fresh `PENDING` outbox row.
///
/// # Errors
///
/// 404 for an unknown id, 409 if the row is already resolved.
pub async fn retry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ResolutionReceipt>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(state.admin().retry(id).await?))
}

/// Drop a dead-letter row, recording the operator's reason.
///
/// # Errors
///
/// 400 for a blank reason, 404 for an unknown id, 409 if already resolved.
pub async fn discard(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<DiscardRequest>,
) -> Result<Json<ResolutionReceipt>, AppError> {
    let id = parse_id(&id)?;
    let reason = request.reason.trim();
    if reason.is_empty() {
        return Err(AppError::bad_request("reason is required"));
    }
    Ok(Json(state.admin().discard(id, reason).await?))
}

/// Pipeline metrics snapshot.
///
/// # Errors
///
/// 500 if the outbox, dead-letter table or DLQ stream cannot be read.
pub async fn metrics_snapshot(
    State(state): State<AppState>,
) -> Result<Json<MetricsSnapshot>, AppError> {
    Ok(Json(state.admin().metrics_snapshot().await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_params_defaults() {
        let query = ListParams {
            tenant_id: Some("tenant-1".to_string()),
            ..ListParams::default()
        }
        .into_query();

        let query = query.ok();
        assert_eq!(query.as_ref().map(|q| q.limit), Some(DEFAULT_PAGE_SIZE));
        assert_eq!(query.map(|q| q.offset), Some(0));
    }

    #[test]
    fn test_list_params_require_tenant() {
        let blank = ListParams {
            tenant_id: Some("  ".to_string()),
            ..ListParams::default()
        };
        assert!(blank.into_query().is_err());
        assert!(ListParams::default().into_query().is_err());
    }
}
