use axum::{
    Extension, Json,
    body::Bytes,
    extract::State,
};
use tracing::debug;

use super::super::{ApiError, AppState};
use super::require_write;
use crate::core::ingest::{IngestReport, IngestRequest};
use crate::core::model::TenantContext;

pub async fn ingest_batch(
    State(state): State<AppState>,
    Extension(ctx): Extension<TenantContext>,
    body: Bytes,
) -> Result<Json<IngestReport>, ApiError> {
    require_write(&ctx)?;

    // Parsed by hand so a malformed body gets the ingest error shape.
    let request: IngestRequest = serde_json::from_slice(&body).map_err(|e| ApiError::Batch {
        code: "invalid_envelope",
        message: format!("request body is not a valid batch: {}", e),
    })?;

    let report = state.ingest.ingest(&ctx, request).await?;
    debug!(
        "Tenant {} batch: {} accepted, {} rejected, {} warnings",
        ctx.tenant_id, report.accepted, report.rejected, report.warnings
    );
    Ok(Json(report))
}
