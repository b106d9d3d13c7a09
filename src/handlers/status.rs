//! # Job Status and Cancellation Handlers
//!
//! The poll half of the dual-channel status contract, plus the HTTP
//! cancellation endpoint. The poll response carries exactly the fields the
//! push events do, so clients that cannot hold a socket open (mobile, flaky
//! networks) lose nothing by polling.

use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;

use crate::error::AppResult;
use crate::handlers::require_identity;
use crate::jobs::cancel::cancel_job;
use crate::state::AppState;

/// `GET /api/v1/jobs/{id}`
///
/// Point-in-time status snapshot for a job the caller owns.
///
/// ## Responses:
/// - `200` with `{jobId, status, progress, stage, filename, cancelling, result}`
/// - `404` with `status: "not_found"` once the job is gone — this is how
///   pollers detect completion-then-cleanup races
/// - `403` when the job belongs to someone else
pub async fn job_status(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let requester_id = require_identity(&req)?;
    let job_id = path.into_inner();

    let Some(job) = state.registry.get(&job_id) else {
        return Ok(HttpResponse::NotFound().json(json!({
            "status": "not_found",
            "error": "Job not found or completed",
        })));
    };

    // Mirror the cancellation ownership rule: status never crosses owners.
    if job.owner_id != requester_id {
        return Ok(HttpResponse::Forbidden().json(json!({
            "status": "unauthorized",
            "error": "Unauthorized access to job",
        })));
    }

    Ok(HttpResponse::Ok().json(job.snapshot()))
}

/// `POST /api/v1/jobs/{id}/cancel`
///
/// Fire-and-acknowledge cancellation. The terminal `cancelled` event is
/// delivered over the push channel; pollers observe `not_found` afterwards.
pub async fn cancel(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let requester_id = require_identity(&req)?;
    let job_id = path.into_inner();

    if cancel_job(&state.registry, &state.hub, &job_id, &requester_id).await {
        Ok(HttpResponse::Ok().json(json!({
            "cancelled": true,
            "jobId": job_id,
            "message": "Transcription cancelled successfully",
        })))
    } else {
        // Fails closed: unknown job and foreign job are indistinguishable.
        Ok(HttpResponse::NotFound().json(json!({
            "cancelled": false,
            "error": "Job not found or unauthorized",
        })))
    }
}
