//! Runtime configuration endpoints. The service credential is reported as
//! configured/unconfigured and is never echoed back.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::config::AppConfig;

fn config_body(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "storage": {
            "upload_dir": config.storage.upload_dir,
            "retention_secs": config.storage.retention_secs
        },
        "transcription": {
            "api_url": config.transcription.api_url,
            "api_key_configured": !config.transcription.api_key.is_empty(),
            "model": config.transcription.model,
            "max_upload_mb": config.transcription.max_upload_mb,
            "single_call_limit_mb": config.transcription.single_call_limit_mb,
            "max_chunk_size_mb": config.transcription.max_chunk_size_mb,
            "max_attempts": config.transcription.max_attempts
        },
        "jobs": {
            "orphan_timeout_secs": config.jobs.orphan_timeout_secs,
            "sweep_interval_secs": config.jobs.sweep_interval_secs,
            "terminal_grace_secs": config.jobs.terminal_grace_secs
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_body(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str)?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_body(&current_config)
    })))
}
