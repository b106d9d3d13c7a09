//! # Audio Submission Handler
//!
//! Accepts a multipart audio upload, validates it, stores it, registers the
//! job, and returns the job identifier immediately. All processing happens
//! asynchronously in the spawned pipeline task — the client tracks it over
//! the push channel or by polling.

use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::stream::StreamExt;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::error::{AppError, AppResult};
use crate::events::StatusEvent;
use crate::handlers::require_identity;
use crate::jobs::pipeline::{run_job, StoredUpload};
use crate::state::AppState;

/// Extensions accepted for upload; anything else is rejected up front.
const ALLOWED_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "mp4", "webm", "ogg"];

const MEGABYTE: f64 = 1024.0 * 1024.0;

/// A stored upload plus the metadata the job needs.
struct UploadedAudio {
    path: PathBuf,
    original_filename: String,
    size_bytes: u64,
}

/// `POST /api/v1/transcribe`
///
/// ## Request:
/// Multipart form data with an audio file field named "audio" and an
/// optional "language" text field (hint for the transcription service).
///
/// ## Response:
/// ```json
/// { "jobId": "...", "message": "Processing started", "filename": "..." }
/// ```
/// The accept is non-blocking: the job record is registered before this
/// returns, so an immediate status poll will find it.
pub async fn transcribe(
    req: HttpRequest,
    payload: Multipart,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let owner_id = require_identity(&req)?;
    let config = state.get_config();

    if config.transcription.api_key.is_empty() {
        return Err(AppError::ConfigError(
            "Transcription service credentials are not configured".to_string(),
        ));
    }

    let (upload, language) = read_upload(payload, &config).await?;

    info!(
        "Accepted {} ({:.1}MB) from user {}",
        upload.original_filename,
        upload.size_bytes as f64 / MEGABYTE,
        owner_id
    );

    // Register the job before replying so there is no window between the
    // accept response and the first status query.
    let job = state
        .registry
        .create(&owner_id, &upload.original_filename, language);
    job.register_original(upload.path.clone());

    // Initial status so push subscribers see the job right away.
    state.hub.publish(
        &owner_id,
        StatusEvent::StatusUpdate {
            snapshot: job.snapshot(),
        },
    );

    let deps = state.pipeline_deps();
    let stored = StoredUpload {
        path: upload.path,
        size_bytes: upload.size_bytes,
    };
    tokio::spawn(run_job(deps, job.clone(), stored));

    Ok(HttpResponse::Ok().json(json!({
        "jobId": job.id,
        "message": "Processing started",
        "filename": job.filename,
    })))
}

/// Pull the audio file and optional language hint out of the multipart
/// stream, validating and persisting the file as it arrives.
async fn read_upload(
    mut payload: Multipart,
    config: &crate::config::AppConfig,
) -> AppResult<(UploadedAudio, Option<String>)> {
    let mut upload: Option<UploadedAudio> = None;
    let mut language: Option<String> = None;

    while let Some(item) = payload.next().await {
        let mut field: Field =
            item.map_err(|e| AppError::ValidationError(format!("Multipart error: {}", e)))?;

        let content_disposition = field
            .content_disposition()
            .ok_or_else(|| AppError::ValidationError("Missing content disposition".to_string()))?;

        let field_name = content_disposition
            .get_name()
            .ok_or_else(|| AppError::ValidationError("Missing field name".to_string()))?
            .to_string();

        match field_name.as_str() {
            "audio" => {
                if upload.is_some() {
                    return Err(AppError::ValidationError(
                        "Please upload only one audio file at a time".to_string(),
                    ));
                }

                let original_filename = content_disposition
                    .get_filename()
                    .map(|s| s.to_string())
                    .ok_or_else(|| {
                        AppError::ValidationError("No audio file provided".to_string())
                    })?;

                upload = Some(store_audio_field(&mut field, &original_filename, config).await?);
            }
            "language" => {
                let mut bytes = Vec::new();
                while let Some(chunk) = field.next().await {
                    let chunk = chunk
                        .map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
                    bytes.extend_from_slice(&chunk);
                }
                let value = String::from_utf8_lossy(&bytes).trim().to_string();
                if !value.is_empty() {
                    language = Some(value);
                }
            }
            _ => {
                // Drain unknown fields so the stream can make progress.
                while let Some(chunk) = field.next().await {
                    chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
                }
            }
        }
    }

    let upload = upload.ok_or_else(|| AppError::ValidationError("No audio file provided".to_string()))?;
    Ok((upload, language))
}

/// Stream the audio field to the upload directory with a size guard.
async fn store_audio_field(
    field: &mut Field,
    original_filename: &str,
    config: &crate::config::AppConfig,
) -> AppResult<UploadedAudio> {
    // Only the basename is trusted; path components from the client are
    // dropped entirely.
    let safe_name = Path::new(original_filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio".to_string());

    let extension = Path::new(&safe_name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(AppError::ValidationError(
            "Invalid file type. Please upload audio files only.".to_string(),
        ));
    }

    let upload_dir = PathBuf::from(&config.storage.upload_dir);
    tokio::fs::create_dir_all(&upload_dir).await?;

    let stored_path = upload_dir.join(format!(
        "{}-{}",
        chrono::Utc::now().timestamp_millis(),
        safe_name
    ));

    let max_bytes = (config.transcription.max_upload_mb * MEGABYTE) as u64;
    let mut file = tokio::fs::File::create(&stored_path).await?;
    let mut size_bytes: u64 = 0;

    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
        size_bytes += chunk.len() as u64;

        if size_bytes > max_bytes {
            // Abandon the partial file before rejecting.
            drop(file);
            let _ = tokio::fs::remove_file(&stored_path).await;
            return Err(AppError::ValidationError(format!(
                "File too large. Maximum allowed is {:.0}MB. Files larger than {:.0}MB are \
                 automatically split into smaller chunks for processing.",
                config.transcription.max_upload_mb, config.transcription.single_call_limit_mb
            )));
        }

        file.write_all(&chunk).await?;
    }

    file.flush().await?;

    if size_bytes == 0 {
        let _ = tokio::fs::remove_file(&stored_path).await;
        return Err(AppError::ValidationError(
            "No audio file provided".to_string(),
        ));
    }

    Ok(UploadedAudio {
        path: stored_path,
        original_filename: safe_name,
        size_bytes,
    })
}
