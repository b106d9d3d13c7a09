//! # Job Record
//!
//! The central entity of the engine: one accepted transcription request and
//! everything about its lifecycle. A job is created at submission, mutated
//! by the pipeline as stages complete, and removed from the registry after
//! a grace period once it reaches a terminal state.
//!
//! ## Invariants:
//! - `progress` is monotone non-decreasing while the job is processing.
//! - Once the cancelling latch is set it is never cleared, and no further
//!   progress or stage updates are applied.
//! - `result`/`error` are written exactly once, by the terminal transition.
//! - File cleanup runs exactly once per job, whichever path triggers it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Lifecycle status of a job.
///
/// There is no queued state: processing starts synchronously at acceptance.
/// Transitions are monotone — a job never leaves `Cancelling` back to
/// `Processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Pipeline is running.
    Processing,
    /// Cancellation requested; no further progress will be emitted.
    Cancelling,
    /// Terminal: transcript produced.
    Completed,
    /// Terminal: classified error attached.
    Failed,
}

impl JobStatus {
    /// Wire representation used by both the poll and push channels.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Processing => "processing",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Summary of how a file was processed, attached to the final result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingDetails {
    pub original_file_size: String,
    pub chunks_processed: usize,
    pub conversion_used: bool,
    pub splitting_used: bool,
}

/// Terminal payload of a successfully completed job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub transcription: String,
    pub filename: String,
    pub processing_details: ProcessingDetails,
    /// Set when the transcript could not be persisted to history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Point-in-time view of a job, shared by the poll response and every push
/// event so clients can switch channels without loss of information.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: String,
    pub progress: u8,
    pub stage: String,
    pub filename: String,
    pub cancelling: bool,
    pub result: Option<JobResult>,
}

/// One accepted transcription request and its full processing state.
///
/// ## Thread Safety:
/// Shared as `Arc<Job>` between the pipeline task, HTTP handlers, the push
/// actor, and the background sweeps. Mutable fields sit behind their own
/// locks so readers always observe a consistent record; writers mutate
/// first and publish to the hub second, never the other way around.
pub struct Job {
    /// Opaque unique identifier, key into the registry.
    pub id: String,

    /// Identity of the submitting principal; every access check compares
    /// against this.
    pub owner_id: String,

    /// Original filename as uploaded, for display.
    pub filename: String,

    /// Language hint forwarded to the transcription service.
    pub language: Option<String>,

    /// Creation timestamp, used by the orphan sweep.
    pub start_time: DateTime<Utc>,

    status: RwLock<JobStatus>,
    progress: RwLock<u8>,
    stage: RwLock<String>,

    /// Uploaded file as stored on disk. Owned by this job until cleanup.
    original_file: RwLock<Option<PathBuf>>,

    /// Converted copy, when preprocessing produced one.
    converted_file: RwLock<Option<PathBuf>>,

    /// Every transient artifact created while processing. Append-only
    /// until cleanup.
    temp_files: RwLock<Vec<PathBuf>>,

    /// Set once, never cleared.
    cancelling: AtomicBool,

    /// Cooperative handle passed to outbound calls so they can be
    /// interrupted mid-flight.
    cancel_token: CancellationToken,

    /// Latch ensuring cleanup runs exactly once.
    cleanup_done: AtomicBool,

    result: RwLock<Option<JobResult>>,
    error: RwLock<Option<(String, String)>>,
}

impl Job {
    pub fn new(id: String, owner_id: String, filename: String, language: Option<String>) -> Self {
        Self {
            id,
            owner_id,
            filename,
            language,
            start_time: Utc::now(),
            status: RwLock::new(JobStatus::Processing),
            progress: RwLock::new(0),
            stage: RwLock::new("Preparing upload...".to_string()),
            original_file: RwLock::new(None),
            converted_file: RwLock::new(None),
            temp_files: RwLock::new(Vec::new()),
            cancelling: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
            cleanup_done: AtomicBool::new(false),
            result: RwLock::new(None),
            error: RwLock::new(None),
        }
    }

    pub fn status(&self) -> JobStatus {
        *self.status.read().unwrap()
    }

    pub fn progress(&self) -> u8 {
        *self.progress.read().unwrap()
    }

    pub fn stage(&self) -> String {
        self.stage.read().unwrap().clone()
    }

    pub fn is_cancelling(&self) -> bool {
        self.cancelling.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Advance progress and stage.
    ///
    /// Progress is clamped to be non-decreasing, and nothing is applied
    /// once the cancelling latch is set or the job is terminal. Returns
    /// whether the update took effect, so callers know to publish it.
    pub fn advance(&self, progress: u8, stage: &str) -> bool {
        if self.is_cancelling() || self.status().is_terminal() {
            return false;
        }

        {
            let mut current = self.progress.write().unwrap();
            *current = (*current).max(progress.min(100));
        }
        *self.stage.write().unwrap() = stage.to_string();
        true
    }

    /// Flip the cancelling latch.
    ///
    /// Sets `status=Cancelling`, triggers the cancellation token so any
    /// in-flight outbound call aborts, and returns `true` only for the
    /// first caller. Terminal jobs cannot be cancelled.
    pub fn begin_cancel(&self) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        if self.cancelling.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.status.write().unwrap() = JobStatus::Cancelling;
        *self.stage.write().unwrap() = "Cancelling transcription...".to_string();
        self.cancel_token.cancel();
        true
    }

    /// Record the stored upload. The original also enters `temp_files` so
    /// a single cleanup pass covers it.
    pub fn register_original(&self, path: PathBuf) {
        *self.original_file.write().unwrap() = Some(path.clone());
        self.temp_files.write().unwrap().push(path);
    }

    /// Record a successful conversion; the converted copy becomes part of
    /// the cleanup set.
    pub fn register_converted(&self, path: PathBuf) {
        *self.converted_file.write().unwrap() = Some(path.clone());
        self.temp_files.write().unwrap().push(path);
    }

    /// Track a transient artifact (chunk file) for cleanup.
    pub fn register_temp(&self, path: PathBuf) {
        self.temp_files.write().unwrap().push(path);
    }

    /// Every path this job is responsible for deleting, in registration
    /// order with duplicates removed.
    pub fn files_to_clean(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = Vec::new();
        if let Some(path) = self.original_file.read().unwrap().clone() {
            files.push(path);
        }
        if let Some(path) = self.converted_file.read().unwrap().clone() {
            files.push(path);
        }
        for path in self.temp_files.read().unwrap().iter() {
            files.push(path.clone());
        }
        let mut seen = std::collections::HashSet::new();
        files.retain(|p| seen.insert(p.clone()));
        files
    }

    /// Claim the one-shot cleanup latch. Only the first caller gets `true`.
    pub fn claim_cleanup(&self) -> bool {
        !self.cleanup_done.swap(true, Ordering::SeqCst)
    }

    /// Terminal success transition. Progress reaches exactly 100 here and
    /// nowhere else. Refused after cancellation.
    pub fn complete(&self, result: JobResult) -> bool {
        if self.is_cancelling() || self.status().is_terminal() {
            return false;
        }
        *self.status.write().unwrap() = JobStatus::Completed;
        *self.progress.write().unwrap() = 100;
        *self.stage.write().unwrap() = "Transcription completed successfully!".to_string();
        *self.result.write().unwrap() = Some(result);
        true
    }

    /// Terminal failure transition with the classified message pair.
    pub fn fail(&self, message: &str, details: &str) -> bool {
        if self.is_cancelling() || self.status().is_terminal() {
            return false;
        }
        *self.status.write().unwrap() = JobStatus::Failed;
        *self.error.write().unwrap() = Some((message.to_string(), details.to_string()));
        true
    }

    pub fn error(&self) -> Option<(String, String)> {
        self.error.read().unwrap().clone()
    }

    /// Consistent point-in-time view for the poll and push channels.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id.clone(),
            status: self.status().as_str().to_string(),
            progress: self.progress(),
            stage: self.stage(),
            filename: self.filename.clone(),
            cancelling: self.is_cancelling(),
            result: self.result.read().unwrap().clone(),
        }
    }
}
