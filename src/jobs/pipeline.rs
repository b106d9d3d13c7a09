//! # Job Pipeline
//!
//! The per-job driver task: preprocessing, chunk planning and splitting,
//! transcription, transcript persistence, then the terminal transition. One
//! task owns one job for its whole life; every stage reports progress
//! through the status hub and yields to the cancellation latch at its
//! boundary.
//!
//! ## Progress Bands:
//! 10 preparing, 20/30 conversion, 35 splitting, 40–90 transcription,
//! 90 persistence, 100 completed (set only by the terminal transition).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::audio::{chunker, convert, probe};
use crate::events::{publish_progress, StatusEvent, StatusHub};
use crate::jobs::cancel::cleanup_job_files;
use crate::jobs::job::{Job, JobResult, ProcessingDetails};
use crate::jobs::registry::JobRegistry;
use crate::storage::{TranscriptRecord, TranscriptStore};
use crate::transcription::client::SpeechToText;
use crate::transcription::orchestrator::{TranscribeOutcome, TranscriptionOrchestrator};

const MEGABYTE: f64 = 1024.0 * 1024.0;

/// Engine tuning knobs, extracted from the application config once at
/// startup so the pipeline never touches the config lock.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// The external service's per-call hard limit.
    pub single_call_limit_mb: f64,

    /// Target upper bound for a materialized chunk.
    pub max_chunk_size_mb: f64,

    /// Attempts per chunk before a placeholder is substituted.
    pub max_attempts: u32,

    /// How long terminal jobs stay queryable before removal.
    pub terminal_grace_secs: u64,

    /// Retry backoff after a transport-shaped failure.
    pub transport_backoff: Duration,

    /// Retry backoff after any other failure.
    pub retry_backoff: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            single_call_limit_mb: 25.0,
            max_chunk_size_mb: 20.0,
            max_attempts: 3,
            terminal_grace_secs: 30,
            transport_backoff: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(2),
        }
    }
}

/// Everything a pipeline task needs, cloned into the spawned task.
#[derive(Clone)]
pub struct PipelineDeps {
    pub registry: Arc<JobRegistry>,
    pub hub: Arc<StatusHub>,
    pub stt: Arc<dyn SpeechToText>,
    pub store: Arc<dyn TranscriptStore>,
    pub settings: EngineSettings,
}

/// The stored upload handed over by the submission handler.
#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// How a pipeline run ended. Cancellation is its own exit path: the
/// coordinator has already cleaned up and emitted the terminal event, so
/// the pipeline stays silent.
enum PipelineOutcome {
    Completed(JobResult),
    Cancelled,
    Failed { error: String, details: String },
}

/// Run one job to its terminal state.
///
/// Spawned by the submission handler right after the accept response;
/// everything here is asynchronous from the client's point of view.
pub async fn run_job(deps: PipelineDeps, job: Arc<Job>, upload: StoredUpload) {
    let outcome = process(&deps, &job, &upload).await;

    match outcome {
        PipelineOutcome::Completed(result) => {
            cleanup_job_files(&job).await;

            // `complete` loses to a concurrent cancellation; in that case
            // the coordinator owns the terminal event.
            if job.complete(result) {
                info!("Job {} completed", job.id);
                deps.hub.publish(
                    &job.owner_id,
                    StatusEvent::Completed {
                        snapshot: job.snapshot(),
                    },
                );
                schedule_removal(&deps, &job);
            }
        }
        PipelineOutcome::Cancelled => {
            info!("Job {} cancelled, pipeline exiting", job.id);
        }
        PipelineOutcome::Failed { error, details } => {
            cleanup_job_files(&job).await;

            if job.fail(&error, &details) {
                error!("Job {} failed: {} ({})", job.id, error, details);
                deps.hub.publish(
                    &job.owner_id,
                    StatusEvent::Failed {
                        snapshot: job.snapshot(),
                        error,
                        details,
                    },
                );
                schedule_removal(&deps, &job);
            }
        }
    }
}

/// Keep terminal jobs queryable for the grace window, then drop them.
fn schedule_removal(deps: &PipelineDeps, job: &Arc<Job>) {
    let registry = deps.registry.clone();
    let job_id = job.id.clone();
    let grace = Duration::from_secs(deps.settings.terminal_grace_secs);

    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        registry.remove(&job_id);
    });
}

async fn process(deps: &PipelineDeps, job: &Arc<Job>, upload: &StoredUpload) -> PipelineOutcome {
    let hub = &deps.hub;
    let settings = &deps.settings;
    let file_size_mb = upload.size_bytes as f64 / MEGABYTE;

    publish_progress(hub, job, 10, &format!("Processing {:.1}MB file...", file_size_mb));

    // Preprocessing: convert formats known to cause downstream trouble.
    // Failure here is never fatal — fall back to the original file.
    let mut active_path = upload.path.clone();
    let mut conversion_used = false;

    let extension = std::path::Path::new(&job.filename)
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();

    if convert::needs_conversion(&extension) {
        publish_progress(hub, job, 20, "Converting audio format for better compatibility...");

        let output = convert::converted_path(&active_path);
        if convert::convert_to_wav(&active_path, &output).await {
            job.register_converted(output.clone());
            active_path = output;
            conversion_used = true;
            publish_progress(hub, job, 30, "Audio conversion completed");
        } else {
            publish_progress(hub, job, 30, "Conversion failed, using original file");
        }
    }

    if job.is_cancelling() {
        return PipelineOutcome::Cancelled;
    }

    // Chunk planning and splitting for files over the single-call limit.
    let mut chunk_paths = vec![active_path.clone()];
    let mut splitting_used = false;

    if file_size_mb > settings.single_call_limit_mb {
        publish_progress(hub, job, 35, "File is large, splitting into smaller chunks...");

        let duration = match probe::audio_duration_seconds(&active_path).await {
            Ok(duration) => duration,
            Err(err) => {
                // Planning precondition: never guess chunk boundaries.
                return PipelineOutcome::Failed {
                    error: "File too large for processing".to_string(),
                    details: format!(
                        "File size is {:.1}MB, above the {:.0}MB per-call limit, and \
                         splitting was not possible: {}",
                        file_size_mb, settings.single_call_limit_mb, err
                    ),
                };
            }
        };

        let active_size = match tokio::fs::metadata(&active_path).await {
            Ok(meta) => meta.len(),
            Err(err) => {
                return PipelineOutcome::Failed {
                    error: "File too large for processing".to_string(),
                    details: format!("Could not inspect stored file: {}", err),
                };
            }
        };

        let spans = match chunker::plan(
            duration,
            active_size,
            settings.max_chunk_size_mb,
            settings.single_call_limit_mb,
        ) {
            Ok(spans) => spans,
            Err(err) => {
                return PipelineOutcome::Failed {
                    error: "File too large for processing".to_string(),
                    details: format!("Audio splitting failed: {}", err),
                };
            }
        };

        if spans.len() > 1 {
            info!(
                "Splitting {:.1}MB file into {} chunks for job {}",
                file_size_mb,
                spans.len(),
                job.id
            );

            let mut paths = Vec::with_capacity(spans.len());
            for (index, span) in spans.iter().enumerate() {
                if job.is_cancelling() {
                    return PipelineOutcome::Cancelled;
                }

                let chunk = convert::chunk_path(&active_path, index);
                match convert::extract_chunk(&active_path, &chunk, span).await {
                    Ok(()) => {
                        job.register_temp(chunk.clone());
                        paths.push(chunk);
                    }
                    Err(err) => {
                        warn!("Audio splitting failed for job {}: {}", job.id, err);
                        return PipelineOutcome::Failed {
                            error: "File too large for processing".to_string(),
                            details: format!("Audio splitting failed: {}", err),
                        };
                    }
                }
            }
            chunk_paths = paths;
            splitting_used = true;
        }
    }

    if job.is_cancelling() {
        return PipelineOutcome::Cancelled;
    }

    // Transcription: sequential per chunk with retry and placeholders.
    let orchestrator = TranscriptionOrchestrator::new(
        deps.stt.clone(),
        settings.max_attempts,
        settings.single_call_limit_mb,
    )
    .with_backoffs(settings.transport_backoff, settings.retry_backoff);

    let transcription = match orchestrator.transcribe_job(job, hub, &chunk_paths).await {
        TranscribeOutcome::Done(text) => text,
        TranscribeOutcome::Cancelled => return PipelineOutcome::Cancelled,
        TranscribeOutcome::Failed(err) => {
            let (error, details) = err.classify();
            return PipelineOutcome::Failed {
                error: error.to_string(),
                details,
            };
        }
    };

    if job.is_cancelling() {
        return PipelineOutcome::Cancelled;
    }

    // Persist to history; failure degrades to a warning on the result.
    publish_progress(hub, job, 90, "Transcription completed, saving to history...");

    let processing_details = ProcessingDetails {
        original_file_size: format!("{:.1}MB", file_size_mb),
        chunks_processed: chunk_paths.len(),
        conversion_used,
        splitting_used,
    };

    let record = TranscriptRecord {
        id: String::new(),
        filename: job.filename.clone(),
        file_size_bytes: upload.size_bytes,
        language: job.language.clone(),
        transcription: transcription.clone(),
        processing_details: processing_details.clone(),
        created_at: chrono::Utc::now(),
    };

    let warning = match deps.store.save(&job.owner_id, record).await {
        Ok(_) => None,
        Err(err) => {
            warn!("Failed to persist transcript for job {}: {}", job.id, err);
            Some("Transcription completed but not saved to history".to_string())
        }
    };

    PipelineOutcome::Completed(JobResult {
        transcription,
        filename: job.filename.clone(),
        processing_details,
        warning,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::cancel::cancel_job;
    use crate::jobs::job::JobStatus;
    use crate::storage::InMemoryTranscriptStore;
    use crate::transcription::client::SttError;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedStt {
        response: Result<String, SttError>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FixedStt {
        fn ok(text: &str) -> Self {
            Self {
                response: Ok(text.to_string()),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(err: SttError) -> Self {
            Self {
                response: Err(err),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl SpeechToText for FixedStt {
        async fn transcribe(
            &self,
            _chunk: &Path,
            _language: Option<&str>,
        ) -> Result<String, SttError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.response.clone()
        }
    }

    fn deps(stt: Arc<dyn SpeechToText>) -> (PipelineDeps, Arc<InMemoryTranscriptStore>) {
        let store = Arc::new(InMemoryTranscriptStore::new());
        let deps = PipelineDeps {
            registry: Arc::new(JobRegistry::new()),
            hub: Arc::new(StatusHub::new()),
            stt,
            store: store.clone(),
            settings: EngineSettings {
                transport_backoff: Duration::ZERO,
                retry_backoff: Duration::ZERO,
                ..EngineSettings::default()
            },
        };
        (deps, store)
    }

    fn stored_upload(dir: &tempfile::TempDir) -> StoredUpload {
        let path = dir.path().join("12345-meeting.mp3");
        std::fs::write(&path, b"pretend this is audio").unwrap();
        StoredUpload {
            size_bytes: std::fs::metadata(&path).unwrap().len(),
            path,
        }
    }

    #[tokio::test]
    async fn test_small_file_completes_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let (deps, store) = deps(Arc::new(FixedStt::ok("hello from the meeting")));
        let upload = stored_upload(&dir);

        let job = deps.registry.create("user-1", "meeting.mp3", Some("en".to_string()));
        job.register_original(upload.path.clone());
        let mut rx = deps.hub.subscribe("user-1");

        run_job(deps.clone(), job.clone(), upload.clone()).await;

        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.progress(), 100);
        let snapshot = job.snapshot();
        let result = snapshot.result.expect("result attached");
        assert_eq!(result.transcription, "hello from the meeting");
        assert!(!result.processing_details.splitting_used);
        assert!(result.warning.is_none());

        // Upload removed, transcript persisted.
        assert!(!upload.path.exists());
        assert_eq!(store.records_for("user-1").len(), 1);

        // Exactly one terminal event, after all status updates, at 100.
        let mut terminal = 0;
        let mut last_progress = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                StatusEvent::StatusUpdate { snapshot } => {
                    assert_eq!(terminal, 0, "update after terminal event");
                    assert!(snapshot.progress >= last_progress);
                    last_progress = snapshot.progress;
                }
                StatusEvent::Completed { snapshot } => {
                    terminal += 1;
                    assert_eq!(snapshot.progress, 100);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(terminal, 1);
    }

    #[tokio::test]
    async fn test_fatal_service_error_fails_job_with_classified_message() {
        let dir = tempfile::tempdir().unwrap();
        let (deps, store) = deps(Arc::new(FixedStt::failing(SttError::Auth(
            "invalid api key".to_string(),
        ))));
        let upload = stored_upload(&dir);

        let job = deps.registry.create("user-1", "meeting.mp3", None);
        job.register_original(upload.path.clone());
        let mut rx = deps.hub.subscribe("user-1");

        run_job(deps.clone(), job.clone(), upload.clone()).await;

        assert_eq!(job.status(), JobStatus::Failed);
        let (message, details) = job.error().expect("error attached");
        assert_eq!(message, "Invalid transcription service credentials");
        assert!(details.contains("invalid api key"));

        // Files are cleaned on failure too.
        assert!(!upload.path.exists());
        assert!(store.records_for("user-1").is_empty());

        let mut saw_failed = false;
        while let Ok(event) = rx.try_recv() {
            if let StatusEvent::Failed { error, .. } = event {
                assert_eq!(error, "Invalid transcription service credentials");
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn test_cancel_during_inflight_call_suppresses_other_terminals() {
        let dir = tempfile::tempdir().unwrap();
        let stt = Arc::new(FixedStt::ok("never delivered").slow(Duration::from_secs(30)));
        let (deps, _store) = deps(stt);
        let upload = stored_upload(&dir);

        let job = deps.registry.create("user-1", "meeting.mp3", None);
        job.register_original(upload.path.clone());
        let mut rx = deps.hub.subscribe("user-1");

        let runner = tokio::spawn(run_job(deps.clone(), job.clone(), upload.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(cancel_job(&deps.registry, &deps.hub, &job.id, "user-1").await);
        runner.await.unwrap();

        // Job removed immediately, files gone.
        assert!(deps.registry.get(&job.id).is_none());
        assert!(!upload.path.exists());

        // A single cancelled terminal; never completed/failed.
        let mut cancelled = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                StatusEvent::Cancelled { .. } => cancelled += 1,
                StatusEvent::Completed { .. } | StatusEvent::Failed { .. } => {
                    panic!("unexpected terminal after cancellation")
                }
                StatusEvent::StatusUpdate { .. } => {}
            }
        }
        assert_eq!(cancelled, 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_degrades_to_warning() {
        struct FailingStore;

        #[async_trait]
        impl TranscriptStore for FailingStore {
            async fn save(
                &self,
                _owner_id: &str,
                _record: TranscriptRecord,
            ) -> anyhow::Result<String> {
                Err(anyhow::anyhow!("history database offline"))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let (mut deps, _store) = deps(Arc::new(FixedStt::ok("transcript text")));
        deps.store = Arc::new(FailingStore);
        let upload = stored_upload(&dir);

        let job = deps.registry.create("user-1", "meeting.mp3", None);
        job.register_original(upload.path.clone());

        run_job(deps.clone(), job.clone(), upload).await;

        // The job still completes; the miss is only a warning.
        assert_eq!(job.status(), JobStatus::Completed);
        let result = job.snapshot().result.unwrap();
        assert_eq!(
            result.warning.as_deref(),
            Some("Transcription completed but not saved to history")
        );
    }
}
