//! # Transcription Orchestrator
//!
//! Drives the external speech-to-text calls for a job's chunks: strictly
//! sequential, one call in flight per job, with retry/backoff per chunk and
//! placeholder substitution on unrecoverable chunks. The orchestrator is
//! the densest cancellation surface in the engine — the latch is honored at
//! every chunk boundary, and the active call races the job's cancellation
//! token so an interrupt aborts it mid-flight.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::events::{publish_progress, StatusHub};
use crate::jobs::job::Job;
use crate::transcription::client::{SpeechToText, SttError};

const MEGABYTE: f64 = 1024.0 * 1024.0;

/// Transcription progress is reported inside the 40–90 band; everything
/// before is preprocessing, everything after is persistence.
const PROGRESS_BAND_START: u8 = 40;
const PROGRESS_BAND_SPAN: f64 = 50.0;

/// Outcome of transcribing all chunks of one job.
///
/// Cancellation is a first-class exit path, distinct from success and from
/// failure. `Failed` is reserved for unrecoverable upstream errors (bad
/// credentials, exhausted quota) — ordinary per-chunk failures are absorbed
/// into the transcript as placeholders instead.
#[derive(Debug)]
pub enum TranscribeOutcome {
    Done(String),
    Cancelled,
    Failed(SttError),
}

/// Outcome of one chunk's attempt loop.
enum ChunkOutcome {
    Text(String),
    GaveUp(SttError),
    Cancelled,
}

pub struct TranscriptionOrchestrator {
    stt: Arc<dyn SpeechToText>,

    /// Attempts per chunk before a placeholder is substituted.
    max_attempts: u32,

    /// The external service's per-call hard limit; chunks still above it
    /// after splitting are skipped, not failed.
    single_call_limit_mb: f64,

    /// Wait before retrying a transport-shaped failure.
    transport_backoff: Duration,

    /// Wait before retrying any other failure.
    retry_backoff: Duration,
}

impl TranscriptionOrchestrator {
    pub fn new(stt: Arc<dyn SpeechToText>, max_attempts: u32, single_call_limit_mb: f64) -> Self {
        Self {
            stt,
            max_attempts,
            single_call_limit_mb,
            transport_backoff: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(2),
        }
    }

    /// Override the retry delays (tests run with zero backoff).
    pub fn with_backoffs(mut self, transport: Duration, retry: Duration) -> Self {
        self.transport_backoff = transport;
        self.retry_backoff = retry;
        self
    }

    /// Transcribe every chunk in order and aggregate the results.
    ///
    /// Per-chunk outputs — successes and placeholders alike — are joined
    /// with a single space in original chunk order.
    pub async fn transcribe_job(
        &self,
        job: &Job,
        hub: &StatusHub,
        chunks: &[PathBuf],
    ) -> TranscribeOutcome {
        let total = chunks.len();
        let mut parts: Vec<String> = Vec::with_capacity(total);

        for (index, chunk_path) in chunks.iter().enumerate() {
            // Cooperative cancellation point at every chunk boundary.
            if job.is_cancelling() {
                info!("Job {} cancelled, stopping chunk processing", job.id);
                return TranscribeOutcome::Cancelled;
            }

            let progress = PROGRESS_BAND_START
                + ((index as f64 / total as f64) * PROGRESS_BAND_SPAN) as u8;
            publish_progress(
                hub,
                job,
                progress,
                &format!("Transcribing chunk {}/{}...", index + 1, total),
            );

            let chunk_size_mb = match tokio::fs::metadata(chunk_path).await {
                Ok(meta) => meta.len() as f64 / MEGABYTE,
                Err(err) => {
                    warn!(
                        "Cannot stat chunk {} of job {}: {}",
                        index + 1,
                        job.id,
                        err
                    );
                    parts.push(format!(
                        "[Chunk {} transcription failed: {}]",
                        index + 1,
                        err
                    ));
                    self.publish_chunk_done(hub, job, index, total);
                    continue;
                }
            };

            // A chunk that is still over the hard limit after splitting is
            // skipped; one oversized chunk must not abort the whole job.
            if chunk_size_mb > self.single_call_limit_mb {
                warn!(
                    "Chunk {}/{} of job {} is too large ({:.1}MB), skipping",
                    index + 1,
                    total,
                    job.id,
                    chunk_size_mb
                );
                parts.push(format!("[Chunk {} too large to process]", index + 1));
                self.publish_chunk_done(hub, job, index, total);
                continue;
            }

            match self.transcribe_chunk(job, chunk_path, index).await {
                ChunkOutcome::Text(text) => {
                    info!(
                        "Chunk {}/{} of job {} transcribed ({:.1}MB)",
                        index + 1,
                        total,
                        job.id,
                        chunk_size_mb
                    );
                    parts.push(text);
                }
                ChunkOutcome::GaveUp(err) if err.is_fatal() => {
                    // Bad credentials or exhausted quota will fail every
                    // remaining chunk identically; escalate to the job.
                    return TranscribeOutcome::Failed(err);
                }
                ChunkOutcome::GaveUp(err) => {
                    warn!(
                        "Chunk {}/{} of job {} failed after {} attempts: {}",
                        index + 1,
                        total,
                        job.id,
                        self.max_attempts,
                        err
                    );
                    parts.push(format!(
                        "[Chunk {} transcription failed: {}]",
                        index + 1,
                        err
                    ));
                }
                ChunkOutcome::Cancelled => return TranscribeOutcome::Cancelled,
            }

            self.publish_chunk_done(hub, job, index, total);
        }

        if job.is_cancelling() {
            return TranscribeOutcome::Cancelled;
        }

        TranscribeOutcome::Done(parts.join(" "))
    }

    /// Progress after a chunk completes (success, skip, or give-up).
    fn publish_chunk_done(&self, hub: &StatusHub, job: &Job, index: usize, total: usize) {
        let progress = PROGRESS_BAND_START
            + (((index + 1) as f64 / total as f64) * PROGRESS_BAND_SPAN) as u8;
        publish_progress(
            hub,
            job,
            progress,
            &format!("Transcribed chunk {}/{}", index + 1, total),
        );
    }

    /// Attempt loop for a single chunk.
    ///
    /// Each attempt races the job's cancellation token; an interruption is
    /// treated as job cancellation, never as a chunk failure. A call that
    /// completes just as cancellation lands has its result discarded — the
    /// latch is rechecked after every attempt.
    async fn transcribe_chunk(&self, job: &Job, path: &PathBuf, index: usize) -> ChunkOutcome {
        let mut attempts = 0;

        loop {
            attempts += 1;

            // Language hint goes out on the first attempt only; retries let
            // the service auto-detect.
            let language = if attempts == 1 {
                job.language.as_deref()
            } else {
                None
            };

            let result = tokio::select! {
                _ = job.cancel_token().cancelled() => return ChunkOutcome::Cancelled,
                result = self.stt.transcribe(path, language) => result,
            };

            if job.is_cancelling() {
                return ChunkOutcome::Cancelled;
            }

            match result {
                Ok(text) => return ChunkOutcome::Text(text),
                Err(err) => {
                    warn!(
                        "Chunk {} of job {} attempt {}/{} failed: {}",
                        index + 1,
                        job.id,
                        attempts,
                        self.max_attempts,
                        err
                    );

                    if attempts >= self.max_attempts {
                        return ChunkOutcome::GaveUp(err);
                    }

                    // Connection-shaped failures get the longer backoff.
                    let backoff = if err.is_transport() {
                        self.transport_backoff
                    } else {
                        self.retry_backoff
                    };

                    tokio::select! {
                        _ = job.cancel_token().cancelled() => return ChunkOutcome::Cancelled,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted speech-to-text double: pops one canned response per call
    /// and records how it was called.
    struct ScriptedStt {
        script: Mutex<Vec<Result<String, SttError>>>,
        calls: AtomicUsize,
        languages: Mutex<Vec<Option<String>>>,
        /// Per-call delay, to let tests cancel mid-flight.
        delay: Duration,
    }

    impl ScriptedStt {
        fn new(script: Vec<Result<String, SttError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                languages: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SpeechToText for ScriptedStt {
        async fn transcribe(
            &self,
            _chunk: &Path,
            language: Option<&str>,
        ) -> Result<String, SttError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.languages
                .lock()
                .unwrap()
                .push(language.map(|s| s.to_string()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Ok("extra".to_string());
            }
            script.remove(0)
        }
    }

    fn test_job() -> Job {
        Job::new(
            "job-1".to_string(),
            "user-1".to_string(),
            "meeting.mp3".to_string(),
            Some("en".to_string()),
        )
    }

    fn orchestrator(stt: Arc<dyn SpeechToText>) -> TranscriptionOrchestrator {
        TranscriptionOrchestrator::new(stt, 3, 25.0)
            .with_backoffs(Duration::ZERO, Duration::ZERO)
    }

    fn make_chunks(dir: &tempfile::TempDir, count: usize) -> Vec<PathBuf> {
        (0..count)
            .map(|i| {
                let path = dir.path().join(format!("chunk_{}.mp3", i));
                std::fs::write(&path, b"tiny audio chunk").unwrap();
                path
            })
            .collect()
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let stt = Arc::new(ScriptedStt::new(vec![
            Err(SttError::Transport("reset".into())),
            Err(SttError::Service("flaky".into())),
            Ok("hello world".to_string()),
        ]));
        let job = test_job();
        let hub = StatusHub::new();
        let chunks = make_chunks(&dir, 1);

        let outcome = orchestrator(stt.clone())
            .transcribe_job(&job, &hub, &chunks)
            .await;

        match outcome {
            TranscribeOutcome::Done(text) => {
                assert_eq!(text, "hello world");
                assert!(!text.contains("transcription failed"));
            }
            other => panic!("expected done, got {:?}", other),
        }
        assert_eq!(stt.call_count(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_become_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let stt = Arc::new(ScriptedStt::new(vec![
            Err(SttError::Service("bad day".into())),
            Err(SttError::Service("bad day".into())),
            Err(SttError::Service("bad day".into())),
            Ok("second chunk".to_string()),
        ]));
        let job = test_job();
        let hub = StatusHub::new();
        let chunks = make_chunks(&dir, 2);

        let outcome = orchestrator(stt.clone())
            .transcribe_job(&job, &hub, &chunks)
            .await;

        match outcome {
            TranscribeOutcome::Done(text) => {
                // One unrecoverable chunk does not abort the job.
                assert!(text.starts_with("[Chunk 1 transcription failed:"));
                assert!(text.ends_with("second chunk"));
            }
            other => panic!("expected done, got {:?}", other),
        }
        assert_eq!(stt.call_count(), 4);
    }

    #[tokio::test]
    async fn test_oversized_chunk_is_skipped_not_failed() {
        let dir = tempfile::tempdir().unwrap();
        let stt = Arc::new(ScriptedStt::new(vec![Ok("fine".to_string())]));
        let job = test_job();
        let hub = StatusHub::new();
        let chunks = make_chunks(&dir, 2);

        // A limit below any real file size marks chunk 1 oversized; raise
        // it back for chunk 2 is impossible per-call, so use a limit that
        // only the first (larger) chunk exceeds.
        std::fs::write(&chunks[0], vec![0u8; 4096]).unwrap();
        let orchestrator = TranscriptionOrchestrator::new(stt.clone(), 3, 1024.0 / MEGABYTE)
            .with_backoffs(Duration::ZERO, Duration::ZERO);

        let outcome = orchestrator.transcribe_job(&job, &hub, &chunks).await;

        match outcome {
            TranscribeOutcome::Done(text) => {
                assert_eq!(text, "[Chunk 1 too large to process] fine");
            }
            other => panic!("expected done, got {:?}", other),
        }
        // The oversized chunk never reached the service.
        assert_eq!(stt.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_next_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let stt = Arc::new(ScriptedStt::new(vec![Ok("first".to_string())]));
        let job = test_job();
        let hub = StatusHub::new();
        let chunks = make_chunks(&dir, 5);

        // Latch set before processing begins: nothing is attempted.
        job.begin_cancel();
        let outcome = orchestrator(stt.clone())
            .transcribe_job(&job, &hub, &chunks)
            .await;

        assert!(matches!(outcome, TranscribeOutcome::Cancelled));
        assert_eq!(stt.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_in_flight_call() {
        let dir = tempfile::tempdir().unwrap();
        let stt = Arc::new(
            ScriptedStt::new(vec![Ok("never delivered".to_string())])
                .slow(Duration::from_secs(30)),
        );
        let job = Arc::new(test_job());
        let hub = StatusHub::new();
        let chunks = make_chunks(&dir, 5);

        let canceller = {
            let job = job.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                job.begin_cancel();
            })
        };

        let outcome = orchestrator(stt.clone())
            .transcribe_job(&job, &hub, &chunks)
            .await;
        canceller.await.unwrap();

        // The in-flight call was aborted and chunks 2-5 never attempted.
        assert!(matches!(outcome, TranscribeOutcome::Cancelled));
        assert_eq!(stt.call_count(), 1);
    }

    #[tokio::test]
    async fn test_fatal_errors_escalate_to_job_failure() {
        let dir = tempfile::tempdir().unwrap();
        let stt = Arc::new(ScriptedStt::new(vec![
            Err(SttError::Auth("invalid key".into())),
            Err(SttError::Auth("invalid key".into())),
            Err(SttError::Auth("invalid key".into())),
        ]));
        let job = test_job();
        let hub = StatusHub::new();
        let chunks = make_chunks(&dir, 3);

        let outcome = orchestrator(stt.clone())
            .transcribe_job(&job, &hub, &chunks)
            .await;

        assert!(matches!(outcome, TranscribeOutcome::Failed(SttError::Auth(_))));
        // Remaining chunks were not attempted after the escalation.
        assert_eq!(stt.call_count(), 3);
    }

    #[tokio::test]
    async fn test_language_hint_only_on_first_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let stt = Arc::new(ScriptedStt::new(vec![
            Err(SttError::Service("retry me".into())),
            Ok("text".to_string()),
        ]));
        let job = test_job();
        let hub = StatusHub::new();
        let chunks = make_chunks(&dir, 1);

        orchestrator(stt.clone())
            .transcribe_job(&job, &hub, &chunks)
            .await;

        let languages = stt.languages.lock().unwrap().clone();
        assert_eq!(languages, vec![Some("en".to_string()), None]);
    }

    #[tokio::test]
    async fn test_progress_stays_in_band_and_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let stt = Arc::new(ScriptedStt::new(vec![
            Ok("a".to_string()),
            Ok("b".to_string()),
            Ok("c".to_string()),
        ]));
        let job = test_job();
        let hub = StatusHub::new();
        let mut rx = hub.subscribe("user-1");
        let chunks = make_chunks(&dir, 3);

        let outcome = orchestrator(stt.clone())
            .transcribe_job(&job, &hub, &chunks)
            .await;
        match outcome {
            TranscribeOutcome::Done(text) => assert_eq!(text, "a b c"),
            other => panic!("expected done, got {:?}", other),
        }

        let mut last = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                crate::events::StatusEvent::StatusUpdate { snapshot } => {
                    assert!(snapshot.progress >= last);
                    assert!(snapshot.progress >= 40 && snapshot.progress <= 90);
                    last = snapshot.progress;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(last, 90);
    }
}
