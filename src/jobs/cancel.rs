//! # Cancellation & Cleanup Coordinator
//!
//! Propagates a cancellation request into in-flight work, guarantees that
//! every file a job ever created is removed exactly once, and de-registers
//! the job. Cleanup is shared by all four exit paths — explicit
//! cancellation, normal completion, failure, and the orphan sweep — and is
//! latched on the job record so it can never run twice or be skipped.

use tracing::{debug, error, info, warn};

use crate::events::{StatusEvent, StatusHub};
use crate::jobs::job::Job;
use crate::jobs::registry::JobRegistry;

/// Remove every file the job owns. Best-effort: individual failures are
/// logged and swallowed, never propagated. Safe to call repeatedly; only
/// the first invocation per job does any work.
pub async fn cleanup_job_files(job: &Job) {
    if !job.claim_cleanup() {
        return;
    }

    let files = job.files_to_clean();
    debug!("Cleaning up {} files for job {}", files.len(), job.id);

    for path in files {
        if let Err(err) = tokio::fs::remove_file(&path).await {
            // Already-gone files are expected when the retention sweep
            // races an in-progress job.
            if err.kind() != std::io::ErrorKind::NotFound {
                error!("Failed to remove file {}: {}", path.display(), err);
            }
        }
    }
}

/// Cancel a job on behalf of `requester_id`.
///
/// Fails closed: an unknown job id or an ownership mismatch returns `false`
/// with no effect — cancellation never crosses ownership boundaries. A job
/// that is already cancelling or terminal also returns `false`; the first
/// successful call is the only one that acts.
///
/// On success the caller-visible sequence is: cancelling status update,
/// file cleanup, registry removal, then the distinct `cancelled` terminal
/// event.
pub async fn cancel_job(
    registry: &JobRegistry,
    hub: &StatusHub,
    job_id: &str,
    requester_id: &str,
) -> bool {
    let Some(job) = registry.get(job_id) else {
        info!("Cancellation for unknown job {}", job_id);
        return false;
    };

    if job.owner_id != requester_id {
        warn!(
            "Rejected cancellation of job {} by non-owner {}",
            job_id, requester_id
        );
        return false;
    }

    // First caller wins the latch; this also fires the cancellation token,
    // aborting any in-flight outbound call.
    if !job.begin_cancel() {
        return false;
    }

    info!("Cancelling job {} for user {}", job_id, requester_id);

    // Immediate notification carrying the cancelling state.
    hub.publish(
        &job.owner_id,
        StatusEvent::StatusUpdate {
            snapshot: job.snapshot(),
        },
    );

    cleanup_job_files(&job).await;
    registry.remove(job_id);

    hub.publish(
        &job.owner_id,
        StatusEvent::Cancelled {
            snapshot: job.snapshot(),
            message: "Transcription cancelled successfully".to_string(),
        },
    );

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::JobStatus;
    use std::io::Write;

    fn touch(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"audio").unwrap();
        path
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_fails_closed() {
        let registry = JobRegistry::new();
        let hub = StatusHub::new();
        assert!(!cancel_job(&registry, &hub, "missing", "user-1").await);
    }

    #[tokio::test]
    async fn test_cancel_by_non_owner_has_no_effect() {
        let registry = JobRegistry::new();
        let hub = StatusHub::new();
        let job = registry.create("user-1", "meeting.mp3", None);
        job.advance(40, "Transcribing chunk 1/3...");

        assert!(!cancel_job(&registry, &hub, &job.id, "user-2").await);

        // State untouched, job still registered.
        let fetched = registry.get(&job.id).unwrap();
        assert_eq!(fetched.status(), JobStatus::Processing);
        assert_eq!(fetched.progress(), 40);
        assert!(!fetched.is_cancelling());
    }

    #[tokio::test]
    async fn test_successful_cancel_cleans_and_deregisters() {
        let registry = JobRegistry::new();
        let hub = StatusHub::new();
        let dir = tempfile::tempdir().unwrap();

        let job = registry.create("user-1", "meeting.mp3", None);
        let original = touch(&dir, "upload.mp3");
        let chunk = touch(&dir, "upload_chunk_0.mp3");
        job.register_original(original.clone());
        job.register_temp(chunk.clone());

        let mut rx = hub.subscribe("user-1");
        assert!(cancel_job(&registry, &hub, &job.id, "user-1").await);

        // Files gone, job gone.
        assert!(!original.exists());
        assert!(!chunk.exists());
        assert!(registry.get(&job.id).is_none());

        // Cancelling update first, then exactly one cancelled terminal.
        match rx.recv().await.unwrap() {
            StatusEvent::StatusUpdate { snapshot } => {
                assert_eq!(snapshot.status, "cancelling");
                assert!(snapshot.cancelling);
            }
            other => panic!("expected status update, got {:?}", other),
        }
        match rx.recv().await.unwrap() {
            StatusEvent::Cancelled { snapshot, .. } => {
                assert_eq!(snapshot.job_id, job.id);
            }
            other => panic!("expected cancelled event, got {:?}", other),
        }
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_repeated_cancel_is_rejected() {
        let registry = JobRegistry::new();
        let hub = StatusHub::new();
        let job = registry.create("user-1", "meeting.mp3", None);

        assert!(cancel_job(&registry, &hub, &job.id, "user-1").await);
        // Job is gone from the registry now, so a second request fails
        // closed like any unknown id.
        assert!(!cancel_job(&registry, &hub, &job.id, "user-1").await);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent_and_swallows_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let job = Job::new(
            "job-1".to_string(),
            "user-1".to_string(),
            "meeting.mp3".to_string(),
            None,
        );
        let path = touch(&dir, "upload.mp3");
        job.register_original(path.clone());
        job.register_temp(dir.path().join("never-created.mp3"));

        cleanup_job_files(&job).await;
        assert!(!path.exists());

        // Second invocation is a no-op, not an error.
        cleanup_job_files(&job).await;
    }
}
