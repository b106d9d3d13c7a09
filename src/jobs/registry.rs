//! # Job Registry
//!
//! The authoritative in-process table of job records and the single source
//! of truth for status queries. The registry is an explicit, injected
//! object created at process start — never ambient global state — so it can
//! be unit-tested in isolation and swapped for a persistent store later.
//!
//! Jobs are in-memory and best-effort: nothing survives a process restart
//! by design.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{StatusEvent, StatusHub};
use crate::jobs::cancel::cleanup_job_files;
use crate::jobs::job::Job;

/// Registry of all live jobs, keyed by job id.
///
/// ## Thread Safety:
/// A read-write lock over the map; individual job records carry their own
/// interior locks, so holding the map lock is always brief.
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Create and register a new job.
    ///
    /// The record is visible to readers before this returns, so there is no
    /// window between the accept response and the first status query.
    pub fn create(
        &self,
        owner_id: &str,
        filename: &str,
        language: Option<String>,
    ) -> Arc<Job> {
        let id = Uuid::new_v4().to_string();
        let job = Arc::new(Job::new(
            id.clone(),
            owner_id.to_string(),
            filename.to_string(),
            language,
        ));

        self.jobs.write().unwrap().insert(id, job.clone());
        job
    }

    pub fn get(&self, id: &str) -> Option<Arc<Job>> {
        self.jobs.read().unwrap().get(id).cloned()
    }

    /// Remove a job. Removing an unknown id is a no-op, not an error.
    pub fn remove(&self, id: &str) -> bool {
        self.jobs.write().unwrap().remove(id).is_some()
    }

    /// All live jobs belonging to `owner_id`, for replay on subscription.
    pub fn jobs_for_owner(&self, owner_id: &str) -> Vec<Arc<Job>> {
        self.jobs
            .read()
            .unwrap()
            .values()
            .filter(|job| job.owner_id == owner_id)
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    /// Detach every job older than `max_age_secs` from the registry.
    pub fn take_orphans(&self, max_age_secs: u64) -> Vec<Arc<Job>> {
        let now = chrono::Utc::now();
        let mut jobs = self.jobs.write().unwrap();

        let stale: Vec<String> = jobs
            .iter()
            .filter(|(_, job)| {
                now.signed_duration_since(job.start_time).num_seconds() >= max_age_secs as i64
            })
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| jobs.remove(&id))
            .collect()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One pass of the orphan sweep.
///
/// Jobs whose `start_time` exceeds the staleness threshold are treated as
/// abandoned regardless of client behavior: the pipeline is interrupted
/// through the cancellation latch, files are cleaned up, and a timeout
/// failure notification is emitted before the record disappears.
pub async fn sweep_orphaned_jobs(registry: &JobRegistry, hub: &StatusHub, max_age_secs: u64) {
    for job in registry.take_orphans(max_age_secs) {
        warn!(
            "Cleaning up orphaned job {} (started {})",
            job.id, job.start_time
        );

        // A job that reached terminal state on its own already emitted its
        // terminal event; only clean up what it left behind.
        let already_terminal = job.status().is_terminal();

        // Stop any in-flight work before touching its files.
        job.begin_cancel();
        cleanup_job_files(&job).await;

        if !already_terminal {
            hub.publish(
                &job.owner_id,
                StatusEvent::Failed {
                    snapshot: job.snapshot(),
                    error: "Job timeout".to_string(),
                    details: "The transcription job took too long and was automatically cancelled"
                        .to_string(),
                },
            );
        }
    }
}

/// Long-running sweep loop, spawned once at startup.
pub async fn run_orphan_sweep(
    registry: Arc<JobRegistry>,
    hub: Arc<StatusHub>,
    interval_secs: u64,
    max_age_secs: u64,
) {
    info!(
        "Orphan sweep running every {}s (threshold {}s)",
        interval_secs, max_age_secs
    );
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    interval.tick().await; // First tick completes immediately.

    loop {
        interval.tick().await;
        sweep_orphaned_jobs(&registry, &hub, max_age_secs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_job_is_immediately_visible() {
        let registry = JobRegistry::new();
        let job = registry.create("user-1", "meeting.mp3", None);

        let fetched = registry.get(&job.id).expect("job must be visible");
        assert_eq!(fetched.owner_id, "user-1");
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = JobRegistry::new();
        let a = registry.create("user-1", "a.mp3", None);
        let b = registry.create("user-1", "b.mp3", None);
        assert_ne!(a.id, b.id);
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = JobRegistry::new();
        let job = registry.create("user-1", "meeting.mp3", None);

        assert!(registry.remove(&job.id));
        assert!(!registry.remove(&job.id));
        assert!(!registry.remove("never-existed"));
        assert!(registry.get(&job.id).is_none());
    }

    #[test]
    fn test_owner_listing_is_scoped() {
        let registry = JobRegistry::new();
        registry.create("user-1", "a.mp3", None);
        registry.create("user-1", "b.mp3", None);
        registry.create("user-2", "c.mp3", None);

        assert_eq!(registry.jobs_for_owner("user-1").len(), 2);
        assert_eq!(registry.jobs_for_owner("user-2").len(), 1);
        assert_eq!(registry.jobs_for_owner("user-3").len(), 0);
    }

    #[test]
    fn test_take_orphans_honors_threshold() {
        let registry = JobRegistry::new();
        let job = registry.create("user-1", "meeting.mp3", None);

        // A generous threshold keeps fresh jobs alone.
        assert!(registry.take_orphans(3600).is_empty());
        assert_eq!(registry.active_count(), 1);

        // A zero threshold treats everything as stale.
        let orphans = registry.take_orphans(0);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, job.id);
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_emits_timeout_failure() {
        let registry = JobRegistry::new();
        let hub = StatusHub::new();
        let job = registry.create("user-1", "meeting.mp3", None);
        let mut rx = hub.subscribe("user-1");

        sweep_orphaned_jobs(&registry, &hub, 0).await;

        assert!(registry.get(&job.id).is_none());
        match rx.recv().await.unwrap() {
            StatusEvent::Failed { error, .. } => assert_eq!(error, "Job timeout"),
            other => panic!("expected failed event, got {:?}", other),
        }
    }
}
