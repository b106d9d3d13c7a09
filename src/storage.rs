//! # Transcript Persistence
//!
//! The persistence collaborator behind a trait seam: once a job completes,
//! its aggregated transcript is recorded under the owning user. Persistence
//! failure degrades to a warning on the completed payload — it never fails
//! the job. The relational store itself is outside this service; the
//! in-memory implementation here is the process-local stand-in and the test
//! double.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::jobs::job::ProcessingDetails;

/// A finished transcription as recorded in history.
#[derive(Debug, Clone)]
pub struct TranscriptRecord {
    pub id: String,
    pub filename: String,
    pub file_size_bytes: u64,
    pub language: Option<String>,
    pub transcription: String,
    pub processing_details: ProcessingDetails,
    pub created_at: DateTime<Utc>,
}

/// Capability for recording completed transcripts per owner.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Persist a record under `owner_id`, returning its assigned id.
    async fn save(&self, owner_id: &str, record: TranscriptRecord) -> anyhow::Result<String>;
}

/// Process-local store keyed by owner.
pub struct InMemoryTranscriptStore {
    records: RwLock<HashMap<String, Vec<TranscriptRecord>>>,
}

impl InMemoryTranscriptStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn records_for(&self, owner_id: &str) -> Vec<TranscriptRecord> {
        self.records
            .read()
            .unwrap()
            .get(owner_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for InMemoryTranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscriptStore for InMemoryTranscriptStore {
    async fn save(&self, owner_id: &str, mut record: TranscriptRecord) -> anyhow::Result<String> {
        if record.id.is_empty() {
            record.id = Uuid::new_v4().to_string();
        }
        let id = record.id.clone();
        self.records
            .write()
            .unwrap()
            .entry(owner_id.to_string())
            .or_default()
            .push(record);
        Ok(id)
    }
}

/// One pass over the upload directory: delete files older than the
/// retention window.
///
/// This is the safety net against leaked uploads, not the primary cleanup
/// path — jobs delete their own files. It races in-progress jobs by
/// design, so every failure is swallowed.
pub async fn sweep_upload_dir(dir: &Path, retention: Duration) -> usize {
    let mut removed = 0;

    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let expired = metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .map(|age| age >= retention)
            .unwrap_or(false);

        if expired && tokio::fs::remove_file(entry.path()).await.is_ok() {
            debug!("Retention sweep removed {}", entry.path().display());
            removed += 1;
        }
    }

    removed
}

/// Long-running retention sweep loop, spawned once at startup.
pub async fn run_retention_sweep(dir: PathBuf, interval_secs: u64, retention_secs: u64) {
    info!(
        "Upload retention sweep running every {}s (retention {}s)",
        interval_secs, retention_secs
    );
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    interval.tick().await; // First tick completes immediately.

    loop {
        interval.tick().await;
        let removed = sweep_upload_dir(&dir, Duration::from_secs(retention_secs)).await;
        if removed > 0 {
            info!("Retention sweep removed {} stale upload(s)", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(filename: &str) -> TranscriptRecord {
        TranscriptRecord {
            id: String::new(),
            filename: filename.to_string(),
            file_size_bytes: 1024,
            language: Some("en".to_string()),
            transcription: "hello".to_string(),
            processing_details: ProcessingDetails {
                original_file_size: "0.0MB".to_string(),
                chunks_processed: 1,
                conversion_used: false,
                splitting_used: false,
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_records_are_scoped_by_owner() {
        let store = InMemoryTranscriptStore::new();
        store.save("user-1", record("a.mp3")).await.unwrap();
        store.save("user-1", record("b.mp3")).await.unwrap();
        store.save("user-2", record("c.mp3")).await.unwrap();

        assert_eq!(store.records_for("user-1").len(), 2);
        assert_eq!(store.records_for("user-2").len(), 1);
        assert!(store.records_for("user-3").is_empty());
    }

    #[tokio::test]
    async fn test_save_assigns_id() {
        let store = InMemoryTranscriptStore::new();
        let id = store.save("user-1", record("a.mp3")).await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(store.records_for("user-1")[0].id, id);
    }

    #[tokio::test]
    async fn test_retention_sweep_removes_only_expired_files() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("stale.mp3");
        std::fs::write(&stale, b"old upload").unwrap();

        // Everything is expired under a zero retention window.
        let removed = sweep_upload_dir(dir.path(), Duration::ZERO).await;
        assert_eq!(removed, 1);
        assert!(!stale.exists());

        // A fresh file under a long window survives.
        let fresh = dir.path().join("fresh.mp3");
        std::fs::write(&fresh, b"new upload").unwrap();
        let removed = sweep_upload_dir(dir.path(), Duration::from_secs(3600)).await;
        assert_eq!(removed, 0);
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_retention_sweep_tolerates_missing_dir() {
        let removed = sweep_upload_dir(Path::new("/nonexistent/uploads"), Duration::ZERO).await;
        assert_eq!(removed, 0);
    }
}
