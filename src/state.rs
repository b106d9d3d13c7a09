//! # Application State Management
//!
//! This module manages shared state that needs to be accessed by multiple HTTP request handlers
//! simultaneously.
//!
//! ## Key Rust Concepts (IMPORTANT for beginners):
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Allows multiple parts of the program to safely share ownership of data
//! - **Why needed**: Multiple HTTP requests run simultaneously and all need access to the same state
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Allows multiple readers OR one writer at a time (but not both)
//! - **Why needed**: Multiple requests can read config simultaneously, but only one can update it
//!
//! ### Arc<RwLock<T>> Pattern
//! The combination gives thread-safe shared mutable state: many handlers
//! hold a reference, and the lock arbitrates access.
//!
//! Beyond the config/metrics pair, this state carries the engine's
//! injected collaborators: the job registry, the status hub, and the
//! speech-to-text/persistence capabilities. They are created once at
//! process start and injected here rather than living as ambient globals,
//! so each can be unit-tested in isolation and swapped out later.

use crate::config::AppConfig;
use crate::events::StatusHub;
use crate::jobs::pipeline::{EngineSettings, PipelineDeps};
use crate::jobs::registry::JobRegistry;
use crate::storage::TranscriptStore;
use crate::transcription::client::SpeechToText;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// The main application state that's shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Performance metrics (constantly being updated by requests)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Authoritative in-process table of job records
    pub registry: Arc<JobRegistry>,

    /// Per-owner fan-out of job status events
    pub hub: Arc<StatusHub>,

    /// External speech-to-text capability
    pub stt: Arc<dyn SpeechToText>,

    /// Transcript persistence capability
    pub store: Arc<dyn TranscriptStore>,

    /// When the server started (never changes, so no lock needed)
    pub start_time: Instant,
}

/// Performance metrics collected across all HTTP requests.
///
/// ## Why these metrics matter:
/// - **request_count**: Total requests processed (for load monitoring)
/// - **error_count**: Total errors (for reliability monitoring)
/// - **endpoint_metrics**: Per-endpoint statistics (for performance optimization)
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Detailed metrics for each API endpoint (URL path)
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

impl AppState {
    /// Create a new AppState with the given configuration and collaborators.
    pub fn new(
        config: AppConfig,
        stt: Arc<dyn SpeechToText>,
        store: Arc<dyn TranscriptStore>,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            registry: Arc::new(JobRegistry::new()),
            hub: Arc::new(StatusHub::new()),
            stt,
            store,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    /// AppConfig is designed to be cheap to clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Update the configuration with validation.
    ///
    /// Configuration is validated before updating to ensure it's always valid.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                // Validation passed, update the config
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => {
                // Validation failed, return the error
                Err(e.to_string())
            }
        }
    }

    /// Bundle the collaborators a pipeline task needs, with the engine
    /// settings extracted from the current configuration.
    pub fn pipeline_deps(&self) -> PipelineDeps {
        let config = self.get_config();
        PipelineDeps {
            registry: self.registry.clone(),
            hub: self.hub.clone(),
            stt: self.stt.clone(),
            store: self.store.clone(),
            settings: EngineSettings {
                single_call_limit_mb: config.transcription.single_call_limit_mb,
                max_chunk_size_mb: config.transcription.max_chunk_size_mb,
                max_attempts: config.transcription.max_attempts,
                terminal_grace_secs: config.jobs.terminal_grace_secs,
                // Backoff policy is fixed: transport failures wait longer.
                transport_backoff: Duration::from_secs(5),
                retry_backoff: Duration::from_secs(2),
            },
        }
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called when any request fails).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// The first time we see an endpoint, we create a new EndpointMetric with
    /// default values. Subsequent requests update the existing metrics.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        // Get or create metrics for this specific endpoint
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        // Update the metrics for this endpoint
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Clones the data so we don't hold the lock while sending the HTTP
    /// response.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Implementation of utility methods for EndpointMetric.
impl EndpointMetric {
    /// Calculate the average response time for this endpoint.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0 // No requests yet, so no average to calculate
        }
    }

    /// Calculate the error rate for this endpoint as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0 // No requests yet, so no errors possible
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryTranscriptStore;
    use crate::transcription::client::SttError;
    use async_trait::async_trait;
    use std::path::Path;

    struct NoopStt;

    #[async_trait]
    impl crate::transcription::client::SpeechToText for NoopStt {
        async fn transcribe(
            &self,
            _chunk: &Path,
            _language: Option<&str>,
        ) -> Result<String, SttError> {
            Ok(String::new())
        }
    }

    fn test_state() -> AppState {
        AppState::new(
            AppConfig::default(),
            Arc::new(NoopStt),
            Arc::new(InMemoryTranscriptStore::new()),
        )
    }

    #[test]
    fn test_metrics_accumulate() {
        let state = test_state();
        state.increment_request_count();
        state.increment_request_count();
        state.increment_error_count();
        state.record_endpoint_request("POST /api/v1/transcribe", 120, false);
        state.record_endpoint_request("POST /api/v1/transcribe", 80, true);

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.error_count, 1);

        let endpoint = &snapshot.endpoint_metrics["POST /api/v1/transcribe"];
        assert_eq!(endpoint.request_count, 2);
        assert_eq!(endpoint.average_duration_ms(), 100.0);
        assert_eq!(endpoint.error_rate(), 0.5);
    }

    #[test]
    fn test_pipeline_deps_reflect_config() {
        let state = test_state();
        let deps = state.pipeline_deps();
        assert_eq!(deps.settings.single_call_limit_mb, 25.0);
        assert_eq!(deps.settings.max_attempts, 3);
        assert_eq!(deps.settings.terminal_grace_secs, 30);
    }

    #[test]
    fn test_config_update_rejects_invalid() {
        let state = test_state();
        let mut config = state.get_config();
        config.server.port = 0;
        assert!(state.update_config(config).is_err());
        // Original config untouched
        assert_eq!(state.get_config().server.port, 8080);
    }
}
