//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **struct**: Custom data types that group related fields together
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_TRANSCRIPTION_MODEL, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, storage,
/// transcription, jobs) makes it easier to understand and maintain as the
/// application grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub transcription: TranscriptionConfig,
    pub jobs: JobsConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16, // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
}

/// Upload storage settings.
///
/// ## Fields:
/// - `upload_dir`: Directory where submitted audio files are stored until
///   their job cleans them up
/// - `retention_secs`: Safety-net sweep deletes upload files older than
///   this, tolerant of races with in-progress jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub upload_dir: String,
    pub retention_secs: u64,
}

/// External speech-to-text service settings.
///
/// ## Size limits:
/// - `max_upload_mb`: Submissions above this are rejected outright
/// - `single_call_limit_mb`: The service's per-call hard limit; larger
///   files are split before transcription
/// - `max_chunk_size_mb`: Target upper bound for each materialized chunk
///   (the planner aims for 80% of this for safety margin)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub max_upload_mb: f64,
    pub single_call_limit_mb: f64,
    pub max_chunk_size_mb: f64,
    pub max_attempts: u32,
    pub request_timeout_secs: u64,
}

/// Job lifecycle tuning.
///
/// ## Fields:
/// - `orphan_timeout_secs`: Jobs older than this are force-cancelled by the
///   background sweep (default: 2 hours)
/// - `sweep_interval_secs`: How often the orphan and retention sweeps run
/// - `terminal_grace_secs`: How long completed/failed jobs stay queryable
///   before they are removed from the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    pub orphan_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub terminal_grace_secs: u64,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start even if no configuration
/// file exists. They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(), // Localhost only (safe for development)
                port: 8080,                    // Common development port
            },
            storage: StorageConfig {
                upload_dir: "uploads".to_string(),
                retention_secs: 3600, // Sweep upload files older than 1 hour
            },
            transcription: TranscriptionConfig {
                api_url: "https://api.openai.com/v1".to_string(),
                api_key: String::new(), // Must come from the environment
                model: "whisper-1".to_string(),
                max_upload_mb: 200.0,
                single_call_limit_mb: 25.0, // The service's per-call hard limit
                max_chunk_size_mb: 20.0,
                max_attempts: 3,
                request_timeout_secs: 600, // Large chunks need generous timeouts
            },
            jobs: JobsConfig {
                orphan_timeout_secs: 2 * 60 * 60, // 2 hours
                sweep_interval_secs: 60 * 60,     // Hourly sweeps
                terminal_grace_secs: 30,          // Keep finished jobs briefly for late polls
            },
        }
    }
}

/// Implementation block for AppConfig - adds methods to the struct.
impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT and OPENAI_API_KEY
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_PORT=3000`: Override server port
    /// - `APP_TRANSCRIPTION_MODEL=whisper-1`: Override the service model
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    /// - `OPENAI_API_KEY=sk-...`: Credential for the speech-to-text service
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists) - required(false) means "don't error if missing"
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            // Example: APP_SERVER_HOST becomes server.host in the config
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Handle special environment variables used by deployment platforms
        // These don't follow the APP_ prefix convention but are commonly used
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // The speech-to-text credential is conventionally provided under
        // this name by the hosting environment
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("transcription.api_key", key)?;
        }

        // Build the final configuration and convert it back to our AppConfig struct
        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## Why validate:
    /// Catching configuration errors early prevents runtime failures and
    /// provides clear error messages about what's wrong.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.storage.upload_dir.is_empty() {
            return Err(anyhow::anyhow!("Upload directory cannot be empty"));
        }

        if self.transcription.max_attempts == 0 {
            return Err(anyhow::anyhow!("Max attempts must be greater than 0"));
        }

        if self.transcription.single_call_limit_mb <= 0.0
            || self.transcription.max_chunk_size_mb <= 0.0
        {
            return Err(anyhow::anyhow!("Size limits must be greater than 0"));
        }

        if self.transcription.max_upload_mb < self.transcription.single_call_limit_mb {
            return Err(anyhow::anyhow!(
                "Max upload size must be at least the single-call limit"
            ));
        }

        if self.jobs.orphan_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Orphan timeout must be greater than 0"));
        }

        Ok(()) // All validation passed
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// This method allows updating only some fields, not the entire configuration.
    /// For example, you can send just `{"server": {"port": 9000}}` to change only the port.
    /// The service credential is deliberately not updatable at runtime.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        // Parse the JSON string into a generic value
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        // Update server configuration if provided
        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16; // Convert u64 to u16 for port number
            }
        }

        // Update storage configuration if provided
        if let Some(storage) = partial_config.get("storage") {
            if let Some(dir) = storage.get("upload_dir").and_then(|v| v.as_str()) {
                self.storage.upload_dir = dir.to_string();
            }
            if let Some(retention) = storage.get("retention_secs").and_then(|v| v.as_u64()) {
                self.storage.retention_secs = retention;
            }
        }

        // Update transcription configuration if provided
        if let Some(transcription) = partial_config.get("transcription") {
            if let Some(model) = transcription.get("model").and_then(|v| v.as_str()) {
                self.transcription.model = model.to_string();
            }
            if let Some(attempts) = transcription.get("max_attempts").and_then(|v| v.as_u64()) {
                self.transcription.max_attempts = attempts as u32;
            }
            if let Some(limit) = transcription.get("max_upload_mb").and_then(|v| v.as_f64()) {
                self.transcription.max_upload_mb = limit;
            }
            if let Some(limit) = transcription
                .get("max_chunk_size_mb")
                .and_then(|v| v.as_f64())
            {
                self.transcription.max_chunk_size_mb = limit;
            }
        }

        // Update job lifecycle configuration if provided
        if let Some(jobs) = partial_config.get("jobs") {
            if let Some(timeout) = jobs.get("orphan_timeout_secs").and_then(|v| v.as_u64()) {
                self.jobs.orphan_timeout_secs = timeout;
            }
            if let Some(grace) = jobs.get("terminal_grace_secs").and_then(|v| v.as_u64()) {
                self.jobs.terminal_grace_secs = grace;
            }
        }

        // Validate the updated configuration to ensure it's still valid
        self.validate()?;
        Ok(())
    }
}
