//! # Speech-to-Text Service Client
//!
//! The external transcription capability behind a trait seam. The engine
//! only ever sees `SpeechToText` and its typed failure modes; the HTTP
//! implementation below talks to a Whisper-compatible endpoint with
//! multipart uploads. Retries and backoff live in the orchestrator, not
//! here — each call is a single attempt.

use async_trait::async_trait;
use reqwest::multipart;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Typed failure modes of the speech-to-text capability.
///
/// The classification drives both the retry backoff (transport failures wait
/// longer) and the user-facing terminal message when a failure escalates to
/// the job level.
#[derive(Debug, Clone)]
pub enum SttError {
    /// Credentials rejected by the service.
    Auth(String),

    /// Account quota or rate limit exhausted.
    Quota(String),

    /// Connection-level failure (reset, timeout, DNS).
    Transport(String),

    /// The service rejected the audio payload itself.
    Format(String),

    /// Any other service-side failure.
    Service(String),
}

impl SttError {
    /// Transport-shaped failures get the longer retry backoff.
    pub fn is_transport(&self) -> bool {
        matches!(self, SttError::Transport(_))
    }

    /// Split into a short classified message and a longer detail string for
    /// user-visible failure payloads. Raw error chains are never exposed
    /// verbatim; the detail is the service-level message only.
    pub fn classify(&self) -> (&'static str, String) {
        match self {
            SttError::Auth(msg) => ("Invalid transcription service credentials", msg.clone()),
            SttError::Quota(msg) => ("Transcription service quota exceeded", msg.clone()),
            SttError::Transport(msg) => (
                "Connection to transcription service failed",
                format!("The audio may be too large or the service unreachable: {}", msg),
            ),
            SttError::Format(msg) => ("Unsupported audio format", msg.clone()),
            SttError::Service(msg) => ("Transcription service error", msg.clone()),
        }
    }

    /// Whether this failure should fail the whole job instead of being
    /// absorbed as a per-chunk placeholder. Bad credentials or an exhausted
    /// quota will fail every remaining chunk the same way.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SttError::Auth(_) | SttError::Quota(_))
    }
}

impl fmt::Display for SttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SttError::Auth(msg) => write!(f, "authentication failed: {}", msg),
            SttError::Quota(msg) => write!(f, "quota exceeded: {}", msg),
            SttError::Transport(msg) => write!(f, "connection error: {}", msg),
            SttError::Format(msg) => write!(f, "invalid audio format: {}", msg),
            SttError::Service(msg) => write!(f, "service error: {}", msg),
        }
    }
}

impl std::error::Error for SttError {}

/// The external speech-to-text capability.
///
/// One call transcribes one bounded-size audio chunk. Implementations must
/// be cheap to share across jobs; the engine holds a single `Arc<dyn
/// SpeechToText>` for the process lifetime.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe a single chunk file, optionally with a language hint.
    async fn transcribe(
        &self,
        chunk: &Path,
        language: Option<&str>,
    ) -> Result<String, SttError>;
}

/// HTTP implementation against a Whisper-compatible transcription endpoint.
pub struct HttpSpeechToText {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl HttpSpeechToText {
    /// Build a client with the extended timeout large chunks need.
    pub fn new(
        api_url: String,
        api_key: String,
        model: String,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            http,
            api_url,
            api_key,
            model,
        })
    }

    fn classify_status(status: reqwest::StatusCode, body: String) -> SttError {
        match status.as_u16() {
            401 | 403 => SttError::Auth(body),
            429 => SttError::Quota(body),
            400 | 415 | 422 => SttError::Format(body),
            _ => SttError::Service(format!("HTTP {}: {}", status.as_u16(), body)),
        }
    }
}

#[async_trait]
impl SpeechToText for HttpSpeechToText {
    async fn transcribe(
        &self,
        chunk: &Path,
        language: Option<&str>,
    ) -> Result<String, SttError> {
        let file_name = chunk
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());

        let bytes = tokio::fs::read(chunk)
            .await
            .map_err(|err| SttError::Service(format!("failed to read chunk: {}", err)))?;

        debug!("Sending {} ({} bytes) to transcription service", file_name, bytes.len());

        let mut form = multipart::Form::new()
            .part(
                "file",
                multipart::Part::bytes(bytes).file_name(file_name),
            )
            .text("model", self.model.clone())
            .text("response_format", "text");

        if let Some(language) = language {
            form = form.text("language", language.to_string());
        }

        let response = self
            .http
            .post(format!("{}/audio/transcriptions", self.api_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|err| {
                if err.is_connect() || err.is_timeout() {
                    SttError::Transport(err.to_string())
                } else {
                    SttError::Service(err.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| SttError::Transport(err.to_string()))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, body));
        }

        Ok(body.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_classified_for_backoff() {
        assert!(SttError::Transport("reset".into()).is_transport());
        assert!(!SttError::Service("500".into()).is_transport());
        assert!(!SttError::Format("bad header".into()).is_transport());
    }

    #[test]
    fn test_fatal_errors_escalate_to_job_failure() {
        assert!(SttError::Auth("bad key".into()).is_fatal());
        assert!(SttError::Quota("limit".into()).is_fatal());
        assert!(!SttError::Transport("reset".into()).is_fatal());
        assert!(!SttError::Service("oops".into()).is_fatal());
    }

    #[test]
    fn test_classification_keeps_short_message_and_detail() {
        let (message, details) = SttError::Auth("key expired".into()).classify();
        assert_eq!(message, "Invalid transcription service credentials");
        assert!(details.contains("key expired"));
    }

    #[test]
    fn test_status_classification() {
        let err = HttpSpeechToText::classify_status(
            reqwest::StatusCode::UNAUTHORIZED,
            "bad key".into(),
        );
        assert!(matches!(err, SttError::Auth(_)));

        let err = HttpSpeechToText::classify_status(
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            "slow down".into(),
        );
        assert!(matches!(err, SttError::Quota(_)));

        let err = HttpSpeechToText::classify_status(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "boom".into(),
        );
        assert!(matches!(err, SttError::Service(_)));
    }
}
