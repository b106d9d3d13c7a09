//! # Transcription Services
//!
//! Integration with the external speech-to-text capability: the typed
//! client seam and the per-chunk orchestration (retry, backoff, placeholder
//! substitution, cancellation).
//!
//! The service itself is opaque — this module only knows its input/output
//! contract and failure modes. Nothing here runs inference in-process.

pub mod client; // Speech-to-text capability trait + HTTP implementation
pub mod orchestrator; // Per-chunk retry/backoff/aggregation

pub use client::{HttpSpeechToText, SpeechToText, SttError};
pub use orchestrator::{TranscribeOutcome, TranscriptionOrchestrator};
