//! # Transcription Job Engine
//!
//! Job lifecycle, chunk-pipeline orchestration, cancellation, and cleanup.
//! This module owns the state machine of the system; the HTTP and WebSocket
//! layers are thin adapters over it.
//!
//! ## Key Components:
//! - **Job**: one accepted request and its full processing state
//! - **Registry**: authoritative in-process job table + orphan sweep
//! - **Pipeline**: per-job driver task (preprocess → plan → transcribe → persist)
//! - **Cancel**: cancellation propagation and exactly-once file cleanup

pub mod cancel; // Cancellation & cleanup coordinator
pub mod job; // Job record and status state machine
pub mod pipeline; // Per-job pipeline driver
pub mod registry; // In-process job table and orphan sweep
