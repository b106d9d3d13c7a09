//! # Audio File Handling
//!
//! File-level audio operations performed before transcription: probing a
//! file's duration, converting incompatible formats, and planning/cutting
//! chunks that fit the external service's per-call size limit.
//!
//! ## Key Components:
//! - **Probe**: duration lookup via ffprobe (planning precondition)
//! - **Convert**: format conversion and chunk extraction via ffmpeg
//! - **Chunker**: pure, deterministic chunk boundary planning

pub mod chunker; // Chunk boundary planning
pub mod convert; // ffmpeg conversion and chunk extraction
pub mod probe; // ffprobe duration lookup
