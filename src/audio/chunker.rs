//! # Chunk Planner
//!
//! Decides whether an audio file needs to be split before it is sent to the
//! external transcription service, and computes the chunk boundaries when it
//! does. Planning is pure arithmetic over the file's duration and size; the
//! actual chunk files are materialized later by `audio::convert`.
//!
//! ## Planning Rules:
//! - Files within the service's single-call limit are not split at all.
//! - Chunk duration targets 80% of the configured chunk size for safety,
//!   derived from the observed bytes-per-second rate.
//! - Chunks are capped at 10 minutes (or half the total duration, whichever
//!   is smaller) and floored at 30 seconds to avoid over-splitting.
//! - Identical inputs always produce identical boundaries.

use std::fmt;

const MEGABYTE: f64 = 1024.0 * 1024.0;

/// Hard ceiling on a single chunk's duration in seconds (10 minutes).
const MAX_CHUNK_SECONDS: f64 = 600.0;

/// Floor on a chunk's duration in seconds, to avoid pathological splits.
const MIN_CHUNK_SECONDS: f64 = 30.0;

/// A planned slice of the source audio, in seconds from the start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkSpan {
    /// Offset of this chunk from the start of the file.
    pub start: f64,
    /// Length of this chunk.
    pub span: f64,
}

/// Errors that can abort chunk planning.
///
/// Planning failures are preconditions: they surface before any external
/// call is made, and the job is rejected rather than processed on a guess.
#[derive(Debug, PartialEq)]
pub enum PlanError {
    /// The file's intrinsic duration could not be determined.
    DurationUnknown,
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanError::DurationUnknown => {
                write!(f, "could not determine audio duration")
            }
        }
    }
}

impl std::error::Error for PlanError {}

/// Compute the chunk boundaries for a file.
///
/// ## Parameters:
/// - **duration_seconds**: intrinsic duration as reported by the probe
/// - **file_size_bytes**: on-disk size of the (possibly converted) file
/// - **max_chunk_size_mb**: target upper bound for a materialized chunk
/// - **single_call_limit_mb**: the external service's per-call hard limit
///
/// ## Returns:
/// An ordered, contiguous partition of `[0, duration)`. A single span
/// covering the whole file means no splitting is required.
pub fn plan(
    duration_seconds: f64,
    file_size_bytes: u64,
    max_chunk_size_mb: f64,
    single_call_limit_mb: f64,
) -> Result<Vec<ChunkSpan>, PlanError> {
    if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
        return Err(PlanError::DurationUnknown);
    }

    let file_size_mb = file_size_bytes as f64 / MEGABYTE;

    // Within the single-call limit: one chunk, no split.
    if file_size_mb <= single_call_limit_mb {
        return Ok(vec![ChunkSpan {
            start: 0.0,
            span: duration_seconds,
        }]);
    }

    let size_per_second = file_size_mb / duration_seconds;

    // Target 80% of the chunk size limit for safety margin, then apply the
    // duration cap (10 minutes or half the file) and the 30-second floor.
    let max_chunk_duration = MAX_CHUNK_SECONDS.min(duration_seconds / 2.0);
    let mut chunk_duration = ((max_chunk_size_mb * 0.8) / size_per_second).floor();
    chunk_duration = chunk_duration.min(max_chunk_duration);
    chunk_duration = chunk_duration.max(MIN_CHUNK_SECONDS);

    if chunk_duration >= duration_seconds {
        // File is effectively small enough, no need to split.
        return Ok(vec![ChunkSpan {
            start: 0.0,
            span: duration_seconds,
        }]);
    }

    let mut spans = Vec::new();
    let mut start = 0.0;

    while start < duration_seconds {
        let remaining = duration_seconds - start;
        let span = chunk_duration.min(remaining);
        spans.push(ChunkSpan { start, span });
        start += span;
    }

    Ok(spans)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_small_file_is_not_split() {
        let spans = plan(300.0, 10 * MB, 20.0, 25.0).unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 0.0);
        assert_eq!(spans[0].span, 300.0);
    }

    #[test]
    fn test_unknown_duration_fails_planning() {
        assert_eq!(plan(0.0, 40 * MB, 20.0, 25.0), Err(PlanError::DurationUnknown));
        assert_eq!(plan(-5.0, 40 * MB, 20.0, 25.0), Err(PlanError::DurationUnknown));
        assert_eq!(
            plan(f64::NAN, 40 * MB, 20.0, 25.0),
            Err(PlanError::DurationUnknown)
        );
    }

    #[test]
    fn test_large_file_splits_into_bounded_chunks() {
        // 40MB over 600s with a 20MB chunk target and 25MB call limit:
        // 0.0667 MB/s -> floor(16.0 / 0.0667) = 240s chunks.
        let spans = plan(600.0, 40 * MB, 20.0, 25.0).unwrap();
        assert!(spans.len() >= 2);
        assert_eq!(spans.len(), 3);

        for span in &spans[..spans.len() - 1] {
            assert!(span.span >= 30.0);
            assert!(span.span <= 240.0);
        }

        // Contiguous partition of [0, duration).
        let mut expected_start = 0.0;
        for span in &spans {
            assert!((span.start - expected_start).abs() < 1e-9);
            expected_start += span.span;
        }
        assert!((expected_start - 600.0).abs() < 1e-9);
    }

    #[test]
    fn test_planning_is_deterministic() {
        let a = plan(3600.0, 120 * MB, 20.0, 25.0).unwrap();
        let b = plan(3600.0, 120 * MB, 20.0, 25.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_minimum_chunk_duration_applies() {
        // Dense audio would suggest sub-30s chunks; the floor wins.
        let spans = plan(120.0, 200 * MB, 20.0, 25.0).unwrap();
        for span in &spans[..spans.len() - 1] {
            assert!(span.span >= 30.0);
        }
    }

    #[test]
    fn test_final_remainder_may_be_short() {
        // 100s file with 30s chunks leaves a 10s remainder.
        let spans = plan(100.0, 200 * MB, 20.0, 25.0).unwrap();
        let last = spans.last().unwrap();
        assert!(last.span < 30.0);
        assert!((last.start + last.span - 100.0).abs() < 1e-9);
    }
}
