//! # Audio Duration Probe
//!
//! Thin wrapper around `ffprobe` for reading a file's intrinsic duration.
//! The chunk planner refuses to guess: if the duration cannot be determined
//! here, planning fails and the job is rejected before any external call.

use std::path::Path;
use tokio::process::Command;
use tracing::warn;

use crate::audio::chunker::PlanError;

/// Read the duration of an audio file in seconds via `ffprobe`.
///
/// Returns `PlanError::DurationUnknown` when the tool is missing, exits
/// non-zero, or prints something that does not parse as a duration.
pub async fn audio_duration_seconds(path: &Path) -> Result<f64, PlanError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-show_entries",
            "format=duration",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .output()
        .await
        .map_err(|err| {
            warn!("ffprobe unavailable: {}", err);
            PlanError::DurationUnknown
        })?;

    if !output.status.success() {
        warn!(
            "ffprobe failed for {}: {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
        return Err(PlanError::DurationUnknown);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let duration: f64 = stdout
        .trim()
        .parse()
        .map_err(|_| PlanError::DurationUnknown)?;

    if !duration.is_finite() || duration <= 0.0 {
        return Err(PlanError::DurationUnknown);
    }

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_missing_file_yields_duration_unknown() {
        // Whether or not ffprobe is installed, a nonexistent path can never
        // produce a valid duration.
        let path = PathBuf::from("/nonexistent/audio-probe-test.mp3");
        let result = audio_duration_seconds(&path).await;
        assert_eq!(result, Err(PlanError::DurationUnknown));
    }
}
