//! # Audio Conversion and Chunk Materialization
//!
//! Wraps the external `ffmpeg` utility for the two file-level operations the
//! pipeline needs: converting formats that the transcription service handles
//! poorly, and cutting a planned chunk out of the source file.
//!
//! Conversion failures are never fatal — the pipeline falls back to the
//! original file and reports the fallback as a stage update.

use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::audio::chunker::ChunkSpan;

/// Extensions that are known to cause trouble downstream and are converted
/// to WAV before transcription.
const CONVERT_EXTENSIONS: &[&str] = &["m4a", "mp4"];

/// Whether a file with this extension should be converted before use.
pub fn needs_conversion(extension: &str) -> bool {
    let ext = extension.trim_start_matches('.').to_ascii_lowercase();
    CONVERT_EXTENSIONS.contains(&ext.as_str())
}

/// Path the converted copy of `input` will be written to.
pub fn converted_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio".to_string());
    input.with_file_name(format!("{}_converted.wav", stem))
}

/// Convert `input` to a 16kHz mono PCM WAV at `output`.
///
/// Returns `true` on success. A missing ffmpeg binary or a non-zero exit is
/// reported as `false` so the caller can continue with the original file.
pub async fn convert_to_wav(input: &Path, output: &Path) -> bool {
    let result = Command::new("ffmpeg")
        .arg("-i")
        .arg(input)
        .args(["-ar", "16000", "-ac", "1", "-c:a", "pcm_s16le"])
        .arg(output)
        .output()
        .await;

    match result {
        Ok(out) if out.status.success() => {
            info!("Converted {} -> {}", input.display(), output.display());
            true
        }
        Ok(out) => {
            warn!(
                "ffmpeg conversion failed for {}: {}",
                input.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            );
            false
        }
        Err(err) => {
            warn!("ffmpeg unavailable, skipping conversion: {}", err);
            false
        }
    }
}

/// Path for chunk `index` of `input`.
pub fn chunk_path(input: &Path, index: usize) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio".to_string());
    let ext = input
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "wav".to_string());
    input.with_file_name(format!("{}_chunk_{}.{}", stem, index, ext))
}

/// Materialize one planned chunk of `input` at `output` using a stream copy.
///
/// Unlike conversion, a failed cut is a hard error: the planner has already
/// committed to these boundaries and the pipeline cannot proceed without the
/// chunk files.
pub async fn extract_chunk(
    input: &Path,
    output: &Path,
    span: &ChunkSpan,
) -> anyhow::Result<()> {
    debug!(
        "Extracting chunk {} [{:.1}s +{:.1}s]",
        output.display(),
        span.start,
        span.span
    );

    let out = Command::new("ffmpeg")
        .arg("-i")
        .arg(input)
        .args([
            "-ss",
            &format!("{}", span.start),
            "-t",
            &format!("{}", span.span),
            "-c",
            "copy",
        ])
        .arg(output)
        .output()
        .await
        .map_err(|err| anyhow::anyhow!("ffmpeg unavailable: {}", err))?;

    if !out.status.success() {
        return Err(anyhow::anyhow!(
            "ffmpeg split failed for {}: {}",
            output.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_conversion_is_extension_based() {
        assert!(needs_conversion("m4a"));
        assert!(needs_conversion(".M4A"));
        assert!(needs_conversion("mp4"));
        assert!(!needs_conversion("wav"));
        assert!(!needs_conversion("mp3"));
        assert!(!needs_conversion("ogg"));
    }

    #[test]
    fn test_converted_path_keeps_directory() {
        let path = converted_path(Path::new("/tmp/uploads/123-meeting.m4a"));
        assert_eq!(
            path,
            PathBuf::from("/tmp/uploads/123-meeting_converted.wav")
        );
    }

    #[test]
    fn test_chunk_path_is_indexed() {
        let path = chunk_path(Path::new("/tmp/uploads/123-meeting.mp3"), 2);
        assert_eq!(path, PathBuf::from("/tmp/uploads/123-meeting_chunk_2.mp3"));
    }
}
