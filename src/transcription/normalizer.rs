//! # Format Normalizer
//!
//! Boundary to the external audio converter. Arbitrary container bytes go
//! in (webm, ogg, mp3, whatever the browser recorded), a canonical
//! mono/16 kHz WAV comes out, or the call fails. Failures are per-call and
//! recoverable; garbage input must never crash the caller.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Converts arbitrary input audio into the canonical WAV the speech engine
/// consumes.
#[async_trait]
pub trait AudioNormalizer: Send + Sync {
    async fn normalize(&self, source: &Path, dest_wav: &Path) -> Result<()>;
}

/// ffmpeg-backed normalizer: shells out to `ffmpeg -y -i <src> -ac 1 -ar
/// <rate> <dst>` and treats any non-zero exit as a conversion failure.
pub struct FfmpegNormalizer {
    ffmpeg_path: String,
    sample_rate: u32,
}

impl FfmpegNormalizer {
    pub fn new(ffmpeg_path: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            sample_rate,
        }
    }
}

#[async_trait]
impl AudioNormalizer for FfmpegNormalizer {
    async fn normalize(&self, source: &Path, dest_wav: &Path) -> Result<()> {
        let output = Command::new(&self.ffmpeg_path)
            .arg("-y")
            .arg("-i")
            .arg(source)
            .args(["-ac", "1"])
            .arg("-ar")
            .arg(self.sample_rate.to_string())
            .arg(dest_wav)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.ffmpeg_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Keep a short excerpt; ffmpeg stderr can run to pages
            let excerpt: String = stderr.chars().take(400).collect();
            return Err(anyhow!("audio conversion failed: {}", excerpt));
        }

        debug!(
            source = %source.display(),
            dest = %dest_wav.display(),
            "normalized audio to canonical WAV"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_converter_is_a_recoverable_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("input.webm");
        std::fs::write(&src, b"not really audio").unwrap();

        let normalizer = FfmpegNormalizer::new("/nonexistent/ffmpeg-binary", 16_000);
        let result = normalizer
            .normalize(&src, &dir.path().join("out.wav"))
            .await;
        assert!(result.is_err());
    }
}
