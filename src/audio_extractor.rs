use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Pulls the audio track out of a video as mono PCM.
pub struct AudioExtractor {
    input_path: PathBuf,
    sample_rate: u32,
}

impl AudioExtractor {
    pub fn new(input_path: impl AsRef<Path>, sample_rate: u32) -> Self {
        Self {
            input_path: input_path.as_ref().to_path_buf(),
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Decode the first audio stream to mono f32 samples at the configured rate.
    pub fn extract_mono(&self) -> Result<Vec<f32>> {
        let ffmpeg = which::which("ffmpeg").context("ffmpeg not found in PATH")?;

        // -vn drops video; f32le on stdout avoids a temp file
        let output = Command::new(ffmpeg)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(&self.input_path)
            .arg("-vn")
            .arg("-ac")
            .arg("1")
            .arg("-ar")
            .arg(self.sample_rate.to_string())
            .arg("-f")
            .arg("f32le")
            .arg("-acodec")
            .arg("pcm_f32le")
            .arg("pipe:1")
            .stdin(Stdio::null())
            .output()
            .context("failed to run ffmpeg for audio extraction")?;

        if !output.status.success() {
            anyhow::bail!(
                "audio extraction failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let samples = decode_f32le(&output.stdout);
        if samples.is_empty() {
            anyhow::bail!("no audio track in {}", self.input_path.display());
        }
        Ok(samples)
    }
}

fn decode_f32le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_f32le_ignores_trailing_bytes() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0.5f32.to_le_bytes());
        bytes.extend_from_slice(&(-1.0f32).to_le_bytes());
        bytes.push(0xAB);
        assert_eq!(decode_f32le(&bytes), vec![0.5, -1.0]);
    }

    #[test]
    fn test_missing_input_is_an_error() {
        if which::which("ffmpeg").is_err() {
            return;
        }
        let extractor = AudioExtractor::new("/nonexistent/input.mp4", 22_050);
        assert!(extractor.extract_mono().is_err());
    }
}
