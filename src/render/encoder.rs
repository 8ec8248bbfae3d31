use anyhow::{anyhow, bail, Context, Result};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;
use tracing::{debug, warn};

use crate::recipe::Canvas;

/// Bytes of ffmpeg's stderr kept for error reports
const STDERR_TAIL: usize = 16 * 1024;

/// Read `source` to the end on its own thread, keeping only the last `limit`
/// bytes. The pipe never fills up, however much ffmpeg logs.
fn drain_tail<R: Read + Send + 'static>(mut source: R, limit: usize) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut tail: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match source.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    tail.extend_from_slice(&chunk[..n]);
                    if tail.len() > limit {
                        tail.drain(..tail.len() - limit);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&tail).into_owned()
    })
}

/// Raw RGB frames piped into an `ffmpeg` H.264 encode.
pub struct FfmpegWriter {
    child: Child,
    stdin: ChildStdin,
    stderr: Option<JoinHandle<String>>,
    frame_size: usize,
    frames_written: u64,
    output: PathBuf,
}

impl FfmpegWriter {
    pub fn spawn(canvas: &Canvas, output_path: &Path) -> Result<Self> {
        let bitrate = canvas
            .bitrate_bps()
            .with_context(|| format!("invalid bitrate '{}'", canvas.bitrate))?;
        let frame_size = (canvas.width as usize)
            .checked_mul(canvas.height as usize)
            .and_then(|px| px.checked_mul(3))
            .context("frame size overflow")?;
        let binary = which::which("ffmpeg").unwrap_or_else(|_| PathBuf::from("ffmpeg"));

        let mut command = Command::new(binary);
        command
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-s:v")
            .arg(format!("{}x{}", canvas.width, canvas.height))
            .arg("-r")
            .arg(canvas.fps.to_string())
            .arg("-i")
            .arg("-")
            .arg("-an")
            .arg("-c:v")
            .arg("libx264")
            .arg("-preset")
            .arg("medium")
            .arg("-b:v")
            .arg(bitrate.to_string())
            .arg("-pix_fmt")
            .arg("yuv420p")
            .arg("-movflags")
            .arg("+faststart")
            .arg(output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!("🎬 [render] spawning {:?}", command);
        let mut child = command.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                anyhow!("ffmpeg was not found on PATH; install ffmpeg to render videos")
            } else {
                anyhow!("failed to spawn ffmpeg: {}", e)
            }
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdin"))?;
        let stderr = child.stderr.take().map(|pipe| drain_tail(pipe, STDERR_TAIL));

        Ok(Self {
            child,
            stdin,
            stderr,
            frame_size,
            frames_written: 0,
            output: output_path.to_path_buf(),
        })
    }

    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() != self.frame_size {
            bail!(
                "frame size mismatch: expected {} bytes, got {}",
                self.frame_size,
                frame.len()
            );
        }
        self.stdin
            .write_all(frame)
            .context("failed to write frame to ffmpeg stdin")?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Close the pipe and wait for the encode to finish.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.stdin.flush().context("failed to flush ffmpeg stdin")?;
        drop(self.stdin);

        let status = self.child.wait().context("failed waiting for ffmpeg")?;
        let log = join_log(self.stderr.take());
        if !status.success() {
            bail!("ffmpeg exited with {}: {}", status, log.trim());
        }
        if !log.trim().is_empty() {
            warn!("⚠️  [render] ffmpeg: {}", log.trim());
        }
        Ok(self.output)
    }

    /// Kill the encode and remove the partial output.
    pub fn abort(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        join_log(self.stderr.take());
        let _ = std::fs::remove_file(&self.output);
    }
}

fn join_log(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_keeps_only_the_tail() {
        let mut noisy = vec![b'a'; 200_000];
        noisy.extend_from_slice(b"last line");
        let tail = drain_tail(std::io::Cursor::new(noisy), 64).join().unwrap();
        assert_eq!(tail.len(), 64);
        assert!(tail.ends_with("last line"));
    }

    #[test]
    fn test_encodes_a_short_clip() {
        if which::which("ffmpeg").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("clip.mp4");
        let canvas = Canvas {
            width: 64,
            height: 64,
            fps: 10,
            bitrate: "500k".into(),
        };
        let mut writer = FfmpegWriter::spawn(&canvas, &out).unwrap();
        let frame = vec![128u8; 64 * 64 * 3];
        for _ in 0..10 {
            writer.write_frame(&frame).unwrap();
        }
        assert!(writer.write_frame(&[0u8; 3]).is_err());
        assert_eq!(writer.frames_written(), 10);
        let path = writer.finish().unwrap();
        assert!(path.metadata().unwrap().len() > 0);
    }

    #[test]
    fn test_invalid_bitrate_is_rejected_before_spawn() {
        let canvas = Canvas {
            bitrate: "fast".into(),
            ..Canvas::default()
        };
        assert!(FfmpegWriter::spawn(&canvas, Path::new("/tmp/never.mp4")).is_err());
    }
}
