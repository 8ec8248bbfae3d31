use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use image::{DynamicImage, RgbImage};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Initialise FFmpeg and keep its own logging down to errors.
pub(crate) fn init_ffmpeg() -> Result<()> {
    ffmpeg::init().context("failed to initialise FFmpeg")?;
    unsafe {
        ffmpeg::sys::av_log_set_level(ffmpeg::sys::AV_LOG_ERROR as i32);
    }
    Ok(())
}

/// Basic stream facts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Seconds
    pub duration: f64,
}

impl VideoInfo {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Output size keeping aspect ratio for a target width (even dimensions).
pub fn scaled_size(width: u32, height: u32, target_width: Option<u32>) -> (u32, u32) {
    match target_width {
        Some(tw) if tw > 0 && tw < width => {
            let th = (height as f64 * tw as f64 / width as f64).round() as u32;
            (tw.max(2) & !1, th.max(2) & !1)
        }
        _ => (width, height),
    }
}

/// One open decoder producing RGB frames in presentation order.
struct DecodeSession {
    ictx: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    time_base: ffmpeg::Rational,
    start_pts: i64,
    eof: bool,
}

impl DecodeSession {
    fn open(path: &Path, output_size: Option<(u32, u32)>) -> Result<Self> {
        init_ffmpeg()?;
        let ictx = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open video: {}", path.display()))?;
        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .context("no video stream found")?;
        let stream_index = stream.index();
        let time_base = stream.time_base();
        let start_pts = match stream.start_time() {
            ts if ts == ffmpeg::ffi::AV_NOPTS_VALUE => 0,
            ts => ts,
        };

        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("failed to create decoder context")?
            .decoder()
            .video()
            .context("failed to create video decoder")?;

        let (out_w, out_h) = output_size.unwrap_or((decoder.width(), decoder.height()));
        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            out_w,
            out_h,
            ffmpeg::software::scaling::Flags::BILINEAR,
        )
        .context("failed to create scaler")?;

        Ok(Self {
            ictx,
            decoder,
            scaler,
            stream_index,
            time_base,
            start_pts,
            eof: false,
        })
    }

    fn seconds(&self, pts: i64) -> f64 {
        (pts - self.start_pts) as f64 * self.time_base.numerator() as f64
            / self.time_base.denominator().max(1) as f64
    }

    fn next_frame(&mut self) -> Result<Option<(f64, RgbImage)>> {
        loop {
            let mut decoded = ffmpeg::frame::Video::empty();
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let time = decoded
                    .timestamp()
                    .or_else(|| decoded.pts())
                    .map(|pts| self.seconds(pts))
                    .unwrap_or(0.0);
                let mut rgb = ffmpeg::frame::Video::empty();
                self.scaler
                    .run(&decoded, &mut rgb)
                    .context("failed to convert frame to RGB")?;
                return Ok(Some((time, rgb_frame_to_image(&rgb)?)));
            }
            if self.eof {
                return Ok(None);
            }
            match self.ictx.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() == self.stream_index {
                        // corrupt packets are skipped, the decoder resyncs on the next one
                        let _ = self.decoder.send_packet(&packet);
                    }
                }
                None => {
                    let _ = self.decoder.send_eof();
                    self.eof = true;
                }
            }
        }
    }
}

/// Copy an RGB24 frame row by row, honouring the line stride.
fn rgb_frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_bytes = width * 3;

    let mut buf = Vec::with_capacity(row_bytes * height);
    for y in 0..height {
        let offset = y * stride;
        let row = data
            .get(offset..offset + row_bytes)
            .context("frame buffer shorter than expected")?;
        buf.extend_from_slice(row);
    }
    RgbImage::from_raw(width as u32, height as u32, buf).context("invalid frame dimensions")
}

/// Decodes a reference video for analysis.
pub struct VideoProcessor {
    input_path: PathBuf,
}

impl VideoProcessor {
    pub fn new(input_path: impl AsRef<Path>) -> Result<Self> {
        init_ffmpeg()?;
        Ok(Self {
            input_path: input_path.as_ref().to_path_buf(),
        })
    }

    pub fn probe(&self) -> Result<VideoInfo> {
        let ictx = ffmpeg::format::input(&self.input_path)
            .with_context(|| format!("failed to open video: {}", self.input_path.display()))?;
        let stream = ictx
            .streams()
            .best(ffmpeg::media::Type::Video)
            .context("no video stream found")?;
        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .context("failed to create decoder context")?
            .decoder()
            .video()
            .context("failed to create video decoder")?;

        let rate = stream.avg_frame_rate();
        let fps = if rate.denominator() > 0 && rate.numerator() > 0 {
            rate.numerator() as f64 / rate.denominator() as f64
        } else {
            30.0
        };

        let container_duration = ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;
        let duration = if container_duration > 0.0 {
            container_duration
        } else {
            let tb = stream.time_base();
            stream.duration().max(0) as f64 * tb.numerator() as f64
                / tb.denominator().max(1) as f64
        };

        Ok(VideoInfo {
            fps,
            width: decoder.width(),
            height: decoder.height(),
            duration,
        })
    }

    /// Decode the whole stream once, handing every frame at or after the next
    /// sampling instant to `visit`. Returns the number of frames visited.
    pub fn for_each_frame<F>(
        &self,
        target_width: Option<u32>,
        sample_fps: Option<f64>,
        mut visit: F,
    ) -> Result<usize>
    where
        F: FnMut(f64, DynamicImage) -> Result<()>,
    {
        let info = self.probe()?;
        let size = scaled_size(info.width, info.height, target_width);
        let mut session = DecodeSession::open(&self.input_path, Some(size))?;

        let interval = sample_fps.filter(|f| *f > 0.0).map(|f| 1.0 / f);
        let expected = match interval {
            Some(step) => (info.duration / step).ceil() as usize,
            None => (info.duration * info.fps).ceil() as usize,
        }
        .max(1);
        let log_interval = (expected / 10).max(1);

        let started = Instant::now();
        let mut next_sample = 0.0;
        let mut visited = 0usize;
        while let Some((time, frame)) = session.next_frame()? {
            if let Some(step) = interval {
                if time + 1e-6 < next_sample {
                    continue;
                }
                next_sample = time + step;
            }
            visit(time, DynamicImage::ImageRgb8(frame))?;
            visited += 1;
            if visited % log_interval == 0 {
                let progress = (visited as f64 / expected as f64 * 100.0).min(100.0);
                info!(
                    "   📈 [decode] {:.0}% ({}/{}) | elapsed {:.1}s",
                    progress,
                    visited,
                    expected,
                    started.elapsed().as_secs_f64()
                );
            }
        }
        debug!(
            "[decode] {} frames from {} in {:.2}s",
            visited,
            self.input_path.display(),
            started.elapsed().as_secs_f64()
        );
        Ok(visited)
    }

    /// Grab frames at several instants in one sequential pass. Each slot holds
    /// the first frame at or after its time, or the last frame of the stream.
    pub fn frames_at(
        &self,
        times: &[f64],
        target_width: Option<u32>,
    ) -> Result<Vec<Option<DynamicImage>>> {
        let mut order: Vec<usize> = (0..times.len()).collect();
        order.sort_by(|a, b| times[*a].total_cmp(&times[*b]));

        let info = self.probe()?;
        let size = scaled_size(info.width, info.height, target_width);
        let mut session = DecodeSession::open(&self.input_path, Some(size))?;
        let tolerance = 0.5 / info.fps.max(1.0);

        let mut out: Vec<Option<DynamicImage>> = vec![None; times.len()];
        let mut cursor = 0;
        let mut last: Option<RgbImage> = None;
        while cursor < order.len() {
            let Some((t, frame)) = session.next_frame()? else {
                break;
            };
            while cursor < order.len() && t + tolerance >= times[order[cursor]] {
                out[order[cursor]] = Some(DynamicImage::ImageRgb8(frame.clone()));
                cursor += 1;
            }
            last = Some(frame);
        }
        if let Some(frame) = last {
            for idx in &order[cursor..] {
                out[*idx] = Some(DynamicImage::ImageRgb8(frame.clone()));
            }
        }
        Ok(out)
    }
}

/// Sequential reader used by the renderer to pull frames of a video layer.
pub struct VideoFrameReader {
    session: DecodeSession,
    current: Option<RgbImage>,
    pending: Option<(f64, RgbImage)>,
    exhausted: bool,
}

impl VideoFrameReader {
    /// Open `path`, decoding at `output_size` when given.
    pub fn open(path: &Path, output_size: Option<(u32, u32)>) -> Result<Self> {
        let session = DecodeSession::open(path, output_size)?;
        let mut reader = Self {
            session,
            current: None,
            pending: None,
            exhausted: false,
        };
        reader.pending = reader.session.next_frame()?;
        if reader.pending.is_none() {
            anyhow::bail!("video has no decodable frames: {}", path.display());
        }
        Ok(reader)
    }

    /// Native frame size of a video file.
    pub fn dimensions(path: &Path) -> Result<(u32, u32)> {
        let info = VideoProcessor::new(path)?.probe()?;
        Ok((info.width, info.height))
    }

    /// Frame showing at `time` seconds from the start of the clip; holds the
    /// last frame once the clip runs out.
    pub fn frame_at(&mut self, time: f64) -> Result<&RgbImage> {
        while !self.exhausted {
            match self.pending.take() {
                Some((t, frame)) if t <= time + 1e-6 || self.current.is_none() => {
                    self.current = Some(frame);
                    self.pending = self.session.next_frame()?;
                    if self.pending.is_none() {
                        self.exhausted = true;
                    }
                }
                Some(pending) => {
                    self.pending = Some(pending);
                    break;
                }
                None => self.exhausted = true,
            }
        }
        self.current.as_ref().context("video reader has no frame")
    }

    /// Last frame handed out, if any.
    pub fn into_last_frame(self) -> Option<RgbImage> {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_size_keeps_aspect_and_even_dims() {
        assert_eq!(scaled_size(1080, 1920, Some(320)), (320, 568));
        assert_eq!(scaled_size(640, 360, Some(321)), (320, 180));
        assert_eq!(scaled_size(200, 100, Some(400)), (200, 100));
        assert_eq!(scaled_size(200, 100, None), (200, 100));
    }

    #[test]
    fn test_missing_file_fails_to_probe() {
        let processor = VideoProcessor::new("/nonexistent/video.mp4").unwrap();
        assert!(processor.probe().is_err());
    }
}
