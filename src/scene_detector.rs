use anyhow::Result;
use image::DynamicImage;

use crate::recipe::Scene;

const HIST_BINS: usize = 64;

/// Per-frame features compared between neighbours
struct FrameSignature {
    width: u32,
    height: u32,
    /// Luma histogram, normalised to sum 1
    histogram: [f64; HIST_BINS],
    /// (hue 0-180, saturation 0-255, value 0-255) per pixel
    hsv: Vec<[f32; 3]>,
    /// Sobel magnitude per pixel, 0 on the border
    edges: Vec<f32>,
}

impl FrameSignature {
    fn from_image(frame: &DynamicImage) -> Self {
        let rgb = frame.to_rgb8();
        let (width, height) = rgb.dimensions();
        let pixels = (width * height) as usize;

        let mut histogram = [0f64; HIST_BINS];
        let mut luma = Vec::with_capacity(pixels);
        let mut hsv = Vec::with_capacity(pixels);
        for p in rgb.pixels() {
            let y = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
            luma.push(y);
            histogram[((y as usize).min(255) * HIST_BINS) / 256] += 1.0;
            hsv.push(rgb_to_hsv(p[0], p[1], p[2]));
        }
        let total = pixels.max(1) as f64;
        histogram.iter_mut().for_each(|h| *h /= total);

        Self {
            width,
            height,
            histogram,
            hsv,
            edges: sobel_magnitude(&luma, width as usize, height as usize),
        }
    }
}

/// RGB to OpenCV-style HSV (hue halved to 0-180)
fn rgb_to_hsv(r: u8, g: u8, b: u8) -> [f32; 3] {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let sat = if max == 0.0 { 0.0 } else { delta / max * 255.0 };
    [hue / 2.0, sat, max]
}

fn sobel_magnitude(luma: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut out = vec![0f32; luma.len()];
    if width < 3 || height < 3 {
        return out;
    }
    let at = |x: usize, y: usize| luma[y * width + x];
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x - 1, y)
                - at(x - 1, y + 1);
            let gy = at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x, y - 1)
                - at(x + 1, y - 1);
            out[y * width + x] = (gx * gx + gy * gy).sqrt();
        }
    }
    out
}

/// Shot boundary detector over a stream of decoded frames.
///
/// The content score between two frames is a weighted mix of
/// 1. luma histogram distance (global tone change),
/// 2. mean per-pixel HSV delta (colour and brightness change in place),
/// 3. edge-map delta (structural change).
///
/// It lies in 0.0-1.0; identical frames score 0.
pub struct SceneDetector {
    threshold: f64,
    min_scene_len: f64,
    previous: Option<FrameSignature>,
    boundaries: Vec<f64>,
    last_time: Option<f64>,
    frames_seen: usize,
}

impl SceneDetector {
    pub fn new(threshold: f64, min_scene_len: f64) -> Self {
        Self {
            threshold,
            min_scene_len,
            previous: None,
            boundaries: Vec::new(),
            last_time: None,
            frames_seen: 0,
        }
    }

    /// Content-change score between two frames, 0.0-1.0.
    pub fn content_score(&self, a: &DynamicImage, b: &DynamicImage) -> f64 {
        score(&FrameSignature::from_image(a), &FrameSignature::from_image(b))
    }

    /// Feed the next decoded frame in presentation order.
    pub fn push_frame(&mut self, time: f64, frame: &DynamicImage) {
        let signature = FrameSignature::from_image(frame);
        self.frames_seen += 1;

        match &self.previous {
            None => self.boundaries.push(0.0),
            Some(prev) => {
                let diff = score(prev, &signature);
                let last_cut = self.boundaries.last().copied().unwrap_or(0.0);
                // a cut only counts once the running scene is long enough
                if diff > self.threshold && time - last_cut >= self.min_scene_len {
                    tracing::debug!("[segment] cut at {:.2}s (score {:.3})", time, diff);
                    self.boundaries.push(time);
                }
            }
        }
        self.previous = Some(signature);
        self.last_time = Some(time);
    }

    /// Close the stream and return contiguous scenes covering `[0, total_duration)`.
    pub fn finish(self, total_duration: f64) -> Result<Vec<Scene>> {
        if self.frames_seen == 0 {
            anyhow::bail!("no frames decoded, cannot segment");
        }
        let end = total_duration.max(self.last_time.unwrap_or(0.0));
        if end <= 0.0 {
            anyhow::bail!("video duration is zero, cannot segment");
        }

        let mut cuts: Vec<f64> = self.boundaries.into_iter().filter(|t| *t < end).collect();
        if cuts.is_empty() {
            cuts.push(0.0);
        }
        let scenes = cuts
            .iter()
            .enumerate()
            .map(|(index, &start)| Scene {
                index,
                start_sec: start,
                end_sec: cuts.get(index + 1).copied().unwrap_or(end),
            })
            .collect();
        Ok(scenes)
    }

    /// Segment a fully decoded frame list.
    pub fn detect_scenes(
        mut self,
        frames: &[(f64, DynamicImage)],
        total_duration: f64,
    ) -> Result<Vec<Scene>> {
        for (time, frame) in frames {
            self.push_frame(*time, frame);
        }
        self.finish(total_duration)
    }
}

fn score(a: &FrameSignature, b: &FrameSignature) -> f64 {
    if a.width != b.width || a.height != b.height {
        return 1.0;
    }

    let hist = a
        .histogram
        .iter()
        .zip(b.histogram.iter())
        .map(|(x, y)| (x - y).abs())
        .sum::<f64>()
        / 2.0;

    let n = a.hsv.len().max(1) as f64;
    let (mut dh, mut ds, mut dv) = (0f64, 0f64, 0f64);
    for (p, q) in a.hsv.iter().zip(b.hsv.iter()) {
        let raw = (p[0] - q[0]).abs();
        dh += raw.min(180.0 - raw) as f64 / 90.0;
        ds += (p[1] - q[1]).abs() as f64 / 255.0;
        dv += (p[2] - q[2]).abs() as f64 / 255.0;
    }
    let hsv = ((dh + ds + dv) / (3.0 * n)).min(1.0);

    let edge_sum_a: f64 = a.edges.iter().map(|e| *e as f64).sum();
    let edge_sum_b: f64 = b.edges.iter().map(|e| *e as f64).sum();
    let edge_delta: f64 = a
        .edges
        .iter()
        .zip(b.edges.iter())
        .map(|(x, y)| (x - y).abs() as f64)
        .sum();
    let edge = if edge_sum_a + edge_sum_b > 0.0 {
        (edge_delta / (edge_sum_a + edge_sum_b)).min(1.0)
    } else {
        0.0
    };

    hist * 0.4 + hsv * 0.4 + edge * 0.2
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid_with_square(bg: [u8; 3], fg: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(64, 96, |x, y| {
            if (16..40).contains(&x) && (30..60).contains(&y) {
                Rgb(fg)
            } else {
                Rgb(bg)
            }
        }))
    }

    #[test]
    fn test_identical_frames_score_zero() {
        let detector = SceneDetector::new(0.35, 0.5);
        let frame = solid_with_square([120, 30, 30], [255, 255, 255]);
        assert_eq!(detector.content_score(&frame, &frame), 0.0);
    }

    #[test]
    fn test_hard_cut_at_five_seconds() {
        let a = solid_with_square([200, 40, 40], [255, 255, 255]);
        let b = solid_with_square([30, 60, 200], [10, 10, 10]);
        let frames: Vec<(f64, DynamicImage)> = (0..100)
            .map(|i| {
                let t = i as f64 * 0.1;
                (t, if t < 5.0 - 1e-9 { a.clone() } else { b.clone() })
            })
            .collect();

        let scenes = SceneDetector::new(0.35, 0.5)
            .detect_scenes(&frames, 10.0)
            .unwrap();
        assert_eq!(scenes.len(), 2);
        assert!((scenes[0].end_sec - 5.0).abs() <= 0.2);
        assert_eq!(scenes[0].start_sec, 0.0);
        assert_eq!(scenes[1].start_sec, scenes[0].end_sec);
        assert_eq!(scenes[1].end_sec, 10.0);
    }

    #[test]
    fn test_min_scene_len_suppresses_flicker() {
        let a = solid_with_square([200, 40, 40], [255, 255, 255]);
        let b = solid_with_square([30, 60, 200], [10, 10, 10]);
        // alternate every 0.2s; only cuts at least 1s apart survive
        let frames: Vec<(f64, DynamicImage)> = (0..30)
            .map(|i| {
                let frame = if (i / 2) % 2 == 0 { a.clone() } else { b.clone() };
                (i as f64 * 0.1, frame)
            })
            .collect();
        let scenes = SceneDetector::new(0.35, 1.0)
            .detect_scenes(&frames, 3.0)
            .unwrap();
        for scene in &scenes[..scenes.len() - 1] {
            assert!(scene.duration() >= 1.0 - 1e-9);
        }
    }

    #[test]
    fn test_zero_frames_is_an_error() {
        let result = SceneDetector::new(0.35, 0.5).detect_scenes(&[], 10.0);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_duration_is_an_error() {
        let frame = solid_with_square([0, 0, 0], [0, 0, 0]);
        let result = SceneDetector::new(0.35, 0.5).detect_scenes(&[(0.0, frame)], 0.0);
        assert!(result.is_err());
    }
}
