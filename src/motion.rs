//! Camera motion between two consecutive frames of a shot.
//!
//! Sparse corners (Shi-Tomasi) are tracked with pyramidal Lucas-Kanade.
//! Too few trackable corners means the frame is too flat to say much, so a
//! whole-frame difference ratio is used instead and the estimate is marked
//! degraded.

use image::DynamicImage;

use crate::recipe::{MotionKind, ShotMotion};

/// Minimum tracked points for a flow-based estimate
pub const MIN_TRACKED_POINTS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct MotionEstimate {
    pub motion: ShotMotion,
    pub tracked_points: usize,
    /// Flow was underdetermined and the pixel-difference fallback was used
    pub degraded: bool,
}

#[derive(Debug, Clone)]
pub struct MotionClassifier {
    /// Mean displacement (px) below which the shot is static
    pub static_threshold: f64,
    pub max_corners: usize,
    pub quality_level: f32,
    pub min_distance: f32,
    pub block_size: usize,
    pub window: usize,
    pub pyramid_levels: usize,
    /// Fallback: per-pixel change counted as motion above this level
    pub fallback_pixel_delta: f32,
    /// Fallback: changed-pixel ratio above which the shot is a pan
    pub fallback_ratio: f64,
}

impl Default for MotionClassifier {
    fn default() -> Self {
        Self {
            static_threshold: 1.0,
            max_corners: 200,
            quality_level: 0.01,
            min_distance: 7.0,
            block_size: 7,
            window: 21,
            pyramid_levels: 3,
            fallback_pixel_delta: 30.0,
            fallback_ratio: 0.1,
        }
    }
}

#[derive(Clone)]
struct GrayF {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl GrayF {
    fn from_image(img: &DynamicImage) -> Self {
        let gray = img.to_luma8();
        Self {
            width: gray.width() as usize,
            height: gray.height() as usize,
            data: gray.into_raw().into_iter().map(f32::from).collect(),
        }
    }

    fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    /// Bilinear sample, clamped to the border
    fn sample(&self, x: f32, y: f32) -> f32 {
        let max_x = (self.width - 1) as f32;
        let max_y = (self.height - 1) as f32;
        let x = x.clamp(0.0, max_x);
        let y = y.clamp(0.0, max_y);
        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let x1 = (x0 + 1).min(self.width - 1);
        let y1 = (y0 + 1).min(self.height - 1);
        let fx = x - x0 as f32;
        let fy = y - y0 as f32;
        let top = self.at(x0, y0) * (1.0 - fx) + self.at(x1, y0) * fx;
        let bottom = self.at(x0, y1) * (1.0 - fx) + self.at(x1, y1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    fn half(&self) -> Self {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let sx = (x * 2).min(self.width - 1);
                let sy = (y * 2).min(self.height - 1);
                let sx1 = (sx + 1).min(self.width - 1);
                let sy1 = (sy + 1).min(self.height - 1);
                data.push(
                    (self.at(sx, sy) + self.at(sx1, sy) + self.at(sx, sy1) + self.at(sx1, sy1))
                        / 4.0,
                );
            }
        }
        Self {
            width,
            height,
            data,
        }
    }
}

impl MotionClassifier {
    pub fn classify(&self, frame_a: &DynamicImage, frame_b: &DynamicImage) -> MotionEstimate {
        let a = GrayF::from_image(frame_a);
        let b = GrayF::from_image(frame_b);

        if a.width != b.width || a.height != b.height || a.width < 8 || a.height < 8 {
            return self.fallback(&a, &b, 0);
        }

        let corners = self.good_features(&a);
        let tracks = self.track(&a, &b, &corners);
        if tracks.len() < MIN_TRACKED_POINTS {
            return self.fallback(&a, &b, tracks.len());
        }

        let n = tracks.len() as f64;
        let (sum_dx, sum_dy) = tracks.iter().fold((0.0, 0.0), |(sx, sy), (p, q)| {
            (sx + (q.0 - p.0) as f64, sy + (q.1 - p.1) as f64)
        });
        let dx = sum_dx / n;
        let dy = sum_dy / n;
        let magnitude = (dx * dx + dy * dy).sqrt();
        let zoom = radial_scale(&tracks);
        // displacement a point at the typical radius sees from the scale change
        let radial = (zoom - 1.0).abs() * mean_radius(&tracks);

        let kind = if radial >= self.static_threshold && radial > magnitude {
            MotionKind::Zoom
        } else if magnitude < self.static_threshold {
            MotionKind::Static
        } else if dx.abs() > dy.abs() {
            MotionKind::PanHorizontal
        } else {
            MotionKind::PanVertical
        };

        MotionEstimate {
            motion: ShotMotion {
                kind,
                intensity: magnitude.max(radial),
                pan_x: dx,
                pan_y: dy,
                zoom,
            },
            tracked_points: tracks.len(),
            degraded: false,
        }
    }

    fn fallback(&self, a: &GrayF, b: &GrayF, tracked_points: usize) -> MotionEstimate {
        let ratio = if a.width == b.width && a.height == b.height && !a.data.is_empty() {
            let changed = a
                .data
                .iter()
                .zip(b.data.iter())
                .filter(|(p, q)| (*p - *q).abs() > self.fallback_pixel_delta)
                .count();
            changed as f64 / a.data.len() as f64
        } else {
            1.0
        };
        let kind = if ratio > self.fallback_ratio {
            MotionKind::Pan
        } else {
            MotionKind::Static
        };
        MotionEstimate {
            motion: ShotMotion {
                kind,
                intensity: ratio,
                ..ShotMotion::default()
            },
            tracked_points,
            degraded: true,
        }
    }

    /// Shi-Tomasi corners, strongest first, spaced at least `min_distance` apart.
    fn good_features(&self, img: &GrayF) -> Vec<(f32, f32)> {
        let (w, h) = (img.width, img.height);
        let margin = self.window / 2 + 2;
        if w <= 2 * margin || h <= 2 * margin {
            return Vec::new();
        }

        let mut ix = vec![0f32; w * h];
        let mut iy = vec![0f32; w * h];
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                ix[y * w + x] = (img.at(x + 1, y) - img.at(x - 1, y)) / 2.0;
                iy[y * w + x] = (img.at(x, y + 1) - img.at(x, y - 1)) / 2.0;
            }
        }

        let r = self.block_size / 2;
        let mut scored = Vec::new();
        let mut best = 0f32;
        for y in margin..h - margin {
            for x in margin..w - margin {
                let (mut sxx, mut sxy, mut syy) = (0f32, 0f32, 0f32);
                for yy in y - r..=y + r {
                    for xx in x - r..=x + r {
                        let gx = ix[yy * w + xx];
                        let gy = iy[yy * w + xx];
                        sxx += gx * gx;
                        sxy += gx * gy;
                        syy += gy * gy;
                    }
                }
                let half_trace = (sxx + syy) / 2.0;
                let min_eig = half_trace - (((sxx - syy) / 2.0).powi(2) + sxy * sxy).sqrt();
                if min_eig > 0.0 {
                    best = best.max(min_eig);
                    scored.push((min_eig, x, y));
                }
            }
        }
        if best <= 0.0 {
            return Vec::new();
        }

        let floor = best * self.quality_level;
        scored.retain(|(score, _, _)| *score >= floor);
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let min_dist_sq = self.min_distance * self.min_distance;
        let mut corners: Vec<(f32, f32)> = Vec::new();
        for (_, x, y) in scored {
            let (x, y) = (x as f32, y as f32);
            if corners
                .iter()
                .all(|(cx, cy)| (cx - x).powi(2) + (cy - y).powi(2) >= min_dist_sq)
            {
                corners.push((x, y));
                if corners.len() >= self.max_corners {
                    break;
                }
            }
        }
        corners
    }

    /// Pyramidal Lucas-Kanade; returns (old, new) pairs for points that tracked.
    fn track(
        &self,
        a: &GrayF,
        b: &GrayF,
        points: &[(f32, f32)],
    ) -> Vec<((f32, f32), (f32, f32))> {
        let half = (self.window / 2) as i32;
        let mut pyr_a = vec![a.clone()];
        let mut pyr_b = vec![b.clone()];
        for _ in 0..self.pyramid_levels {
            let (Some(last_a), Some(last_b)) = (pyr_a.last(), pyr_b.last()) else {
                break;
            };
            if last_a.width / 2 < self.window || last_a.height / 2 < self.window {
                break;
            }
            let (next_a, next_b) = (last_a.half(), last_b.half());
            pyr_a.push(next_a);
            pyr_b.push(next_b);
        }

        let mut tracks = Vec::new();
        'points: for &(px, py) in points {
            let mut guess = (0f32, 0f32);
            let mut flow = (0f32, 0f32);
            for level in (0..pyr_a.len()).rev() {
                let scale = (1usize << level) as f32;
                let (la, lb) = (&pyr_a[level], &pyr_b[level]);
                let (cx, cy) = (px / scale, py / scale);

                let mut patch = Vec::with_capacity(((2 * half + 1) * (2 * half + 1)) as usize);
                let (mut gxx, mut gxy, mut gyy) = (0f32, 0f32, 0f32);
                for dy in -half..=half {
                    for dx in -half..=half {
                        let (x, y) = (cx + dx as f32, cy + dy as f32);
                        let gx = (la.sample(x + 1.0, y) - la.sample(x - 1.0, y)) / 2.0;
                        let gy = (la.sample(x, y + 1.0) - la.sample(x, y - 1.0)) / 2.0;
                        gxx += gx * gx;
                        gxy += gx * gy;
                        gyy += gy * gy;
                        patch.push((x, y, la.sample(x, y), gx, gy));
                    }
                }
                let det = gxx * gyy - gxy * gxy;
                let area = patch.len() as f32;
                let min_eig = (gxx + gyy) / 2.0 - (((gxx - gyy) / 2.0).powi(2) + gxy * gxy).sqrt();
                if det.abs() < f32::EPSILON || min_eig / area < 1e-2 {
                    if level == 0 {
                        continue 'points;
                    }
                    guess = (guess.0 * 2.0, guess.1 * 2.0);
                    continue;
                }

                let mut v = (0f32, 0f32);
                for _ in 0..20 {
                    let (mut bx, mut by) = (0f32, 0f32);
                    for &(x, y, value, gx, gy) in &patch {
                        let diff = value - lb.sample(x + guess.0 + v.0, y + guess.1 + v.1);
                        bx += diff * gx;
                        by += diff * gy;
                    }
                    let ex = (gyy * bx - gxy * by) / det;
                    let ey = (gxx * by - gxy * bx) / det;
                    v = (v.0 + ex, v.1 + ey);
                    if ex * ex + ey * ey < 1e-4 {
                        break;
                    }
                }

                if level == 0 {
                    flow = (guess.0 + v.0, guess.1 + v.1);
                } else {
                    guess = ((guess.0 + v.0) * 2.0, (guess.1 + v.1) * 2.0);
                }
            }

            let (nx, ny) = (px + flow.0, py + flow.1);
            if !flow.0.is_finite()
                || !flow.1.is_finite()
                || nx < 0.0
                || ny < 0.0
                || nx > (a.width - 1) as f32
                || ny > (a.height - 1) as f32
            {
                continue;
            }

            let mut residual = 0f32;
            let mut count = 0f32;
            for dy in -half..=half {
                for dx in -half..=half {
                    let (x, y) = (px + dx as f32, py + dy as f32);
                    residual += (a.sample(x, y) - b.sample(x + flow.0, y + flow.1)).abs();
                    count += 1.0;
                }
            }
            if residual / count < 20.0 {
                tracks.push(((px, py), (nx, ny)));
            }
        }
        tracks
    }
}

/// Mean distance of the starting points from their centroid.
fn mean_radius(tracks: &[((f32, f32), (f32, f32))]) -> f64 {
    if tracks.is_empty() {
        return 0.0;
    }
    let n = tracks.len() as f64;
    let (cx, cy) = tracks
        .iter()
        .fold((0.0, 0.0), |(sx, sy), ((px, py), _)| (sx + *px as f64, sy + *py as f64));
    let (cx, cy) = (cx / n, cy / n);
    tracks
        .iter()
        .map(|((px, py), _)| ((*px as f64 - cx).powi(2) + (*py as f64 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n
}

/// Least-squares scale of the tracked point cloud about its centroid.
fn radial_scale(tracks: &[((f32, f32), (f32, f32))]) -> f64 {
    let n = tracks.len() as f64;
    if n < 2.0 {
        return 1.0;
    }
    let (mut ox, mut oy, mut nx, mut ny) = (0f64, 0f64, 0f64, 0f64);
    for ((px, py), (qx, qy)) in tracks {
        ox += *px as f64;
        oy += *py as f64;
        nx += *qx as f64;
        ny += *qy as f64;
    }
    let (ox, oy, nx, ny) = (ox / n, oy / n, nx / n, ny / n);
    let (mut num, mut den) = (0f64, 0f64);
    for ((px, py), (qx, qy)) in tracks {
        let (ax, ay) = (*px as f64 - ox, *py as f64 - oy);
        let (bx, by) = (*qx as f64 - nx, *qy as f64 - ny);
        num += ax * bx + ay * by;
        den += ax * ax + ay * ay;
    }
    if den > 0.0 {
        num / den
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, GrayImage};

    fn texture(shift_x: f32, shift_y: f32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_fn(160, 120, |x, y| {
            let fx = x as f32 - shift_x;
            let fy = y as f32 - shift_y;
            let v = 128.0 + 60.0 * (fx * 0.21).sin() * (fy * 0.17).cos()
                + 30.0 * (fx * 0.05 + fy * 0.07).sin();
            Luma([v.clamp(0.0, 255.0) as u8])
        }))
    }

    #[test]
    fn test_identical_frames_are_static() {
        let frame = texture(0.0, 0.0);
        let estimate = MotionClassifier::default().classify(&frame, &frame);
        assert!(!estimate.degraded);
        assert!(estimate.tracked_points >= MIN_TRACKED_POINTS);
        assert_eq!(estimate.motion.kind, MotionKind::Static);
    }

    #[test]
    fn test_horizontal_translation_is_a_horizontal_pan() {
        let estimate = MotionClassifier::default().classify(&texture(0.0, 0.0), &texture(3.0, 0.0));
        assert!(!estimate.degraded);
        assert_eq!(estimate.motion.kind, MotionKind::PanHorizontal);
        assert!((estimate.motion.pan_x - 3.0).abs() < 0.5, "pan_x = {}", estimate.motion.pan_x);
    }

    #[test]
    fn test_vertical_translation_is_a_vertical_pan() {
        let estimate = MotionClassifier::default().classify(&texture(0.0, 0.0), &texture(0.0, -4.0));
        assert_eq!(estimate.motion.kind, MotionKind::PanVertical);
        assert!(estimate.motion.pan_y < 0.0);
    }

    fn zoomed_texture(scale: f32) -> DynamicImage {
        let (cx, cy) = (80.0, 60.0);
        DynamicImage::ImageLuma8(GrayImage::from_fn(160, 120, |x, y| {
            let fx = (x as f32 - cx) / scale + cx;
            let fy = (y as f32 - cy) / scale + cy;
            let v = 128.0 + 60.0 * (fx * 0.21).sin() * (fy * 0.17).cos()
                + 30.0 * (fx * 0.05 + fy * 0.07).sin();
            Luma([v.clamp(0.0, 255.0) as u8])
        }))
    }

    #[test]
    fn test_scale_change_is_a_zoom() {
        let estimate = MotionClassifier::default().classify(&zoomed_texture(1.0), &zoomed_texture(1.05));
        assert!(!estimate.degraded);
        assert_eq!(estimate.motion.kind, MotionKind::Zoom);
        assert!(estimate.motion.zoom > 1.02, "zoom = {}", estimate.motion.zoom);
    }

    #[test]
    fn test_translation_is_not_mistaken_for_zoom() {
        let estimate = MotionClassifier::default().classify(&texture(0.0, 0.0), &texture(3.0, 0.0));
        assert!((estimate.motion.zoom - 1.0).abs() < 0.01, "zoom = {}", estimate.motion.zoom);
        assert_ne!(estimate.motion.kind, MotionKind::Zoom);
    }

    #[test]
    fn test_flat_frames_fall_back_and_flag_degradation() {
        let dark = DynamicImage::ImageLuma8(GrayImage::from_pixel(160, 120, Luma([20])));
        let bright = DynamicImage::ImageLuma8(GrayImage::from_pixel(160, 120, Luma([200])));

        let changed = MotionClassifier::default().classify(&dark, &bright);
        assert!(changed.degraded);
        assert_eq!(changed.motion.kind, MotionKind::Pan);

        let same = MotionClassifier::default().classify(&dark, &dark);
        assert!(same.degraded);
        assert_eq!(same.motion.kind, MotionKind::Static);
    }
}
