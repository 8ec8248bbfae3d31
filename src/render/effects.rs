//! Whole-frame overlay effects applied after the base layer.

use image::{imageops, RgbImage};

use crate::recipe::Overlay;

/// Precomputed per-pixel darkening for a fixed canvas size.
pub struct VignetteMask {
    width: u32,
    height: u32,
    factors: Vec<f32>,
}

impl VignetteMask {
    pub fn new(width: u32, height: u32, strength: f32) -> Self {
        let strength = strength.clamp(0.0, 1.0);
        let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
        let max_r2 = cx * cx + cy * cy;
        let mut factors = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                let dx = x as f32 + 0.5 - cx;
                let dy = y as f32 + 0.5 - cy;
                let r2 = (dx * dx + dy * dy) / max_r2.max(1.0);
                factors.push(1.0 - strength * r2);
            }
        }
        Self {
            width,
            height,
            factors,
        }
    }

    pub fn apply(&self, frame: &mut RgbImage) {
        if frame.dimensions() != (self.width, self.height) {
            return;
        }
        for (pixel, factor) in frame.pixels_mut().zip(&self.factors) {
            for c in pixel.0.iter_mut() {
                *c = (*c as f32 * factor).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}

/// Monochrome film grain. Noise is a hash of pixel position and frame
/// index, so the same frame always gets the same grain.
pub fn apply_grain(frame: &mut RgbImage, amount: f32, frame_index: u64) {
    let amplitude = amount.clamp(0.0, 1.0) * 255.0;
    if amplitude <= 0.0 {
        return;
    }
    let width = frame.width() as u64;
    for (i, pixel) in frame.pixels_mut().enumerate() {
        let (x, y) = (i as u64 % width, i as u64 / width);
        let noise = hash_noise(x, y, frame_index) * amplitude;
        for c in pixel.0.iter_mut() {
            *c = (*c as f32 + noise).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Uniform noise in [-0.5, 0.5).
fn hash_noise(x: u64, y: u64, seed: u64) -> f32 {
    let mut h = x
        .wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(y.wrapping_mul(0xC2B2_AE3D_27D4_EB4F))
        .wrapping_add(seed.wrapping_mul(0x1656_67B1_9E37_79F9));
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    h ^= h >> 33;
    (h >> 40) as f32 / (1u64 << 24) as f32 - 0.5
}

/// Bloom around pixels brighter than `threshold`.
pub fn apply_glow(frame: &mut RgbImage, threshold: u8, intensity: f32) {
    let intensity = intensity.clamp(0.0, 2.0);
    if intensity <= 0.0 {
        return;
    }
    let (w, h) = frame.dimensions();
    let (sw, sh) = ((w / 8).max(1), (h / 8).max(1));

    let mut bright = imageops::resize(frame, sw, sh, imageops::FilterType::Triangle);
    for pixel in bright.pixels_mut() {
        let luma = 0.299 * pixel.0[0] as f32 + 0.587 * pixel.0[1] as f32 + 0.114 * pixel.0[2] as f32;
        if luma < threshold as f32 {
            pixel.0 = [0, 0, 0];
        }
    }
    let blurred = imageops::blur(&bright, 2.0);
    let halo = imageops::resize(&blurred, w, h, imageops::FilterType::Triangle);

    for (pixel, glow) in frame.pixels_mut().zip(halo.pixels()) {
        for c in 0..3 {
            let value = pixel.0[c] as f32 + glow.0[c] as f32 * intensity;
            pixel.0[c] = value.round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// Global overlays prepared once per render.
pub struct EffectChain {
    steps: Vec<Step>,
}

enum Step {
    Vignette(VignetteMask),
    Grain(f32),
    Glow { threshold: u8, intensity: f32 },
}

impl EffectChain {
    /// Unknown overlay kinds are skipped; the count is returned alongside.
    pub fn new(overlays: &[Overlay], canvas: (u32, u32)) -> (Self, usize) {
        let mut skipped = 0;
        let steps = overlays
            .iter()
            .filter_map(|overlay| match overlay {
                Overlay::Vignette { strength } => {
                    Some(Step::Vignette(VignetteMask::new(canvas.0, canvas.1, *strength)))
                }
                Overlay::Grain { amount } => Some(Step::Grain(*amount)),
                Overlay::Glow {
                    threshold,
                    intensity,
                } => Some(Step::Glow {
                    threshold: *threshold,
                    intensity: *intensity,
                }),
                Overlay::Unknown => {
                    skipped += 1;
                    None
                }
            })
            .collect();
        (Self { steps }, skipped)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn apply(&self, frame: &mut RgbImage, frame_index: u64) {
        for step in &self.steps {
            match step {
                Step::Vignette(mask) => mask.apply(frame),
                Step::Grain(amount) => apply_grain(frame, *amount, frame_index),
                Step::Glow {
                    threshold,
                    intensity,
                } => apply_glow(frame, *threshold, *intensity),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_vignette_darkens_corners_more_than_centre() {
        let mut frame = RgbImage::from_pixel(64, 64, Rgb([200, 200, 200]));
        VignetteMask::new(64, 64, 0.35).apply(&mut frame);
        let centre = frame.get_pixel(32, 32).0[0];
        let corner = frame.get_pixel(0, 0).0[0];
        assert!(centre >= 198);
        assert!(corner < 140, "corner = {}", corner);
    }

    #[test]
    fn test_grain_is_deterministic_per_frame() {
        let base = RgbImage::from_pixel(32, 32, Rgb([128, 128, 128]));
        let mut a = base.clone();
        let mut b = base.clone();
        let mut c = base.clone();
        apply_grain(&mut a, 0.08, 7);
        apply_grain(&mut b, 0.08, 7);
        apply_grain(&mut c, 0.08, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, base);
    }

    #[test]
    fn test_glow_only_brightens() {
        let mut frame = RgbImage::from_fn(64, 64, |x, _| {
            if (16..48).contains(&x) {
                Rgb([255, 255, 255])
            } else {
                Rgb([40, 40, 40])
            }
        });
        let before = frame.clone();
        apply_glow(&mut frame, 200, 0.5);
        assert!(frame
            .pixels()
            .zip(before.pixels())
            .all(|(after, prior)| after.0[0] >= prior.0[0]));
        assert!(frame.get_pixel(10, 10).0[0] > 40);
    }

    #[test]
    fn test_chain_skips_unknown_overlays() {
        let overlays = vec![Overlay::vignette(), Overlay::Unknown, Overlay::grain()];
        let (chain, skipped) = EffectChain::new(&overlays, (16, 16));
        assert_eq!(skipped, 1);
        assert!(!chain.is_empty());
    }
}
