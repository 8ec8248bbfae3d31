use anyhow::Result;
use image::DynamicImage;

/// Neutral palette used when clustering cannot run.
pub const FALLBACK_PALETTE: [&str; 5] = ["#000000", "#FFFFFF", "#808080", "#FF0000", "#00FF00"];

/// Palette of a frame plus whether it is the fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct Palette {
    pub colors: Vec<String>,
    pub fallback: bool,
}

/// K-means colour clustering over a frame's pixels.
#[derive(Debug, Clone)]
pub struct PaletteExtractor {
    k: usize,
    max_samples: usize,
    iterations: usize,
}

impl PaletteExtractor {
    pub fn new(k: usize) -> Self {
        Self {
            k: k.max(1),
            max_samples: 10_000,
            iterations: 20,
        }
    }

    /// Always returns exactly `k` `#RRGGBB` colours, largest cluster first.
    pub fn extract(&self, frame: &DynamicImage) -> Palette {
        match self.cluster(frame) {
            Ok(colors) => Palette {
                colors,
                fallback: false,
            },
            Err(e) => {
                tracing::warn!("⚠️  [palette] clustering failed, using fallback: {}", e);
                Palette {
                    colors: fallback_palette(self.k),
                    fallback: true,
                }
            }
        }
    }

    fn cluster(&self, frame: &DynamicImage) -> Result<Vec<String>> {
        let rgb = frame.to_rgb8();
        let total = (rgb.width() as usize) * (rgb.height() as usize);
        if total == 0 {
            anyhow::bail!("frame has no pixels");
        }

        let step = (total / self.max_samples).max(1);
        let samples: Vec<[f32; 3]> = rgb
            .pixels()
            .step_by(step)
            .map(|p| [p[0] as f32, p[1] as f32, p[2] as f32])
            .collect();

        // seed from evenly spaced luminance quantiles so runs are repeatable
        let mut by_luma = samples.clone();
        by_luma.sort_by(|a, b| luma(a).total_cmp(&luma(b)));
        let mut centroids: Vec<[f32; 3]> = (0..self.k)
            .map(|i| by_luma[((2 * i + 1) * by_luma.len()) / (2 * self.k)])
            .collect();

        let mut assignment = vec![0usize; samples.len()];
        for _ in 0..self.iterations {
            let mut changed = false;
            for (slot, sample) in assignment.iter_mut().zip(samples.iter()) {
                let nearest = nearest_centroid(sample, &centroids);
                if *slot != nearest {
                    *slot = nearest;
                    changed = true;
                }
            }

            let mut sums = vec![[0f64; 3]; self.k];
            let mut counts = vec![0usize; self.k];
            for (cluster, sample) in assignment.iter().zip(samples.iter()) {
                counts[*cluster] += 1;
                for c in 0..3 {
                    sums[*cluster][c] += sample[c] as f64;
                }
            }
            for (i, centroid) in centroids.iter_mut().enumerate() {
                if counts[i] > 0 {
                    let n = counts[i] as f64;
                    *centroid = [
                        (sums[i][0] / n) as f32,
                        (sums[i][1] / n) as f32,
                        (sums[i][2] / n) as f32,
                    ];
                }
            }
            if !changed {
                break;
            }
        }

        let mut counts = vec![0usize; self.k];
        for cluster in &assignment {
            counts[*cluster] += 1;
        }
        let mut order: Vec<usize> = (0..self.k).collect();
        order.sort_by(|a, b| {
            counts[*b]
                .cmp(&counts[*a])
                .then_with(|| luma(&centroids[*a]).total_cmp(&luma(&centroids[*b])))
        });

        Ok(order.into_iter().map(|i| to_hex(&centroids[i])).collect())
    }
}

/// The fallback palette cycled or truncated to `k` entries.
pub fn fallback_palette(k: usize) -> Vec<String> {
    FALLBACK_PALETTE
        .iter()
        .cycle()
        .take(k.max(1))
        .map(|c| c.to_string())
        .collect()
}

fn luma(c: &[f32; 3]) -> f32 {
    0.299 * c[0] + 0.587 * c[1] + 0.114 * c[2]
}

fn nearest_centroid(sample: &[f32; 3], centroids: &[[f32; 3]]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::MAX;
    for (i, c) in centroids.iter().enumerate() {
        let d = (sample[0] - c[0]).powi(2) + (sample[1] - c[1]).powi(2) + (sample[2] - c[2]).powi(2);
        if d < best_dist {
            best_dist = d;
            best = i;
        }
    }
    best
}

fn to_hex(c: &[f32; 3]) -> String {
    let channel = |v: f32| v.round().clamp(0.0, 255.0) as u8;
    format!("#{:02X}{:02X}{:02X}", channel(c[0]), channel(c[1]), channel(c[2]))
}

/// Parse `#RRGGBB` (or `RRGGBB`) into RGB.
pub fn parse_hex(color: &str) -> Option<[u8; 3]> {
    let hex = color.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some([channel(0)?, channel(2)?, channel(4)?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn is_hex_color(s: &str) -> bool {
        s.len() == 7
            && s.starts_with('#')
            && s[1..].chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
    }

    fn banded() -> DynamicImage {
        // 50% red, 30% green, 20% blue
        DynamicImage::ImageRgb8(RgbImage::from_fn(100, 100, |x, _| match x {
            0..=49 => Rgb([220, 20, 20]),
            50..=79 => Rgb([20, 200, 40]),
            _ => Rgb([30, 40, 210]),
        }))
    }

    #[test]
    fn test_palette_shape_k5() {
        let palette = PaletteExtractor::new(5).extract(&banded());
        assert!(!palette.fallback);
        assert_eq!(palette.colors.len(), 5);
        assert!(palette.colors.iter().all(|c| is_hex_color(c)), "{:?}", palette.colors);
    }

    #[test]
    fn test_palette_ordered_by_cluster_size() {
        let palette = PaletteExtractor::new(3).extract(&banded());
        assert_eq!(palette.colors, vec!["#DC1414", "#14C828", "#1E28D2"]);
    }

    #[test]
    fn test_empty_frame_uses_fallback() {
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        let palette = PaletteExtractor::new(5).extract(&empty);
        assert!(palette.fallback);
        assert_eq!(palette.colors, FALLBACK_PALETTE.map(String::from).to_vec());
        assert_eq!(fallback_palette(7).len(), 7);
        assert_eq!(fallback_palette(2), vec!["#000000", "#FFFFFF"]);
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("#FF8000"), Some([255, 128, 0]));
        assert_eq!(parse_hex("ff8000"), Some([255, 128, 0]));
        assert_eq!(parse_hex("#FFF"), None);
    }
}
