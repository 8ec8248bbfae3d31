//! Per-frame compositing primitives: cover-fit sampling with zoom and pan,
//! placeholders, solid panels and logo stamps.

use image::{imageops, RgbImage, RgbaImage};

use super::text::TextRenderer;
use crate::recipe::{Fit, LayerMotion, Pan, Position, TextStyle};

pub const PLACEHOLDER_BACKGROUND: [u8; 3] = [245, 245, 245];
pub const PLACEHOLDER_INK: &str = "#DC1E1E";

/// Zoom and pixel offset applied to a base layer on one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub zoom: f32,
    pub offset_x: f32,
    pub offset_y: f32,
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        zoom: 1.0,
        offset_x: 0.0,
        offset_y: 0.0,
    };
}

/// Motion at normalized shot progress `progress` (0..1).
pub fn motion_transform(motion: Option<&LayerMotion>, progress: f32) -> Transform {
    let Some(motion) = motion else {
        return Transform::IDENTITY;
    };
    let eased = motion.easing.apply(progress);
    let zoom = motion.zoom_from + (motion.zoom_to - motion.zoom_from) * eased;
    let px = motion.pan_px;
    let (offset_x, offset_y) = match motion.pan {
        Pan::Center => (0.0, 0.0),
        Pan::LeftToRight => (px * (eased - 0.5), 0.0),
        Pan::RightToLeft => (px * (0.5 - eased), 0.0),
        Pan::TopToBottom => (0.0, px * (eased - 0.5)),
        Pan::BottomToTop => (0.0, px * (0.5 - eased)),
        Pan::TopToCenter => (0.0, px * (1.0 - eased)),
    };
    Transform {
        zoom: zoom.max(0.01),
        offset_x,
        offset_y,
    }
}

/// Decode size for a video source that still covers the canvas at zoom 1.
pub fn cover_decode_size(source: (u32, u32), canvas: (u32, u32)) -> (u32, u32) {
    let (sw, sh) = (source.0.max(1) as f64, source.1.max(1) as f64);
    let scale = (canvas.0 as f64 / sw).max(canvas.1 as f64 / sh).min(1.0);
    let even = |v: f64| ((v.round() as u32) / 2 * 2).max(2);
    (even(sw * scale), even(sh * scale))
}

/// Sample `src` onto a `canvas`-sized frame. Cover fit fills both
/// dimensions and crops the excess; nothing is ever letterboxed.
pub fn render_base(src: &RgbImage, canvas: (u32, u32), fit: Fit, transform: Transform) -> RgbImage {
    let (cw, ch) = canvas;
    let (sw, sh) = src.dimensions();
    if sw == 0 || sh == 0 {
        return RgbImage::new(cw, ch);
    }
    let (base_x, base_y) = match fit {
        Fit::Cover => {
            let s = (cw as f32 / sw as f32).max(ch as f32 / sh as f32);
            (s, s)
        }
        Fit::Stretch => (cw as f32 / sw as f32, ch as f32 / sh as f32),
    };
    let scale_x = base_x * transform.zoom;
    let scale_y = base_y * transform.zoom;
    // pan only as far as the scaled source overhangs the canvas
    let margin_x = ((sw as f32 * scale_x - cw as f32) / 2.0).max(0.0);
    let margin_y = ((sh as f32 * scale_y - ch as f32) / 2.0).max(0.0);
    let offset_x = transform.offset_x.clamp(-margin_x, margin_x);
    let offset_y = transform.offset_y.clamp(-margin_y, margin_y);

    let raw = src.as_raw();
    let stride = sw as usize * 3;
    let max_x = (sw - 1) as f32;
    let max_y = (sh - 1) as f32;
    let mut out = vec![0u8; cw as usize * ch as usize * 3];

    for y in 0..ch {
        let fy = ((y as f32 + 0.5 - ch as f32 / 2.0 - offset_y) / scale_y + sh as f32 / 2.0
            - 0.5)
            .clamp(0.0, max_y);
        let y0 = fy.floor() as usize;
        let y1 = (y0 + 1).min(sh as usize - 1);
        let wy = fy - y0 as f32;
        for x in 0..cw {
            let fx = ((x as f32 + 0.5 - cw as f32 / 2.0 - offset_x) / scale_x
                + sw as f32 / 2.0
                - 0.5)
                .clamp(0.0, max_x);
            let x0 = fx.floor() as usize;
            let x1 = (x0 + 1).min(sw as usize - 1);
            let wx = fx - x0 as f32;

            let dst = (y as usize * cw as usize + x as usize) * 3;
            for c in 0..3 {
                let p00 = raw[y0 * stride + x0 * 3 + c] as f32;
                let p10 = raw[y0 * stride + x1 * 3 + c] as f32;
                let p01 = raw[y1 * stride + x0 * 3 + c] as f32;
                let p11 = raw[y1 * stride + x1 * 3 + c] as f32;
                let top = p00 + (p10 - p00) * wx;
                let bottom = p01 + (p11 - p01) * wx;
                out[dst + c] = (top + (bottom - top) * wy).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    RgbImage::from_raw(cw, ch, out).unwrap_or_else(|| RgbImage::new(cw, ch))
}

/// Visible stand-in for a base layer that could not be resolved.
pub fn placeholder(canvas: (u32, u32), role: &str, text: &mut TextRenderer) -> RgbImage {
    let (w, h) = canvas;
    let mut frame = RgbImage::from_pixel(w, h, image::Rgb(PLACEHOLDER_BACKGROUND));

    let border = (w.min(h) / 90).max(2);
    let ink = [220, 30, 30];
    for y in 0..h {
        for x in 0..w {
            if x < border || y < border || x >= w - border || y >= h - border {
                frame.put_pixel(x, y, image::Rgb(ink));
            }
        }
    }

    let style = TextStyle {
        size: (w as f32 / 14.0).max(12.0),
        color: PLACEHOLDER_INK.to_string(),
        position: Position::Center,
        max_width: 0.8,
        panel: false,
        shadow: false,
        ..TextStyle::default()
    };
    text.draw(&mut frame, &format!("Missing: {}", role), &style);
    frame
}

pub fn blend_pixel(frame: &mut RgbImage, x: i64, y: i64, color: [u8; 3], alpha: f32) {
    if x < 0 || y < 0 || x >= frame.width() as i64 || y >= frame.height() as i64 || alpha <= 0.0 {
        return;
    }
    let alpha = alpha.min(1.0);
    let pixel = frame.get_pixel_mut(x as u32, y as u32);
    for c in 0..3 {
        let dst = pixel.0[c] as f32;
        pixel.0[c] = (dst + (color[c] as f32 - dst) * alpha).round() as u8;
    }
}

/// Fill a rounded rectangle `(x, y, w, h)` at `opacity`.
pub fn fill_rounded_rect(
    frame: &mut RgbImage,
    rect: (i64, i64, u32, u32),
    radius: u32,
    color: [u8; 3],
    opacity: f32,
) {
    let (rx, ry, rw, rh) = rect;
    let r = radius.min(rw / 2).min(rh / 2) as f32;
    for dy in 0..rh {
        for dx in 0..rw {
            // distance outside the rounded corner, if in a corner square
            let cx = if (dx as f32) < r {
                r - dx as f32 - 0.5
            } else if dx as f32 >= rw as f32 - r {
                dx as f32 + 0.5 - (rw as f32 - r)
            } else {
                0.0
            };
            let cy = if (dy as f32) < r {
                r - dy as f32 - 0.5
            } else if dy as f32 >= rh as f32 - r {
                dy as f32 + 0.5 - (rh as f32 - r)
            } else {
                0.0
            };
            let coverage = if cx > 0.0 && cy > 0.0 {
                (r - (cx * cx + cy * cy).sqrt() + 0.5).clamp(0.0, 1.0)
            } else {
                1.0
            };
            blend_pixel(frame, rx + dx as i64, ry + dy as i64, color, opacity * coverage);
        }
    }
}

/// Top-left corner for a block of `size` placed at `position`.
pub fn anchor(position: Position, frame: (u32, u32), size: (u32, u32)) -> (i64, i64) {
    let (fw, fh) = (frame.0 as i64, frame.1 as i64);
    let (w, h) = (size.0 as i64, size.1 as i64);
    let margin_x = fw * 5 / 100;
    let margin_y = fh * 8 / 100;
    let center_x = (fw - w) / 2;
    let center_y = (fh - h) / 2;
    match position {
        Position::Top => (center_x, margin_y),
        Position::Center => (center_x, center_y),
        Position::Bottom => (center_x, fh - margin_y - h),
        Position::TopLeft => (margin_x, margin_y),
        Position::TopRight => (fw - margin_x - w, margin_y),
        Position::BottomLeft => (margin_x, fh - margin_y - h),
        Position::BottomRight => (fw - margin_x - w, fh - margin_y - h),
    }
}

pub fn fill_solid(frame: &mut RgbImage, color: [u8; 3], opacity: f32) {
    let alpha = opacity.clamp(0.0, 1.0);
    if alpha <= 0.0 {
        return;
    }
    for pixel in frame.pixels_mut() {
        for c in 0..3 {
            let dst = pixel.0[c] as f32;
            pixel.0[c] = (dst + (color[c] as f32 - dst) * alpha).round() as u8;
        }
    }
}

/// Scale a logo to `scale` of the canvas width.
pub fn prepare_logo(logo: &RgbaImage, canvas_width: u32, scale: f32) -> RgbaImage {
    let target_w = ((canvas_width as f32 * scale.clamp(0.01, 1.0)).round() as u32).max(1);
    let target_h = ((logo.height() as f32 * target_w as f32 / logo.width().max(1) as f32).round() as u32).max(1);
    imageops::resize(logo, target_w, target_h, imageops::FilterType::Triangle)
}

pub fn stamp_logo(frame: &mut RgbImage, logo: &RgbaImage, position: Position) {
    let (x0, y0) = anchor(position, frame.dimensions(), logo.dimensions());
    for (x, y, pixel) in logo.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        blend_pixel(frame, x0 + x as i64, y0 + y as i64, [r, g, b], a as f32 / 255.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::Easing;
    use image::{Rgb, Rgba};

    fn split_image() -> RgbImage {
        RgbImage::from_fn(200, 100, |x, _| {
            if x < 100 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        })
    }

    #[test]
    fn test_cover_fit_crops_instead_of_letterboxing() {
        let frame = render_base(&split_image(), (100, 100), Fit::Cover, Transform::IDENTITY);
        assert_eq!(frame.dimensions(), (100, 100));
        assert_eq!(frame.get_pixel(10, 50).0, [255, 0, 0]);
        assert_eq!(frame.get_pixel(90, 50).0, [0, 0, 255]);
        assert!(frame.pixels().all(|p| p.0 != [0, 0, 0]));
    }

    #[test]
    fn test_stretch_fit_keeps_whole_source() {
        let frame = render_base(&split_image(), (50, 100), Fit::Stretch, Transform::IDENTITY);
        assert_eq!(frame.get_pixel(5, 50).0, [255, 0, 0]);
        assert_eq!(frame.get_pixel(45, 50).0, [0, 0, 255]);
    }

    fn row_gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |_, y| Rgb([y as u8, 0, 0]))
    }

    fn distinct_rows(frame: &RgbImage) -> bool {
        (1..frame.height()).all(|y| frame.get_pixel(0, y).0 != frame.get_pixel(0, y - 1).0)
    }

    #[test]
    fn test_pan_never_runs_past_the_source_edge() {
        let src = row_gradient(90, 160);
        let motion = LayerMotion {
            zoom_from: 1.0,
            zoom_to: 1.02,
            pan: Pan::TopToCenter,
            pan_px: 28.0,
            easing: Easing::EaseOut,
        };
        let transform = motion_transform(Some(&motion), 0.0);
        assert!((transform.offset_y - 28.0).abs() < 1e-6);

        let frame = render_base(&src, (90, 160), Fit::Cover, transform);
        assert!(distinct_rows(&frame));
        assert_eq!(frame.get_pixel(0, 0).0[0], 0);
        assert_eq!(frame.get_pixel(0, 159).0[0], 159);
    }

    #[test]
    fn test_pan_uses_the_overhang_of_a_zoomed_source() {
        let src = row_gradient(90, 160);
        let zoomed = Transform {
            zoom: 1.25,
            ..Transform::IDENTITY
        };
        let still = render_base(&src, (90, 160), Fit::Cover, zoomed);
        let panned = render_base(
            &src,
            (90, 160),
            Fit::Cover,
            Transform {
                offset_y: 500.0,
                ..zoomed
            },
        );
        assert_ne!(panned.get_pixel(0, 1).0, panned.get_pixel(0, 0).0);
        // pushed down to the top of the source, not beyond it
        assert!(panned.get_pixel(0, 80).0[0] < still.get_pixel(0, 80).0[0]);
        assert!(panned.get_pixel(0, 0).0[0] <= 1);
    }

    #[test]
    fn test_motion_transform_endpoints() {
        let motion = LayerMotion {
            zoom_from: 1.0,
            zoom_to: 1.2,
            pan: Pan::LeftToRight,
            pan_px: 40.0,
            easing: Easing::Linear,
        };
        let start = motion_transform(Some(&motion), 0.0);
        let end = motion_transform(Some(&motion), 1.0);
        assert!((start.zoom - 1.0).abs() < 1e-6);
        assert!((end.zoom - 1.2).abs() < 1e-6);
        assert!((start.offset_x + 20.0).abs() < 1e-6);
        assert!((end.offset_x - 20.0).abs() < 1e-6);
        assert_eq!(motion_transform(None, 0.5), Transform::IDENTITY);
    }

    #[test]
    fn test_placeholder_signature() {
        let mut text = TextRenderer::bitmap_only();
        let frame = placeholder((120, 200), "store", &mut text);
        let background = frame
            .pixels()
            .filter(|p| p.0 == PLACEHOLDER_BACKGROUND)
            .count();
        let ink = frame.pixels().filter(|p| p.0[0] > 150 && p.0[1] < 100).count();
        assert!(background > frame.pixels().len() / 2);
        assert!(ink > 0);
    }

    #[test]
    fn test_logo_stamp_respects_alpha() {
        let mut frame = RgbImage::from_pixel(100, 100, Rgb([0, 0, 0]));
        let logo = RgbaImage::from_fn(10, 10, |x, _| {
            if x < 5 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([255, 255, 255, 0])
            }
        });
        stamp_logo(&mut frame, &logo, Position::TopLeft);
        let (x0, y0) = anchor(Position::TopLeft, (100, 100), (10, 10));
        assert_eq!(frame.get_pixel(x0 as u32, y0 as u32).0, [255, 255, 255]);
        assert_eq!(frame.get_pixel(x0 as u32 + 7, y0 as u32).0, [0, 0, 0]);
    }

    #[test]
    fn test_decode_size_never_upscales() {
        assert_eq!(cover_decode_size((3840, 2160), (1080, 1920)), (3412, 1920));
        assert_eq!(cover_decode_size((640, 360), (1080, 1920)), (640, 360));
    }
}
