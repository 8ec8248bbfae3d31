//! Caption rasterization.
//!
//! Text is laid out into an alpha mask first (word wrap, centred lines) and
//! only then composited with its panel and shadow. A TrueType font is used
//! when one can be loaded; otherwise a built-in 5x7 bitmap face keeps
//! placeholders and captions legible.

use anyhow::{anyhow, Context, Result};
use fontdue::layout::{
    CoordinateSystem, GlyphRasterConfig, HorizontalAlign, Layout, LayoutSettings, TextStyle as FontStyle,
    VerticalAlign, WrapStyle,
};
use fontdue::{Font, FontSettings};
use image::RgbImage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::compose::{anchor, blend_pixel, fill_rounded_rect};
use crate::palette::parse_hex;
use crate::recipe::TextStyle;

/// Fonts tried when none is configured.
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/opentype/noto/NotoSansCJK-Bold.ttc",
    "/usr/share/fonts/truetype/noto/NotoSansKR-Bold.ttf",
    "/usr/share/fonts/truetype/nanum/NanumGothicBold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/TTF/DejaVuSans-Bold.ttf",
    "/System/Library/Fonts/AppleSDGothicNeo.ttc",
    "/Library/Fonts/Arial Unicode.ttf",
];

/// 8-bit coverage of a block of text.
#[derive(Debug, Clone, PartialEq)]
pub struct TextMask {
    pub width: u32,
    pub height: u32,
    pub alpha: Vec<u8>,
}

impl TextMask {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            alpha: vec![0; (width * height) as usize],
        }
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.alpha[(y * self.width + x) as usize]
    }

    fn stamp(&mut self, x: i64, y: i64, value: u8) {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return;
        }
        let idx = (y as u32 * self.width + x as u32) as usize;
        self.alpha[idx] = self.alpha[idx].max(value);
    }

    pub fn is_empty(&self) -> bool {
        self.alpha.iter().all(|a| *a == 0)
    }

    /// Crop to the covered area.
    fn trimmed(self) -> Self {
        let (mut x0, mut y0, mut x1, mut y1) = (u32::MAX, u32::MAX, 0, 0);
        for y in 0..self.height {
            for x in 0..self.width {
                if self.get(x, y) > 0 {
                    x0 = x0.min(x);
                    y0 = y0.min(y);
                    x1 = x1.max(x);
                    y1 = y1.max(y);
                }
            }
        }
        if x0 > x1 {
            return Self::new(0, 0);
        }
        let mut out = Self::new(x1 - x0 + 1, y1 - y0 + 1);
        for y in y0..=y1 {
            for x in x0..=x1 {
                out.alpha[((y - y0) * out.width + (x - x0)) as usize] = self.get(x, y);
            }
        }
        out
    }
}

pub struct TextRenderer {
    font: Option<Font>,
    glyphs: HashMap<GlyphRasterConfig, Vec<u8>>,
}

impl TextRenderer {
    /// Configured font, then well-known system fonts, then the bitmap face.
    pub fn load(font_path: Option<&Path>) -> Self {
        let mut candidates: Vec<PathBuf> = font_path.map(Path::to_path_buf).into_iter().collect();
        candidates.extend(SYSTEM_FONTS.iter().map(PathBuf::from));

        for path in candidates.iter().filter(|p| p.is_file()) {
            match Self::from_file(path) {
                Ok(renderer) => {
                    debug!("🔤 [render] using font {}", path.display());
                    return renderer;
                }
                Err(e) => warn!("⚠️  [render] skipping font {}: {:#}", path.display(), e),
            }
        }
        if font_path.is_some() {
            warn!("⚠️  [render] configured font unusable, falling back to bitmap text");
        }
        Self::bitmap_only()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        let font = Font::from_bytes(bytes, FontSettings::default())
            .map_err(|e| anyhow!("failed to parse font {}: {}", path.display(), e))?;
        Ok(Self {
            font: Some(font),
            glyphs: HashMap::new(),
        })
    }

    pub fn bitmap_only() -> Self {
        Self {
            font: None,
            glyphs: HashMap::new(),
        }
    }

    /// Lay out `text` wrapped to `max_width` pixels with centred lines.
    pub fn rasterize(&mut self, text: &str, size: f32, max_width: u32) -> TextMask {
        let max_width = max_width.max(1);
        if self.font.is_some() {
            self.rasterize_font(text, size, max_width)
        } else {
            rasterize_bitmap(text, size, max_width)
        }
    }

    fn rasterize_font(&mut self, text: &str, size: f32, max_width: u32) -> TextMask {
        let Self { font, glyphs } = self;
        let Some(font) = font.as_ref() else {
            return TextMask::new(0, 0);
        };

        let mut layout = Layout::new(CoordinateSystem::PositiveYDown);
        layout.reset(&LayoutSettings {
            x: 0.0,
            y: 0.0,
            max_width: Some(max_width as f32),
            max_height: None,
            horizontal_align: HorizontalAlign::Center,
            vertical_align: VerticalAlign::Top,
            line_height: 1.15,
            wrap_style: WrapStyle::Word,
            wrap_hard_breaks: true,
        });
        layout.append(&[font], &FontStyle::new(text, size, 0));

        let height = layout.height().ceil().max(1.0) as u32 + size as u32;
        let mut mask = TextMask::new(max_width, height);
        for glyph in layout.glyphs() {
            if glyph.width == 0 || glyph.height == 0 {
                continue;
            }
            let bitmap = glyphs
                .entry(glyph.key)
                .or_insert_with(|| font.rasterize_config(glyph.key).1);
            let (gx, gy) = (glyph.x.round() as i64, glyph.y.round() as i64);
            for row in 0..glyph.height {
                for col in 0..glyph.width {
                    let value = bitmap[row * glyph.width + col];
                    if value > 0 {
                        mask.stamp(gx + col as i64, gy + row as i64, value);
                    }
                }
            }
        }
        mask.trimmed()
    }

    /// Draw `text` onto `frame` with the panel and shadow `style` asks for.
    pub fn draw(&mut self, frame: &mut RgbImage, text: &str, style: &TextStyle) {
        let max_width = (frame.width() as f32 * style.max_width.clamp(0.1, 1.0)) as u32;
        let mask = self.rasterize(text, style.size, max_width);
        composite_text(frame, &mask, style);
    }
}

/// Composite a rasterized block: rounded panel, drop shadow, then glyphs.
pub fn composite_text(frame: &mut RgbImage, mask: &TextMask, style: &TextStyle) {
    if mask.width == 0 || mask.height == 0 {
        return;
    }
    let padding = (style.size * 0.45).round().max(4.0) as u32;
    let box_w = mask.width + padding * 2;
    let box_h = mask.height + padding * 2;
    let (box_x, box_y) = anchor(style.position, frame.dimensions(), (box_w, box_h));

    if style.panel {
        let color = parse_hex(&style.panel_color).unwrap_or([0, 0, 0]);
        let radius = padding.min(box_h / 2);
        fill_rounded_rect(
            frame,
            (box_x, box_y, box_w, box_h),
            radius,
            color,
            style.panel_opacity.clamp(0.0, 1.0),
        );
    }

    let text_x = box_x + padding as i64;
    let text_y = box_y + padding as i64;
    if style.shadow {
        let offset = (style.size / 18.0).round().max(2.0) as i64;
        stamp_mask(frame, mask, text_x + offset, text_y + offset, [0, 0, 0], 0.6);
    }
    let color = parse_hex(&style.color).unwrap_or([255, 255, 255]);
    stamp_mask(frame, mask, text_x, text_y, color, 1.0);
}

fn stamp_mask(frame: &mut RgbImage, mask: &TextMask, x: i64, y: i64, color: [u8; 3], opacity: f32) {
    for my in 0..mask.height {
        for mx in 0..mask.width {
            let value = mask.get(mx, my);
            if value == 0 {
                continue;
            }
            blend_pixel(
                frame,
                x + mx as i64,
                y + my as i64,
                color,
                value as f32 / 255.0 * opacity,
            );
        }
    }
}

fn rasterize_bitmap(text: &str, size: f32, max_width: u32) -> TextMask {
    let scale = (size / 7.0).round().max(1.0) as u32;
    let advance = 6 * scale;
    let line_height = 9 * scale;
    let max_chars = (max_width / advance).max(1) as usize;

    let mut lines: Vec<String> = Vec::new();
    for paragraph in text.lines() {
        let mut line = String::new();
        for word in paragraph.split_whitespace() {
            let mut word = word.to_string();
            // words longer than a line are broken by characters
            while word.chars().count() > max_chars {
                if !line.is_empty() {
                    lines.push(std::mem::take(&mut line));
                }
                let head: String = word.chars().take(max_chars).collect();
                word = word.chars().skip(max_chars).collect();
                lines.push(head);
            }
            let needed = line.chars().count() + usize::from(!line.is_empty()) + word.chars().count();
            if !line.is_empty() && needed > max_chars {
                lines.push(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(&word);
        }
        if !line.is_empty() {
            lines.push(line);
        }
    }

    let mut mask = TextMask::new(max_width, (lines.len() as u32 * line_height).max(1));
    for (row, line) in lines.iter().enumerate() {
        let line_width = line.chars().count() as u32 * advance;
        let x0 = (max_width.saturating_sub(line_width) / 2) as i64;
        let y0 = (row as u32 * line_height) as i64;
        for (i, c) in line.chars().enumerate() {
            if c == ' ' {
                continue;
            }
            let glyph = bitmap_glyph(c);
            for (gy, bits) in glyph.iter().enumerate() {
                for gx in 0..5u32 {
                    if bits & (0x10 >> gx) == 0 {
                        continue;
                    }
                    for sy in 0..scale {
                        for sx in 0..scale {
                            mask.stamp(
                                x0 + (i as u32 * advance + gx * scale + sx) as i64,
                                y0 + (gy as u32 * scale + sy) as i64,
                                255,
                            );
                        }
                    }
                }
            }
        }
    }
    mask.trimmed()
}

/// 5x7 glyph rows, high bit on the left. Unknown characters draw as a box.
fn bitmap_glyph(c: char) -> [u8; 7] {
    match c.to_ascii_uppercase() {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        ',' => [0x00, 0x00, 0x00, 0x00, 0x0C, 0x04, 0x08],
        '!' => [0x04, 0x04, 0x04, 0x04, 0x04, 0x00, 0x04],
        '?' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '+' => [0x00, 0x04, 0x04, 0x1F, 0x04, 0x04, 0x00],
        '%' => [0x18, 0x19, 0x02, 0x04, 0x08, 0x13, 0x03],
        '\'' => [0x04, 0x04, 0x08, 0x00, 0x00, 0x00, 0x00],
        '/' => [0x01, 0x01, 0x02, 0x04, 0x08, 0x10, 0x10],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        '(' => [0x02, 0x04, 0x08, 0x08, 0x08, 0x04, 0x02],
        ')' => [0x08, 0x04, 0x02, 0x02, 0x02, 0x04, 0x08],
        '#' => [0x0A, 0x0A, 0x1F, 0x0A, 0x1F, 0x0A, 0x0A],
        '&' => [0x0C, 0x12, 0x14, 0x08, 0x15, 0x12, 0x0D],
        _ => [0x1F, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1F],
    }
}
