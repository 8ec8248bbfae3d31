//! Recipe document model.
//!
//! A recipe describes the output canvas, the asset roles it needs and an
//! ordered shot timeline. Documents written by earlier sessions use looser
//! shapes (`shots` instead of `timeline`, `in`/`out` instead of `t`, bare
//! path strings for assets); all of them deserialize into the same typed
//! model here.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub const RECIPE_VERSION: &str = "0.1";

/// Time values closer than this are treated as equal.
pub const TIME_EPSILON: f64 = 1e-6;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "webm", "mkv", "avi"];

// ---------------------------------------------------------------------------
// Analysis records
// ---------------------------------------------------------------------------

/// One contiguous segment of the reference video.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub index: usize,
    pub start_sec: f64,
    pub end_sec: f64,
}

impl Scene {
    pub fn duration(&self) -> f64 {
        self.end_sec - self.start_sec
    }

    pub fn midpoint(&self) -> f64 {
        self.start_sec + self.duration() / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionKind {
    #[default]
    Static,
    Pan,
    PanHorizontal,
    PanVertical,
    Zoom,
}

/// Camera motion measured between two frames of a shot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShotMotion {
    #[serde(rename = "type", default)]
    pub kind: MotionKind,
    #[serde(default)]
    pub intensity: f64,
    #[serde(default)]
    pub pan_x: f64,
    #[serde(default)]
    pub pan_y: f64,
    #[serde(default = "unit_zoom")]
    pub zoom: f64,
}

fn unit_zoom() -> f64 {
    1.0
}

impl Default for ShotMotion {
    fn default() -> Self {
        Self {
            kind: MotionKind::Static,
            intensity: 0.0,
            pan_x: 0.0,
            pan_y: 0.0,
            zoom: 1.0,
        }
    }
}

/// A located piece of on-screen text. `bbox` is `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBox {
    pub text: String,
    pub bbox: [u32; 4],
    pub confidence: f64,
}

/// Per-shot output of the analysis stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShotAnalysis {
    pub motion: ShotMotion,
    pub palette: Vec<String>,
    pub text_boxes: Vec<TextBox>,
    /// Representative frame saved during segmentation.
    pub thumb: Option<PathBuf>,
    /// Signal degradations observed while analysing this shot.
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTrack {
    pub bpm: f64,
    #[serde(default)]
    pub beats: Vec<f64>,
}

impl AudioTrack {
    pub const DEFAULT_BPM: f64 = 120.0;

    pub fn fallback() -> Self {
        Self {
            bpm: Self::DEFAULT_BPM,
            beats: Vec::new(),
        }
    }
}

impl Default for AudioTrack {
    fn default() -> Self {
        Self::fallback()
    }
}

/// Facts about the reference video a recipe was derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub fps: f64,
    pub size: [u32; 2],
    pub duration: f64,
    pub total_shots: usize,
}

// ---------------------------------------------------------------------------
// Canvas and assets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Canvas {
    #[serde(alias = "w", default = "default_width")]
    pub width: u32,
    #[serde(alias = "h", default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_bitrate")]
    pub bitrate: String,
}

fn default_width() -> u32 {
    1080
}

fn default_height() -> u32 {
    1920
}

fn default_fps() -> u32 {
    30
}

fn default_bitrate() -> String {
    "4M".to_string()
}

impl Default for Canvas {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            bitrate: default_bitrate(),
        }
    }
}

impl Canvas {
    /// Bitrate in bits per second; accepts `4M`, `2500k` or a plain number.
    pub fn bitrate_bps(&self) -> Option<u64> {
        let raw = self.bitrate.trim();
        let (digits, multiplier) = match raw.chars().last()? {
            'k' | 'K' => (&raw[..raw.len() - 1], 1_000.0),
            'm' | 'M' => (&raw[..raw.len() - 1], 1_000_000.0),
            _ => (raw, 1.0),
        };
        let value: f64 = digits.trim().parse().ok()?;
        if value.is_finite() && value > 0.0 {
            Some((value * multiplier) as u64)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Image,
    Video,
}

impl AssetKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            AssetKind::Video
        } else {
            AssetKind::Image
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub role: String,
    #[serde(rename = "physical_path", alias = "path")]
    pub path: PathBuf,
    pub kind: AssetKind,
}

impl AssetDescriptor {
    pub fn new(role: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            role: role.into(),
            kind: AssetKind::from_path(&path),
            path,
        }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

/// Asset map entries as found in stored documents.
#[derive(Deserialize)]
#[serde(untagged)]
enum AssetEntry {
    Path(PathBuf),
    Full {
        #[serde(default)]
        role: Option<String>,
        #[serde(rename = "physical_path", alias = "path")]
        path: PathBuf,
        #[serde(default)]
        kind: Option<AssetKind>,
    },
}

fn deserialize_assets<'de, D>(deserializer: D) -> Result<BTreeMap<String, AssetDescriptor>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, Option<AssetEntry>> = BTreeMap::deserialize(deserializer)?;
    let assets = raw
        .into_iter()
        .filter_map(|(key, entry)| {
            // a null entry declares the role without a file
            let descriptor = match entry? {
                AssetEntry::Path(path) if path.as_os_str().is_empty() => return None,
                AssetEntry::Path(path) => AssetDescriptor::new(key.clone(), path),
                AssetEntry::Full { role, path, kind } => AssetDescriptor {
                    role: role.unwrap_or_else(|| key.clone()),
                    kind: kind.unwrap_or_else(|| AssetKind::from_path(&path)),
                    path,
                },
            };
            Some((key, descriptor))
        })
        .collect();
    Ok(assets)
}

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fit {
    /// Fill the canvas preserving aspect ratio, cropping the excess.
    #[default]
    Cover,
    /// Fill the canvas ignoring aspect ratio.
    Stretch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Pan {
    #[default]
    Center,
    LeftToRight,
    RightToLeft,
    TopToBottom,
    BottomToTop,
    TopToCenter,
}

impl From<String> for Pan {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "lr" | "left_to_right" => Pan::LeftToRight,
            "rl" | "right_to_left" => Pan::RightToLeft,
            "tb" | "top_to_bottom" => Pan::TopToBottom,
            "bt" | "bottom_to_top" => Pan::BottomToTop,
            "top_to_center" => Pan::TopToCenter,
            _ => Pan::Center,
        }
    }
}

impl From<Pan> for String {
    fn from(pan: Pan) -> Self {
        match pan {
            Pan::Center => "center",
            Pan::LeftToRight => "left_to_right",
            Pan::RightToLeft => "right_to_left",
            Pan::TopToBottom => "top_to_bottom",
            Pan::BottomToTop => "bottom_to_top",
            Pan::TopToCenter => "top_to_center",
        }
        .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Easing {
    Linear,
    #[default]
    EaseOut,
    EaseInOut,
}

impl Easing {
    pub fn apply(&self, t: f32) -> f32 {
        let p = t.clamp(0.0, 1.0);
        match self {
            Easing::Linear => p,
            Easing::EaseOut => 1.0 - (1.0 - p).powi(3),
            Easing::EaseInOut => {
                if p < 0.5 {
                    4.0 * p * p * p
                } else {
                    1.0 - (-2.0 * p + 2.0).powi(3) / 2.0
                }
            }
        }
    }
}

/// Per-frame zoom and pan for a video/image layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LayerMotion {
    #[serde(default = "unit_zoom_f32")]
    pub zoom_from: f32,
    #[serde(default = "unit_zoom_f32", alias = "scale")]
    pub zoom_to: f32,
    #[serde(default)]
    pub pan: Pan,
    /// Pan travel in canvas pixels.
    #[serde(default = "default_pan_px")]
    pub pan_px: f32,
    #[serde(default)]
    pub easing: Easing,
}

fn unit_zoom_f32() -> f32 {
    1.0
}

fn default_pan_px() -> f32 {
    28.0
}

impl Default for LayerMotion {
    fn default() -> Self {
        Self {
            zoom_from: 1.0,
            zoom_to: 1.0,
            pan: Pan::Center,
            pan_px: default_pan_px(),
            easing: Easing::EaseOut,
        }
    }
}

impl LayerMotion {
    /// Slow push-in used for product shots.
    pub fn ken_burns() -> Self {
        Self {
            zoom_from: 1.04,
            zoom_to: 1.12,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    Top,
    Center,
    #[default]
    Bottom,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<PathBuf>,
    #[serde(default = "default_font_size")]
    pub size: f32,
    #[serde(default = "default_text_color")]
    pub color: String,
    #[serde(default)]
    pub position: Position,
    /// Wrap width as a fraction of the canvas width.
    #[serde(default = "default_max_width")]
    pub max_width: f32,
    #[serde(default = "default_true")]
    pub panel: bool,
    #[serde(default = "default_panel_color")]
    pub panel_color: String,
    #[serde(default = "default_panel_opacity")]
    pub panel_opacity: f32,
    #[serde(default = "default_true")]
    pub shadow: bool,
}

fn default_font_size() -> f32 {
    54.0
}

fn default_text_color() -> String {
    "#FFFFFF".to_string()
}

fn default_max_width() -> f32 {
    0.86
}

fn default_true() -> bool {
    true
}

fn default_panel_color() -> String {
    "#000000".to_string()
}

fn default_panel_opacity() -> f32 {
    0.55
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            font: None,
            size: default_font_size(),
            color: default_text_color(),
            position: Position::Bottom,
            max_width: default_max_width(),
            panel: true,
            panel_color: default_panel_color(),
            panel_opacity: default_panel_opacity(),
            shadow: true,
        }
    }
}

fn default_opacity() -> f32 {
    1.0
}

fn default_logo_scale() -> f32 {
    0.18
}

fn default_logo_position() -> Position {
    Position::TopRight
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Layer {
    Video {
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
        #[serde(default)]
        fit: Fit,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        motion: Option<LayerMotion>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dur: Option<f64>,
    },
    Image {
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
        #[serde(default)]
        fit: Fit,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        motion: Option<LayerMotion>,
    },
    Text {
        text: String,
        #[serde(default)]
        style: TextStyle,
    },
    Solid {
        #[serde(default = "default_panel_color")]
        color: String,
        #[serde(default = "default_opacity")]
        opacity: f32,
    },
    Logo {
        #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
        #[serde(default = "default_logo_position")]
        position: Position,
        #[serde(default = "default_logo_scale")]
        scale: f32,
    },
    #[serde(other)]
    Unknown,
}

impl Layer {
    pub fn video(role: impl Into<String>) -> Self {
        Layer::Video {
            role: Some(role.into()),
            fit: Fit::Cover,
            motion: None,
            dur: None,
        }
    }

    pub fn image(role: impl Into<String>) -> Self {
        Layer::Image {
            role: Some(role.into()),
            fit: Fit::Cover,
            motion: None,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Layer::Text {
            text: text.into(),
            style: TextStyle::default(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Layer::Video { .. } => "video",
            Layer::Image { .. } => "image",
            Layer::Text { .. } => "text",
            Layer::Solid { .. } => "solid",
            Layer::Logo { .. } => "logo",
            Layer::Unknown => "unknown",
        }
    }

    /// Asset role this layer points at, if any.
    pub fn role(&self) -> Option<&str> {
        match self {
            Layer::Video { role, .. } | Layer::Image { role, .. } | Layer::Logo { role, .. } => {
                role.as_deref().filter(|r| !r.trim().is_empty())
            }
            _ => None,
        }
    }

    pub fn requires_ref(&self) -> bool {
        matches!(self, Layer::Video { .. } | Layer::Image { .. } | Layer::Logo { .. })
    }

    /// Video and image layers compete for the base slot.
    pub fn is_base_candidate(&self) -> bool {
        matches!(self, Layer::Video { .. } | Layer::Image { .. })
    }

    pub fn motion(&self) -> Option<&LayerMotion> {
        match self {
            Layer::Video { motion, .. } | Layer::Image { motion, .. } => motion.as_ref(),
            _ => None,
        }
    }

    pub fn with_motion(mut self, new_motion: LayerMotion) -> Self {
        if let Layer::Video { motion, .. } | Layer::Image { motion, .. } = &mut self {
            *motion = Some(new_motion);
        }
        self
    }
}

/// Effects applied to every shot after its base layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Overlay {
    Vignette {
        #[serde(default = "default_vignette")]
        strength: f32,
    },
    Grain {
        #[serde(default = "default_grain")]
        amount: f32,
    },
    Glow {
        #[serde(default = "default_glow_threshold")]
        threshold: u8,
        #[serde(default = "default_glow_intensity")]
        intensity: f32,
    },
    #[serde(other)]
    Unknown,
}

fn default_vignette() -> f32 {
    0.35
}

fn default_grain() -> f32 {
    0.08
}

fn default_glow_threshold() -> u8 {
    200
}

fn default_glow_intensity() -> f32 {
    0.25
}

impl Overlay {
    pub fn vignette() -> Self {
        Overlay::Vignette {
            strength: default_vignette(),
        }
    }

    pub fn grain() -> Self {
        Overlay::Grain {
            amount: default_grain(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Transition {
    Cut,
    Fade,
    Dissolve,
    /// Let the renderer pick: cut for the first shot, fade elsewhere.
    #[default]
    Auto,
}

impl From<String> for Transition {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cut" | "none" | "hard" => Transition::Cut,
            "fade" | "fade_black" => Transition::Fade,
            "dissolve" | "cross" | "crossfade" | "xfade" => Transition::Dissolve,
            _ => Transition::Auto,
        }
    }
}

impl From<Transition> for String {
    fn from(t: Transition) -> Self {
        match t {
            Transition::Cut => "cut",
            Transition::Fade => "fade",
            Transition::Dissolve => "dissolve",
            Transition::Auto => "auto",
        }
        .to_string()
    }
}

/// Which time representations a shot carries on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeForms {
    /// Only `t: [start, end]`.
    Interval,
    /// Only `in` / `out`.
    Legacy,
    Both,
    /// Neither form was present.
    Missing,
    /// Both forms were present and disagreed; `t` was kept.
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TimeSpan {
    start: f64,
    end: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Shot {
    span: TimeSpan,
    forms: TimeForms,
    pub transition_in: Transition,
    /// Overrides the configured transition fraction for this boundary.
    pub transition_fraction: Option<f64>,
    pub motion: ShotMotion,
    pub palette: Vec<String>,
    pub text_boxes: Vec<TextBox>,
    pub layers: Vec<Layer>,
    pub needs: Vec<String>,
    pub caption: Option<String>,
    pub thumb: Option<PathBuf>,
}

impl Shot {
    pub fn new(start: f64, end: f64) -> Self {
        Self {
            span: TimeSpan { start, end },
            forms: TimeForms::Both,
            transition_in: Transition::Auto,
            transition_fraction: None,
            motion: ShotMotion::default(),
            palette: Vec::new(),
            text_boxes: Vec::new(),
            layers: Vec::new(),
            needs: Vec::new(),
            caption: None,
            thumb: None,
        }
    }

    pub fn start(&self) -> f64 {
        self.span.start
    }

    pub fn end(&self) -> f64 {
        self.span.end
    }

    pub fn duration(&self) -> f64 {
        self.span.end - self.span.start
    }

    /// The `t` form.
    pub fn interval(&self) -> (f64, f64) {
        (self.span.start, self.span.end)
    }

    /// The legacy `(in, out)` form, derived from the same span.
    pub fn legacy_pair(&self) -> (f64, f64) {
        (self.span.start, self.span.end)
    }

    pub fn set_interval(&mut self, start: f64, end: f64) {
        self.span = TimeSpan { start, end };
    }

    pub fn set_legacy_pair(&mut self, in_sec: f64, out_sec: f64) {
        self.span = TimeSpan {
            start: in_sec,
            end: out_sec,
        };
    }

    pub fn time_forms(&self) -> TimeForms {
        self.forms
    }

    /// Make both time forms present. Returns the forms held before.
    pub fn sync_time_forms(&mut self) -> TimeForms {
        std::mem::replace(&mut self.forms, TimeForms::Both)
    }

    pub fn base_layer_roles(&self) -> impl Iterator<Item = &str> {
        self.layers
            .iter()
            .filter(|l| l.is_base_candidate())
            .filter_map(|l| l.role())
    }

    /// Caption text for subtitles: explicit caption first, else the first text layer.
    pub fn caption_text(&self) -> Option<&str> {
        self.caption
            .as_deref()
            .or_else(|| {
                self.layers.iter().find_map(|l| match l {
                    Layer::Text { text, .. } => Some(text.as_str()),
                    _ => None,
                })
            })
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= TIME_EPSILON
}

/// Wire shape of a shot.
#[derive(Serialize, Deserialize)]
struct ShotDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    t: Option<[f64; 2]>,
    #[serde(rename = "in", alias = "t0", default, skip_serializing_if = "Option::is_none")]
    in_sec: Option<f64>,
    #[serde(rename = "out", alias = "t1", default, skip_serializing_if = "Option::is_none")]
    out_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dur: Option<f64>,
    #[serde(default, alias = "transition")]
    transition_in: Transition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transition_fraction: Option<f64>,
    #[serde(default)]
    motion: ShotMotion,
    #[serde(default)]
    palette: Vec<String>,
    #[serde(default)]
    text_boxes: Vec<TextBox>,
    #[serde(default)]
    layers: Vec<Layer>,
    #[serde(default)]
    needs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thumb: Option<PathBuf>,
}

impl From<ShotDoc> for Shot {
    fn from(doc: ShotDoc) -> Self {
        let legacy_end = doc
            .out_sec
            .or_else(|| doc.in_sec.zip(doc.dur).map(|(start, dur)| start + dur));
        let legacy = doc.in_sec.map(|start| (start, legacy_end.unwrap_or(start)));

        let (span, forms) = match (doc.t, legacy) {
            (Some([start, end]), Some((in_sec, out_sec))) => {
                let forms = if approx_eq(start, in_sec) && approx_eq(end, out_sec) {
                    TimeForms::Both
                } else {
                    TimeForms::Conflict
                };
                (TimeSpan { start, end }, forms)
            }
            (Some([start, end]), None) => (TimeSpan { start, end }, TimeForms::Interval),
            (None, Some((start, end))) => (TimeSpan { start, end }, TimeForms::Legacy),
            (None, None) => (TimeSpan { start: 0.0, end: 0.0 }, TimeForms::Missing),
        };

        Shot {
            span,
            forms,
            transition_in: doc.transition_in,
            transition_fraction: doc.transition_fraction,
            motion: doc.motion,
            palette: doc.palette,
            text_boxes: doc.text_boxes,
            layers: doc.layers,
            needs: doc.needs,
            caption: doc.caption,
            thumb: doc.thumb,
        }
    }
}

impl From<Shot> for ShotDoc {
    fn from(shot: Shot) -> Self {
        let TimeSpan { start, end } = shot.span;
        let interval = matches!(
            shot.forms,
            TimeForms::Interval | TimeForms::Both | TimeForms::Conflict
        );
        let legacy = matches!(shot.forms, TimeForms::Legacy | TimeForms::Both);
        ShotDoc {
            t: interval.then_some([start, end]),
            in_sec: legacy.then_some(start),
            out_sec: legacy.then_some(end),
            dur: (shot.forms == TimeForms::Both).then_some(end - start),
            transition_in: shot.transition_in,
            transition_fraction: shot.transition_fraction,
            motion: shot.motion,
            palette: shot.palette,
            text_boxes: shot.text_boxes,
            layers: shot.layers,
            needs: shot.needs,
            caption: shot.caption,
            thumb: shot.thumb,
        }
    }
}

impl Serialize for Shot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ShotDoc::from(self.clone()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Shot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        ShotDoc::deserialize(deserializer).map(Shot::from)
    }
}

// ---------------------------------------------------------------------------
// Warnings and checklist
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    MotionUnderdetermined,
    AudioFallback,
    PaletteFallback,
    TextLocatorFallback,
    TimeMissing,
    TimeConflict,
    DurationRepaired,
    AssetScarcity,
    AssetUnresolved,
    Note,
}

/// A non-fatal degradation, optionally tied to a shot index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Warning {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shot: Option<usize>,
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn shot(index: usize, kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            shot: Some(index),
            kind,
            message: message.into(),
        }
    }

    pub fn global(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            shot: None,
            kind,
            message: message.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WarningDoc {
    Text(String),
    Full {
        #[serde(default)]
        shot: Option<usize>,
        kind: WarningKind,
        message: String,
    },
}

impl<'de> Deserialize<'de> for Warning {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match WarningDoc::deserialize(deserializer)? {
            WarningDoc::Text(message) => Warning::global(WarningKind::Note, message),
            WarningDoc::Full {
                shot,
                kind,
                message,
            } => Warning {
                shot,
                kind,
                message,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub desc: String,
    pub required: bool,
    #[serde(default)]
    pub frequency: usize,
}

// ---------------------------------------------------------------------------
// Recipe
// ---------------------------------------------------------------------------

fn default_version() -> String {
    RECIPE_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub canvas: Canvas,
    #[serde(default, deserialize_with = "deserialize_assets")]
    pub assets: BTreeMap<String, AssetDescriptor>,
    #[serde(default, alias = "shots")]
    pub timeline: Vec<Shot>,
    #[serde(default)]
    pub overlays: Vec<Overlay>,
    #[serde(default)]
    pub audio: AudioTrack,
    #[serde(default)]
    pub warnings: Vec<Warning>,
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<SourceMeta>,
}

impl Default for Recipe {
    fn default() -> Self {
        Self {
            version: default_version(),
            canvas: Canvas::default(),
            assets: BTreeMap::new(),
            timeline: Vec::new(),
            overlays: Vec::new(),
            audio: AudioTrack::default(),
            warnings: Vec::new(),
            checklist: Vec::new(),
            meta: None,
        }
    }
}

impl Recipe {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to parse recipe document")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read recipe: {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid recipe: {}", path.display()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize recipe")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(path, self.to_json_pretty()?)
            .with_context(|| format!("failed to write recipe: {}", path.display()))
    }

    /// Roles referenced by any layer, in first-reference order.
    pub fn referenced_roles(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.timeline
            .iter()
            .flat_map(|shot| shot.layers.iter())
            .filter_map(Layer::role)
            .filter(|role| seen.insert(role.to_string()))
            .map(str::to_string)
            .collect()
    }

    pub fn total_duration(&self) -> f64 {
        self.timeline.iter().map(|s| s.duration().max(0.0)).sum()
    }

    /// Append a warning unless an identical one is already recorded.
    pub fn push_warning(&mut self, warning: Warning) -> bool {
        if self.warnings.contains(&warning) {
            return false;
        }
        self.warnings.push(warning);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_document_converges() {
        let raw = r##"{
            "canvas": {"w": 720, "h": 1280, "fps": 24},
            "assets": {"product": "/tmp/p.jpg", "store": null, "clip": {"path": "/tmp/c.mp4"}},
            "shots": [
                {"t0": 0.0, "t1": 1.5, "layers": [{"type": "video", "ref": "clip"}]},
                {"t": [1.5, 3.0], "transition": "xfade", "layers": [{"type": "image", "ref": "product"}]}
            ],
            "warnings": ["shot 1: motion points not detected"]
        }"##;
        let recipe = Recipe::from_json(raw).unwrap();
        assert_eq!(recipe.canvas.width, 720);
        assert_eq!(recipe.canvas.bitrate, "4M");
        assert_eq!(recipe.assets.len(), 2);
        assert_eq!(recipe.assets["clip"].kind, AssetKind::Video);
        assert_eq!(recipe.assets["product"].role, "product");
        assert_eq!(recipe.timeline.len(), 2);
        assert_eq!(recipe.timeline[0].time_forms(), TimeForms::Legacy);
        assert_eq!(recipe.timeline[1].time_forms(), TimeForms::Interval);
        assert_eq!(recipe.timeline[1].transition_in, Transition::Dissolve);
        assert_eq!(recipe.warnings[0].kind, WarningKind::Note);
    }

    #[test]
    fn test_conflicting_time_forms_prefer_interval() {
        let raw = r#"{"t": [1.0, 3.0], "in": 1.0, "out": 2.0}"#;
        let shot: Shot = serde_json::from_str(raw).unwrap();
        assert_eq!(shot.time_forms(), TimeForms::Conflict);
        assert_eq!(shot.interval(), (1.0, 3.0));
    }

    #[test]
    fn test_synced_shot_serializes_both_forms() {
        let raw = r#"{"in": 2.0, "out": 4.5}"#;
        let mut shot: Shot = serde_json::from_str(raw).unwrap();
        assert_eq!(shot.sync_time_forms(), TimeForms::Legacy);
        let value = serde_json::to_value(&shot).unwrap();
        assert_eq!(value["t"], serde_json::json!([2.0, 4.5]));
        assert_eq!(value["in"], 2.0);
        assert_eq!(value["out"], 4.5);
        assert_eq!(value["dur"], 2.5);
    }

    #[test]
    fn test_time_forms_round_trip() {
        let mut shot = Shot::new(0.0, 0.0);
        shot.set_legacy_pair(1.25, 3.75);
        let (start, end) = shot.interval();
        assert!((start - 1.25).abs() < TIME_EPSILON);
        assert!((end - 3.75).abs() < TIME_EPSILON);
        shot.set_interval(start, end);
        assert_eq!(shot.legacy_pair(), (1.25, 3.75));
    }

    #[test]
    fn test_unknown_layer_type_is_tolerated() {
        let raw = r#"{"t": [0, 1], "layers": [{"type": "sparkles", "amount": 3}, {"type": "text", "text": "hi"}]}"#;
        let shot: Shot = serde_json::from_str(raw).unwrap();
        assert_eq!(shot.layers[0], Layer::Unknown);
        assert_eq!(shot.caption_text(), Some("hi"));
    }

    #[test]
    fn test_referenced_roles_keep_first_reference_order() {
        let mut recipe = Recipe::default();
        for role in ["store", "product", "store", "broll1"] {
            let mut shot = Shot::new(0.0, 1.0);
            shot.layers.push(Layer::image(role));
            recipe.timeline.push(shot);
        }
        assert_eq!(recipe.referenced_roles(), vec!["store", "product", "broll1"]);
    }

    #[test]
    fn test_bitrate_parsing() {
        let mut canvas = Canvas::default();
        assert_eq!(canvas.bitrate_bps(), Some(4_000_000));
        canvas.bitrate = "2500k".into();
        assert_eq!(canvas.bitrate_bps(), Some(2_500_000));
        canvas.bitrate = "fast".into();
        assert_eq!(canvas.bitrate_bps(), None);
    }

    #[test]
    fn test_pan_aliases() {
        let motion: LayerMotion = serde_json::from_str(r#"{"scale": 1.03, "pan": "lr"}"#).unwrap();
        assert_eq!(motion.pan, Pan::LeftToRight);
        assert!((motion.zoom_to - 1.03).abs() < 1e-6);
        assert!((motion.zoom_from - 1.0).abs() < 1e-6);
    }
}
