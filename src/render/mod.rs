//! Layered renderer.
//!
//! Each shot gets exactly one base layer (or a labeled placeholder), its
//! overlays composited after the base, continuous zoom/pan motion, and a
//! transition at the boundary with the previous shot. Frames are encoded in
//! timeline order; a subtitle file and usage manifest are written next to
//! the video.

pub mod compose;
pub mod effects;
pub mod encoder;
pub mod subtitles;
pub mod text;
pub mod transition;

use image::{RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, PipelineResult, Stage};
use crate::job::CancelFlag;
use crate::palette::parse_hex;
use crate::recipe::{AssetKind, Fit, Layer, LayerMotion, Position, Recipe, Shot, TextStyle};
use crate::video_processor::VideoFrameReader;

use compose::{motion_transform, render_base, Transform};
use effects::EffectChain;
use encoder::FfmpegWriter;
use text::{TextMask, TextRenderer};
use transition::{cross_blend, dissolve_alpha, fade_factor, plan_boundaries, scale_brightness};

pub const VIDEO_FILE: &str = "final.mp4";
pub const SUBTITLE_FILE: &str = "final.srt";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const DIAGNOSTICS_FILE: &str = "diagnostics.json";

/// Structured account of everything that went wrong while building shots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RenderDiagnostics {
    pub attempted: usize,
    pub built: usize,
    pub placeholders: usize,
    pub unresolved: usize,
    pub decode_failures: usize,
    pub malformed_layers: usize,
    pub missing_roles: Vec<String>,
    /// Human-readable, prefixed with `shot#<index>`
    pub reasons: Vec<String>,
    /// Frames handed to the encoder
    #[serde(default)]
    pub frames_encoded: u64,
}

impl RenderDiagnostics {
    fn note_unresolved(&mut self, shot: usize, role: &str, why: impl std::fmt::Display) {
        self.unresolved += 1;
        if !self.missing_roles.iter().any(|r| r == role) {
            self.missing_roles.push(role.to_string());
        }
        self.reasons.push(format!("shot#{}: role '{}' {}", shot, role, why));
    }

    fn note_decode_failure(&mut self, shot: usize, what: impl std::fmt::Display) {
        self.decode_failures += 1;
        self.reasons.push(format!("shot#{}: decode failed: {}", shot, what));
    }

    fn note_malformed(&mut self, shot: usize, layer: usize, what: &str) {
        self.malformed_layers += 1;
        self.reasons.push(format!("shot#{}: layer#{} {}", shot, layer, what));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderManifest {
    pub video_file: String,
    pub file_size_mb: f64,
    pub duration_seconds: f64,
    pub resolution: String,
    pub fps: u32,
    pub used_assets: Vec<String>,
    pub total_shots: usize,
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub safe_mode: bool,
    /// Default transition length as a fraction of the incoming shot
    pub transition_fraction: f64,
    pub font_path: Option<PathBuf>,
    pub correlation_id: String,
    pub cancel: CancelFlag,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            safe_mode: false,
            transition_fraction: 0.2,
            font_path: None,
            correlation_id: "local".to_string(),
            cancel: CancelFlag::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub video_path: PathBuf,
    pub subtitle_path: Option<PathBuf>,
    pub manifest_path: PathBuf,
    pub manifest: RenderManifest,
    pub diagnostics: RenderDiagnostics,
}

enum BaseSource {
    Still(RgbImage),
    Video(Box<VideoFrameReader>),
    Placeholder(RgbImage),
}

enum PlannedOverlay {
    Text { mask: TextMask, style: TextStyle },
    Solid { color: [u8; 3], opacity: f32 },
    Logo { image: RgbaImage, position: Position },
}

/// A shot with its sources opened and its static overlays rasterized.
pub struct ShotPlan {
    pub index: usize,
    pub duration: f64,
    pub frames: usize,
    pub base_role: Option<String>,
    pub overlay_roles: Vec<String>,
    base: BaseSource,
    fit: Fit,
    motion: Option<LayerMotion>,
    overlays: Vec<PlannedOverlay>,
}

impl ShotPlan {
    pub fn is_placeholder(&self) -> bool {
        matches!(self.base, BaseSource::Placeholder(_))
    }

    /// Composite frame `frame` (0-based within the shot), before transitions.
    pub fn compose_frame(
        &mut self,
        frame: usize,
        canvas: (u32, u32),
        fps: u32,
        effects: Option<&EffectChain>,
        frame_index: u64,
    ) -> anyhow::Result<RgbImage> {
        let progress = if self.frames > 1 {
            frame as f32 / (self.frames - 1) as f32
        } else {
            0.0
        };
        let local_time = frame as f64 / fps.max(1) as f64;

        let mut out = match &mut self.base {
            BaseSource::Placeholder(image) => image.clone(),
            BaseSource::Still(image) => render_base(
                image,
                canvas,
                self.fit,
                motion_transform(self.motion.as_ref(), progress),
            ),
            BaseSource::Video(reader) => {
                let source = reader.frame_at(local_time)?;
                render_base(
                    source,
                    canvas,
                    self.fit,
                    motion_transform(self.motion.as_ref(), progress),
                )
            }
        };

        if let Some(effects) = effects {
            effects.apply(&mut out, frame_index);
        }
        for overlay in &self.overlays {
            match overlay {
                PlannedOverlay::Text { mask, style } => text::composite_text(&mut out, mask, style),
                PlannedOverlay::Solid { color, opacity } => compose::fill_solid(&mut out, *color, *opacity),
                PlannedOverlay::Logo { image, position } => compose::stamp_logo(&mut out, image, *position),
            }
        }
        Ok(out)
    }

    /// Swap a broken video source for its last decoded frame.
    fn hold_last_frame(&mut self, canvas: (u32, u32)) {
        let base = std::mem::replace(&mut self.base, BaseSource::Still(RgbImage::new(1, 1)));
        self.base = match base {
            BaseSource::Video(reader) => match reader.into_last_frame() {
                Some(frame) => BaseSource::Still(frame),
                None => BaseSource::Still(RgbImage::new(canvas.0, canvas.1)),
            },
            other => other,
        };
        self.motion = None;
    }
}

pub struct Renderer {
    options: RenderOptions,
    text: TextRenderer,
    style_fonts: HashMap<PathBuf, Option<TextRenderer>>,
}

impl Renderer {
    pub fn new(options: RenderOptions) -> Self {
        let text = TextRenderer::load(options.font_path.as_deref());
        Self::with_text_renderer(options, text)
    }

    pub fn with_text_renderer(options: RenderOptions, text: TextRenderer) -> Self {
        Self {
            options,
            text,
            style_fonts: HashMap::new(),
        }
    }

    /// Open sources and prepare overlays for every shot, in timeline order.
    pub fn plan(&mut self, recipe: &Recipe) -> (Vec<ShotPlan>, RenderDiagnostics) {
        let mut diagnostics = RenderDiagnostics {
            attempted: recipe.timeline.len(),
            ..RenderDiagnostics::default()
        };
        let plans: Vec<ShotPlan> = recipe
            .timeline
            .iter()
            .enumerate()
            .map(|(i, shot)| self.plan_shot(i, shot, recipe, &mut diagnostics))
            .collect();
        diagnostics.built = plans.iter().filter(|p| !p.is_placeholder()).count();
        diagnostics.placeholders = plans.len() - diagnostics.built;
        (plans, diagnostics)
    }

    fn plan_shot(
        &mut self,
        index: usize,
        shot: &Shot,
        recipe: &Recipe,
        diagnostics: &mut RenderDiagnostics,
    ) -> ShotPlan {
        let canvas = (recipe.canvas.width, recipe.canvas.height);
        let fps = recipe.canvas.fps;
        let mut plan = ShotPlan {
            index,
            duration: shot.duration(),
            frames: subtitles::frame_count(shot.duration(), fps),
            base_role: None,
            overlay_roles: Vec::new(),
            base: BaseSource::Placeholder(RgbImage::new(1, 1)),
            fit: Fit::Cover,
            motion: None,
            overlays: Vec::new(),
        };

        let mut first_missing: Option<String> = None;
        for (j, layer) in shot.layers.iter().enumerate() {
            match layer {
                Layer::Unknown => diagnostics.note_malformed(index, j, "has an unknown type"),
                Layer::Video { fit, .. } | Layer::Image { fit, .. } => {
                    if plan.base_role.is_some() {
                        debug!("🎞️  [render] shot#{} layer#{} ignored: base already chosen", index, j);
                        continue;
                    }
                    let Some(role) = layer.role() else {
                        diagnostics.note_malformed(index, j, "has no ref");
                        continue;
                    };
                    match self.open_base(index, role, recipe, canvas, diagnostics) {
                        Some(source) => {
                            plan.base = source;
                            plan.base_role = Some(role.to_string());
                            plan.fit = *fit;
                            plan.motion = layer.motion().copied();
                        }
                        None => {
                            first_missing.get_or_insert_with(|| role.to_string());
                        }
                    }
                }
                _ if self.options.safe_mode => {}
                Layer::Text { text, style } => {
                    let mask = self.rasterize(text, style, canvas.0);
                    if !mask.is_empty() {
                        plan.overlays.push(PlannedOverlay::Text {
                            mask,
                            style: style.clone(),
                        });
                    }
                }
                Layer::Solid { color, opacity } => match parse_hex(color) {
                    Some(rgb) => plan.overlays.push(PlannedOverlay::Solid {
                        color: rgb,
                        opacity: *opacity,
                    }),
                    None => diagnostics.note_malformed(index, j, "has an invalid colour"),
                },
                Layer::Logo {
                    position, scale, ..
                } => {
                    let Some(role) = layer.role() else {
                        diagnostics.note_malformed(index, j, "has no ref");
                        continue;
                    };
                    if let Some(image) = self.open_logo(index, role, recipe, diagnostics) {
                        plan.overlays.push(PlannedOverlay::Logo {
                            image: compose::prepare_logo(&image, canvas.0, *scale),
                            position: *position,
                        });
                        plan.overlay_roles.push(role.to_string());
                    }
                }
            }
        }

        if plan.base_role.is_none() {
            let label = first_missing.unwrap_or_else(|| "base layer".to_string());
            if !shot.layers.iter().any(Layer::is_base_candidate) {
                diagnostics.reasons.push(format!("shot#{}: no video or image layer", index));
            }
            warn!("⚠️  [render] shot#{} uses a placeholder for '{}'", index, label);
            plan.base = BaseSource::Placeholder(compose::placeholder(canvas, &label, &mut self.text));
            plan.motion = None;
        }
        plan
    }

    fn open_base(
        &mut self,
        index: usize,
        role: &str,
        recipe: &Recipe,
        canvas: (u32, u32),
        diagnostics: &mut RenderDiagnostics,
    ) -> Option<BaseSource> {
        let Some(asset) = recipe.assets.get(role) else {
            diagnostics.note_unresolved(index, role, "is not in assets");
            return None;
        };
        if !asset.exists() {
            diagnostics.note_unresolved(index, role, format!("file missing: {}", asset.path.display()));
            return None;
        }

        let opened = match asset.kind {
            AssetKind::Image => image::open(&asset.path)
                .map(|img| BaseSource::Still(img.to_rgb8()))
                .map_err(anyhow::Error::from),
            AssetKind::Video => VideoFrameReader::dimensions(&asset.path).and_then(|size| {
                let decode_size = compose::cover_decode_size(size, canvas);
                VideoFrameReader::open(&asset.path, Some(decode_size))
                    .map(|reader| BaseSource::Video(Box::new(reader)))
            }),
        };
        match opened {
            Ok(source) => Some(source),
            Err(e) => {
                warn!("⚠️  [render] shot#{} cannot decode {}: {:#}", index, asset.path.display(), e);
                diagnostics.note_decode_failure(index, format!("{}: {:#}", asset.path.display(), e));
                None
            }
        }
    }

    fn open_logo(
        &self,
        index: usize,
        role: &str,
        recipe: &Recipe,
        diagnostics: &mut RenderDiagnostics,
    ) -> Option<RgbaImage> {
        let Some(asset) = recipe.assets.get(role).filter(|a| a.exists()) else {
            diagnostics.note_unresolved(index, role, "has no logo file");
            return None;
        };
        match image::open(&asset.path) {
            Ok(img) => Some(img.to_rgba8()),
            Err(e) => {
                diagnostics.note_decode_failure(index, format!("{}: {}", asset.path.display(), e));
                None
            }
        }
    }

    fn rasterize(&mut self, text: &str, style: &TextStyle, canvas_width: u32) -> TextMask {
        let max_width = (canvas_width as f32 * style.max_width.clamp(0.1, 1.0)) as u32;
        if let Some(font_path) = &style.font {
            let renderer = self
                .style_fonts
                .entry(font_path.clone())
                .or_insert_with(|| match TextRenderer::from_file(font_path) {
                    Ok(renderer) => Some(renderer),
                    Err(e) => {
                        warn!("⚠️  [render] layer font unusable: {:#}", e);
                        None
                    }
                });
            if let Some(renderer) = renderer {
                return renderer.rasterize(text, style.size, max_width);
            }
        }
        self.text.rasterize(text, style.size, max_width)
    }

    /// Render `recipe` into `output_dir`.
    pub fn render(&mut self, recipe: &Recipe, output_dir: &Path) -> PipelineResult<RenderOutput> {
        let start = Instant::now();
        let id = self.options.correlation_id.clone();
        let canvas = &recipe.canvas;
        let size = (canvas.width, canvas.height);
        let fps = canvas.fps;

        info!(
            "🎬 [render] {} shots at {}x{} {}fps{}",
            recipe.timeline.len(),
            size.0,
            size.1,
            fps,
            if self.options.safe_mode { " (safe mode)" } else { "" }
        );
        self.options.cancel.check()?;

        if size.0 == 0 || size.1 == 0 || size.0 % 2 != 0 || size.1 % 2 != 0 || fps == 0 {
            return Err(PipelineError::render(
                Stage::Encode,
                id,
                format!("unencodable canvas {}x{} @ {}fps", size.0, size.1, fps),
                RenderDiagnostics::default(),
            ));
        }

        let plan_start = Instant::now();
        let (mut plans, mut diagnostics) = self.plan(recipe);
        info!(
            "✅ [render] planned {} shots ({} built, {} placeholders) in {:.2}s",
            plans.len(),
            diagnostics.built,
            diagnostics.placeholders,
            plan_start.elapsed().as_secs_f64()
        );
        if diagnostics.built == 0 {
            error!("❌ [render] no shot could be built: {:?}", diagnostics.reasons);
            return Err(PipelineError::render(
                Stage::Render,
                id,
                "zero shots could be built",
                diagnostics,
            ));
        }

        std::fs::create_dir_all(output_dir)?;
        let video_path = output_dir.join(VIDEO_FILE);
        let mut writer = FfmpegWriter::spawn(canvas, &video_path).map_err(|e| {
            error!("❌ [render] encoder start failed: {:#}", e);
            PipelineError::render(Stage::Encode, &id, format!("{:#}", e), diagnostics.clone())
        })?;

        let effects = if self.options.safe_mode {
            None
        } else {
            let (chain, skipped) = EffectChain::new(&recipe.overlays, size);
            diagnostics.malformed_layers += skipped;
            if skipped > 0 {
                diagnostics
                    .reasons
                    .push(format!("recipe: {} overlay(s) of unknown type skipped", skipped));
            }
            Some(chain)
        };
        let boundaries = plan_boundaries(recipe, self.options.transition_fraction);
        let total_frames: usize = plans.iter().map(|p| p.frames).sum();
        let report_every = (total_frames / 10).max(1);

        let encode_start = Instant::now();
        let mut frame_index: u64 = 0;
        let mut previous_tail: Option<RgbImage> = None;

        for (i, plan) in plans.iter_mut().enumerate() {
            if let Err(e) = self.options.cancel.check() {
                warn!("🛑 [render] cancelled before shot#{}", i);
                writer.abort();
                return Err(e);
            }

            let incoming = boundaries[i];
            let outgoing = boundaries.get(i + 1).copied();
            for f in 0..plan.frames {
                let mut frame = match plan.compose_frame(f, size, fps, effects.as_ref(), frame_index) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("⚠️  [render] shot#{} decode error at frame {}: {:#}", i, f, e);
                        diagnostics.note_decode_failure(i, format!("frame {}: {:#}", f, e));
                        plan.hold_last_frame(size);
                        match plan.compose_frame(f, size, fps, effects.as_ref(), frame_index) {
                            Ok(frame) => frame,
                            Err(e) => {
                                writer.abort();
                                return Err(PipelineError::render(
                                    Stage::Render,
                                    &id,
                                    format!("shot#{} cannot be composited: {:#}", i, e),
                                    diagnostics,
                                ));
                            }
                        }
                    }
                };

                let time = f as f64 / fps as f64;
                if let (Some(alpha), Some(tail)) = (dissolve_alpha(time, incoming), &previous_tail) {
                    cross_blend(&mut frame, tail, alpha);
                }
                scale_brightness(&mut frame, fade_factor(time, plan.duration, incoming, outgoing));

                if let Err(e) = writer.write_frame(frame.as_raw()) {
                    error!("❌ [render] encoder write failed: {:#}", e);
                    writer.abort();
                    return Err(PipelineError::render(Stage::Encode, &id, format!("{:#}", e), diagnostics));
                }
                frame_index += 1;
                if frame_index as usize % report_every == 0 {
                    info!(
                        "⏳ [render] {:.0}% ({}/{} frames)",
                        frame_index as f64 * 100.0 / total_frames as f64,
                        frame_index,
                        total_frames
                    );
                }
                if f + 1 == plan.frames {
                    previous_tail = Some(frame);
                }
            }
        }

        diagnostics.frames_encoded = writer.frames_written();
        let video_path = writer.finish().map_err(|e| {
            error!("❌ [render] encode failed: {:#}", e);
            PipelineError::render(Stage::Encode, &id, format!("{:#}", e), diagnostics.clone())
        })?;
        let encode_secs = encode_start.elapsed().as_secs_f64();

        let subtitle_path = output_dir.join(SUBTITLE_FILE);
        let subtitle_path = match subtitles::build_srt(recipe, fps) {
            Some(srt) => {
                std::fs::write(&subtitle_path, srt)?;
                Some(subtitle_path)
            }
            None => {
                if subtitle_path.exists() {
                    std::fs::remove_file(&subtitle_path)?;
                }
                None
            }
        };

        let manifest = RenderManifest {
            video_file: video_path.display().to_string(),
            file_size_mb: {
                let bytes = std::fs::metadata(&video_path)?.len() as f64;
                (bytes / (1024.0 * 1024.0) * 100.0).round() / 100.0
            },
            duration_seconds: frame_index as f64 / fps as f64,
            resolution: format!("{}x{}", size.0, size.1),
            fps,
            used_assets: used_assets(&plans),
            total_shots: plans.len(),
        };
        let manifest_path = output_dir.join(MANIFEST_FILE);
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;
        std::fs::write(
            output_dir.join(DIAGNOSTICS_FILE),
            serde_json::to_string_pretty(&diagnostics)?,
        )?;

        info!(
            "✅ [render] {} ({:.2}s video, {:.2} MB) encoded in {:.2}s, total {:.2}s",
            video_path.display(),
            manifest.duration_seconds,
            manifest.file_size_mb,
            encode_secs,
            start.elapsed().as_secs_f64()
        );
        if !diagnostics.reasons.is_empty() {
            warn!("⚠️  [render] {} diagnostic(s): {:?}", diagnostics.reasons.len(), diagnostics.reasons);
        }

        Ok(RenderOutput {
            video_path,
            subtitle_path,
            manifest_path,
            manifest,
            diagnostics,
        })
    }
}

/// Roles whose files ended up on screen, in first-use order.
fn used_assets(plans: &[ShotPlan]) -> Vec<String> {
    let mut used: Vec<String> = Vec::new();
    for plan in plans {
        for role in plan.base_role.iter().chain(&plan.overlay_roles) {
            if !used.contains(role) {
                used.push(role.clone());
            }
        }
    }
    used
}

/// A still composed onto the canvas without motion.
pub fn still_frame(src: &RgbImage, canvas: (u32, u32), fit: Fit) -> RgbImage {
    render_base(src, canvas, fit, Transform::IDENTITY)
}
