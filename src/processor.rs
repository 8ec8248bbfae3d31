//! Pipeline orchestration: analysis, recipe preparation and rendering for
//! one job, with stage timing and optional webhook notification.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::assembler::{assemble, AssemblyInput, Shotlist};
use crate::audio_extractor::AudioExtractor;
use crate::coerce::parse_json_or_default;
use crate::config::{AnalysisConfig, AppConfig, RenderConfig};
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::job::{CancelFlag, JobContext, JobStore, RecipeState};
use crate::metadata::{AnalysisSummary, BeatInfo};
use crate::motion::MotionClassifier;
use crate::normalizer::{NormalizeOptions, NormalizeReport, Normalizer};
use crate::palette::PaletteExtractor;
use crate::recipe::{AudioTrack, Recipe, Scene, ShotAnalysis, SourceMeta, Warning, WarningKind};
use crate::render::{RenderDiagnostics, RenderOptions, RenderOutput, Renderer};
use crate::scene_detector::SceneDetector;
use crate::tempo::TempoEstimator;
use crate::text_locator::TextLocator;
use crate::validator::validate;
use crate::video_processor::{VideoInfo, VideoProcessor};

const SEPARATOR: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

/// Representative frames are saved at this width
const THUMB_WIDTH: u32 = 720;

pub const SUMMARY_FILE: &str = "summary.json";
pub const BEAT_FILE: &str = "beat.json";

/// Result of analysing a reference video
#[derive(Debug, Clone)]
pub struct AnalysisOutput {
    pub recipe: Recipe,
    pub recipe_path: PathBuf,
    pub summary: AnalysisSummary,
    pub summary_path: PathBuf,
    pub beat_path: PathBuf,
}

/// Recipe preparation outcome: what the normalizer did and what the
/// validator still objects to.
#[derive(Debug, Clone, Serialize)]
pub struct Preparation {
    pub report: NormalizeReport,
    pub defects: Vec<String>,
}

impl Preparation {
    pub fn passed(&self) -> bool {
        self.defects.is_empty()
    }
}

/// Inputs of a full analyze → prepare → render run
#[derive(Debug, Clone, Default)]
pub struct PipelineRequest {
    pub input: PathBuf,
    pub project_id: String,
    /// Raw shot list JSON from a copy generator
    pub shotlist: Option<String>,
    /// Role → file, wins over staged uploads
    pub assets: BTreeMap<String, PathBuf>,
    pub safe_mode: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub job_id: String,
    pub recipe_path: PathBuf,
    pub analysis: AnalysisSummary,
    pub render: RenderOutput,
}

struct VisualAnalysis {
    info: VideoInfo,
    scenes: Vec<Scene>,
    detected_scenes: usize,
    analyses: Vec<ShotAnalysis>,
    segment_time: Duration,
    shots_time: Duration,
}

/// Elapsed time as a share of the total, for the performance summary.
fn share(part: Duration, total: Duration) -> f64 {
    let total = total.as_secs_f64();
    if total > 0.0 {
        part.as_secs_f64() / total * 100.0
    } else {
        0.0
    }
}

fn analysis_error(stage: Stage, id: &str) -> impl Fn(anyhow::Error) -> PipelineError + '_ {
    move |e| {
        error!("❌ [analysis] {} failed: {:#}", stage, e);
        PipelineError::analysis(stage, id, format!("{:#}", e))
    }
}

/// Segment the reference and analyse every shot. Blocking.
fn analyze_visual(
    input: &Path,
    frames_dir: &Path,
    config: &AnalysisConfig,
    max_shots: usize,
    cancel: &CancelFlag,
    id: &str,
) -> PipelineResult<VisualAnalysis> {
    let segment_start = Instant::now();
    let processor = VideoProcessor::new(input).map_err(analysis_error(Stage::Segmentation, id))?;
    let info = processor.probe().map_err(analysis_error(Stage::Segmentation, id))?;
    info!(
        "✅ [analysis] {} | {} | {:.2} fps | {:.2}s",
        input.display(),
        info.resolution(),
        info.fps,
        info.duration
    );

    let mut detector = SceneDetector::new(config.threshold, config.min_scene_len);
    let decoded = processor.for_each_frame(Some(config.analysis_width), None, |time, frame| {
        if cancel.is_cancelled() {
            anyhow::bail!("cancelled during decode");
        }
        detector.push_frame(time, &frame);
        Ok(())
    });
    cancel.check()?;
    decoded.map_err(analysis_error(Stage::Segmentation, id))?;

    let mut scenes = detector
        .finish(info.duration)
        .map_err(analysis_error(Stage::Segmentation, id))?;
    if scenes.is_empty() {
        return Err(PipelineError::analysis(Stage::Segmentation, id, "zero scenes detected"));
    }
    let detected_scenes = scenes.len();
    if max_shots > 0 && scenes.len() > max_shots {
        info!("✂️  [analysis] keeping the first {} of {} shots", max_shots, scenes.len());
        scenes.truncate(max_shots);
    }
    let segment_time = segment_start.elapsed();
    info!(
        "✅ [analysis] segmentation found {} shots in {:.2}s",
        detected_scenes,
        segment_time.as_secs_f64()
    );

    let shots_start = Instant::now();
    let analyses = analyze_shots(&processor, &info, &scenes, frames_dir, config, cancel, id)?;
    Ok(VisualAnalysis {
        info,
        scenes,
        detected_scenes,
        analyses,
        segment_time,
        shots_time: shots_start.elapsed(),
    })
}

/// Motion, palette and text per shot, plus a saved representative frame.
fn analyze_shots(
    processor: &VideoProcessor,
    info: &VideoInfo,
    scenes: &[Scene],
    frames_dir: &Path,
    config: &AnalysisConfig,
    cancel: &CancelFlag,
    id: &str,
) -> PipelineResult<Vec<ShotAnalysis>> {
    let step = 1.0 / info.fps.max(1.0);
    let midpoints: Vec<f64> = scenes.iter().map(Scene::midpoint).collect();
    let pair_times: Vec<f64> = scenes
        .iter()
        .flat_map(|s| {
            let a = s.midpoint();
            let b = (a + step).min((s.end_sec - step).max(a));
            [a, b]
        })
        .collect();

    let thumbs = processor
        .frames_at(&midpoints, Some(THUMB_WIDTH))
        .map_err(analysis_error(Stage::Segmentation, id))?;
    let pairs = processor
        .frames_at(&pair_times, Some(config.analysis_width))
        .map_err(analysis_error(Stage::Motion, id))?;

    let classifier = MotionClassifier {
        static_threshold: config.motion_static_threshold,
        ..MotionClassifier::default()
    };
    let palette = PaletteExtractor::new(config.palette_k);
    let locator = config
        .ocr_enabled
        .then(|| TextLocator::new(&config.ocr_languages, config.ocr_min_confidence));
    let ocr_available = locator.as_ref().is_some_and(TextLocator::is_available);

    std::fs::create_dir_all(frames_dir)?;
    let log_every = (scenes.len() / 10).max(1);
    let mut analyses = Vec::with_capacity(scenes.len());

    for (i, scene) in scenes.iter().enumerate() {
        cancel.check()?;
        let mut analysis = ShotAnalysis::default();

        match (&pairs[2 * i], &pairs[2 * i + 1]) {
            (Some(a), Some(b)) => {
                let estimate = classifier.classify(a, b);
                if estimate.degraded {
                    analysis.warnings.push(Warning::shot(
                        i,
                        WarningKind::MotionUnderdetermined,
                        format!(
                            "only {} trackable points; used frame difference",
                            estimate.tracked_points
                        ),
                    ));
                }
                analysis.motion = estimate.motion;
            }
            _ => analysis.warnings.push(Warning::shot(
                i,
                WarningKind::MotionUnderdetermined,
                "frames for motion estimation could not be decoded",
            )),
        }

        match &thumbs[i] {
            Some(frame) => {
                let extracted = palette.extract(frame);
                if extracted.fallback {
                    analysis.warnings.push(Warning::shot(
                        i,
                        WarningKind::PaletteFallback,
                        "palette clustering failed; neutral palette used",
                    ));
                }
                analysis.palette = extracted.colors;

                if let (Some(locator), true) = (&locator, ocr_available) {
                    let located = locator.locate(frame);
                    if let Some(reason) = located.failure {
                        analysis.warnings.push(Warning::shot(i, WarningKind::TextLocatorFallback, reason));
                    }
                    analysis.text_boxes = located.boxes;
                }

                let thumb = frames_dir.join(format!("shot_{:03}.jpg", i));
                match frame.to_rgb8().save(&thumb) {
                    Ok(()) => analysis.thumb = Some(thumb),
                    Err(e) => warn!("⚠️  [analysis] shot#{} thumbnail not saved: {}", i, e),
                }
            }
            None => {
                analysis.palette = crate::palette::fallback_palette(config.palette_k);
                analysis.warnings.push(Warning::shot(
                    i,
                    WarningKind::PaletteFallback,
                    "representative frame could not be decoded",
                ));
            }
        }

        debug!(
            "[analysis] shot#{} {:.2}-{:.2}s motion={:?} colours={} texts={}",
            i,
            scene.start_sec,
            scene.end_sec,
            analysis.motion.kind,
            analysis.palette.len(),
            analysis.text_boxes.len()
        );
        if (i + 1) % log_every == 0 {
            info!("   📈 [analysis] shots {}/{}", i + 1, scenes.len());
        }
        analyses.push(analysis);
    }

    if config.ocr_enabled && !ocr_available {
        if let Some(first) = analyses.first_mut() {
            first.warnings.push(Warning::global(
                WarningKind::TextLocatorFallback,
                "tesseract not found; on-screen text not located",
            ));
        }
    }
    Ok(analyses)
}

/// Tempo and beats of the reference audio; degrades to 120 BPM. Blocking.
fn analyze_audio(input: &Path, config: &AnalysisConfig) -> (AudioTrack, Option<Warning>) {
    let extractor = AudioExtractor::new(input, config.audio_sample_rate);
    let estimated = extractor
        .extract_mono()
        .and_then(|samples| TempoEstimator::new(extractor.sample_rate()).estimate(&samples));
    match estimated {
        Ok(track) => {
            info!("✅ [analysis] tempo {:.2} BPM, {} beats", track.bpm, track.beats.len());
            (track, None)
        }
        Err(e) => {
            warn!("⚠️  [analysis] tempo estimation failed, using {} BPM: {:#}", AudioTrack::DEFAULT_BPM, e);
            (
                AudioTrack::fallback(),
                Some(Warning::global(
                    WarningKind::AudioFallback,
                    format!("tempo estimation failed ({:#}); default {} BPM", e, AudioTrack::DEFAULT_BPM),
                )),
            )
        }
    }
}

/// Analyse a reference video into a draft recipe and persist it for the
/// job's project.
pub async fn analyze_reference(
    ctx: &JobContext,
    store: &JobStore,
    input: &Path,
    shotlist: Option<&str>,
    config: &AppConfig,
) -> PipelineResult<AnalysisOutput> {
    let total_start = Instant::now();
    let id = ctx.job_id().to_string();
    info!("🎬 [analysis] job {} analysing {}", id, input.display());
    info!("{}", SEPARATOR);
    ctx.prepare_dirs()?;

    let mut warnings = Vec::new();
    let shotlist = shotlist.map(|raw| {
        let parsed = parse_json_or_default::<Shotlist>(raw);
        if let Some(reason) = parsed.reason() {
            warn!("⚠️  [analysis] shotlist ignored: {}", reason);
            warnings.push(Warning::global(WarningKind::Note, format!("shotlist ignored: {}", reason)));
        }
        parsed.into_value()
    });

    // visual and audio paths are independent
    let visual = {
        let (input, frames_dir, analysis) = (input.to_path_buf(), ctx.frames_dir(), config.analysis.clone());
        let (max_shots, cancel, id) = (config.render.max_shots, ctx.cancel_flag(), id.clone());
        tokio::task::spawn_blocking(move || {
            analyze_visual(&input, &frames_dir, &analysis, max_shots, &cancel, &id)
        })
    };
    let audio = {
        let (input, analysis) = (input.to_path_buf(), config.analysis.clone());
        tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let result = analyze_audio(&input, &analysis);
            (result, start.elapsed())
        })
    };
    let (visual, audio) = tokio::join!(visual, audio);

    let visual = visual
        .map_err(|e| PipelineError::analysis(Stage::Segmentation, &id, format!("worker failed: {}", e)))??;
    let ((audio, audio_warning), audio_time) = audio
        .map_err(|e| PipelineError::analysis(Stage::AudioTempo, &id, format!("worker failed: {}", e)))?;
    warnings.extend(audio_warning);
    ctx.check_cancelled()?;

    let assemble_start = Instant::now();
    let recipe = assemble(AssemblyInput {
        scenes: &visual.scenes,
        analyses: &visual.analyses,
        audio: &audio,
        canvas: config.render.canvas.clone(),
        max_beats: config.analysis.max_beats,
        meta: Some(SourceMeta {
            source: Some(input.display().to_string()),
            fps: visual.info.fps,
            size: [visual.info.width, visual.info.height],
            duration: visual.info.duration,
            total_shots: visual.detected_scenes,
        }),
        shotlist: shotlist.as_ref(),
        warnings,
    });
    let recipe_path = store.save_recipe(ctx, &recipe).map_err(|e| {
        PipelineError::analysis(Stage::Assembly, &id, format!("{:#}", e))
    })?;

    let summary = AnalysisSummary::from_recipe(&recipe);
    let summary_path = ctx.job_dir().join(SUMMARY_FILE);
    std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;
    let beat_path = ctx.job_dir().join(BEAT_FILE);
    std::fs::write(&beat_path, serde_json::to_string_pretty(&BeatInfo::from(&audio))?)?;
    let assemble_time = assemble_start.elapsed();

    let total = total_start.elapsed();
    info!("{}", SEPARATOR);
    info!("🎉 [analysis] done in {:.2}s ({:.0}ms)", total.as_secs_f64(), total.as_millis());
    info!("📊 [analysis] performance:");
    info!("   • segmentation: {:.2}s ({:.1}%)", visual.segment_time.as_secs_f64(), share(visual.segment_time, total));
    info!("   • shot analysis: {:.2}s ({:.1}%)", visual.shots_time.as_secs_f64(), share(visual.shots_time, total));
    info!("   • audio tempo: {:.2}s ({:.1}%)", audio_time.as_secs_f64(), share(audio_time, total));
    info!("   • assembly: {:.2}s ({:.1}%)", assemble_time.as_secs_f64(), share(assemble_time, total));
    info!("{}", SEPARATOR);
    info!(
        "📁 [analysis] {} shots, {:.2} BPM, {} warning(s) -> {}",
        summary.total_shots,
        summary.bpm,
        summary.warning_count,
        recipe_path.display()
    );

    let output = AnalysisOutput {
        recipe,
        recipe_path,
        summary,
        summary_path,
        beat_path,
    };
    if let Some(url) = &config.webhook_url {
        notify(url, &WebhookPayload::analysis(ctx, &output)).await;
    }
    Ok(output)
}

/// Normalize against the project's staged assets, then validate.
pub fn prepare_recipe(
    ctx: &mut JobContext,
    recipe: &mut Recipe,
    config: &RenderConfig,
    explicit: &BTreeMap<String, PathBuf>,
) -> PipelineResult<Preparation> {
    let start = Instant::now();
    let options = NormalizeOptions {
        min_shot_floor: config.min_shot_floor,
        scarcity: config.scarcity_policy,
        explicit: explicit.clone(),
        staging_dir: Some(ctx.assets_dir()),
    };
    let report = Normalizer::new(options).normalize(recipe);
    ctx.advance(RecipeState::Normalized)?;

    let defects = validate(recipe);
    ctx.advance(RecipeState::Validated {
        pass: defects.is_empty(),
    })?;
    if defects.is_empty() {
        info!("✅ [validate] recipe is render-ready ({:.2}s)", start.elapsed().as_secs_f64());
    } else {
        warn!("⚠️  [validate] {} defect(s):", defects.len());
        for defect in &defects {
            warn!("   • {}", defect);
        }
    }
    Ok(Preparation { report, defects })
}

/// Render a validated recipe into the job's output directory. Blocking.
pub fn render_recipe(
    ctx: &mut JobContext,
    recipe: &Recipe,
    config: &RenderConfig,
    safe_mode: bool,
) -> PipelineResult<RenderOutput> {
    ctx.advance(RecipeState::Rendering)?;
    let mut renderer = Renderer::new(RenderOptions {
        safe_mode,
        transition_fraction: config.transition_fraction,
        font_path: config.font_path.clone(),
        correlation_id: ctx.job_id().to_string(),
        cancel: ctx.cancel_flag(),
    });
    match renderer.render(recipe, &ctx.output_dir()) {
        Ok(output) => {
            ctx.advance(RecipeState::Rendered)?;
            Ok(output)
        }
        Err(e) => {
            error!("❌ [render] job {} failed: {}", ctx.job_id(), e);
            if let Some(diagnostics) = e.diagnostics() {
                for reason in &diagnostics.reasons {
                    error!("   • {}", reason);
                }
            }
            ctx.advance(RecipeState::Failed)?;
            Err(e)
        }
    }
}

/// [`render_recipe`] on a blocking worker, followed by the webhook.
pub async fn render_job(
    mut ctx: JobContext,
    recipe: Recipe,
    config: AppConfig,
    safe_mode: bool,
) -> PipelineResult<RenderOutput> {
    let id = ctx.job_id().to_string();
    let render_config = config.render.clone();
    let (ctx, result) = tokio::task::spawn_blocking(move || {
        let result = render_recipe(&mut ctx, &recipe, &render_config, safe_mode);
        (ctx, result)
    })
    .await
    .map_err(|e| {
        PipelineError::render(
            Stage::Render,
            &id,
            format!("worker failed: {}", e),
            RenderDiagnostics::default(),
        )
    })?;

    if let Some(url) = &config.webhook_url {
        notify(url, &WebhookPayload::render(&ctx, &result)).await;
    }
    result
}

/// Analyse, prepare and render in one go.
pub async fn run_pipeline(request: PipelineRequest, config: &AppConfig) -> PipelineResult<PipelineOutput> {
    let total_start = Instant::now();
    let store = JobStore::new(&config.staging_root);
    let mut ctx = JobContext::new(&config.staging_root, &request.project_id)?;
    info!("🚀 [pipeline] job {} for project {}", ctx.job_id(), ctx.project_id());

    let analysis = analyze_reference(&ctx, &store, &request.input, request.shotlist.as_deref(), config).await?;
    let analysis_time = total_start.elapsed();

    let mut recipe = analysis.recipe;
    let preparation = prepare_recipe(&mut ctx, &mut recipe, &config.render, &request.assets)?;
    let recipe_path = store
        .save_recipe(&ctx, &recipe)
        .map_err(|e| PipelineError::Config(format!("recipe not saved: {:#}", e)))?;
    if !preparation.passed() {
        return Err(PipelineError::ValidationFailed {
            defects: preparation.defects,
        });
    }

    let render_start = Instant::now();
    let job_id = ctx.job_id().to_string();
    let render = render_job(ctx, recipe, config.clone(), request.safe_mode || config.render.safe_mode).await?;
    let render_time = render_start.elapsed();

    let total = total_start.elapsed();
    info!("{}", SEPARATOR);
    info!("🎉 [pipeline] job {} finished in {:.2}s", job_id, total.as_secs_f64());
    info!("📊 [pipeline] performance:");
    info!("   • analysis: {:.2}s ({:.1}%)", analysis_time.as_secs_f64(), share(analysis_time, total));
    info!("   • render: {:.2}s ({:.1}%)", render_time.as_secs_f64(), share(render_time, total));
    info!("{}", SEPARATOR);
    info!("🎬 [pipeline] video: {}", render.video_path.display());

    Ok(PipelineOutput {
        job_id,
        recipe_path,
        analysis: analysis.summary,
        render,
    })
}

/// Webhook body
#[derive(Debug, Serialize)]
pub struct WebhookPayload {
    pub status: String,
    pub stage: String,
    pub job_id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipe_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<AnalysisSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<RenderDiagnostics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: String,
}

impl WebhookPayload {
    fn base(ctx: &JobContext, stage: &str, status: &str) -> Self {
        Self {
            status: status.to_string(),
            stage: stage.to_string(),
            job_id: ctx.job_id().to_string(),
            project_id: ctx.project_id().to_string(),
            recipe_file: None,
            video_file: None,
            summary: None,
            diagnostics: None,
            error: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn analysis(ctx: &JobContext, output: &AnalysisOutput) -> Self {
        Self {
            recipe_file: Some(output.recipe_path.display().to_string()),
            summary: Some(output.summary.clone()),
            ..Self::base(ctx, "analysis", "success")
        }
    }

    pub fn render(ctx: &JobContext, result: &PipelineResult<RenderOutput>) -> Self {
        match result {
            Ok(output) => Self {
                video_file: Some(output.video_path.display().to_string()),
                diagnostics: Some(output.diagnostics.clone()),
                ..Self::base(ctx, "render", "success")
            },
            Err(e) => Self {
                diagnostics: e.diagnostics().cloned(),
                error: Some(e.to_string()),
                ..Self::base(ctx, "render", "failed")
            },
        }
    }
}

/// Post `payload`; failures are logged, never propagated.
pub async fn notify(url: &str, payload: &WebhookPayload) {
    info!("⏳ [webhook] notifying {}", url);
    match call_webhook(url, payload).await {
        Ok(()) => info!("✅ [webhook] delivered"),
        Err(e) => warn!("⚠️  [webhook] delivery failed: {:#}", e),
    }
}

async fn call_webhook(url: &str, payload: &WebhookPayload) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .post(url)
        .json(payload)
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .context("webhook request failed")?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("webhook returned {}: {}", status, body);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{Layer, Shot};

    fn draft(roles: &[&str]) -> Recipe {
        let mut recipe = Recipe::default();
        for (i, role) in roles.iter().enumerate() {
            let mut shot = Shot::new(i as f64, i as f64 + 1.5);
            shot.layers.push(Layer::image(*role));
            recipe.timeline.push(shot);
        }
        recipe
    }

    #[test]
    fn test_prepare_uses_staged_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = JobContext::new(dir.path(), "bakery").unwrap();
        ctx.prepare_dirs().unwrap();
        image::RgbImage::new(8, 8)
            .save(ctx.assets_dir().join("product.png"))
            .unwrap();

        let mut recipe = draft(&["product"]);
        let prep = prepare_recipe(&mut ctx, &mut recipe, &RenderConfig::default(), &BTreeMap::new()).unwrap();
        assert!(prep.passed(), "{:?}", prep.defects);
        assert_eq!(ctx.state(), RecipeState::Validated { pass: true });
        assert_eq!(recipe.assets["product"].path, ctx.assets_dir().join("product.png"));
    }

    #[test]
    fn test_failed_validation_blocks_render() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = JobContext::new(dir.path(), "bakery").unwrap();
        let config = RenderConfig {
            scarcity_policy: crate::normalizer::ScarcityPolicy::Fail,
            ..RenderConfig::default()
        };
        let mut recipe = draft(&["product", "store"]);
        let prep = prepare_recipe(&mut ctx, &mut recipe, &config, &BTreeMap::new()).unwrap();
        assert!(!prep.passed());
        assert_eq!(ctx.state(), RecipeState::Validated { pass: false });

        let err = render_recipe(&mut ctx, &recipe, &config, false).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        assert!(!ctx.output_dir().join(crate::render::VIDEO_FILE).exists());
    }

    #[test]
    fn test_render_failure_moves_job_to_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = JobContext::new(dir.path(), "bakery").unwrap();
        let image = dir.path().join("p.png");
        image::RgbImage::new(8, 8).save(&image).unwrap();

        let mut recipe = draft(&["product"]);
        let explicit = BTreeMap::from([("product".to_string(), image.clone())]);
        prepare_recipe(&mut ctx, &mut recipe, &RenderConfig::default(), &explicit).unwrap();
        // file disappears between validation and render
        std::fs::remove_file(&image).unwrap();

        let err = render_recipe(&mut ctx, &recipe, &RenderConfig::default(), false).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Render));
        assert_eq!(ctx.state(), RecipeState::Failed);
        assert_eq!(err.diagnostics().unwrap().built, 0);
    }

    #[test]
    fn test_webhook_payload_shape() {
        let ctx = JobContext::with_job_id("/data", "cafe", "job-1").unwrap();
        let err: PipelineResult<RenderOutput> = Err(PipelineError::Cancelled);
        let value = serde_json::to_value(WebhookPayload::render(&ctx, &err)).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["stage"], "render");
        assert_eq!(value["job_id"], "job-1");
        assert!(value.get("video_file").is_none());
    }

    /// 10 s clip at 10 fps: red for 5 s, then blue. `None` without ffmpeg.
    fn hard_cut_clip(dir: &Path) -> Option<PathBuf> {
        let ffmpeg = which::which("ffmpeg").ok()?;
        let path = dir.join("cut.mp4");
        let status = std::process::Command::new(ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(["-f", "lavfi", "-i", "color=c=red:s=160x120:r=10:d=5"])
            .args(["-f", "lavfi", "-i", "color=c=blue:s=160x120:r=10:d=5"])
            .args(["-filter_complex", "[0:v][1:v]concat=n=2:v=1:a=0[v]", "-map", "[v]"])
            .args(["-c:v", "mpeg4", "-q:v", "2", "-pix_fmt", "yuv420p"])
            .arg(&path)
            .status()
            .ok()?;
        status.success().then_some(path)
    }

    #[test]
    fn test_hard_cut_reference_splits_into_two_shots() {
        let dir = tempfile::tempdir().unwrap();
        let Some(clip) = hard_cut_clip(dir.path()) else {
            return;
        };
        let config = AnalysisConfig {
            ocr_enabled: false,
            ..AnalysisConfig::default()
        };
        let frames = dir.path().join("frames");
        let visual = analyze_visual(&clip, &frames, &config, 0, &CancelFlag::new(), "job-cut").unwrap();

        assert_eq!(visual.scenes.len(), 2, "{:?}", visual.scenes);
        assert_eq!(visual.detected_scenes, 2);
        let frame = 1.0 / visual.info.fps;
        assert!((visual.scenes[1].start_sec - 5.0).abs() <= frame + 1e-6, "{:?}", visual.scenes);
        assert_eq!(visual.scenes[0].end_sec, visual.scenes[1].start_sec);
        assert!((visual.scenes[1].end_sec - 10.0).abs() <= frame + 1e-6);
        assert_eq!(visual.analyses.len(), 2);
        assert!(frames.join("shot_000.jpg").exists());
        assert!(frames.join("shot_001.jpg").exists());
    }

    #[test]
    fn test_zero_duration_video_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("empty.mp4");
        std::fs::write(&bogus, b"").unwrap();
        let result = analyze_visual(
            &bogus,
            &dir.path().join("frames"),
            &AnalysisConfig::default(),
            0,
            &CancelFlag::new(),
            "job-x",
        );
        match result {
            Err(PipelineError::AnalysisFailure { stage, correlation_id, .. }) => {
                assert_eq!(stage, Stage::Segmentation);
                assert_eq!(correlation_id, "job-x");
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("an empty file must not segment"),
        }
    }
}
