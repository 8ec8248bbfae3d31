pub mod config;
pub mod error;
pub mod job;
pub mod video_processor;
pub mod scene_detector;
pub mod motion;
pub mod palette;
pub mod text_locator;
pub mod audio_extractor;
pub mod tempo;
pub mod metadata;
pub mod recipe;
pub mod coerce;
pub mod needs;
pub mod assembler;
pub mod normalizer;
pub mod validator;
pub mod render;
pub mod processor;
pub mod handler;

pub use config::{AppConfig, ConfigLoader, ConfigOverrides};
pub use error::{PipelineError, PipelineResult, Stage};
pub use job::{CancelFlag, JobContext, JobStore, RecipeState};
pub use video_processor::VideoProcessor;
pub use scene_detector::SceneDetector;
pub use audio_extractor::AudioExtractor;
pub use metadata::{AnalysisSummary, BeatInfo};
pub use recipe::{Recipe, Shot, Layer, Warning, WarningKind};
pub use normalizer::{Normalizer, NormalizeOptions, NormalizeReport, ScarcityPolicy};
pub use validator::validate;
pub use render::{Renderer, RenderOptions, RenderOutput, RenderDiagnostics, RenderManifest};
pub use processor::{analyze_reference, prepare_recipe, render_job, run_pipeline, PipelineRequest, PipelineOutput};
