//! Pipeline error taxonomy.
//!
//! Only whole-pipeline impossibilities surface here. Per-shot and per-signal
//! problems are absorbed as [`crate::recipe::Warning`]s or render diagnostics.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::render::RenderDiagnostics;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Pipeline stage a failure originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Segmentation,
    Motion,
    AudioTempo,
    Assembly,
    Validation,
    Render,
    Encode,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Segmentation => "segmentation",
            Stage::Motion => "motion",
            Stage::AudioTempo => "audio_tempo",
            Stage::Assembly => "assembly",
            Stage::Validation => "validation",
            Stage::Render => "render",
            Stage::Encode => "encode",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("analysis failed at {stage} (correlation {correlation_id}): {message}")]
    AnalysisFailure {
        stage: Stage,
        correlation_id: String,
        message: String,
    },

    #[error("recipe has {} validation defect(s): {}", defects.len(), defects.join("; "))]
    ValidationFailed { defects: Vec<String> },

    #[error("render failed at {stage} (correlation {correlation_id}): {message}")]
    RenderFailure {
        stage: Stage,
        correlation_id: String,
        message: String,
        diagnostics: Box<RenderDiagnostics>,
    },

    #[error("invalid recipe state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn analysis(
        stage: Stage,
        correlation_id: impl Into<String>,
        message: impl fmt::Display,
    ) -> Self {
        Self::AnalysisFailure {
            stage,
            correlation_id: correlation_id.into(),
            message: message.to_string(),
        }
    }

    pub fn render(
        stage: Stage,
        correlation_id: impl Into<String>,
        message: impl fmt::Display,
        diagnostics: RenderDiagnostics,
    ) -> Self {
        Self::RenderFailure {
            stage,
            correlation_id: correlation_id.into(),
            message: message.to_string(),
            diagnostics: Box::new(diagnostics),
        }
    }

    /// Stage name for fatal variants, used in API responses and webhooks.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::AnalysisFailure { stage, .. } | Self::RenderFailure { stage, .. } => {
                Some(*stage)
            }
            Self::ValidationFailed { .. } => Some(Stage::Validation),
            _ => None,
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::AnalysisFailure { correlation_id, .. }
            | Self::RenderFailure { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }

    pub fn diagnostics(&self) -> Option<&RenderDiagnostics> {
        match self {
            Self::RenderFailure { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors_carry_stage_and_correlation() {
        let err = PipelineError::analysis(Stage::Segmentation, "job-1", "no scenes");
        assert_eq!(err.stage(), Some(Stage::Segmentation));
        assert_eq!(err.correlation_id(), Some("job-1"));
        let msg = err.to_string();
        assert!(msg.contains("segmentation"));
        assert!(msg.contains("job-1"));
    }

    #[test]
    fn test_stage_display_matches_wire_name() {
        for stage in [
            Stage::Segmentation,
            Stage::Motion,
            Stage::AudioTempo,
            Stage::Assembly,
            Stage::Validation,
            Stage::Render,
            Stage::Encode,
        ] {
            assert_eq!(serde_json::to_value(stage).unwrap(), stage.to_string());
        }
    }

    #[test]
    fn test_validation_message_lists_defects() {
        let err = PipelineError::ValidationFailed {
            defects: vec!["timeline empty".into(), "shot#0 duration<=0".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 validation defect"));
        assert!(msg.contains("shot#0 duration<=0"));
    }
}
