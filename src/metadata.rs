use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::recipe::{AudioTrack, Recipe};

/// Headline numbers about an analysed reference video
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub total_shots: usize,
    /// Seconds
    pub total_duration: f64,
    pub avg_shot_duration: f64,
    pub bpm: f64,
    pub beat_count: usize,
    /// Distinct palette colours across all shots
    pub unique_colors: usize,
    /// Located text entries across all shots
    pub ocr_text_count: usize,
    pub fps: f64,
    /// Width x height
    pub resolution: String,
    pub warning_count: usize,
}

impl AnalysisSummary {
    pub fn from_recipe(recipe: &Recipe) -> Self {
        let total_shots = recipe.timeline.len();
        let total_duration = recipe.total_duration();
        let unique_colors = recipe
            .timeline
            .iter()
            .flat_map(|s| s.palette.iter())
            .map(|c| c.to_ascii_uppercase())
            .collect::<BTreeSet<_>>()
            .len();
        let (fps, resolution) = match &recipe.meta {
            Some(meta) => (meta.fps, format!("{}x{}", meta.size[0], meta.size[1])),
            None => (0.0, String::new()),
        };

        Self {
            total_shots,
            total_duration,
            avg_shot_duration: if total_shots > 0 {
                total_duration / total_shots as f64
            } else {
                0.0
            },
            bpm: recipe.audio.bpm,
            beat_count: recipe.audio.beats.len(),
            unique_colors,
            ocr_text_count: recipe.timeline.iter().map(|s| s.text_boxes.len()).sum(),
            fps,
            resolution,
            warning_count: recipe.warnings.len(),
        }
    }
}

/// Contents of `beat.json`; keeps every detected beat, unlike the recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatInfo {
    pub bpm: f64,
    pub beats: Vec<f64>,
    pub total_beats: usize,
}

impl From<&AudioTrack> for BeatInfo {
    fn from(track: &AudioTrack) -> Self {
        Self {
            bpm: track.bpm,
            beats: track.beats.clone(),
            total_beats: track.beats.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{Shot, SourceMeta, TextBox};

    #[test]
    fn test_summary_counts() {
        let mut recipe = Recipe::default();
        let mut a = Shot::new(0.0, 2.0);
        a.palette = vec!["#FFFFFF".into(), "#000000".into()];
        a.text_boxes.push(TextBox {
            text: "50% off".into(),
            bbox: [0, 0, 10, 10],
            confidence: 0.9,
        });
        let mut b = Shot::new(2.0, 3.0);
        b.palette = vec!["#ffffff".into(), "#FF0000".into()];
        recipe.timeline = vec![a, b];
        recipe.audio = AudioTrack {
            bpm: 128.0,
            beats: vec![0.5, 1.0, 1.5],
        };
        recipe.meta = Some(SourceMeta {
            source: None,
            fps: 30.0,
            size: [1920, 1080],
            duration: 3.0,
            total_shots: 2,
        });

        let summary = AnalysisSummary::from_recipe(&recipe);
        assert_eq!(summary.total_shots, 2);
        assert!((summary.avg_shot_duration - 1.5).abs() < 1e-9);
        assert_eq!(summary.unique_colors, 3);
        assert_eq!(summary.ocr_text_count, 1);
        assert_eq!(summary.beat_count, 3);
        assert_eq!(summary.resolution, "1920x1080");
    }

    #[test]
    fn test_beat_info_counts_all_beats() {
        let track = AudioTrack {
            bpm: 100.0,
            beats: (0..300).map(|i| i as f64 * 0.6).collect(),
        };
        let info = BeatInfo::from(&track);
        assert_eq!(info.total_beats, 300);
        assert_eq!(info.beats.len(), 300);
    }
}
