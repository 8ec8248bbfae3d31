//! Merge analysis results into a fresh recipe.
//!
//! Pure combination: no file access and no repair. Anything missing here is
//! the normalizer's business.

use serde::Deserialize;
use std::collections::BTreeSet;

use crate::needs::{build_checklist, infer_needs};
use crate::recipe::{
    AudioTrack, Canvas, Layer, LayerMotion, MotionKind, Overlay, Pan, Recipe, Scene, Shot,
    ShotAnalysis, SourceMeta, Transition, Warning, RECIPE_VERSION,
};

/// Roles the base layers cycle through, shot by shot.
pub const DEFAULT_ROLES: [&str; 4] = ["product", "store", "broll1", "broll2"];

/// One entry of a generated shot list.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ShotlistItem {
    #[serde(default, alias = "text", alias = "copy")]
    pub caption: Option<String>,
    /// Overrides the default base-layer role
    #[serde(default)]
    pub role: Option<String>,
}

/// Shot list as produced by an external copy generator; either a bare
/// array or `{"shots": [...]}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Shotlist {
    pub items: Vec<ShotlistItem>,
}

impl<'de> Deserialize<'de> for Shotlist {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Doc {
            List(Vec<ShotlistItem>),
            Wrapped {
                #[serde(alias = "shots", alias = "shotlist")]
                items: Vec<ShotlistItem>,
            },
        }
        Ok(match Doc::deserialize(deserializer)? {
            Doc::List(items) | Doc::Wrapped { items } => Shotlist { items },
        })
    }
}

pub struct AssemblyInput<'a> {
    pub scenes: &'a [Scene],
    /// One entry per scene, same order
    pub analyses: &'a [ShotAnalysis],
    pub audio: &'a AudioTrack,
    pub canvas: Canvas,
    pub max_beats: usize,
    pub meta: Option<SourceMeta>,
    pub shotlist: Option<&'a Shotlist>,
    /// Pipeline-level warnings (audio fallback, shotlist parse, ...)
    pub warnings: Vec<Warning>,
}

pub fn assemble(input: AssemblyInput<'_>) -> Recipe {
    let fallback = ShotAnalysis::default();
    let mut warnings = input.warnings;
    let mut shot_needs: Vec<BTreeSet<String>> = Vec::with_capacity(input.scenes.len());

    let timeline = input
        .scenes
        .iter()
        .enumerate()
        .map(|(i, scene)| {
            let analysis = input.analyses.get(i).unwrap_or(&fallback);
            let item = input.shotlist.and_then(|s| s.items.get(i));
            warnings.extend(analysis.warnings.iter().cloned());

            let role = item
                .and_then(|it| it.role.clone())
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_ROLES[i % DEFAULT_ROLES.len()].to_string());
            let base = if i % DEFAULT_ROLES.len() == 0 {
                Layer::video(role)
            } else {
                Layer::image(role)
            };

            let mut shot = Shot::new(scene.start_sec, scene.end_sec);
            shot.transition_in = if i == 0 { Transition::Cut } else { Transition::Auto };
            shot.motion = analysis.motion;
            shot.palette = analysis.palette.clone();
            shot.text_boxes = analysis.text_boxes.clone();
            shot.thumb = analysis.thumb.clone();
            shot.layers.push(base.with_motion(layer_motion(i, analysis)));

            let caption = item
                .and_then(|it| it.caption.as_deref())
                .map(str::trim)
                .filter(|c| !c.is_empty());
            if let Some(caption) = caption {
                shot.layers.push(Layer::text(caption));
                shot.caption = Some(caption.to_string());
            }

            let needs = infer_needs(analysis);
            shot.needs = needs.iter().cloned().collect();
            shot_needs.push(needs);
            shot
        })
        .collect();

    let mut audio = input.audio.clone();
    audio.beats.truncate(input.max_beats);

    let mut recipe = Recipe {
        version: RECIPE_VERSION.to_string(),
        canvas: input.canvas,
        timeline,
        overlays: vec![Overlay::vignette(), Overlay::grain()],
        audio,
        checklist: build_checklist(&shot_needs),
        meta: input.meta,
        ..Recipe::default()
    };
    for warning in warnings {
        recipe.push_warning(warning);
    }
    recipe
}

/// Layer motion following the measured camera motion; static shots cycle
/// through a small set of gentle moves so the cut sequence does not feel frozen.
fn layer_motion(index: usize, analysis: &ShotAnalysis) -> LayerMotion {
    let motion = &analysis.motion;
    let pan = match motion.kind {
        MotionKind::PanHorizontal | MotionKind::Pan if motion.pan_x.abs() >= motion.pan_y.abs() => {
            if motion.pan_x >= 0.0 {
                Some(Pan::LeftToRight)
            } else {
                Some(Pan::RightToLeft)
            }
        }
        MotionKind::PanVertical | MotionKind::Pan => {
            if motion.pan_y >= 0.0 {
                Some(Pan::TopToBottom)
            } else {
                Some(Pan::BottomToTop)
            }
        }
        _ => None,
    };
    if let Some(pan) = pan {
        return LayerMotion {
            zoom_from: 1.06,
            zoom_to: 1.06,
            pan,
            ..LayerMotion::default()
        };
    }
    if motion.kind == MotionKind::Zoom {
        return LayerMotion::ken_burns();
    }

    // panned moves start pushed in so the travel stays inside the frame
    let (zoom_from, zoom_to, pan) = match index % 4 {
        0 => (1.0, 1.02, Pan::Center),
        1 => (1.04, 1.07, Pan::LeftToRight),
        2 => (1.04, 1.06, Pan::TopToCenter),
        _ => (1.0, 1.045, Pan::Center),
    };
    LayerMotion {
        zoom_from,
        zoom_to,
        pan,
        ..LayerMotion::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coerce::{parse_json_or_default, Parsed};
    use crate::recipe::{ShotMotion, TextBox, WarningKind};

    fn scenes(n: usize) -> Vec<Scene> {
        (0..n)
            .map(|i| Scene {
                index: i,
                start_sec: i as f64 * 2.0,
                end_sec: i as f64 * 2.0 + 2.0,
            })
            .collect()
    }

    fn input<'a>(
        scenes: &'a [Scene],
        analyses: &'a [ShotAnalysis],
        audio: &'a AudioTrack,
    ) -> AssemblyInput<'a> {
        AssemblyInput {
            scenes,
            analyses,
            audio,
            canvas: Canvas::default(),
            max_beats: 128,
            meta: None,
            shotlist: None,
            warnings: Vec::new(),
        }
    }

    #[test]
    fn test_roles_cycle_and_first_shot_cuts() {
        let scenes = scenes(5);
        let analyses = vec![ShotAnalysis::default(); 5];
        let audio = AudioTrack::fallback();
        let recipe = assemble(input(&scenes, &analyses, &audio));

        assert_eq!(recipe.version, RECIPE_VERSION);
        assert_eq!(
            recipe.referenced_roles(),
            vec!["product", "store", "broll1", "broll2"]
        );
        assert_eq!(recipe.timeline[4].base_layer_roles().next(), Some("product"));
        assert_eq!(recipe.timeline[0].transition_in, Transition::Cut);
        assert_eq!(recipe.timeline[1].transition_in, Transition::Auto);
        assert!(recipe.assets.is_empty());
        assert_eq!(recipe.checklist[0].key, "product");
        assert_eq!(recipe.checklist[0].frequency, 5);
    }

    #[test]
    fn test_analysis_carried_into_shots() {
        let scenes = scenes(2);
        let analyses = vec![
            ShotAnalysis {
                motion: ShotMotion {
                    kind: MotionKind::PanHorizontal,
                    pan_x: -3.0,
                    ..ShotMotion::default()
                },
                palette: vec!["#112233".into()],
                text_boxes: vec![TextBox {
                    text: "50% OFF".into(),
                    bbox: [0, 0, 5, 5],
                    confidence: 0.9,
                }],
                warnings: vec![Warning::shot(0, WarningKind::MotionUnderdetermined, "few points")],
                ..ShotAnalysis::default()
            },
            ShotAnalysis::default(),
        ];
        let audio = AudioTrack {
            bpm: 128.0,
            beats: (0..300).map(|i| i as f64 * 0.47).collect(),
        };
        let recipe = assemble(input(&scenes, &analyses, &audio));

        let first = &recipe.timeline[0];
        assert_eq!(first.palette, vec!["#112233"]);
        assert_eq!(first.layers[0].motion().unwrap().pan, Pan::RightToLeft);
        assert!(first.needs.contains(&"offer_text".to_string()));
        assert!(first.needs.contains(&"store_exterior".to_string()));
        assert_eq!(recipe.audio.beats.len(), 128);
        assert_eq!(recipe.warnings.len(), 1);
    }

    #[test]
    fn test_static_shots_with_pans_start_zoomed_in() {
        let scenes = scenes(4);
        let analyses = vec![ShotAnalysis::default(); 4];
        let audio = AudioTrack::fallback();
        let recipe = assemble(input(&scenes, &analyses, &audio));

        for shot in &recipe.timeline {
            let motion = shot.layers[0].motion().unwrap();
            if motion.pan != Pan::Center {
                assert!(motion.zoom_from > 1.0, "{:?}", motion);
            }
        }
        assert_eq!(recipe.timeline[2].layers[0].motion().unwrap().pan, Pan::TopToCenter);
    }

    #[test]
    fn test_measured_zoom_becomes_a_push_in() {
        let scenes = scenes(1);
        let analyses = vec![ShotAnalysis {
            motion: ShotMotion {
                kind: MotionKind::Zoom,
                zoom: 1.03,
                ..ShotMotion::default()
            },
            ..ShotAnalysis::default()
        }];
        let audio = AudioTrack::fallback();
        let recipe = assemble(input(&scenes, &analyses, &audio));

        let shot = &recipe.timeline[0];
        assert_eq!(shot.layers[0].motion().copied(), Some(LayerMotion::ken_burns()));
        assert!(shot.needs.contains(&"product_shot".to_string()));
    }

    #[test]
    fn test_shotlist_captions_become_text_layers() {
        let parsed: Parsed<Shotlist> = parse_json_or_default(
            "```json\n{\"shots\": [{\"caption\": \"Grand opening\"}, {\"text\": \"  \"}, {\"copy\": \"Visit today\", \"role\": \"store\"}]}\n```",
        );
        assert!(!parsed.is_fallback());
        let shotlist = parsed.into_value();

        let scenes = scenes(3);
        let analyses = vec![ShotAnalysis::default(); 3];
        let audio = AudioTrack::fallback();
        let recipe = assemble(AssemblyInput {
            shotlist: Some(&shotlist),
            ..input(&scenes, &analyses, &audio)
        });

        assert_eq!(recipe.timeline[0].caption_text(), Some("Grand opening"));
        assert_eq!(recipe.timeline[1].caption_text(), None);
        assert_eq!(recipe.timeline[2].caption_text(), Some("Visit today"));
        assert_eq!(recipe.timeline[2].base_layer_roles().next(), Some("store"));
    }

    #[test]
    fn test_bare_array_shotlist() {
        let shotlist: Shotlist = serde_json::from_str(r#"[{"caption": "a"}, {}]"#).unwrap();
        assert_eq!(shotlist.items.len(), 2);
        assert_eq!(shotlist.items[0].caption.as_deref(), Some("a"));
    }
}
