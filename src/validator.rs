//! Read-only recipe checks. An empty defect list means the recipe may be rendered.

use crate::error::{PipelineError, PipelineResult};
use crate::recipe::Recipe;

pub fn validate(recipe: &Recipe) -> Vec<String> {
    let mut defects = Vec::new();

    if recipe.timeline.is_empty() {
        defects.push("timeline is empty".to_string());
    }

    let canvas = &recipe.canvas;
    if canvas.width == 0 || canvas.height == 0 || canvas.width % 2 != 0 || canvas.height % 2 != 0 {
        defects.push(format!(
            "canvas {}x{} must be positive and even",
            canvas.width, canvas.height
        ));
    }
    if canvas.fps == 0 {
        defects.push("canvas fps must be positive".to_string());
    }
    if canvas.bitrate_bps().is_none() {
        defects.push(format!("canvas bitrate '{}' is not a valid rate", canvas.bitrate));
    }

    for (i, shot) in recipe.timeline.iter().enumerate() {
        if !(shot.duration() > 0.0) {
            defects.push(format!("shot#{} duration<=0", i));
        }
        for (j, layer) in shot.layers.iter().enumerate() {
            if !layer.requires_ref() {
                continue;
            }
            let Some(role) = layer.role() else {
                defects.push(format!("shot#{} layer#{} missing ref", i, j));
                continue;
            };
            match recipe.assets.get(role) {
                None => defects.push(format!(
                    "shot#{} layer#{} ref '{}' not in assets",
                    i, j, role
                )),
                Some(asset) if !asset.exists() => defects.push(format!(
                    "shot#{} layer#{} asset file missing: {}",
                    i,
                    j,
                    asset.path.display()
                )),
                Some(_) => {}
            }
        }
    }
    defects
}

/// [`validate`], with defects turned into [`PipelineError::ValidationFailed`].
pub fn ensure_valid(recipe: &Recipe) -> PipelineResult<()> {
    let defects = validate(recipe);
    if defects.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::ValidationFailed { defects })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{AssetDescriptor, Layer, Shot};

    #[test]
    fn test_empty_timeline() {
        let defects = validate(&Recipe::default());
        assert_eq!(defects, vec!["timeline is empty"]);
    }

    #[test]
    fn test_shot_and_layer_defects() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("p.jpg");
        std::fs::write(&present, b"x").unwrap();

        let mut recipe = Recipe::default();
        recipe.assets.insert("product".into(), AssetDescriptor::new("product", &present));
        recipe
            .assets
            .insert("store".into(), AssetDescriptor::new("store", dir.path().join("gone.jpg")));

        let mut ok = Shot::new(0.0, 1.0);
        ok.layers.push(Layer::image("product"));
        let mut broken = Shot::new(1.0, 1.0);
        broken.layers.push(Layer::Image {
            role: None,
            fit: Default::default(),
            motion: None,
        });
        broken.layers.push(Layer::video("clip"));
        broken.layers.push(Layer::image("store"));
        broken.layers.push(Layer::text("caption"));
        recipe.timeline = vec![ok, broken];

        let before = recipe.clone();
        let defects = validate(&recipe);
        assert_eq!(recipe, before);
        assert_eq!(defects.len(), 4, "{:?}", defects);
        assert_eq!(defects[0], "shot#1 duration<=0");
        assert_eq!(defects[1], "shot#1 layer#0 missing ref");
        assert_eq!(defects[2], "shot#1 layer#1 ref 'clip' not in assets");
        assert!(defects[3].starts_with("shot#1 layer#2 asset file missing"));
    }

    #[test]
    fn test_canvas_defects() {
        let mut recipe = Recipe::default();
        recipe.timeline.push(Shot::new(0.0, 1.0));
        recipe.canvas.width = 1081;
        recipe.canvas.fps = 0;
        recipe.canvas.bitrate = "lots".into();
        let defects = validate(&recipe);
        assert_eq!(defects.len(), 3, "{:?}", defects);
        assert!(matches!(
            ensure_valid(&recipe),
            Err(PipelineError::ValidationFailed { .. })
        ));
    }
}
