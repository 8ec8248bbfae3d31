//! Make any recipe render-ready.
//!
//! Rules run in a fixed order and each one is idempotent: running the
//! normalizer over its own output changes nothing, byte for byte.
//!
//! 1. time representation sync
//! 2. degenerate duration repair
//! 3. asset role resolution (explicit path, staged upload, existing
//!    descriptor, then the scarcity policy)
//! 4. video layer duration backfill

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::recipe::{AssetDescriptor, Layer, Recipe, TimeForms, Warning, WarningKind};

/// What to do with roles no asset can be found for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScarcityPolicy {
    /// Reuse existing assets round-robin so every role resolves to a file.
    #[default]
    RoundRobin,
    /// Leave the role unresolved; validation then blocks rendering.
    Fail,
}

impl FromStr for ScarcityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(ScarcityPolicy::RoundRobin),
            "fail" => Ok(ScarcityPolicy::Fail),
            other => Err(format!("unknown scarcity policy: {}", other)),
        }
    }
}

impl fmt::Display for ScarcityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScarcityPolicy::RoundRobin => "round_robin",
            ScarcityPolicy::Fail => "fail",
        })
    }
}

#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Length given to shots whose end is not after their start
    pub min_shot_floor: f64,
    pub scarcity: ScarcityPolicy,
    /// User-supplied role -> file mapping, highest priority
    pub explicit: BTreeMap<String, PathBuf>,
    /// Directory of staged uploads, named `<role>.<ext>` or `<role>/<file>`
    pub staging_dir: Option<PathBuf>,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            min_shot_floor: 2.0,
            scarcity: ScarcityPolicy::RoundRobin,
            explicit: BTreeMap::new(),
            staging_dir: None,
        }
    }
}

/// How each role was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Resolution {
    Explicit { path: PathBuf },
    Staged { path: PathBuf },
    Existing { path: PathBuf },
    Fallback { path: PathBuf },
    Unresolved,
}

/// What one normalization pass changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizeReport {
    pub time_forms_synced: usize,
    pub durations_repaired: Vec<usize>,
    pub roles: BTreeMap<String, Resolution>,
    pub layer_durations_backfilled: usize,
    pub warnings_added: usize,
}

impl NormalizeReport {
    pub fn unresolved_roles(&self) -> Vec<&str> {
        self.roles
            .iter()
            .filter(|(_, r)| **r == Resolution::Unresolved)
            .map(|(role, _)| role.as_str())
            .collect()
    }

    pub fn fallback_roles(&self) -> Vec<&str> {
        self.roles
            .iter()
            .filter(|(_, r)| matches!(r, Resolution::Fallback { .. }))
            .map(|(role, _)| role.as_str())
            .collect()
    }
}

pub struct Normalizer {
    options: NormalizeOptions,
}

impl Normalizer {
    pub fn new(options: NormalizeOptions) -> Self {
        Self { options }
    }

    /// Normalize `recipe` in place.
    pub fn normalize(&self, recipe: &mut Recipe) -> NormalizeReport {
        let mut report = NormalizeReport::default();
        let warnings_before = recipe.warnings.len();

        if recipe.version.trim().is_empty() {
            recipe.version = crate::recipe::RECIPE_VERSION.to_string();
        }
        if recipe.timeline.is_empty() {
            warn!("⚠️  [normalize] empty timeline left for validation");
        }

        self.sync_time_forms(recipe, &mut report);
        self.repair_durations(recipe, &mut report);
        self.resolve_roles(recipe, &mut report);
        self.backfill_layer_durations(recipe, &mut report);

        report.warnings_added = recipe.warnings.len() - warnings_before;
        info!(
            "✅ [normalize] {} shots, {} time forms synced, {} durations repaired, {} roles ({} fallback, {} unresolved)",
            recipe.timeline.len(),
            report.time_forms_synced,
            report.durations_repaired.len(),
            report.roles.len(),
            report.fallback_roles().len(),
            report.unresolved_roles().len()
        );
        report
    }

    fn sync_time_forms(&self, recipe: &mut Recipe, report: &mut NormalizeReport) {
        let mut pending = Vec::new();
        for (i, shot) in recipe.timeline.iter_mut().enumerate() {
            match shot.sync_time_forms() {
                TimeForms::Both => {}
                TimeForms::Interval | TimeForms::Legacy => report.time_forms_synced += 1,
                TimeForms::Missing => {
                    report.time_forms_synced += 1;
                    pending.push(Warning::shot(
                        i,
                        WarningKind::TimeMissing,
                        "shot has no time range; starting at 0",
                    ));
                }
                TimeForms::Conflict => {
                    report.time_forms_synced += 1;
                    pending.push(Warning::shot(
                        i,
                        WarningKind::TimeConflict,
                        "interval and in/out disagree; kept the interval",
                    ));
                }
            }
        }
        for warning in pending {
            recipe.push_warning(warning);
        }
    }

    fn repair_durations(&self, recipe: &mut Recipe, report: &mut NormalizeReport) {
        let floor = self.options.min_shot_floor;
        let mut pending = Vec::new();
        for (i, shot) in recipe.timeline.iter_mut().enumerate() {
            let start = if shot.start().is_finite() && shot.start() >= 0.0 {
                shot.start()
            } else {
                0.0
            };
            let end = shot.end();
            if end.is_finite() && end - start > 0.0 {
                if start != shot.start() {
                    shot.set_interval(start, end);
                }
                continue;
            }
            shot.set_interval(start, start + floor);
            report.durations_repaired.push(i);
            debug!("🔧 [normalize] shot#{} extended to [{:.3}, {:.3}]", i, start, start + floor);
            pending.push(Warning::shot(
                i,
                WarningKind::DurationRepaired,
                format!("non-positive duration; extended to {:.2}s", floor),
            ));
        }
        for warning in pending {
            recipe.push_warning(warning);
        }
    }

    fn resolve_roles(&self, recipe: &mut Recipe, report: &mut NormalizeReport) {
        let roles = recipe.referenced_roles();
        let mut missing = Vec::new();

        for role in &roles {
            let resolution = if let Some(path) = self.explicit_path(role) {
                Resolution::Explicit { path }
            } else if let Some(path) = self.staged_path(role) {
                Resolution::Staged { path }
            } else if let Some(existing) = recipe.assets.get(role).filter(|a| a.exists()) {
                Resolution::Existing {
                    path: existing.path.clone(),
                }
            } else {
                missing.push(role.clone());
                continue;
            };

            if let Resolution::Explicit { path } | Resolution::Staged { path } = &resolution {
                let descriptor = AssetDescriptor::new(role.clone(), path.clone());
                if recipe.assets.get(role) != Some(&descriptor) {
                    recipe.assets.insert(role.clone(), descriptor);
                }
            }
            report.roles.insert(role.clone(), resolution);
        }

        if missing.is_empty() {
            return;
        }

        let pool = self.asset_pool(recipe, &roles);
        match self.options.scarcity {
            ScarcityPolicy::RoundRobin if !pool.is_empty() => {
                warn!(
                    "⚠️  [normalize] {} role(s) without assets, reusing {} file(s) round-robin",
                    missing.len(),
                    pool.len()
                );
                for (i, role) in missing.iter().enumerate() {
                    let path = pool[i % pool.len()].clone();
                    recipe.push_warning(Warning::global(
                        WarningKind::AssetScarcity,
                        format!("role '{}' has no asset; reusing {}", role, path.display()),
                    ));
                    recipe
                        .assets
                        .insert(role.clone(), AssetDescriptor::new(role.clone(), path.clone()));
                    report.roles.insert(role.clone(), Resolution::Fallback { path });
                }
            }
            _ => {
                for role in &missing {
                    warn!("⚠️  [normalize] role '{}' is unresolved", role);
                    recipe.push_warning(Warning::global(
                        WarningKind::AssetUnresolved,
                        format!("role '{}' has no asset", role),
                    ));
                    report.roles.insert(role.clone(), Resolution::Unresolved);
                }
            }
        }
    }

    fn explicit_path(&self, role: &str) -> Option<PathBuf> {
        let path = self.options.explicit.get(role)?;
        if path.is_file() {
            Some(path.clone())
        } else {
            warn!(
                "⚠️  [normalize] explicit asset for '{}' does not exist: {}",
                role,
                path.display()
            );
            None
        }
    }

    fn staged_path(&self, role: &str) -> Option<PathBuf> {
        let dir = self.options.staging_dir.as_ref()?;
        staged_file(dir, role)
    }

    /// Distinct existing files, in a deterministic order: assets of
    /// referenced roles by first reference, then the rest of the asset
    /// map, then untagged staged uploads.
    fn asset_pool(&self, recipe: &Recipe, roles: &[String]) -> Vec<PathBuf> {
        let mut seen = BTreeSet::new();
        let mut pool = Vec::new();
        let mut add = |path: &Path| {
            if path.is_file() && seen.insert(path.to_path_buf()) {
                pool.push(path.to_path_buf());
            }
        };

        for role in roles {
            if let Some(asset) = recipe.assets.get(role) {
                add(&asset.path);
            }
        }
        for (role, asset) in &recipe.assets {
            if !roles.contains(role) {
                add(&asset.path);
            }
        }
        if let Some(dir) = &self.options.staging_dir {
            for path in list_files(dir) {
                add(&path);
            }
        }
        pool
    }

    fn backfill_layer_durations(&self, recipe: &mut Recipe, report: &mut NormalizeReport) {
        for shot in recipe.timeline.iter_mut() {
            let duration = shot.duration();
            for layer in shot.layers.iter_mut() {
                if let Layer::Video { dur, .. } = layer {
                    if dur.is_none() {
                        *dur = Some(duration);
                        report.layer_durations_backfilled += 1;
                    }
                }
            }
        }
    }
}

/// Staged upload for `role`: `<dir>/<role>.<ext>` or the first file in `<dir>/<role>/`.
pub fn staged_file(dir: &Path, role: &str) -> Option<PathBuf> {
    let by_stem = list_files(dir)
        .into_iter()
        .find(|p| p.file_stem().and_then(|s| s.to_str()) == Some(role));
    by_stem.or_else(|| list_files(&dir.join(role)).into_iter().next())
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    files
}

/// Normalize with the given options; convenience for one-off calls.
pub fn normalize(recipe: &mut Recipe, options: &NormalizeOptions) -> NormalizeReport {
    Normalizer::new(options.clone()).normalize(recipe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{Shot, TIME_EPSILON};
    use crate::validator::validate;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"x").unwrap();
        path
    }

    fn recipe_with_roles(roles: &[&str]) -> Recipe {
        let mut recipe = Recipe::default();
        for (i, role) in roles.iter().enumerate() {
            let mut shot = Shot::new(i as f64, i as f64 + 1.0);
            shot.layers.push(Layer::image(*role));
            recipe.timeline.push(shot);
        }
        recipe
    }

    #[test]
    fn test_scarcity_round_robin_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.jpg");
        let b = touch(dir.path(), "b.jpg");

        let mut recipe = recipe_with_roles(&["p1", "p2", "p3", "p4"]);
        recipe.assets.insert("a".into(), AssetDescriptor::new("a", &a));
        recipe.assets.insert("b".into(), AssetDescriptor::new("b", &b));

        let report = normalize(&mut recipe, &NormalizeOptions::default());
        assert_eq!(recipe.assets["p1"].path, a);
        assert_eq!(recipe.assets["p2"].path, b);
        assert_eq!(recipe.assets["p3"].path, a);
        assert_eq!(recipe.assets["p4"].path, b);
        assert_eq!(report.fallback_roles().len(), 4);
        assert!(recipe
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::AssetScarcity));
    }

    #[test]
    fn test_fail_policy_leaves_roles_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.jpg");
        let mut recipe = recipe_with_roles(&["product", "store"]);
        recipe.assets.insert("product".into(), AssetDescriptor::new("product", &a));

        let options = NormalizeOptions {
            scarcity: ScarcityPolicy::Fail,
            ..NormalizeOptions::default()
        };
        let report = normalize(&mut recipe, &options);
        assert_eq!(report.unresolved_roles(), vec!["store"]);
        assert!(!recipe.assets.contains_key("store"));
        assert_eq!(validate(&recipe).len(), 1);
    }

    #[test]
    fn test_resolution_priority() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("assets");
        std::fs::create_dir_all(staging.join("store")).unwrap();
        let staged_product = touch(&staging, "product.png");
        let staged_store = touch(&staging.join("store"), "front.jpg");
        let explicit = touch(dir.path(), "hero.jpg");
        let kept = touch(dir.path(), "kept.mp4");

        let mut recipe = recipe_with_roles(&["product", "store", "clip"]);
        recipe.assets.insert("clip".into(), AssetDescriptor::new("clip", &kept));
        recipe
            .assets
            .insert("product".into(), AssetDescriptor::new("product", "/gone.jpg"));

        let options = NormalizeOptions {
            explicit: BTreeMap::from([("store".to_string(), explicit.clone())]),
            staging_dir: Some(staging.clone()),
            ..NormalizeOptions::default()
        };
        let report = normalize(&mut recipe, &options);
        assert_eq!(recipe.assets["store"].path, explicit);
        assert_eq!(recipe.assets["product"].path, staged_product);
        assert_eq!(recipe.assets["clip"].path, kept);
        assert_eq!(
            report.roles["clip"],
            Resolution::Existing { path: kept.clone() }
        );
        assert_eq!(staged_file(&staging, "store"), Some(staged_store));
    }

    #[test]
    fn test_degenerate_shot_is_repaired_and_passes_validation() {
        let dir = tempfile::tempdir().unwrap();
        let product = touch(dir.path(), "product.jpg");

        let mut recipe = Recipe::from_json(&format!(
            r#"{{"assets": {{"product": "{}"}},
                "timeline": [{{"t": [2.0, 2.0], "layers": [{{"type": "image", "ref": "product"}}]}}]}}"#,
            product.display()
        ))
        .unwrap();

        let report = normalize(&mut recipe, &NormalizeOptions::default());
        assert_eq!(report.durations_repaired, vec![0]);
        let shot = &recipe.timeline[0];
        assert!((shot.start() - 2.0).abs() < TIME_EPSILON);
        assert!((shot.end() - 4.0).abs() < TIME_EPSILON);
        assert!(validate(&recipe).is_empty());
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let a = touch(dir.path(), "a.jpg");
        let raw = format!(
            r#"{{"assets": {{"hero": "{}"}},
                "shots": [
                    {{"in": 0.0, "out": 1.5, "layers": [{{"type": "video", "ref": "hero"}}]}},
                    {{"t": [1.5, 1.5], "layers": [{{"type": "image", "ref": "store"}}, {{"type": "text", "text": "Open"}}]}},
                    {{"t": [3.0, 4.0], "in": 3.0, "out": 5.0, "layers": [{{"type": "video", "ref": "broll"}}]}},
                    {{"layers": []}}
                ]}}"#,
            a.display()
        );
        let mut recipe = Recipe::from_json(&raw).unwrap();
        normalize(&mut recipe, &NormalizeOptions::default());
        let first = recipe.to_json_pretty().unwrap();

        let mut reloaded = Recipe::from_json(&first).unwrap();
        let report = normalize(&mut reloaded, &NormalizeOptions::default());
        let second = reloaded.to_json_pretty().unwrap();

        assert_eq!(first, second);
        assert_eq!(report.warnings_added, 0);
        assert_eq!(report.time_forms_synced, 0);
        assert!(report.durations_repaired.is_empty());
    }

    #[test]
    fn test_duration_invariant_after_normalize() {
        let raw = r#"{"timeline": [
            {"in": 0.0, "out": 2.0},
            {"t": [2.0, 1.0]},
            {"in": 5.0, "dur": 1.25},
            {}
        ]}"#;
        let mut recipe = Recipe::from_json(raw).unwrap();
        normalize(&mut recipe, &NormalizeOptions::default());

        let value = serde_json::to_value(&recipe).unwrap();
        for shot in value["timeline"].as_array().unwrap() {
            let t = shot["t"].as_array().unwrap();
            let (start, end) = (t[0].as_f64().unwrap(), t[1].as_f64().unwrap());
            assert!(end > start);
            assert_eq!(shot["in"].as_f64().unwrap(), start);
            assert_eq!(shot["out"].as_f64().unwrap(), end);
            assert!((shot["dur"].as_f64().unwrap() - (end - start)).abs() < TIME_EPSILON);
        }
        assert!(recipe
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::TimeMissing && w.shot == Some(3)));
    }

    #[test]
    fn test_video_layer_inherits_shot_duration() {
        let mut recipe = Recipe::default();
        let mut shot = Shot::new(1.0, 3.5);
        shot.layers.push(Layer::video("clip"));
        recipe.timeline.push(shot);

        normalize(&mut recipe, &NormalizeOptions::default());
        match &recipe.timeline[0].layers[0] {
            Layer::Video { dur, .. } => assert_eq!(*dur, Some(2.5)),
            other => panic!("unexpected layer {:?}", other),
        }
    }

    #[test]
    fn test_empty_timeline_is_left_alone() {
        let mut recipe = Recipe::default();
        let report = normalize(&mut recipe, &NormalizeOptions::default());
        assert!(recipe.timeline.is_empty());
        assert!(report.roles.is_empty());
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("round-robin".parse(), Ok(ScarcityPolicy::RoundRobin));
        assert_eq!("FAIL".parse(), Ok(ScarcityPolicy::Fail));
        assert!("random".parse::<ScarcityPolicy>().is_err());
        assert_eq!(ScarcityPolicy::RoundRobin.to_string(), "round_robin");
    }
}
