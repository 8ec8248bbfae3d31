use anyhow::{Context, Result};
use configparser::ini::Ini;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::normalizer::ScarcityPolicy;
use crate::recipe::Canvas;

const ENV_PREFIX: &str = "ADGEN";

/// Reference analysis settings
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisConfig {
    /// Content-change threshold (0.0-1.0) above which a cut is declared
    pub threshold: f64,
    /// Minimum scene length in seconds
    pub min_scene_len: f64,
    /// Frames are downscaled to this width before analysis
    pub analysis_width: u32,
    /// Palette size per shot
    pub palette_k: usize,
    /// OCR languages, ISO 639-1 codes
    pub ocr_languages: Vec<String>,
    /// OCR entries below this confidence (0.0-1.0) are dropped
    pub ocr_min_confidence: f64,
    pub ocr_enabled: bool,
    /// Mono PCM sample rate for tempo estimation
    pub audio_sample_rate: u32,
    /// Beats kept in the recipe
    pub max_beats: usize,
    /// Mean flow magnitude (px at analysis scale) below which a shot is static
    pub motion_static_threshold: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            threshold: 0.35,
            min_scene_len: 0.5,
            analysis_width: 320,
            palette_k: 5,
            ocr_languages: vec!["ko".to_string(), "en".to_string()],
            ocr_min_confidence: 0.5,
            ocr_enabled: true,
            audio_sample_rate: 22_050,
            max_beats: 128,
            motion_static_threshold: 1.0,
        }
    }
}

/// Normalization and render settings
#[derive(Debug, Clone, PartialEq)]
pub struct RenderConfig {
    /// Output canvas stamped into freshly assembled recipes
    pub canvas: Canvas,
    /// Cap on shots taken from the reference (0 = no cap)
    pub max_shots: usize,
    /// Transition length as a fraction of the incoming shot
    pub transition_fraction: f64,
    /// Degenerate shots are extended to this length (seconds)
    pub min_shot_floor: f64,
    pub scarcity_policy: ScarcityPolicy,
    /// TTF/OTF used for captions and placeholders
    pub font_path: Option<PathBuf>,
    pub safe_mode: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            canvas: Canvas::default(),
            max_shots: 0,
            transition_fraction: 0.2,
            min_shot_floor: 2.0,
            scarcity_policy: ScarcityPolicy::RoundRobin,
            font_path: None,
            safe_mode: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub analysis: AnalysisConfig,
    pub render: RenderConfig,
    /// Root of the job-scoped staging area
    pub staging_root: PathBuf,
    pub bind: String,
    pub webhook_url: Option<String>,
    /// trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            analysis: AnalysisConfig::default(),
            render: RenderConfig::default(),
            staging_root: PathBuf::from("./adgen-data"),
            bind: "0.0.0.0:9000".to_string(),
            webhook_url: None,
            log_level: "info".to_string(),
        }
    }
}

/// Values given on the command line; they win over every other source.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub threshold: Option<f64>,
    pub min_scene_len: Option<f64>,
    pub staging_root: Option<PathBuf>,
    pub font_path: Option<PathBuf>,
    pub scarcity_policy: Option<ScarcityPolicy>,
    pub safe_mode: Option<bool>,
    pub webhook_url: Option<String>,
    pub bind: Option<String>,
    pub log_level: Option<String>,
}

/// Key lookup across the environment and an optional INI file.
struct Sources {
    file: Option<Ini>,
}

impl Sources {
    /// `ADGEN_<SECTION>_<KEY>` first, then `[section] key` in the file.
    fn raw(&self, section: &str, key: &str) -> Option<String> {
        let env_key = format!(
            "{}_{}_{}",
            ENV_PREFIX,
            section.to_ascii_uppercase(),
            key.to_ascii_uppercase()
        );
        env::var(env_key)
            .ok()
            .or_else(|| self.file.as_ref().and_then(|ini| ini.get(section, key)))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: FromStr>(&self, section: &str, key: &str) -> Option<T> {
        let raw = self.raw(section, key)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("⚠️  [config] ignoring unparsable {}.{} = {:?}", section, key, raw);
                None
            }
        }
    }

    fn flag(&self, section: &str, key: &str) -> Option<bool> {
        self.raw(section, key)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }
}

/// Config loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Merge config sources. Precedence: CLI > environment > config file > defaults
    pub fn load(config_file: Option<&Path>, overrides: &ConfigOverrides) -> Result<AppConfig> {
        let file = match config_file {
            Some(path) => Some(Self::read_ini(path)?),
            None => Self::default_location().map(|p| Self::read_ini(&p)).transpose()?,
        };
        let sources = Sources { file };
        let defaults = AppConfig::default();

        let analysis = AnalysisConfig {
            threshold: overrides
                .threshold
                .or_else(|| sources.parsed("analysis", "threshold"))
                .unwrap_or(defaults.analysis.threshold),
            min_scene_len: overrides
                .min_scene_len
                .or_else(|| sources.parsed("analysis", "min_scene_len"))
                .unwrap_or(defaults.analysis.min_scene_len),
            analysis_width: sources
                .parsed("analysis", "analysis_width")
                .unwrap_or(defaults.analysis.analysis_width),
            palette_k: sources
                .parsed("analysis", "palette_k")
                .filter(|k: &usize| *k > 0)
                .unwrap_or(defaults.analysis.palette_k),
            ocr_languages: sources
                .raw("analysis", "ocr_languages")
                .map(|v| {
                    v.split(',')
                        .map(|l| l.trim().to_string())
                        .filter(|l| !l.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.analysis.ocr_languages),
            ocr_min_confidence: sources
                .parsed("analysis", "ocr_min_confidence")
                .unwrap_or(defaults.analysis.ocr_min_confidence),
            ocr_enabled: sources
                .flag("analysis", "ocr_enabled")
                .unwrap_or(defaults.analysis.ocr_enabled),
            audio_sample_rate: sources
                .parsed("analysis", "audio_sample_rate")
                .unwrap_or(defaults.analysis.audio_sample_rate),
            max_beats: sources
                .parsed("analysis", "max_beats")
                .unwrap_or(defaults.analysis.max_beats),
            motion_static_threshold: sources
                .parsed("analysis", "motion_static_threshold")
                .unwrap_or(defaults.analysis.motion_static_threshold),
        };

        let render = RenderConfig {
            canvas: Canvas {
                width: sources.parsed("render", "width").unwrap_or(defaults.render.canvas.width),
                height: sources
                    .parsed("render", "height")
                    .unwrap_or(defaults.render.canvas.height),
                fps: sources.parsed("render", "fps").unwrap_or(defaults.render.canvas.fps),
                bitrate: sources
                    .raw("render", "bitrate")
                    .unwrap_or_else(|| defaults.render.canvas.bitrate.clone()),
            },
            max_shots: sources
                .parsed("render", "max_shots")
                .unwrap_or(defaults.render.max_shots),
            transition_fraction: sources
                .parsed("render", "transition_fraction")
                .unwrap_or(defaults.render.transition_fraction),
            min_shot_floor: sources
                .parsed("render", "min_shot_floor")
                .filter(|f: &f64| *f > 0.0)
                .unwrap_or(defaults.render.min_shot_floor),
            scarcity_policy: overrides
                .scarcity_policy
                .or_else(|| sources.parsed("render", "scarcity_policy"))
                .unwrap_or(defaults.render.scarcity_policy),
            font_path: overrides
                .font_path
                .clone()
                .or_else(|| sources.raw("render", "font_path").map(PathBuf::from)),
            safe_mode: overrides
                .safe_mode
                .or_else(|| sources.flag("render", "safe_mode"))
                .unwrap_or(defaults.render.safe_mode),
        };

        Ok(AppConfig {
            analysis,
            render,
            staging_root: overrides
                .staging_root
                .clone()
                .or_else(|| sources.raw("staging", "root").map(PathBuf::from))
                .unwrap_or(defaults.staging_root),
            bind: overrides
                .bind
                .clone()
                .or_else(|| sources.raw("server", "bind"))
                .unwrap_or(defaults.bind),
            webhook_url: overrides
                .webhook_url
                .clone()
                .or_else(|| sources.raw("webhook", "url")),
            log_level: overrides
                .log_level
                .clone()
                .or_else(|| sources.raw("logging", "level"))
                .unwrap_or(defaults.log_level),
        })
    }

    fn read_ini(path: &Path) -> Result<Ini> {
        if !path.exists() {
            anyhow::bail!("config file does not exist: {}", path.display());
        }
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path.display(), e))?;
        Ok(ini)
    }

    /// First existing file among the default locations
    fn default_location() -> Option<PathBuf> {
        let mut candidates = vec![PathBuf::from("adgen.ini"), PathBuf::from(".adgen.ini")];
        if let Some(home) = env::var_os("HOME") {
            candidates.push(PathBuf::from(home).join(".adgen.ini"));
        }
        candidates.push(PathBuf::from("/etc/adgen.ini"));
        candidates.into_iter().find(|p| p.exists())
    }

    /// Write a config file holding every default
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let defaults = AppConfig::default();
        let a = &defaults.analysis;
        let r = &defaults.render;

        let mut ini = Ini::new();
        let mut set = |section: &str, key: &str, value: String| {
            ini.set(section, key, Some(value));
        };
        set("analysis", "threshold", a.threshold.to_string());
        set("analysis", "min_scene_len", a.min_scene_len.to_string());
        set("analysis", "analysis_width", a.analysis_width.to_string());
        set("analysis", "palette_k", a.palette_k.to_string());
        set("analysis", "ocr_languages", a.ocr_languages.join(","));
        set("analysis", "ocr_min_confidence", a.ocr_min_confidence.to_string());
        set("analysis", "ocr_enabled", a.ocr_enabled.to_string());
        set("analysis", "audio_sample_rate", a.audio_sample_rate.to_string());
        set("analysis", "max_beats", a.max_beats.to_string());
        set("analysis", "motion_static_threshold", a.motion_static_threshold.to_string());
        set("render", "width", r.canvas.width.to_string());
        set("render", "height", r.canvas.height.to_string());
        set("render", "fps", r.canvas.fps.to_string());
        set("render", "bitrate", r.canvas.bitrate.clone());
        set("render", "max_shots", r.max_shots.to_string());
        set("render", "transition_fraction", r.transition_fraction.to_string());
        set("render", "min_shot_floor", r.min_shot_floor.to_string());
        set("render", "scarcity_policy", r.scarcity_policy.to_string());
        set("render", "font_path", String::new());
        set("render", "safe_mode", r.safe_mode.to_string());
        set("staging", "root", defaults.staging_root.display().to_string());
        set("server", "bind", defaults.bind.clone());
        set("webhook", "url", String::new());
        set("logging", "level", defaults.log_level.clone());

        ini.write(config_path)
            .with_context(|| format!("failed to write config file: {}", config_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_values_and_cli_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adgen.ini");
        std::fs::write(
            &path,
            "[analysis]\nthreshold = 0.5\npalette_k = 4\nocr_languages = en\n\
             [render]\nscarcity_policy = fail\nmin_shot_floor = 3.0\nwidth = 720\nbitrate = 2500k\n\
             [staging]\nroot = /srv/adgen\n",
        )
        .unwrap();

        let overrides = ConfigOverrides {
            threshold: Some(0.25),
            ..Default::default()
        };
        let config = ConfigLoader::load(Some(&path), &overrides).unwrap();
        assert_eq!(config.analysis.threshold, 0.25);
        assert_eq!(config.analysis.palette_k, 4);
        assert_eq!(config.analysis.ocr_languages, vec!["en"]);
        assert_eq!(config.render.scarcity_policy, ScarcityPolicy::Fail);
        assert_eq!(config.render.min_shot_floor, 3.0);
        assert_eq!(config.render.canvas.width, 720);
        assert_eq!(config.render.canvas.height, 1920);
        assert_eq!(config.render.canvas.bitrate, "2500k");
        assert_eq!(config.staging_root, PathBuf::from("/srv/adgen"));
        assert_eq!(config.analysis.min_scene_len, 0.5);
    }

    #[test]
    fn test_default_config_file_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("default.ini");
        ConfigLoader::create_default_config(&path).unwrap();
        let config = ConfigLoader::load(Some(&path), &ConfigOverrides::default()).unwrap();
        assert_eq!(config.analysis, AnalysisConfig::default());
        assert_eq!(config.render, RenderConfig::default());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = ConfigLoader::load(
            Some(Path::new("/nonexistent/adgen.ini")),
            &ConfigOverrides::default(),
        );
        assert!(result.is_err());
    }
}
