use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use adgen::config::{AppConfig, ConfigLoader, ConfigOverrides};
use adgen::handler::{router, AppState};
use adgen::job::{JobContext, JobStore};
use adgen::normalizer::{normalize, NormalizeOptions, ScarcityPolicy};
use adgen::processor::{analyze_reference, prepare_recipe, render_job, run_pipeline, PipelineRequest};
use adgen::recipe::Recipe;
use adgen::render::{MANIFEST_FILE, SUBTITLE_FILE, VIDEO_FILE};
use adgen::validator::ensure_valid;
use adgen::PipelineError;

/// Reference-driven ad video generator: analyse a reference clip into a
/// recipe, repair and validate it, then render it with your own assets.
#[derive(Parser, Debug)]
#[command(name = "adgen", version)]
#[command(about = "Analyse reference videos into recipes and render ads from them", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// Precedence: command line > ADGEN_* environment > config file > defaults
#[derive(Args, Debug)]
struct GlobalArgs {
    /// INI config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root of the job staging area
    #[arg(long, global = true)]
    staging_root: Option<PathBuf>,

    /// Content-change threshold (0.0-1.0) for shot cuts
    #[arg(long, global = true)]
    threshold: Option<f64>,

    /// Minimum shot length in seconds
    #[arg(long, global = true)]
    min_scene_len: Option<f64>,

    /// TTF/OTF font for captions and placeholders
    #[arg(long, global = true)]
    font: Option<PathBuf>,

    /// round_robin or fail
    #[arg(long, global = true)]
    scarcity_policy: Option<ScarcityPolicy>,

    #[arg(long, global = true)]
    webhook_url: Option<String>,

    /// trace, debug, info, warn, error (RUST_LOG wins)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyse a reference video into a draft recipe
    Analyze {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        project: String,

        /// Shot list JSON (captions and role overrides)
        #[arg(long)]
        shotlist: Option<PathBuf>,
    },
    /// Repair a recipe and resolve its assets in place
    Normalize {
        #[arg(short, long)]
        recipe: PathBuf,

        /// Take staged uploads from this project
        #[arg(short, long)]
        project: Option<String>,

        /// role=path, may be repeated
        #[arg(long = "asset", value_parser = parse_asset)]
        assets: Vec<(String, PathBuf)>,

        /// Write here instead of overwriting the input
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List what would block rendering
    Validate {
        #[arg(short, long)]
        recipe: PathBuf,
    },
    /// Normalize, validate and render a recipe
    Render {
        #[arg(short, long)]
        recipe: PathBuf,

        #[arg(short, long)]
        project: String,

        #[arg(long = "asset", value_parser = parse_asset)]
        assets: Vec<(String, PathBuf)>,

        /// Base layers only: no captions, logos or effects
        #[arg(long)]
        safe_mode: bool,

        /// Also copy the artifacts here
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite a video already present in --output
        #[arg(long)]
        force: bool,
    },
    /// Full pipeline: analyse, prepare and render
    Run {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        project: String,

        #[arg(long)]
        shotlist: Option<PathBuf>,

        #[arg(long = "asset", value_parser = parse_asset)]
        assets: Vec<(String, PathBuf)>,

        #[arg(long)]
        safe_mode: bool,
    },
    /// HTTP job API
    Serve {
        /// Listen address (defaults to FC_SERVER_PORT, then the config)
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Write a config file holding every default
    InitConfig { path: PathBuf },
}

fn parse_asset(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((role, path)) if !role.trim().is_empty() && !path.trim().is_empty() => {
            Ok((role.trim().to_string(), PathBuf::from(path.trim())))
        }
        _ => Err(format!("expected role=path, got '{}'", raw)),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn read_shotlist(path: Option<&Path>) -> Result<Option<String>> {
    path.map(|p| {
        std::fs::read_to_string(p).with_context(|| format!("failed to read shotlist: {}", p.display()))
    })
    .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { path } = &cli.command {
        ConfigLoader::create_default_config(path)?;
        println!("wrote default config to {}", path.display());
        return Ok(());
    }

    let g = cli.global;
    let overrides = ConfigOverrides {
        threshold: g.threshold,
        min_scene_len: g.min_scene_len,
        staging_root: g.staging_root,
        font_path: g.font,
        scarcity_policy: g.scarcity_policy,
        safe_mode: None,
        webhook_url: g.webhook_url,
        bind: None,
        log_level: g.log_level,
    };
    let config = ConfigLoader::load(g.config.as_deref(), &overrides).context("failed to load configuration")?;
    init_logging(&config.log_level);

    match cli.command {
        Commands::Analyze {
            input,
            project,
            shotlist,
        } => {
            let shotlist = read_shotlist(shotlist.as_deref())?;
            let ctx = JobContext::new(&config.staging_root, &project)?;
            let store = JobStore::new(&config.staging_root);
            let output = analyze_reference(&ctx, &store, &input, shotlist.as_deref(), &config).await?;
            println!("{}", output.recipe_path.display());
        }
        Commands::Normalize {
            recipe: recipe_path,
            project,
            assets,
            output,
        } => {
            let mut recipe = Recipe::load(&recipe_path)?;
            let staging_dir = match project {
                Some(project) => Some(JobContext::new(&config.staging_root, &project)?.assets_dir()),
                None => None,
            };
            let options = NormalizeOptions {
                min_shot_floor: config.render.min_shot_floor,
                scarcity: config.render.scarcity_policy,
                explicit: assets.into_iter().collect(),
                staging_dir,
            };
            let report = normalize(&mut recipe, &options);
            let target = output.unwrap_or(recipe_path);
            recipe.save(&target)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Validate { recipe } => {
            let recipe = Recipe::load(&recipe)?;
            if let Err(err) = ensure_valid(&recipe) {
                if let PipelineError::ValidationFailed { defects } = &err {
                    for defect in defects {
                        println!("{}", defect);
                    }
                }
                return Err(err.into());
            }
            println!("OK");
        }
        Commands::Render {
            recipe: recipe_path,
            project,
            assets,
            safe_mode,
            output,
            force,
        } => {
            if let Some(dir) = &output {
                if dir.join(VIDEO_FILE).exists() && !force {
                    bail!("{} already exists; pass --force to overwrite", dir.join(VIDEO_FILE).display());
                }
            }
            let mut recipe = Recipe::load(&recipe_path)?;
            let mut ctx = JobContext::new(&config.staging_root, &project)?;
            let explicit: BTreeMap<String, PathBuf> = assets.into_iter().collect();
            let preparation = prepare_recipe(&mut ctx, &mut recipe, &config.render, &explicit)?;
            JobStore::new(&config.staging_root).save_recipe(&ctx, &recipe)?;
            if !preparation.passed() {
                for defect in &preparation.defects {
                    eprintln!("{}", defect);
                }
                bail!("recipe is not render-ready ({} defect(s))", preparation.defects.len());
            }

            let rendered = render_job(ctx, recipe, config.clone(), safe_mode || config.render.safe_mode).await?;
            if let Some(dir) = output {
                copy_artifacts(rendered.video_path.parent().unwrap_or(Path::new(".")), &dir)?;
            }
            println!("{}", rendered.video_path.display());
        }
        Commands::Run {
            input,
            project,
            shotlist,
            assets,
            safe_mode,
        } => {
            let request = PipelineRequest {
                input,
                project_id: project,
                shotlist: read_shotlist(shotlist.as_deref())?,
                assets: assets.into_iter().collect(),
                safe_mode,
            };
            let output = run_pipeline(request, &config).await?;
            println!("{}", output.render.video_path.display());
        }
        Commands::Serve { bind } => {
            let bind_addr = bind.unwrap_or_else(|| {
                std::env::var("FC_SERVER_PORT")
                    .map(|port| format!("0.0.0.0:{}", port))
                    .unwrap_or_else(|_| config.bind.clone())
            });
            start_web_server(&bind_addr, config).await?;
        }
        // written before any config was loaded
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

fn copy_artifacts(from: &Path, to: &Path) -> Result<()> {
    std::fs::create_dir_all(to).with_context(|| format!("failed to create {}", to.display()))?;
    for name in [VIDEO_FILE, SUBTITLE_FILE, MANIFEST_FILE] {
        let source = from.join(name);
        let target = to.join(name);
        if source.exists() {
            std::fs::copy(&source, &target)
                .with_context(|| format!("failed to copy {}", source.display()))?;
        } else if target.exists() {
            // left over from an earlier render into the same directory
            std::fs::remove_file(&target)
                .with_context(|| format!("failed to remove stale {}", target.display()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_artifacts_drops_stale_subtitles() {
        let dir = tempfile::tempdir().unwrap();
        let (job, out) = (dir.path().join("job"), dir.path().join("out"));
        std::fs::create_dir_all(&job).unwrap();
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(job.join(VIDEO_FILE), b"new video").unwrap();
        std::fs::write(job.join(MANIFEST_FILE), b"{}").unwrap();
        std::fs::write(out.join(VIDEO_FILE), b"old video").unwrap();
        std::fs::write(out.join(SUBTITLE_FILE), b"1\n00:00:00,000 --> 00:00:01,000\nold\n").unwrap();

        copy_artifacts(&job, &out).unwrap();
        assert_eq!(std::fs::read(out.join(VIDEO_FILE)).unwrap(), b"new video");
        assert!(out.join(MANIFEST_FILE).exists());
        assert!(!out.join(SUBTITLE_FILE).exists());
    }

    #[test]
    fn test_parse_asset() {
        assert_eq!(
            parse_asset("logo=/tmp/logo.png").unwrap(),
            ("logo".to_string(), PathBuf::from("/tmp/logo.png"))
        );
        assert!(parse_asset("logo").is_err());
        assert!(parse_asset("=x.png").is_err());
    }
}

async fn start_web_server(bind: &str, config: AppConfig) -> Result<()> {
    let app = router(AppState::new(config));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {}", bind))?;

    tracing::info!("🌐 [server] listening on http://{}", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("  • health:        GET  http://{}/health", bind);
    tracing::info!("  • analyze:       POST http://{}/analyze", bind);
    tracing::info!("  • render:        POST http://{}/render", bind);
    tracing::info!("  • latest recipe: GET  http://{}/projects/<id>/recipes/latest", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}
