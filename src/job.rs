//! Per-job context, recipe lifecycle and job-scoped persistence.
//!
//! Every staged path is keyed by project and job id, so concurrent jobs never
//! write to a shared file. "Latest recipe" is a query over the project's
//! recipe directory rather than a file that gets overwritten.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::recipe::Recipe;

/// Cooperative cancellation shared between a job and whoever may stop it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> PipelineResult<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecipeState {
    Draft,
    Normalized,
    Validated { pass: bool },
    Rendering,
    Rendered,
    Failed,
}

impl fmt::Display for RecipeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecipeState::Draft => f.write_str("draft"),
            RecipeState::Normalized => f.write_str("normalized"),
            RecipeState::Validated { pass: true } => f.write_str("validated(pass)"),
            RecipeState::Validated { pass: false } => f.write_str("validated(fail)"),
            RecipeState::Rendering => f.write_str("rendering"),
            RecipeState::Rendered => f.write_str("rendered"),
            RecipeState::Failed => f.write_str("failed"),
        }
    }
}

impl RecipeState {
    pub fn can_transition(self, to: RecipeState) -> bool {
        use RecipeState::*;
        matches!(
            (self, to),
            (Draft, Normalized)
                | (Normalized, Normalized)
                | (Normalized, Validated { .. })
                // a failed validation may be repaired and resubmitted
                | (Validated { .. }, Normalized)
                | (Validated { pass: true }, Rendering)
                | (Rendering, Rendered)
                | (Rendering, Failed)
        )
    }

    pub fn transition(self, to: RecipeState) -> PipelineResult<RecipeState> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(PipelineError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RecipeState::Rendered | RecipeState::Failed)
    }
}

/// Project and job ids end up in paths; keep them to a safe alphabet.
pub fn validate_id(kind: &str, id: &str) -> PipelineResult<()> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(PipelineError::Config(format!("invalid {} id: {:?}", kind, id)))
    }
}

/// Everything one pipeline run needs to know about where it lives.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: String,
    project_id: String,
    root: PathBuf,
    state: RecipeState,
    cancel: CancelFlag,
}

impl JobContext {
    pub fn new(root: impl Into<PathBuf>, project_id: &str) -> PipelineResult<Self> {
        Self::with_job_id(root, project_id, &uuid::Uuid::new_v4().to_string())
    }

    pub fn with_job_id(
        root: impl Into<PathBuf>,
        project_id: &str,
        job_id: &str,
    ) -> PipelineResult<Self> {
        validate_id("project", project_id)?;
        validate_id("job", job_id)?;
        Ok(Self {
            job_id: job_id.to_string(),
            project_id: project_id.to_string(),
            root: root.into(),
            state: RecipeState::Draft,
            cancel: CancelFlag::new(),
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn project_dir(&self) -> PathBuf {
        self.root.join(&self.project_id)
    }

    /// Uploads staged by role: `<role>.<ext>` or `<role>/<file>`
    pub fn assets_dir(&self) -> PathBuf {
        self.project_dir().join("assets")
    }

    pub fn recipes_dir(&self) -> PathBuf {
        self.project_dir().join("recipes")
    }

    pub fn job_dir(&self) -> PathBuf {
        self.project_dir().join("jobs").join(&self.job_id)
    }

    pub fn frames_dir(&self) -> PathBuf {
        self.job_dir().join("frames")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.job_dir().join("output")
    }

    pub fn prepare_dirs(&self) -> PipelineResult<()> {
        for dir in [
            self.assets_dir(),
            self.recipes_dir(),
            self.frames_dir(),
            self.output_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn state(&self) -> RecipeState {
        self.state
    }

    pub fn advance(&mut self, to: RecipeState) -> PipelineResult<()> {
        let next = self.state.transition(to).map_err(|e| {
            warn!("⚠️  [job {}] {}", self.job_id, e);
            e
        })?;
        info!("🔁 [job {}] {} -> {}", self.job_id, self.state, next);
        self.state = next;
        Ok(())
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn check_cancelled(&self) -> PipelineResult<()> {
        self.cancel.check()
    }
}

/// Recipe persistence under `<root>/<project>/recipes/`.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn recipes_dir(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id).join("recipes")
    }

    /// Write `recipe` as `<timestamp>_<job>.json`; never overwrites another job's file.
    pub fn save_recipe(&self, ctx: &JobContext, recipe: &Recipe) -> Result<PathBuf> {
        let name = format!(
            "{}_{}.json",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
            ctx.job_id()
        );
        let path = self.recipes_dir(ctx.project_id()).join(name);
        recipe.save(&path)?;
        info!("💾 [job {}] recipe saved: {}", ctx.job_id(), path.display());
        Ok(path)
    }

    /// Stored recipe files, oldest first.
    pub fn list_recipes(&self, project_id: &str) -> Result<Vec<PathBuf>> {
        validate_id("project", project_id)?;
        let dir = self.recipes_dir(project_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Most recently saved recipe of a project.
    pub fn latest_recipe(&self, project_id: &str) -> Result<Option<(PathBuf, Recipe)>> {
        let Some(path) = self.list_recipes(project_id)?.pop() else {
            return Ok(None);
        };
        let recipe = Recipe::load(&path)?;
        Ok(Some((path, recipe)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::Shot;

    #[test]
    fn test_state_machine() {
        use RecipeState::*;
        let s = Draft.transition(Normalized).unwrap();
        let s = s.transition(Validated { pass: false }).unwrap();
        assert!(s.transition(Rendering).is_err());
        let s = s.transition(Normalized).unwrap();
        let s = s.transition(Validated { pass: true }).unwrap();
        let s = s.transition(Rendering).unwrap();
        let s = s.transition(Failed).unwrap();
        assert!(s.is_terminal());
        assert!(matches!(
            s.transition(Rendering),
            Err(PipelineError::InvalidTransition { .. })
        ));
        assert!(Draft.transition(Rendering).is_err());
    }

    #[test]
    fn test_paths_are_job_scoped() {
        let a = JobContext::new("/data", "cafe").unwrap();
        let b = JobContext::new("/data", "cafe").unwrap();
        assert_ne!(a.job_id(), b.job_id());
        assert_ne!(a.output_dir(), b.output_dir());
        assert_eq!(a.assets_dir(), b.assets_dir());
        assert!(a.frames_dir().starts_with(a.job_dir()));
    }

    #[test]
    fn test_ids_are_path_safe() {
        assert!(JobContext::new("/data", "../etc").is_err());
        assert!(JobContext::new("/data", "").is_err());
        assert!(JobContext::with_job_id("/data", "p1", "a/b").is_err());
    }

    #[test]
    fn test_latest_recipe_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        assert!(store.latest_recipe("shop").unwrap().is_none());

        let first = JobContext::with_job_id(dir.path(), "shop", "job-a").unwrap();
        let second = JobContext::with_job_id(dir.path(), "shop", "job-b").unwrap();
        let mut recipe = Recipe::default();
        recipe.timeline.push(Shot::new(0.0, 1.0));
        store.save_recipe(&first, &recipe).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        recipe.timeline.push(Shot::new(1.0, 2.0));
        let latest_path = store.save_recipe(&second, &recipe).unwrap();

        let (path, latest) = store.latest_recipe("shop").unwrap().unwrap();
        assert_eq!(path, latest_path);
        assert_eq!(latest.timeline.len(), 2);
        assert_eq!(store.list_recipes("shop").unwrap().len(), 2);
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let ctx = JobContext::new("/data", "p").unwrap();
        let flag = ctx.cancel_flag();
        assert!(ctx.check_cancelled().is_ok());
        flag.cancel();
        assert!(matches!(ctx.check_cancelled(), Err(PipelineError::Cancelled)));
    }
}
