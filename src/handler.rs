use axum::{
    extract::{Json, Path as UrlPath, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::job::{validate_id, JobContext, JobStore};
use crate::metadata::AnalysisSummary;
use crate::processor::{analyze_reference, prepare_recipe, render_job};
use crate::recipe::Recipe;
use crate::render::{RenderDiagnostics, RenderManifest};

/// Shared by every request
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: JobStore,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let store = JobStore::new(&config.staging_root);
        Self { config, store }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/analyze", post(handle_analyze))
        .route("/render", post(handle_render))
        .route("/projects/:project_id/recipes/latest", get(handle_latest_recipe))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub defects: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<RenderDiagnostics>,
}

type ApiError = (StatusCode, ResponseJson<ErrorResponse>);

fn reject(err: PipelineError) -> ApiError {
    let status = match &err {
        PipelineError::Config(_) => StatusCode::BAD_REQUEST,
        PipelineError::ValidationFailed { .. } | PipelineError::AnalysisFailure { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        PipelineError::InvalidTransition { .. } | PipelineError::Cancelled => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("❌ [http] {}", err);
    } else {
        warn!("⚠️  [http] {}", err);
    }
    let defects = match &err {
        PipelineError::ValidationFailed { defects } => defects.clone(),
        _ => Vec::new(),
    };
    (
        status,
        ResponseJson(ErrorResponse {
            success: false,
            message: err.to_string(),
            stage: err.stage().map(|s| s.to_string()),
            correlation_id: err.correlation_id().map(str::to_string),
            defects,
            diagnostics: err.diagnostics().cloned(),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    reject(PipelineError::Config(message.into()))
}

fn not_found(message: String) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        ResponseJson(ErrorResponse {
            success: false,
            message,
            stage: None,
            correlation_id: None,
            defects: Vec::new(),
            diagnostics: None,
        }),
    )
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    /// Reference video on the server's filesystem
    pub input: String,
    pub project_id: String,
    /// Shot list JSON, either as a string or inline
    #[serde(default)]
    pub shotlist: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub success: bool,
    pub job_id: String,
    pub recipe_file: String,
    pub summary: AnalysisSummary,
    pub recipe: Recipe,
}

pub async fn handle_analyze(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnalyzeRequest>,
) -> Result<ResponseJson<AnalyzeResponse>, ApiError> {
    info!("📥 [http] analyze {} for project {}", request.input, request.project_id);
    let input = PathBuf::from(&request.input);
    if !input.is_file() {
        return Err(not_found(format!("reference video not found: {}", input.display())));
    }
    let ctx = JobContext::new(&state.config.staging_root, &request.project_id).map_err(reject)?;
    let shotlist = request.shotlist.map(|value| match value {
        serde_json::Value::String(raw) => raw,
        other => other.to_string(),
    });

    let output = analyze_reference(&ctx, &state.store, &input, shotlist.as_deref(), &state.config)
        .await
        .map_err(reject)?;
    Ok(ResponseJson(AnalyzeResponse {
        success: true,
        job_id: ctx.job_id().to_string(),
        recipe_file: output.recipe_path.display().to_string(),
        summary: output.summary,
        recipe: output.recipe,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RenderRequest {
    pub project_id: String,
    /// Inline recipe; the project's latest stored recipe when absent
    #[serde(default)]
    pub recipe: Option<Recipe>,
    /// Role → file path overrides
    #[serde(default)]
    pub assets: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub safe_mode: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct RenderResponse {
    pub success: bool,
    pub job_id: String,
    pub video_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle_file: Option<String>,
    pub manifest: RenderManifest,
    pub diagnostics: RenderDiagnostics,
}

pub async fn handle_render(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RenderRequest>,
) -> Result<ResponseJson<RenderResponse>, ApiError> {
    info!("📥 [http] render for project {}", request.project_id);
    let ctx = JobContext::new(&state.config.staging_root, &request.project_id).map_err(reject)?;

    let recipe = match request.recipe {
        Some(recipe) => recipe,
        None => state
            .store
            .latest_recipe(&request.project_id)
            .map_err(|e| bad_request(format!("{:#}", e)))?
            .map(|(_, recipe)| recipe)
            .ok_or_else(|| bad_request(format!("project {} has no recipe", request.project_id)))?,
    };

    // staging lookups and file checks block
    let (ctx, recipe, preparation) = {
        let (store, render_config, assets) = (state.store.clone(), state.config.render.clone(), request.assets);
        let (mut ctx, mut recipe) = (ctx, recipe);
        tokio::task::spawn_blocking(move || -> Result<_, PipelineError> {
            let preparation = prepare_recipe(&mut ctx, &mut recipe, &render_config, &assets)?;
            store
                .save_recipe(&ctx, &recipe)
                .map_err(|e| PipelineError::Config(format!("recipe not saved: {:#}", e)))?;
            Ok((ctx, recipe, preparation))
        })
        .await
        .map_err(|e| reject(PipelineError::Io(std::io::Error::other(format!("worker failed: {}", e)))))?
        .map_err(reject)?
    };
    if !preparation.passed() {
        return Err(reject(PipelineError::ValidationFailed {
            defects: preparation.defects,
        }));
    }

    let job_id = ctx.job_id().to_string();
    let safe_mode = request.safe_mode.unwrap_or(state.config.render.safe_mode);
    let output = render_job(ctx, recipe, state.config.clone(), safe_mode)
        .await
        .map_err(reject)?;
    Ok(ResponseJson(RenderResponse {
        success: true,
        job_id,
        video_file: output.video_path.display().to_string(),
        subtitle_file: output.subtitle_path.map(|p| p.display().to_string()),
        manifest: output.manifest,
        diagnostics: output.diagnostics,
    }))
}

#[derive(Debug, Serialize)]
pub struct LatestRecipeResponse {
    pub recipe_file: String,
    pub recipe: Recipe,
}

pub async fn handle_latest_recipe(
    State(state): State<Arc<AppState>>,
    UrlPath(project_id): UrlPath<String>,
) -> Result<ResponseJson<LatestRecipeResponse>, ApiError> {
    validate_id("project", &project_id).map_err(reject)?;
    match state.store.latest_recipe(&project_id) {
        Ok(Some((path, recipe))) => Ok(ResponseJson(LatestRecipeResponse {
            recipe_file: path.display().to_string(),
            recipe,
        })),
        Ok(None) => Err(not_found(format!("project {} has no recipe", project_id))),
        Err(e) => Err(reject(PipelineError::Config(format!("{:#}", e)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state(root: &std::path::Path) -> AppState {
        AppState::new(AppConfig {
            staging_root: root.to_path_buf(),
            ..AppConfig::default()
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let response = router(state(dir.path()))
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_latest_recipe_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let app_state = state(dir.path());
        let app = router(app_state.clone());

        let response = app
            .clone()
            .oneshot(Request::get("/projects/cafe/recipes/latest").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let ctx = JobContext::with_job_id(dir.path(), "cafe", "job-1").unwrap();
        let mut recipe = Recipe::default();
        recipe.timeline.push(crate::recipe::Shot::new(0.0, 2.0));
        app_state.store.save_recipe(&ctx, &recipe).unwrap();

        let response = app
            .oneshot(Request::get("/projects/cafe/recipes/latest").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["recipe"]["timeline"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_render_rejects_invalid_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let request = serde_json::json!({
            "project_id": "cafe",
            "recipe": {"timeline": [{"t": [0.0, 1.0], "layers": [{"type": "image"}]}]}
        });
        let response = router(state(dir.path()))
            .oneshot(
                Request::post("/render")
                    .header("content-type", "application/json")
                    .body(Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["stage"], "validation");
        assert!(body["defects"][0].as_str().unwrap().contains("missing ref"));

        // the repaired recipe is kept for the caller to fix and resubmit
        let store = JobStore::new(dir.path());
        let (_, saved) = store.latest_recipe("cafe").unwrap().unwrap();
        assert_eq!(saved.timeline.len(), 1);
    }

    #[tokio::test]
    async fn test_analyze_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let request = serde_json::json!({"input": "/nope/ref.mp4", "project_id": "cafe"});
        let response = router(state(dir.path()))
            .oneshot(
                Request::post("/analyze")
                    .header("content-type", "application/json")
                    .body(Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
