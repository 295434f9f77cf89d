//! HTTP surface of the ThinkTank server.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use thinktank_core::capabilities::{CapabilityProvider, CapabilityRole, PromptLibrary};
use thinktank_core::models::LlmProvider;
use thinktank_core::pipeline::{Orchestrator, PipelineConfig, PipelineEvent};
use thinktank_core::state::{store, RunRecorder, ThinkTankDb};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};

pub mod error;
pub mod workflow;

pub use error::ApiError;

/// Everything needed to (re)build the orchestrator
pub struct PipelineParts {
    pub config: PipelineConfig,
    pub provider: Arc<dyn CapabilityProvider>,
    pub recorder: RunRecorder,
    pub event_tx: mpsc::Sender<PipelineEvent>,
}

impl PipelineParts {
    pub fn build(&self, prompts: PromptLibrary) -> Orchestrator {
        Orchestrator::new(self.config.clone(), Arc::clone(&self.provider), prompts)
            .with_recorder(self.recorder.clone())
            .with_event_channel(self.event_tx.clone())
    }
}

/// Application state
pub struct AppState {
    pub db: Arc<ThinkTankDb>,
    pub recorder: RunRecorder,
    pub parts: PipelineParts,
    orchestrator: RwLock<Arc<Orchestrator>>,
    pub event_tx: broadcast::Sender<PipelineEvent>,
    /// Cancelled on shutdown; every run gets a child token
    pub shutdown: CancellationToken,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Build state and start forwarding orchestrator events to SSE subscribers
    pub fn new(
        db: Arc<ThinkTankDb>,
        config: PipelineConfig,
        provider: Arc<dyn CapabilityProvider>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<SharedState> {
        let (event_tx, _) = broadcast::channel::<PipelineEvent>(100);
        let (event_mpsc_tx, mut event_mpsc_rx) = mpsc::channel::<PipelineEvent>(100);

        // Bridge events to broadcast
        let broadcast_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_mpsc_rx.recv().await {
                let _ = broadcast_tx.send(event);
            }
        });

        let recorder = RunRecorder::sqlite(&db);
        let parts = PipelineParts {
            config,
            provider,
            recorder: recorder.clone(),
            event_tx: event_mpsc_tx,
        };
        let orchestrator = parts.build(PromptLibrary::load(&db)?);

        Ok(Arc::new(Self {
            db,
            recorder,
            parts,
            orchestrator: RwLock::new(Arc::new(orchestrator)),
            event_tx,
            shutdown,
        }))
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        match self.orchestrator.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Pick up edited prompt templates for subsequent runs
    pub fn reload_prompts(&self) -> anyhow::Result<()> {
        let rebuilt = Arc::new(self.parts.build(PromptLibrary::load(&self.db)?));
        let mut guard = self
            .orchestrator
            .write()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        *guard = rebuilt;
        Ok(())
    }
}

pub fn router(state: SharedState) -> Router {
    let workflow_routes = Router::new()
        .route("/chat", axum::routing::post(workflow::chat))
        .route("/status/:id", get(workflow::get_status))
        .route("/runs/:id", get(workflow::get_run))
        .route("/events", get(workflow::events));

    let prompt_routes = Router::new()
        .route("/", get(list_prompts))
        .route("/:slug", get(get_prompt).put(update_prompt));

    Router::new()
        .nest("/workflow", workflow_routes)
        .nest("/prompts", prompt_routes)
        .route("/config", get(get_config))
        .route("/ping", get(ping))
        .route("/openapi.json", get(serve_openapi))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === OpenAPI Definition ===

#[derive(OpenApi)]
#[openapi(
    info(
        title = "ThinkTank API",
        version = "1.0.0",
        description = "AI planning pipeline: requirements, task plan, research, PRD, tools and evaluation"
    ),
    paths(
        workflow::chat,
        workflow::get_status,
        workflow::get_run,
        list_prompts,
        get_prompt,
        update_prompt,
        get_config,
        ping
    ),
    components(
        schemas(
            workflow::ChatRequest,
            workflow::ChatResponse,
            workflow::StatusResponse,
            PromptListResponse,
            PromptListItem,
            PromptResponse,
            UpdatePromptRequest,
            UpdatePromptResponse,
            ConfigResponse,
            PingResponse
        )
    ),
    tags(
        (name = "workflow", description = "Pipeline runs"),
        (name = "prompts", description = "Role prompt templates"),
        (name = "config", description = "Effective configuration"),
        (name = "health", description = "Liveness")
    )
)]
pub struct ApiDoc;

async fn serve_openapi() -> impl IntoResponse {
    let spec = ApiDoc::openapi().to_json().unwrap_or_default();
    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(spec))
        .unwrap_or_default()
}

// === Health ===

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PingResponse {
    status: String,
    runs: i64,
}

#[utoipa::path(
    get,
    path = "/ping",
    tag = "health",
    responses((status = 200, description = "Server is up", body = PingResponse))
)]
async fn ping(State(state): State<SharedState>) -> Result<Json<PingResponse>, ApiError> {
    let runs = store::count_runs(&state.db).map_err(|e| ApiError::Pipeline(e.into()))?;
    Ok(Json(PingResponse {
        status: "ok".to_string(),
        runs,
    }))
}

// === Config ===

#[derive(Debug, Serialize, ToSchema)]
struct ConfigResponse {
    stage_timeout_ms: u64,
    parse_failure_policy: String,
    intake_enabled: bool,
    roles: Vec<String>,
    /// Provider names accepted by `THINKTANK_PROVIDER`
    providers: Vec<String>,
}

#[utoipa::path(
    get,
    path = "/config",
    tag = "config",
    responses((status = 200, description = "Effective pipeline configuration", body = ConfigResponse))
)]
async fn get_config(State(state): State<SharedState>) -> Json<ConfigResponse> {
    let config = &state.parts.config;
    let policy = serde_json::to_value(config.parse_failure_policy)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    Json(ConfigResponse {
        stage_timeout_ms: config.stage_timeout_ms,
        parse_failure_policy: policy,
        intake_enabled: config.intake_enabled,
        roles: CapabilityRole::all()
            .iter()
            .map(|role| role.slug().to_string())
            .collect(),
        providers: LlmProvider::all()
            .iter()
            .map(|provider| provider.display_name().to_string())
            .collect(),
    })
}

// === Prompt Template Handlers ===

#[derive(Debug, Serialize, ToSchema)]
struct PromptListItem {
    slug: String,
    version: i32,
}

#[derive(Debug, Serialize, ToSchema)]
struct PromptListResponse {
    prompts: Vec<PromptListItem>,
}

#[derive(Debug, Serialize, ToSchema)]
struct PromptResponse {
    slug: String,
    content: String,
    version: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
struct UpdatePromptRequest {
    content: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct UpdatePromptResponse {
    slug: String,
    new_version: i32,
}

/// List all prompt templates
#[utoipa::path(
    get,
    path = "/prompts",
    tag = "prompts",
    responses((status = 200, description = "Prompt slugs and versions", body = PromptListResponse))
)]
async fn list_prompts(State(state): State<SharedState>) -> Result<Json<PromptListResponse>, ApiError> {
    let prompts = state.db.list_prompts()?;
    Ok(Json(PromptListResponse {
        prompts: prompts
            .into_iter()
            .map(|(slug, version)| PromptListItem { slug, version })
            .collect(),
    }))
}

/// Get a prompt by slug
#[utoipa::path(
    get,
    path = "/prompts/{slug}",
    tag = "prompts",
    params(("slug" = String, Path, description = "Role slug")),
    responses(
        (status = 200, description = "Prompt content", body = PromptResponse),
        (status = 400, description = "Unknown role")
    )
)]
async fn get_prompt(
    State(state): State<SharedState>,
    Path(slug): Path<String>,
) -> Result<Json<PromptResponse>, ApiError> {
    let role = parse_role(&slug)?;
    let response = match state.db.get_prompt_versioned(&slug) {
        Ok((content, version)) => PromptResponse {
            slug,
            content,
            version,
        },
        // not seeded yet: report the bundled default
        Err(_) => PromptResponse {
            content: PromptLibrary::defaults().template(role).to_string(),
            slug,
            version: 0,
        },
    };
    Ok(Json(response))
}

/// Update a prompt; takes effect for the next run
#[utoipa::path(
    put,
    path = "/prompts/{slug}",
    tag = "prompts",
    params(("slug" = String, Path, description = "Role slug")),
    request_body = UpdatePromptRequest,
    responses(
        (status = 200, description = "Prompt updated", body = UpdatePromptResponse),
        (status = 400, description = "Unknown role or empty content")
    )
)]
async fn update_prompt(
    State(state): State<SharedState>,
    Path(slug): Path<String>,
    Json(req): Json<UpdatePromptRequest>,
) -> Result<Json<UpdatePromptResponse>, ApiError> {
    parse_role(&slug)?;
    if req.content.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt content must not be empty".to_string()));
    }

    let new_version = state.db.set_prompt(&slug, &req.content)?;
    state.reload_prompts()?;
    tracing::info!(%slug, new_version, "Prompt updated");

    Ok(Json(UpdatePromptResponse { slug, new_version }))
}

fn parse_role(slug: &str) -> Result<CapabilityRole, ApiError> {
    CapabilityRole::from_slug(slug)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown role '{}'", slug)))
}


#[cfg(test)]
mod tests {
    use super::testing::{test_state, StubProvider};
    use super::*;

    #[tokio::test]
    async fn test_ping_counts_runs() {
        let state = test_state(StubProvider::ok());
        let Json(body) = ping(State(state)).await.unwrap();
        assert_eq!(body.status, "ok");
        assert_eq!(body.runs, 0);
    }

    #[tokio::test]
    async fn test_prompt_update_bumps_version() {
        let state = test_state(StubProvider::ok());

        let Json(before) = get_prompt(State(state.clone()), Path("researcher".to_string()))
            .await
            .unwrap();
        assert_eq!(before.version, 1);

        let Json(updated) = update_prompt(
            State(state.clone()),
            Path("researcher".to_string()),
            Json(UpdatePromptRequest {
                content: "调研：{{goal}}".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(updated.new_version, 2);

        let Json(after) = get_prompt(State(state.clone()), Path("researcher".to_string()))
            .await
            .unwrap();
        assert_eq!(after.content, "调研：{{goal}}");

        let Json(list) = list_prompts(State(state)).await.unwrap();
        assert_eq!(list.prompts.len(), CapabilityRole::all().len());
    }

    #[tokio::test]
    async fn test_prompt_unknown_role_or_empty_content() {
        let state = test_state(StubProvider::ok());

        assert!(get_prompt(State(state.clone()), Path("oracle".to_string()))
            .await
            .is_err());
        let err = update_prompt(
            State(state),
            Path("evaluator".to_string()),
            Json(UpdatePromptRequest {
                content: "  ".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_config_reports_effective_settings() {
        let state = test_state(StubProvider::ok());
        let Json(body) = get_config(State(state)).await;
        assert_eq!(body.stage_timeout_ms, 180_000);
        assert_eq!(body.parse_failure_policy, "degrade_and_continue");
        assert!(!body.intake_enabled);
        assert!(body.roles.contains(&"intake".to_string()));
        assert!(body.providers.contains(&"DeepSeek".to_string()));
    }

    #[test]
    fn test_openapi_lists_workflow_paths() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/workflow/chat"));
        assert!(doc.paths.paths.contains_key("/workflow/status/{id}"));
    }
}
