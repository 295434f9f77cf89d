//! Pipeline run endpoints: chat, run lookup and the event stream.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use thinktank_core::pipeline::{FailureMarker, PipelineEvent, ResultBundle};
use thinktank_core::state::RunDetail;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use super::{error::status_for_reason, ApiError, SharedState};

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChatResponse {
    pub run_id: Option<i64>,
    /// Matches `run_key` on this run's SSE events
    pub run_key: Option<String>,
    pub aggregate_result: String,
    /// Stage name -> marker, raw text, parsed value
    #[schema(value_type = Object)]
    pub per_stage_outputs: serde_json::Value,
    pub status: String,
    #[schema(value_type = Option<Object>)]
    pub failure: Option<FailureMarker>,
    pub warnings: Vec<String>,
}

impl From<ResultBundle> for ChatResponse {
    fn from(bundle: ResultBundle) -> Self {
        Self {
            run_id: bundle.run_id,
            run_key: bundle.run_key,
            per_stage_outputs: serde_json::to_value(&bundle.per_stage).unwrap_or_default(),
            status: bundle.status.as_str().to_string(),
            aggregate_result: bundle.aggregate_result,
            failure: bundle.failure,
            warnings: bundle.warnings,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    pub id: i64,
    pub goal: String,
    pub status: String,
    pub created_at: String,
}

/// Run the pipeline for a chat message
///
/// A failed run still returns its partial bundle; the status code follows the
/// failure reason.
#[utoipa::path(
    post,
    path = "/workflow/chat",
    tag = "workflow",
    request_body = ChatRequest,
    responses(
        (status = 200, description = "Run completed or message answered directly", body = ChatResponse),
        (status = 400, description = "Empty message"),
        (status = 502, description = "A stage failed or timed out", body = ChatResponse),
        (status = 503, description = "Run cancelled", body = ChatResponse)
    )
)]
pub async fn chat(
    State(state): State<SharedState>,
    Json(req): Json<ChatRequest>,
) -> Result<(StatusCode, Json<ChatResponse>), ApiError> {
    if req.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }

    let cancel = state.shutdown.child_token();
    let bundle = state
        .orchestrator()
        .handle_message(&req.message, &cancel)
        .await;

    let code = match &bundle.failure {
        Some(failure) => status_for_reason(&failure.reason),
        None => StatusCode::OK,
    };
    tracing::info!(run_id = ?bundle.run_id, status = %bundle.status.as_str(), "Chat handled");

    Ok((code, Json(ChatResponse::from(bundle))))
}

/// Status snapshot of a stored run
#[utoipa::path(
    get,
    path = "/workflow/status/{id}",
    tag = "workflow",
    params(("id" = i64, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run status", body = StatusResponse),
        (status = 404, description = "Run not found")
    )
)]
pub async fn get_status(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<StatusResponse>, ApiError> {
    let record = state.recorder.status(id)?;
    Ok(Json(StatusResponse {
        id: record.id,
        goal: record.goal,
        status: record.status.as_str().to_string(),
        created_at: record.created_at.to_rfc3339(),
    }))
}

/// Full stored record with stage and task rows
#[utoipa::path(
    get,
    path = "/workflow/runs/{id}",
    tag = "workflow",
    params(("id" = i64, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run record with stage rows"),
        (status = 404, description = "Run not found")
    )
)]
pub async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<RunDetail>, ApiError> {
    Ok(Json(state.recorder.detail(id)?))
}

/// SSE stream of pipeline events with heartbeat
///
/// The stream ends when the server shuts down.
pub async fn events(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = event_stream(state.event_tx.subscribe(), state.shutdown.clone());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn event_stream(
    rx: broadcast::Receiver<PipelineEvent>,
    shutdown: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((rx, shutdown), |(mut rx, shutdown)| async move {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return None,
            next = tokio::time::timeout(std::time::Duration::from_secs(15), rx.recv()) => next,
        };

        let event = match next {
            Ok(Ok(event)) => {
                let json = serde_json::to_string(&event).unwrap_or_default();
                Event::default().event(kind_name(&event)).data(json)
            }
            Ok(Err(RecvError::Lagged(skipped))) => {
                tracing::warn!(skipped, "SSE subscriber lagged");
                Event::default().comment(format!("skipped {} events", skipped))
            }
            Ok(Err(RecvError::Closed)) => return None,
            Err(_) => Event::default().comment("heartbeat"),
        };
        Some((Ok(event), (rx, shutdown)))
    })
}

fn kind_name(event: &PipelineEvent) -> String {
    serde_json::to_value(event.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "pipeline".to_string())
}
