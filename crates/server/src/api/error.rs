use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thinktank_core::PipelineError;

/// Transport status for a pipeline reason tag
pub fn status_for_reason(reason: &str) -> StatusCode {
    match reason {
        "capability_error" | "stage_timeout" | "parse_error" => StatusCode::BAD_GATEWAY,
        "storage_unavailable" | "cancelled" => StatusCode::SERVICE_UNAVAILABLE,
        "not_found" => StatusCode::NOT_FOUND,
        "invalid_input" => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason, message) = match self {
            ApiError::Pipeline(err) => {
                let status = status_for_reason(err.reason_tag());
                if status.is_server_error() {
                    tracing::error!("Pipeline error: {}", err);
                }
                (status, err.reason_tag(), err.to_string())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_input", msg),
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg)
            }
        };

        (
            status,
            Json(serde_json::json!({ "error": message, "reason": reason })),
        )
            .into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Pipeline(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}
