use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pkg_types::ControlError;
use serde::Serialize;
use tracing::{error, warn};

/// JSON body of every non-2xx API response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Wraps a `ControlError` so handlers can use `?`.
#[derive(Debug)]
pub struct ApiError(pub ControlError);

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        ApiError(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ControlError::NotFound { .. } => StatusCode::NOT_FOUND,
            ControlError::Conflict { .. } | ControlError::AlreadyExists { .. } => {
                StatusCode::CONFLICT
            }
            ControlError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ControlError::Closed(_) | ControlError::Scheduling { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ControlError::AlreadyRunning(_) | ControlError::Corrupted(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            ControlError::NotFound { .. } => "not_found",
            ControlError::Conflict { .. } => "conflict",
            ControlError::AlreadyExists { .. } => "already_exists",
            ControlError::Validation(_) => "validation",
            ControlError::Scheduling { .. } => "scheduling",
            ControlError::Closed(_) => "unavailable",
            ControlError::AlreadyRunning(_) | ControlError::Corrupted(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API request failed: {}", self.0);
        } else {
            warn!("API request rejected: {}", self.0);
        }
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
