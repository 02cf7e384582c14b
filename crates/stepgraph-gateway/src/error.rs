use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use stepgraph_core::error::StepgraphError;

/// Error response: a status code plus a JSON body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": message.into() }),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "insufficient role")
    }
}

impl From<StepgraphError> for ApiError {
    fn from(err: StepgraphError) -> Self {
        let status = match err {
            StepgraphError::RunNotFound(_) => StatusCode::NOT_FOUND,
            StepgraphError::AdmissionRejected { .. } => StatusCode::TOO_MANY_REQUESTS,
            StepgraphError::Cancelled => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
