//! Maps the transport-agnostic `RegistryError` taxonomy (§7) onto HTTP
//! status codes. The enum itself lives in `protoreg-types`; the mapping is
//! a network concern and stays here.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use protoreg_types::RegistryError;
use serde_json::json;

pub fn status_code(err: &RegistryError) -> StatusCode {
    match err {
        RegistryError::Validation { .. } => StatusCode::BAD_REQUEST,
        RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
        RegistryError::Conflict { .. } => StatusCode::CONFLICT,
        RegistryError::GuardFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RegistryError::CycleDetected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RegistryError::Integrity { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        RegistryError::ProvenanceInvalid { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RegistryError::Unauthorized => StatusCode::UNAUTHORIZED,
        RegistryError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        RegistryError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub struct ApiError(pub RegistryError);

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_code(&self.0);
        let body = Json(json!({
            "status": "error",
            "kind": self.0.kind(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}
