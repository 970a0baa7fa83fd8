// ABOUTME: Shared API response envelope and error-to-status mapping
// ABOUTME: Every endpoint answers with {success, data, error}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json as ResponseJson, Response},
};
use boxyard_deploy::DeployError;
use serde::Serialize;
use tracing::error;

/// Standard API response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

/// Handler error; wraps the engine error and picks the HTTP status
#[derive(Debug)]
pub struct ApiError(pub DeployError);

impl From<DeployError> for ApiError {
    fn from(error: DeployError) -> Self {
        ApiError(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            DeployError::BoxNotFound(_) => StatusCode::NOT_FOUND,
            DeployError::AlreadyDeploying(_)
            | DeployError::DuplicateSubdomain(_)
            | DeployError::InvalidTransition(_) => StatusCode::CONFLICT,
            DeployError::InvalidRequest(_) | DeployError::ProviderNotRegistered(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
            "Internal server error".to_string()
        } else {
            self.0.to_string()
        };

        (status, ResponseJson(ApiResponse::<()>::error(message))).into_response()
    }
}
