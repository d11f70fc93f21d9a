//! JSON error bodies for the HTTP surface: `{ "error": <kind>, "message": <text> }`.

use crate::backup::{BackupError, ManagerError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

fn error_response(status: StatusCode, kind: &str, message: String) -> Response {
    (
        status,
        Json(ErrorBody {
            error: kind.to_string(),
            message,
        }),
    )
        .into_response()
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ManagerError::InvalidInput(_) | ManagerError::InvalidCadence(_) => {
                StatusCode::BAD_REQUEST
            }
            ManagerError::RouterNotFound(_)
            | ManagerError::ScheduleNotFound(_)
            | ManagerError::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
            ManagerError::DuplicateName(_) => StatusCode::CONFLICT,
            ManagerError::Internal(e) => {
                error!("Internal error: {:#}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        error_response(status, self.kind(), self.to_string())
    }
}

impl IntoResponse for BackupError {
    fn into_response(self) -> Response {
        let status = match &self {
            BackupError::RouterNotFound(_) => StatusCode::NOT_FOUND,
            BackupError::RouterDisabled(_) | BackupError::AlreadyRunning(_) => StatusCode::CONFLICT,
            BackupError::ConnectionFailed(_)
            | BackupError::AuthenticationFailed(_)
            | BackupError::ExportFailed(_) => StatusCode::BAD_GATEWAY,
            BackupError::ExportTimeout => StatusCode::GATEWAY_TIMEOUT,
            BackupError::StorageFailed(_) | BackupError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        error_response(status, self.kind(), self.to_string())
    }
}
