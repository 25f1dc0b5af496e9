use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, AppError>;

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

/// Error kinds from the design's error table (§7). Each maps to one HTTP
/// status and, on the WebSocket side, to a distinct frame type handled in
/// `ws::handle_client_message`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{message}")]
    Validation { message: String },

    #[error("{message}")]
    SessionNotFound { message: String },

    #[error("{message}")]
    SessionExists { message: String },

    #[error("{message}")]
    PendingChanges { message: String },

    #[error("{message}")]
    PushRejected { message: String },

    #[error("{message}")]
    PushAuth { message: String },

    #[error("{message}")]
    PushConnection { message: String },

    #[error("{message}")]
    RemoteNotConfigured { message: String },

    #[error("{message}")]
    AiUnavailable { message: String },

    #[error("{message}")]
    Internal { message: String },
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::SessionNotFound {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::PendingChanges {
            message: message.into(),
        }
    }

    pub fn exists(message: impl Into<String>) -> Self {
        Self::SessionExists {
            message: message.into(),
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::AiUnavailable {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::SessionExists { .. } => "session_exists",
            Self::PendingChanges { .. } => "pending_changes",
            Self::PushRejected { .. } => "push_rejected",
            Self::PushAuth { .. } => "push_auth",
            Self::PushConnection { .. } => "push_connection",
            Self::RemoteNotConfigured { .. } => "remote_not_configured",
            Self::AiUnavailable { .. } => "ai_unavailable",
            Self::Internal { .. } => "internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            Self::SessionExists { .. } => StatusCode::CONFLICT,
            Self::PendingChanges { .. } => StatusCode::CONFLICT,
            Self::PushRejected { .. } => StatusCode::BAD_REQUEST,
            Self::PushAuth { .. } => StatusCode::BAD_REQUEST,
            Self::PushConnection { .. } => StatusCode::BAD_REQUEST,
            Self::RemoteNotConfigured { .. } => StatusCode::BAD_REQUEST,
            Self::AiUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let kind = self.kind();
        let detail = self.to_string();
        (
            status,
            Json(ErrorBody {
                detail,
                kind: Some(kind),
            }),
        )
            .into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
