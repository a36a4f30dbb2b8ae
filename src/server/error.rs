use crate::infra::ConversationReadError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// API-boundary error taxonomy. Everything a handler can fail with is
/// normalized into one of these and serialized as
/// `{ code, message, status }`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    HistoryReadFailed(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("session file not found: {0}")]
    FileNotFound(String),

    #[error("{0}")]
    ConversationReadFailed(String),

    #[error("{0}")]
    SessionUpdateFailed(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::HistoryReadFailed(_) => "HISTORY_READ_FAILED",
            Self::ConversationNotFound(_) => "CONVERSATION_NOT_FOUND",
            Self::FileNotFound(_) => "FILE_NOT_FOUND",
            Self::ConversationReadFailed(_) => "CONVERSATION_READ_FAILED",
            Self::SessionUpdateFailed(_) => "SESSION_UPDATE_FAILED",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::ConversationNotFound(_) | Self::FileNotFound(_) => StatusCode::NOT_FOUND,
            Self::HistoryReadFailed(_)
            | Self::ConversationReadFailed(_)
            | Self::SessionUpdateFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

impl From<ConversationReadError> for ApiError {
    fn from(error: ConversationReadError) -> Self {
        match error {
            ConversationReadError::NotFound(id) => Self::ConversationNotFound(id),
            ConversationReadError::FileMissing(id) => Self::FileNotFound(id),
            ConversationReadError::Io(error) => Self::ConversationReadFailed(error.to_string()),
            ConversationReadError::Store(error) => Self::HistoryReadFailed(error.to_string()),
        }
    }
}
