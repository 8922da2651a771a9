use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Failure kinds of one chat request/response cycle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("request body is not valid JSON: {0}")]
    MalformedRequest(String),
    #[error("unsupported content type: {0}")]
    UnsupportedMediaType(String),
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("unsupported model: {0}")]
    UnsupportedProvider(String),
    #[error("no credential configured for backend {0}")]
    MissingCredential(String),
    #[error("{0}")]
    InvalidHistory(String),
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("upstream returned {status}: {body}")]
    UpstreamRejected { status: StatusCode, body: String },
    #[error("upstream rate limit reached, please try again later")]
    RateLimited { status: StatusCode, body: String },
    #[error("unexpected upstream response: {0}")]
    UnexpectedResponseShape(String),
}

impl ChatError {
    /// True for every non-2xx upstream answer, rate limits included.
    pub fn is_upstream_rejection(&self) -> bool {
        matches!(
            self,
            ChatError::UpstreamRejected { .. } | ChatError::RateLimited { .. }
        )
    }

    pub fn upstream_status(&self) -> Option<StatusCode> {
        match self {
            ChatError::UpstreamRejected { status, .. } | ChatError::RateLimited { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ChatError::InvalidRequest(_) => "invalid_request",
            ChatError::MalformedRequest(_) => "malformed_request",
            ChatError::UnsupportedMediaType(_) => "unsupported_media_type",
            ChatError::PayloadTooLarge { .. } => "payload_too_large",
            ChatError::UnsupportedProvider(_) => "unsupported_provider",
            ChatError::MissingCredential(_) => "missing_credential",
            ChatError::InvalidHistory(_) => "invalid_history",
            ChatError::UpstreamUnreachable(_) => "upstream_unreachable",
            ChatError::UpstreamRejected { .. } => "upstream_rejected",
            ChatError::RateLimited { .. } => "rate_limited",
            ChatError::UnexpectedResponseShape(_) => "unexpected_response_shape",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::InvalidRequest(_)
            | ChatError::MalformedRequest(_)
            | ChatError::UnsupportedProvider(_)
            | ChatError::InvalidHistory(_) => StatusCode::BAD_REQUEST,
            ChatError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ChatError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ChatError::MissingCredential(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ChatError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ChatError::UpstreamUnreachable(_)
            | ChatError::UpstreamRejected { .. }
            | ChatError::UnexpectedResponseShape(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        AppError::new(err.status(), err.code(), err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
    code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorEnvelope {
            error: self.message,
            code: self.code,
        };
        (self.status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
