use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::error;

/// Error taxonomy shared by the API surface and the reconciliation engine.
///
/// `Transient` failures are retried internally with backoff; `Permanent`
/// failures move the affected target to ERROR and require operator action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    AuthRequired,
    PermissionDenied,
    NotFound,
    Conflict,
    Transient,
    Permanent,
}

impl ErrorKind {
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::AuthRequired => StatusCode::UNAUTHORIZED,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Permanent => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "ValidationException",
            ErrorKind::AuthRequired => "AuthRequiredException",
            ErrorKind::PermissionDenied => "PermissionDeniedException",
            ErrorKind::NotFound => "NotFoundException",
            ErrorKind::Conflict => "ConflictException",
            ErrorKind::Transient => "TransientException",
            ErrorKind::Permanent => "PermanentException",
        }
    }
}

/// Application error carried through HTTP handlers and service code.
#[derive(Debug)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Validation,
            message: msg.into(),
        }
    }

    pub fn auth_required(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::AuthRequired,
            message: msg.into(),
        }
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::PermissionDenied,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            message: msg.into(),
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: msg.into(),
        }
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.type_name(), self.message)
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        error!(?err, "internal error");
        AppError::permanent("internal server error")
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::from(anyhow::Error::from(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.kind.status();
        let body = Json(serde_json::json!({
            "code": status.as_u16(),
            "type": self.kind.type_name(),
            "message": self.message,
        }));
        (status, body).into_response()
    }
}
