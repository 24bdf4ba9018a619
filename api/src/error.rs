use axum::{Json, http::StatusCode, response::IntoResponse};
use certa_common::{caller::CallerError, ids::IdParseError, views::ApiErrorResponse};
use thiserror::Error;

use crate::ca::{
    EngineError,
    authority::AuthorityError,
    issuance::IssuanceError,
    queue::QueueError,
    serial::SerialError,
    service::ServiceError,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    ConflictingOperation(String),

    #[error("Request refused by policy: {}", .0.join("; "))]
    PolicyRejection(Vec<String>),

    #[error(transparent)]
    Caller(#[from] CallerError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(anyhow::Error::new(err))
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ConflictingOperation(_) => StatusCode::CONFLICT,
            Self::PolicyRejection(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Caller(CallerError::Unauthorized { .. }) => StatusCode::UNAUTHORIZED,
            Self::Caller(CallerError::Forbidden { .. }) => StatusCode::FORBIDDEN,
            Self::Caller(CallerError::Anyhow(_)) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BadRequest",
            Self::NotFound(_) => "NotFound",
            Self::ConflictingOperation(_) => "ConflictingOperation",
            Self::PolicyRejection(_) => "PolicyRejection",
            Self::Caller(CallerError::Unauthorized { .. }) => "Unauthorized",
            Self::Caller(CallerError::Forbidden { .. }) => "AuthorizationFailed",
            Self::Caller(CallerError::Anyhow(_)) | Self::Internal(_) => "InternalError",
        }
    }

    /// Client-facing message. Internal failures are not described.
    fn message(&self) -> String {
        match self {
            Self::BadRequest(m) | Self::NotFound(m) | Self::ConflictingOperation(m) => m.clone(),
            Self::PolicyRejection(_) => "The request was refused by policy.".into(),
            Self::Caller(CallerError::Unauthorized { .. }) => {
                "You are not authenticated to perform this action.".into()
            }
            Self::Caller(CallerError::Forbidden { .. }) => {
                "You do not have permission to perform this action.".into()
            }
            Self::Caller(CallerError::Anyhow(_)) | Self::Internal(_) => {
                "Something went wrong on our end. Please try again later.".into()
            }
        }
    }
}

impl From<IdParseError> for ApiError {
    fn from(err: IdParseError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<AuthorityError> for ApiError {
    fn from(err: AuthorityError) -> Self {
        match err {
            AuthorityError::NotFound(_) => Self::NotFound(err.to_string()),
            AuthorityError::Disabled(_) | AuthorityError::Conflict(_) | AuthorityError::Routing(_) => {
                Self::ConflictingOperation(err.to_string())
            }
            AuthorityError::Signing(_) | AuthorityError::Certificate(_) | AuthorityError::Storage(_) => {
                Self::internal(err)
            }
        }
    }
}

impl From<IssuanceError> for ApiError {
    fn from(err: IssuanceError) -> Self {
        match err {
            IssuanceError::Authority(e) => e.into(),
            IssuanceError::NotFound(_) => Self::NotFound(err.to_string()),
            IssuanceError::ConflictingOperation(m) => Self::ConflictingOperation(m),
            IssuanceError::InvalidReason(_) => Self::BadRequest(err.to_string()),
            IssuanceError::Serial(e) => e.into(),
            IssuanceError::Signing(_)
            | IssuanceError::Certificate(_)
            | IssuanceError::Pkcs7(_)
            | IssuanceError::Storage(_) => Self::internal(err),
        }
    }
}

impl From<SerialError> for ApiError {
    fn from(err: SerialError) -> Self {
        match err {
            SerialError::InvalidRange(_) | SerialError::WouldReuse { .. } => {
                Self::BadRequest(err.to_string())
            }
            SerialError::NotConfigured(_) => Self::NotFound(err.to_string()),
            SerialError::Exhausted { .. } | SerialError::Storage(_) => Self::internal(err),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(_) => Self::NotFound(err.to_string()),
            QueueError::Invalid(m) => Self::BadRequest(m),
            QueueError::LockTimeout(_)
            | QueueError::InvalidState { .. }
            | QueueError::ConcurrentModification(_) => Self::ConflictingOperation(err.to_string()),
            QueueError::Serial(e) => e.into(),
            QueueError::Storage(_) => Self::internal(err),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Issuance(e) => e.into(),
            ServiceError::Rejected(m) => Self::BadRequest(m),
            ServiceError::Internal(_) => Self::internal(err),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::BadRequest(m) => Self::BadRequest(m),
            EngineError::Caller(e) => Self::Caller(e),
            EngineError::PolicyRejected(messages) => Self::PolicyRejection(messages),
            EngineError::ServicePending(_) => Self::ConflictingOperation(err.to_string()),
            EngineError::Queue(e) => e.into(),
            EngineError::Issuance(e) => e.into(),
            EngineError::Authority(e) => e.into(),
            EngineError::Service(e) => e.into(),
            EngineError::Serial(e) => e.into(),
            EngineError::Profile(e) => Self::BadRequest(e.to_string()),
            EngineError::UnknownCounter(_) => Self::NotFound(err.to_string()),
            EngineError::Config(_) | EngineError::Signing(_) | EngineError::Storage(_) => {
                Self::internal(err)
            }
        }
    }
}

impl From<ApiError> for ApiErrorResponse {
    fn from(err: ApiError) -> Self {
        ApiErrorResponse {
            code: Some(err.code().into()),
            category: err.status().as_u16(),
            message: err.message(),
            reasons: match &err {
                ApiError::PolicyRejection(messages) => messages.clone(),
                _ => Vec::new(),
            },

            #[cfg(debug_assertions)]
            details: Some(format!("{err:#}")),

            #[cfg(not(debug_assertions))]
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status_code = self.status();
        if status_code.is_server_error() {
            tracing::error!(error = ?self, "Error returned by handler");
        } else {
            tracing::debug!(code = self.code(), "Request failed: {self}");
        }

        (status_code, Json(Into::<ApiErrorResponse>::into(self))).into_response()
    }
}
