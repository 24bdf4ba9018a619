use certa_common::caller::CallerError;
use thiserror::Error;

/// Why a request's credentials were not accepted.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Nothing for this scheme was presented. The next provider may apply.
    #[error("No credentials presented")]
    MissingCredentials,

    #[error("Malformed credentials: {0}")]
    Malformed(String),

    /// Well-formed credentials that match no configured token.
    #[error("Unknown token")]
    UnknownToken,

    /// The credential store itself failed; not the caller's fault.
    #[error("Credential lookup failed: {0}")]
    Backend(#[from] anyhow::Error),
}

impl AuthError {
    /// Whether another provider should still be asked.
    pub fn falls_through(&self) -> bool {
        matches!(self, Self::MissingCredentials)
    }
}

/// Refused credentials are a 401. A failing credential store stays an
/// internal error.
impl From<AuthError> for CallerError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Backend(e) => CallerError::Anyhow(e),
            other => CallerError::unauthorized(Some(other.to_string())),
        }
    }
}
