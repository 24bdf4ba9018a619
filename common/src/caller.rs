use std::{fmt, sync::Arc};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallerError {
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("Caller missing permission: {permission}")]
    Forbidden { permission: String },

    #[error("An unspecified error occurred: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl CallerError {
    pub fn unauthorized(reason: Option<String>) -> Self {
        Self::Unauthorized {
            reason: reason.unwrap_or_else(|| "No reason provided".to_string()),
        }
    }

    pub fn forbidden(permission: Permission) -> Self {
        Self::Forbidden {
            permission: permission.to_string(),
        }
    }
}

/// Things a caller may be allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Submit enrollment and renewal requests and read their status.
    RequestsSubmit,
    /// List and inspect requests in the agent queue.
    RequestsRead,
    /// Approve, reject, cancel, assign and edit pending requests.
    RequestsReview,
    /// Revoke and unrevoke certificates. Certificate reads are public.
    CertsRevoke,
    /// Create, enable, disable and delete sub-authorities. Authority reads
    /// and CRLs are public.
    AuthoritiesWrite,
    /// Serial range inspection and reset.
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestsSubmit => "requests:submit",
            Self::RequestsRead => "requests:read",
            Self::RequestsReview => "requests:review",
            Self::CertsRevoke => "certs:revoke",
            Self::AuthoritiesWrite => "authorities:write",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerKind {
    /// A reviewing agent or administrator.
    Agent,
    /// An end entity submitting its own requests.
    EndEntity,

    #[cfg(test)]
    MockCaller,
}

pub trait ApiCaller: Send + Sync {
    fn kind(&self) -> CallerKind;
    fn id(&self) -> anyhow::Result<String>;
    fn permissions(&self) -> anyhow::Result<Vec<String>>;
}

#[derive(Clone)]
pub enum Caller {
    Authenticated(Arc<dyn ApiCaller>),
    /// The engine acting on its own behalf, e.g. auto-approval or the CLI.
    System,
    Unauthenticated,
}

impl fmt::Debug for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caller::Authenticated(c) => {
                write!(f, "Authenticated({})", c.id().unwrap_or_else(|_| "?".into()))
            }
            Caller::System => f.write_str("System"),
            Caller::Unauthenticated => f.write_str("Unauthenticated"),
        }
    }
}

impl Caller {
    pub const SYSTEM_NAME: &'static str = "system";

    #[tracing::instrument(skip(self))]
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Caller::Unauthenticated)
    }

    #[tracing::instrument(skip(self))]
    pub fn api_caller(&self) -> Result<Arc<dyn ApiCaller>, CallerError> {
        match self {
            Caller::Authenticated(api_caller) => Ok(api_caller.clone()),
            Caller::System | Caller::Unauthenticated => Err(CallerError::unauthorized(Some(
                "Caller is not an authenticated principal".into(),
            ))),
        }
    }

    /// Name recorded in audit fields such as `revoked_by` or `owner`.
    pub fn name(&self) -> Result<String, CallerError> {
        match self {
            Caller::Authenticated(api_caller) => Ok(api_caller.id()?),
            Caller::System => Ok(Self::SYSTEM_NAME.to_string()),
            Caller::Unauthenticated => Err(CallerError::unauthorized(Some(
                "Caller is not authenticated".into(),
            ))),
        }
    }

    #[tracing::instrument(skip(self))]
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Caller::Unauthenticated)
    }

    #[tracing::instrument(skip(self))]
    pub fn can(&self, permission: Permission) -> Result<bool, CallerError> {
        match self {
            Caller::Authenticated(api_caller) => Ok(api_caller
                .permissions()?
                .iter()
                .any(|p| p == permission.as_str())),
            Caller::System => Ok(true),
            Caller::Unauthenticated => Ok(false),
        }
    }

    #[tracing::instrument(skip(self))]
    pub fn require(&self, permission: Permission) -> Result<(), CallerError> {
        if self.is_anonymous() {
            return Err(CallerError::unauthorized(None));
        }
        if !self.can(permission)? {
            return Err(CallerError::forbidden(permission));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct MockApiCaller {
        id: String,
        permissions: Vec<String>,
    }

    impl ApiCaller for MockApiCaller {
        fn kind(&self) -> CallerKind {
            CallerKind::MockCaller
        }

        fn id(&self) -> anyhow::Result<String> {
            Ok(self.id.clone())
        }

        fn permissions(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.permissions.clone())
        }
    }

    fn mock(permissions: &[Permission]) -> Caller {
        Caller::Authenticated(Arc::new(MockApiCaller {
            id: "agent1".to_string(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        }))
    }

    #[test]
    fn caller_authenticated_false_when_unauthenticated() {
        let caller = Caller::Unauthenticated;
        assert!(!caller.is_authenticated());
        assert!(caller.is_anonymous());
    }

    #[test]
    fn system_caller_can_do_everything() {
        let caller = Caller::System;
        assert!(caller.can(Permission::Admin).unwrap());
        assert_eq!(caller.name().unwrap(), "system");
    }

    #[test]
    fn caller_can_resolves_correctly() {
        let caller = mock(&[Permission::RequestsRead, Permission::AuthoritiesWrite]);

        assert!(caller.can(Permission::RequestsRead).unwrap());
        assert!(!caller.can(Permission::CertsRevoke).unwrap());
    }

    #[test]
    fn unknown_permission_strings_grant_nothing() {
        let caller = Caller::Authenticated(Arc::new(MockApiCaller {
            id: "agent1".to_string(),
            permissions: vec!["certs:read".to_string(), "authorities:read".to_string()],
        }));

        for permission in [
            Permission::RequestsSubmit,
            Permission::RequestsRead,
            Permission::RequestsReview,
            Permission::CertsRevoke,
            Permission::AuthoritiesWrite,
            Permission::Admin,
        ] {
            assert!(!caller.can(permission).unwrap(), "{permission}");
        }
    }

    #[test]
    fn caller_require_fails_on_missing_permission() {
        let caller = mock(&[Permission::RequestsSubmit]);

        let err = caller.require(Permission::RequestsReview).unwrap_err();
        assert!(matches!(err, CallerError::Forbidden { .. }));
    }

    #[test]
    fn anonymous_require_is_unauthorized() {
        let err = Caller::Unauthenticated
            .require(Permission::RequestsRead)
            .unwrap_err();
        assert!(matches!(err, CallerError::Unauthorized { .. }));
    }

    #[test]
    fn caller_name_comes_from_id() {
        let caller = mock(&[]);
        assert_eq!(caller.name().unwrap(), "agent1");
    }
}
