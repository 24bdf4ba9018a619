//! Static bearer token authentication.
//!
//! Tokens are configured under `[[tokens]]` with a name, the lowercase hex
//! SHA-256 of the secret and the permissions it grants. The secret itself is
//! never stored.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use axum::http::{header, request::Parts};
use certa_common::caller::{ApiCaller, Caller, CallerKind, Permission};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::{
    auth::{error::AuthError, provider::AuthProvider},
    config::store::TokenConfig,
};

/// The principal behind a configured token.
#[derive(Debug, Clone)]
pub struct TokenCaller {
    name: String,
    permissions: Vec<String>,
}

impl ApiCaller for TokenCaller {
    fn kind(&self) -> CallerKind {
        let reviews = self
            .permissions
            .iter()
            .any(|p| p == Permission::RequestsReview.as_str());
        if reviews {
            CallerKind::Agent
        } else {
            CallerKind::EndEntity
        }
    }

    fn id(&self) -> anyhow::Result<String> {
        Ok(self.name.clone())
    }

    fn permissions(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.permissions.clone())
    }
}

pub struct TokenAuthProvider {
    by_digest: HashMap<String, Arc<TokenCaller>>,
}

impl TokenAuthProvider {
    pub fn new(tokens: &[TokenConfig]) -> Self {
        let by_digest = tokens
            .iter()
            .map(|t| {
                (
                    t.sha256.to_ascii_lowercase(),
                    Arc::new(TokenCaller {
                        name: t.name.clone(),
                        permissions: t.permissions.clone(),
                    }),
                )
            })
            .collect();
        Self { by_digest }
    }

    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }
}

/// Lowercase hex SHA-256 of a token, as written in configuration.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[async_trait]
impl AuthProvider for TokenAuthProvider {
    fn scheme(&self) -> &'static str {
        "bearer"
    }

    #[instrument(skip(self, parts), fields(scheme = "bearer"))]
    async fn authenticate(&self, parts: &Parts) -> Result<Caller, AuthError> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .ok_or(AuthError::MissingCredentials)?;
        let value = header
            .to_str()
            .map_err(|_| AuthError::Malformed("Authorization header is not visible ASCII".into()))?;
        let token = value
            .strip_prefix("Bearer ")
            .ok_or(AuthError::MissingCredentials)?
            .trim();
        if token.is_empty() {
            return Err(AuthError::Malformed("empty bearer token".into()));
        }

        match self.by_digest.get(&token_digest(token)) {
            Some(caller) => {
                debug!(name = %caller.name, "Token accepted");
                Ok(Caller::Authenticated(caller.clone()))
            }
            None => {
                warn!("Unknown bearer token");
                Err(AuthError::UnknownToken)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use axum::http::Request;

    use super::*;

    fn provider() -> TokenAuthProvider {
        TokenAuthProvider::new(&[TokenConfig {
            name: "agent1".into(),
            sha256: token_digest("s3cret").to_uppercase(),
            permissions: vec!["requests:review".into(), "requests:read".into()],
        }])
    }

    fn parts(authorization: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/ca/v2/certs");
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn known_token_authenticates() {
        let caller = provider()
            .authenticate(&parts(Some("Bearer s3cret")))
            .await
            .unwrap();
        assert_eq!(caller.name().unwrap(), "agent1");
        assert!(caller.can(Permission::RequestsReview).unwrap());
        assert!(!caller.can(Permission::Admin).unwrap());
        assert_eq!(caller.api_caller().unwrap().kind(), CallerKind::Agent);
    }

    #[tokio::test]
    async fn other_schemes_are_not_ours() {
        assert!(matches!(
            provider().authenticate(&parts(None)).await,
            Err(AuthError::MissingCredentials)
        ));
        assert!(matches!(
            provider().authenticate(&parts(Some("Basic Zm9vOmJhcg=="))).await,
            Err(AuthError::MissingCredentials)
        ));
    }

    #[tokio::test]
    async fn unknown_or_empty_token_is_refused() {
        assert!(matches!(
            provider().authenticate(&parts(Some("Bearer nope"))).await,
            Err(AuthError::UnknownToken)
        ));
        assert!(matches!(
            provider().authenticate(&parts(Some("Bearer   "))).await,
            Err(AuthError::Malformed(_))
        ));
    }
}
