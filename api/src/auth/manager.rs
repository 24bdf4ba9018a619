//! Picks the provider that handles a request's credentials.

use axum::http::request::Parts;
use certa_common::caller::Caller;
use tracing::{debug, info, instrument, warn};

use super::{error::AuthError, provider::AuthProvider, providers::token::TokenAuthProvider};
use crate::config::store::TokenConfig;

/// Authentication providers in the order they are asked. The first one that
/// recognises the request's credentials decides: it either yields the caller
/// or refuses them, and later providers are not consulted.
pub struct AuthManager {
    providers: Vec<Box<dyn AuthProvider>>,
}

impl AuthManager {
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Bearer tokens from the `[[tokens]]` configuration.
    pub fn from_tokens(tokens: &[TokenConfig]) -> Self {
        let provider = TokenAuthProvider::new(tokens);
        if provider.is_empty() {
            warn!("No API tokens configured, only public endpoints are usable");
        } else {
            info!(tokens = provider.len(), "Loaded API tokens");
        }
        Self::new().with_provider(provider)
    }

    pub fn with_provider<P: AuthProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    #[instrument(skip_all)]
    pub async fn authenticate(&self, parts: &Parts) -> Result<Caller, AuthError> {
        for provider in &self.providers {
            let scheme = provider.scheme();
            match provider.authenticate(parts).await {
                Ok(caller) => {
                    debug!(scheme, caller = %caller.name().unwrap_or_default(), "Caller authenticated");
                    return Ok(caller);
                }
                Err(e) if e.falls_through() => continue,
                Err(e) => {
                    debug!(scheme, error = %e, "Credentials refused");
                    return Err(e);
                }
            }
        }
        Err(AuthError::MissingCredentials)
    }
}

impl Default for AuthManager {
    fn default() -> Self {
        Self::new()
    }
}
