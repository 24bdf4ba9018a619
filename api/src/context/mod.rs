use std::sync::Arc;

use crate::{
    auth::AuthManager,
    ca::Engine,
    config::CertaApiConfig,
};

#[derive(Clone)]
pub struct ApiContext {
    pub config: CertaApiConfig,
    pub engine: Arc<Engine>,
    pub auth_manager: Arc<AuthManager>,
}

impl ApiContext {
    pub fn new(config: CertaApiConfig, engine: Arc<Engine>) -> Self {
        let auth_manager = AuthManager::from_tokens(engine.tokens());
        Self {
            config,
            engine,
            auth_manager: Arc::new(auth_manager),
        }
    }
}
