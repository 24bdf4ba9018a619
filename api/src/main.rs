use std::sync::Arc;

use anyhow::Context as _;
use certa_api::{
    ca::Engine,
    config::{CertaApiConfig, LogFormat},
    server,
};
use certa_db::storage::memory::MemoryStorage;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CertaApiConfig::parse();

    if config.dump_openapi {
        // The document does not depend on storage, so skip connecting to it.
        let engine = Engine::builder(Arc::new(MemoryStorage::new())).build().await?;
        let (_, api) = server::make(config, Arc::new(engine))?;
        print!("{}", api.to_pretty_json()?);
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or("certa_api=info,certa_common=info,certa_db=info".into());
    match config.log_format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).pretty().init(),
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
    }

    let engine = server::engine(&config).await?;
    let (router, _) = server::make(config.clone(), engine)?;

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    info!("Listening on http://{:?}", config.bind_addr);

    axum::serve(listener, router)
        .await
        .context("Server exited with an error")
}
