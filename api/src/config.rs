use clap::{Parser, ValueEnum};
use std::{net::SocketAddr, path::PathBuf};

pub mod store;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StorageBackend {
    /// Keep everything in process memory. Lost on restart.
    Memory,
    Mongodb,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone, Debug, Parser)]
pub struct CertaApiConfig {
    #[clap(
        short,
        long,
        env = "CERTA_API_BIND_ADDR",
        default_value = "0.0.0.0:4000"
    )]
    pub bind_addr: SocketAddr,

    #[clap(
        long,
        env = "CERTA_API_PUBLIC_URL",
        default_value = "http://localhost:4000"
    )]
    pub public_url: String,

    #[clap(long, default_value_t = false)]
    pub dump_openapi: bool,

    #[clap(long, env = "CERTA_API_STORAGE", value_enum, default_value = "memory")]
    pub storage: StorageBackend,

    #[clap(
        long,
        env = "CERTA_API_MONGODB_URI",
        default_value = "mongodb://localhost:27017/certa"
    )]
    pub mongodb_uri: String,

    /// Engine configuration file (TOML). Serial ranges, queue tuning, the
    /// host authority, profiles, policies, listeners and API tokens live
    /// here. Values can be overridden with `CERTA_<SECTION>__<KEY>`.
    #[clap(short, long, env = "CERTA_API_CONFIG")]
    pub config: Option<PathBuf>,

    #[clap(long, env = "CERTA_API_LOG_FORMAT", value_enum, default_value = "pretty")]
    pub log_format: LogFormat,
}
