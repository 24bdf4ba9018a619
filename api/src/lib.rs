//! Certa certificate authority service.
//!
//! Accepts enrollment and renewal requests, queues them for agent review and
//! issues, revokes and publishes certificates for a host authority and any
//! number of sub-authorities. The lifecycle lives in [`ca::Engine`]; the
//! REST surface in [`server`] is a thin layer over it.
//!
//! # Configuration
//!
//! Process settings (bind address, storage backend) come from the command
//! line, see [`config::CertaApiConfig`]. Engine settings come from a TOML
//! file loaded by [`config::store::ConfigStore`]; `certa.example.toml` lists
//! every key.
//!
//! # Authentication
//!
//! Bearer tokens configured under `[[tokens]]`, see
//! [`auth::providers::token`].

pub mod auth;
pub mod ca;
pub mod config;
pub mod server;

pub(crate) mod context;
pub(crate) mod error;
pub(crate) mod handlers;
