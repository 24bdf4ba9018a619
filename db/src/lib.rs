//! Persistence for the certa CA engine: record models, storage traits and the
//! in-memory and MongoDB backends.

pub mod models;
pub mod storage;
