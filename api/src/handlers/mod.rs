use axum::extract::State;
use certa_common::views::PaginatedList;
use certa_db::storage::Page;

use crate::{context::ApiContext, error::ApiError};

pub mod admin;
pub mod agent;
pub mod authorities;
pub mod certs;
pub mod requests;


#[utoipa::path(
    get,
    path = "/health",
    tags = ["health"],
    responses((status = 200, description = "Storage is reachable", body = String))
)]
pub async fn health_check(State(ctx): State<ApiContext>) -> Result<&'static str, ApiError> {
    ctx.engine.ping().await?;
    Ok("Healthy")
}

/// Wrap a store page for the wire.
fn paginated<T, V: From<T>>(page: Page<T>, start: usize, size: usize) -> PaginatedList<V> {
    PaginatedList {
        items: page.items.into_iter().map(V::from).collect(),
        total: page.total,
        start,
        size,
    }
}
