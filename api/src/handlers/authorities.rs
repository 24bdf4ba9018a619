//! Host and sub-authority management.

use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use certa_common::{ids::AuthorityId, params::CreateAuthorityParams, views::AuthorityData};
use tracing::instrument;

use crate::{auth::Auth, context::ApiContext, error::ApiError};

#[utoipa::path(
    get,
    path = "/ca/v2/authorities",
    tags = ["authorities"],
    responses((status = 200, description = "Every authority, host first", body = Vec<AuthorityData>))
)]
pub async fn list_authorities(State(ctx): State<ApiContext>) -> Json<Vec<AuthorityData>> {
    Json(
        ctx.engine
            .list_authorities()
            .into_iter()
            .map(Into::into)
            .collect(),
    )
}

#[utoipa::path(
    post,
    path = "/ca/v2/authorities",
    tags = ["authorities"],
    request_body = CreateAuthorityParams,
    responses(
        (status = 201, description = "Sub-authority created", body = AuthorityData),
        (status = 400, description = "Invalid DN"),
        (status = 409, description = "DN already in use or parent disabled"),
    )
)]
#[instrument(skip(ctx, caller, params))]
pub async fn create_authority(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Json(params): Json<CreateAuthorityParams>,
) -> Result<(StatusCode, Json<AuthorityData>), ApiError> {
    let authority = ctx.engine.create_authority(&caller, params).await?;
    Ok((StatusCode::CREATED, Json(authority.into())))
}

#[utoipa::path(
    get,
    path = "/ca/v2/authorities/{id}",
    tags = ["authorities"],
    params(("id" = String, Path, description = "Authority id")),
    responses(
        (status = 200, description = "The authority", body = AuthorityData),
        (status = 404, description = "Authority not found"),
    )
)]
pub async fn get_authority(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<Json<AuthorityData>, ApiError> {
    let id: AuthorityId = id.parse()?;
    Ok(Json(ctx.engine.get_authority(id)?.into()))
}

async fn set_enabled(
    ctx: ApiContext,
    caller: certa_common::caller::Caller,
    id: String,
    enabled: bool,
) -> Result<Json<AuthorityData>, ApiError> {
    let id: AuthorityId = id.parse()?;
    let authority = ctx.engine.set_authority_enabled(&caller, id, enabled).await?;
    Ok(Json(authority.into()))
}

#[utoipa::path(
    post,
    path = "/ca/v2/authorities/{id}/enable",
    tags = ["authorities"],
    params(("id" = String, Path, description = "Authority id")),
    responses((status = 200, description = "Authority enabled", body = AuthorityData))
)]
#[instrument(skip(ctx, caller))]
pub async fn enable_authority(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(id): Path<String>,
) -> Result<Json<AuthorityData>, ApiError> {
    set_enabled(ctx, caller, id, true).await
}

#[utoipa::path(
    post,
    path = "/ca/v2/authorities/{id}/disable",
    tags = ["authorities"],
    params(("id" = String, Path, description = "Authority id")),
    responses(
        (status = 200, description = "Authority disabled", body = AuthorityData),
        (status = 409, description = "The host authority cannot be disabled"),
    )
)]
#[instrument(skip(ctx, caller))]
pub async fn disable_authority(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(id): Path<String>,
) -> Result<Json<AuthorityData>, ApiError> {
    set_enabled(ctx, caller, id, false).await
}

#[utoipa::path(
    delete,
    path = "/ca/v2/authorities/{id}",
    tags = ["authorities"],
    params(("id" = String, Path, description = "Authority id")),
    responses(
        (status = 204, description = "Authority deleted"),
        (status = 409, description = "Authority is enabled, has children or is the host"),
    )
)]
#[instrument(skip(ctx, caller))]
pub async fn delete_authority(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id: AuthorityId = id.parse()?;
    ctx.engine.delete_authority(&caller, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/ca/v2/authorities/{id}/crl",
    tags = ["authorities"],
    params(("id" = String, Path, description = "Authority id")),
    responses((status = 200, description = "Current CRL in PEM, re-signed after revocation changes", body = String, content_type = "application/x-pem-file"))
)]
#[instrument(skip(ctx))]
pub async fn get_crl(
    State(ctx): State<ApiContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id: AuthorityId = id.parse()?;
    let crl = ctx.engine.authority_crl(id).await?;
    Ok(([(header::CONTENT_TYPE, "application/x-pem-file")], crl))
}
