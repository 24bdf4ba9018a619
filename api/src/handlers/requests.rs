//! End-entity request endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use certa_common::{
    ids::RequestId,
    params::{EnrollmentParams, RenewalParams},
    views::CertRequestInfo,
};
use tracing::instrument;

use crate::{auth::Auth, ca::parse_serial, context::ApiContext, error::ApiError};

#[utoipa::path(
    post,
    path = "/ca/v2/certrequests",
    tags = ["certrequests"],
    request_body = EnrollmentParams,
    responses(
        (status = 201, description = "Request submitted", body = CertRequestInfo),
        (status = 400, description = "Invalid CSR, profile or inputs"),
        (status = 409, description = "Authority is disabled"),
    )
)]
#[instrument(skip(ctx, caller, params))]
pub async fn submit_enrollment(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Json(params): Json<EnrollmentParams>,
) -> Result<(StatusCode, Json<CertRequestInfo>), ApiError> {
    let request = ctx.engine.submit_enrollment(&caller, params).await?;
    Ok((StatusCode::CREATED, Json(request.into())))
}

#[utoipa::path(
    post,
    path = "/ca/v2/certrequests/renewal",
    tags = ["certrequests"],
    request_body = RenewalParams,
    responses(
        (status = 201, description = "Renewal submitted", body = CertRequestInfo),
        (status = 404, description = "Certificate not found"),
    )
)]
#[instrument(skip(ctx, caller))]
pub async fn submit_renewal(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Json(params): Json<RenewalParams>,
) -> Result<(StatusCode, Json<CertRequestInfo>), ApiError> {
    let serial = parse_serial(&params.serial)?;
    let request = ctx.engine.submit_renewal(&caller, serial).await?;
    Ok((StatusCode::CREATED, Json(request.into())))
}

#[utoipa::path(
    get,
    path = "/ca/v2/certrequests/{id}",
    tags = ["certrequests"],
    params(("id" = String, Path, description = "Request id")),
    responses(
        (status = 200, description = "Request status", body = CertRequestInfo),
        (status = 404, description = "Request not found"),
    )
)]
#[instrument(skip(ctx, caller))]
pub async fn get_request(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(id): Path<String>,
) -> Result<Json<CertRequestInfo>, ApiError> {
    let id: RequestId = id.parse()?;
    let request = ctx.engine.get_request(&caller, id).await?;
    Ok(Json(request.into()))
}
