//! Certificate retrieval, search and revocation.

use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use certa_common::{
    ids::SerialNumber,
    params::{CertListParams, CertSearchParams, PaginationParams, RevocationParams},
    views::{CertData, CertDataInfo, CertSearchResults, PaginatedList},
};
use certa_db::storage::CertFilter;
use tracing::instrument;

use super::paginated;
use crate::{
    auth::Auth,
    ca::{parse_authority_id, parse_serial},
    context::ApiContext,
    error::ApiError,
};

/// Upper bound on the time one search request may spend scanning.
const SEARCH_TIME_LIMIT: Duration = Duration::from_secs(10);

#[utoipa::path(
    get,
    path = "/ca/v2/certs",
    tags = ["certs"],
    params(CertListParams),
    responses((status = 200, description = "Certificates in serial order", body = PaginatedList<CertDataInfo>))
)]
#[instrument(skip(ctx))]
pub async fn list_certs(
    State(ctx): State<ApiContext>,
    Query(query): Query<CertListParams>,
) -> Result<Json<PaginatedList<CertDataInfo>>, ApiError> {
    let paging = PaginationParams {
        start: query.start,
        size: query.size,
    };
    let (start, size) = (paging.start(), paging.size());
    let filter = CertFilter {
        status: query.status,
        ..Default::default()
    };

    let page = ctx.engine.list_certs(filter, start, size).await?;
    Ok(Json(paginated(page, start, size)))
}

fn search_filter(params: &CertSearchParams) -> Result<CertFilter, ApiError> {
    Ok(CertFilter {
        status: params.status,
        authority_id: params
            .authority_id
            .as_deref()
            .map(parse_authority_id)
            .transpose()?,
        subject_contains: params.subject_contains.clone(),
        issuer_dn: params.issuer_dn.clone(),
        serial_from: params.serial_from.as_deref().map(parse_serial).transpose()?,
        serial_to: params.serial_to.as_deref().map(parse_serial).transpose()?,
        revoked_by: params.revoked_by.clone(),
        revocation_reason: params.revocation_reason,
        issued_by: params.issued_by.clone(),
        request_id: None,
    })
}

#[utoipa::path(
    post,
    path = "/ca/v2/certs/search",
    tags = ["certs"],
    request_body = CertSearchParams,
    responses((status = 200, description = "Matching certificates", body = CertSearchResults))
)]
#[instrument(skip(ctx, params))]
pub async fn search_certs(
    State(ctx): State<ApiContext>,
    Json(params): Json<CertSearchParams>,
) -> Result<Json<CertSearchResults>, ApiError> {
    let filter = search_filter(&params)?;
    let paging = PaginationParams {
        start: params.start,
        size: params.size,
    };
    let (start, size) = (paging.start(), paging.size());

    let result = ctx
        .engine
        .search_certs(filter, start, size, SEARCH_TIME_LIMIT)
        .await?;
    Ok(Json(CertSearchResults {
        items: result.items.into_iter().map(Into::into).collect(),
        start,
        total: result.total,
        truncated: result.truncated,
    }))
}

#[utoipa::path(
    get,
    path = "/ca/v2/certs/{serial}",
    tags = ["certs"],
    params(("serial" = String, Path, description = "Serial number, `0x` hex or decimal")),
    responses(
        (status = 200, description = "Certificate with its chain", body = CertData),
        (status = 404, description = "Certificate not found"),
    )
)]
#[instrument(skip(ctx))]
pub async fn get_cert(
    State(ctx): State<ApiContext>,
    Path(serial): Path<String>,
) -> Result<Json<CertData>, ApiError> {
    let serial: SerialNumber = serial.parse()?;
    let (cert, chain) = ctx.engine.get_cert_with_chain(serial).await?;
    let encoded = cert.cert_pem.clone();
    Ok(Json(CertData {
        info: cert.into(),
        encoded,
        pkcs7_cert_chain: STANDARD.encode(chain),
    }))
}

#[utoipa::path(
    post,
    path = "/ca/v2/agent/certs/{serial}/revoke",
    tags = ["agent"],
    params(("serial" = String, Path, description = "Serial number, `0x` hex or decimal")),
    request_body = RevocationParams,
    responses(
        (status = 200, description = "Certificate revoked", body = CertDataInfo),
        (status = 404, description = "Certificate not found"),
        (status = 409, description = "Already revoked with another reason, or no authority matches"),
    )
)]
#[instrument(skip(ctx, caller, params))]
pub async fn revoke_cert(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(serial): Path<String>,
    Json(params): Json<RevocationParams>,
) -> Result<Json<CertDataInfo>, ApiError> {
    let serial: SerialNumber = serial.parse()?;
    let cert = ctx.engine.revoke_certificate(&caller, serial, params).await?;
    Ok(Json(cert.into()))
}

#[utoipa::path(
    post,
    path = "/ca/v2/agent/certs/{serial}/unrevoke",
    tags = ["agent"],
    params(("serial" = String, Path, description = "Serial number, `0x` hex or decimal")),
    responses(
        (status = 200, description = "Certificate taken off hold", body = CertDataInfo),
        (status = 409, description = "Certificate is revoked for good"),
    )
)]
#[instrument(skip(ctx, caller))]
pub async fn unrevoke_cert(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(serial): Path<String>,
) -> Result<Json<CertDataInfo>, ApiError> {
    let serial: SerialNumber = serial.parse()?;
    let cert = ctx.engine.unrevoke_certificate(&caller, serial).await?;
    Ok(Json(cert.into()))
}
