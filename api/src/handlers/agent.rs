//! Agent review of the request queue.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use certa_common::{
    caller::Permission,
    ids::RequestId,
    params::{CompletionParams, PaginationParams, RequestSearchParams, ReviewParams, UpdateRequestParams},
    views::{CertReviewInfo, PaginatedList},
};
use certa_db::storage::RequestFilter;
use tracing::instrument;

use super::paginated;
use crate::{
    auth::Auth,
    ca::{
        parse_authority_id,
        queue::{ApprovalOutcome, ServiceCompletion},
    },
    context::ApiContext,
    error::ApiError,
};

#[utoipa::path(
    get,
    path = "/ca/v2/agent/certrequests",
    tags = ["agent"],
    params(RequestSearchParams),
    responses((status = 200, description = "Matching requests", body = PaginatedList<CertReviewInfo>))
)]
#[instrument(skip(ctx, caller))]
pub async fn list_requests(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Query(query): Query<RequestSearchParams>,
) -> Result<Json<PaginatedList<CertReviewInfo>>, ApiError> {
    let filter = RequestFilter {
        status: query.status,
        request_type: query.request_type,
        authority_id: query
            .authority_id
            .as_deref()
            .map(parse_authority_id)
            .transpose()?,
        owner: None,
        assigned_to: query.assigned_to,
    };
    let paging = PaginationParams {
        start: query.start,
        size: query.size,
    };
    let (start, size) = (paging.start(), paging.size());

    let page = ctx.engine.list_requests(&caller, filter, start, size).await?;
    Ok(Json(paginated(page, start, size)))
}

#[utoipa::path(
    get,
    path = "/ca/v2/agent/certrequests/{id}",
    tags = ["agent"],
    params(("id" = String, Path, description = "Request id")),
    responses((status = 200, description = "Request for review", body = CertReviewInfo))
)]
#[instrument(skip(ctx, caller))]
pub async fn review_request(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(id): Path<String>,
) -> Result<Json<CertReviewInfo>, ApiError> {
    let id: RequestId = id.parse()?;
    caller.require(Permission::RequestsRead)?;
    let request = ctx.engine.get_request(&caller, id).await?;
    Ok(Json(request.into()))
}

#[utoipa::path(
    post,
    path = "/ca/v2/agent/certrequests/{id}/approve",
    tags = ["agent"],
    params(("id" = String, Path, description = "Request id")),
    responses(
        (status = 200, description = "Approved and serviced", body = CertReviewInfo),
        (status = 409, description = "Request is not pending"),
        (status = 422, description = "Refused by policy"),
    )
)]
#[instrument(skip(ctx, caller))]
pub async fn approve_request(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(id): Path<String>,
) -> Result<Json<CertReviewInfo>, ApiError> {
    let id: RequestId = id.parse()?;
    match ctx.engine.approve_request(&caller, id).await? {
        (_, ApprovalOutcome::PolicyRejected(messages)) => Err(ApiError::PolicyRejection(messages)),
        (request, ApprovalOutcome::Serviced(_)) => Ok(Json(request.into())),
    }
}

#[utoipa::path(
    post,
    path = "/ca/v2/agent/certrequests/{id}/reject",
    tags = ["agent"],
    params(("id" = String, Path, description = "Request id")),
    request_body = ReviewParams,
    responses((status = 200, description = "Request rejected", body = CertReviewInfo))
)]
#[instrument(skip(ctx, caller, params))]
pub async fn reject_request(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(id): Path<String>,
    Json(params): Json<ReviewParams>,
) -> Result<Json<CertReviewInfo>, ApiError> {
    let id: RequestId = id.parse()?;
    let request = ctx.engine.reject_request(&caller, id, params.reason).await?;
    Ok(Json(request.into()))
}

#[utoipa::path(
    post,
    path = "/ca/v2/agent/certrequests/{id}/cancel",
    tags = ["agent"],
    params(("id" = String, Path, description = "Request id")),
    request_body = ReviewParams,
    responses((status = 200, description = "Request canceled", body = CertReviewInfo))
)]
#[instrument(skip(ctx, caller, params))]
pub async fn cancel_request(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(id): Path<String>,
    Json(params): Json<ReviewParams>,
) -> Result<Json<CertReviewInfo>, ApiError> {
    let id: RequestId = id.parse()?;
    let request = ctx.engine.cancel_request(&caller, id, params.reason).await?;
    Ok(Json(request.into()))
}

#[utoipa::path(
    post,
    path = "/ca/v2/agent/certrequests/{id}/assign",
    tags = ["agent"],
    params(("id" = String, Path, description = "Request id")),
    responses((status = 200, description = "Assigned to the caller", body = CertReviewInfo))
)]
#[instrument(skip(ctx, caller))]
pub async fn assign_request(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(id): Path<String>,
) -> Result<Json<CertReviewInfo>, ApiError> {
    let id: RequestId = id.parse()?;
    let request = ctx.engine.assign_request(&caller, id).await?;
    Ok(Json(request.into()))
}

#[utoipa::path(
    post,
    path = "/ca/v2/agent/certrequests/{id}/unassign",
    tags = ["agent"],
    params(("id" = String, Path, description = "Request id")),
    responses((status = 200, description = "Assignment cleared", body = CertReviewInfo))
)]
#[instrument(skip(ctx, caller))]
pub async fn unassign_request(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(id): Path<String>,
) -> Result<Json<CertReviewInfo>, ApiError> {
    let id: RequestId = id.parse()?;
    let request = ctx.engine.unassign_request(&caller, id).await?;
    Ok(Json(request.into()))
}

#[utoipa::path(
    post,
    path = "/ca/v2/agent/certrequests/{id}/update",
    tags = ["agent"],
    params(("id" = String, Path, description = "Request id")),
    request_body = UpdateRequestParams,
    responses((status = 200, description = "Request edited", body = CertReviewInfo))
)]
#[instrument(skip(ctx, caller, params))]
pub async fn update_request(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(id): Path<String>,
    Json(params): Json<UpdateRequestParams>,
) -> Result<Json<CertReviewInfo>, ApiError> {
    let id: RequestId = id.parse()?;
    let request = ctx.engine.update_request(&caller, id, params).await?;
    Ok(Json(request.into()))
}

#[utoipa::path(
    post,
    path = "/ca/v2/agent/certrequests/{id}/complete",
    tags = ["agent"],
    params(("id" = String, Path, description = "Request id")),
    request_body = CompletionParams,
    responses((status = 200, description = "Pending service completed", body = CertReviewInfo))
)]
#[instrument(skip(ctx, caller, params))]
pub async fn complete_request(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(id): Path<String>,
    Json(params): Json<CompletionParams>,
) -> Result<Json<CertReviewInfo>, ApiError> {
    let id: RequestId = id.parse()?;
    let completion = if params.success {
        ServiceCompletion::Success
    } else {
        ServiceCompletion::Failed(
            params
                .error_message
                .unwrap_or_else(|| "Service reported failure".to_string()),
        )
    };
    let request = ctx.engine.complete_request(&caller, id, completion).await?;
    Ok(Json(request.into()))
}

#[utoipa::path(
    post,
    path = "/ca/v2/agent/certrequests/{id}/retry",
    tags = ["agent"],
    params(("id" = String, Path, description = "Request id")),
    responses(
        (status = 200, description = "Service run for a SVC_PENDING or APPROVED request", body = CertReviewInfo),
        (status = 409, description = "Request is in another state")
    )
)]
#[instrument(skip(ctx, caller))]
pub async fn retry_request(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(id): Path<String>,
) -> Result<Json<CertReviewInfo>, ApiError> {
    let id: RequestId = id.parse()?;
    let (request, _) = ctx.engine.retry_request(&caller, id).await?;
    Ok(Json(request.into()))
}
