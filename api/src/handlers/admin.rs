//! Serial number range administration.

use axum::{
    Json,
    extract::{Path, State},
};
use certa_common::{ids::SerialNumber, params::SerialRangeParams, views::SerialRangeView};
use tracing::instrument;

use crate::{auth::Auth, context::ApiContext, error::ApiError};

#[utoipa::path(
    get,
    path = "/ca/v2/admin/serial-ranges/{counter}",
    tags = ["admin"],
    params(("counter" = String, Path, description = "`certificates` or `requests`")),
    responses(
        (status = 200, description = "Current range", body = SerialRangeView),
        (status = 404, description = "Unknown counter"),
    )
)]
#[instrument(skip(ctx, caller))]
pub async fn get_serial_range(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(counter): Path<String>,
) -> Result<Json<SerialRangeView>, ApiError> {
    let range = ctx.engine.serial_range(&caller, &counter).await?;
    Ok(Json(range.into()))
}

#[utoipa::path(
    put,
    path = "/ca/v2/admin/serial-ranges/{counter}",
    tags = ["admin"],
    params(("counter" = String, Path, description = "`certificates` or `requests`")),
    request_body = SerialRangeParams,
    responses(
        (status = 200, description = "Range replaced", body = SerialRangeView),
        (status = 400, description = "Range is inverted or would reissue numbers"),
    )
)]
#[instrument(skip(ctx, caller))]
pub async fn reset_serial_range(
    State(ctx): State<ApiContext>,
    Auth(caller): Auth,
    Path(counter): Path<String>,
    Json(params): Json<SerialRangeParams>,
) -> Result<Json<SerialRangeView>, ApiError> {
    let start: SerialNumber = params.start.parse()?;
    let end: SerialNumber = params.end.parse()?;
    let range = ctx
        .engine
        .reset_serial_range(&caller, &counter, start.get(), end.get())
        .await?;
    Ok(Json(range.into()))
}
