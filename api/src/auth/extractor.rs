use std::future::Future;
use std::sync::Arc;

use axum::{extract::FromRequestParts, http::request::Parts};
use certa_common::caller::{Caller, CallerError};

use crate::{context::ApiContext, error::ApiError};

/// Extractor that requires an authenticated caller.
///
/// Rejects with 401 when no provider accepts the request's credentials, or
/// with 500 when the credential store fails.
/// Permission checks happen in the engine operation the handler calls.
///
/// ```rust,ignore
/// pub async fn approve_request(
///     State(ctx): State<ApiContext>,
///     Auth(caller): Auth,
///     Path(id): Path<String>,
/// ) -> Result<Json<CertReviewInfo>, ApiError> {
///     let (request, _) = ctx.engine.approve_request(&caller, id.parse()?).await?;
///     Ok(Json(request.into()))
/// }
/// ```
pub struct Auth(pub Caller);

impl FromRequestParts<ApiContext> for Auth {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &ApiContext,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let auth_manager = Arc::clone(&state.auth_manager);
        async move {
            let caller = auth_manager
                .authenticate(parts)
                .await
                .map_err(|e| ApiError::Caller(CallerError::from(e)))?;
            Ok(Auth(caller))
        }
    }
}
