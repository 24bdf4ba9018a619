use std::sync::Arc;

use anyhow::Context as _;
use axum::{Router, extract::MatchedPath, http::{HeaderName, HeaderValue, Request}};
use certa_common::views::ApiErrorResponse;
use certa_db::storage::{Storage, memory::MemoryStorage, mongodb::MongoDBStorage};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer}, trace::TraceLayer};
use tracing::{info, info_span};
use utoipa::{ToSchema, openapi::{Info, License, OpenApi, RefOr, path::Operation}};
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::{
    ca::Engine,
    config::{CertaApiConfig, StorageBackend, store::ConfigStore},
    context::ApiContext,
    handlers,
};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Open the configured storage backend and start the engine on top of it.
pub async fn engine(cfg: &CertaApiConfig) -> anyhow::Result<Arc<Engine>> {
    let db: Arc<dyn Storage> = match cfg.storage {
        StorageBackend::Memory => {
            info!("Using in-memory storage, state is lost on restart");
            Arc::new(MemoryStorage::new())
        }
        StorageBackend::Mongodb => Arc::new(
            MongoDBStorage::new(&cfg.mongodb_uri)
                .await
                .context("Failed to connect to MongoDB")?,
        ),
    };

    let config = ConfigStore::load(cfg.config.as_deref()).context("Failed to load engine configuration")?;
    let engine = Engine::builder(db)
        .config(config)
        .build()
        .await
        .context("Failed to start the CA engine")?;

    Ok(Arc::new(engine))
}

pub fn make(cfg: CertaApiConfig, engine: Arc<Engine>) -> anyhow::Result<(Router, OpenApi)> {
    let allowed_origin = cfg
        .public_url
        .parse::<HeaderValue>()
        .context("Public URL is not a valid origin")?;
    let context = ApiContext::new(cfg, engine);

    let x_request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(
            x_request_id.clone(),
            MakeRequestUuid,
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request<_>| {
                    let request_id = req
                        .headers()
                        .get(REQUEST_ID_HEADER)
                        .and_then(|v| v.to_str().ok());
                    let span = info_span!(
                        "http_request",
                        method = req.method().to_string(),
                        request_id = Option::<&str>::None,
                        path = Option::<&str>::None,
                    );

                    if let Some(request_id) = request_id {
                        span.record("request_id", request_id);
                    };

                    if let Some(path) = req.extensions().get::<MatchedPath>() {
                        span.record("path", path.as_str())
                    } else {
                        span.record("path", req.uri().path())
                    };

                    span
                }),
        )
        .layer(CorsLayer::new().allow_origin(allowed_origin))
        .layer(PropagateRequestIdLayer::new(x_request_id));

    let openapi = OpenApi::builder()
        .info(
            Info::builder()
                .title("Certa CA API Reference")
                .version(env!("CARGO_PKG_VERSION"))
                .license(Some(
                    License::builder()
                        .name("Apache 2.0 License")
                        .identifier(Some(env!("CARGO_PKG_LICENSE")))
                        .build()
                ))
        )
        .build();

    let (r, mut a) = OpenApiRouter::with_openapi(openapi)
        .routes(routes!(handlers::health_check))
        // Requesters
        .routes(routes!(handlers::requests::submit_enrollment))
        .routes(routes!(handlers::requests::submit_renewal))
        .routes(routes!(handlers::requests::get_request))
        // Agents
        .routes(routes!(handlers::agent::list_requests))
        .routes(routes!(handlers::agent::review_request))
        .routes(routes!(handlers::agent::approve_request))
        .routes(routes!(handlers::agent::reject_request))
        .routes(routes!(handlers::agent::cancel_request))
        .routes(routes!(handlers::agent::assign_request))
        .routes(routes!(handlers::agent::unassign_request))
        .routes(routes!(handlers::agent::update_request))
        .routes(routes!(handlers::agent::complete_request))
        .routes(routes!(handlers::agent::retry_request))
        // Certificates
        .routes(routes!(handlers::certs::list_certs))
        .routes(routes!(handlers::certs::search_certs))
        .routes(routes!(handlers::certs::get_cert))
        .routes(routes!(handlers::certs::revoke_cert))
        .routes(routes!(handlers::certs::unrevoke_cert))
        // Authorities
        .routes(routes!(
            handlers::authorities::list_authorities,
            handlers::authorities::create_authority
        ))
        .routes(routes!(
            handlers::authorities::get_authority,
            handlers::authorities::delete_authority
        ))
        .routes(routes!(handlers::authorities::enable_authority))
        .routes(routes!(handlers::authorities::disable_authority))
        .routes(routes!(handlers::authorities::get_crl))
        // Admin
        .routes(routes!(
            handlers::admin::get_serial_range,
            handlers::admin::reset_serial_range
        ))
        .layer(middleware)
        .with_state(context)
        .split_for_parts();

    a.paths.paths.iter_mut().for_each(|(_path, item)| {
        apply_default_errors(&mut item.get);
        apply_default_errors(&mut item.post);
        apply_default_errors(&mut item.patch);
        apply_default_errors(&mut item.put);
        apply_default_errors(&mut item.delete);
        apply_default_errors(&mut item.trace);
        apply_default_errors(&mut item.head);
        apply_default_errors(&mut item.options);
    });

    Ok((r, a))
}

fn apply_default_errors(item: &mut Option<Operation>) {
    if let Some(item) = item {
        item.responses.responses.insert(
            "401".into(),
            RefOr::Ref(
                utoipa::openapi::Ref::builder()
                    .summary("Unauthorized")
                    .ref_location_from_schema_name(ApiErrorResponse::name())
                    .build()
            )
        );

        item.responses.responses.insert(
            "403".into(),
            RefOr::Ref(
                utoipa::openapi::Ref::builder()
                    .summary("Forbidden")
                    .ref_location_from_schema_name(ApiErrorResponse::name())
                    .build()
            )
        );

        item.responses.responses.insert(
            "500".into(),
            RefOr::Ref(
                utoipa::openapi::Ref::builder()
                    .summary("Internal server error")
                    .ref_location_from_schema_name(ApiErrorResponse::name())
                    .build()
            )
        );
    }
}
