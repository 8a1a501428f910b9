use crate::{
    audit::{self, PgAuditStore, SecurityAuditLog},
    cli::globals::GlobalArgs,
    crypto::{EnvelopeCipher, MasterKey},
    ratelimit::{self, PgRateLimiter, RateLimiter},
    totp::{PgSecretStore, TotpService},
};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::{get, post},
    Extension, Router,
};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;

pub(crate) mod handlers;
// OpenAPI document assembly lives in openapi.rs.
mod openapi;

pub use openapi::openapi;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const LOCKOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Build the API router with all security routes registered.
#[must_use]
pub fn router() -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route(
            "/openapi.json",
            get(|| async { axum::Json(openapi::openapi()) }),
        )
        .route(
            "/v1/security/totp/generate",
            post(handlers::security::generate_secret),
        )
        .route("/v1/security/totp/verify", post(handlers::security::verify))
        .route(
            "/v1/security/totp/verify-backup",
            post(handlers::security::verify_backup),
        )
        .route(
            "/v1/security/totp/disable",
            post(handlers::security::disable),
        )
        .route(
            "/v1/security/dashboard",
            get(handlers::security::dashboard),
        )
}

/// Start the server
/// # Errors
/// Return error if failed to start the server. An invalid installation
/// secret is fatal here: the process refuses to serve encryption-dependent
/// requests rather than run with a degraded key.
pub async fn new(port: u16, dsn: String, globals: &GlobalArgs) -> Result<()> {
    let master = MasterKey::from_secret(globals.master_secret.clone())
        .context("Refusing to start without a valid installation secret")?;

    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let audit_log = SecurityAuditLog::new(Arc::new(PgAuditStore::new(pool.clone())));
    audit::spawn_retention_worker(audit_log.clone(), globals.retention, RETENTION_SWEEP_INTERVAL);

    let limiter: Arc<dyn RateLimiter> = Arc::new(PgRateLimiter::new(globals.lockout, pool.clone()));
    ratelimit::spawn_lockout_sweeper(limiter.clone(), LOCKOUT_SWEEP_INTERVAL);

    let service = TotpService::new(
        EnvelopeCipher::new(master),
        Arc::new(PgSecretStore::new(pool.clone())),
        limiter,
        audit_log.clone(),
        globals.issuer.clone(),
    );

    let app = router().layer(
        ServiceBuilder::new()
            .layer(SetRequestHeaderLayer::if_not_present(
                HeaderName::from_static("x-request-id"),
                |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
            ))
            .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                "x-request-id",
            )))
            .layer(TraceLayer::new_for_http().make_span_with(make_span))
            .layer(Extension(service))
            .layer(Extension(audit_log)),
    );

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
