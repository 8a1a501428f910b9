use crate::{
    api::handlers::{client_ip, user_agent},
    audit::{SecurityAuditLog, SecurityEvent, SecurityStats},
    totp::{TotpError, TotpService, VerifyOutcome},
};
use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    Extension,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

const RECENT_EVENTS_LIMIT: usize = 50;

#[derive(Debug, Deserialize, ToSchema)]
pub struct AdminRequest {
    pub admin_id: Uuid,
}

#[derive(Deserialize, ToSchema)]
pub struct CodeRequest {
    pub admin_id: Uuid,
    pub code: String,
}

/// Returned exactly once at enrollment. The secret and backup codes are never
/// retrievable again after this response.
#[derive(Serialize, ToSchema)]
pub struct EnrollmentResponse {
    pub secret_base32: String,
    pub otp_uri: String,
    pub backup_codes: Vec<String>,
}

#[derive(Serialize, ToSchema)]
pub struct VerifyResponse {
    pub success: bool,
}

#[derive(Serialize, ToSchema)]
pub struct DashboardResponse {
    pub stats: SecurityStats,
    pub recent_events: Vec<SecurityEvent>,
}

#[utoipa::path(
    post,
    path= "/v1/security/totp/generate",
    request_body = AdminRequest,
    responses (
        (status = 200, description = "Enrollment started", body = EnrollmentResponse),
        (status = 409, description = "Admin is already enrolled"),
    ),
    tag= "totp"
)]
#[instrument(skip(service, headers))]
pub async fn generate_secret(
    service: Extension<TotpService>,
    headers: HeaderMap,
    Json(payload): Json<AdminRequest>,
) -> Response {
    let ip = client_ip(&headers);

    match service
        .generate_secret(payload.admin_id, &ip, user_agent(&headers))
        .await
    {
        Ok(enrollment) => Json(EnrollmentResponse {
            secret_base32: enrollment.secret_base32,
            otp_uri: enrollment.otp_uri,
            backup_codes: enrollment.backup_codes,
        })
        .into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path= "/v1/security/totp/verify",
    request_body = CodeRequest,
    responses (
        (status = 200, description = "Verification result", body = VerifyResponse),
        (status = 404, description = "Admin has no active enrollment"),
        (status = 429, description = "Too many attempts, locked out"),
    ),
    tag= "totp"
)]
#[instrument(skip(service, headers, payload))]
pub async fn verify(
    service: Extension<TotpService>,
    headers: HeaderMap,
    Json(payload): Json<CodeRequest>,
) -> Response {
    let ip = client_ip(&headers);

    match service
        .verify(payload.admin_id, &ip, user_agent(&headers), &payload.code)
        .await
    {
        Ok(outcome) => outcome_response(&outcome),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path= "/v1/security/totp/verify-backup",
    request_body = CodeRequest,
    responses (
        (status = 200, description = "Verification result", body = VerifyResponse),
        (status = 404, description = "Admin has no active enrollment"),
        (status = 429, description = "Too many attempts, locked out"),
    ),
    tag= "totp"
)]
#[instrument(skip(service, headers, payload))]
pub async fn verify_backup(
    service: Extension<TotpService>,
    headers: HeaderMap,
    Json(payload): Json<CodeRequest>,
) -> Response {
    let ip = client_ip(&headers);

    match service
        .verify_backup_code(payload.admin_id, &ip, user_agent(&headers), &payload.code)
        .await
    {
        Ok(outcome) => outcome_response(&outcome),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    post,
    path= "/v1/security/totp/disable",
    request_body = AdminRequest,
    responses (
        (status = 200, description = "Enrollment disabled", body = VerifyResponse),
    ),
    tag= "totp"
)]
#[instrument(skip(service, headers))]
pub async fn disable(
    service: Extension<TotpService>,
    headers: HeaderMap,
    Json(payload): Json<AdminRequest>,
) -> Response {
    let ip = client_ip(&headers);

    match service
        .disable(payload.admin_id, &ip, user_agent(&headers))
        .await
    {
        Ok(()) => Json(VerifyResponse { success: true }).into_response(),
        Err(err) => error_response(&err),
    }
}

#[utoipa::path(
    get,
    path= "/v1/security/dashboard",
    responses (
        (status = 200, description = "Security dashboard", body = DashboardResponse),
    ),
    tag= "dashboard"
)]
#[instrument(skip(audit))]
pub async fn dashboard(audit: Extension<SecurityAuditLog>) -> Response {
    let stats = match audit.stats().await {
        Ok(stats) => stats,
        Err(err) => {
            error!("Failed to compute security stats: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let recent_events = match audit.recent(RECENT_EVENTS_LIMIT).await {
        Ok(events) => events,
        Err(err) => {
            error!("Failed to load recent security events: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    Json(DashboardResponse {
        stats,
        recent_events,
    })
    .into_response()
}

fn outcome_response(outcome: &VerifyOutcome) -> Response {
    match outcome {
        VerifyOutcome::Verified => Json(VerifyResponse { success: true }).into_response(),
        VerifyOutcome::InvalidCode | VerifyOutcome::InvalidBackupCode => {
            Json(VerifyResponse { success: false }).into_response()
        }
        VerifyOutcome::LockedOut {
            retry_after_seconds,
        } => locked_response(*retry_after_seconds),
    }
}

fn error_response(err: &TotpError) -> Response {
    match err {
        TotpError::AlreadyEnrolled => (
            StatusCode::CONFLICT,
            Json(json!({"error": "already_enrolled"})),
        )
            .into_response(),
        TotpError::NotEnrolled => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not_enrolled"})),
        )
            .into_response(),
        TotpError::Crypto(_) | TotpError::Internal(_) => {
            error!("Security operation failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn locked_response(retry_after_seconds: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "locked_out",
            "retry_after_seconds": retry_after_seconds,
        })),
    )
        .into_response()
}
