use crate::api::handlers::{health, security};
use crate::audit::{SecurityEvent, SecurityStats, WindowStats};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        security::generate_secret,
        security::verify,
        security::verify_backup,
        security::disable,
        security::dashboard
    ),
    components(schemas(
        security::AdminRequest,
        security::CodeRequest,
        security::EnrollmentResponse,
        security::VerifyResponse,
        security::DashboardResponse,
        SecurityEvent,
        SecurityStats,
        WindowStats
    )),
    tags(
        (name = "totp", description = "Second factor enrollment and verification"),
        (name = "dashboard", description = "Security monitoring"),
        (name = "health", description = "Service health")
    )
)]
struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}
