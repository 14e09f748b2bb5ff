use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::openapi;

use crate::guards::MaintenanceKey;
use crate::services::otp::OtpService;
use crate::utils::{ApiError, ApiResponse};

/// Sweep expired-but-unused verification codes. Meant to be hit periodically
/// by an external scheduler (cron, systemd timer); the component itself owns
/// no timer.
#[openapi(tag = "Maintenance")]
#[post("/maintenance/expire-otps")]
pub async fn expire_otps(
    _key: MaintenanceKey,
    otp: &State<OtpService>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let expired = otp.expire_stale().await?;
    Ok(Json(ApiResponse::success(
        serde_json::json!({ "expired": expired }),
    )))
}
