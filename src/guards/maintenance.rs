use rocket::http::Status;
use rocket::request::{self, FromRequest, Outcome, Request};

// === OpenAPI (compatible with rocket_okapi 0.8.0 / 0.8.1) ===
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::request::{OpenApiFromRequest, RequestHeaderInput};

/// Shared-secret guard for the maintenance endpoints (e.g. the stale-OTP
/// sweep, which an external scheduler is expected to trigger).
///
/// Answers 503 when no key is configured, 401 on a missing or wrong header.
pub struct MaintenanceKey;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for MaintenanceKey {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let Some(expected) = crate::config::Config::maintenance_key() else {
            return Outcome::Error((Status::ServiceUnavailable, ()));
        };

        match req.headers().get_one("X-Maintenance-Key") {
            Some(key) if key == expected => Outcome::Success(MaintenanceKey),
            _ => Outcome::Error((Status::Unauthorized, ())),
        }
    }
}

/// === OpenAPI Integration (Fallback for older versions) ===
impl<'a> OpenApiFromRequest<'a> for MaintenanceKey {
    fn from_request_input(
        _gen: &mut OpenApiGenerator,
        _name: String,
        _required: bool,
    ) -> rocket_okapi::Result<RequestHeaderInput> {
        // The guard doesn't contribute any special header/parameter for docs
        Ok(RequestHeaderInput::None)
    }
}
