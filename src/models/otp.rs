use mongodb::bson::{DateTime, oid::ObjectId};
use rocket_okapi::okapi::schemars;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One issued email verification attempt.
///
/// Records are never deleted: consumed and expired codes stay behind as an
/// audit trail. A record consumed by verification carries `used_at`; a record
/// reclaimed by the expiry sweep (or superseded by a newer code) is marked
/// used with `used_at` left empty.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OtpRecord {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    /// 4-digit numeric code, unique across all records ever created.
    pub code: String,
    pub email: String,
    pub created_at: DateTime,
    pub expires_at: DateTime,
    pub is_used: bool,
    pub used_at: Option<DateTime>,
    /// Serialized pending registration, attached after the code is minted and
    /// materialized into a member only once the email is verified.
    pub registration_data: Option<String>,
    /// Set after the associated member record exists.
    pub member_id: Option<ObjectId>,
}

impl OtpRecord {
    pub fn is_valid_at(&self, now: DateTime) -> bool {
        !self.is_used && now < self.expires_at
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct VerifyOtpDto {
    pub email: String,
    pub code: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ResendOtpDto {
    pub email: String,
}
