use mongodb::bson::{DateTime, oid::ObjectId};
use rocket_okapi::okapi::schemars;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NidaServiceStatus {
    None,
    PendingPayment,
    Paid,
    AppointmentScheduled,
    Completed,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Member {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<ObjectId>,
    /// Human-readable member number: TAE-{YYYY}-{NNNN}
    pub member_number: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub date_of_birth: Option<DateTime>,
    pub gender: String,
    pub nationality: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub emirate: String,
    pub city: String,
    pub passport_number: Option<String>,
    pub emirates_id: Option<String>,
    pub visa_type: String,
    pub employment_status: Option<String>,
    pub company_name: Option<String>,
    pub knows_association: bool,
    pub advice: Option<String>,
    pub opt_in_nida_service: bool,
    pub nida_status: NidaServiceStatus,
    pub created_at: DateTime,
}

/// Registration form submitted at initiation. Serialized onto the OTP record
/// and only turned into a `Member` after the email is verified.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RegisterDto {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    /// YYYY-MM-DD
    pub date_of_birth: Option<String>,
    pub gender: String,
    pub nationality: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub emirate: String,
    pub city: String,
    pub passport_number: Option<String>,
    pub emirates_id: Option<String>,
    pub visa_type: String,
    pub employment_status: Option<String>,
    pub company_name: Option<String>,
    #[serde(default)]
    pub knows_association: bool,
    pub advice: Option<String>,
    #[serde(default)]
    pub opt_in_nida_service: bool,
}

/// Payload stashed on the OTP record between initiation and verification.
#[derive(Debug, Serialize, Deserialize)]
pub struct PendingRegistration {
    pub member_number: String,
    #[serde(flatten)]
    pub form: RegisterDto,
}
