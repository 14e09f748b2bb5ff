use log::warn;
use mongodb::bson::{DateTime, doc};
use rocket::State;
use rocket::serde::json::Json;
use rocket_okapi::openapi;

use crate::db::DbConn;
use crate::models::{
    Member, NidaServiceStatus, PendingRegistration, RegisterDto, ResendOtpDto, VerifyOtpDto,
};
use crate::services::email::{SharedMailer, WELCOME_SUBJECT, welcome_email_html};
use crate::services::otp::{OTP_EXPIRY_MINUTES, OtpService};
use crate::utils::{ApiError, ApiResponse, parse_date_of_birth, validate_email, validate_phone};

const MEMBER_NUMBER_ATTEMPTS: u32 = 10;

fn validate_registration(form: &RegisterDto) -> Result<(), ApiError> {
    let required = [
        ("first name", &form.first_name),
        ("last name", &form.last_name),
        ("gender", &form.gender),
        ("nationality", &form.nationality),
        ("address", &form.address),
        ("emirate", &form.emirate),
        ("city", &form.city),
        ("visa type", &form.visa_type),
    ];
    for (label, value) in required {
        if value.trim().is_empty() {
            return Err(ApiError::bad_request(format!("Missing {}", label)));
        }
    }
    if !validate_email(&form.email) {
        return Err(ApiError::bad_request("Invalid email address"));
    }
    if !validate_phone(&form.phone) {
        return Err(ApiError::bad_request("Invalid phone number"));
    }
    if let Some(dob) = &form.date_of_birth {
        if parse_date_of_birth(dob).is_none() {
            return Err(ApiError::bad_request(
                "Invalid date of birth. Use YYYY-MM-DD",
            ));
        }
    }
    Ok(())
}

/// Member numbers look like TAE-2025-4821; random suffix, uniqueness checked
/// against the collection with a bounded retry.
async fn generate_member_number(db: &DbConn) -> Result<String, ApiError> {
    let year = chrono::Utc::now().format("%Y");
    let members = db.collection::<Member>("members");

    for _ in 0..MEMBER_NUMBER_ATTEMPTS {
        let suffix: u32 = {
            use rand::Rng;
            rand::thread_rng().gen_range(1000..10000)
        };
        let candidate = format!("TAE-{}-{}", year, suffix);

        let taken = members
            .count_documents(doc! { "member_number": &candidate }, None)
            .await
            .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?;
        if taken == 0 {
            return Ok(candidate);
        }
    }

    Err(ApiError::internal_error(
        "Could not allocate a member number. Please try again later.",
    ))
}

/// --------------------
/// Initiate registration
/// --------------------
#[openapi(tag = "Registration")]
#[post("/register/initiate", data = "<dto>")]
pub async fn initiate_registration(
    db: &State<DbConn>,
    otp: &State<OtpService>,
    dto: Json<RegisterDto>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let mut form = dto.into_inner();
    form.email = form.email.trim().to_lowercase();
    validate_registration(&form)?;

    let email = form.email.clone();

    let existing = db
        .collection::<Member>("members")
        .find_one(doc! { "email": &email }, None)
        .await
        .map_err(|e| ApiError::internal_error(format!("Database error: {}", e)))?;
    if existing.is_some() {
        return Err(ApiError::bad_request(
            "This email address is already registered",
        ));
    }

    let member_number = generate_member_number(db).await?;
    let code = otp.generate(&email).await?;

    let pending = PendingRegistration {
        member_number,
        form,
    };
    let payload = serde_json::to_string(&pending)
        .map_err(|e| ApiError::internal_error(format!("Failed to stash registration: {}", e)))?;
    if !otp.attach_payload(&email, &payload).await? {
        // A concurrent initiate superseded the code we just minted; without
        // the stashed form the eventual verify cannot create a member.
        warn!("Registration details for {} were not stored", email);
        return Err(ApiError::internal_error(
            "Could not store registration details. Please try again.",
        ));
    }

    // The code is durable at this point; a failed send only means the client
    // should offer the resend button.
    let email_sent = otp.send_code_email(&email, &code).await;
    if !email_sent {
        warn!("Verification email to {} did not go out", email);
    }

    Ok(Json(ApiResponse::success_with_message(
        "Verification code sent".to_string(),
        serde_json::json!({
            "email": email,
            "expires_in_minutes": OTP_EXPIRY_MINUTES,
            "email_sent": email_sent,
        }),
    )))
}

/// --------------------
/// Verify code, create member
/// --------------------
#[openapi(tag = "Registration")]
#[post("/register/verify", data = "<dto>")]
pub async fn verify_registration(
    db: &State<DbConn>,
    otp: &State<OtpService>,
    mailer: &State<SharedMailer>,
    dto: Json<VerifyOtpDto>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let email = dto.email.trim().to_lowercase();
    let code = dto.code.trim();

    if code.len() != 4 || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(ApiError::bad_request(
            "Please enter a valid 4-digit verification code",
        ));
    }

    if !otp.verify(&email, code).await? {
        return Err(ApiError::bad_request("Invalid or expired verification code"));
    }

    let record = otp
        .find_registration(&email, code)
        .await?
        .ok_or_else(|| ApiError::internal_error("Verification record missing"))?;
    let payload = record.registration_data.ok_or_else(|| {
        ApiError::bad_request("No registration data found. Please register again.")
    })?;
    let pending: PendingRegistration = serde_json::from_str(&payload)
        .map_err(|e| ApiError::internal_error(format!("Corrupt registration payload: {}", e)))?;

    let form = pending.form;
    let date_of_birth = form
        .date_of_birth
        .as_deref()
        .and_then(parse_date_of_birth)
        .map(|d| DateTime::from_millis(d.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis()));

    let member = Member {
        id: None,
        member_number: pending.member_number.clone(),
        first_name: form.first_name.clone(),
        middle_name: form.middle_name,
        last_name: form.last_name,
        date_of_birth,
        gender: form.gender,
        nationality: form.nationality,
        email: email.clone(),
        phone: form.phone,
        address: form.address,
        emirate: form.emirate,
        city: form.city,
        passport_number: form.passport_number,
        emirates_id: form.emirates_id,
        visa_type: form.visa_type,
        employment_status: form.employment_status,
        company_name: form.company_name,
        knows_association: form.knows_association,
        advice: form.advice,
        opt_in_nida_service: form.opt_in_nida_service,
        nida_status: if form.opt_in_nida_service {
            NidaServiceStatus::PendingPayment
        } else {
            NidaServiceStatus::None
        },
        created_at: DateTime::now(),
    };

    let result = db
        .collection::<Member>("members")
        .insert_one(&member, None)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to create member: {}", e)))?;

    if let Some(member_id) = result.inserted_id.as_object_id() {
        otp.link_member(&email, code, member_id).await.ok();
    }

    mailer
        .send(
            &email,
            WELCOME_SUBJECT,
            &welcome_email_html(&member.first_name, &member.member_number),
        )
        .await;

    Ok(Json(ApiResponse::success_with_message(
        "Registration completed".to_string(),
        serde_json::json!({
            "member_number": pending.member_number,
        }),
    )))
}

/// --------------------
/// Resend code
/// --------------------
#[openapi(tag = "Registration")]
#[post("/register/resend", data = "<dto>")]
pub async fn resend_code(
    otp: &State<OtpService>,
    dto: Json<ResendOtpDto>,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let email = dto.email.trim().to_lowercase();

    if otp.resend(&email).await? {
        Ok(Json(ApiResponse::success_with_message(
            "Verification code resent".to_string(),
            serde_json::json!({ "email": email }),
        )))
    } else {
        Err(ApiError::not_found(
            "No pending verification found for this email",
        ))
    }
}

/// --------------------
/// Non-consuming pre-checks
/// --------------------
#[openapi(tag = "Registration")]
#[get("/register/check?<email>&<code>")]
pub async fn check_code(
    otp: &State<OtpService>,
    email: String,
    code: String,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let valid = otp.is_valid(&email.trim().to_lowercase(), code.trim()).await?;
    Ok(Json(ApiResponse::success(
        serde_json::json!({ "valid": valid }),
    )))
}

#[openapi(tag = "Registration")]
#[get("/register/pending?<email>")]
pub async fn pending_verification(
    otp: &State<OtpService>,
    email: String,
) -> Result<Json<ApiResponse<serde_json::Value>>, ApiError> {
    let pending = otp.has_pending(&email.trim().to_lowercase()).await?;
    Ok(Json(ApiResponse::success(
        serde_json::json!({ "pending": pending }),
    )))
}
