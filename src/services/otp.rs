use log::{error, info};
use mongodb::bson::{DateTime, oid::ObjectId};
use rand::Rng;
use rand::rngs::OsRng;
use rocket::fairing::AdHoc;
use std::sync::Arc;
use thiserror::Error;

use crate::db::DbConn;
use crate::db::otp_store::{MongoOtpStore, OtpStore, StoreError};
use crate::models::OtpRecord;
use crate::services::email::{SharedMailer, SmtpMailer};
use crate::utils::ApiError;

pub const OTP_EXPIRY_MINUTES: i64 = 5;
pub const RESEND_COOLDOWN_SECS: i64 = 60;
const MAX_GENERATION_ATTEMPTS: u32 = 10;

const OTP_SUBJECT: &str = "TDUAE Registration - Email Verification Code";

#[derive(Debug, Error)]
pub enum OtpError {
    #[error("no unique verification code found after {0} attempts")]
    GenerationExhausted(u32),
    #[error("a verification code was already sent less than a minute ago")]
    TooSoon,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<OtpError> for ApiError {
    fn from(err: OtpError) -> Self {
        match err {
            OtpError::GenerationExhausted(_) => {
                ApiError::internal_error("Could not issue a verification code. Please try again later.")
            }
            OtpError::TooSoon => ApiError::too_many_requests(
                "Please wait at least 1 minute before requesting a new code.",
            ),
            OtpError::Store(e) => ApiError::internal_error(format!("Database error: {}", e)),
        }
    }
}

/// Issues, validates, expires and resends short-lived 4-digit verification
/// codes, decoupled from what a verified code ultimately unlocks.
pub struct OtpService {
    store: Arc<dyn OtpStore>,
    mailer: SharedMailer,
}

impl OtpService {
    pub fn new(store: Arc<dyn OtpStore>, mailer: SharedMailer) -> Self {
        OtpService { store, mailer }
    }

    /// Mint a fresh code for the email, superseding any unused ones. The
    /// plaintext code is returned for delivery; it is a UX string sent by
    /// email, not a stored credential, so it is never hashed.
    pub async fn generate(&self, email: &str) -> Result<String, OtpError> {
        for _ in 0..MAX_GENERATION_ATTEMPTS {
            let code = random_code();
            if self.store.code_exists(&code).await? {
                continue;
            }

            let now = chrono::Utc::now();
            let record = OtpRecord {
                id: None,
                code: code.clone(),
                email: email.to_string(),
                created_at: DateTime::from_chrono(now),
                expires_at: DateTime::from_chrono(now + chrono::Duration::minutes(OTP_EXPIRY_MINUTES)),
                is_used: false,
                used_at: None,
                registration_data: None,
                member_id: None,
            };

            match self.store.supersede(email, record).await {
                Ok(()) => {
                    info!("Generated verification code for {}", email);
                    return Ok(code);
                }
                // Lost the insert race on the unique code index; try again.
                Err(StoreError::DuplicateCode) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(OtpError::GenerationExhausted(MAX_GENERATION_ATTEMPTS))
    }

    /// Single-use check-and-consume. A consumed code can never verify again,
    /// and concurrent calls for the same code cannot both succeed.
    pub async fn verify(&self, email: &str, code: &str) -> Result<bool, OtpError> {
        let consumed = self.store.consume(email, code, DateTime::now()).await?;
        if consumed {
            info!("Verification code accepted for {}", email);
        }
        Ok(consumed)
    }

    /// Non-consuming pre-check of the `verify` predicate.
    pub async fn is_valid(&self, email: &str, code: &str) -> Result<bool, OtpError> {
        Ok(self.store.is_valid(email, code, DateTime::now()).await?)
    }

    /// Whether the email currently has a valid (unused, unexpired) code.
    pub async fn has_pending(&self, email: &str) -> Result<bool, OtpError> {
        let now = DateTime::now();
        Ok(self
            .store
            .latest_unused(email)
            .await?
            .map(|r| r.is_valid_at(now))
            .unwrap_or(false))
    }

    /// Sweep expired-but-unused codes. The trigger lives outside this
    /// component (see the maintenance endpoint).
    pub async fn expire_stale(&self) -> Result<u64, OtpError> {
        let count = self.store.expire_stale(DateTime::now()).await?;
        if count > 0 {
            info!("Expired {} stale verification codes", count);
        }
        Ok(count)
    }

    /// Re-send the most recent unused code unchanged. Does not extend its
    /// expiry, so a resent code can still lapse mid-flight.
    pub async fn resend(&self, email: &str) -> Result<bool, OtpError> {
        let Some(record) = self.store.latest_unused(email).await? else {
            return Ok(false);
        };

        let cooldown_start = chrono::Utc::now() - chrono::Duration::seconds(RESEND_COOLDOWN_SECS);
        if record.created_at.to_chrono() > cooldown_start {
            return Err(OtpError::TooSoon);
        }

        self.send_code_email(email, &record.code).await;
        info!("Verification code resent to {}", email);
        Ok(true)
    }

    /// Stash the serialized registration on the currently pending attempt.
    /// Last-write-wins when two initiations race for the same email.
    pub async fn attach_payload(&self, email: &str, payload: &str) -> Result<bool, OtpError> {
        Ok(self.store.attach_payload(email, payload).await?)
    }

    /// The consumed record for a just-verified code, payload included.
    pub async fn find_registration(
        &self,
        email: &str,
        code: &str,
    ) -> Result<Option<OtpRecord>, OtpError> {
        Ok(self.store.find_used(email, code).await?)
    }

    pub async fn link_member(
        &self,
        email: &str,
        code: &str,
        member_id: ObjectId,
    ) -> Result<bool, OtpError> {
        Ok(self.store.link_member(email, code, member_id).await?)
    }

    /// Best-effort delivery of the code email. The record is already durable,
    /// so a failed send only means the caller should offer a manual resend.
    pub async fn send_code_email(&self, email: &str, code: &str) -> bool {
        self.mailer
            .send(email, OTP_SUBJECT, &otp_email_html(code))
            .await
    }
}

/// 4-digit code from the OS entropy source. A general-purpose PRNG would be
/// predictable enough to guess a live code.
fn random_code() -> String {
    let n: u16 = OsRng.gen_range(0..10_000);
    format!("{:04}", n)
}

fn otp_email_html(code: &str) -> String {
    format!(
        r#"
        <!DOCTYPE html>
        <html>
        <head>
            <meta charset='utf-8'>
            <meta name='viewport' content='width=device-width, initial-scale=1.0'>
            <title>Email Verification</title>
        </head>
        <body style='font-family: Arial, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;'>
            <div style='background: linear-gradient(135deg, #1e40af 0%, #3b82f6 100%); padding: 30px; text-align: center; border-radius: 10px 10px 0 0;'>
                <h1 style='color: white; margin: 0; font-size: 24px;'>Tanzania Diaspora UAE</h1>
                <p style='color: #e0f2fe; margin: 10px 0 0 0; font-size: 16px;'>Email Verification</p>
            </div>

            <div style='background: white; border: 1px solid #e5e7eb; border-radius: 0 0 10px 10px; padding: 30px;'>
                <h2 style='color: #1f2937; margin-top: 0;'>Verify Your Email Address</h2>

                <p style='font-size: 16px; margin-bottom: 20px;'>
                    Thank you for registering with the Tanzania Expatriates Association. To complete your registration, please use the verification code below:
                </p>

                <div style='background: #f8fafc; border: 2px solid #e2e8f0; border-radius: 8px; padding: 20px; text-align: center; margin: 20px 0;'>
                    <h1 style='color: #1e40af; font-size: 32px; margin: 0; letter-spacing: 5px; font-weight: bold;'>{}</h1>
                </div>

                <div style='background: #fef3c7; border: 1px solid #f59e0b; border-radius: 6px; padding: 15px; margin: 20px 0;'>
                    <p style='margin: 0; color: #92400e; font-weight: 500;'>
                        <strong>Important:</strong> This code will expire in <strong>5 minutes</strong> for security reasons.
                    </p>
                </div>

                <p style='font-size: 14px; color: #6b7280; margin-top: 20px;'>
                    If you didn't request this verification code, please ignore this email.
                </p>

                <div style='text-align: center; color: #6b7280; font-size: 12px;'>
                    <p style='margin: 5px 0;'>This is an automated message. Please do not reply.</p>
                </div>
            </div>
        </body>
        </html>
        "#,
        code
    )
}

/* ----------------------------- Fairing ----------------------------- */

pub fn init() -> AdHoc {
    AdHoc::on_ignite("OTP service", |rocket| async {
        let Some(db) = rocket.state::<DbConn>().cloned() else {
            error!("OTP service not started: database unavailable");
            return rocket;
        };

        let store = MongoOtpStore::new(&db);
        if let Err(e) = store.ensure_indexes().await {
            error!("Failed to create OTP indexes: {}", e);
        }

        let mailer: SharedMailer = Arc::new(SmtpMailer);
        rocket
            .manage(OtpService::new(Arc::new(store), mailer.clone()))
            .manage(mailer)
    })
}

/* ----------------------------- Tests ----------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::otp_store::MemoryOtpStore;
    use crate::services::email::Mailer;
    use chrono::Duration;

    #[derive(Default)]
    struct RecordingMailer {
        fail: bool,
        sent: tokio::sync::Mutex<Vec<(String, String, String)>>,
    }

    impl RecordingMailer {
        fn failing() -> Self {
            RecordingMailer {
                fail: true,
                ..Default::default()
            }
        }
    }

    #[rocket::async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, to: &str, subject: &str, html_body: &str) -> bool {
            self.sent.lock().await.push((
                to.to_string(),
                subject.to_string(),
                html_body.to_string(),
            ));
            !self.fail
        }
    }

    /// Store that loses the insert race a set number of times before
    /// behaving normally.
    struct CollidingStore {
        inner: MemoryOtpStore,
        collisions: std::sync::atomic::AtomicU32,
    }

    impl CollidingStore {
        fn new(collisions: u32) -> Self {
            CollidingStore {
                inner: MemoryOtpStore::default(),
                collisions: std::sync::atomic::AtomicU32::new(collisions),
            }
        }
    }

    #[rocket::async_trait]
    impl OtpStore for CollidingStore {
        async fn supersede(&self, email: &str, record: OtpRecord) -> Result<(), StoreError> {
            use std::sync::atomic::Ordering;
            if self.collisions.load(Ordering::SeqCst) > 0 {
                self.collisions.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::DuplicateCode);
            }
            self.inner.supersede(email, record).await
        }

        async fn code_exists(&self, code: &str) -> Result<bool, StoreError> {
            self.inner.code_exists(code).await
        }

        async fn consume(&self, email: &str, code: &str, now: DateTime) -> Result<bool, StoreError> {
            self.inner.consume(email, code, now).await
        }

        async fn is_valid(&self, email: &str, code: &str, now: DateTime) -> Result<bool, StoreError> {
            self.inner.is_valid(email, code, now).await
        }

        async fn latest_unused(&self, email: &str) -> Result<Option<OtpRecord>, StoreError> {
            self.inner.latest_unused(email).await
        }

        async fn attach_payload(&self, email: &str, payload: &str) -> Result<bool, StoreError> {
            self.inner.attach_payload(email, payload).await
        }

        async fn find_used(&self, email: &str, code: &str) -> Result<Option<OtpRecord>, StoreError> {
            self.inner.find_used(email, code).await
        }

        async fn link_member(
            &self,
            email: &str,
            code: &str,
            member_id: ObjectId,
        ) -> Result<bool, StoreError> {
            self.inner.link_member(email, code, member_id).await
        }

        async fn expire_stale(&self, now: DateTime) -> Result<u64, StoreError> {
            self.inner.expire_stale(now).await
        }
    }

    fn service() -> (OtpService, Arc<MemoryOtpStore>, Arc<RecordingMailer>) {
        let store = Arc::new(MemoryOtpStore::default());
        let mailer = Arc::new(RecordingMailer::default());
        let svc = OtpService::new(store.clone(), mailer.clone());
        (svc, store, mailer)
    }

    fn sample_record(email: &str, code: &str) -> OtpRecord {
        let now = chrono::Utc::now();
        OtpRecord {
            id: None,
            code: code.to_string(),
            email: email.to_string(),
            created_at: DateTime::from_chrono(now),
            expires_at: DateTime::from_chrono(now + Duration::minutes(OTP_EXPIRY_MINUTES)),
            is_used: false,
            used_at: None,
            registration_data: None,
            member_id: None,
        }
    }

    #[tokio::test]
    async fn generate_returns_four_digit_numeric_code() {
        let (svc, _, _) = service();
        let code = svc.generate("a@x.com").await.unwrap();
        assert_eq!(code.len(), 4);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn generate_supersedes_previous_codes() {
        let (svc, store, _) = service();
        let first = svc.generate("a@x.com").await.unwrap();
        let second = svc.generate("a@x.com").await.unwrap();

        let records = store.snapshot("a@x.com").await;
        assert_eq!(records.len(), 2);

        let unused: Vec<_> = records.iter().filter(|r| !r.is_used).collect();
        assert_eq!(unused.len(), 1);
        assert_eq!(unused[0].code, second);
        assert_ne!(first, second);

        // Superseded, not consumed: no used_at on the loser.
        let superseded = records.iter().find(|r| r.code == first).unwrap();
        assert!(superseded.is_used);
        assert!(superseded.used_at.is_none());
    }

    #[tokio::test]
    async fn generate_retries_after_losing_the_insert_race() {
        let store = Arc::new(CollidingStore::new(1));
        let svc = OtpService::new(store.clone(), Arc::new(RecordingMailer::default()));

        let code = svc.generate("a@x.com").await.unwrap();

        let records = store.inner.snapshot("a@x.com").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].code, code);
        assert!(!records[0].is_used);
    }

    #[tokio::test]
    async fn generate_gives_up_once_the_code_space_is_full() {
        let (svc, store, _) = service();
        for n in 0..10_000u16 {
            store
                .supersede("seed@x.com", sample_record("seed@x.com", &format!("{:04}", n)))
                .await
                .unwrap();
        }

        let err = svc.generate("fresh@x.com").await.unwrap_err();
        assert!(matches!(err, OtpError::GenerationExhausted(10)));
        assert!(store.snapshot("fresh@x.com").await.is_empty());
    }

    #[tokio::test]
    async fn verify_consumes_code_once() {
        let (svc, store, _) = service();
        let code = svc.generate("b@x.com").await.unwrap();

        assert!(svc.verify("b@x.com", &code).await.unwrap());
        assert!(!svc.verify("b@x.com", &code).await.unwrap());

        let records = store.snapshot("b@x.com").await;
        assert!(records[0].is_used);
        assert!(records[0].used_at.is_some());
    }

    #[tokio::test]
    async fn verify_rejects_wrong_pairing() {
        let (svc, _, _) = service();
        let code = svc.generate("a@x.com").await.unwrap();

        assert!(!svc.verify("other@x.com", &code).await.unwrap());
        // The failed attempt must not burn the code.
        assert!(svc.verify("a@x.com", &code).await.unwrap());
    }

    #[tokio::test]
    async fn expired_code_fails_verification() {
        let (svc, store, _) = service();
        let code = svc.generate("a@x.com").await.unwrap();

        store.rewind("a@x.com", Duration::minutes(6)).await;

        assert!(!svc.verify("a@x.com", &code).await.unwrap());
        // Failed verification leaves the record untouched.
        let records = store.snapshot("a@x.com").await;
        assert!(!records[0].is_used);
    }

    #[tokio::test]
    async fn is_valid_does_not_consume() {
        let (svc, _, _) = service();
        let code = svc.generate("a@x.com").await.unwrap();

        assert!(svc.is_valid("a@x.com", &code).await.unwrap());
        assert!(svc.is_valid("a@x.com", &code).await.unwrap());
        assert!(svc.verify("a@x.com", &code).await.unwrap());
        assert!(!svc.is_valid("a@x.com", &code).await.unwrap());
    }

    #[tokio::test]
    async fn has_pending_tracks_validity() {
        let (svc, store, _) = service();
        assert!(!svc.has_pending("a@x.com").await.unwrap());

        svc.generate("a@x.com").await.unwrap();
        assert!(svc.has_pending("a@x.com").await.unwrap());

        store.rewind("a@x.com", Duration::minutes(6)).await;
        assert!(!svc.has_pending("a@x.com").await.unwrap());
    }

    #[tokio::test]
    async fn expire_stale_marks_used_without_used_at() {
        let (svc, store, _) = service();
        svc.generate("a@x.com").await.unwrap();
        svc.generate("b@x.com").await.unwrap();

        store.rewind("a@x.com", Duration::minutes(6)).await;

        assert_eq!(svc.expire_stale().await.unwrap(), 1);
        let records = store.snapshot("a@x.com").await;
        assert!(records[0].is_used);
        assert!(records[0].used_at.is_none());

        // Still-valid codes are untouched, and the sweep is idempotent.
        assert!(svc.has_pending("b@x.com").await.unwrap());
        assert_eq!(svc.expire_stale().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn resend_within_cooldown_is_rejected() {
        let (svc, _, mailer) = service();
        svc.generate("a@x.com").await.unwrap();

        assert!(matches!(
            svc.resend("a@x.com").await,
            Err(OtpError::TooSoon)
        ));
        assert!(mailer.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn resend_after_cooldown_sends_same_code() {
        let (svc, store, mailer) = service();
        let code = svc.generate("a@x.com").await.unwrap();

        store.rewind("a@x.com", Duration::seconds(90)).await;
        let before = store.snapshot("a@x.com").await.remove(0);

        assert!(svc.resend("a@x.com").await.unwrap());

        let sent = mailer.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "a@x.com");
        assert!(sent[0].2.contains(&code));

        // Same code, same expiry: resend never re-mints or extends.
        let after = store.snapshot("a@x.com").await.remove(0);
        assert_eq!(after.code, before.code);
        assert_eq!(after.expires_at, before.expires_at);
    }

    #[tokio::test]
    async fn resend_without_pending_code_reports_nothing_to_do() {
        let (svc, _, mailer) = service();
        assert!(!svc.resend("a@x.com").await.unwrap());
        assert!(mailer.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn resend_of_expired_unused_code_still_goes_out() {
        // Observed behavior carried over: resend does not check expiry, so a
        // stale-but-unswept code is re-sent as-is and will fail verification.
        let (svc, store, mailer) = service();
        svc.generate("a@x.com").await.unwrap();

        store.rewind("a@x.com", Duration::minutes(6)).await;

        assert!(svc.resend("a@x.com").await.unwrap());
        assert_eq!(mailer.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn attach_payload_round_trips() {
        let (svc, store, _) = service();
        svc.generate("c@x.com").await.unwrap();

        assert!(
            svc.attach_payload("c@x.com", r#"{"firstName":"Sam"}"#)
                .await
                .unwrap()
        );

        let records = store.snapshot("c@x.com").await;
        assert_eq!(
            records[0].registration_data.as_deref(),
            Some(r#"{"firstName":"Sam"}"#)
        );
    }

    #[tokio::test]
    async fn attach_payload_without_pending_code_reports_false() {
        let (svc, _, _) = service();
        assert!(!svc.attach_payload("a@x.com", "{}").await.unwrap());
    }

    #[tokio::test]
    async fn attach_payload_to_consumed_code_reports_false() {
        let (svc, store, _) = service();
        let code = svc.generate("c@x.com").await.unwrap();
        assert!(svc.verify("c@x.com", &code).await.unwrap());

        assert!(!svc.attach_payload("c@x.com", "{}").await.unwrap());
        // Nothing lands on the consumed record either.
        let records = store.snapshot("c@x.com").await;
        assert!(records[0].registration_data.is_none());
    }

    #[tokio::test]
    async fn consumed_payload_readable_after_verification() {
        let (svc, _, _) = service();
        let code = svc.generate("c@x.com").await.unwrap();
        svc.attach_payload("c@x.com", r#"{"firstName":"Sam"}"#)
            .await
            .unwrap();

        assert!(svc.verify("c@x.com", &code).await.unwrap());

        let record = svc
            .find_registration("c@x.com", &code)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            record.registration_data.as_deref(),
            Some(r#"{"firstName":"Sam"}"#)
        );
    }

    #[tokio::test]
    async fn concurrent_verification_has_single_winner() {
        let (svc, _, _) = service();
        let code = svc.generate("a@x.com").await.unwrap();

        let (first, second) = tokio::join!(
            svc.verify("a@x.com", &code),
            svc.verify("a@x.com", &code)
        );
        let successes = [first.unwrap(), second.unwrap()]
            .iter()
            .filter(|&&ok| ok)
            .count();
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn store_rejects_duplicate_codes_globally() {
        let store = MemoryOtpStore::default();
        store
            .supersede("a@x.com", sample_record("a@x.com", "4821"))
            .await
            .unwrap();

        // Same code for a different email, even after the first is consumed.
        store.consume("a@x.com", "4821", DateTime::now()).await.unwrap();
        assert!(matches!(
            store
                .supersede("b@x.com", sample_record("b@x.com", "4821"))
                .await,
            Err(StoreError::DuplicateCode)
        ));
    }

    #[tokio::test]
    async fn failed_send_does_not_invalidate_the_code() {
        let store = Arc::new(MemoryOtpStore::default());
        let mailer = Arc::new(RecordingMailer::failing());
        let svc = OtpService::new(store.clone(), mailer.clone());

        let code = svc.generate("a@x.com").await.unwrap();
        assert!(!svc.send_code_email("a@x.com", &code).await);

        // Issuance is durable independent of transport.
        assert!(svc.verify("a@x.com", &code).await.unwrap());
    }

    #[tokio::test]
    async fn link_member_records_the_created_entity() {
        let (svc, store, _) = service();
        let code = svc.generate("a@x.com").await.unwrap();
        svc.verify("a@x.com", &code).await.unwrap();

        let member_id = ObjectId::new();
        assert!(svc.link_member("a@x.com", &code, member_id).await.unwrap());

        let records = store.snapshot("a@x.com").await;
        assert_eq!(records[0].member_id, Some(member_id));
    }
}
