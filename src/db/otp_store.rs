use log::info;
use mongodb::bson::{DateTime, doc, oid::ObjectId};
use mongodb::options::{FindOneOptions, IndexOptions};
use mongodb::{Collection, Database, IndexModel};
use thiserror::Error;

use crate::models::OtpRecord;

const COLLECTION: &str = "otp_verifications";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The code value already exists, across all records ever created.
    #[error("verification code already exists")]
    DuplicateCode,
    #[error(transparent)]
    Database(#[from] mongodb::error::Error),
}

/// Persistence boundary for OTP records.
///
/// `consume` must be an atomic conditional update: of any number of
/// concurrent calls for the same valid (email, code) pair, exactly one may
/// observe success. `supersede` invalidates every unused record for the email
/// and inserts the replacement as one operation.
#[rocket::async_trait]
pub trait OtpStore: Send + Sync {
    async fn supersede(&self, email: &str, record: OtpRecord) -> Result<(), StoreError>;

    async fn code_exists(&self, code: &str) -> Result<bool, StoreError>;

    /// Check-and-consume. Returns true iff exactly one matching valid record
    /// was marked used (with `used_at` set).
    async fn consume(&self, email: &str, code: &str, now: DateTime) -> Result<bool, StoreError>;

    /// Read-only form of the `consume` predicate.
    async fn is_valid(&self, email: &str, code: &str, now: DateTime) -> Result<bool, StoreError>;

    /// Most recently created unused record for the email, expired or not.
    async fn latest_unused(&self, email: &str) -> Result<Option<OtpRecord>, StoreError>;

    /// Overwrite the payload on the most recent unused record.
    /// Last-write-wins; returns false when no unused record exists.
    async fn attach_payload(&self, email: &str, payload: &str) -> Result<bool, StoreError>;

    /// Look up an already-consumed record, e.g. to read its payload back
    /// right after verification.
    async fn find_used(&self, email: &str, code: &str) -> Result<Option<OtpRecord>, StoreError>;

    async fn link_member(
        &self,
        email: &str,
        code: &str,
        member_id: ObjectId,
    ) -> Result<bool, StoreError>;

    /// Mark every expired-but-unused record as used, leaving `used_at` empty
    /// so the audit trail can tell "expired" from "consumed". Returns the
    /// number of records affected.
    async fn expire_stale(&self, now: DateTime) -> Result<u64, StoreError>;
}

/* ----------------------------- MongoDB ----------------------------- */

pub struct MongoOtpStore {
    collection: Collection<OtpRecord>,
}

impl MongoOtpStore {
    pub fn new(db: &Database) -> Self {
        MongoOtpStore {
            collection: db.collection::<OtpRecord>(COLLECTION),
        }
    }

    /// Unique index on `code`. Closes the check-then-insert window: a losing
    /// concurrent inserter gets a duplicate-key error and retries.
    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let model = IndexModel::builder()
            .keys(doc! { "code": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.collection.create_index(model, None).await?;
        info!("Unique index on otp_verifications.code ensured");
        Ok(())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == 11000
    )
}

#[rocket::async_trait]
impl OtpStore for MongoOtpStore {
    async fn supersede(&self, email: &str, record: OtpRecord) -> Result<(), StoreError> {
        // Idempotent bulk invalidation, then insert. Multi-document
        // transactions need a replica set; the unique index on `code` covers
        // the remaining race.
        self.collection
            .update_many(
                doc! { "email": email, "is_used": false },
                doc! { "$set": { "is_used": true } },
                None,
            )
            .await?;

        if let Err(e) = self.collection.insert_one(&record, None).await {
            if is_duplicate_key(&e) {
                return Err(StoreError::DuplicateCode);
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn code_exists(&self, code: &str) -> Result<bool, StoreError> {
        let count = self
            .collection
            .count_documents(doc! { "code": code }, None)
            .await?;
        Ok(count > 0)
    }

    async fn consume(&self, email: &str, code: &str, now: DateTime) -> Result<bool, StoreError> {
        let result = self
            .collection
            .update_one(
                doc! {
                    "email": email,
                    "code": code,
                    "is_used": false,
                    "expires_at": { "$gt": now },
                },
                doc! { "$set": { "is_used": true, "used_at": now } },
                None,
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn is_valid(&self, email: &str, code: &str, now: DateTime) -> Result<bool, StoreError> {
        let record = self
            .collection
            .find_one(
                doc! {
                    "email": email,
                    "code": code,
                    "is_used": false,
                    "expires_at": { "$gt": now },
                },
                None,
            )
            .await?;
        Ok(record.is_some())
    }

    async fn latest_unused(&self, email: &str) -> Result<Option<OtpRecord>, StoreError> {
        let options = FindOneOptions::builder()
            .sort(doc! { "created_at": -1 })
            .build();
        let record = self
            .collection
            .find_one(doc! { "email": email, "is_used": false }, options)
            .await?;
        Ok(record)
    }

    async fn attach_payload(&self, email: &str, payload: &str) -> Result<bool, StoreError> {
        let Some(record) = self.latest_unused(email).await? else {
            return Ok(false);
        };
        let result = self
            .collection
            .update_one(
                doc! { "_id": record.id },
                doc! { "$set": { "registration_data": payload } },
                None,
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn find_used(&self, email: &str, code: &str) -> Result<Option<OtpRecord>, StoreError> {
        let record = self
            .collection
            .find_one(doc! { "email": email, "code": code, "is_used": true }, None)
            .await?;
        Ok(record)
    }

    async fn link_member(
        &self,
        email: &str,
        code: &str,
        member_id: ObjectId,
    ) -> Result<bool, StoreError> {
        let result = self
            .collection
            .update_one(
                doc! { "email": email, "code": code },
                doc! { "$set": { "member_id": member_id } },
                None,
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn expire_stale(&self, now: DateTime) -> Result<u64, StoreError> {
        let result = self
            .collection
            .update_many(
                doc! { "expires_at": { "$lte": now }, "is_used": false },
                doc! { "$set": { "is_used": true } },
                None,
            )
            .await?;
        Ok(result.modified_count)
    }
}

/* ----------------------------- In-memory ----------------------------- */

/// Same contract as the Mongo store over a mutex-guarded vector, used by the
/// unit tests. `supersede` and `consume` run under a single lock, so the
/// atomicity requirements hold trivially.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryOtpStore {
    records: tokio::sync::Mutex<Vec<OtpRecord>>,
}

#[cfg(test)]
impl MemoryOtpStore {
    /// Shift every record for the email into the past, simulating elapsed
    /// wall-clock time.
    pub async fn rewind(&self, email: &str, by: chrono::Duration) {
        let mut records = self.records.lock().await;
        for record in records.iter_mut().filter(|r| r.email == email) {
            record.created_at = DateTime::from_chrono(record.created_at.to_chrono() - by);
            record.expires_at = DateTime::from_chrono(record.expires_at.to_chrono() - by);
        }
    }

    pub async fn snapshot(&self, email: &str) -> Vec<OtpRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.email == email)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[rocket::async_trait]
impl OtpStore for MemoryOtpStore {
    async fn supersede(&self, email: &str, mut record: OtpRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.code == record.code) {
            return Err(StoreError::DuplicateCode);
        }
        for existing in records.iter_mut().filter(|r| r.email == email && !r.is_used) {
            existing.is_used = true;
        }
        record.id = Some(ObjectId::new());
        records.push(record);
        Ok(())
    }

    async fn code_exists(&self, code: &str) -> Result<bool, StoreError> {
        Ok(self.records.lock().await.iter().any(|r| r.code == code))
    }

    async fn consume(&self, email: &str, code: &str, now: DateTime) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        match records
            .iter_mut()
            .find(|r| r.email == email && r.code == code && r.is_valid_at(now))
        {
            Some(record) => {
                record.is_used = true;
                record.used_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn is_valid(&self, email: &str, code: &str, now: DateTime) -> Result<bool, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .any(|r| r.email == email && r.code == code && r.is_valid_at(now)))
    }

    async fn latest_unused(&self, email: &str) -> Result<Option<OtpRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .filter(|r| r.email == email && !r.is_used)
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn attach_payload(&self, email: &str, payload: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        match records
            .iter_mut()
            .filter(|r| r.email == email && !r.is_used)
            .max_by_key(|r| r.created_at)
        {
            Some(record) => {
                record.registration_data = Some(payload.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_used(&self, email: &str, code: &str) -> Result<Option<OtpRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .find(|r| r.email == email && r.code == code && r.is_used)
            .cloned())
    }

    async fn link_member(
        &self,
        email: &str,
        code: &str,
        member_id: ObjectId,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.lock().await;
        match records
            .iter_mut()
            .find(|r| r.email == email && r.code == code)
        {
            Some(record) => {
                record.member_id = Some(member_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expire_stale(&self, now: DateTime) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let mut count = 0;
        for record in records
            .iter_mut()
            .filter(|r| !r.is_used && r.expires_at <= now)
        {
            record.is_used = true;
            count += 1;
        }
        Ok(count)
    }
}
