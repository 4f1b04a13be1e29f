use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::fingerprint::Fingerprint;
use crate::{IdempotencyError, StoreError};

/// Status code sentinel of a meta record ("not a real response").
pub const META_STATUS_CODE: u16 = 0;
pub const META_CONTENT_TYPE: &str = "text/plain";

/// Response produced by a business operation, in the shape it is cached.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StoredResponse {
    pub status_code: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl StoredResponse {
    /// Serializes `value` as an `application/json` response.
    ///
    /// # Errors
    /// Returns the serializer error when `value` cannot be encoded.
    pub fn json<T: Serialize>(status_code: u16, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            status_code,
            content_type: "application/json".to_string(),
            body: serde_json::to_vec(value)?,
        })
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Record {
    pub status_code: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    pub created_at: OffsetDateTime,
}

impl Record {
    /// Meta record: remembers the first accepted body hash of a retry group.
    #[must_use]
    pub fn meta(accepted_body_hash: &str, created_at: OffsetDateTime) -> Self {
        Self {
            status_code: META_STATUS_CODE,
            content_type: META_CONTENT_TYPE.to_string(),
            body: accepted_body_hash.as_bytes().to_vec(),
            created_at,
        }
    }

    #[must_use]
    pub fn response(response: &StoredResponse, created_at: OffsetDateTime) -> Self {
        Self {
            status_code: response.status_code,
            content_type: response.content_type.clone(),
            body: response.body.clone(),
            created_at,
        }
    }

    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.status_code == META_STATUS_CODE
    }

    /// Body hash a meta record accepted; `None` for response records and
    /// non-UTF-8 bodies.
    #[must_use]
    pub fn accepted_body_hash(&self) -> Option<&str> {
        if !self.is_meta() {
            return None;
        }
        std::str::from_utf8(&self.body).ok()
    }

    #[must_use]
    pub fn is_success_response(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    #[must_use]
    pub fn to_response(&self) -> StoredResponse {
        StoredResponse {
            status_code: self.status_code,
            content_type: self.content_type.clone(),
            body: self.body.clone(),
        }
    }
}

/// Result of an insert-if-absent write.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PutOutcome {
    Inserted,
    /// Another writer got there first; carries the resident record, which
    /// was left untouched.
    AlreadyPresent(Record),
}

impl PutOutcome {
    /// The record now stored under the fingerprint.
    #[must_use]
    pub fn resident(self, attempted: Record) -> Record {
        match self {
            Self::Inserted => attempted,
            Self::AlreadyPresent(existing) => existing,
        }
    }
}

/// Dedup store port.
///
/// Records are write-once: `put` never overwrites and reports the resident
/// record instead, which makes the first claim of a fingerprint authoritative
/// across threads and processes sharing a backend.
pub trait DedupStore: Send + Sync {
    /// Looks up a record; `Ok(None)` for an unseen fingerprint.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] only on backend failure.
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Record>, StoreError>;

    /// Inserts `record` unless the fingerprint is already present.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] only on backend failure.
    fn put(&self, fingerprint: &Fingerprint, record: &Record) -> Result<PutOutcome, StoreError>;
}

impl<S: DedupStore + ?Sized> DedupStore for Arc<S> {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Record>, StoreError> {
        (**self).get(fingerprint)
    }

    fn put(&self, fingerprint: &Fingerprint, record: &Record) -> Result<PutOutcome, StoreError> {
        (**self).put(fingerprint, record)
    }
}

impl<S: DedupStore + ?Sized> DedupStore for &S {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Record>, StoreError> {
        (**self).get(fingerprint)
    }

    fn put(&self, fingerprint: &Fingerprint, record: &Record) -> Result<PutOutcome, StoreError> {
        (**self).put(fingerprint, record)
    }
}

/// Volatile backend: one mutex around the whole map.
#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    records: Mutex<BTreeMap<Fingerprint, Record>>,
}

impl MemoryDedupStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the lock is poisoned.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }

    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.lock()?.is_empty())
    }

    /// Drops every record created strictly before `cutoff`.
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] when the lock is poisoned.
    pub fn purge_created_before(&self, cutoff: OffsetDateTime) -> Result<usize, StoreError> {
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|_, record| record.created_at >= cutoff);
        Ok(before - records.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<Fingerprint, Record>>, StoreError> {
        self.records
            .lock()
            .map_err(|_| StoreError::Unavailable("memory dedup store lock poisoned".to_string()))
    }
}

impl DedupStore for MemoryDedupStore {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Record>, StoreError> {
        Ok(self.lock()?.get(fingerprint).cloned())
    }

    fn put(&self, fingerprint: &Fingerprint, record: &Record) -> Result<PutOutcome, StoreError> {
        let mut records = self.lock()?;
        if let Some(existing) = records.get(fingerprint) {
            return Ok(PutOutcome::AlreadyPresent(existing.clone()));
        }
        records.insert(fingerprint.clone(), record.clone());
        Ok(PutOutcome::Inserted)
    }
}

/// How long records are kept before a backend may purge them.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
}

impl RetentionPolicy {
    /// # Errors
    /// Returns [`IdempotencyError::Configuration`] unless `max_age` is positive.
    pub fn new(max_age: Duration) -> Result<Self, IdempotencyError> {
        if !max_age.is_positive() {
            return Err(IdempotencyError::Configuration(
                "retention max_age MUST be > 0".to_string(),
            ));
        }
        Ok(Self { max_age })
    }

    /// # Errors
    /// Returns [`IdempotencyError::Configuration`] for zero hours or an
    /// out-of-range value.
    pub fn from_hours(hours: u64) -> Result<Self, IdempotencyError> {
        let hours = i64::try_from(hours).map_err(|_| {
            IdempotencyError::Configuration(format!("retention of {hours} hours is out of range"))
        })?;
        let max_age = hours
            .checked_mul(3600)
            .map(Duration::seconds)
            .ok_or_else(|| {
                IdempotencyError::Configuration(format!(
                    "retention of {hours} hours is out of range"
                ))
            })?;
        Self::new(max_age)
    }

    /// Records created before the returned instant are expired at `now`.
    #[must_use]
    pub fn cutoff(&self, now: OffsetDateTime) -> OffsetDateTime {
        now.checked_sub(self.max_age)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::HttpMethod;
    use crate::parse_rfc3339_utc;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fingerprint(key: &str, body_hash: &str) -> Fingerprint {
        Fingerprint {
            idempotency_key: key.to_string(),
            caller: "user-1".to_string(),
            method: HttpMethod::Patch,
            route: "/members/me".to_string(),
            body_hash: body_hash.to_string(),
        }
    }

    fn at(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    #[test]
    fn memory_store_runs_shared_contract() {
        crate::contract::run_all(MemoryDedupStore::new);
    }

    #[test]
    fn meta_record_exposes_accepted_hash() {
        let record = Record::meta("abc", at("2026-02-07T12:00:00Z"));
        assert!(record.is_meta());
        assert!(!record.is_success_response());
        assert_eq!(record.accepted_body_hash(), Some("abc"));
        assert_eq!(record.content_type, META_CONTENT_TYPE);
    }

    #[test]
    fn response_record_has_no_accepted_hash() {
        let response = StoredResponse {
            status_code: 200,
            content_type: "application/json".to_string(),
            body: b"{}".to_vec(),
        };
        let record = Record::response(&response, at("2026-02-07T12:00:00Z"));
        assert!(record.is_success_response());
        assert_eq!(record.accepted_body_hash(), None);
        assert_eq!(record.to_response(), response);
    }

    #[test]
    fn purge_drops_only_records_older_than_cutoff() {
        let store = MemoryDedupStore::new();
        let old = Record::meta("a", at("2026-01-01T00:00:00Z"));
        let fresh = Record::meta("b", at("2026-02-01T00:00:00Z"));
        must_ok(store.put(&fingerprint("old", ""), &old));
        must_ok(store.put(&fingerprint("fresh", ""), &fresh));

        let purged = must_ok(store.purge_created_before(at("2026-01-15T00:00:00Z")));
        assert_eq!(purged, 1);
        assert_eq!(must_ok(store.get(&fingerprint("old", ""))), None);
        assert_eq!(must_ok(store.get(&fingerprint("fresh", ""))), Some(fresh));
    }

    #[test]
    fn retention_policy_rejects_zero_and_computes_cutoff() {
        assert!(matches!(
            RetentionPolicy::from_hours(0),
            Err(IdempotencyError::Configuration(_))
        ));

        let policy = must_ok(RetentionPolicy::from_hours(24));
        assert_eq!(
            policy.cutoff(at("2026-02-07T12:00:00Z")),
            at("2026-02-06T12:00:00Z")
        );
    }
}
