//! Idempotent execution of partial-update requests.
//!
//! A client retries a mutation with the same idempotency key; the
//! [`ReplayCoordinator`] runs the business operation at most once per
//! canonical body, replays the cached response on later retries, and rejects
//! a key reused with a different body.

use time::{OffsetDateTime, UtcOffset};

pub mod canonical;
pub mod clock;
#[cfg(any(test, feature = "contract-suite"))]
pub mod contract;
pub mod coordinator;
pub mod fingerprint;
pub mod profile;
pub mod store;
pub mod tristate;

pub use canonical::{normalize_email, normalize_human_name, BodyHash, CanonicalBody, Canonicalize};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{Disposition, ReplayCoordinator, ReplayOutcome, ReplayPhase};
pub use fingerprint::{
    build_fingerprints, Fingerprint, FingerprintPair, HttpMethod, MutationContext, META_BODY_HASH,
};
pub use profile::{
    MemberProfile, ProfileError, UpdateMemberProfileRequest, VehicleProfile, VehicleProfilePatch,
    UPDATE_MEMBER_PROFILE_ROUTE,
};
pub use store::{
    DedupStore, MemoryDedupStore, PutOutcome, Record, RetentionPolicy, StoredResponse,
    META_CONTENT_TYPE, META_STATUS_CODE,
};
pub use tristate::{NotPresentError, PatchError, TriState};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("dedup store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "STORE_UNAVAILABLE",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdempotencyError {
    #[error("Idempotency-Key is required for {method} {route}")]
    MissingIdempotencyKey { method: HttpMethod, route: String },
    #[error("idempotency key was already used with a different request body")]
    IdempotencyKeyReuse,
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
    #[error("canonicalization error: {0}")]
    Canonicalization(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl IdempotencyError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingIdempotencyKey { .. } => "MISSING_IDEMPOTENCY_KEY",
            Self::IdempotencyKeyReuse => "IDEMPOTENCY_KEY_REUSE",
            Self::StoreUnavailable(inner) => inner.code(),
            Self::Canonicalization(_) => "CANONICALIZATION_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }
}

/// Result error of [`ReplayCoordinator::execute`]: either the pipeline refused
/// the request or the business operation itself failed.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError<E> {
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    #[error("business operation failed: {0}")]
    BusinessOperationFailed(E),
}

impl<E> ReplayError<E> {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Idempotency(inner) => inner.code(),
            Self::BusinessOperationFailed(_) => "BUSINESS_OPERATION_FAILED",
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Idempotency(IdempotencyError::IdempotencyKeyReuse))
    }
}

/// Parses an RFC3339 timestamp that must carry the `Z` offset.
///
/// # Errors
/// Returns [`IdempotencyError::Validation`] for malformed or non-UTC input.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, IdempotencyError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| IdempotencyError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(IdempotencyError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// # Errors
/// Returns [`IdempotencyError::Validation`] if the timestamp cannot be formatted.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, IdempotencyError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            IdempotencyError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
