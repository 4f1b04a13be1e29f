//! Decides, per mutating request, whether to execute, replay, or reject.
//!
//! ```text
//! Start ─get/put meta─▶ MetaChecked ─get response─▶ Replaying
//!   │                       │
//!   └─▶ ConflictRejected    └─▶ Executing ─put response─▶ Completed
//! ```
//!
//! The meta claim goes through the store's insert-if-absent `put`, so the
//! first accepted body hash of a retry group wins regardless of arrival
//! order. Failed business operations are never cached; the meta record
//! stays, and a retry with the same body executes again.

use serde::Serialize;

use crate::canonical::{BodyHash, CanonicalBody, Canonicalize};
use crate::clock::{Clock, SystemClock};
use crate::fingerprint::{build_fingerprints, Fingerprint, MutationContext};
use crate::store::{DedupStore, PutOutcome, Record, StoredResponse};
use crate::{IdempotencyError, ReplayError, StoreError};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReplayPhase {
    Start,
    MetaChecked,
    ConflictRejected,
    Replaying,
    Executing,
    Completed,
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Executed,
    Replayed,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReplayOutcome {
    pub disposition: Disposition,
    pub response: StoredResponse,
}

impl ReplayOutcome {
    #[must_use]
    pub fn was_replayed(&self) -> bool {
        matches!(self.disposition, Disposition::Replayed)
    }
}

pub struct ReplayCoordinator<S, C = SystemClock> {
    store: S,
    clock: C,
}

impl<S: DedupStore> ReplayCoordinator<S, SystemClock> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: SystemClock,
        }
    }
}

impl<S: DedupStore, C: Clock> ReplayCoordinator<S, C> {
    pub fn with_clock(store: S, clock: C) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs `operation` at most once per accepted fingerprint.
    ///
    /// The operation receives the canonicalized body. Its 2xx responses are
    /// cached under the response fingerprint; other responses and errors are
    /// returned without caching.
    ///
    /// # Errors
    /// - [`IdempotencyError::MissingIdempotencyKey`] when the context has no key.
    /// - [`IdempotencyError::IdempotencyKeyReuse`] when the retry group already
    ///   accepted a different canonical body.
    /// - [`IdempotencyError::StoreUnavailable`] on any store failure; the
    ///   operation is never run as a fallback.
    /// - [`ReplayError::BusinessOperationFailed`] with the operation's own error.
    pub fn execute<T, E, F>(
        &self,
        context: &MutationContext<'_>,
        body: &T,
        operation: F,
    ) -> Result<ReplayOutcome, ReplayError<E>>
    where
        T: Canonicalize + Serialize,
        F: FnOnce(T) -> Result<StoredResponse, E>,
    {
        let canonical = CanonicalBody::of(body)?;
        let fingerprints = build_fingerprints(context, &canonical.hash)?;
        tracing::debug!(
            phase = ?ReplayPhase::Start,
            fingerprint = %fingerprints.meta,
            body_hash = %canonical.hash,
            "idempotent mutation received"
        );

        self.claim(&fingerprints.meta, &canonical.hash)?;
        tracing::debug!(
            phase = ?ReplayPhase::MetaChecked,
            fingerprint = %fingerprints.meta,
            "retry group accepted body hash"
        );

        if let Some(response) = self.cached_response(&fingerprints.response)? {
            tracing::info!(
                phase = ?ReplayPhase::Replaying,
                fingerprint = %fingerprints.response,
                status_code = response.status_code,
                "replaying cached response"
            );
            return Ok(ReplayOutcome {
                disposition: Disposition::Replayed,
                response,
            });
        }

        tracing::debug!(
            phase = ?ReplayPhase::Executing,
            fingerprint = %fingerprints.response,
            "executing business operation"
        );
        let response = operation(canonical.value).map_err(ReplayError::BusinessOperationFailed)?;

        if response.is_success() {
            self.cache_response(&fingerprints.response, &response)?;
        } else {
            tracing::debug!(
                fingerprint = %fingerprints.response,
                status_code = response.status_code,
                "non-success response is not cached"
            );
        }

        tracing::debug!(
            phase = ?ReplayPhase::Completed,
            fingerprint = %fingerprints.response,
            status_code = response.status_code,
            "business operation completed"
        );
        Ok(ReplayOutcome {
            disposition: Disposition::Executed,
            response,
        })
    }

    fn claim(&self, meta: &Fingerprint, body_hash: &BodyHash) -> Result<(), IdempotencyError> {
        let resident = match self.store.get(meta)? {
            Some(existing) => existing,
            None => {
                let record = Record::meta(body_hash.as_str(), self.clock.now());
                self.store.put(meta, &record)?.resident(record)
            }
        };

        let Some(accepted) = resident.accepted_body_hash() else {
            return Err(StoreError::Unavailable(format!(
                "record under meta fingerprint {meta} is not a meta record"
            ))
            .into());
        };

        if accepted != body_hash.as_str() {
            tracing::info!(
                phase = ?ReplayPhase::ConflictRejected,
                fingerprint = %meta,
                accepted_body_hash = accepted,
                body_hash = %body_hash,
                "idempotency key reused with a different payload"
            );
            return Err(IdempotencyError::IdempotencyKeyReuse);
        }

        Ok(())
    }

    fn cached_response(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<StoredResponse>, IdempotencyError> {
        Ok(self
            .store
            .get(fingerprint)?
            .filter(Record::is_success_response)
            .map(|record| record.to_response()))
    }

    fn cache_response(
        &self,
        fingerprint: &Fingerprint,
        response: &StoredResponse,
    ) -> Result<(), IdempotencyError> {
        let record = Record::response(response, self.clock.now());
        if let PutOutcome::AlreadyPresent(_) = self.store.put(fingerprint, &record)? {
            tracing::warn!(
                fingerprint = %fingerprint,
                "a concurrent retry cached its response first; keeping the earlier record"
            );
        }
        Ok(())
    }
}
