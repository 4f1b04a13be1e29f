use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::IdempotencyError;

/// Rewrites a request body into its normalized form.
///
/// Implementations must be idempotent: canonicalizing an already canonical
/// body returns an equal value. Only `Present` values are rewritten;
/// `Unspecified` and explicit `null` pass through untouched.
pub trait Canonicalize {
    #[must_use]
    fn canonicalize(&self) -> Self;
}

/// Hex-encoded SHA-256 of a canonical body.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct BodyHash(String);

impl BodyHash {
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BodyHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalBody<T> {
    pub value: T,
    pub bytes: Vec<u8>,
    pub hash: BodyHash,
}

impl<T> CanonicalBody<T>
where
    T: Canonicalize + Serialize,
{
    /// Canonicalizes `body` and serializes it with struct-declared field order.
    ///
    /// # Errors
    /// Returns [`IdempotencyError::Canonicalization`] when serialization fails.
    pub fn of(body: &T) -> Result<Self, IdempotencyError> {
        let value = body.canonicalize();
        let bytes = serde_json::to_vec(&value).map_err(|err| {
            IdempotencyError::Canonicalization(format!("failed to serialize body: {err}"))
        })?;
        let hash = BodyHash::of_bytes(&bytes);
        Ok(Self { value, bytes, hash })
    }
}

/// Trims a human name and collapses every internal whitespace run to one space.
#[must_use]
pub fn normalize_human_name(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[must_use]
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_string()
}
