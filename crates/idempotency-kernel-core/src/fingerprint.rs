use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::canonical::BodyHash;
use crate::IdempotencyError;

/// Body hash sentinel carried by meta fingerprints.
pub const META_BODY_HASH: &str = "";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl Display for HttpMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index of the dedup store.
///
/// `(idempotency_key, caller, method, route)` scopes a retry group; the
/// `body_hash` is empty for the meta entry and the canonical digest for the
/// cached response entry.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Fingerprint {
    pub idempotency_key: String,
    pub caller: String,
    pub method: HttpMethod,
    pub route: String,
    pub body_hash: String,
}

impl Fingerprint {
    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.body_hash == META_BODY_HASH
    }

    #[must_use]
    pub fn with_body_hash(&self, body_hash: &BodyHash) -> Self {
        Self {
            body_hash: body_hash.as_str().to_string(),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn same_retry_group(&self, other: &Self) -> bool {
        self.idempotency_key == other.idempotency_key
            && self.caller == other.caller
            && self.method == other.method
            && self.route == other.route
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} key={} caller={}",
            self.method, self.route, self.idempotency_key, self.caller
        )?;
        if !self.is_meta() {
            write!(f, " body={}", self.body_hash)?;
        }
        Ok(())
    }
}

/// Request context supplied by the transport and auth layers.
///
/// `route` is the route template (`/members/me`, `/trips/{tripId}`), never the
/// interpolated path.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MutationContext<'a> {
    pub idempotency_key: Option<&'a str>,
    pub caller: &'a str,
    pub method: HttpMethod,
    pub route: &'a str,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FingerprintPair {
    pub meta: Fingerprint,
    pub response: Fingerprint,
}

/// Derives the meta and response fingerprints for one logical request.
///
/// # Errors
/// Returns [`IdempotencyError::MissingIdempotencyKey`] when the key is absent
/// or blank.
pub fn build_fingerprints(
    context: &MutationContext<'_>,
    body_hash: &BodyHash,
) -> Result<FingerprintPair, IdempotencyError> {
    let key = match context.idempotency_key {
        Some(value) if !value.trim().is_empty() => value,
        _ => {
            return Err(IdempotencyError::MissingIdempotencyKey {
                method: context.method,
                route: context.route.to_string(),
            })
        }
    };

    let meta = Fingerprint {
        idempotency_key: key.to_string(),
        caller: context.caller.to_string(),
        method: context.method,
        route: context.route.to_string(),
        body_hash: META_BODY_HASH.to_string(),
    };
    let response = meta.with_body_hash(body_hash);
    Ok(FingerprintPair { meta, response })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(key: Option<&str>) -> MutationContext<'_> {
        MutationContext {
            idempotency_key: key,
            caller: "user-1",
            method: HttpMethod::Patch,
            route: "/members/me",
        }
    }

    #[test]
    fn pair_shares_retry_group_and_differs_in_body_hash() {
        let hash = BodyHash::of_bytes(b"{}");
        let pair = match build_fingerprints(&context(Some("abc-123")), &hash) {
            Ok(value) => value,
            Err(err) => panic!("expected fingerprints: {err}"),
        };

        assert!(pair.meta.is_meta());
        assert!(!pair.response.is_meta());
        assert!(pair.meta.same_retry_group(&pair.response));
        assert_eq!(pair.response.body_hash, hash.as_str());
        assert_ne!(pair.meta, pair.response);
    }

    #[test]
    fn missing_or_blank_key_is_rejected() {
        let hash = BodyHash::of_bytes(b"{}");
        for key in [None, Some(""), Some("   ")] {
            let result = build_fingerprints(&context(key), &hash);
            assert!(
                matches!(
                    result,
                    Err(IdempotencyError::MissingIdempotencyKey { method: HttpMethod::Patch, .. })
                ),
                "expected missing key error for {key:?}"
            );
        }
    }

    #[test]
    fn method_round_trips_through_wire_names() {
        for method in [
            HttpMethod::Post,
            HttpMethod::Put,
            HttpMethod::Patch,
            HttpMethod::Delete,
        ] {
            assert_eq!(HttpMethod::parse(method.as_str()), Some(method));
        }
        assert_eq!(HttpMethod::parse("patch"), Some(HttpMethod::Patch));
        assert_eq!(HttpMethod::parse("GET"), None);
    }

    #[test]
    fn display_includes_body_only_for_response_entries() {
        let hash = BodyHash::of_bytes(b"{}");
        let pair = match build_fingerprints(&context(Some("k")), &hash) {
            Ok(value) => value,
            Err(err) => panic!("expected fingerprints: {err}"),
        };
        assert_eq!(pair.meta.to_string(), "PATCH /members/me key=k caller=user-1");
        assert!(pair.response.to_string().ends_with(hash.as_str()));
    }
}
