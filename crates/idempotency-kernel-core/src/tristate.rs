//! Patch input that distinguishes an omitted field from an explicit `null`.
//!
//! A JSON body such as `{"groupAliasEmail": null}` means "clear the alias",
//! while `{}` means "leave it alone". `Option<T>` cannot carry both meanings,
//! so patch request structs declare their fields as [`TriState<T>`] with
//! `#[serde(default, skip_serializing_if = "TriState::is_unspecified")]`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, thiserror::Error, Eq, PartialEq)]
#[error("tri-state field does not hold a value")]
pub struct NotPresentError;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PatchError {
    #[error("{0} cannot be cleared")]
    NotNullable(&'static str),
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum TriState<T> {
    Unspecified,
    Null,
    Present(T),
}

impl<T> TriState<T> {
    #[must_use]
    pub fn unspecified() -> Self {
        Self::Unspecified
    }

    #[must_use]
    pub fn explicit_null() -> Self {
        Self::Null
    }

    #[must_use]
    pub fn present(value: T) -> Self {
        Self::Present(value)
    }

    #[must_use]
    pub fn is_specified(&self) -> bool {
        !matches!(self, Self::Unspecified)
    }

    #[must_use]
    pub fn is_unspecified(&self) -> bool {
        matches!(self, Self::Unspecified)
    }

    /// `false` for both `Unspecified` and `Present`; check [`Self::is_specified`] first.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Borrows the carried value.
    ///
    /// # Errors
    /// Returns [`NotPresentError`] unless the field is `Present`.
    pub fn get(&self) -> Result<&T, NotPresentError> {
        match self {
            Self::Present(value) => Ok(value),
            Self::Unspecified | Self::Null => Err(NotPresentError),
        }
    }

    #[must_use]
    pub fn as_ref(&self) -> TriState<&T> {
        match self {
            Self::Unspecified => TriState::Unspecified,
            Self::Null => TriState::Null,
            Self::Present(value) => TriState::Present(value),
        }
    }

    /// Transforms a carried value; `Unspecified` and `Null` pass through.
    #[must_use]
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TriState<U> {
        match self {
            Self::Unspecified => TriState::Unspecified,
            Self::Null => TriState::Null,
            Self::Present(value) => TriState::Present(f(value)),
        }
    }

    /// Applies the patch to an attribute whose domain permits absence.
    pub fn apply_to(self, target: &mut Option<T>) {
        match self {
            Self::Unspecified => {}
            Self::Null => *target = None,
            Self::Present(value) => *target = Some(value),
        }
    }

    /// Applies the patch to an attribute that must always hold a value.
    ///
    /// # Errors
    /// Returns [`PatchError::NotNullable`] when the patch is an explicit `null`;
    /// the target is left untouched.
    pub fn apply_required(self, field: &'static str, target: &mut T) -> Result<(), PatchError> {
        match self {
            Self::Unspecified => Ok(()),
            Self::Null => Err(PatchError::NotNullable(field)),
            Self::Present(value) => {
                *target = value;
                Ok(())
            }
        }
    }
}

impl<T> Default for TriState<T> {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl<T> From<Option<T>> for TriState<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(inner) => Self::Present(inner),
            None => Self::Null,
        }
    }
}

impl<T: Serialize> Serialize for TriState<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Present(value) => value.serialize(serializer),
            Self::Unspecified | Self::Null => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for TriState<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Self::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Probe {
        #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
        alias: TriState<String>,
    }

    fn decode(value: serde_json::Value) -> Probe {
        match serde_json::from_value(value) {
            Ok(probe) => probe,
            Err(err) => panic!("failed to decode probe: {err}"),
        }
    }

    #[test]
    fn accessors_follow_the_three_states() {
        let unspecified = TriState::<u8>::unspecified();
        assert!(!unspecified.is_specified());
        assert!(!unspecified.is_null());
        assert_eq!(unspecified.get(), Err(NotPresentError));

        let null = TriState::<u8>::explicit_null();
        assert!(null.is_specified());
        assert!(null.is_null());
        assert_eq!(null.get(), Err(NotPresentError));

        let present = TriState::present(7_u8);
        assert!(present.is_specified());
        assert!(!present.is_null());
        assert_eq!(present.get(), Ok(&7));
    }

    #[test]
    fn json_absent_null_and_value_decode_to_distinct_states() {
        assert_eq!(decode(json!({})).alias, TriState::Unspecified);
        assert_eq!(decode(json!({"alias": null})).alias, TriState::Null);
        assert_eq!(
            decode(json!({"alias": "crew@x.com"})).alias,
            TriState::Present("crew@x.com".to_string())
        );
    }

    #[test]
    fn serialization_omits_unspecified_and_keeps_explicit_null() {
        let omitted = serde_json::to_value(Probe::default());
        assert_eq!(omitted.ok(), Some(json!({})));

        let cleared = serde_json::to_value(Probe {
            alias: TriState::Null,
        });
        assert_eq!(cleared.ok(), Some(json!({"alias": null})));
    }

    #[test]
    fn empty_string_is_a_value_not_an_omission() {
        let probe = decode(json!({"alias": ""}));
        assert_eq!(probe.alias, TriState::Present(String::new()));
    }

    #[test]
    fn apply_to_nullable_attribute() {
        let mut alias = Some("old".to_string());
        TriState::Unspecified.apply_to(&mut alias);
        assert_eq!(alias.as_deref(), Some("old"));

        TriState::Present("new".to_string()).apply_to(&mut alias);
        assert_eq!(alias.as_deref(), Some("new"));

        TriState::Null.apply_to(&mut alias);
        assert_eq!(alias, None);
    }

    #[test]
    fn apply_required_rejects_null_and_keeps_target() {
        let mut email = "a@x.com".to_string();
        let result = TriState::Null.apply_required("email", &mut email);
        assert_eq!(result, Err(PatchError::NotNullable("email")));
        assert_eq!(email, "a@x.com");

        let result = TriState::Present("b@x.com".to_string()).apply_required("email", &mut email);
        assert_eq!(result, Ok(()));
        assert_eq!(email, "b@x.com");
    }
}
