//! Member profile partial update: the patch body guarded by the replay pipeline.

use serde::{Deserialize, Serialize};

use crate::canonical::{normalize_email, normalize_human_name, Canonicalize};
use crate::tristate::{PatchError, TriState};

pub const UPDATE_MEMBER_PROFILE_ROUTE: &str = "/members/me";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProfileError {
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("validation error: {0}")]
    Validation(String),
}

impl ProfileError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Patch(_) | Self::Validation(_) => "VALIDATION_ERROR",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VehicleProfile {
    pub make: Option<String>,
    pub model: Option<String>,
    pub tire_size: Option<String>,
    pub lift_lockers: Option<String>,
    pub fuel_range: Option<String>,
    pub recovery_gear: Option<String>,
    pub ham_radio_call_sign: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberProfile {
    pub member_id: String,
    pub display_name: String,
    pub email: String,
    pub group_alias_email: Option<String>,
    pub vehicle_profile: Option<VehicleProfile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VehicleProfilePatch {
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub make: TriState<String>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub model: TriState<String>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub tire_size: TriState<String>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub lift_lockers: TriState<String>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub fuel_range: TriState<String>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub recovery_gear: TriState<String>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub ham_radio_call_sign: TriState<String>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub notes: TriState<String>,
}

impl VehicleProfilePatch {
    fn apply_to(self, target: &mut VehicleProfile) {
        self.make.apply_to(&mut target.make);
        self.model.apply_to(&mut target.model);
        self.tire_size.apply_to(&mut target.tire_size);
        self.lift_lockers.apply_to(&mut target.lift_lockers);
        self.fuel_range.apply_to(&mut target.fuel_range);
        self.recovery_gear.apply_to(&mut target.recovery_gear);
        self.ham_radio_call_sign.apply_to(&mut target.ham_radio_call_sign);
        self.notes.apply_to(&mut target.notes);
    }
}

/// `PATCH /members/me` body. Every field is optional and, where the domain
/// allows it, clearable with an explicit `null`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateMemberProfileRequest {
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub display_name: TriState<String>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub email: TriState<String>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub group_alias_email: TriState<String>,
    #[serde(default, skip_serializing_if = "TriState::is_unspecified")]
    pub vehicle_profile: TriState<VehicleProfilePatch>,
}

impl UpdateMemberProfileRequest {
    /// Decodes a raw JSON body.
    ///
    /// # Errors
    /// Returns [`ProfileError::Validation`] for malformed JSON, wrong field
    /// types, or unknown fields.
    pub fn from_json_slice(raw: &[u8]) -> Result<Self, ProfileError> {
        serde_json::from_slice(raw)
            .map_err(|err| ProfileError::Validation(format!("invalid request body: {err}")))
    }
}

impl Canonicalize for UpdateMemberProfileRequest {
    fn canonicalize(&self) -> Self {
        Self {
            display_name: self.display_name.as_ref().map(|name| normalize_human_name(name)),
            email: self.email.as_ref().map(|email| normalize_email(email)),
            group_alias_email: self
                .group_alias_email
                .as_ref()
                .map(|email| normalize_email(email)),
            vehicle_profile: self.vehicle_profile.clone(),
        }
    }
}

impl MemberProfile {
    /// Applies a patch: unspecified fields are kept, `null` clears, values overwrite.
    ///
    /// The profile is only modified when the whole patch is valid.
    ///
    /// # Errors
    /// Returns [`ProfileError`] when a non-nullable attribute is cleared or a
    /// resulting value violates profile constraints.
    pub fn apply(&mut self, request: UpdateMemberProfileRequest) -> Result<(), ProfileError> {
        let mut next = self.clone();

        request
            .display_name
            .map(|name| normalize_human_name(&name))
            .apply_required("displayName", &mut next.display_name)?;
        request
            .email
            .map(|email| normalize_email(&email))
            .apply_required("email", &mut next.email)?;
        request
            .group_alias_email
            .map(|email| normalize_email(&email))
            .apply_to(&mut next.group_alias_email);

        match request.vehicle_profile {
            TriState::Unspecified => {}
            TriState::Null => next.vehicle_profile = None,
            TriState::Present(patch) => {
                let mut vehicle = next.vehicle_profile.take().unwrap_or_default();
                patch.apply_to(&mut vehicle);
                next.vehicle_profile = Some(vehicle);
            }
        }

        next.validate()?;
        *self = next;
        Ok(())
    }

    fn validate(&self) -> Result<(), ProfileError> {
        if self.display_name.is_empty() {
            return Err(ProfileError::Validation(
                "displayName cannot be empty".to_string(),
            ));
        }

        if !looks_like_email(&self.email) {
            return Err(ProfileError::Validation(
                "email must be a valid address".to_string(),
            ));
        }

        if let Some(alias) = &self.group_alias_email {
            if !looks_like_email(alias) {
                return Err(ProfileError::Validation(
                    "groupAliasEmail must be a valid address".to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn looks_like_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => !local.is_empty() && !domain.is_empty() && !domain.contains('@'),
        None => false,
    }
}
