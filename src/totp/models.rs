use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::EncryptedBlob;

/// Per-admin enrollment state. `NotEnrolled` is represented by the absence
/// of a stored record; the other states are persisted.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentState {
    NotEnrolled,
    PendingVerification,
    Enabled,
    Disabled,
}

impl EnrollmentState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotEnrolled => "not_enrolled",
            Self::PendingVerification => "pending_verification",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "not_enrolled" => Some(Self::NotEnrolled),
            "pending_verification" => Some(Self::PendingVerification),
            "enabled" => Some(Self::Enabled),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }

    /// Whether `verify`/`verify_backup_code` may run in this state.
    #[must_use]
    pub fn accepts_verification(self) -> bool {
        matches!(self, Self::PendingVerification | Self::Enabled)
    }
}

/// A backup code stored as a salted hash with its single-use flag. The
/// plaintext code is never persisted.
#[derive(Clone, Debug)]
pub struct BackupCode {
    pub hash: String,
    pub used: bool,
}

/// The stored TOTP record for one admin. Owned exclusively by that admin
/// account; mutated only through [`crate::totp::TotpService`].
#[derive(Clone, Debug)]
pub struct TotpSecretRecord {
    pub admin_id: Uuid,
    pub state: EnrollmentState,
    /// `None` once the secret has been wiped by `disable`.
    pub encrypted_secret: Option<EncryptedBlob>,
    pub backup_codes: Vec<BackupCode>,
    pub created_at: DateTime<Utc>,
}

/// The one-time enrollment output: plaintext secret and backup codes are
/// returned to the caller exactly once and are not retrievable again.
#[derive(Clone, Debug, Serialize)]
pub struct Enrollment {
    pub secret_base32: String,
    pub otp_uri: String,
    pub backup_codes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrollment_state_round_trips_through_str() {
        for state in [
            EnrollmentState::NotEnrolled,
            EnrollmentState::PendingVerification,
            EnrollmentState::Enabled,
            EnrollmentState::Disabled,
        ] {
            assert_eq!(EnrollmentState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(EnrollmentState::from_str("bogus"), None);
    }

    #[test]
    fn verification_allowed_only_when_pending_or_enabled() {
        assert!(EnrollmentState::PendingVerification.accepts_verification());
        assert!(EnrollmentState::Enabled.accepts_verification());
        assert!(!EnrollmentState::NotEnrolled.accepts_verification());
        assert!(!EnrollmentState::Disabled.accepts_verification());
    }
}
