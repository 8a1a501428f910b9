//! Master-key handling and per-record key derivation.
//!
//! The installation master secret is never used directly as a cipher key and
//! never persisted alongside encrypted data. Each encrypt/decrypt operation
//! derives a single-use 256-bit key from the secret and a per-record random
//! salt via Argon2id, and the derived key is wiped when dropped.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

/// Minimum installation-secret length, in bytes, after trimming whitespace.
pub const MIN_SECRET_LEN: usize = 32;

// Argon2id parameters pinned explicitly so an argon2 crate upgrade cannot
// silently change the derivation: 19 MiB, 2 passes, 1 lane.
const ARGON2_M_COST_KIB: u32 = 19 * 1024;
const ARGON2_T_COST: u32 = 2;
const ARGON2_P_COST: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KeyDerivationError {
    #[error("installation secret is not configured")]
    MissingSecret,
    #[error("installation secret is below the minimum entropy threshold")]
    WeakSecret,
    #[error("key derivation failed")]
    Derivation,
}

/// A derived per-record key, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RecordKey([u8; KEY_LEN]);

impl RecordKey {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// The installation-wide master secret, validated once at process start.
#[derive(Clone)]
pub struct MasterKey {
    secret: SecretString,
}

impl MasterKey {
    /// Validates and wraps the installation secret.
    ///
    /// # Errors
    /// Returns [`KeyDerivationError::MissingSecret`] for an empty secret and
    /// [`KeyDerivationError::WeakSecret`] for one shorter than
    /// [`MIN_SECRET_LEN`] bytes. Both are fatal at startup; the process must
    /// refuse to serve encryption-dependent requests.
    pub fn from_secret(secret: SecretString) -> Result<Self, KeyDerivationError> {
        let trimmed = secret.expose_secret().trim();
        if trimmed.is_empty() {
            return Err(KeyDerivationError::MissingSecret);
        }
        if trimmed.len() < MIN_SECRET_LEN {
            return Err(KeyDerivationError::WeakSecret);
        }
        Ok(Self { secret })
    }

    /// Derives a single-use 256-bit key for the record identified by `salt`.
    ///
    /// # Errors
    /// Returns [`KeyDerivationError::Derivation`] if the KDF rejects its
    /// inputs (salt shorter than expected, invalid parameters).
    pub fn derive(&self, salt: &[u8]) -> Result<RecordKey, KeyDerivationError> {
        if salt.len() < SALT_LEN {
            return Err(KeyDerivationError::Derivation);
        }

        let params = Params::new(ARGON2_M_COST_KIB, ARGON2_T_COST, ARGON2_P_COST, Some(KEY_LEN))
            .map_err(|_| KeyDerivationError::Derivation)?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut out = [0u8; KEY_LEN];
        argon2
            .hash_password_into(self.secret.expose_secret().trim().as_bytes(), salt, &mut out)
            .map_err(|_| KeyDerivationError::Derivation)?;

        Ok(RecordKey(out))
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the secret through Debug formatting.
        f.debug_struct("MasterKey").finish_non_exhaustive()
    }
}

/// Generates a fresh random per-record salt.
#[must_use]
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn strong_secret() -> SecretString {
        SecretString::from("an-installation-secret-with-plenty-of-entropy-0123456789")
    }

    #[test]
    fn rejects_empty_secret() {
        let result = MasterKey::from_secret(SecretString::from(""));
        assert_eq!(result.err(), Some(KeyDerivationError::MissingSecret));
    }

    #[test]
    fn rejects_short_secret() {
        let result = MasterKey::from_secret(SecretString::from("too-short"));
        assert_eq!(result.err(), Some(KeyDerivationError::WeakSecret));
    }

    #[test]
    fn derivation_is_deterministic_per_salt() {
        let master = MasterKey::from_secret(strong_secret()).unwrap();
        let salt = generate_salt();

        let key_a = master.derive(&salt).unwrap();
        let key_b = master.derive(&salt).unwrap();
        assert_eq!(key_a.as_bytes(), key_b.as_bytes());
    }

    #[test]
    fn different_salts_derive_different_keys() {
        let master = MasterKey::from_secret(strong_secret()).unwrap();

        let key_a = master.derive(&generate_salt()).unwrap();
        let key_b = master.derive(&generate_salt()).unwrap();
        assert_ne!(key_a.as_bytes(), key_b.as_bytes());
    }

    #[test]
    fn rejects_undersized_salt() {
        let master = MasterKey::from_secret(strong_secret()).unwrap();
        let result = master.derive(&[0u8; 8]);
        assert_eq!(result.err(), Some(KeyDerivationError::Derivation));
    }

    #[test]
    fn debug_does_not_leak_secret() {
        let master = MasterKey::from_secret(strong_secret()).unwrap();
        let rendered = format!("{master:?}");
        assert!(!rendered.contains("entropy"));
    }
}
