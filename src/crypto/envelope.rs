//! AES-256-GCM envelope encryption with strict tag validation.
//!
//! Each call derives a fresh single-use key from the master secret and a
//! fresh random salt, so the 12-byte IV is never reused under the same key.
//! Decryption failures are deliberately opaque: the error carries no detail
//! about why AEAD verification failed.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64ct::{Base64, Encoding};
use rand::{rngs::OsRng, RngCore};

use crate::crypto::kdf::{generate_salt, KeyDerivationError, MasterKey, SALT_LEN};

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Version tag persisted with every blob so a future key rotation can
/// coexist with existing records.
pub const KEY_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// The authentication tag is not exactly [`TAG_LEN`] bytes. Checked
    /// before any AEAD verification is attempted; the defense against
    /// tag-truncation attacks.
    #[error("invalid authentication tag length")]
    InvalidTagLength,
    /// Generic AEAD failure: wrong key, tampered ciphertext, or mismatched
    /// context. Never differentiated, to avoid acting as an oracle.
    #[error("decryption failed")]
    DecryptionFailure,
    #[error("encryption failed")]
    EncryptionFailure,
    /// A persisted blob could not be decoded back into its parts.
    #[error("encrypted blob is malformed")]
    MalformedBlob,
    #[error(transparent)]
    KeyDerivation(#[from] KeyDerivationError),
}

/// An envelope-encrypted payload, held as raw bytes in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub salt: Vec<u8>,
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub key_version: u32,
}

/// The persisted form of [`EncryptedBlob`]: base64 columns plus the key
/// version, matching the record-store layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBlob {
    pub salt: String,
    pub iv: String,
    pub ciphertext: String,
    pub auth_tag: String,
    pub key_version: u32,
}

impl EncryptedBlob {
    #[must_use]
    pub fn to_encoded(&self) -> EncodedBlob {
        EncodedBlob {
            salt: Base64::encode_string(&self.salt),
            iv: Base64::encode_string(&self.iv),
            ciphertext: Base64::encode_string(&self.ciphertext),
            auth_tag: Base64::encode_string(&self.auth_tag),
            key_version: self.key_version,
        }
    }

    /// Decodes a persisted blob.
    ///
    /// # Errors
    /// Returns [`CryptoError::MalformedBlob`] if any field fails to decode or
    /// the IV is not exactly [`IV_LEN`] bytes.
    pub fn from_encoded(encoded: &EncodedBlob) -> Result<Self, CryptoError> {
        let salt = Base64::decode_vec(&encoded.salt).map_err(|_| CryptoError::MalformedBlob)?;
        let iv_bytes = Base64::decode_vec(&encoded.iv).map_err(|_| CryptoError::MalformedBlob)?;
        let ciphertext =
            Base64::decode_vec(&encoded.ciphertext).map_err(|_| CryptoError::MalformedBlob)?;
        let auth_tag =
            Base64::decode_vec(&encoded.auth_tag).map_err(|_| CryptoError::MalformedBlob)?;

        let iv: [u8; IV_LEN] = iv_bytes
            .try_into()
            .map_err(|_| CryptoError::MalformedBlob)?;

        Ok(Self {
            salt,
            iv,
            ciphertext,
            auth_tag,
            key_version: encoded.key_version,
        })
    }
}

/// Authenticated encrypt/decrypt of opaque byte payloads.
#[derive(Clone)]
pub struct EnvelopeCipher {
    master: MasterKey,
}

impl EnvelopeCipher {
    #[must_use]
    pub fn new(master: MasterKey) -> Self {
        Self { master }
    }

    /// Encrypts `plaintext`, optionally binding `context` (e.g. the owning
    /// admin's id) as additional authenticated data so ciphertexts cannot be
    /// swapped between records.
    ///
    /// # Errors
    /// Returns an error if key derivation or the AEAD primitive fails. The
    /// error never carries plaintext or key material.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        context: Option<&[u8]>,
    ) -> Result<EncryptedBlob, CryptoError> {
        let salt = generate_salt();
        let key = self.master.derive(&salt)?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        let payload = Payload {
            msg: plaintext,
            aad: context.unwrap_or_default(),
        };

        let mut combined = cipher
            .encrypt(Nonce::from_slice(&iv), payload)
            .map_err(|_| CryptoError::EncryptionFailure)?;

        // aes-gcm appends the tag to the ciphertext; keep them separate so
        // the tag length can be validated independently on the way back in.
        if combined.len() < TAG_LEN {
            return Err(CryptoError::EncryptionFailure);
        }
        let auth_tag = combined.split_off(combined.len() - TAG_LEN);

        Ok(EncryptedBlob {
            salt: salt.to_vec(),
            iv,
            ciphertext: combined,
            auth_tag,
            key_version: KEY_VERSION,
        })
    }

    /// Decrypts a blob, verifying `context` against the AAD it was encrypted
    /// with.
    ///
    /// The tag length is checked to be exactly [`TAG_LEN`] bytes before the
    /// AEAD primitive is invoked; shorter, longer, or empty tags fail with
    /// [`CryptoError::InvalidTagLength`] without attempting decryption. An
    /// all-zero tag is rejected as a degenerate forgery.
    ///
    /// # Errors
    /// [`CryptoError::InvalidTagLength`] for a bad tag length, otherwise the
    /// opaque [`CryptoError::DecryptionFailure`].
    pub fn decrypt(
        &self,
        blob: &EncryptedBlob,
        context: Option<&[u8]>,
    ) -> Result<Vec<u8>, CryptoError> {
        if blob.auth_tag.len() != TAG_LEN {
            return Err(CryptoError::InvalidTagLength);
        }
        if blob.auth_tag.iter().all(|&byte| byte == 0) {
            return Err(CryptoError::DecryptionFailure);
        }
        if blob.salt.len() < SALT_LEN || blob.key_version != KEY_VERSION {
            return Err(CryptoError::DecryptionFailure);
        }

        let key = self.master.derive(&blob.salt)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

        let mut combined = Vec::with_capacity(blob.ciphertext.len() + TAG_LEN);
        combined.extend_from_slice(&blob.ciphertext);
        combined.extend_from_slice(&blob.auth_tag);

        let payload = Payload {
            msg: &combined,
            aad: context.unwrap_or_default(),
        };

        cipher
            .decrypt(Nonce::from_slice(&blob.iv), payload)
            .map_err(|_| CryptoError::DecryptionFailure)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn cipher() -> EnvelopeCipher {
        let master = MasterKey::from_secret(SecretString::from(
            "test-installation-secret-0123456789-abcdefghij",
        ))
        .unwrap();
        EnvelopeCipher::new(master)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = cipher();
        let plaintext = b"totp-seed-material";

        let blob = cipher.encrypt(plaintext, Some(b"admin-a")).unwrap();
        assert_ne!(blob.ciphertext, plaintext.to_vec());
        assert_eq!(blob.auth_tag.len(), TAG_LEN);
        assert_eq!(blob.key_version, KEY_VERSION);

        let decrypted = cipher.decrypt(&blob, Some(b"admin-a")).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn roundtrip_without_context() {
        let cipher = cipher();
        let blob = cipher.encrypt(b"pii", None).unwrap();
        assert_eq!(cipher.decrypt(&blob, None).unwrap(), b"pii");
    }

    #[test]
    fn decrypt_fails_with_mismatched_context() {
        let cipher = cipher();
        let blob = cipher.encrypt(b"secret", Some(b"adminA")).unwrap();

        let result = cipher.decrypt(&blob, Some(b"adminB"));
        assert_eq!(result.err(), Some(CryptoError::DecryptionFailure));
    }

    #[test]
    fn rejects_truncated_and_oversized_tags_before_aead() {
        let cipher = cipher();
        let blob = cipher.encrypt(b"secret", None).unwrap();

        for bad_len in [0usize, 8, 12, 20, 32] {
            let mut forged = blob.clone();
            forged.auth_tag = vec![0xAB; bad_len];
            assert_eq!(
                cipher.decrypt(&forged, None).err(),
                Some(CryptoError::InvalidTagLength),
                "tag length {bad_len} must be rejected"
            );
        }
    }

    #[test]
    fn rejects_all_zero_tag() {
        let cipher = cipher();
        let mut blob = cipher.encrypt(b"secret", None).unwrap();
        blob.auth_tag = vec![0u8; TAG_LEN];

        assert_eq!(
            cipher.decrypt(&blob, None).err(),
            Some(CryptoError::DecryptionFailure)
        );
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let cipher = cipher();
        let mut blob = cipher.encrypt(b"secret", None).unwrap();
        if let Some(byte) = blob.ciphertext.first_mut() {
            *byte ^= 0xFF;
        }

        assert_eq!(
            cipher.decrypt(&blob, None).err(),
            Some(CryptoError::DecryptionFailure)
        );
    }

    #[test]
    fn rejects_unknown_key_version() {
        let cipher = cipher();
        let mut blob = cipher.encrypt(b"secret", None).unwrap();
        blob.key_version = 99;

        assert_eq!(
            cipher.decrypt(&blob, None).err(),
            Some(CryptoError::DecryptionFailure)
        );
    }

    #[test]
    fn fresh_salt_and_iv_per_call() {
        let cipher = cipher();
        let blob_a = cipher.encrypt(b"same-plaintext", None).unwrap();
        let blob_b = cipher.encrypt(b"same-plaintext", None).unwrap();

        assert_ne!(blob_a.salt, blob_b.salt);
        assert_ne!(blob_a.iv, blob_b.iv);
        assert_ne!(blob_a.ciphertext, blob_b.ciphertext);
    }

    #[test]
    fn encoded_form_roundtrips() {
        let cipher = cipher();
        let blob = cipher.encrypt(b"secret", Some(b"admin")).unwrap();

        let encoded = blob.to_encoded();
        let decoded = EncryptedBlob::from_encoded(&encoded).unwrap();
        assert_eq!(decoded, blob);
        assert_eq!(cipher.decrypt(&decoded, Some(b"admin")).unwrap(), b"secret");
    }

    #[test]
    fn malformed_encoding_is_rejected() {
        let encoded = EncodedBlob {
            salt: "not base64!".to_string(),
            iv: String::new(),
            ciphertext: String::new(),
            auth_tag: String::new(),
            key_version: KEY_VERSION,
        };
        assert_eq!(
            EncryptedBlob::from_encoded(&encoded).err(),
            Some(CryptoError::MalformedBlob)
        );
    }
}
