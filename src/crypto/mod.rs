//! Envelope encryption for sensitive stored fields.
//!
//! Plaintext is encrypted with AES-256-GCM under a key derived from the
//! installation master secret and a fresh per-record salt, never under the
//! master secret itself. The owning record's context (admin id) is bound as
//! additional authenticated data.

pub mod envelope;
pub mod kdf;

pub use envelope::{CryptoError, EncryptedBlob, EnvelopeCipher};
pub use kdf::{KeyDerivationError, MasterKey};
