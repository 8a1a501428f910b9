//! # Tessera Security Core
//!
//! `tessera` is the security core of the Tessera fractional real-estate
//! platform. It protects sensitive stored fields (TOTP secrets, property and
//! investor PII) with envelope encryption and provides the TOTP second-factor
//! protocol for administrator accounts.
//!
//! ## Envelope encryption
//!
//! Every sensitive field is encrypted with AES-256-GCM under a per-record key
//! derived from the installation master secret and a fresh random salt. The
//! owning admin's id is bound as additional authenticated data so ciphertexts
//! cannot be swapped between records. Authentication tags are validated to be
//! exactly 16 bytes before any AEAD verification is attempted.
//!
//! ## Second factor (TOTP)
//!
//! Administrators enroll a TOTP secret (RFC 6238, 30-second step, 6 digits)
//! together with ten single-use backup codes stored only as salted hashes.
//! Verification tolerates ±1 time step of clock drift, compares codes in
//! constant time, and is gated by a per `(admin, ip)` lockout policy. Every
//! attempt is recorded in an append-only security audit log that feeds the
//! operations dashboard.

pub mod api;
pub mod audit;
pub mod cli;
pub mod clock;
pub mod crypto;
pub mod ratelimit;
pub mod totp;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
