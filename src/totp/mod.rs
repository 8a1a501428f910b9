//! TOTP second-factor authentication for administrator accounts.
//!
//! Enrollment, verification (with clock-drift tolerance and constant-time
//! comparison), single-use backup codes, and the per-admin enrollment state
//! machine `NotEnrolled → PendingVerification → Enabled → Disabled`.

pub mod backup;
pub mod models;
pub mod service;
pub mod store;

pub use service::{TotpError, TotpService, VerifyOutcome};
pub use store::{MemorySecretStore, PgSecretStore, SecretStore};
