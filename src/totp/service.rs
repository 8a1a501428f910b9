//! The TOTP verification protocol: enrollment, code verification, backup
//! recovery, and disable.
//!
//! Every verification path consults the rate limiter first and records a
//! security event after the attempt. Limiter and audit write failures are
//! recovered locally (logged, fail closed) and never abort the caller's
//! request; only the lockout itself rejects an attempt.

use std::sync::Arc;

use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::{
    audit::{SecurityAction, SecurityAuditLog},
    clock::{Clock, SystemClock},
    crypto::{CryptoError, EnvelopeCipher},
    ratelimit::{Gate, RateLimiter},
    totp::{
        backup::{self, BackupCodeBatch},
        models::{BackupCode, Enrollment, EnrollmentState, TotpSecretRecord},
        store::SecretStore,
    },
};

const TOTP_DIGITS: usize = 6;
const TOTP_STEP_SECONDS: u64 = 30;
// ±1 step of clock-drift tolerance.
const TOTP_SKEW: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum TotpError {
    #[error("admin is already enrolled")]
    AlreadyEnrolled,
    #[error("admin has no active enrollment")]
    NotEnrolled,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Outcome of a verification attempt. `LockedOut` is distinguishable from an
/// invalid code so the UI can show a cooldown, but reveals nothing about
/// whether the submitted code would have been correct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    InvalidCode,
    InvalidBackupCode,
    LockedOut { retry_after_seconds: u64 },
}

/// Second-factor authenticator for admin accounts. All collaborators are
/// injected, so tests run against isolated in-process state.
#[derive(Clone)]
pub struct TotpService {
    cipher: EnvelopeCipher,
    store: Arc<dyn SecretStore>,
    limiter: Arc<dyn RateLimiter>,
    audit: SecurityAuditLog,
    clock: Arc<dyn Clock>,
    issuer: String,
}

impl TotpService {
    #[must_use]
    pub fn new(
        cipher: EnvelopeCipher,
        store: Arc<dyn SecretStore>,
        limiter: Arc<dyn RateLimiter>,
        audit: SecurityAuditLog,
        issuer: String,
    ) -> Self {
        Self::with_clock(cipher, store, limiter, audit, issuer, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(
        cipher: EnvelopeCipher,
        store: Arc<dyn SecretStore>,
        limiter: Arc<dyn RateLimiter>,
        audit: SecurityAuditLog,
        issuer: String,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cipher,
            store,
            limiter,
            audit,
            clock,
            issuer,
        }
    }

    #[must_use]
    pub fn audit(&self) -> &SecurityAuditLog {
        &self.audit
    }

    /// Begins enrollment: generates a 160-bit secret and ten backup codes,
    /// encrypts the secret bound to the admin id, persists, and transitions
    /// to `PendingVerification`.
    ///
    /// The plaintext secret and backup codes are returned exactly once; they
    /// are not retrievable again.
    ///
    /// # Errors
    /// [`TotpError::AlreadyEnrolled`] unless the admin is `NotEnrolled` or
    /// `Disabled`; otherwise crypto or store failures.
    #[instrument(skip(self), fields(admin_id = %admin_id))]
    pub async fn generate_secret(
        &self,
        admin_id: Uuid,
        ip: &str,
        user_agent: Option<&str>,
    ) -> Result<Enrollment, TotpError> {
        if let Some(record) = self.store.load(admin_id).await? {
            if record.state.accepts_verification() {
                return Err(TotpError::AlreadyEnrolled);
            }
        }

        let secret_bytes = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| anyhow::anyhow!("secret generation failed: {e}"))?;

        let totp = self.build_totp(secret_bytes.clone(), admin_id)?;
        let batch = BackupCodeBatch::generate()?;

        let encrypted_secret = self
            .cipher
            .encrypt(&secret_bytes, Some(admin_id.as_bytes()))?;

        let record = TotpSecretRecord {
            admin_id,
            state: EnrollmentState::PendingVerification,
            encrypted_secret: Some(encrypted_secret),
            backup_codes: batch
                .code_hashes
                .iter()
                .map(|hash| BackupCode {
                    hash: hash.clone(),
                    used: false,
                })
                .collect(),
            created_at: self.clock.now(),
        };
        self.store.save(record).await?;

        self.audit
            .record(admin_id, ip, user_agent, SecurityAction::Generate, true)
            .await;

        Ok(Enrollment {
            secret_base32: totp.get_secret_base32(),
            otp_uri: totp.get_url(),
            backup_codes: batch.codes,
        })
    }

    /// Verifies a submitted TOTP code for the current time step ±1.
    ///
    /// The rate limiter is consulted first; while locked, this returns
    /// `LockedOut` without touching the secret store. Candidate codes are
    /// compared in constant time. A match resets the failure counter and
    /// completes a pending enrollment; a miss counts toward lockout.
    ///
    /// # Errors
    /// [`TotpError::NotEnrolled`] when no active enrollment exists;
    /// otherwise crypto or store failures.
    #[instrument(skip(self, submitted_code), fields(admin_id = %admin_id))]
    pub async fn verify(
        &self,
        admin_id: Uuid,
        ip: &str,
        user_agent: Option<&str>,
        submitted_code: &str,
    ) -> Result<VerifyOutcome, TotpError> {
        if let Some(outcome) = self.gate(admin_id, ip, user_agent).await {
            return Ok(outcome);
        }

        let record = self.load_verifiable(admin_id).await?;

        // Fast-path rejection: anything but a 6-digit string cannot match,
        // so skip the cryptographic comparison but still count the attempt.
        if submitted_code.len() != TOTP_DIGITS
            || !submitted_code.bytes().all(|b| b.is_ascii_digit())
        {
            self.count_failure(admin_id, ip, user_agent, SecurityAction::Verify)
                .await;
            return Ok(VerifyOutcome::InvalidCode);
        }

        let blob = record.encrypted_secret.as_ref().ok_or(TotpError::NotEnrolled)?;
        let secret_bytes = self.cipher.decrypt(blob, Some(admin_id.as_bytes()))?;
        let totp = self.build_totp(secret_bytes, admin_id)?;

        let now = self.clock.now_unix();
        let mut matched = subtle::Choice::from(0u8);
        for step_time in [
            now.saturating_sub(TOTP_STEP_SECONDS),
            now,
            now + TOTP_STEP_SECONDS,
        ] {
            let candidate = totp.generate(step_time);
            matched |= candidate.as_bytes().ct_eq(submitted_code.as_bytes());
        }

        if bool::from(matched) {
            self.reset_failures(admin_id, ip).await;
            if record.state == EnrollmentState::PendingVerification {
                self.store
                    .set_state(admin_id, EnrollmentState::Enabled)
                    .await?;
            }
            self.audit
                .record(admin_id, ip, user_agent, SecurityAction::Verify, true)
                .await;
            Ok(VerifyOutcome::Verified)
        } else {
            self.count_failure(admin_id, ip, user_agent, SecurityAction::Verify)
                .await;
            Ok(VerifyOutcome::InvalidCode)
        }
    }

    /// Verifies and consumes a single-use backup code.
    ///
    /// Failed backup attempts count toward lockout exactly like failed
    /// primary-code attempts; backup codes do not bypass lockout accounting.
    ///
    /// # Errors
    /// [`TotpError::NotEnrolled`] when no active enrollment exists;
    /// otherwise store failures.
    #[instrument(skip(self, submitted_code), fields(admin_id = %admin_id))]
    pub async fn verify_backup_code(
        &self,
        admin_id: Uuid,
        ip: &str,
        user_agent: Option<&str>,
        submitted_code: &str,
    ) -> Result<VerifyOutcome, TotpError> {
        if let Some(outcome) = self.gate(admin_id, ip, user_agent).await {
            return Ok(outcome);
        }

        self.load_verifiable(admin_id).await?;

        // Fast-path rejection for malformed codes, still counted.
        if backup::normalize_backup_code(submitted_code).is_err() {
            self.count_failure(admin_id, ip, user_agent, SecurityAction::Verify)
                .await;
            return Ok(VerifyOutcome::InvalidBackupCode);
        }

        let consumed = self
            .store
            .consume_backup_code(admin_id, submitted_code)
            .await?;

        if consumed {
            self.reset_failures(admin_id, ip).await;
            self.audit
                .record(admin_id, ip, user_agent, SecurityAction::BackupUsed, true)
                .await;
            Ok(VerifyOutcome::Verified)
        } else {
            self.count_failure(admin_id, ip, user_agent, SecurityAction::Verify)
                .await;
            Ok(VerifyOutcome::InvalidBackupCode)
        }
    }

    /// Wipes the stored secret and remaining backup codes and transitions to
    /// `Disabled`. Idempotent.
    ///
    /// # Errors
    /// Returns an error if the store write fails.
    #[instrument(skip(self), fields(admin_id = %admin_id))]
    pub async fn disable(
        &self,
        admin_id: Uuid,
        ip: &str,
        user_agent: Option<&str>,
    ) -> Result<(), TotpError> {
        self.store.wipe(admin_id).await?;
        self.audit
            .record(admin_id, ip, user_agent, SecurityAction::Disabled, true)
            .await;
        Ok(())
    }

    /// Consults the limiter before an attempt. Returns `Some(LockedOut)` to
    /// short-circuit; a limiter read failure fails closed.
    async fn gate(
        &self,
        admin_id: Uuid,
        ip: &str,
        user_agent: Option<&str>,
    ) -> Option<VerifyOutcome> {
        match self.limiter.check(admin_id, ip).await {
            Ok(Gate::Allowed) => None,
            Ok(Gate::Locked {
                retry_after_seconds,
            }) => {
                self.audit
                    .record(admin_id, ip, user_agent, SecurityAction::Verify, false)
                    .await;
                Some(VerifyOutcome::LockedOut {
                    retry_after_seconds,
                })
            }
            Err(err) => {
                // Fail closed; the retry hint is unknown without the state.
                error!("Lockout check failed, rejecting attempt: {err}");
                Some(VerifyOutcome::LockedOut {
                    retry_after_seconds: 0,
                })
            }
        }
    }

    async fn load_verifiable(&self, admin_id: Uuid) -> Result<TotpSecretRecord, TotpError> {
        let record = self
            .store
            .load(admin_id)
            .await?
            .ok_or(TotpError::NotEnrolled)?;
        if !record.state.accepts_verification() {
            return Err(TotpError::NotEnrolled);
        }
        Ok(record)
    }

    async fn count_failure(
        &self,
        admin_id: Uuid,
        ip: &str,
        user_agent: Option<&str>,
        action: SecurityAction,
    ) {
        if let Err(err) = self.limiter.record_failure(admin_id, ip).await {
            error!("Failed to record verification failure: {err}");
        }
        self.audit.record(admin_id, ip, user_agent, action, false).await;
    }

    async fn reset_failures(&self, admin_id: Uuid, ip: &str) {
        if let Err(err) = self.limiter.record_success(admin_id, ip).await {
            warn!("Failed to reset lockout counter: {err}");
        }
    }

    fn build_totp(&self, secret_bytes: Vec<u8>, admin_id: Uuid) -> Result<TOTP, TotpError> {
        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP_SECONDS,
            secret_bytes,
            Some(self.issuer.clone()),
            admin_id.to_string(),
        )
        .map_err(|e| TotpError::Internal(anyhow::anyhow!("TOTP init error: {e}")))
    }
}
