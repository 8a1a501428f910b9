//! Persistence for encrypted TOTP secrets and hashed backup codes.
//!
//! The store is injected into [`crate::totp::TotpService`] so tests run
//! against an isolated in-process map while production uses PostgreSQL.
//! `consume_backup_code` is the critical contract: marking a matching unused
//! code as used must be atomic, so two concurrent requests presenting the
//! same code cannot both succeed.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::{collections::HashMap, sync::Mutex};
use uuid::Uuid;

use crate::{
    crypto::envelope::{EncodedBlob, EncryptedBlob},
    totp::{
        backup,
        models::{BackupCode, EnrollmentState, TotpSecretRecord},
    },
};

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Replaces any existing record for the admin.
    async fn save(&self, record: TotpSecretRecord) -> Result<()>;

    async fn load(&self, admin_id: Uuid) -> Result<Option<TotpSecretRecord>>;

    async fn set_state(&self, admin_id: Uuid, state: EnrollmentState) -> Result<()>;

    /// Atomically marks a matching unused backup code as used. Returns
    /// `false` without mutation when no unused code matches.
    async fn consume_backup_code(&self, admin_id: Uuid, code: &str) -> Result<bool>;

    /// Wipes the stored secret and remaining backup codes, leaving a
    /// `Disabled` tombstone. A no-op when no record exists.
    async fn wipe(&self, admin_id: Uuid) -> Result<()>;
}

/// Mutex-guarded in-process store. The lock is held across the whole
/// verify-and-mark sequence in `consume_backup_code`, which is what makes
/// the consume atomic.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    records: Mutex<HashMap<Uuid, TotpSecretRecord>>,
}

impl MemorySecretStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, TotpSecretRecord>>> {
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("secret store lock poisoned"))
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn save(&self, record: TotpSecretRecord) -> Result<()> {
        self.lock()?.insert(record.admin_id, record);
        Ok(())
    }

    async fn load(&self, admin_id: Uuid) -> Result<Option<TotpSecretRecord>> {
        Ok(self.lock()?.get(&admin_id).cloned())
    }

    async fn set_state(&self, admin_id: Uuid, state: EnrollmentState) -> Result<()> {
        if let Some(record) = self.lock()?.get_mut(&admin_id) {
            record.state = state;
        }
        Ok(())
    }

    async fn consume_backup_code(&self, admin_id: Uuid, code: &str) -> Result<bool> {
        let mut records = self.lock()?;
        let Some(record) = records.get_mut(&admin_id) else {
            return Ok(false);
        };

        for backup_code in record.backup_codes.iter_mut().filter(|c| !c.used) {
            if backup::verify_backup_code(code, &backup_code.hash).unwrap_or(false) {
                backup_code.used = true;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn wipe(&self, admin_id: Uuid) -> Result<()> {
        if let Some(record) = self.lock()?.get_mut(&admin_id) {
            record.encrypted_secret = None;
            record.backup_codes.clear();
            record.state = EnrollmentState::Disabled;
        }
        Ok(())
    }
}

/// PostgreSQL-backed store. Blob fields are persisted as base64 columns
/// alongside the key version; backup codes live in their own table with a
/// `used_at` timestamp consumed via `UPDATE ... RETURNING`.
#[derive(Clone, Debug)]
pub struct PgSecretStore {
    pool: PgPool,
}

impl PgSecretStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SecretStore for PgSecretStore {
    async fn save(&self, record: TotpSecretRecord) -> Result<()> {
        let encoded = record.encrypted_secret.as_ref().map(EncryptedBlob::to_encoded);
        let mut tx = self.pool.begin().await?;

        // Replace any previous enrollment wholesale.
        sqlx::query("DELETE FROM totp_backup_codes WHERE admin_id = $1")
            .bind(record.admin_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r"
            INSERT INTO totp_secrets
            (admin_id, state, salt, iv, ciphertext, auth_tag, key_version, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (admin_id) DO UPDATE
            SET state = $2,
                salt = $3,
                iv = $4,
                ciphertext = $5,
                auth_tag = $6,
                key_version = $7,
                created_at = $8
            ",
        )
        .bind(record.admin_id)
        .bind(record.state.as_str())
        .bind(encoded.as_ref().map(|e| e.salt.clone()))
        .bind(encoded.as_ref().map(|e| e.iv.clone()))
        .bind(encoded.as_ref().map(|e| e.ciphertext.clone()))
        .bind(encoded.as_ref().map(|e| e.auth_tag.clone()))
        .bind(encoded.as_ref().map(|e| i32::try_from(e.key_version).unwrap_or(0)))
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to upsert TOTP secret")?;

        for code in &record.backup_codes {
            sqlx::query(
                r"
                INSERT INTO totp_backup_codes (admin_id, code_hash, used_at)
                VALUES ($1, $2, $3)
                ",
            )
            .bind(record.admin_id)
            .bind(&code.hash)
            .bind(code.used.then(Utc::now))
            .execute(&mut *tx)
            .await
            .context("Failed to insert backup code")?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load(&self, admin_id: Uuid) -> Result<Option<TotpSecretRecord>> {
        let Some(row) = sqlx::query(
            r"
            SELECT state, salt, iv, ciphertext, auth_tag, key_version, created_at
            FROM totp_secrets
            WHERE admin_id = $1
            ",
        )
        .bind(admin_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch TOTP secret")?
        else {
            return Ok(None);
        };

        let state_text: String = row.try_get("state")?;
        let state = EnrollmentState::from_str(&state_text)
            .ok_or_else(|| anyhow::anyhow!("invalid totp_secrets.state value"))?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;

        let salt: Option<String> = row.try_get("salt")?;
        let encrypted_secret = match salt {
            Some(salt) => {
                let key_version: i32 = row.try_get("key_version")?;
                let encoded = EncodedBlob {
                    salt,
                    iv: row.try_get("iv")?,
                    ciphertext: row.try_get("ciphertext")?,
                    auth_tag: row.try_get("auth_tag")?,
                    key_version: u32::try_from(key_version).unwrap_or(0),
                };
                Some(
                    EncryptedBlob::from_encoded(&encoded)
                        .map_err(|_| anyhow::anyhow!("stored TOTP blob is malformed"))?,
                )
            }
            None => None,
        };

        let code_rows = sqlx::query(
            "SELECT code_hash, used_at FROM totp_backup_codes WHERE admin_id = $1",
        )
        .bind(admin_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch backup codes")?;

        let backup_codes = code_rows
            .into_iter()
            .map(|row| {
                let used_at: Option<DateTime<Utc>> = row.try_get("used_at")?;
                Ok(BackupCode {
                    hash: row.try_get("code_hash")?,
                    used: used_at.is_some(),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(Some(TotpSecretRecord {
            admin_id,
            state,
            encrypted_secret,
            backup_codes,
            created_at,
        }))
    }

    async fn set_state(&self, admin_id: Uuid, state: EnrollmentState) -> Result<()> {
        sqlx::query("UPDATE totp_secrets SET state = $2 WHERE admin_id = $1")
            .bind(admin_id)
            .bind(state.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to update enrollment state")?;
        Ok(())
    }

    async fn consume_backup_code(&self, admin_id: Uuid, code: &str) -> Result<bool> {
        let rows = sqlx::query(
            r"
            SELECT code_hash
            FROM totp_backup_codes
            WHERE admin_id = $1
              AND used_at IS NULL
            ",
        )
        .bind(admin_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list backup codes")?;

        for row in rows {
            let hash: String = row.try_get("code_hash")?;
            if !backup::verify_backup_code(code, &hash).unwrap_or(false) {
                continue;
            }
            // The WHERE clause re-checks used_at, so a concurrent consume of
            // the same code wins on exactly one side.
            let consumed = sqlx::query(
                r"
                UPDATE totp_backup_codes
                SET used_at = NOW()
                WHERE admin_id = $1
                  AND code_hash = $2
                  AND used_at IS NULL
                RETURNING admin_id
                ",
            )
            .bind(admin_id)
            .bind(&hash)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to consume backup code")?;
            return Ok(consumed.is_some());
        }
        Ok(false)
    }

    async fn wipe(&self, admin_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM totp_backup_codes WHERE admin_id = $1")
            .bind(admin_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r"
            UPDATE totp_secrets
            SET state = $2,
                salt = NULL,
                iv = NULL,
                ciphertext = NULL,
                auth_tag = NULL
            WHERE admin_id = $1
            ",
        )
        .bind(admin_id)
        .bind(EnrollmentState::Disabled.as_str())
        .execute(&mut *tx)
        .await
        .context("Failed to wipe TOTP secret")?;

        tx.commit().await?;
        Ok(())
    }
}
