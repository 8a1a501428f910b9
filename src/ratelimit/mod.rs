//! Failure rate limiting and lockout for verification attempts.
//!
//! Lockout state is tracked per `(admin_id, ip)` pair: after `max_failures`
//! consecutive failures inside a rolling window the pair is locked for the
//! configured duration. A success at any point resets the counter. The
//! check-and-update is atomic in both backends, so two concurrent failures
//! cannot both read a stale counter and under-count.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use std::{collections::HashMap, sync::Arc, sync::Mutex};
use tracing::{error, info};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};

/// Lockout thresholds. Defaults: 5 failures within 15 minutes lock the pair
/// for 15 minutes.
#[derive(Clone, Copy, Debug)]
pub struct LockoutPolicy {
    pub max_failures: u32,
    pub window: std::time::Duration,
    pub lockout: std::time::Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window: std::time::Duration::from_secs(15 * 60),
            lockout: std::time::Duration::from_secs(15 * 60),
        }
    }
}

impl LockoutPolicy {
    fn window_chrono(&self) -> Duration {
        Duration::from_std(self.window).unwrap_or_else(|_| Duration::minutes(15))
    }

    fn lockout_chrono(&self) -> Duration {
        Duration::from_std(self.lockout).unwrap_or_else(|_| Duration::minutes(15))
    }
}

/// Outcome of consulting the limiter before an attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gate {
    Allowed,
    Locked { retry_after_seconds: u64 },
}

/// Per-pair lockout state. Created on first failure, reset to absent on
/// success, expired once `locked_until` passes.
#[derive(Clone, Copy, Debug)]
pub struct LockoutState {
    pub failure_count: u32,
    pub window_start: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Gate check before an attempt. Never counts the attempt itself, but
    /// may drop expired lock state.
    async fn check(&self, admin_id: Uuid, ip: &str) -> Result<Gate>;

    /// Atomically counts one failure, starting the lock when the threshold
    /// is reached inside the window.
    async fn record_failure(&self, admin_id: Uuid, ip: &str) -> Result<()>;

    /// Resets the counter for the pair.
    async fn record_success(&self, admin_id: Uuid, ip: &str) -> Result<()>;

    /// Removes pairs that are neither locked nor inside an active failure
    /// window. Sub-threshold entries would otherwise accumulate forever,
    /// and `ip` comes from client-suppliable forwarding headers. Returns
    /// the number of entries removed.
    async fn prune_stale(&self) -> Result<u64>;
}

type SubjectKey = (Uuid, String);

/// Mutex-guarded in-process limiter. One lock guards the whole
/// read-modify-write, which is the atomicity the policy requires.
pub struct MemoryRateLimiter {
    policy: LockoutPolicy,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<SubjectKey, LockoutState>>,
}

impl MemoryRateLimiter {
    #[must_use]
    pub fn new(policy: LockoutPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(policy: LockoutPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<SubjectKey, LockoutState>>> {
        self.states
            .lock()
            .map_err(|_| anyhow::anyhow!("lockout state lock poisoned"))
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(&self, admin_id: Uuid, ip: &str) -> Result<Gate> {
        let now = self.clock.now();
        let key = (admin_id, ip.to_string());
        let mut states = self.lock()?;

        match states.get(&key) {
            Some(state) => match state.locked_until {
                Some(until) if until > now => {
                    let remaining = (until - now).num_seconds().max(1);
                    Ok(Gate::Locked {
                        retry_after_seconds: u64::try_from(remaining).unwrap_or(0),
                    })
                }
                Some(_) => {
                    // Lock expired; drop the stale state.
                    states.remove(&key);
                    Ok(Gate::Allowed)
                }
                None => Ok(Gate::Allowed),
            },
            None => Ok(Gate::Allowed),
        }
    }

    async fn record_failure(&self, admin_id: Uuid, ip: &str) -> Result<()> {
        let now = self.clock.now();
        let key = (admin_id, ip.to_string());
        let mut states = self.lock()?;

        let state = states.entry(key).or_insert(LockoutState {
            failure_count: 0,
            window_start: now,
            locked_until: None,
        });

        if now - state.window_start > self.policy.window_chrono() {
            state.failure_count = 0;
            state.window_start = now;
        }

        state.failure_count += 1;
        if state.failure_count >= self.policy.max_failures {
            state.locked_until = Some(now + self.policy.lockout_chrono());
        }

        Ok(())
    }

    async fn record_success(&self, admin_id: Uuid, ip: &str) -> Result<()> {
        self.lock()?.remove(&(admin_id, ip.to_string()));
        Ok(())
    }

    async fn prune_stale(&self) -> Result<u64> {
        let now = self.clock.now();
        let window = self.policy.window_chrono();
        let mut states = self.lock()?;

        let before = states.len();
        states.retain(|_, state| {
            state.locked_until.is_some_and(|until| until > now)
                || now - state.window_start <= window
        });
        Ok((before - states.len()) as u64)
    }
}

/// PostgreSQL-backed limiter synchronizing lockout across service
/// instances. The failure path is a single `INSERT ... ON CONFLICT`
/// statement so concurrent failures serialize on the row.
#[derive(Clone, Debug)]
pub struct PgRateLimiter {
    policy: LockoutPolicy,
    pool: PgPool,
}

impl PgRateLimiter {
    #[must_use]
    pub fn new(policy: LockoutPolicy, pool: PgPool) -> Self {
        Self { policy, pool }
    }
}

#[async_trait]
impl RateLimiter for PgRateLimiter {
    async fn check(&self, admin_id: Uuid, ip: &str) -> Result<Gate> {
        let row = sqlx::query(
            r"
            SELECT locked_until
            FROM lockout_states
            WHERE admin_id = $1 AND ip = $2
            ",
        )
        .bind(admin_id)
        .bind(ip)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read lockout state")?;

        let Some(row) = row else {
            return Ok(Gate::Allowed);
        };
        let locked_until: Option<DateTime<Utc>> = row.try_get("locked_until")?;

        match locked_until {
            Some(until) if until > Utc::now() => {
                let remaining = (until - Utc::now()).num_seconds().max(1);
                Ok(Gate::Locked {
                    retry_after_seconds: u64::try_from(remaining).unwrap_or(0),
                })
            }
            Some(_) => {
                sqlx::query("DELETE FROM lockout_states WHERE admin_id = $1 AND ip = $2")
                    .bind(admin_id)
                    .bind(ip)
                    .execute(&self.pool)
                    .await
                    .context("Failed to expire lockout state")?;
                Ok(Gate::Allowed)
            }
            None => Ok(Gate::Allowed),
        }
    }

    async fn record_failure(&self, admin_id: Uuid, ip: &str) -> Result<()> {
        let window = format!("{} seconds", self.policy.window.as_secs());
        let lockout = format!("{} seconds", self.policy.lockout.as_secs());

        // Counter reset, increment, and lock trigger happen in one
        // statement; concurrent failures serialize on the conflict target.
        sqlx::query(
            r"
            INSERT INTO lockout_states (admin_id, ip, failure_count, window_start, locked_until)
            VALUES ($1, $2, 1, NOW(), NULL)
            ON CONFLICT (admin_id, ip) DO UPDATE
            SET failure_count = CASE
                    WHEN lockout_states.window_start < NOW() - $3::interval THEN 1
                    ELSE lockout_states.failure_count + 1
                END,
                window_start = CASE
                    WHEN lockout_states.window_start < NOW() - $3::interval THEN NOW()
                    ELSE lockout_states.window_start
                END,
                locked_until = CASE
                    WHEN (CASE
                            WHEN lockout_states.window_start < NOW() - $3::interval THEN 1
                            ELSE lockout_states.failure_count + 1
                          END) >= $4 THEN NOW() + $5::interval
                    ELSE lockout_states.locked_until
                END
            ",
        )
        .bind(admin_id)
        .bind(ip)
        .bind(window)
        .bind(i64::from(self.policy.max_failures))
        .bind(lockout)
        .execute(&self.pool)
        .await
        .context("Failed to record verification failure")?;

        Ok(())
    }

    async fn record_success(&self, admin_id: Uuid, ip: &str) -> Result<()> {
        sqlx::query("DELETE FROM lockout_states WHERE admin_id = $1 AND ip = $2")
            .bind(admin_id)
            .bind(ip)
            .execute(&self.pool)
            .await
            .context("Failed to reset lockout state")?;
        Ok(())
    }

    async fn prune_stale(&self) -> Result<u64> {
        let window = format!("{} seconds", self.policy.window.as_secs());
        let result = sqlx::query(
            r"
            DELETE FROM lockout_states
            WHERE (locked_until IS NULL OR locked_until < NOW())
              AND window_start < NOW() - $1::interval
            ",
        )
        .bind(window)
        .execute(&self.pool)
        .await
        .context("Failed to prune lockout states")?;
        Ok(result.rows_affected())
    }
}

/// Background worker dropping expired lockout entries. Without it, every
/// `(admin_id, ip)` pair that fails fewer than `max_failures` times leaves
/// a row behind for good.
pub fn spawn_lockout_sweeper(limiter: Arc<dyn RateLimiter>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match limiter.prune_stale().await {
                Ok(0) => {}
                Ok(removed) => info!("Pruned {removed} stale lockout entries"),
                Err(err) => error!("Lockout state pruning failed: {err}"),
            }
        }
    });
}
