//! Append-only security audit log and dashboard aggregation.
//!
//! Every enrollment, verification, backup-code, and disable attempt is
//! recorded as an immutable [`SecurityEvent`]. The log feeds the operations
//! dashboard (trailing-24h stats, recent events) and is pruned by a
//! retention worker. Lockout correctness never depends on this log; it
//! lives in its own store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};
use tracing::{error, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};

/// Default retention horizon for pruning.
pub const DEFAULT_RETENTION: std::time::Duration = std::time::Duration::from_secs(90 * 24 * 60 * 60);

const STATS_WINDOW_HOURS: i64 = 24;

/// The closed set of auditable actions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SecurityAction {
    Generate,
    Verify,
    BackupUsed,
    Disabled,
}

impl SecurityAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Verify => "verify",
            Self::BackupUsed => "backup_used",
            Self::Disabled => "disabled",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim() {
            "generate" => Some(Self::Generate),
            "verify" => Some(Self::Verify),
            "backup_used" => Some(Self::BackupUsed),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// One security event. Immutable once written.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct SecurityEvent {
    pub admin_id: Uuid,
    pub ip: String,
    pub user_agent: Option<String>,
    pub action: SecurityAction,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Aggregates over the trailing 24-hour window.
#[derive(Clone, Copy, Debug, Default, Serialize, ToSchema)]
pub struct WindowStats {
    pub attempts: u64,
    pub successes: u64,
    pub success_rate: f64,
    pub unique_ips: u64,
    pub unique_admins: u64,
}

/// Dashboard statistics: trailing-24h window plus all-time totals.
#[derive(Clone, Copy, Debug, Default, Serialize, ToSchema)]
pub struct SecurityStats {
    pub last_24h: WindowStats,
    pub total_events: u64,
    pub oldest_event: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, event: SecurityEvent) -> Result<()>;

    /// Aggregates for events newer than `window_start`, plus all-time totals.
    async fn stats(&self, window_start: DateTime<Utc>) -> Result<SecurityStats>;

    /// Most recent events, newest first, bounded by `limit`.
    async fn recent(&self, limit: usize) -> Result<Vec<SecurityEvent>>;

    /// Deletes events older than `cutoff`; returns the number removed.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// In-process append-only store.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    events: Mutex<Vec<SecurityEvent>>,
}

impl MemoryAuditStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<SecurityEvent>>> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("audit log lock poisoned"))
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, event: SecurityEvent) -> Result<()> {
        self.lock()?.push(event);
        Ok(())
    }

    async fn stats(&self, window_start: DateTime<Utc>) -> Result<SecurityStats> {
        let events = self.lock()?;

        let mut window = WindowStats::default();
        let mut ips = HashSet::new();
        let mut admins = HashSet::new();
        for event in events.iter().filter(|e| e.timestamp > window_start) {
            window.attempts += 1;
            if event.success {
                window.successes += 1;
            }
            ips.insert(event.ip.clone());
            admins.insert(event.admin_id);
        }
        window.unique_ips = ips.len() as u64;
        window.unique_admins = admins.len() as u64;
        if window.attempts > 0 {
            window.success_rate = window.successes as f64 / window.attempts as f64;
        }

        Ok(SecurityStats {
            last_24h: window,
            total_events: events.len() as u64,
            oldest_event: events.iter().map(|e| e.timestamp).min(),
        })
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SecurityEvent>> {
        let events = self.lock()?;
        let mut recent: Vec<SecurityEvent> = events.iter().cloned().collect();
        recent.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        recent.truncate(limit);
        Ok(recent)
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut events = self.lock()?;
        let before = events.len();
        events.retain(|e| e.timestamp >= cutoff);
        Ok((before - events.len()) as u64)
    }
}

/// PostgreSQL-backed store.
#[derive(Clone, Debug)]
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn append(&self, event: SecurityEvent) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO security_events (admin_id, ip, user_agent, action, success, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(event.admin_id)
        .bind(&event.ip)
        .bind(event.user_agent.as_deref())
        .bind(event.action.as_str())
        .bind(event.success)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await
        .context("Failed to write security event")?;
        Ok(())
    }

    async fn stats(&self, window_start: DateTime<Utc>) -> Result<SecurityStats> {
        let window_row = sqlx::query(
            r"
            SELECT COUNT(*) AS attempts,
                   COUNT(*) FILTER (WHERE success) AS successes,
                   COUNT(DISTINCT ip) AS unique_ips,
                   COUNT(DISTINCT admin_id) AS unique_admins
            FROM security_events
            WHERE created_at > $1
            ",
        )
        .bind(window_start)
        .fetch_one(&self.pool)
        .await
        .context("Failed to aggregate security events")?;

        let attempts: i64 = window_row.try_get("attempts")?;
        let successes: i64 = window_row.try_get("successes")?;
        let unique_ips: i64 = window_row.try_get("unique_ips")?;
        let unique_admins: i64 = window_row.try_get("unique_admins")?;

        let totals_row = sqlx::query(
            "SELECT COUNT(*) AS total, MIN(created_at) AS oldest FROM security_events",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to count security events")?;

        let total: i64 = totals_row.try_get("total")?;
        let oldest: Option<DateTime<Utc>> = totals_row.try_get("oldest")?;

        let attempts_u64 = u64::try_from(attempts).unwrap_or(0);
        let successes_u64 = u64::try_from(successes).unwrap_or(0);
        let success_rate = if attempts_u64 > 0 {
            successes_u64 as f64 / attempts_u64 as f64
        } else {
            0.0
        };

        Ok(SecurityStats {
            last_24h: WindowStats {
                attempts: attempts_u64,
                successes: successes_u64,
                success_rate,
                unique_ips: u64::try_from(unique_ips).unwrap_or(0),
                unique_admins: u64::try_from(unique_admins).unwrap_or(0),
            },
            total_events: u64::try_from(total).unwrap_or(0),
            oldest_event: oldest,
        })
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SecurityEvent>> {
        let rows = sqlx::query(
            r"
            SELECT admin_id, ip, user_agent, action, success, created_at
            FROM security_events
            ORDER BY created_at DESC
            LIMIT $1
            ",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list recent security events")?;

        rows.into_iter()
            .map(|row| {
                let action_text: String = row.try_get("action")?;
                let action = SecurityAction::from_str(&action_text)
                    .ok_or_else(|| anyhow::anyhow!("invalid security_events.action value"))?;
                Ok(SecurityEvent {
                    admin_id: row.try_get("admin_id")?,
                    ip: row.try_get("ip")?,
                    user_agent: row.try_get("user_agent")?,
                    action,
                    success: row.try_get("success")?,
                    timestamp: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM security_events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to prune security events")?;
        Ok(result.rows_affected())
    }
}

/// Facade over an [`AuditStore`]. Write failures are logged and swallowed:
/// an audit outage must never abort the caller's attempt.
#[derive(Clone)]
pub struct SecurityAuditLog {
    store: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
}

impl SecurityAuditLog {
    #[must_use]
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(store: Arc<dyn AuditStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Appends an event for the attempt that just happened.
    pub async fn record(
        &self,
        admin_id: Uuid,
        ip: &str,
        user_agent: Option<&str>,
        action: SecurityAction,
        success: bool,
    ) {
        let event = SecurityEvent {
            admin_id,
            ip: ip.to_string(),
            user_agent: user_agent.map(str::to_string),
            action,
            success,
            timestamp: self.clock.now(),
        };
        if let Err(err) = self.store.append(event).await {
            error!("Failed to record security event: {err}");
        }
    }

    /// Dashboard statistics over the trailing 24 hours plus all-time totals.
    ///
    /// # Errors
    /// Returns an error if the backing store query fails.
    pub async fn stats(&self) -> Result<SecurityStats> {
        let window_start = self.clock.now() - Duration::hours(STATS_WINDOW_HOURS);
        self.store.stats(window_start).await
    }

    /// Most recent events, newest first.
    ///
    /// # Errors
    /// Returns an error if the backing store query fails.
    pub async fn recent(&self, limit: usize) -> Result<Vec<SecurityEvent>> {
        self.store.recent(limit).await
    }

    /// Removes events older than the retention horizon.
    ///
    /// # Errors
    /// Returns an error if the backing store delete fails.
    pub async fn prune(&self, retention: std::time::Duration) -> Result<u64> {
        let cutoff = self.clock.now()
            - Duration::from_std(retention).unwrap_or_else(|_| Duration::days(90));
        self.store.prune(cutoff).await
    }
}

/// Background worker pruning events past the retention horizon. Pruning is
/// independent of the lockout mechanism, which keeps its own state.
pub fn spawn_retention_worker(
    log: SecurityAuditLog,
    retention: std::time::Duration,
    interval: std::time::Duration,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match log.prune(retention).await {
                Ok(0) => {}
                Ok(removed) => info!("Pruned {removed} expired security events"),
                Err(err) => error!("Audit retention pruning failed: {err}"),
            }
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;

    fn event(admin_id: Uuid, ip: &str, success: bool, at: DateTime<Utc>) -> SecurityEvent {
        SecurityEvent {
            admin_id,
            ip: ip.to_string(),
            user_agent: Some("test-agent".to_string()),
            action: SecurityAction::Verify,
            success,
            timestamp: at,
        }
    }

    #[test]
    fn events_round_trip_through_json() {
        let admin_id = Uuid::new_v4();
        let original = event(admin_id, "10.0.0.1", true, Utc::now());

        let json = serde_json::to_string(&original).unwrap();
        assert!(json.contains(&admin_id.to_string()));
        assert!(json.contains("\"verify\""));

        let decoded: SecurityEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.admin_id, admin_id);
        assert_eq!(decoded.action, SecurityAction::Verify);
    }

    #[test]
    fn action_round_trips_through_str() {
        for action in [
            SecurityAction::Generate,
            SecurityAction::Verify,
            SecurityAction::BackupUsed,
            SecurityAction::Disabled,
        ] {
            assert_eq!(SecurityAction::from_str(action.as_str()), Some(action));
        }
        assert_eq!(SecurityAction::from_str("other"), None);
    }

    #[tokio::test]
    async fn stats_cover_window_and_all_time() {
        let store = MemoryAuditStore::new();
        let now = Utc::now();
        let admin_a = Uuid::new_v4();
        let admin_b = Uuid::new_v4();

        store.append(event(admin_a, "10.0.0.1", true, now)).await.unwrap();
        store.append(event(admin_a, "10.0.0.1", false, now)).await.unwrap();
        store.append(event(admin_b, "10.0.0.2", true, now)).await.unwrap();
        // Outside the 24h window, still counted all-time.
        let old = now - Duration::days(2);
        store.append(event(admin_b, "10.0.0.3", false, old)).await.unwrap();

        let stats = store.stats(now - Duration::hours(24)).await.unwrap();
        assert_eq!(stats.last_24h.attempts, 3);
        assert_eq!(stats.last_24h.successes, 2);
        assert!((stats.last_24h.success_rate - 2.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(stats.last_24h.unique_ips, 2);
        assert_eq!(stats.last_24h.unique_admins, 2);
        assert_eq!(stats.total_events, 4);
        assert_eq!(stats.oldest_event, Some(old));
    }

    #[tokio::test]
    async fn recent_is_bounded_and_newest_first() {
        let store = MemoryAuditStore::new();
        let now = Utc::now();
        let admin_id = Uuid::new_v4();

        for idx in 0..5 {
            store
                .append(event(admin_id, "10.0.0.1", true, now + Duration::seconds(idx)))
                .await
                .unwrap();
        }

        let recent = store.recent(3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent.first().unwrap().timestamp, now + Duration::seconds(4));
    }

    #[tokio::test]
    async fn prune_removes_only_expired_events() {
        let store = MemoryAuditStore::new();
        let now = Utc::now();
        let admin_id = Uuid::new_v4();

        store.append(event(admin_id, "10.0.0.1", true, now)).await.unwrap();
        store
            .append(event(admin_id, "10.0.0.1", true, now - Duration::days(100)))
            .await
            .unwrap();

        let removed = store.prune(now - Duration::days(90)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.recent(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn facade_stamps_events_with_clock_time() {
        let now = Utc::now();
        let clock = FixedClock::at(now);
        let store = Arc::new(MemoryAuditStore::new());
        let log = SecurityAuditLog::with_clock(store.clone(), Arc::new(clock));
        let admin_id = Uuid::new_v4();

        log.record(admin_id, "10.0.0.1", None, SecurityAction::Generate, true)
            .await;

        let recent = store.recent(1).await.unwrap();
        assert_eq!(recent.first().unwrap().timestamp, now);
    }
}
