//! End-to-end flows over in-process stores: lockout behaviour, backup code
//! consumption, and dashboard statistics.

use std::sync::Arc;

use chrono::{Duration, Utc};
use secrecy::SecretString;
use tessera::{
    audit::{MemoryAuditStore, SecurityAuditLog},
    clock::{Clock, FixedClock},
    crypto::{EnvelopeCipher, MasterKey},
    ratelimit::{LockoutPolicy, MemoryRateLimiter},
    totp::{MemorySecretStore, TotpService, VerifyOutcome},
};
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

struct Harness {
    service: TotpService,
    clock: FixedClock,
    audit: SecurityAuditLog,
}

fn harness() -> Harness {
    let clock = FixedClock::at(Utc::now());
    let master = MasterKey::from_secret(SecretString::from(
        "integration-test-secret-0123456789-abcdefghij",
    ))
    .unwrap();
    let audit = SecurityAuditLog::with_clock(
        Arc::new(MemoryAuditStore::new()),
        Arc::new(clock.clone()),
    );
    let limiter = Arc::new(MemoryRateLimiter::with_clock(
        LockoutPolicy::default(),
        Arc::new(clock.clone()),
    ));
    let service = TotpService::with_clock(
        EnvelopeCipher::new(master),
        Arc::new(MemorySecretStore::new()),
        limiter,
        audit.clone(),
        "Tessera".to_string(),
        Arc::new(clock.clone()),
    );
    Harness {
        service,
        clock,
        audit,
    }
}

fn code_at(secret_base32: &str, at_unix: u64) -> String {
    let secret_bytes = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .unwrap();
    let totp = TOTP::new(Algorithm::SHA1, 6, 1, 30, secret_bytes, None, "test".to_string()).unwrap();
    totp.generate(at_unix)
}

#[tokio::test]
async fn five_failures_lock_out_even_a_correct_code() {
    let h = harness();
    let admin_id = Uuid::new_v4();
    let enrollment = h
        .service
        .generate_secret(admin_id, "10.0.0.1", None)
        .await
        .unwrap();

    for _ in 0..5 {
        assert_eq!(
            h.service
                .verify(admin_id, "10.0.0.1", None, "000000")
                .await
                .unwrap(),
            VerifyOutcome::InvalidCode
        );
    }

    // The sixth attempt is rejected before the code is even inspected.
    let correct = code_at(&enrollment.secret_base32, h.clock.now_unix());
    let outcome = h
        .service
        .verify(admin_id, "10.0.0.1", None, &correct)
        .await
        .unwrap();
    let VerifyOutcome::LockedOut {
        retry_after_seconds,
    } = outcome
    else {
        panic!("expected lockout, got {outcome:?}");
    };
    assert!(retry_after_seconds > 0);

    // After the lockout expires the same admin may try again.
    h.clock.advance(Duration::minutes(16));
    let correct = code_at(&enrollment.secret_base32, h.clock.now_unix());
    assert_eq!(
        h.service
            .verify(admin_id, "10.0.0.1", None, &correct)
            .await
            .unwrap(),
        VerifyOutcome::Verified
    );
}

#[tokio::test]
async fn successful_verification_resets_the_failure_counter() {
    let h = harness();
    let admin_id = Uuid::new_v4();
    let enrollment = h
        .service
        .generate_secret(admin_id, "10.0.0.1", None)
        .await
        .unwrap();

    for _ in 0..4 {
        h.service
            .verify(admin_id, "10.0.0.1", None, "000000")
            .await
            .unwrap();
    }

    let correct = code_at(&enrollment.secret_base32, h.clock.now_unix());
    assert_eq!(
        h.service
            .verify(admin_id, "10.0.0.1", None, &correct)
            .await
            .unwrap(),
        VerifyOutcome::Verified
    );

    // The counter restarted from zero: four more misses do not lock.
    for _ in 0..4 {
        assert_eq!(
            h.service
                .verify(admin_id, "10.0.0.1", None, "000000")
                .await
                .unwrap(),
            VerifyOutcome::InvalidCode
        );
    }
    let correct = code_at(&enrollment.secret_base32, h.clock.now_unix());
    assert_eq!(
        h.service
            .verify(admin_id, "10.0.0.1", None, &correct)
            .await
            .unwrap(),
        VerifyOutcome::Verified
    );
}

#[tokio::test]
async fn lockout_state_is_tracked_per_ip() {
    let h = harness();
    let admin_id = Uuid::new_v4();
    let enrollment = h
        .service
        .generate_secret(admin_id, "10.0.0.1", None)
        .await
        .unwrap();

    for _ in 0..5 {
        h.service
            .verify(admin_id, "10.0.0.1", None, "000000")
            .await
            .unwrap();
    }
    assert!(matches!(
        h.service
            .verify(admin_id, "10.0.0.1", None, "000000")
            .await
            .unwrap(),
        VerifyOutcome::LockedOut { .. }
    ));

    // A different source address is unaffected.
    let correct = code_at(&enrollment.secret_base32, h.clock.now_unix());
    assert_eq!(
        h.service
            .verify(admin_id, "10.0.0.2", None, &correct)
            .await
            .unwrap(),
        VerifyOutcome::Verified
    );
}

#[tokio::test]
async fn backup_codes_are_single_use() {
    let h = harness();
    let admin_id = Uuid::new_v4();
    let enrollment = h
        .service
        .generate_secret(admin_id, "10.0.0.1", None)
        .await
        .unwrap();

    let code = enrollment.backup_codes[0].clone();
    assert_eq!(
        h.service
            .verify_backup_code(admin_id, "10.0.0.1", None, &code)
            .await
            .unwrap(),
        VerifyOutcome::Verified
    );

    // The same code again is spent.
    assert_eq!(
        h.service
            .verify_backup_code(admin_id, "10.0.0.1", None, &code)
            .await
            .unwrap(),
        VerifyOutcome::InvalidBackupCode
    );

    // The remaining nine still work, with or without the grouping dashes.
    let bare: String = enrollment.backup_codes[1]
        .chars()
        .filter(|c| *c != '-')
        .collect();
    assert_eq!(
        h.service
            .verify_backup_code(admin_id, "10.0.0.1", None, &bare.to_lowercase())
            .await
            .unwrap(),
        VerifyOutcome::Verified
    );
}

#[tokio::test]
async fn concurrent_use_of_one_backup_code_succeeds_exactly_once() {
    let h = harness();
    let admin_id = Uuid::new_v4();
    let enrollment = h
        .service
        .generate_secret(admin_id, "10.0.0.1", None)
        .await
        .unwrap();
    let code = enrollment.backup_codes[0].clone();

    let (a, b) = tokio::join!(
        h.service
            .verify_backup_code(admin_id, "10.0.0.1", None, &code),
        h.service
            .verify_backup_code(admin_id, "10.0.0.2", None, &code),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    let verified = outcomes
        .iter()
        .filter(|o| **o == VerifyOutcome::Verified)
        .count();
    assert_eq!(verified, 1, "outcomes: {outcomes:?}");
    assert!(outcomes.contains(&VerifyOutcome::InvalidBackupCode));
}

#[tokio::test]
async fn dashboard_reflects_the_attempts_just_made() {
    let h = harness();
    let admin_id = Uuid::new_v4();
    let enrollment = h
        .service
        .generate_secret(admin_id, "10.0.0.1", Some("cli"))
        .await
        .unwrap();

    let correct = code_at(&enrollment.secret_base32, h.clock.now_unix());
    h.service
        .verify(admin_id, "10.0.0.1", Some("cli"), &correct)
        .await
        .unwrap();
    h.service
        .verify(admin_id, "10.0.0.2", Some("cli"), "000000")
        .await
        .unwrap();

    let stats = h.audit.stats().await.unwrap();
    assert_eq!(stats.total_events, 3);
    assert_eq!(stats.last_24h.attempts, 3);
    assert_eq!(stats.last_24h.successes, 2);
    assert_eq!(stats.last_24h.unique_admins, 1);
    assert_eq!(stats.last_24h.unique_ips, 2);
    assert!(stats.oldest_event.is_some());

    let recent = h.audit.recent(2).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert!(recent[0].timestamp >= recent[1].timestamp);
}
