//! End-to-end flows through a fully wired `WardenCore`.

use std::sync::Arc;
use std::time::Duration;

use warden_core::auth::{MfaMethod, MfaSetupOptions};
use warden_core::config::{PasswordHashingConfig, SecurityConfig, TimingBudgets};
use warden_core::platform::{
    DelayedPush, MemoryKeystore, MemoryRemoteStore, Platform, RecordingEmail, RemotePersistence,
    StaticBiometric,
};
use warden_core::time::ManualClock;
use warden_core::{Error, RoundConfig, StructuredError, WardenCore};

struct Harness {
    core: WardenCore,
    clock: Arc<ManualClock>,
    email: Arc<RecordingEmail>,
    remote: Arc<MemoryRemoteStore>,
}

fn harness() -> Harness {
    let mut config = SecurityConfig {
        timing: TimingBudgets::relaxed(),
        ..SecurityConfig::default()
    };
    config.auth.password_hashing = PasswordHashingConfig::fast();

    let clock = Arc::new(ManualClock::starting_now());
    let email = Arc::new(RecordingEmail::new());
    let remote = Arc::new(MemoryRemoteStore::new());
    let platform = Platform {
        keystore: Arc::new(MemoryKeystore::new()),
        biometric: Arc::new(StaticBiometric::accepting()),
        push: Arc::new(DelayedPush::new(Duration::from_millis(5))),
        email: email.clone(),
        remote: Some(remote.clone()),
    };

    let core = WardenCore::with_clock(config, platform, clock.clone()).unwrap();
    Harness {
        core,
        clock,
        email,
        remote,
    }
}

const QUESTIONS: &[(&str, &str)] = &[("Favourite colour?", "Teal")];

#[tokio::test]
async fn test_login_mfa_logout() {
    let h = harness();
    let account = h
        .core
        .accounts()
        .register("dana", "s3cret-pass", "dana@example.com", QUESTIONS)
        .await
        .unwrap();

    let session = h.core.accounts().login("dana", "s3cret-pass", true).await.unwrap();
    assert!(session.biometric_verified);
    assert!(!session.mfa_verified);

    let settings = h
        .core
        .mfa()
        .setup_mfa(
            &account.user_id,
            MfaSetupOptions {
                enable_totp: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let code = h
        .core
        .mfa()
        .current_totp(settings.totp_secret.as_deref().unwrap())
        .unwrap();
    assert!(h
        .core
        .mfa()
        .verify_mfa(&account.user_id, MfaMethod::Totp, Some(&code))
        .await
        .unwrap());

    let reloaded = h.core.sessions().get_session(&session.token).await.unwrap().unwrap();
    assert!(reloaded.mfa_verified);

    h.core.accounts().logout(&session.token).await.unwrap();
    assert!(!h.core.sessions().validate_session(&session.token).await.unwrap());

    h.core.storage().clear_cache();
    let again = h.core.accounts().login("dana", "s3cret-pass", false).await.unwrap();
    assert!(h.core.sessions().validate_session(&again.token).await.unwrap());
}

#[tokio::test]
async fn test_sixth_login_evicts_oldest() {
    let h = harness();
    let account = h
        .core
        .accounts()
        .register("dana", "pw", "dana@example.com", &[])
        .await
        .unwrap();

    let mut tokens = Vec::new();
    for _ in 0..6 {
        let session = h.core.accounts().login("dana", "pw", false).await.unwrap();
        tokens.push(session.token);
    }

    let active = h.core.sessions().get_active_sessions(&account.user_id).await;
    assert_eq!(active, tokens[1..].to_vec());
    assert!(!h.core.sessions().validate_session(&tokens[0]).await.unwrap());
}

#[tokio::test]
async fn test_lockout_window() {
    let h = harness();
    h.core
        .accounts()
        .register("dana", "pw", "dana@example.com", &[])
        .await
        .unwrap();

    let mut last = None;
    for _ in 0..5 {
        last = h.core.accounts().login("dana", "nope", false).await.err();
    }
    assert!(matches!(last, Some(Error::AccountLocked { .. })));

    h.clock.advance(Duration::from_secs(14 * 60));
    let err = h.core.accounts().login("dana", "pw", false).await.unwrap_err();
    assert_eq!(err.code(), "ACCOUNT_LOCKED");
    let structured = StructuredError::from(err);
    assert_eq!(structured.code, "ACCOUNT_LOCKED");

    h.clock.advance(Duration::from_secs(61));
    h.core.accounts().login("dana", "pw", false).await.unwrap();
}

#[tokio::test]
async fn test_backup_code_is_one_time() {
    let h = harness();
    let settings = h
        .core
        .mfa()
        .setup_mfa("user-7", MfaSetupOptions::default())
        .await
        .unwrap();
    let code = settings.backup_codes[0].clone();

    assert!(h.core.mfa().verify_backup_code("user-7", &code).await.unwrap());
    assert!(!h.core.mfa().verify_backup_code("user-7", &code).await.unwrap());
    assert!(h
        .core
        .mfa()
        .verify_mfa("user-7", MfaMethod::Backup, Some(&settings.backup_codes[1]))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_password_recovery_pushes_blob() {
    let h = harness();
    let account = h
        .core
        .accounts()
        .register("dana", "forgotten", "dana@example.com", QUESTIONS)
        .await
        .unwrap();

    h.core
        .recovery()
        .initiate_recovery("dana", "dana@example.com")
        .await
        .unwrap();
    let token = h.email.last_token_for("dana@example.com").unwrap();

    h.core
        .recovery()
        .reset_password(&token, &["teal"], "remembered")
        .await
        .unwrap();
    h.core.accounts().login("dana", "remembered", false).await.unwrap();

    let blob = h.remote.get_blob(&account.user_id).await.unwrap().unwrap();
    let frame = String::from_utf8(blob).unwrap();
    let opened: serde_json::Value = h.core.security().decrypt_data(&frame).unwrap();
    assert_eq!(opened["username"], "dana");
}

#[tokio::test]
async fn test_expired_sessions_swept() {
    let h = harness();
    h.core
        .accounts()
        .register("dana", "pw", "dana@example.com", &[])
        .await
        .unwrap();
    let session = h.core.accounts().login("dana", "pw", false).await.unwrap();

    h.clock.advance(Duration::from_secs(2 * 60 * 60));
    assert_eq!(h.core.sessions().cleanup_expired_sessions().await, 1);
    assert!(h.core.sessions().get_session(&session.token).await.unwrap().is_none());
    assert!(h
        .core
        .sessions()
        .get_active_sessions(&session.user_id)
        .await
        .is_empty());
}

#[tokio::test]
async fn test_aggregation_through_facade() {
    let h = harness();
    let security = h.core.security();
    let round_id = security
        .initialize_round(RoundConfig::new(3, 3, Duration::from_secs(60)))
        .unwrap();

    security.participate_in_aggregation(&round_id, "p1", &[1.0, 10.0]).unwrap();
    security.participate_in_aggregation(&round_id, "p2", &[2.0, 20.0]).unwrap();
    let err = security.finalize_round(&round_id).unwrap_err();
    assert_eq!(err.code(), "THRESHOLD_NOT_MET");

    security.participate_in_aggregation(&round_id, "p3", &[3.0, 30.0]).unwrap();
    let aggregate = security.finalize_round(&round_id).unwrap();
    let sum = security.decrypt_aggregate(&round_id, &aggregate).unwrap();

    assert!((sum[0] - 6.0).abs() <= 1.0);
    assert!((sum[1] - 60.0).abs() <= 1.0);
    assert!(security.get_round_status(&round_id).is_none());
}
