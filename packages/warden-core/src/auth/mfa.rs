//! Second-factor settings and verification.
//!
//! | Method | Needs | Check |
//! |--------|-------|-------|
//! | `totp` | 6-digit code | RFC 6238 against the stored secret, ±1 step |
//! | `biometric` | nothing | platform prompt |
//! | `backup` | backup code | matches and consumes one stored code |
//! | `push` | nothing | push challenge approved |
//!
//! A successful verification stamps `last_verified` and flags the user's
//! current login session as MFA-verified. An accepted TOTP step is recorded
//! and codes from that step or earlier are refused afterwards.
//!
//! Operations serialize per user, so a slow push or biometric prompt only
//! holds up that user.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::session::SessionManager;
use super::totp::Totp;
use crate::config::MfaConfig;
use crate::error::{Error, Result};
use crate::platform::{BiometricPrompt, PushDelivery};
use crate::quantum::QuantumKeyExchange;
use crate::storage::{keys, SecureStorage};
use crate::time::Clock;

/// A second-factor method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MfaMethod {
    /// Authenticator app code
    Totp,
    /// Platform biometric prompt
    Biometric,
    /// One-time backup code
    Backup,
    /// Push approval on a trusted device
    Push,
}

impl MfaMethod {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            MfaMethod::Totp => "totp",
            MfaMethod::Biometric => "biometric",
            MfaMethod::Backup => "backup",
            MfaMethod::Push => "push",
        }
    }

    /// Parse from the wire name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "totp" => Some(MfaMethod::Totp),
            "biometric" => Some(MfaMethod::Biometric),
            "backup" => Some(MfaMethod::Backup),
            "push" => Some(MfaMethod::Push),
            _ => None,
        }
    }
}

/// Per-user MFA record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MfaSettings {
    /// Owner
    pub user_id: String,
    /// Whether TOTP is accepted
    pub totp_enabled: bool,
    /// Base64 TOTP secret
    pub totp_secret: Option<String>,
    /// Unused backup codes, formatted `xxxx-xxxx-xxxx-xxxx`
    pub backup_codes: Vec<String>,
    /// Whether biometric prompts are accepted
    pub biometric_enabled: bool,
    /// Whether push approval is accepted
    pub push_enabled: bool,
    /// Last successful verification, Unix milliseconds
    pub last_verified: Option<i64>,
    /// TOTP step of the last accepted code
    #[serde(default)]
    pub last_totp_counter: Option<u64>,
    /// Address for recovery mail
    pub recovery_email: Option<String>,
}

/// Methods to enable at setup
#[derive(Debug, Clone, Default)]
pub struct MfaSetupOptions {
    /// Generate a TOTP secret
    pub enable_totp: bool,
    /// Accept biometric prompts
    pub enable_biometric: bool,
    /// Accept push approvals
    pub enable_push: bool,
    /// Address for recovery mail
    pub recovery_email: Option<String>,
}

/// Partial settings change; `None` leaves a field alone
#[derive(Debug, Clone, Default)]
pub struct MfaSettingsUpdate {
    /// Toggle TOTP; enabling without a secret generates one
    pub totp_enabled: Option<bool>,
    /// Toggle biometric prompts
    pub biometric_enabled: Option<bool>,
    /// Toggle push approvals
    pub push_enabled: Option<bool>,
    /// Replace the recovery address
    pub recovery_email: Option<String>,
}

/// Sets up and verifies second factors
pub struct MfaManager {
    storage: Arc<SecureStorage>,
    sessions: Arc<SessionManager>,
    exchange: Arc<QuantumKeyExchange>,
    biometric: Arc<dyn BiometricPrompt>,
    push: Arc<dyn PushDelivery>,
    clock: Arc<dyn Clock>,
    totp: Totp,
    config: MfaConfig,
    user_locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MfaManager {
    /// Create the manager
    pub fn new(
        config: MfaConfig,
        storage: Arc<SecureStorage>,
        sessions: Arc<SessionManager>,
        exchange: Arc<QuantumKeyExchange>,
        biometric: Arc<dyn BiometricPrompt>,
        push: Arc<dyn PushDelivery>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            totp: Totp::from_config(&config),
            storage,
            sessions,
            exchange,
            biometric,
            push,
            clock,
            config,
            user_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Create or replace the MFA record of `user_id`
    ///
    /// The returned settings carry the TOTP secret and backup codes so the
    /// caller can show them once.
    pub async fn setup_mfa(&self, user_id: &str, options: MfaSetupOptions) -> Result<MfaSettings> {
        let _guard = self.lock_user(user_id).await;

        let totp_secret = if options.enable_totp {
            Some(self.generate_totp_secret()?)
        } else {
            None
        };

        let settings = MfaSettings {
            user_id: user_id.to_string(),
            totp_enabled: options.enable_totp,
            totp_secret,
            backup_codes: self.generate_backup_codes()?,
            biometric_enabled: options.enable_biometric,
            push_enabled: options.enable_push,
            last_verified: None,
            last_totp_counter: None,
            recovery_email: options.recovery_email,
        };
        self.save(&settings).await?;

        tracing::info!("MFA configured for user {}", user_id);
        Ok(settings)
    }

    /// Verify a second factor
    ///
    /// Returns false for a wrong code or a declined prompt. Missing settings,
    /// a disabled method or a missing token are errors.
    pub async fn verify_mfa(
        &self,
        user_id: &str,
        method: MfaMethod,
        token: Option<&str>,
    ) -> Result<bool> {
        let _guard = self.lock_user(user_id).await;
        let mut settings = self.load(user_id).await?;

        let verified = match method {
            MfaMethod::Totp => {
                if !settings.totp_enabled {
                    return Err(Error::MfaMethodDisabled(method.as_str().into()));
                }
                let token = token.ok_or_else(|| Error::MfaTokenRequired(method.as_str().into()))?;
                let secret = settings
                    .totp_secret
                    .as_deref()
                    .ok_or_else(|| Error::MfaNotConfigured(format!("{} has no TOTP secret", user_id)))?;
                let secret = STANDARD.decode(secret)?;
                let now_secs = self.clock.now_millis() / 1000;
                let matched = self.totp.matching_counter(&secret, token, now_secs)?;
                let last_accepted = settings.last_totp_counter;
                let fresh = |counter: u64| last_accepted.map_or(true, |last| counter > last);
                match matched {
                    Some(counter) if fresh(counter) => {
                        settings.last_totp_counter = Some(counter);
                        true
                    }
                    Some(_) => {
                        tracing::warn!("Replayed TOTP code for user {}", user_id);
                        false
                    }
                    None => false,
                }
            }
            MfaMethod::Biometric => {
                if !settings.biometric_enabled {
                    return Err(Error::MfaMethodDisabled(method.as_str().into()));
                }
                if !self.biometric.has_hardware().await {
                    return Err(Error::BiometricUnavailable);
                }
                self.biometric
                    .authenticate("Confirm it's you")
                    .await?
                    .success
            }
            MfaMethod::Backup => {
                let token = token.ok_or_else(|| Error::MfaTokenRequired(method.as_str().into()))?;
                let wanted = normalize_code(token);
                match settings
                    .backup_codes
                    .iter()
                    .position(|code| normalize_code(code) == wanted)
                {
                    Some(index) => {
                        settings.backup_codes.remove(index);
                        tracing::info!(
                            "Backup code used for user {}, {} left",
                            user_id,
                            settings.backup_codes.len()
                        );
                        true
                    }
                    None => false,
                }
            }
            MfaMethod::Push => {
                if !settings.push_enabled {
                    return Err(Error::MfaMethodDisabled(method.as_str().into()));
                }
                self.push.send_challenge(user_id).await?
            }
        };

        if !verified {
            tracing::warn!("MFA {} verification failed for user {}", method.as_str(), user_id);
            return Ok(false);
        }

        settings.last_verified = Some(self.clock.now_millis());
        self.save(&settings).await?;
        self.sessions.mark_mfa_verified(user_id).await?;

        tracing::info!("MFA {} verified for user {}", method.as_str(), user_id);
        Ok(true)
    }

    /// Check and consume a backup code
    pub async fn verify_backup_code(&self, user_id: &str, code: &str) -> Result<bool> {
        self.verify_mfa(user_id, MfaMethod::Backup, Some(code)).await
    }

    /// Replace every backup code
    pub async fn regenerate_backup_codes(&self, user_id: &str) -> Result<Vec<String>> {
        let _guard = self.lock_user(user_id).await;
        let mut settings = self.load(user_id).await?;
        settings.backup_codes = self.generate_backup_codes()?;
        self.save(&settings).await?;

        tracing::info!("Backup codes regenerated for user {}", user_id);
        Ok(settings.backup_codes)
    }

    /// Remove the MFA record of `user_id`
    pub async fn disable_mfa(&self, user_id: &str) -> Result<()> {
        let _guard = self.lock_user(user_id).await;
        self.load(user_id).await?;
        self.storage.remove_item(&keys::mfa(user_id)).await?;
        tracing::info!("MFA disabled for user {}", user_id);
        Ok(())
    }

    /// Apply a partial settings change
    pub async fn update_mfa_settings(
        &self,
        user_id: &str,
        update: MfaSettingsUpdate,
    ) -> Result<MfaSettings> {
        let _guard = self.lock_user(user_id).await;
        let mut settings = self.load(user_id).await?;

        if let Some(enabled) = update.totp_enabled {
            settings.totp_enabled = enabled;
            if !enabled {
                settings.totp_secret = None;
                settings.last_totp_counter = None;
            } else if settings.totp_secret.is_none() {
                settings.totp_secret = Some(self.generate_totp_secret()?);
                settings.last_totp_counter = None;
            }
        }
        if let Some(enabled) = update.biometric_enabled {
            settings.biometric_enabled = enabled;
        }
        if let Some(enabled) = update.push_enabled {
            settings.push_enabled = enabled;
        }
        if let Some(email) = update.recovery_email {
            settings.recovery_email = Some(email);
        }

        self.save(&settings).await?;
        Ok(settings)
    }

    /// Load the MFA record of `user_id`, if any
    pub async fn get_mfa_settings(&self, user_id: &str) -> Result<Option<MfaSettings>> {
        self.storage.get_item(&keys::mfa(user_id)).await
    }

    /// Current TOTP code for `secret`, as an authenticator app would show it
    pub fn current_totp(&self, secret: &str) -> Result<String> {
        let secret = STANDARD.decode(secret)?;
        self.totp.generate(&secret, self.clock.now_millis() / 1000)
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn lock_user(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.user_locks.lock();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(user_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn load(&self, user_id: &str) -> Result<MfaSettings> {
        self.get_mfa_settings(user_id)
            .await?
            .ok_or_else(|| Error::MfaNotConfigured(user_id.to_string()))
    }

    async fn save(&self, settings: &MfaSettings) -> Result<()> {
        self.storage
            .set_item(&keys::mfa(&settings.user_id), settings)
            .await
    }

    fn mixed_entropy(&self, half: usize) -> Result<Vec<u8>> {
        let mut bytes = self.exchange.quantum_random_bytes(half)?;
        let mut os = vec![0u8; half];
        OsRng.fill_bytes(&mut os);
        bytes.extend_from_slice(&os);
        Ok(bytes)
    }

    fn generate_totp_secret(&self) -> Result<String> {
        Ok(STANDARD.encode(self.mixed_entropy(16)?))
    }

    fn generate_backup_codes(&self) -> Result<Vec<String>> {
        (0..self.config.backup_code_count)
            .map(|_| -> Result<String> {
                let digits = hex::encode(self.mixed_entropy(4)?);
                let groups: Vec<&str> = (0..4).map(|i| &digits[i * 4..i * 4 + 4]).collect();
                Ok(groups.join("-"))
            })
            .collect()
    }
}

fn normalize_code(code: &str) -> String {
    code.chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::platform::StaticBiometric;
    use crate::test_support::TestCore;

    fn all_methods() -> MfaSetupOptions {
        MfaSetupOptions {
            enable_totp: true,
            enable_biometric: true,
            enable_push: true,
            recovery_email: Some("a@example.com".into()),
        }
    }

    #[test]
    fn test_method_names() {
        for method in [MfaMethod::Totp, MfaMethod::Biometric, MfaMethod::Backup, MfaMethod::Push] {
            assert_eq!(MfaMethod::parse(method.as_str()), Some(method));
        }
        assert_eq!(MfaMethod::parse("sms"), None);
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code(" AB12-cd34 ef56-7890 "), "ab12cd34ef567890");
    }

    #[tokio::test]
    async fn test_setup_generates_material() {
        let core = TestCore::new();
        let settings = core.mfa.setup_mfa("user-1", all_methods()).await.unwrap();

        assert_eq!(settings.backup_codes.len(), 10);
        for code in &settings.backup_codes {
            assert_eq!(code.len(), 19);
            assert_eq!(code.split('-').count(), 4);
            assert!(code.chars().all(|c| c == '-' || c.is_ascii_hexdigit()));
        }
        let secret = STANDARD.decode(settings.totp_secret.as_ref().unwrap()).unwrap();
        assert_eq!(secret.len(), 32);

        let stored = core.mfa.get_mfa_settings("user-1").await.unwrap();
        assert_eq!(stored, Some(settings));
    }

    #[tokio::test]
    async fn test_totp_verification() {
        let core = TestCore::new();
        let settings = core.mfa.setup_mfa("user-1", all_methods()).await.unwrap();
        let secret = settings.totp_secret.unwrap();

        let code = core.mfa.current_totp(&secret).unwrap();
        assert!(core.mfa.verify_mfa("user-1", MfaMethod::Totp, Some(&code)).await.unwrap());
        assert!(!core.mfa.verify_mfa("user-1", MfaMethod::Totp, Some(&code)).await.unwrap());

        core.clock.advance(Duration::from_secs(30));
        let next = core.mfa.current_totp(&secret).unwrap();
        assert!(core.mfa.verify_mfa("user-1", MfaMethod::Totp, Some(&next)).await.unwrap());
        let stored = core.mfa.get_mfa_settings("user-1").await.unwrap().unwrap();
        assert!(stored.last_totp_counter.is_some());

        core.clock.advance(Duration::from_secs(120));
        assert!(!core.mfa.verify_mfa("user-1", MfaMethod::Totp, Some(&code)).await.unwrap());

        let err = core
            .mfa
            .verify_mfa("user-1", MfaMethod::Totp, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MFA_TOKEN_REQUIRED");
    }

    #[tokio::test]
    async fn test_code_from_earlier_step_refused_after_newer_one() {
        let core = TestCore::new();
        let settings = core.mfa.setup_mfa("user-1", all_methods()).await.unwrap();
        let secret = settings.totp_secret.unwrap();

        let earlier = core.mfa.current_totp(&secret).unwrap();
        core.clock.advance(Duration::from_secs(30));
        let later = core.mfa.current_totp(&secret).unwrap();

        assert!(core.mfa.verify_mfa("user-1", MfaMethod::Totp, Some(&later)).await.unwrap());
        if earlier != later {
            assert!(!core.mfa.verify_mfa("user-1", MfaMethod::Totp, Some(&earlier)).await.unwrap());
        }
    }

    struct HeldPush(Notify);

    #[async_trait]
    impl PushDelivery for HeldPush {
        async fn send_challenge(&self, _user_id: &str) -> Result<bool> {
            self.0.notified().await;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_pending_push_does_not_block_other_users() {
        let core = TestCore::new();
        let push = Arc::new(HeldPush(Notify::new()));
        let mfa = Arc::new(MfaManager::new(
            core.config.mfa.clone(),
            core.storage.clone(),
            core.sessions.clone(),
            core.core.exchange().clone(),
            core.biometric.clone(),
            push.clone(),
            core.clock.clone(),
        ));
        mfa.setup_mfa(
            "user-1",
            MfaSetupOptions {
                enable_push: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let settings = mfa.setup_mfa("user-2", all_methods()).await.unwrap();

        let pending = tokio::spawn({
            let mfa = mfa.clone();
            async move { mfa.verify_mfa("user-1", MfaMethod::Push, None).await }
        });
        tokio::task::yield_now().await;

        let code = mfa.current_totp(settings.totp_secret.as_deref().unwrap()).unwrap();
        let verified = tokio::time::timeout(
            Duration::from_secs(5),
            mfa.verify_mfa("user-2", MfaMethod::Totp, Some(&code)),
        )
        .await
        .expect("user-2 waited on user-1's push")
        .unwrap();
        assert!(verified);

        push.0.notify_one();
        assert!(pending.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_backup_code_single_use() {
        let core = TestCore::new();
        let settings = core.mfa.setup_mfa("user-1", MfaSetupOptions::default()).await.unwrap();
        let code = settings.backup_codes[3].to_uppercase().replace('-', " ");

        assert!(core.mfa.verify_backup_code("user-1", &code).await.unwrap());
        assert!(!core.mfa.verify_backup_code("user-1", &code).await.unwrap());

        let stored = core.mfa.get_mfa_settings("user-1").await.unwrap().unwrap();
        assert_eq!(stored.backup_codes.len(), 9);
        assert!(stored.last_verified.is_some());
    }

    #[tokio::test]
    async fn test_unconfigured_and_disabled() {
        let core = TestCore::new();
        let err = core
            .mfa
            .verify_mfa("user-1", MfaMethod::Push, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "MFA_NOT_CONFIGURED");

        core.mfa.setup_mfa("user-1", MfaSetupOptions::default()).await.unwrap();
        for method in [MfaMethod::Totp, MfaMethod::Biometric, MfaMethod::Push] {
            let err = core
                .mfa
                .verify_mfa("user-1", method, Some("123456"))
                .await
                .unwrap_err();
            assert_eq!(err.code(), "MFA_METHOD_DISABLED");
        }
    }

    #[tokio::test]
    async fn test_biometric_and_push() {
        let core = TestCore::with_biometric(StaticBiometric::accepting());
        core.mfa.setup_mfa("user-1", all_methods()).await.unwrap();

        assert!(core.mfa.verify_mfa("user-1", MfaMethod::Biometric, None).await.unwrap());
        assert!(core.mfa.verify_mfa("user-1", MfaMethod::Push, None).await.unwrap());

        core.biometric.set_accept(false);
        assert!(!core.mfa.verify_mfa("user-1", MfaMethod::Biometric, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_success_marks_session() {
        let core = TestCore::new();
        let token = core.sessions.create_session("user-1", false).await.unwrap().token;
        let settings = core.mfa.setup_mfa("user-1", MfaSetupOptions::default()).await.unwrap();

        core.mfa
            .verify_backup_code("user-1", &settings.backup_codes[0])
            .await
            .unwrap();
        let session = core.sessions.get_session(&token).await.unwrap().unwrap();
        assert!(session.mfa_verified);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let core = TestCore::new();
        let original = core.mfa.setup_mfa("user-1", MfaSetupOptions::default()).await.unwrap();

        let codes = core.mfa.regenerate_backup_codes("user-1").await.unwrap();
        assert_eq!(codes.len(), 10);
        assert!(!core
            .mfa
            .verify_backup_code("user-1", &original.backup_codes[0])
            .await
            .unwrap());

        let updated = core
            .mfa
            .update_mfa_settings(
                "user-1",
                MfaSettingsUpdate {
                    totp_enabled: Some(true),
                    recovery_email: Some("new@example.com".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.totp_enabled);
        assert!(updated.totp_secret.is_some());
        assert_eq!(updated.recovery_email.as_deref(), Some("new@example.com"));

        core.mfa.disable_mfa("user-1").await.unwrap();
        assert!(core.mfa.get_mfa_settings("user-1").await.unwrap().is_none());
        let err = core.mfa.disable_mfa("user-1").await.unwrap_err();
        assert_eq!(err.code(), "MFA_NOT_CONFIGURED");
    }
}
