//! Shared fixture for unit tests of the auth layer.

use std::sync::Arc;

use crate::auth::{AccountService, MfaManager, PasswordRecovery, SessionManager};
use crate::config::{PasswordHashingConfig, SecurityConfig, TimingBudgets};
use crate::platform::{
    BiometricPrompt, DelayedPush, MemoryKeystore, MemoryRemoteStore, Platform, RecordingEmail,
    StaticBiometric,
};
use crate::service::SecurityService;
use crate::storage::SecureStorage;
use crate::time::ManualClock;
use crate::WardenCore;

pub(crate) struct TestCore {
    pub config: SecurityConfig,
    pub clock: Arc<ManualClock>,
    pub keystore: Arc<MemoryKeystore>,
    pub biometric: Arc<StaticBiometric>,
    pub email: Arc<RecordingEmail>,
    pub remote: Arc<MemoryRemoteStore>,
    pub core: WardenCore,
    pub security: Arc<SecurityService>,
    pub storage: Arc<SecureStorage>,
    pub sessions: Arc<SessionManager>,
    pub accounts: Arc<AccountService>,
    pub mfa: Arc<MfaManager>,
    pub recovery: Arc<PasswordRecovery>,
}

impl TestCore {
    pub fn new() -> Self {
        Self::build(MemoryKeystore::new(), StaticBiometric::unavailable())
    }

    pub fn with_keystore(keystore: MemoryKeystore) -> Self {
        Self::build(keystore, StaticBiometric::unavailable())
    }

    pub fn with_biometric(biometric: StaticBiometric) -> Self {
        Self::build(MemoryKeystore::new(), biometric)
    }

    fn build(keystore: MemoryKeystore, biometric: StaticBiometric) -> Self {
        let mut config = SecurityConfig {
            timing: TimingBudgets::relaxed(),
            ..SecurityConfig::default()
        };
        config.auth.password_hashing = PasswordHashingConfig::fast();

        let clock = Arc::new(ManualClock::starting_now());
        let keystore = Arc::new(keystore);
        let biometric = Arc::new(biometric);
        let email = Arc::new(RecordingEmail::new());
        let remote = Arc::new(MemoryRemoteStore::new());

        let platform = Platform {
            keystore: keystore.clone(),
            biometric: biometric.clone(),
            push: Arc::new(DelayedPush::new(std::time::Duration::from_millis(10))),
            email: email.clone(),
            remote: Some(remote.clone()),
        };
        let core = WardenCore::with_clock(config.clone(), platform, clock.clone())
            .expect("test configuration is valid");

        Self {
            security: core.security().clone(),
            storage: core.storage().clone(),
            sessions: core.sessions().clone(),
            accounts: core.accounts().clone(),
            mfa: core.mfa().clone(),
            recovery: core.recovery().clone(),
            config,
            clock,
            keystore,
            biometric,
            email,
            remote,
            core,
        }
    }

    /// A second session manager over the same storage, as another app instance would build
    pub fn session_manager_with(&self, biometric: Arc<dyn BiometricPrompt>) -> SessionManager {
        SessionManager::new(
            &self.config,
            self.storage.clone(),
            self.core.exchange().clone(),
            self.keystore.clone(),
            biometric,
            self.clock.clone(),
        )
    }
}
