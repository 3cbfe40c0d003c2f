//! # Warden Core
//!
//! A client-side security core: lattice (LWE) encryption, simulated BB84
//! quantum key distribution, threshold secure aggregation, encrypted
//! storage and the account layer built on top of them.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         WARDEN CORE MODULES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌──────────────┐   │
//! │  │  Accounts   │  │  Sessions   │  │     MFA     │  │   Recovery   │   │
//! │  │ - Register  │  │ - Create    │  │ - TOTP      │  │ - Token      │   │
//! │  │ - Login     │  │ - Validate  │  │ - Backup    │  │ - Questions  │   │
//! │  │ - Lockout   │  │ - FIFO cap  │  │ - Push/Bio  │  │ - Reset      │   │
//! │  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘  └──────┬───────┘   │
//! │         └────────────────┴────────┬───────┴────────────────┘           │
//! │                                   ▼                                     │
//! │                   ┌───────────────────────────────┐                     │
//! │                   │ SecureStorage (envelopes)     │──► Platform keystore│
//! │                   └───────────────┬───────────────┘                     │
//! │                                   ▼                                     │
//! │                   ┌───────────────────────────────┐                     │
//! │                   │ SecurityService (façade)      │                     │
//! │                   └───────┬───────────────┬───────┘                     │
//! │                           ▼               ▼                             │
//! │  ┌──────────────────────────┐   ┌──────────────────────────┐           │
//! │  │ QuantumKeyExchange       │   │ SecureAggregator         │           │
//! │  │ BB84 + CASCADE + HKDF    │   │ threshold rounds + noise │           │
//! │  └────────────┬─────────────┘   └────────────┬─────────────┘           │
//! │               └──────────────┬───────────────┘                          │
//! │                              ▼                                          │
//! │                   LatticeCrypto (LWE, n = 256)                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error codes for the entire library
//! - [`config`] - Every tunable constant
//! - [`crypto`] - LWE scheme, hashing, timing guard
//! - [`quantum`] - Simulated QKD sessions
//! - [`aggregation`] - Threshold secure aggregation rounds
//! - [`service`] - The security façade that owns the current session
//! - [`storage`] - Encrypted key-value storage
//! - [`auth`] - Accounts, sessions, MFA, recovery
//! - [`platform`] - Host collaborator traits and in-memory versions

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod aggregation;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod platform;
pub mod quantum;
pub mod service;
pub mod storage;
/// Wall-clock access behind an injectable clock.
pub mod time;

#[cfg(test)]
mod test_support;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use aggregation::{RoundConfig, RoundStatus, SecureAggregator};
pub use auth::{
    AccountService, MfaManager, MfaMethod, PasswordRecovery, SessionData, SessionManager,
};
pub use config::SecurityConfig;
pub use crypto::{Ciphertext, LatticeCrypto, PublicKey, QuantumKeyPair};
pub use error::{Error, Result, StructuredError};
pub use platform::Platform;
pub use quantum::{QuantumKeyExchange, QuantumSession};
pub use service::{SecurityService, SessionStatus};
pub use storage::SecureStorage;

// ============================================================================
// CORE INSTANCE
// ============================================================================

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::time::{Clock, SystemClock};

/// Every service of the security core, wired together once
///
/// ## Lifecycle
///
/// ```text
/// WardenCore::new(config, platform)
///     │  validate config, build services bottom-up
///     ▼
/// start_background_tasks() ──► BackgroundTasks (sweeps run until dropped)
///     │
///     ▼
/// accounts() / sessions() / mfa() / recovery() / security() / storage()
/// ```
pub struct WardenCore {
    config: SecurityConfig,
    platform: Platform,
    exchange: Arc<QuantumKeyExchange>,
    aggregator: Arc<SecureAggregator>,
    security: Arc<SecurityService>,
    storage: Arc<SecureStorage>,
    sessions: Arc<SessionManager>,
    accounts: Arc<AccountService>,
    mfa: Arc<MfaManager>,
    recovery: Arc<PasswordRecovery>,
}

impl WardenCore {
    /// Build the core on the system clock
    pub fn new(config: SecurityConfig, platform: Platform) -> Result<Self> {
        Self::with_clock(config, platform, Arc::new(SystemClock))
    }

    /// Build the core on an explicit clock
    pub fn with_clock(
        config: SecurityConfig,
        platform: Platform,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        tracing::info!("Initializing Warden Core v{}", version());

        let lattice = LatticeCrypto::new(config.lattice.clone(), config.timing.clone());
        let exchange = Arc::new(QuantumKeyExchange::new(&config, clock.clone()));
        let aggregator = Arc::new(SecureAggregator::new(
            config.aggregation.clone(),
            lattice.clone(),
            clock.clone(),
        ));
        let security = Arc::new(
            SecurityService::new(lattice, exchange.clone(), aggregator.clone(), clock.clone())
                .with_key_retention(config.storage.key_retention),
        );
        let storage = Arc::new(SecureStorage::new(
            security.clone(),
            platform.keystore.clone(),
            clock.clone(),
            config.storage.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            &config,
            storage.clone(),
            exchange.clone(),
            platform.keystore.clone(),
            platform.biometric.clone(),
            clock.clone(),
        ));
        let accounts = Arc::new(AccountService::new(
            config.auth.clone(),
            storage.clone(),
            sessions.clone(),
            security.clone(),
            clock.clone(),
        ));
        let mfa = Arc::new(MfaManager::new(
            config.mfa.clone(),
            storage.clone(),
            sessions.clone(),
            exchange.clone(),
            platform.biometric.clone(),
            platform.push.clone(),
            clock.clone(),
        ));
        let recovery = Arc::new(PasswordRecovery::new(
            config.recovery.clone(),
            accounts.clone(),
            storage.clone(),
            exchange.clone(),
            platform.email.clone(),
            platform.remote.clone(),
            clock,
        ));

        tracing::info!("Warden Core initialized");
        Ok(Self {
            config,
            platform,
            exchange,
            aggregator,
            security,
            storage,
            sessions,
            accounts,
            mfa,
            recovery,
        })
    }

    /// Start every periodic sweep
    ///
    /// Needs a running tokio runtime. The sweeps stop when the returned
    /// handle is dropped.
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let handles = vec![
            self.exchange.spawn_cleanup(),
            self.security.spawn_cleanup(),
            self.storage.spawn_cleanup(),
            self.sessions.spawn_cleanup(),
            self.recovery.spawn_cleanup(),
        ];
        tracing::info!("Started {} background sweeps", handles.len());
        BackgroundTasks { handles }
    }

    /// Active configuration
    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Host collaborators
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// QKD session cache
    pub fn exchange(&self) -> &Arc<QuantumKeyExchange> {
        &self.exchange
    }

    /// Aggregation rounds
    pub fn aggregator(&self) -> &Arc<SecureAggregator> {
        &self.aggregator
    }

    /// Security façade
    pub fn security(&self) -> &Arc<SecurityService> {
        &self.security
    }

    /// Encrypted storage
    pub fn storage(&self) -> &Arc<SecureStorage> {
        &self.storage
    }

    /// Login sessions
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Accounts and login
    pub fn accounts(&self) -> &Arc<AccountService> {
        &self.accounts
    }

    /// Second factors
    pub fn mfa(&self) -> &Arc<MfaManager> {
        &self.mfa
    }

    /// Password recovery
    pub fn recovery(&self) -> &Arc<PasswordRecovery> {
        &self.recovery
    }
}

/// Handles of the running sweeps; dropping it aborts them
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Number of running sweeps
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no sweep is running
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Abort every sweep now
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
        tracing::debug!("Stopped background sweeps");
    }
}

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of Warden Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================================
// TESTS
// ============================================================================
