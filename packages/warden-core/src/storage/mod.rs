//! # Storage Module
//!
//! Encrypted, integrity-checked persistence for every record the security
//! core owns (accounts, login sessions, MFA settings, recovery tokens).
//!
//! ## Storage Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  set_item(key, value)                                                  │
//! │     │                                                                   │
//! │     ├──► integrity = SHA-256(canonical JSON)                           │
//! │     ├──► ciphertext = SecurityService::encrypt_data(value)             │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Platform Keystore   "warden.<key>" ──► StoredEnvelope (JSON)   │   │
//! │  │  iOS Keychain / Android Keystore / in-memory for tests          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  get_item(key)                                                         │
//! │     cache hit (younger than cache_ttl) ──► value                       │
//! │     otherwise: decrypt, recompute hash, compare in constant time       │
//! │                mismatch / malformed ──► DATA_INTEGRITY_VIOLATION       │
//! │                sealed under a retired key ──► re-sealed in place       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Layout
//!
//! | Prefix | Owner |
//! |--------|-------|
//! | `account.<user_id>` | AccountService |
//! | `account_index.<username>` | AccountService |
//! | `session.<token>` | SessionManager |
//! | `user_sessions.<user_id>` | SessionManager |
//! | `device_id` | SessionManager |
//! | `mfa.<user_id>` | MfaManager |
//! | `recovery.<token>` | PasswordRecovery |

mod secure_store;

pub use secure_store::{SecureStorage, StoredEnvelope, ENVELOPE_VERSION};

/// Storage key builders shared by the auth services
pub mod keys {
    /// Per-install device identifier
    pub const DEVICE_ID: &str = "device_id";

    /// Account record by user id
    pub fn account(user_id: &str) -> String {
        format!("account.{}", user_id)
    }

    /// Username to user id index
    pub fn account_index(username: &str) -> String {
        format!("account_index.{}", username.to_lowercase())
    }

    /// Login session by token
    pub fn session(token: &str) -> String {
        format!("session.{}", token)
    }

    /// Prefix of every login session key
    pub const SESSION_PREFIX: &str = "session.";

    /// Ordered active tokens of a user
    pub fn user_sessions(user_id: &str) -> String {
        format!("user_sessions.{}", user_id)
    }

    /// MFA settings by user id
    pub fn mfa(user_id: &str) -> String {
        format!("mfa.{}", user_id)
    }

    /// Recovery token record
    pub fn recovery(token: &str) -> String {
        format!("recovery.{}", token)
    }

    /// Prefix of every recovery token key
    pub const RECOVERY_PREFIX: &str = "recovery.";
}
