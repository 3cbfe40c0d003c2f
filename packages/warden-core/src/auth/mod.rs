//! # Auth Module
//!
//! Accounts, device-bound login sessions, second factors and password
//! recovery. Every record lives in [`SecureStorage`](crate::storage::SecureStorage).
//!
//! ## Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            AUTH FLOW                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  AccountService::register ──► AccountRecord (Argon2id hashes)          │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  AccountService::login ──► lockout check ──► password check            │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  SessionManager::create_session ──► SessionData (max 5 per user)       │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  MfaManager::verify_mfa ──► session.mfa_verified = true                │
//! │                                                                         │
//! │  PasswordRecovery: initiate ──► email token ──► answers ──► reset      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod accounts;
pub mod mfa;
pub mod recovery;
pub mod session;
pub mod totp;

pub use accounts::{AccountRecord, AccountService, RecoveryQuestion};
pub use mfa::{MfaManager, MfaMethod, MfaSettings, MfaSettingsUpdate, MfaSetupOptions};
pub use recovery::{PasswordRecovery, RecoveryToken};
pub use session::{SessionData, SessionManager};
pub use totp::Totp;
