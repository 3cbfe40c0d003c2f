//! # Error Handling
//!
//! This module provides the single structured error kind surfaced by
//! Warden Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Protocol / Timing (fatal to the operation, never auto-retried)    │
//! │  │   ├── TIMING_ANOMALY         - Operation exceeded its budget        │
//! │  │   ├── HIGH_QBER              - QKD error rate above threshold       │
//! │  │   └── INSUFFICIENT_ENTROPY   - Too few sifted key bits              │
//! │  │                                                                      │
//! │  ├── Resource / State (recoverable by caller action)                   │
//! │  │   ├── INVALID_ROUND          - Unknown aggregation round            │
//! │  │   ├── ROUND_EXPIRED          - Round timeout elapsed                │
//! │  │   ├── THRESHOLD_NOT_MET      - Too few updates to finalize          │
//! │  │   ├── INSUFFICIENT_PARTICIPANTS                                     │
//! │  │   └── NO_SESSION             - No current quantum session           │
//! │  │                                                                      │
//! │  ├── Integrity                                                         │
//! │  │   └── DATA_INTEGRITY_VIOLATION - Stored data must not be trusted    │
//! │  │                                                                      │
//! │  └── Auth                                                              │
//! │      ├── ACCOUNT_LOCKED         - Carries remainingTime metadata       │
//! │      ├── INVALID_CREDENTIALS                                           │
//! │      └── RECOVERY_TOKEN_*       - Expired / over-attempted tokens      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Caller Representation
//!
//! ```text
//! Result<T, Error>  ──────►  StructuredError { code, message, metadata }
//!                             ("ACCOUNT_LOCKED", "...", {"remainingTime": 840000})
//! ```

use serde::Serialize;
use thiserror::Error;

/// Result type alias for Warden Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Warden Core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Protocol / Timing Errors
    // ========================================================================

    /// A timed operation ran past its budget
    #[error("Timing anomaly in {operation}: took {elapsed_ms} ms, budget {budget_ms} ms")]
    TimingAnomaly {
        /// Name of the guarded operation
        operation: &'static str,
        /// Measured duration in milliseconds
        elapsed_ms: u64,
        /// Allowed duration in milliseconds
        budget_ms: u64,
    },

    /// Quantum bit error rate exceeded the abort threshold
    #[error("Quantum bit error rate {qber:.4} exceeds threshold {threshold:.4}")]
    HighQber {
        /// Measured (or lower-bounded) error rate
        qber: f64,
        /// Configured abort threshold
        threshold: f64,
    },

    /// Not enough sifted key bits to reach the entropy floor
    #[error("Insufficient entropy: {available} sifted bits, {required} required")]
    InsufficientEntropy {
        /// Sifted bits available
        available: usize,
        /// Minimum required
        required: usize,
    },

    // ========================================================================
    // Resource / State Errors
    // ========================================================================

    /// Aggregation round does not exist
    #[error("Aggregation round not found: {0}")]
    InvalidRound(String),

    /// Aggregation round timed out
    #[error("Aggregation round expired: {0}")]
    RoundExpired(String),

    /// Not enough updates were submitted to finalize
    #[error("Threshold not met: {submitted} of {threshold} updates submitted")]
    ThresholdNotMet {
        /// Updates submitted so far
        submitted: usize,
        /// Updates required
        threshold: usize,
    },

    /// Round was configured with too few participants
    #[error("Insufficient participants: {requested} requested, minimum is {minimum}")]
    InsufficientParticipants {
        /// Requested participant count
        requested: usize,
        /// Minimum allowed
        minimum: usize,
    },

    /// Round already holds an update from every expected participant
    #[error("Aggregation round {0} is full")]
    RoundFull(String),

    /// Invalid configuration values
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No quantum session is established
    #[error("No active quantum session. Initialize the security service first.")]
    NoSession,

    // ========================================================================
    // Crypto Errors
    // ========================================================================

    /// Decryption could not produce a valid plaintext
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Ciphertext or matrix shapes are inconsistent
    #[error("Invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    /// Invalid key material
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    // ========================================================================
    // Integrity Errors
    // ========================================================================

    /// Stored data failed its integrity check
    #[error("Data integrity violation: {0}")]
    DataIntegrityViolation(String),

    // ========================================================================
    // Storage Errors
    // ========================================================================

    /// Failed to read from storage
    #[error("Failed to read from storage: {0}")]
    StorageReadError(String),

    /// Failed to write to storage
    #[error("Failed to write to storage: {0}")]
    StorageWriteError(String),

    /// Collaborator does not support the operation
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    // ========================================================================
    // Auth Errors
    // ========================================================================

    /// Too many failed logins
    #[error("Account locked. Try again in {} minute(s).", .remaining_ms.div_ceil(60_000))]
    AccountLocked {
        /// Milliseconds until the lockout ends
        remaining_ms: u64,
    },

    /// Username or password is wrong
    #[error("Invalid username or password")]
    InvalidCredentials,

    /// Username already registered
    #[error("User already exists: {0}")]
    UserExists(String),

    /// No account for the given username or id
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// Login session is unknown, expired or bound to another device
    #[error("Invalid session")]
    InvalidSession,

    /// Email does not match the account
    #[error("Email does not match account records")]
    EmailMismatch,

    /// Recovery token unknown or not issued for this account
    #[error("Invalid recovery token")]
    InvalidRecoveryToken,

    /// Recovery token older than its time box
    #[error("Recovery token expired")]
    RecoveryTokenExpired,

    /// Recovery token used up its verification attempts
    #[error("Too many recovery attempts. Start recovery again.")]
    RecoveryAttemptsExceeded,

    /// Recovery answers were wrong
    #[error("Recovery answers do not match")]
    InvalidRecoveryAnswers,

    /// No biometric hardware on this device
    #[error("Biometric authentication is not available on this device")]
    BiometricUnavailable,

    /// Biometric prompt was rejected or cancelled
    #[error("Biometric authentication failed")]
    BiometricFailed,

    /// MFA was never set up for the user
    #[error("MFA is not configured for user {0}")]
    MfaNotConfigured(String),

    /// The requested MFA method is disabled
    #[error("MFA method {0} is not enabled")]
    MfaMethodDisabled(String),

    /// An MFA method needs a token that was not supplied
    #[error("MFA token required for method {0}")]
    MfaTokenRequired(String),

    // ========================================================================
    // Internal Errors
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl Error {
    /// Get the string code surfaced to callers
    pub fn code(&self) -> &'static str {
        match self {
            // Protocol / timing
            Error::TimingAnomaly { .. } => "TIMING_ANOMALY",
            Error::HighQber { .. } => "HIGH_QBER",
            Error::InsufficientEntropy { .. } => "INSUFFICIENT_ENTROPY",

            // Resource / state
            Error::InvalidRound(_) => "INVALID_ROUND",
            Error::RoundExpired(_) => "ROUND_EXPIRED",
            Error::ThresholdNotMet { .. } => "THRESHOLD_NOT_MET",
            Error::InsufficientParticipants { .. } => "INSUFFICIENT_PARTICIPANTS",
            Error::RoundFull(_) => "ROUND_FULL",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::NoSession => "NO_SESSION",

            // Crypto
            Error::DecryptionFailed(_) => "DECRYPTION_FAILED",
            Error::InvalidCiphertext(_) => "INVALID_CIPHERTEXT",
            Error::InvalidKey(_) => "INVALID_KEY",

            // Integrity
            Error::DataIntegrityViolation(_) => "DATA_INTEGRITY_VIOLATION",

            // Storage
            Error::StorageReadError(_) => "STORAGE_READ_ERROR",
            Error::StorageWriteError(_) => "STORAGE_WRITE_ERROR",
            Error::NotSupported(_) => "NOT_SUPPORTED",

            // Auth
            Error::AccountLocked { .. } => "ACCOUNT_LOCKED",
            Error::InvalidCredentials => "INVALID_CREDENTIALS",
            Error::UserExists(_) => "USER_EXISTS",
            Error::UserNotFound(_) => "USER_NOT_FOUND",
            Error::InvalidSession => "INVALID_SESSION",
            Error::EmailMismatch => "EMAIL_MISMATCH",
            Error::InvalidRecoveryToken => "INVALID_RECOVERY_TOKEN",
            Error::RecoveryTokenExpired => "RECOVERY_TOKEN_EXPIRED",
            Error::RecoveryAttemptsExceeded => "RECOVERY_ATTEMPTS_EXCEEDED",
            Error::InvalidRecoveryAnswers => "INVALID_RECOVERY_ANSWERS",
            Error::BiometricUnavailable => "BIOMETRIC_UNAVAILABLE",
            Error::BiometricFailed => "BIOMETRIC_FAILED",
            Error::MfaNotConfigured(_) => "MFA_NOT_CONFIGURED",
            Error::MfaMethodDisabled(_) => "MFA_METHOD_DISABLED",
            Error::MfaTokenRequired(_) => "MFA_TOKEN_REQUIRED",

            // Internal
            Error::Internal(_) => "INTERNAL",
            Error::SerializationError(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Structured details for callers, if the error carries any
    pub fn metadata(&self) -> Option<serde_json::Value> {
        match self {
            Error::AccountLocked { remaining_ms } => {
                Some(serde_json::json!({ "remainingTime": remaining_ms }))
            }
            Error::TimingAnomaly {
                operation,
                elapsed_ms,
                budget_ms,
            } => Some(serde_json::json!({
                "operation": operation,
                "elapsedMs": elapsed_ms,
                "budgetMs": budget_ms,
            })),
            Error::HighQber { qber, threshold } => {
                Some(serde_json::json!({ "qber": qber, "threshold": threshold }))
            }
            Error::ThresholdNotMet {
                submitted,
                threshold,
            } => Some(serde_json::json!({ "submitted": submitted, "threshold": threshold })),
            _ => None,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors can be resolved by waiting, adding participants
    /// or re-establishing a session. Protocol and integrity failures are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::InvalidRound(_)
                | Error::RoundExpired(_)
                | Error::ThresholdNotMet { .. }
                | Error::InsufficientParticipants { .. }
                | Error::NoSession
                | Error::AccountLocked { .. }
                | Error::RecoveryTokenExpired
                | Error::RecoveryAttemptsExceeded
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::SerializationError(format!("Invalid base64: {}", err))
    }
}

// ============================================================================
// CALLER REPRESENTATION
// ============================================================================

/// Error as surfaced to session/UI code
#[derive(Debug, Clone, Serialize)]
pub struct StructuredError {
    /// String error code, e.g. `ROUND_EXPIRED`
    pub code: &'static str,
    /// Human-readable error message
    pub message: String,
    /// Optional structured details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl From<Error> for StructuredError {
    fn from(err: Error) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            metadata: err.metadata(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
