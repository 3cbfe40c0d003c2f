//! Security core configuration.
//!
//! Every tunable constant lives here, grouped by the component that reads
//! it. All groups implement `Default` with the production values, and the
//! whole tree (de)serializes with serde so a host app can ship overrides as
//! JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration for Warden Core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// LWE scheme parameters
    pub lattice: LatticeParams,
    /// Budgets for timing-guarded operations
    pub timing: TimingBudgets,
    /// Simulated QKD handshake
    pub qkd: QkdConfig,
    /// Secure aggregation rounds
    pub aggregation: AggregationConfig,
    /// Secure storage cache
    pub storage: StorageConfig,
    /// Login sessions
    pub sessions: SessionConfig,
    /// Login lockout and password hashing
    pub auth: AuthConfig,
    /// Multi-factor authentication
    pub mfa: MfaConfig,
    /// Password recovery
    pub recovery: RecoveryConfig,
}

impl SecurityConfig {
    /// Parse a (possibly partial) JSON configuration
    ///
    /// Missing fields fall back to their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(format!("Malformed configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break protocol invariants
    pub fn validate(&self) -> Result<()> {
        if self.lattice.dimension == 0 {
            return Err(Error::InvalidConfig("lattice dimension must be positive".into()));
        }
        if self.lattice.encryption_weight == 0
            || self.lattice.encryption_weight > self.lattice.dimension
        {
            return Err(Error::InvalidConfig(
                "encryption weight must be in 1..=dimension".into(),
            ));
        }
        if self.lattice.plaintext_scale <= 0.0 {
            return Err(Error::InvalidConfig("plaintext scale must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.qkd.qber_threshold) {
            return Err(Error::InvalidConfig("QBER threshold must be in [0, 1)".into()));
        }
        if self.qkd.block_size < 2 {
            return Err(Error::InvalidConfig("reconciliation block size must be >= 2".into()));
        }
        if self.aggregation.min_participants == 0 {
            return Err(Error::InvalidConfig("minimum participants must be positive".into()));
        }
        if self.storage.key_retention < self.storage.cache_ttl {
            return Err(Error::InvalidConfig(
                "key retention must cover at least one storage sweep".into(),
            ));
        }
        if self.sessions.max_sessions == 0 {
            return Err(Error::InvalidConfig("max sessions must be positive".into()));
        }
        if self.auth.max_failed_attempts == 0 || self.recovery.max_attempts == 0 {
            return Err(Error::InvalidConfig("attempt limits must be positive".into()));
        }
        Ok(())
    }
}

/// LWE scheme parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatticeParams {
    /// Lattice dimension `n`
    pub dimension: usize,
    /// Standard deviation of the key error `e`
    pub key_error_sigma: f64,
    /// Standard deviation of the per-element encryption noise
    pub encryption_noise_sigma: f64,
    /// Plaintext scale `Δ`; decryption rounds `(v - s·u) / Δ`
    pub plaintext_scale: f64,
    /// Hamming weight of each encryption vector `r`
    pub encryption_weight: usize,
}

impl Default for LatticeParams {
    fn default() -> Self {
        Self {
            dimension: 256,
            key_error_sigma: 0.1,
            encryption_noise_sigma: 3.2,
            plaintext_scale: 1024.0,
            encryption_weight: 32,
        }
    }
}

/// Wall-clock budgets for guarded operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingBudgets {
    /// Key pair generation
    pub keygen: Duration,
    /// Encryption
    pub encrypt: Duration,
    /// Decryption
    pub decrypt: Duration,
    /// Full QKD session establishment
    pub session_establishment: Duration,
}

impl TimingBudgets {
    /// Budgets generous enough for unoptimized builds
    pub fn relaxed() -> Self {
        let generous = Duration::from_secs(60);
        Self {
            keygen: generous,
            encrypt: generous,
            decrypt: generous,
            session_establishment: generous,
        }
    }
}

impl Default for TimingBudgets {
    fn default() -> Self {
        Self {
            keygen: Duration::from_millis(100),
            encrypt: Duration::from_millis(50),
            decrypt: Duration::from_millis(50),
            session_establishment: Duration::from_millis(200),
        }
    }
}

/// Simulated QKD parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QkdConfig {
    /// Minimum sifted key length in bits; `4×` this many EPR pairs are generated
    pub min_entropy: usize,
    /// Abort threshold for the quantum bit error rate
    pub qber_threshold: f64,
    /// First-pass CASCADE block size in bits
    pub block_size: usize,
    /// Upper bound on reconciliation passes
    pub max_reconciliation_passes: usize,
    /// Probability that the simulated channel flips a sifted bit
    pub channel_error_rate: f64,
    /// How long an established session stays valid
    pub session_timeout: Duration,
    /// Interval of the expired-session sweep
    pub cleanup_interval: Duration,
}

impl Default for QkdConfig {
    fn default() -> Self {
        Self {
            min_entropy: 256,
            qber_threshold: 0.11,
            block_size: 16,
            max_reconciliation_passes: 64,
            channel_error_rate: 0.01,
            session_timeout: Duration::from_secs(60 * 60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Secure aggregation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Smallest round a caller may open
    pub min_participants: usize,
    /// Differential-privacy noise scale before the `1/sqrt(participants)` factor
    pub noise_scale: f64,
    /// Interval of the expired-round sweep
    pub cleanup_interval: Duration,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            min_participants: 3,
            noise_scale: 1.0,
            cleanup_interval: Duration::from_secs(10),
        }
    }
}

/// Secure storage parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Prefix applied to every keystore key
    pub namespace: String,
    /// How long decrypted values stay in the in-memory cache
    pub cache_ttl: Duration,
    /// How long a retired session key keeps opening stored records
    pub key_retention: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            namespace: "warden".to_string(),
            cache_ttl: Duration::from_secs(5 * 60),
            key_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Login session parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Live sessions per user before the oldest is evicted
    pub max_sessions: usize,
    /// Maximum session age
    pub session_duration: Duration,
    /// Key material older than this is refreshed on validation
    pub refresh_threshold: Duration,
    /// Interval of the expired-session sweep
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 5,
            session_duration: Duration::from_secs(60 * 60),
            refresh_threshold: Duration::from_secs(5 * 60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Login lockout and password hashing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Consecutive failed logins before the account locks
    pub max_failed_attempts: u32,
    /// How long a locked account stays locked
    pub lockout_duration: Duration,
    /// Argon2id cost parameters
    pub password_hashing: PasswordHashingConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            lockout_duration: Duration::from_secs(15 * 60),
            password_hashing: PasswordHashingConfig::default(),
        }
    }
}

/// Argon2id cost parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordHashingConfig {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl PasswordHashingConfig {
    /// Minimal costs for tests
    pub fn fast() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }
}

impl Default for PasswordHashingConfig {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Multi-factor authentication parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MfaConfig {
    /// Number of backup codes issued per setup
    pub backup_code_count: usize,
    /// TOTP time step
    pub totp_step: Duration,
    /// TOTP code length
    pub totp_digits: u32,
    /// Accepted clock skew in steps on either side
    pub totp_skew: u32,
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self {
            backup_code_count: 10,
            totp_step: Duration::from_secs(30),
            totp_digits: 6,
            totp_skew: 1,
        }
    }
}

/// Password recovery parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Lifetime of a recovery token
    pub token_ttl: Duration,
    /// Failed verifications before a token is burned
    pub max_attempts: u32,
    /// Interval of the dead-token sweep
    pub cleanup_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(15 * 60),
            max_attempts: 3,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SecurityConfig::default();
        config.validate().unwrap();
        assert_eq!(config.lattice.dimension, 256);
        assert_eq!(config.sessions.max_sessions, 5);
        assert_eq!(config.timing.encrypt, Duration::from_millis(50));
    }

    #[test]
    fn test_partial_json_overrides() {
        let json = r#"{ "sessions": { "max_sessions": 2 }, "qkd": { "qber_threshold": 0.05 } }"#;
        let config = SecurityConfig::from_json(json).unwrap();
        assert_eq!(config.sessions.max_sessions, 2);
        assert_eq!(config.qkd.qber_threshold, 0.05);
        // Untouched groups keep their defaults
        assert_eq!(config.qkd.block_size, 16);
        assert_eq!(config.recovery.max_attempts, 3);
        assert_eq!(config.recovery.cleanup_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let json = r#"{ "qkd": { "qber_threshold": 1.5 } }"#;
        let err = SecurityConfig::from_json(json).unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");

        let mut config = SecurityConfig::default();
        config.lattice.encryption_weight = 0;
        assert!(config.validate().is_err());

        let mut config = SecurityConfig::default();
        config.storage.key_retention = Duration::from_secs(60);
        assert_eq!(config.validate().unwrap_err().code(), "INVALID_CONFIG");
    }
}
