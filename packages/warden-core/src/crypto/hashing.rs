//! Salted secret hashing, digests and randomness helpers.
//!
//! Passwords and recovery answers are hashed with Argon2id under a per-value
//! random salt. Comparisons of digests, codes and tokens go through
//! [`constant_time_eq`].

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::PasswordHashingConfig;
use crate::error::{Error, Result};

/// Salt length in bytes
pub const SALT_SIZE: usize = 16;

/// Hash output length in bytes
pub const HASH_SIZE: usize = 32;

/// Argon2id hasher for low-entropy secrets
#[derive(Debug, Clone)]
pub struct SecretHasher {
    config: PasswordHashingConfig,
}

impl SecretHasher {
    /// Create a hasher with the given costs
    pub fn new(config: PasswordHashingConfig) -> Self {
        Self { config }
    }

    /// Hash `secret` under `salt`
    pub fn hash(&self, secret: &str, salt: &[u8]) -> Result<[u8; HASH_SIZE]> {
        let params = Params::new(
            self.config.memory_kib,
            self.config.iterations,
            self.config.parallelism,
            Some(HASH_SIZE),
        )
        .map_err(|e| Error::InvalidConfig(format!("Invalid Argon2 parameters: {}", e)))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut out = [0u8; HASH_SIZE];
        argon2
            .hash_password_into(secret.as_bytes(), salt, &mut out)
            .map_err(|e| Error::Internal(format!("Argon2 hashing failed: {}", e)))?;
        Ok(out)
    }

    /// Hash with a fresh salt, returning `(hash_hex, salt_hex)`
    pub fn hash_new(&self, secret: &str) -> Result<(String, String)> {
        let salt = random_bytes(SALT_SIZE);
        let hash = self.hash(secret, &salt)?;
        Ok((hex::encode(hash), hex::encode(salt)))
    }

    /// Check `secret` against a stored hex hash and salt
    pub fn verify(&self, secret: &str, hash_hex: &str, salt_hex: &str) -> Result<bool> {
        let salt = hex::decode(salt_hex)
            .map_err(|_| Error::DataIntegrityViolation("Stored salt is not hex".into()))?;
        let expected = hex::decode(hash_hex)
            .map_err(|_| Error::DataIntegrityViolation("Stored hash is not hex".into()))?;

        let actual = self.hash(secret, &salt)?;
        Ok(constant_time_eq(&actual, &expected))
    }
}

/// Compare two byte strings without early exit
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// SHA-256 digest
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Hex-encoded SHA-256 digest
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// `len` bytes from the OS CSPRNG
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}
