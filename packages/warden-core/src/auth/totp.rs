//! Time-based one-time passwords (RFC 6238, HMAC-SHA256).

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::MfaConfig;
use crate::crypto::hashing::constant_time_eq;
use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// TOTP generator and verifier
#[derive(Debug, Clone)]
pub struct Totp {
    step_secs: u64,
    digits: u32,
    skew: u32,
}

impl Totp {
    /// Create a generator with an explicit step, digit count and skew
    pub fn new(step_secs: u64, digits: u32, skew: u32) -> Self {
        Self {
            step_secs: step_secs.max(1),
            digits,
            skew,
        }
    }

    /// Build from MFA settings
    pub fn from_config(config: &MfaConfig) -> Self {
        Self::new(config.totp_step.as_secs(), config.totp_digits, config.totp_skew)
    }

    /// Code for the step containing `unix_secs`
    pub fn generate(&self, secret: &[u8], unix_secs: i64) -> Result<String> {
        self.code_at(secret, self.counter(unix_secs))
    }

    /// Whether `code` matches any step within the allowed skew of `unix_secs`
    pub fn verify(&self, secret: &[u8], code: &str, unix_secs: i64) -> Result<bool> {
        Ok(self.matching_counter(secret, code, unix_secs)?.is_some())
    }

    /// Latest step within the skew window whose code equals `code`
    ///
    /// Every candidate is computed and compared, match or not.
    pub fn matching_counter(&self, secret: &[u8], code: &str, unix_secs: i64) -> Result<Option<u64>> {
        let code = code.trim();
        if code.len() != self.digits as usize {
            return Ok(None);
        }

        let counter = self.counter(unix_secs);
        let first = counter.saturating_sub(self.skew as u64);
        let last = counter.saturating_add(self.skew as u64);

        let mut matched = None;
        for candidate in first..=last {
            let expected = self.code_at(secret, candidate)?;
            if constant_time_eq(expected.as_bytes(), code.as_bytes()) {
                matched = Some(candidate);
            }
        }
        Ok(matched)
    }

    fn counter(&self, unix_secs: i64) -> u64 {
        unix_secs.max(0) as u64 / self.step_secs
    }

    fn code_at(&self, secret: &[u8], counter: u64) -> Result<String> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
            .map_err(|e| Error::InvalidKey(format!("TOTP secret: {}", e)))?;
        mac.update(&counter.to_be_bytes());
        let digest = mac.finalize().into_bytes();

        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);
        let modulus = 10u64.pow(self.digits);
        let code = binary as u64 % modulus;

        Ok(format!("{:0width$}", code, width = self.digits as usize))
    }
}
