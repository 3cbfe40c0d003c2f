//! Password recovery by emailed token plus security questions.
//!
//! ```text
//! initiate_recovery(username, email)
//!   email must match the account ──► token (15 min, 3 attempts) mailed
//!
//! verify_recovery_answers / reset_password(token, answers, ..)
//!   unknown token ─────────► INVALID_RECOVERY_TOKEN
//!   older than token_ttl ──► RECOVERY_TOKEN_EXPIRED    (token deleted)
//!   attempts used up ──────► RECOVERY_ATTEMPTS_EXCEEDED (token deleted)
//!   wrong answers ─────────► false / INVALID_RECOVERY_ANSWERS, attempts += 1
//!   otherwise (reset) ─────► password replaced, lockout cleared,
//!                            token deleted, account blob pushed remote
//!                            (a failed push is logged, the reset stands)
//! ```

use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::accounts::AccountService;
use crate::config::RecoveryConfig;
use crate::crypto::hashing::{constant_time_eq, sha256_hex};
use crate::error::{Error, Result};
use crate::platform::{EmailDelivery, RemotePersistence};
use crate::quantum::QuantumKeyExchange;
use crate::storage::{keys, SecureStorage};
use crate::time::Clock;

/// An issued recovery token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryToken {
    /// Token value as mailed
    pub token: String,
    /// Account being recovered
    pub user_id: String,
    /// Issue time, Unix milliseconds
    pub timestamp: i64,
    /// Failed verifications so far
    pub attempts: u32,
}

/// Drives the password recovery flow
pub struct PasswordRecovery {
    accounts: Arc<AccountService>,
    storage: Arc<SecureStorage>,
    exchange: Arc<QuantumKeyExchange>,
    email: Arc<dyn EmailDelivery>,
    remote: Option<Arc<dyn RemotePersistence>>,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
    lock: Mutex<()>,
}

impl PasswordRecovery {
    /// Create the flow
    pub fn new(
        config: RecoveryConfig,
        accounts: Arc<AccountService>,
        storage: Arc<SecureStorage>,
        exchange: Arc<QuantumKeyExchange>,
        email: Arc<dyn EmailDelivery>,
        remote: Option<Arc<dyn RemotePersistence>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accounts,
            storage,
            exchange,
            email,
            remote,
            clock,
            config,
            lock: Mutex::new(()),
        }
    }

    /// Issue a recovery token and mail it to the account's address
    ///
    /// Returns the token so callers without a real mailer can continue.
    pub async fn initiate_recovery(&self, username: &str, email: &str) -> Result<String> {
        let account = self
            .accounts
            .find_by_username(username)
            .await?
            .ok_or_else(|| Error::UserNotFound(username.to_string()))?;

        let given = email.trim().to_lowercase();
        let stored = account.email.to_lowercase();
        if !constant_time_eq(given.as_bytes(), stored.as_bytes()) {
            tracing::warn!("Recovery email mismatch for account {}", account.user_id);
            return Err(Error::EmailMismatch);
        }

        let mut material = self.exchange.quantum_random_bytes(32)?;
        let mut os = [0u8; 32];
        OsRng.fill_bytes(&mut os);
        material.extend_from_slice(&os);

        let record = RecoveryToken {
            token: sha256_hex(&material),
            user_id: account.user_id.clone(),
            timestamp: self.clock.now_millis(),
            attempts: 0,
        };
        self.storage
            .set_item(&keys::recovery(&record.token), &record)
            .await?;
        self.email.send(&account.email, &record.token).await?;

        tracing::info!("Recovery token issued for account {}", account.user_id);
        Ok(record.token)
    }

    /// Security questions of the account behind `token`
    pub async fn get_recovery_questions(&self, token: &str) -> Result<Vec<String>> {
        let record = self.live_token(token).await?;
        let account = self
            .accounts
            .get_account(&record.user_id)
            .await?
            .ok_or_else(|| Error::UserNotFound(record.user_id.clone()))?;
        Ok(account
            .recovery_questions
            .into_iter()
            .map(|q| q.question)
            .collect())
    }

    /// Check answers for the account behind `token`
    ///
    /// A wrong set of answers spends one of the token's attempts.
    pub async fn verify_recovery_answers(&self, token: &str, answers: &[&str]) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut record = self.live_token(token).await?;
        self.check_answers(&mut record, answers).await
    }

    /// Replace the password of the account behind `token`
    pub async fn reset_password(
        &self,
        token: &str,
        answers: &[&str],
        new_password: &str,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut record = self.live_token(token).await?;
        if !self.check_answers(&mut record, answers).await? {
            return Err(Error::InvalidRecoveryAnswers);
        }

        self.accounts
            .update_password(&record.user_id, new_password)
            .await?;
        self.storage.remove_item(&keys::recovery(token)).await?;
        tracing::info!("Password reset for account {}", record.user_id);

        if let Some(remote) = &self.remote {
            if let Err(e) = self.push_account(&**remote, &record.user_id).await {
                tracing::warn!("Remote sync after reset failed for {}: {}", record.user_id, e);
            }
        }
        Ok(())
    }

    /// Delete every expired or used-up token
    ///
    /// Needs keystore enumeration; returns 0 when it is unsupported.
    pub async fn cleanup_expired_tokens(&self) -> usize {
        let stored = match self.storage.list_keys(keys::RECOVERY_PREFIX).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::debug!("Skipping recovery token sweep: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for key in stored {
            let record: RecoveryToken = match self.storage.get_item(&key).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Unreadable recovery token during sweep: {}", e);
                    continue;
                }
            };
            if self.is_dead(&record) {
                match self.storage.remove_item(&key).await {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!("Failed to remove recovery token: {}", e),
                }
            }
        }
        if removed > 0 {
            tracing::info!("Swept {} dead recovery tokens", removed);
        }
        removed
    }

    /// Start the periodic dead-token sweep
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let recovery = Arc::clone(self);
        let period = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                recovery.cleanup_expired_tokens().await;
            }
        })
    }

    /// Verify answers, spending an attempt when they are wrong; caller holds the lock
    async fn check_answers(&self, record: &mut RecoveryToken, answers: &[&str]) -> Result<bool> {
        if self.accounts.verify_answers(&record.user_id, answers).await? {
            return Ok(true);
        }

        record.attempts += 1;
        tracing::warn!(
            "Wrong recovery answers for account {} ({} of {})",
            record.user_id,
            record.attempts,
            self.config.max_attempts
        );
        let key = keys::recovery(&record.token);
        if record.attempts >= self.config.max_attempts {
            self.storage.remove_item(&key).await?;
        } else {
            self.storage.set_item(&key, &*record).await?;
        }
        Ok(false)
    }

    async fn push_account(&self, remote: &dyn RemotePersistence, user_id: &str) -> Result<()> {
        let blob = self.accounts.export_blob(user_id).await?;
        remote.put_blob(user_id, &blob).await?;
        tracing::debug!("Pushed account blob for {}", user_id);
        Ok(())
    }

    fn is_dead(&self, record: &RecoveryToken) -> bool {
        self.clock.elapsed_since(record.timestamp) > self.config.token_ttl
            || record.attempts >= self.config.max_attempts
    }

    /// Load a token that is neither expired nor used up; dead tokens are deleted
    async fn live_token(&self, token: &str) -> Result<RecoveryToken> {
        let record: RecoveryToken = self
            .storage
            .get_item(&keys::recovery(token))
            .await?
            .ok_or(Error::InvalidRecoveryToken)?;

        if self.clock.elapsed_since(record.timestamp) > self.config.token_ttl {
            self.storage.remove_item(&keys::recovery(token)).await?;
            return Err(Error::RecoveryTokenExpired);
        }
        if record.attempts >= self.config.max_attempts {
            self.storage.remove_item(&keys::recovery(token)).await?;
            return Err(Error::RecoveryAttemptsExceeded);
        }
        Ok(record)
    }
}
