//! Account registration, password login and lockout.
//!
//! ```text
//! login(username, password)
//!   locked_until in the future ──► ACCOUNT_LOCKED { remainingTime }
//!   locked_until in the past   ──► lock cleared, continue
//!   wrong password             ──► failed_attempts += 1
//!                                   reached max? lock, ACCOUNT_LOCKED
//!                                   else INVALID_CREDENTIALS
//!   correct password           ──► counters reset, SessionManager::create_session
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::auth::session::{SessionData, SessionManager};
use crate::config::AuthConfig;
use crate::crypto::hashing::SecretHasher;
use crate::error::{Error, Result};
use crate::service::SecurityService;
use crate::storage::{keys, SecureStorage};
use crate::time::Clock;

/// A security question with its salted answer hash
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryQuestion {
    /// Question shown to the user
    pub question: String,
    /// Hex Argon2id hash of the normalized answer
    pub answer_hash: String,
    /// Hex salt for `answer_hash`
    pub salt: String,
}

/// Stored account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    /// Stable id
    pub user_id: String,
    /// Login name, case preserved
    pub username: String,
    /// Recovery email
    pub email: String,
    /// Hex Argon2id password hash
    pub password_hash: String,
    /// Hex salt for `password_hash`
    pub password_salt: String,
    /// Security questions
    pub recovery_questions: Vec<RecoveryQuestion>,
    /// Consecutive failed logins
    pub failed_attempts: u32,
    /// Lock expiry, Unix milliseconds
    pub locked_until: Option<i64>,
    /// Registration time, Unix milliseconds
    pub created_at: i64,
}

/// Registers accounts and logs them in
pub struct AccountService {
    storage: Arc<SecureStorage>,
    sessions: Arc<SessionManager>,
    security: Arc<SecurityService>,
    clock: Arc<dyn Clock>,
    hasher: SecretHasher,
    config: AuthConfig,
    write_lock: Mutex<()>,
}

impl AccountService {
    /// Create the service
    pub fn new(
        config: AuthConfig,
        storage: Arc<SecureStorage>,
        sessions: Arc<SessionManager>,
        security: Arc<SecurityService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            hasher: SecretHasher::new(config.password_hashing.clone()),
            storage,
            sessions,
            security,
            clock,
            config,
            write_lock: Mutex::new(()),
        }
    }

    /// Create an account
    ///
    /// `recovery_questions` pairs each question with its answer. Answers are
    /// compared case-insensitively with surrounding whitespace ignored.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: &str,
        recovery_questions: &[(&str, &str)],
    ) -> Result<AccountRecord> {
        let username = username.trim();
        if username.is_empty() {
            return Err(Error::InvalidConfig("username must not be empty".into()));
        }

        let _guard = self.write_lock.lock().await;
        if self
            .storage
            .contains(&keys::account_index(username))
            .await?
        {
            return Err(Error::UserExists(username.to_string()));
        }

        let (password_hash, password_salt) = self.hasher.hash_new(password)?;
        let recovery_questions = recovery_questions
            .iter()
            .map(|(question, answer)| -> Result<RecoveryQuestion> {
                let (answer_hash, salt) = self.hasher.hash_new(&normalize_answer(answer))?;
                Ok(RecoveryQuestion {
                    question: question.to_string(),
                    answer_hash,
                    salt,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let account = AccountRecord {
            user_id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            email: email.trim().to_string(),
            password_hash,
            password_salt,
            recovery_questions,
            failed_attempts: 0,
            locked_until: None,
            created_at: self.clock.now_millis(),
        };

        self.storage
            .set_item(&keys::account(&account.user_id), &account)
            .await?;
        self.storage
            .set_item(&keys::account_index(username), &account.user_id)
            .await?;

        tracing::info!("Registered account {}", account.user_id);
        Ok(account)
    }

    /// Check the password and open a login session
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        use_biometric: bool,
    ) -> Result<SessionData> {
        let user_id = {
            let _guard = self.write_lock.lock().await;
            let mut account = self
                .find_by_username(username)
                .await?
                .ok_or(Error::InvalidCredentials)?;
            let now = self.clock.now_millis();

            if let Some(until) = account.locked_until {
                if until > now {
                    return Err(Error::AccountLocked {
                        remaining_ms: (until - now) as u64,
                    });
                }
                tracing::info!("Lockout expired for account {}", account.user_id);
                account.locked_until = None;
                account.failed_attempts = 0;
                self.save(&account).await?;
            }

            if !self
                .hasher
                .verify(password, &account.password_hash, &account.password_salt)?
            {
                account.failed_attempts += 1;
                if account.failed_attempts >= self.config.max_failed_attempts {
                    let lockout = self.config.lockout_duration;
                    account.locked_until = Some(now + lockout.as_millis() as i64);
                    self.save(&account).await?;
                    tracing::warn!(
                        "Account {} locked after {} failed attempts",
                        account.user_id,
                        account.failed_attempts
                    );
                    return Err(Error::AccountLocked {
                        remaining_ms: lockout.as_millis() as u64,
                    });
                }
                self.save(&account).await?;
                return Err(Error::InvalidCredentials);
            }

            if account.failed_attempts > 0 || account.locked_until.is_some() {
                account.failed_attempts = 0;
                account.locked_until = None;
                self.save(&account).await?;
            }
            account.user_id
        };

        let session = self.sessions.create_session(&user_id, use_biometric).await?;
        tracing::info!("User {} logged in", user_id);
        Ok(session)
    }

    /// End a login session and rotate the encryption session
    pub async fn logout(&self, token: &str) -> Result<()> {
        self.sessions.destroy_session(token).await?;
        self.security.reset();
        self.security.initialize()?;
        tracing::info!("Logged out");
        Ok(())
    }

    /// Load an account by id
    pub async fn get_account(&self, user_id: &str) -> Result<Option<AccountRecord>> {
        self.storage.get_item(&keys::account(user_id)).await
    }

    /// Load an account by username, case-insensitively
    pub async fn find_by_username(&self, username: &str) -> Result<Option<AccountRecord>> {
        let user_id: Option<String> = self
            .storage
            .get_item(&keys::account_index(username.trim()))
            .await?;
        match user_id {
            Some(user_id) => self.get_account(&user_id).await,
            None => Ok(None),
        }
    }

    /// Check answers to every security question, in order
    pub async fn verify_answers(&self, user_id: &str, answers: &[&str]) -> Result<bool> {
        let account = self
            .get_account(user_id)
            .await?
            .ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;

        if answers.len() != account.recovery_questions.len() {
            return Ok(false);
        }

        let mut all_match = true;
        for (question, answer) in account.recovery_questions.iter().zip(answers) {
            all_match &=
                self.hasher
                    .verify(&normalize_answer(answer), &question.answer_hash, &question.salt)?;
        }
        Ok(all_match)
    }

    /// Encrypted account record, as pushed to remote persistence
    pub async fn export_blob(&self, user_id: &str) -> Result<Vec<u8>> {
        let account = self
            .get_account(user_id)
            .await?
            .ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;
        Ok(self.security.encrypt_data(&account)?.into_bytes())
    }

    /// Replace the password and clear any lockout
    pub(crate) async fn update_password(&self, user_id: &str, new_password: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut account = self
            .get_account(user_id)
            .await?
            .ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;

        let (hash, salt) = self.hasher.hash_new(new_password)?;
        account.password_hash = hash;
        account.password_salt = salt;
        account.failed_attempts = 0;
        account.locked_until = None;
        self.save(&account).await?;

        tracing::info!("Password updated for account {}", user_id);
        Ok(())
    }

    async fn save(&self, account: &AccountRecord) -> Result<()> {
        self.storage
            .set_item(&keys::account(&account.user_id), account)
            .await
    }
}

fn normalize_answer(answer: &str) -> String {
    answer.trim().to_lowercase()
}
