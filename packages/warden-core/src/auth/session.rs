//! Device-bound login sessions.
//!
//! ```text
//! create_session(user, biometric?)
//!   ├─ biometric prompt (optional)
//!   ├─ QuantumKeyExchange::establish_session  ──► quantum_key
//!   ├─ token = hex(SHA-256(quantum 32B ‖ OsRng 32B))
//!   ├─ store "session.<token>"
//!   └─ index "user_sessions.<user>" += token
//!        more than max_sessions? destroy the oldest (FIFO)
//!
//! validate_session(token)
//!   unknown ─────────────────────────► false
//!   older than session_duration ─────► destroyed, false
//!   device_id differs ───────────────► false
//!   key material older than refresh_threshold ──► refreshed, true
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;

use crate::config::SecurityConfig;
use crate::config::SessionConfig;
use crate::crypto::hashing::sha256_hex;
use crate::error::{Error, Result};
use crate::platform::{BiometricPrompt, PlatformKeystore};
use crate::quantum::QuantumKeyExchange;
use crate::storage::{keys, SecureStorage};
use crate::time::Clock;

/// A login session record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    /// Owner
    pub user_id: String,
    /// Session token
    pub token: String,
    /// Id of the quantum session backing this login
    pub quantum_key: String,
    /// Creation time, Unix milliseconds
    pub created_at: i64,
    /// Last key refresh, Unix milliseconds
    pub last_refreshed: i64,
    /// Device the session is bound to
    pub device_id: String,
    /// Whether login passed a biometric prompt
    pub biometric_verified: bool,
    /// Whether the user completed MFA in this session
    pub mfa_verified: bool,
}

/// Creates, validates and destroys login sessions
pub struct SessionManager {
    storage: Arc<SecureStorage>,
    exchange: Arc<QuantumKeyExchange>,
    keystore: Arc<dyn PlatformKeystore>,
    biometric: Arc<dyn BiometricPrompt>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    device_key: String,
    device_id: OnceCell<String>,
    index_lock: Mutex<()>,
    current: RwLock<HashMap<String, String>>,
}

impl SessionManager {
    /// Create a manager
    pub fn new(
        config: &SecurityConfig,
        storage: Arc<SecureStorage>,
        exchange: Arc<QuantumKeyExchange>,
        keystore: Arc<dyn PlatformKeystore>,
        biometric: Arc<dyn BiometricPrompt>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            exchange,
            keystore,
            biometric,
            clock,
            config: config.sessions.clone(),
            device_key: format!("{}.{}", config.storage.namespace, keys::DEVICE_ID),
            device_id: OnceCell::new(),
            index_lock: Mutex::new(()),
            current: RwLock::new(HashMap::new()),
        }
    }

    /// Log `user_id` in on this device
    pub async fn create_session(&self, user_id: &str, use_biometric: bool) -> Result<SessionData> {
        let biometric_verified = if use_biometric {
            self.prompt_biometric().await?;
            true
        } else {
            false
        };

        let quantum = self.exchange.establish_session()?;
        let token = self.generate_token()?;
        let now = self.clock.now_millis();

        let session = SessionData {
            user_id: user_id.to_string(),
            token: token.clone(),
            quantum_key: quantum.id.clone(),
            created_at: now,
            last_refreshed: now,
            device_id: self.device_id().await?,
            biometric_verified,
            mfa_verified: false,
        };

        {
            let _guard = self.index_lock.lock().await;
            let mut tokens = match self.read_index(user_id).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    self.exchange.remove_session(&quantum.id);
                    return Err(e);
                }
            };
            self.storage.set_item(&keys::session(&token), &session).await?;
            tokens.push(token.clone());

            while tokens.len() > self.config.max_sessions {
                let oldest = tokens.remove(0);
                tracing::info!("Evicting oldest session for user {}", user_id);
                self.remove_record(&oldest).await?;
            }
            self.storage
                .set_item(&keys::user_sessions(user_id), &tokens)
                .await?;
        }

        self.current
            .write()
            .insert(user_id.to_string(), token.clone());
        tracing::info!("Session created for user {}", user_id);

        Ok(session)
    }

    /// Whether `token` names a live session bound to this device
    ///
    /// Sessions past their lifetime are destroyed. Key material older than
    /// the refresh threshold is replaced.
    pub async fn validate_session(&self, token: &str) -> Result<bool> {
        let Some(mut session) = self.get_session(token).await? else {
            return Ok(false);
        };

        if self.clock.elapsed_since(session.created_at) > self.config.session_duration {
            tracing::info!("Session for user {} expired", session.user_id);
            self.destroy_session(token).await?;
            return Ok(false);
        }

        if session.device_id != self.device_id().await? {
            tracing::warn!("Session for user {} presented from another device", session.user_id);
            return Ok(false);
        }

        if self.clock.elapsed_since(session.last_refreshed) > self.config.refresh_threshold {
            self.refresh_key_material(&mut session).await?;
        }

        Ok(true)
    }

    /// Replace the session's key material now
    pub async fn refresh_session(&self, token: &str) -> Result<SessionData> {
        let mut session = self
            .get_session(token)
            .await?
            .ok_or(Error::InvalidSession)?;
        self.refresh_key_material(&mut session).await?;
        Ok(session)
    }

    /// Load a session record
    pub async fn get_session(&self, token: &str) -> Result<Option<SessionData>> {
        self.storage.get_item(&keys::session(token)).await
    }

    /// Remove a session and its index entry
    pub async fn destroy_session(&self, token: &str) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let owner = match self.get_session(token).await {
            Ok(session) => session.map(|s| s.user_id),
            Err(_) => None,
        };
        let Some(user_id) = owner else {
            self.remove_record(token).await?;
            return Ok(());
        };

        let mut tokens = self.read_index(&user_id).await?;
        self.remove_record(token).await?;
        tokens.retain(|t| t != token);
        self.storage
            .set_item(&keys::user_sessions(&user_id), &tokens)
            .await?;

        tracing::info!("Session destroyed for user {}", user_id);
        Ok(())
    }

    /// Remove every session of `user_id`, returning how many were removed
    pub async fn destroy_all_sessions(&self, user_id: &str) -> Result<usize> {
        let _guard = self.index_lock.lock().await;
        let tokens = self.read_index(user_id).await?;
        for token in &tokens {
            self.remove_record(token).await?;
        }
        self.storage.remove_item(&keys::user_sessions(user_id)).await?;
        self.current.write().remove(user_id);

        tracing::info!("Destroyed {} sessions for user {}", tokens.len(), user_id);
        Ok(tokens.len())
    }

    /// Live tokens of `user_id`, oldest first
    ///
    /// Storage failures degrade to an empty list.
    pub async fn get_active_sessions(&self, user_id: &str) -> Vec<String> {
        self.load_index(user_id).await
    }

    /// Token of the most recent session created for `user_id` in this process
    pub fn current_session(&self, user_id: &str) -> Option<String> {
        self.current.read().get(user_id).cloned()
    }

    /// Flag the current session of `user_id` as MFA-verified
    ///
    /// Returns false when the user has no current session.
    pub async fn mark_mfa_verified(&self, user_id: &str) -> Result<bool> {
        let Some(token) = self.current_session(user_id) else {
            return Ok(false);
        };
        let Some(mut session) = self.get_session(&token).await? else {
            return Ok(false);
        };

        session.mfa_verified = true;
        self.storage.set_item(&keys::session(&token), &session).await?;
        Ok(true)
    }

    /// Destroy every session past its lifetime
    ///
    /// Needs keystore enumeration; returns 0 when it is unsupported.
    pub async fn cleanup_expired_sessions(&self) -> usize {
        let stored = match self.storage.list_keys(keys::SESSION_PREFIX).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::debug!("Skipping session sweep: {}", e);
                return 0;
            }
        };

        let mut removed = 0;
        for key in stored {
            let Some(token) = key.strip_prefix(keys::SESSION_PREFIX) else {
                continue;
            };
            let session = match self.get_session(token).await {
                Ok(Some(session)) => session,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Unreadable session record during sweep: {}", e);
                    continue;
                }
            };

            if self.clock.elapsed_since(session.created_at) > self.config.session_duration {
                match self.destroy_session(token).await {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!("Failed to destroy expired session: {}", e),
                }
            }
        }

        if removed > 0 {
            tracing::info!("Swept {} expired login sessions", removed);
        }
        removed
    }

    /// Start the periodic expired-session sweep
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                manager.cleanup_expired_sessions().await;
            }
        })
    }

    /// Stable per-install device id, created on first use
    pub async fn device_id(&self) -> Result<String> {
        self.device_id
            .get_or_try_init(|| async {
                let stored = self
                    .keystore
                    .get(&self.device_key)
                    .await
                    .map_err(|e| Error::StorageReadError(format!("device id: {}", e)))?;

                if let Some(bytes) = stored {
                    return String::from_utf8(bytes).map_err(|_| {
                        Error::DataIntegrityViolation("device id is not UTF-8".into())
                    });
                }

                let id = uuid::Uuid::new_v4().to_string();
                self.keystore
                    .set(&self.device_key, id.as_bytes())
                    .await
                    .map_err(|e| Error::StorageWriteError(format!("device id: {}", e)))?;
                tracing::info!("Generated device id");
                Ok::<_, Error>(id)
            })
            .await
            .cloned()
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn prompt_biometric(&self) -> Result<()> {
        if !self.biometric.has_hardware().await {
            return Err(Error::BiometricUnavailable);
        }
        let outcome = self.biometric.authenticate("Sign in to Warden").await?;
        if !outcome.success {
            return Err(Error::BiometricFailed);
        }
        Ok(())
    }

    fn generate_token(&self) -> Result<String> {
        let mut material = self.exchange.quantum_random_bytes(32)?;
        let mut os = [0u8; 32];
        OsRng.fill_bytes(&mut os);
        material.extend_from_slice(&os);
        Ok(sha256_hex(&material))
    }

    async fn refresh_key_material(&self, session: &mut SessionData) -> Result<()> {
        let quantum = self.exchange.refresh_session(&session.quantum_key)?;
        session.quantum_key = quantum.id.clone();
        session.last_refreshed = self.clock.now_millis();
        self.storage
            .set_item(&keys::session(&session.token), session)
            .await?;
        tracing::debug!("Refreshed key material for user {}", session.user_id);
        Ok(())
    }

    /// Delete a session record and its quantum session; caller holds the index lock
    async fn remove_record(&self, token: &str) -> Result<Option<SessionData>> {
        let session: Option<SessionData> = match self.get_session(token).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Removing unreadable session record: {}", e);
                None
            }
        };
        self.storage.remove_item(&keys::session(token)).await?;

        if let Some(session) = &session {
            self.exchange.remove_session(&session.quantum_key);
            let mut current = self.current.write();
            if current.get(&session.user_id).map(String::as_str) == Some(token) {
                current.remove(&session.user_id);
            }
        }
        Ok(session)
    }

    /// Index for read-modify-write paths; read failures propagate
    async fn read_index(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .storage
            .get_item::<Vec<String>>(&keys::user_sessions(user_id))
            .await?
            .unwrap_or_default())
    }

    async fn load_index(&self, user_id: &str) -> Vec<String> {
        match self.read_index(user_id).await {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!("Could not read session index for {}: {}", user_id, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::platform::{MemoryKeystore, StaticBiometric};
    use crate::test_support::TestCore;

    #[tokio::test]
    async fn test_create_and_validate() {
        let core = TestCore::new();
        let session = core.sessions.create_session("user-1", false).await.unwrap();

        assert_eq!(session.token.len(), 64);
        assert!(!session.biometric_verified);
        assert!(core.sessions.validate_session(&session.token).await.unwrap());
        assert!(!core.sessions.validate_session("unknown").await.unwrap());
        assert_eq!(
            core.sessions.get_active_sessions("user-1").await,
            vec![session.token.clone()]
        );
        assert_eq!(core.sessions.current_session("user-1"), Some(session.token));
    }

    #[tokio::test]
    async fn test_sixth_session_evicts_oldest() {
        let core = TestCore::new();
        let mut tokens = Vec::new();
        for _ in 0..5 {
            tokens.push(core.sessions.create_session("user-1", false).await.unwrap().token);
        }
        let sixth = core.sessions.create_session("user-1", false).await.unwrap().token;

        let active = core.sessions.get_active_sessions("user-1").await;
        assert_eq!(active.len(), 5);
        assert!(!active.contains(&tokens[0]));
        assert_eq!(&active[..4], &tokens[1..]);
        assert_eq!(active[4], sixth);

        assert!(core.sessions.get_session(&tokens[0]).await.unwrap().is_none());
        for token in &tokens[1..] {
            assert!(core.sessions.validate_session(token).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_index_read_failure_keeps_index() {
        let core = TestCore::new();
        let mut tokens = Vec::new();
        for _ in 0..3 {
            tokens.push(core.sessions.create_session("user-1", false).await.unwrap().token);
        }

        core.storage.clear_cache();
        core.keystore.fail_next_read("user_sessions.user-1");
        let err = core.sessions.create_session("user-1", false).await.unwrap_err();
        assert_eq!(err.code(), "STORAGE_READ_ERROR");
        assert_eq!(core.sessions.get_active_sessions("user-1").await, tokens);
        assert_eq!(core.sessions.current_session("user-1").as_ref(), tokens.last());

        let fourth = core.sessions.create_session("user-1", false).await.unwrap().token;
        tokens.push(fourth);
        assert_eq!(core.sessions.get_active_sessions("user-1").await, tokens);

        core.storage.clear_cache();
        core.keystore.fail_next_read("user_sessions.user-1");
        assert!(core.sessions.destroy_session(&tokens[0]).await.is_err());
        assert!(core.sessions.validate_session(&tokens[0]).await.unwrap());
        assert_eq!(core.sessions.get_active_sessions("user-1").await.len(), 4);
    }

    #[tokio::test]
    async fn test_expired_session_invalid() {
        let core = TestCore::new();
        let token = core.sessions.create_session("user-1", false).await.unwrap().token;

        core.clock.advance(Duration::from_secs(61 * 60));
        assert!(!core.sessions.validate_session(&token).await.unwrap());
        assert!(core.sessions.get_session(&token).await.unwrap().is_none());
        assert!(core.sessions.get_active_sessions("user-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_key_material_refreshes() {
        let core = TestCore::new();
        let created = core.sessions.create_session("user-1", false).await.unwrap();

        core.clock.advance(Duration::from_secs(6 * 60));
        assert!(core.sessions.validate_session(&created.token).await.unwrap());

        let refreshed = core.sessions.get_session(&created.token).await.unwrap().unwrap();
        assert_ne!(refreshed.quantum_key, created.quantum_key);
        assert!(refreshed.last_refreshed > created.last_refreshed);
        assert_eq!(refreshed.created_at, created.created_at);
    }

    #[tokio::test]
    async fn test_device_mismatch() {
        let core = TestCore::new();
        let token = core.sessions.create_session("user-1", false).await.unwrap().token;

        core.keystore
            .set("warden.device_id", b"another-device")
            .await
            .unwrap();
        let other = core.session_manager_with(core.biometric.clone());

        assert!(!other.validate_session(&token).await.unwrap());
        assert!(core.sessions.validate_session(&token).await.unwrap());
    }

    #[tokio::test]
    async fn test_device_id_is_stable() {
        let core = TestCore::new();
        let first = core.sessions.device_id().await.unwrap();
        let other = core.session_manager_with(core.biometric.clone());
        assert_eq!(other.device_id().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_biometric_requirements() {
        let core = TestCore::new();
        let err = core.sessions.create_session("user-1", true).await.unwrap_err();
        assert_eq!(err.code(), "BIOMETRIC_UNAVAILABLE");

        let rejecting = core.session_manager_with(Arc::new(StaticBiometric::rejecting()));
        let err = rejecting.create_session("user-1", true).await.unwrap_err();
        assert_eq!(err.code(), "BIOMETRIC_FAILED");

        let accepting = core.session_manager_with(Arc::new(StaticBiometric::accepting()));
        let session = accepting.create_session("user-1", true).await.unwrap();
        assert!(session.biometric_verified);
    }

    #[tokio::test]
    async fn test_destroy_all_and_mfa_flag() {
        let core = TestCore::new();
        let token = core.sessions.create_session("user-1", false).await.unwrap().token;
        core.sessions.create_session("user-1", false).await.unwrap();

        assert!(core.sessions.mark_mfa_verified("user-1").await.unwrap());
        assert!(!core.sessions.mark_mfa_verified("user-2").await.unwrap());

        assert_eq!(core.sessions.destroy_all_sessions("user-1").await.unwrap(), 2);
        assert!(core.sessions.get_active_sessions("user-1").await.is_empty());
        assert!(!core.sessions.validate_session(&token).await.unwrap());
        assert!(core.sessions.current_session("user-1").is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired() {
        let core = TestCore::new();
        let old = core.sessions.create_session("user-1", false).await.unwrap().token;
        core.clock.advance(Duration::from_secs(40 * 60));
        let young = core.sessions.create_session("user-2", false).await.unwrap().token;
        core.clock.advance(Duration::from_secs(30 * 60));

        assert_eq!(core.sessions.cleanup_expired_sessions().await, 1);
        assert!(core.sessions.get_session(&old).await.unwrap().is_none());
        assert!(core.sessions.get_session(&young).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_without_enumeration() {
        let core = TestCore::with_keystore(MemoryKeystore::without_listing());
        core.sessions.create_session("user-1", false).await.unwrap();
        core.clock.advance(Duration::from_secs(2 * 60 * 60));
        assert_eq!(core.sessions.cleanup_expired_sessions().await, 0);
    }
}
