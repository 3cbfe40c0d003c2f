//! # Platform Collaborators
//!
//! Interfaces to the host platform services the security core consumes but
//! does not implement, plus in-memory implementations for development and
//! tests.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       PLATFORM COLLABORATORS                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Trait                 Used by                 In-memory impl           │
//! │  ─────────────────     ──────────────────────  ──────────────────────   │
//! │  PlatformKeystore      SecureStorage           MemoryKeystore           │
//! │  RemotePersistence     PasswordRecovery        MemoryRemoteStore        │
//! │  BiometricPrompt       SessionManager, MFA     StaticBiometric          │
//! │  PushDelivery          MFA                     DelayedPush              │
//! │  EmailDelivery         PasswordRecovery        RecordingEmail           │
//! │                                                                         │
//! │  iOS Keychain / Android Keystore / APNs / FCM bindings live in the     │
//! │  host app and implement these traits.                                  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

// ============================================================================
// TRAITS
// ============================================================================

/// At-rest secret storage (Keychain, Keystore)
#[async_trait]
pub trait PlatformKeystore: Send + Sync {
    /// Store bytes under `key`, replacing any previous value
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Load the bytes stored under `key`
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `key`; removing a missing key is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Enumerate stored keys
    ///
    /// Many platform keystores cannot enumerate; callers must degrade.
    async fn list_keys(&self) -> Result<Vec<String>> {
        Err(Error::NotSupported("keystore key enumeration".into()))
    }
}

/// Opaque encrypted-blob storage keyed by user id
#[async_trait]
pub trait RemotePersistence: Send + Sync {
    /// Upload a user's blob
    async fn put_blob(&self, user_id: &str, blob: &[u8]) -> Result<()>;

    /// Download a user's blob
    async fn get_blob(&self, user_id: &str) -> Result<Option<Vec<u8>>>;
}

/// Result of a biometric prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiometricOutcome {
    /// Whether the user authenticated
    pub success: bool,
}

/// OS biometric prompt (Face ID, fingerprint)
#[async_trait]
pub trait BiometricPrompt: Send + Sync {
    /// Whether the device has usable biometric hardware
    async fn has_hardware(&self) -> bool;

    /// Show the prompt and wait for the user
    async fn authenticate(&self, prompt: &str) -> Result<BiometricOutcome>;
}

/// Push-notification challenge delivery
#[async_trait]
pub trait PushDelivery: Send + Sync {
    /// Send an approve/deny challenge and wait for the answer
    async fn send_challenge(&self, user_id: &str) -> Result<bool>;
}

/// Recovery email delivery
#[async_trait]
pub trait EmailDelivery: Send + Sync {
    /// Send a recovery token to `email`
    async fn send(&self, email: &str, token: &str) -> Result<()>;
}

/// The full set of collaborators handed to [`crate::WardenCore`]
#[derive(Clone)]
pub struct Platform {
    /// Secret storage
    pub keystore: Arc<dyn PlatformKeystore>,
    /// Biometric prompt
    pub biometric: Arc<dyn BiometricPrompt>,
    /// Push challenges
    pub push: Arc<dyn PushDelivery>,
    /// Recovery emails
    pub email: Arc<dyn EmailDelivery>,
    /// Remote blob storage, if the app syncs credentials
    pub remote: Option<Arc<dyn RemotePersistence>>,
}

impl Platform {
    /// In-memory collaborators for development and tests
    pub fn in_memory() -> Self {
        Self {
            keystore: Arc::new(MemoryKeystore::new()),
            biometric: Arc::new(StaticBiometric::unavailable()),
            push: Arc::new(DelayedPush::new(Duration::from_millis(100))),
            email: Arc::new(RecordingEmail::new()),
            remote: None,
        }
    }
}

// ============================================================================
// IN-MEMORY IMPLEMENTATIONS
// ============================================================================

/// Keystore backed by a `HashMap`
#[derive(Debug)]
pub struct MemoryKeystore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    enumerable: bool,
    failing_read: Mutex<Option<String>>,
}

impl MemoryKeystore {
    /// A keystore that supports `list_keys`
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            enumerable: true,
            failing_read: Mutex::new(None),
        }
    }

    /// A keystore that behaves like the iOS Keychain and cannot enumerate
    pub fn without_listing() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            enumerable: false,
            failing_read: Mutex::new(None),
        }
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Fail the next `get` of a key containing `fragment`
    pub fn fail_next_read(&self, fragment: &str) {
        *self.failing_read.lock() = Some(fragment.to_string());
    }
}

impl Default for MemoryKeystore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformKeystore for MemoryKeystore {
    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        {
            let mut failing = self.failing_read.lock();
            if failing.as_deref().is_some_and(|f| key.contains(f)) {
                *failing = None;
                return Err(Error::StorageReadError(format!("keystore unavailable: {}", key)));
            }
        }
        Ok(self.entries.read().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        if !self.enumerable {
            return Err(Error::NotSupported("keystore key enumeration".into()));
        }
        Ok(self.entries.read().keys().cloned().collect())
    }
}

/// Remote blob store backed by a `HashMap`
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    offline: AtomicBool,
}

impl MemoryRemoteStore {
    /// An empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until switched back
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemotePersistence for MemoryRemoteStore {
    async fn put_blob(&self, user_id: &str, blob: &[u8]) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::StorageWriteError("remote store offline".into()));
        }
        self.blobs.write().insert(user_id.to_string(), blob.to_vec());
        Ok(())
    }

    async fn get_blob(&self, user_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(user_id).cloned())
    }
}

/// Biometric prompt with a fixed answer
#[derive(Debug)]
pub struct StaticBiometric {
    hardware: bool,
    accept: AtomicBool,
}

impl StaticBiometric {
    /// Hardware present, every prompt succeeds
    pub fn accepting() -> Self {
        Self {
            hardware: true,
            accept: AtomicBool::new(true),
        }
    }

    /// Hardware present, every prompt is rejected
    pub fn rejecting() -> Self {
        Self {
            hardware: true,
            accept: AtomicBool::new(false),
        }
    }

    /// No biometric hardware
    pub fn unavailable() -> Self {
        Self {
            hardware: false,
            accept: AtomicBool::new(false),
        }
    }

    /// Change the answer for later prompts
    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }
}

#[async_trait]
impl BiometricPrompt for StaticBiometric {
    async fn has_hardware(&self) -> bool {
        self.hardware
    }

    async fn authenticate(&self, prompt: &str) -> Result<BiometricOutcome> {
        if !self.hardware {
            return Err(Error::BiometricUnavailable);
        }
        tracing::debug!("Biometric prompt: {}", prompt);
        Ok(BiometricOutcome {
            success: self.accept.load(Ordering::SeqCst),
        })
    }
}

/// Push delivery that approves every challenge after a delay
#[derive(Debug, Clone)]
pub struct DelayedPush {
    delay: Duration,
}

impl DelayedPush {
    /// Approve after `delay`
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl PushDelivery for DelayedPush {
    async fn send_challenge(&self, user_id: &str) -> Result<bool> {
        tracing::debug!("Push challenge sent to {}", user_id);
        tokio::time::sleep(self.delay).await;
        Ok(true)
    }
}

/// Email delivery that records what it was asked to send
#[derive(Debug, Default)]
pub struct RecordingEmail {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingEmail {
    /// An empty outbox
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(email, token)` sent so far
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    /// The most recent token sent to `email`
    pub fn last_token_for(&self, email: &str) -> Option<String> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|(to, _)| to == email)
            .map(|(_, token)| token.clone())
    }
}

#[async_trait]
impl EmailDelivery for RecordingEmail {
    async fn send(&self, email: &str, token: &str) -> Result<()> {
        self.sent.lock().push((email.to_string(), token.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_keystore() {
        let keystore = MemoryKeystore::new();
        keystore.set("a", b"one").await.unwrap();
        keystore.set("b", b"two").await.unwrap();

        assert_eq!(keystore.get("a").await.unwrap(), Some(b"one".to_vec()));
        let mut keys = keystore.list_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        keystore.delete("a").await.unwrap();
        keystore.delete("missing").await.unwrap();
        assert_eq!(keystore.get("a").await.unwrap(), None);
        assert_eq!(keystore.len(), 1);
    }

    #[tokio::test]
    async fn test_keystore_read_failure_is_one_shot() {
        let keystore = MemoryKeystore::new();
        keystore.set("warden.index", b"x").await.unwrap();
        keystore.fail_next_read("index");

        assert!(keystore.get("other").await.unwrap().is_none());
        let err = keystore.get("warden.index").await.unwrap_err();
        assert_eq!(err.code(), "STORAGE_READ_ERROR");
        assert_eq!(keystore.get("warden.index").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_keystore_without_listing() {
        let keystore = MemoryKeystore::without_listing();
        keystore.set("a", b"one").await.unwrap();
        let err = keystore.list_keys().await.unwrap_err();
        assert_eq!(err.code(), "NOT_SUPPORTED");
    }

    #[test]
    fn test_biometric_outcomes() {
        tokio_test::block_on(async {
            assert!(StaticBiometric::accepting().authenticate("x").await.unwrap().success);
            assert!(!StaticBiometric::rejecting().authenticate("x").await.unwrap().success);

            let none = StaticBiometric::unavailable();
            assert!(!none.has_hardware().await);
            assert_eq!(
                none.authenticate("x").await.unwrap_err().code(),
                "BIOMETRIC_UNAVAILABLE"
            );
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_push_approves() {
        let push = DelayedPush::new(Duration::from_secs(2));
        assert!(push.send_challenge("user").await.unwrap());
    }

    #[tokio::test]
    async fn test_recording_email() {
        let email = RecordingEmail::new();
        email.send("a@example.com", "t1").await.unwrap();
        email.send("b@example.com", "t2").await.unwrap();
        email.send("a@example.com", "t3").await.unwrap();

        assert_eq!(email.sent().len(), 3);
        assert_eq!(email.last_token_for("a@example.com").as_deref(), Some("t3"));
        assert_eq!(email.last_token_for("c@example.com"), None);
    }

    #[tokio::test]
    async fn test_remote_store() {
        let remote = MemoryRemoteStore::new();
        remote.put_blob("u1", b"blob").await.unwrap();
        assert_eq!(remote.get_blob("u1").await.unwrap(), Some(b"blob".to_vec()));
        assert_eq!(remote.get_blob("u2").await.unwrap(), None);

        remote.set_offline(true);
        assert!(remote.put_blob("u1", b"newer").await.is_err());
        assert_eq!(remote.get_blob("u1").await.unwrap(), Some(b"blob".to_vec()));
    }
}
