//! Encrypted key-value storage on top of the platform keystore.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::StorageConfig;
use crate::crypto::hashing::{constant_time_eq, sha256_hex};
use crate::error::{Error, Result};
use crate::platform::PlatformKeystore;
use crate::service::SecurityService;
use crate::storage::keys;
use crate::time::Clock;

/// Envelope format version
pub const ENVELOPE_VERSION: u32 = 1;

/// At-rest representation of a stored value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEnvelope {
    /// Format version
    pub version: u32,
    /// Sealed frame from [`SecurityService::encrypt_data`]
    pub ciphertext: String,
    /// Hex SHA-256 of the canonical JSON plaintext
    pub integrity: String,
    /// Write time, Unix milliseconds
    pub stored_at: i64,
}

struct CacheEntry {
    value: Value,
    cached_at: i64,
}

/// Encrypting, integrity-checked store with a short-lived plaintext cache
pub struct SecureStorage {
    security: Arc<SecurityService>,
    keystore: Arc<dyn PlatformKeystore>,
    clock: Arc<dyn Clock>,
    config: StorageConfig,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl SecureStorage {
    /// Create a store
    pub fn new(
        security: Arc<SecurityService>,
        keystore: Arc<dyn PlatformKeystore>,
        clock: Arc<dyn Clock>,
        config: StorageConfig,
    ) -> Self {
        Self {
            security,
            keystore,
            clock,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Encrypt and persist `value` under `key`
    pub async fn set_item<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let integrity = sha256_hex(&serde_json::to_vec(&value)?);
        let ciphertext = self.security.encrypt_data(&value)?;

        let envelope = StoredEnvelope {
            version: ENVELOPE_VERSION,
            ciphertext,
            integrity,
            stored_at: self.clock.now_millis(),
        };
        let bytes = serde_json::to_vec(&envelope)?;

        self.keystore
            .set(&self.namespaced(key), &bytes)
            .await
            .map_err(|e| Error::StorageWriteError(format!("{}: {}", key, e)))?;

        self.cache.write().insert(
            key.to_string(),
            CacheEntry {
                value,
                cached_at: self.clock.now_millis(),
            },
        );
        Ok(())
    }

    /// Load and verify the value under `key`
    pub async fn get_item<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let value = match self.cached(key) {
            Some(value) => value,
            None => match self.load(key).await? {
                Some(value) => value,
                None => return Ok(None),
            },
        };

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| Error::SerializationError(format!("{}: {}", key, e)))
    }

    /// Remove `key` from the keystore and the cache
    pub async fn remove_item(&self, key: &str) -> Result<()> {
        self.cache.write().remove(key);
        self.keystore
            .delete(&self.namespaced(key))
            .await
            .map_err(|e| Error::StorageWriteError(format!("{}: {}", key, e)))
    }

    /// Whether anything is stored under `key`
    pub async fn contains(&self, key: &str) -> Result<bool> {
        if self.cache.read().contains_key(key) {
            return Ok(true);
        }
        let stored = self
            .keystore
            .get(&self.namespaced(key))
            .await
            .map_err(|e| Error::StorageReadError(format!("{}: {}", key, e)))?;
        Ok(stored.is_some())
    }

    /// Stored keys starting with `prefix`, without the namespace
    ///
    /// Fails with `NOT_SUPPORTED` when the keystore cannot enumerate.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let namespace = format!("{}.", self.config.namespace);
        let keys = self.keystore.list_keys().await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&namespace).map(str::to_string))
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    /// Drop every cached plaintext
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    /// Drop cached plaintexts older than the TTL
    pub fn cleanup_cache(&self) -> usize {
        let ttl = self.config.cache_ttl;
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, entry| self.clock.elapsed_since(entry.cached_at) < ttl);
        before - cache.len()
    }

    /// Number of cached plaintexts
    pub fn cache_len(&self) -> usize {
        self.cache.read().len()
    }

    /// Re-seal every record still sealed under a retired key
    ///
    /// Needs keystore enumeration and a current session; returns 0 otherwise.
    pub async fn reseal_stale(&self) -> usize {
        if !self.security.has_session() {
            return 0;
        }
        let stored = match self.list_keys("").await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::debug!("Skipping re-seal sweep: {}", e);
                return 0;
            }
        };

        let mut resealed = 0;
        for key in stored.iter().filter(|k| k.as_str() != keys::DEVICE_ID) {
            match self.reseal(key).await {
                Ok(true) => resealed += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("Could not re-seal stored value {}: {}", key, e),
            }
        }
        if resealed > 0 {
            tracing::info!("Re-sealed {} stored values under the current key", resealed);
        }
        resealed
    }

    /// Start the periodic cache eviction and re-seal sweep
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let storage = Arc::clone(self);
        let period = self.config.cache_ttl;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                storage.cleanup_cache();
                storage.reseal_stale().await;
            }
        })
    }

    fn cached(&self, key: &str) -> Option<Value> {
        let cache = self.cache.read();
        let entry = cache.get(key)?;
        if self.clock.elapsed_since(entry.cached_at) >= self.config.cache_ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let Some(envelope) = self.read_envelope(key).await? else {
            return Ok(None);
        };
        let value = self.open_envelope(key, &envelope)?;

        match self.security.is_sealed_under_current(&envelope.ciphertext) {
            Ok(true) => {}
            _ => {
                if let Err(e) = self.set_item(key, &value).await {
                    tracing::warn!("Could not re-seal stored value {}: {}", key, e);
                }
            }
        }

        self.cache.write().insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                cached_at: self.clock.now_millis(),
            },
        );
        Ok(Some(value))
    }

    /// Rewrite `key` under the current key if it is sealed under a retired one
    async fn reseal(&self, key: &str) -> Result<bool> {
        let Some(envelope) = self.read_envelope(key).await? else {
            return Ok(false);
        };
        if self.security.is_sealed_under_current(&envelope.ciphertext)? {
            return Ok(false);
        }
        let value = self.open_envelope(key, &envelope)?;
        self.set_item(key, &value).await?;
        Ok(true)
    }

    async fn read_envelope(&self, key: &str) -> Result<Option<StoredEnvelope>> {
        let bytes = match self
            .keystore
            .get(&self.namespaced(key))
            .await
            .map_err(|e| Error::StorageReadError(format!("{}: {}", key, e)))?
        {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        let envelope: StoredEnvelope = serde_json::from_slice(&bytes).map_err(|_| {
            Error::DataIntegrityViolation(format!("{}: malformed envelope", key))
        })?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(Error::DataIntegrityViolation(format!(
                "{}: unknown envelope version {}",
                key, envelope.version
            )));
        }
        Ok(Some(envelope))
    }

    fn open_envelope(&self, key: &str, envelope: &StoredEnvelope) -> Result<Value> {
        let value: Value = match self.security.decrypt_data(&envelope.ciphertext) {
            Ok(value) => value,
            Err(Error::NoSession) => return Err(Error::NoSession),
            Err(e) => {
                tracing::warn!("Stored value {} failed to open: {}", key, e);
                return Err(Error::DataIntegrityViolation(format!(
                    "{}: ciphertext does not open",
                    key
                )));
            }
        };

        let digest = sha256_hex(&serde_json::to_vec(&value)?);
        if !constant_time_eq(digest.as_bytes(), envelope.integrity.as_bytes()) {
            tracing::warn!("Integrity check failed for stored value {}", key);
            return Err(Error::DataIntegrityViolation(format!(
                "{}: integrity hash mismatch",
                key
            )));
        }
        Ok(value)
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}.{}", self.config.namespace, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::aggregation::SecureAggregator;
    use crate::config::{SecurityConfig, TimingBudgets};
    use crate::crypto::lattice::LatticeCrypto;
    use crate::platform::MemoryKeystore;
    use crate::quantum::QuantumKeyExchange;
    use crate::time::ManualClock;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        streak: u32,
    }

    struct Fixture {
        storage: SecureStorage,
        keystore: Arc<MemoryKeystore>,
        clock: Arc<ManualClock>,
    }

    fn fixture_with(keystore: MemoryKeystore) -> Fixture {
        let config = SecurityConfig {
            timing: TimingBudgets::relaxed(),
            ..SecurityConfig::default()
        };
        let clock = Arc::new(ManualClock::starting_now());
        let lattice = LatticeCrypto::new(config.lattice.clone(), config.timing.clone());
        let exchange = Arc::new(QuantumKeyExchange::new(&config, clock.clone()));
        let aggregator = Arc::new(SecureAggregator::new(
            config.aggregation.clone(),
            lattice.clone(),
            clock.clone(),
        ));
        let security = Arc::new(SecurityService::new(lattice, exchange, aggregator, clock.clone()));
        let keystore = Arc::new(keystore);
        let storage = SecureStorage::new(security, keystore.clone(), clock.clone(), config.storage);
        Fixture {
            storage,
            keystore,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryKeystore::new())
    }

    async fn envelope(f: &Fixture, key: &str) -> StoredEnvelope {
        let bytes = f.keystore.get(&format!("warden.{}", key)).await.unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn put_envelope(f: &Fixture, key: &str, envelope: &StoredEnvelope) {
        f.keystore
            .set(&format!("warden.{}", key), &serde_json::to_vec(envelope).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let f = fixture();
        let profile = Profile {
            name: "Ada".into(),
            streak: 12,
        };
        f.storage.set_item("profile", &profile).await.unwrap();

        // Ciphertext only at rest
        let stored = envelope(&f, "profile").await;
        assert!(!stored.ciphertext.contains("Ada"));
        assert_eq!(stored.version, ENVELOPE_VERSION);

        f.storage.clear_cache();
        let loaded: Profile = f.storage.get_item("profile").await.unwrap().unwrap();
        assert_eq!(loaded, profile);
        assert!(f.storage.contains("profile").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_key() {
        let f = fixture();
        let loaded: Option<Profile> = f.storage.get_item("nothing").await.unwrap();
        assert!(loaded.is_none());
        assert!(!f.storage.contains("nothing").await.unwrap());
    }

    #[tokio::test]
    async fn test_tampered_integrity_detected() {
        let f = fixture();
        f.storage.set_item("a", &json!({ "n": 1 })).await.unwrap();
        f.storage.clear_cache();

        let mut stored = envelope(&f, "a").await;
        stored.integrity = sha256_hex(b"something else");
        put_envelope(&f, "a", &stored).await;

        let err = f.storage.get_item::<Value>("a").await.unwrap_err();
        assert_eq!(err.code(), "DATA_INTEGRITY_VIOLATION");
    }

    #[tokio::test]
    async fn test_swapped_ciphertext_detected() {
        let f = fixture();
        f.storage.set_item("a", &json!({ "n": 1 })).await.unwrap();
        f.storage.set_item("b", &json!({ "n": 2 })).await.unwrap();
        f.storage.clear_cache();

        let mut a = envelope(&f, "a").await;
        a.ciphertext = envelope(&f, "b").await.ciphertext;
        put_envelope(&f, "a", &a).await;

        let err = f.storage.get_item::<Value>("a").await.unwrap_err();
        assert_eq!(err.code(), "DATA_INTEGRITY_VIOLATION");
    }

    #[tokio::test]
    async fn test_garbage_envelope_detected() {
        let f = fixture();
        f.storage.set_item("a", &1u8).await.unwrap();
        f.storage.clear_cache();
        f.keystore.set("warden.a", b"not json").await.unwrap();

        let err = f.storage.get_item::<u8>("a").await.unwrap_err();
        assert_eq!(err.code(), "DATA_INTEGRITY_VIOLATION");
    }

    #[tokio::test]
    async fn test_cache_expiry() {
        let f = fixture();
        f.storage.set_item("a", &"cached").await.unwrap();
        assert_eq!(f.storage.cache_len(), 1);

        f.clock.advance(Duration::from_secs(4 * 60));
        assert_eq!(f.storage.cleanup_cache(), 0);

        f.clock.advance(Duration::from_secs(2 * 60));
        assert_eq!(f.storage.cleanup_cache(), 1);
        assert_eq!(f.storage.cache_len(), 0);

        // Still readable from the keystore
        let loaded: String = f.storage.get_item("a").await.unwrap().unwrap();
        assert_eq!(loaded, "cached");
    }

    #[tokio::test]
    async fn test_remove_and_list() {
        let f = fixture();
        f.storage.set_item("session.t1", &1).await.unwrap();
        f.storage.set_item("session.t2", &2).await.unwrap();
        f.storage.set_item("account.u1", &3).await.unwrap();

        let mut keys = f.storage.list_keys("session.").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["session.t1", "session.t2"]);

        f.storage.remove_item("session.t1").await.unwrap();
        assert!(f.storage.get_item::<i32>("session.t1").await.unwrap().is_none());
        assert_eq!(f.storage.list_keys("session.").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_records_resealed() {
        let f = fixture();
        f.storage.set_item("a", &json!({ "n": 1 })).await.unwrap();
        f.storage.set_item("b", &json!({ "n": 2 })).await.unwrap();
        let before = envelope(&f, "a").await.ciphertext;

        f.storage.security.refresh_session().unwrap();
        f.storage.clear_cache();
        let a: Value = f.storage.get_item("a").await.unwrap().unwrap();
        assert_eq!(a, json!({ "n": 1 }));

        let after = envelope(&f, "a").await.ciphertext;
        assert_ne!(before, after);
        assert!(f.storage.security.is_sealed_under_current(&after).unwrap());

        assert_eq!(f.storage.reseal_stale().await, 1);
        assert_eq!(f.storage.reseal_stale().await, 0);
        let b = envelope(&f, "b").await.ciphertext;
        assert!(f.storage.security.is_sealed_under_current(&b).unwrap());
    }

    #[tokio::test]
    async fn test_resealed_records_outlive_key_retention() {
        let f = fixture();
        f.storage.set_item("profile", &"kept").await.unwrap();

        f.storage.security.reset();
        f.storage.security.initialize().unwrap();
        assert_eq!(f.storage.reseal_stale().await, 1);

        f.clock.advance(Duration::from_secs(25 * 60 * 60));
        f.storage.security.refresh_session().unwrap();
        assert_eq!(f.storage.security.retired_key_count(), 1);

        f.storage.clear_cache();
        let loaded: String = f.storage.get_item("profile").await.unwrap().unwrap();
        assert_eq!(loaded, "kept");
    }

    #[tokio::test]
    async fn test_list_unsupported() {
        let f = fixture_with(MemoryKeystore::without_listing());
        f.storage.set_item("a", &1).await.unwrap();
        let err = f.storage.list_keys("").await.unwrap_err();
        assert_eq!(err.code(), "NOT_SUPPORTED");
    }
}
