//! # Security Service
//!
//! The façade the rest of the app talks to. It owns the current quantum
//! session and turns arbitrary serde values into sealed text frames and
//! back.
//!
//! ## Sealed Frame
//!
//! ```text
//! value ──serde_json──► bytes ──codec──► f64 slots ──LWE──► Ciphertext
//!                                                               │
//!   base64( bincode( SealedFrame { key_id, ciphertext } ) ) ◄───┘
//! ```
//!
//! `key_id` names the quantum session whose key pair sealed the frame. When
//! the session is refreshed or reset, its secret key is retired into an
//! in-process key ring, so records written earlier in the process still
//! open. Retired keys are dropped after `key_retention`; [`SecureStorage`]
//! re-seals records under the current key before that happens. The ring is
//! never persisted.
//!
//! [`SecureStorage`]: crate::storage::SecureStorage

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::aggregation::{RoundConfig, RoundStatus, SecureAggregator};
use crate::crypto::codec::{decode_bytes, encode_bytes};
use crate::crypto::lattice::{Ciphertext, LatticeCrypto, SecretKey};
use crate::error::{Error, Result};
use crate::quantum::{QuantumKeyExchange, QuantumSession};
use crate::time::Clock;

/// Default lifetime of a retired key in the ring
pub const DEFAULT_KEY_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Serialize, Deserialize)]
struct SealedFrame {
    key_id: String,
    ciphertext: Ciphertext,
}

struct RetiredKey {
    secret_key: SecretKey,
    retired_at: i64,
}

struct RoundOpener {
    key_id: String,
    opened_at: i64,
}

/// Age and remaining lifetime of the current session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Quantum session id
    pub session_id: String,
    /// Establishment time, Unix milliseconds
    pub established_at: i64,
    /// Time since establishment
    pub age: Duration,
    /// Time until the session expires
    pub time_remaining: Duration,
}

/// Session-owning encryption façade
pub struct SecurityService {
    lattice: LatticeCrypto,
    exchange: Arc<QuantumKeyExchange>,
    aggregator: Arc<SecureAggregator>,
    clock: Arc<dyn Clock>,
    key_retention: Duration,
    current: RwLock<Option<Arc<QuantumSession>>>,
    key_ring: RwLock<HashMap<String, RetiredKey>>,
    round_openers: RwLock<HashMap<String, RoundOpener>>,
}

impl SecurityService {
    /// Create a service without a session
    pub fn new(
        lattice: LatticeCrypto,
        exchange: Arc<QuantumKeyExchange>,
        aggregator: Arc<SecureAggregator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            lattice,
            exchange,
            aggregator,
            clock,
            key_retention: DEFAULT_KEY_RETENTION,
            current: RwLock::new(None),
            key_ring: RwLock::new(HashMap::new()),
            round_openers: RwLock::new(HashMap::new()),
        }
    }

    /// Keep retired keys for `retention` instead of the default
    pub fn with_key_retention(mut self, retention: Duration) -> Self {
        self.key_retention = retention;
        self
    }

    // ========================================================================
    // SESSION
    // ========================================================================

    /// Establish a fresh current session, replacing any existing one
    pub fn initialize(&self) -> Result<SessionStatus> {
        let previous = self.current.read().clone();
        let session = match previous {
            Some(old) => self.exchange.refresh_session(&old.id)?,
            None => self.exchange.establish_session()?,
        };
        self.install(session.clone());
        Ok(self.status_of(&session))
    }

    /// The current session, if any
    pub fn current_session(&self) -> Option<Arc<QuantumSession>> {
        self.current.read().clone()
    }

    /// Whether a session is established
    pub fn has_session(&self) -> bool {
        self.current.read().is_some()
    }

    /// Replace the current session with a newly established one
    pub fn refresh_session(&self) -> Result<SessionStatus> {
        let old = self.current.read().clone().ok_or(Error::NoSession)?;
        let session = self.exchange.refresh_session(&old.id)?;
        self.install(session.clone());
        Ok(self.status_of(&session))
    }

    /// Age and remaining lifetime of the current session
    pub fn get_session_status(&self) -> Option<SessionStatus> {
        self.current.read().as_ref().map(|s| self.status_of(s))
    }

    /// Drop the current session; the next use establishes a new one
    ///
    /// The dropped secret key is retired to the key ring.
    pub fn reset(&self) {
        let taken = self.current.write().take();
        if let Some(session) = taken {
            self.retire(&session);
            self.exchange.remove_session(&session.id);
        }
        tracing::info!("Security service reset");
    }

    /// Whether `frame` was sealed under the current session's key
    pub fn is_sealed_under_current(&self, frame: &str) -> Result<bool> {
        let sealed = Self::parse_frame(frame)?;
        Ok(self
            .current
            .read()
            .as_ref()
            .is_some_and(|s| s.id == sealed.key_id))
    }

    /// Number of retired keys held
    pub fn retired_key_count(&self) -> usize {
        self.key_ring.read().len()
    }

    /// Drop retired keys older than the retention window, and round openers
    /// that are too old or whose key is gone
    pub fn prune_retired(&self) -> usize {
        let retention = self.key_retention;
        let removed_keys = {
            let mut ring = self.key_ring.write();
            let before = ring.len();
            ring.retain(|_, key| self.clock.elapsed_since(key.retired_at) <= retention);
            before - ring.len()
        };

        let current_id = self.current.read().as_ref().map(|s| s.id.clone());
        let removed_openers = {
            let ring = self.key_ring.read();
            let mut openers = self.round_openers.write();
            let before = openers.len();
            openers.retain(|_, opener| {
                self.clock.elapsed_since(opener.opened_at) <= retention
                    && (current_id.as_deref() == Some(opener.key_id.as_str())
                        || ring.contains_key(&opener.key_id))
            });
            before - openers.len()
        };

        if removed_keys + removed_openers > 0 {
            tracing::info!(
                "Pruned {} retired keys and {} round openers",
                removed_keys,
                removed_openers
            );
        }
        removed_keys + removed_openers
    }

    /// Start the periodic sweep of expired rounds and retired keys
    ///
    /// Runs on the aggregator's cleanup interval.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let period = self.aggregator.cleanup_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                service.aggregator.cleanup_expired_rounds();
                service.prune_retired();
            }
        })
    }

    // ========================================================================
    // ENCRYPT / DECRYPT
    // ========================================================================

    /// Seal a value under the current session, establishing one if needed
    pub fn encrypt_data<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        let bytes = serde_json::to_vec(value)?;
        self.encrypt_bytes(&bytes)
    }

    /// Open a frame produced by [`encrypt_data`](Self::encrypt_data)
    pub fn decrypt_data<T: DeserializeOwned>(&self, frame: &str) -> Result<T> {
        let bytes = self.decrypt_bytes(frame)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::DecryptionFailed(format!("Plaintext is not the expected type: {}", e)))
    }

    /// Seal raw bytes
    pub fn encrypt_bytes(&self, bytes: &[u8]) -> Result<String> {
        let session = self.ensure_session()?;
        let slots = encode_bytes(bytes)?;
        let ciphertext = self.lattice.encrypt(&slots, &session.key_pair.public_key)?;

        let frame = SealedFrame {
            key_id: session.id.clone(),
            ciphertext,
        };
        Ok(BASE64.encode(bincode::serialize(&frame)?))
    }

    /// Open raw bytes
    pub fn decrypt_bytes(&self, frame: &str) -> Result<Vec<u8>> {
        if !self.has_session() {
            return Err(Error::NoSession);
        }

        let frame = Self::parse_frame(frame)?;
        let secret_key = self.secret_key_for(&frame.key_id).ok_or_else(|| {
            Error::DecryptionFailed("Frame was sealed under a key this session does not hold".into())
        })?;

        let slots = self.lattice.decrypt(&frame.ciphertext, &secret_key)?;
        decode_bytes(&slots)
    }

    // ========================================================================
    // AGGREGATION
    // ========================================================================

    /// Open a round whose contributions are encrypted under the current key
    pub fn initialize_round(&self, mut config: RoundConfig) -> Result<String> {
        let session = self.ensure_session()?;
        if config.public_key.is_none() {
            config = config.with_public_key(session.key_pair.public_key.clone());
        }

        let round_id = self.aggregator.initialize_round(config)?;
        self.round_openers.write().insert(
            round_id.clone(),
            RoundOpener {
                key_id: session.id.clone(),
                opened_at: self.clock.now_millis(),
            },
        );
        Ok(round_id)
    }

    /// Status of a round
    pub fn get_round_status(&self, round_id: &str) -> Option<RoundStatus> {
        self.aggregator.get_round_status(round_id)
    }

    /// Encrypt `data` under the round's key and submit it
    pub fn participate_in_aggregation(
        &self,
        round_id: &str,
        participant_id: &str,
        data: &[f64],
    ) -> Result<()> {
        let public_key = match self.aggregator.round_public_key(round_id)? {
            Some(key) => key,
            None => self.ensure_session()?.key_pair.public_key.clone(),
        };
        let ciphertext = self.lattice.encrypt(data, &public_key)?;
        self.aggregator
            .submit_update(round_id, participant_id, ciphertext)
    }

    /// Close a round and return the noised aggregate ciphertext
    pub fn finalize_round(&self, round_id: &str) -> Result<Ciphertext> {
        self.aggregator.finalize_round(round_id)
    }

    /// Decrypt a finalized aggregate with the key of the session that opened it
    pub fn decrypt_aggregate(&self, round_id: &str, aggregate: &Ciphertext) -> Result<Vec<f64>> {
        let opener = self
            .round_openers
            .write()
            .remove(round_id)
            .ok_or_else(|| Error::InvalidRound(round_id.to_string()))?;
        let secret_key = self.secret_key_for(&opener.key_id).ok_or(Error::NoSession)?;

        self.lattice.decrypt(aggregate, &secret_key)
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn ensure_session(&self) -> Result<Arc<QuantumSession>> {
        if let Some(session) = self.current_session() {
            if self.exchange.validate_session(&session.id) {
                return Ok(session);
            }
            tracing::info!("Current quantum session expired, refreshing");
            let fresh = self.exchange.refresh_session(&session.id)?;
            self.install(fresh.clone());
            return Ok(fresh);
        }

        let session = self.exchange.establish_session()?;
        self.install(session.clone());
        Ok(session)
    }

    fn install(&self, session: Arc<QuantumSession>) {
        let previous = self.current.write().replace(session);
        if let Some(previous) = previous {
            self.retire(&previous);
        }
        self.prune_retired();
    }

    fn retire(&self, session: &QuantumSession) {
        self.key_ring.write().insert(
            session.id.clone(),
            RetiredKey {
                secret_key: session.key_pair.secret_key.clone(),
                retired_at: self.clock.now_millis(),
            },
        );
    }

    fn secret_key_for(&self, key_id: &str) -> Option<SecretKey> {
        let current = self.current.read().clone();
        if let Some(session) = current.filter(|s| s.id == key_id) {
            return Some(session.key_pair.secret_key.clone());
        }
        self.key_ring
            .read()
            .get(key_id)
            .map(|key| key.secret_key.clone())
    }

    fn parse_frame(frame: &str) -> Result<SealedFrame> {
        let raw = BASE64.decode(frame.trim())?;
        bincode::deserialize(&raw)
            .map_err(|e| Error::InvalidCiphertext(format!("Malformed frame: {}", e)))
    }

    fn status_of(&self, session: &QuantumSession) -> SessionStatus {
        SessionStatus {
            session_id: session.id.clone(),
            established_at: session.timestamp,
            age: self.clock.elapsed_since(session.timestamp),
            time_remaining: self.exchange.time_remaining(session),
        }
    }
}
