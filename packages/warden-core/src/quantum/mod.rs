//! # Quantum Key Exchange
//!
//! A software simulation of a BB84-style QKD handshake, used as the key
//! derivation ritual for every session key pair in Warden Core. No quantum
//! hardware is involved.
//!
//! ## Handshake
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SESSION ESTABLISHMENT                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  1. bb84::exchange       4 × min_entropy EPR pairs, random bases        │
//! │          │               sift matching-basis positions                  │
//! │          │               simulated channel noise on the receiver side   │
//! │          ▼                                                              │
//! │     sifted < min_entropy? ──────────────► INSUFFICIENT_ENTROPY          │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  2. reconciliation       CASCADE parity bisection                       │
//! │          │               corrections / len > 0.11 ──► HIGH_QBER         │
//! │          ▼                                                              │
//! │  3. amplification        SHA-256(corrected key) = 32 bytes              │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  4. key pair             LatticeCrypto::generate_key_pair_from_seed     │
//! │          │                                                              │
//! │          ▼                                                              │
//! │     QuantumSession { id, key_pair, timestamp, nonce }                   │
//! │                                                                         │
//! │  Whole pipeline must finish inside the session_establishment budget.   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Session Lifetime
//!
//! Sessions are cached in memory by id and are valid for
//! `QkdConfig::session_timeout`. [`QuantumKeyExchange::spawn_cleanup`] runs
//! the periodic sweep; lookups also check age lazily.

pub mod bb84;
pub mod reconciliation;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hkdf::Hkdf;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::config::{QkdConfig, SecurityConfig};
use crate::crypto::lattice::{LatticeCrypto, QuantumKeyPair};
use crate::crypto::timing::guarded;
use crate::error::{Error, Result};
use crate::time::Clock;

pub use reconciliation::{Reconciled, Reconciler};

/// HKDF info string for [`QuantumKeyExchange::quantum_random_bytes`]
const ENTROPY_DOMAIN: &[u8] = b"warden-quantum-entropy-v1";

/// An established QKD session
#[derive(Debug)]
pub struct QuantumSession {
    /// Opaque session id
    pub id: String,
    /// Key pair derived from the reconciled key
    pub key_pair: QuantumKeyPair,
    /// Establishment time, Unix milliseconds
    pub timestamp: i64,
    /// Fresh random nonce
    pub nonce: [u8; 32],
}

/// Simulated QKD handshake and session cache
pub struct QuantumKeyExchange {
    config: QkdConfig,
    budget: Duration,
    lattice: LatticeCrypto,
    reconciler: Reconciler,
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<String, Arc<QuantumSession>>>,
}

impl QuantumKeyExchange {
    /// Create the exchange from the full configuration
    pub fn new(config: &SecurityConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: config.qkd.clone(),
            budget: config.timing.session_establishment,
            lattice: LatticeCrypto::new(config.lattice.clone(), config.timing.clone()),
            reconciler: Reconciler::from_config(&config.qkd),
            clock,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Run the handshake and cache the resulting session
    pub fn establish_session(&self) -> Result<Arc<QuantumSession>> {
        let session = self.handshake()?;
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());
        tracing::info!("Quantum session established: {}", short_id(&session.id));

        Ok(session)
    }

    /// Whether `id` names a cached session younger than the timeout
    pub fn validate_session(&self, id: &str) -> bool {
        self.get_session(id).is_some()
    }

    /// Look up a live session
    pub fn get_session(&self, id: &str) -> Option<Arc<QuantumSession>> {
        let session = self.sessions.read().get(id).cloned()?;
        if self.is_expired(&session) {
            self.sessions.write().remove(id);
            return None;
        }
        Some(session)
    }

    /// Replace `old_id` with a freshly established session
    ///
    /// The old session stays valid until the new one exists; then both
    /// changes land under a single write lock.
    pub fn refresh_session(&self, old_id: &str) -> Result<Arc<QuantumSession>> {
        let session = self.handshake()?;
        {
            let mut sessions = self.sessions.write();
            sessions.remove(old_id);
            sessions.insert(session.id.clone(), session.clone());
        }
        tracing::info!(
            "Quantum session refreshed: {} -> {}",
            short_id(old_id),
            short_id(&session.id)
        );
        Ok(session)
    }

    /// Drop a session from the cache
    pub fn remove_session(&self, id: &str) -> bool {
        self.sessions.write().remove(id).is_some()
    }

    /// Time left before `session` expires
    pub fn time_remaining(&self, session: &QuantumSession) -> Duration {
        self.config
            .session_timeout
            .saturating_sub(self.clock.elapsed_since(session.timestamp))
    }

    /// Evict every expired session, returning how many were removed
    pub fn cleanup_expired_sessions(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| !self.is_expired(session));
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!("Swept {} expired quantum sessions", removed);
        }
        removed
    }

    /// Number of cached sessions, expired or not
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// `len` bytes of key material from a fresh handshake
    ///
    /// The amplified key seeds HKDF-SHA256 under a random salt.
    pub fn quantum_random_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let ikm = self.derive_key_material()?;

        let mut salt = [0u8; 32];
        OsRng.fill_bytes(&mut salt);

        let hkdf = Hkdf::<Sha256>::new(Some(&salt), &ikm);
        let mut out = vec![0u8; len];
        hkdf.expand(ENTROPY_DOMAIN, &mut out)
            .map_err(|_| Error::Internal(format!("Cannot expand {} bytes of key material", len)))?;
        Ok(out)
    }

    /// Start the periodic expired-session sweep
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let exchange = Arc::clone(self);
        let period = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                exchange.cleanup_expired_sessions();
            }
        })
    }

    /// The full timed pipeline, without touching the cache
    fn handshake(&self) -> Result<Arc<QuantumSession>> {
        guarded("session_establishment", self.budget, || {
            let seed = self.derive_key_material()?;
            let key_pair = self.lattice.generate_key_pair_from_seed(seed)?;

            let mut nonce = [0u8; 32];
            OsRng.fill_bytes(&mut nonce);

            Ok(Arc::new(QuantumSession {
                id: new_session_id(),
                key_pair,
                timestamp: self.clock.now_millis(),
                nonce,
            }))
        })
    }

    fn derive_key_material(&self) -> Result<[u8; 32]> {
        let sifted = bb84::exchange(
            self.config.min_entropy * 4,
            self.config.channel_error_rate,
            &mut rand::thread_rng(),
        );
        self.distill(&sifted)
    }

    /// Reconciliation and privacy amplification of a sifted key
    fn distill(&self, sifted: &bb84::SiftedKeys) -> Result<[u8; 32]> {
        let required = self.config.min_entropy;
        if sifted.len() < required {
            tracing::warn!(
                "Sifting kept {} of {} required bits",
                sifted.len(),
                required
            );
            return Err(Error::InsufficientEntropy {
                available: sifted.len(),
                required,
            });
        }

        let reconciled = self.reconciler.reconcile(&sifted.alice, &sifted.bob)?;
        Ok(Sha256::digest(bb84::pack_bits(&reconciled.key)).into())
    }

    fn is_expired(&self, session: &QuantumSession) -> bool {
        self.clock.elapsed_since(session.timestamp) >= self.config.session_timeout
    }
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    format!("qs_{}", hex::encode(bytes))
}

fn short_id(id: &str) -> &str {
    id.get(..11).unwrap_or(id)
}
