//! # Secure Aggregation
//!
//! Threshold aggregation of encrypted participant updates. The aggregator
//! never sees a plaintext: it sums ciphertexts with the lattice scheme's
//! homomorphic addition and perturbs the sum with Gaussian noise before
//! releasing it.
//!
//! ## Round Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          AGGREGATION ROUND                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  initialize_round(config)                                               │
//! │    participant_count < min_participants ──► INSUFFICIENT_PARTICIPANTS   │
//! │    threshold ∉ 1..=participant_count    ──► INVALID_CONFIG              │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  submit_update(round, participant, ciphertext)      (repeatable)        │
//! │    unknown round ──► INVALID_ROUND                                      │
//! │    past timeout  ──► ROUND_EXPIRED                                      │
//! │    new participant, round full ──► ROUND_FULL                           │
//! │          │                                                              │
//! │          ▼                                                              │
//! │  finalize_round(round)                                                  │
//! │    updates < threshold ──► THRESHOLD_NOT_MET                            │
//! │    Σ ciphertexts + N(0, σ²) on u and v,  σ = scale / sqrt(participants) │
//! │    round deleted                                                        │
//! │                                                                         │
//! │  Rounds past their timeout are swept every cleanup_interval.           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand_distr::{Distribution, Normal};

use crate::config::AggregationConfig;
use crate::crypto::lattice::{Ciphertext, LatticeCrypto, PublicKey};
use crate::error::{Error, Result};
use crate::time::Clock;

/// Parameters of a new aggregation round
#[derive(Debug, Clone)]
pub struct RoundConfig {
    /// Expected number of participants
    pub participant_count: usize,
    /// Updates required before the round can be finalized
    pub threshold: usize,
    /// Time after which the round stops accepting updates
    pub timeout: Duration,
    /// Key participants encrypt their updates under
    pub public_key: Option<Arc<PublicKey>>,
}

impl RoundConfig {
    /// A round without an attached public key
    pub fn new(participant_count: usize, threshold: usize, timeout: Duration) -> Self {
        Self {
            participant_count,
            threshold,
            timeout,
            public_key: None,
        }
    }

    /// Attach the key contributions are encrypted under
    pub fn with_public_key(mut self, public_key: Arc<PublicKey>) -> Self {
        self.public_key = Some(public_key);
        self
    }
}

/// A round in progress
#[derive(Debug)]
pub struct SecureAggregationRound {
    /// Round id
    pub round_id: String,
    /// Round parameters
    pub config: RoundConfig,
    /// Latest update per participant
    pub updates: HashMap<String, Ciphertext>,
    /// Creation time, Unix milliseconds
    pub start_time: i64,
}

/// Read-only view of a round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundStatus {
    /// Distinct participants that submitted so far
    pub participant_count: usize,
    /// Participants the round was opened for
    pub expected_participants: usize,
    /// Updates required to finalize
    pub threshold: usize,
    /// Time until the round expires
    pub time_remaining: Duration,
}

/// Threshold aggregator over lattice ciphertexts
pub struct SecureAggregator {
    config: AggregationConfig,
    lattice: LatticeCrypto,
    clock: Arc<dyn Clock>,
    rounds: Mutex<HashMap<String, SecureAggregationRound>>,
}

impl SecureAggregator {
    /// Create an aggregator
    pub fn new(config: AggregationConfig, lattice: LatticeCrypto, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            lattice,
            clock,
            rounds: Mutex::new(HashMap::new()),
        }
    }

    /// Open a round and return its id
    pub fn initialize_round(&self, config: RoundConfig) -> Result<String> {
        if config.participant_count < self.config.min_participants {
            return Err(Error::InsufficientParticipants {
                requested: config.participant_count,
                minimum: self.config.min_participants,
            });
        }
        if config.threshold == 0 || config.threshold > config.participant_count {
            return Err(Error::InvalidConfig(format!(
                "threshold {} must be in 1..={}",
                config.threshold, config.participant_count
            )));
        }

        let round_id = format!("round_{}", uuid::Uuid::new_v4().simple());
        tracing::info!(
            "Opening aggregation round {} ({} participants, threshold {})",
            round_id,
            config.participant_count,
            config.threshold
        );

        let round = SecureAggregationRound {
            round_id: round_id.clone(),
            config,
            updates: HashMap::new(),
            start_time: self.clock.now_millis(),
        };
        self.rounds.lock().insert(round_id.clone(), round);

        Ok(round_id)
    }

    /// Record or overwrite a participant's encrypted update
    pub fn submit_update(&self, round_id: &str, participant_id: &str, ciphertext: Ciphertext) -> Result<()> {
        let mut rounds = self.rounds.lock();
        let round = rounds
            .get_mut(round_id)
            .ok_or_else(|| Error::InvalidRound(round_id.to_string()))?;

        if self.is_expired(round) {
            return Err(Error::RoundExpired(round_id.to_string()));
        }

        if let Some(public_key) = &round.config.public_key {
            ciphertext.validate(public_key.dimension())?;
        } else {
            ciphertext.validate(ciphertext.u.cols())?;
        }
        if let Some(existing) = round.updates.values().next() {
            if existing.len() != ciphertext.len() || existing.u.cols() != ciphertext.u.cols() {
                return Err(Error::InvalidCiphertext(format!(
                    "Update of length {} does not match round length {}",
                    ciphertext.len(),
                    existing.len()
                )));
            }
        }

        if !round.updates.contains_key(participant_id)
            && round.updates.len() >= round.config.participant_count
        {
            return Err(Error::RoundFull(round_id.to_string()));
        }

        round.updates.insert(participant_id.to_string(), ciphertext);
        tracing::debug!(
            "Round {}: {}/{} updates",
            round_id,
            round.updates.len(),
            round.config.participant_count
        );
        Ok(())
    }

    /// Sum the updates, add privacy noise and close the round
    pub fn finalize_round(&self, round_id: &str) -> Result<Ciphertext> {
        let mut rounds = self.rounds.lock();
        let round = rounds
            .get(round_id)
            .ok_or_else(|| Error::InvalidRound(round_id.to_string()))?;

        if self.is_expired(round) {
            rounds.remove(round_id);
            return Err(Error::RoundExpired(round_id.to_string()));
        }
        if round.updates.len() < round.config.threshold {
            return Err(Error::ThresholdNotMet {
                submitted: round.updates.len(),
                threshold: round.config.threshold,
            });
        }

        let mut updates = round.updates.values();
        let first = updates
            .next()
            .cloned()
            .ok_or_else(|| Error::Internal("Finalizing a round without updates".into()))?;
        let sum = updates.try_fold(first, |acc, update| self.lattice.homomorphic_add(&acc, update))?;

        let sigma = self.config.noise_scale / (round.config.participant_count as f64).sqrt();
        let aggregate = add_noise(sum, sigma)?;

        let submitted = round.updates.len();
        rounds.remove(round_id);
        tracing::info!(
            "Finalized aggregation round {} with {} updates",
            round_id,
            submitted
        );

        Ok(aggregate)
    }

    /// Status of a live round; `None` if unknown or expired
    pub fn get_round_status(&self, round_id: &str) -> Option<RoundStatus> {
        let rounds = self.rounds.lock();
        let round = rounds.get(round_id)?;
        if self.is_expired(round) {
            return None;
        }

        Some(RoundStatus {
            participant_count: round.updates.len(),
            expected_participants: round.config.participant_count,
            threshold: round.config.threshold,
            time_remaining: round
                .config
                .timeout
                .saturating_sub(self.clock.elapsed_since(round.start_time)),
        })
    }

    /// Public key attached to a round
    pub fn round_public_key(&self, round_id: &str) -> Result<Option<Arc<PublicKey>>> {
        let rounds = self.rounds.lock();
        let round = rounds
            .get(round_id)
            .ok_or_else(|| Error::InvalidRound(round_id.to_string()))?;
        Ok(round.config.public_key.clone())
    }

    /// Delete every round past its timeout
    pub fn cleanup_expired_rounds(&self) -> usize {
        let mut rounds = self.rounds.lock();
        let before = rounds.len();
        rounds.retain(|_, round| !self.is_expired(round));
        let removed = before - rounds.len();
        if removed > 0 {
            tracing::info!("Swept {} expired aggregation rounds", removed);
        }
        removed
    }

    /// Number of open rounds, expired or not
    pub fn round_count(&self) -> usize {
        self.rounds.lock().len()
    }

    /// Interval of the expired-round sweep
    pub fn cleanup_interval(&self) -> Duration {
        self.config.cleanup_interval
    }

    fn is_expired(&self, round: &SecureAggregationRound) -> bool {
        self.clock.elapsed_since(round.start_time) >= round.config.timeout
    }
}

fn add_noise(mut ciphertext: Ciphertext, sigma: f64) -> Result<Ciphertext> {
    if sigma <= 0.0 {
        return Ok(ciphertext);
    }
    let noise = Normal::new(0.0, sigma)
        .map_err(|e| Error::InvalidConfig(format!("Invalid aggregation noise: {}", e)))?;
    let mut rng = rand::thread_rng();

    for x in ciphertext.u.data_mut() {
        *x += noise.sample(&mut rng);
    }
    for x in ciphertext.v.iter_mut() {
        *x += noise.sample(&mut rng);
    }
    Ok(ciphertext)
}
