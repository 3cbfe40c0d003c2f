//! CASCADE-style error correction with a QBER gate.
//!
//! ```text
//! pass 0:  identity order, blocks of `block_size`
//! pass k:  ChaCha-shuffled order (seed k), blocks of block_size·2^min(k,3)
//!
//!   for each block whose parity differs from the reference:
//!       bisect on parity until one bit remains, flip it
//!
//!   stop when keys agree, or fail with HIGH_QBER as soon as
//!   corrections / len exceeds the threshold
//! ```
//!
//! Every flip lands on a real error, so the number of corrections is the
//! number of errors found and `corrections / len` is the measured QBER.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use crate::config::QkdConfig;
use crate::error::{Error, Result};

const MAX_BLOCK_DOUBLINGS: u32 = 3;

/// Outcome of a successful reconciliation
#[derive(Debug, Clone)]
pub struct Reconciled {
    /// Corrected key, equal to the reference
    pub key: Vec<bool>,
    /// Bits flipped to reach agreement
    pub corrections: usize,
    /// `corrections / key length`
    pub qber: f64,
    /// Passes run
    pub passes: usize,
}

/// CASCADE error corrector
#[derive(Debug, Clone)]
pub struct Reconciler {
    block_size: usize,
    max_passes: usize,
    qber_threshold: f64,
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(block_size: usize, max_passes: usize, qber_threshold: f64) -> Self {
        Self {
            block_size: block_size.max(2),
            max_passes,
            qber_threshold,
        }
    }

    /// Create from QKD configuration
    pub fn from_config(config: &QkdConfig) -> Self {
        Self::new(
            config.block_size,
            config.max_reconciliation_passes,
            config.qber_threshold,
        )
    }

    /// Correct `noisy` until it matches `reference`
    pub fn reconcile(&self, reference: &[bool], noisy: &[bool]) -> Result<Reconciled> {
        if reference.len() != noisy.len() {
            return Err(Error::Internal(format!(
                "Reconciliation key lengths differ: {} vs {}",
                reference.len(),
                noisy.len()
            )));
        }

        let len = reference.len();
        let mut working = noisy.to_vec();
        let mut corrections = 0usize;
        let mut passes = 0usize;

        if len == 0 {
            return Ok(Reconciled {
                key: working,
                corrections,
                qber: 0.0,
                passes,
            });
        }

        while working != reference {
            if passes == self.max_passes {
                return Err(Error::Internal(format!(
                    "Reconciliation did not converge after {} passes",
                    passes
                )));
            }

            let order = self.pass_order(passes, len);
            let block = self.pass_block_size(passes, len);

            for indices in order.chunks(block) {
                if parity(reference, indices) == parity(&working, indices) {
                    continue;
                }

                let position = bisect(reference, &working, indices);
                working[position] = !working[position];
                corrections += 1;

                let qber = corrections as f64 / len as f64;
                if qber > self.qber_threshold {
                    tracing::warn!(
                        "Aborting reconciliation: QBER lower bound {:.4} exceeds {:.4}",
                        qber,
                        self.qber_threshold
                    );
                    return Err(Error::HighQber {
                        qber,
                        threshold: self.qber_threshold,
                    });
                }
            }

            passes += 1;
        }

        let qber = corrections as f64 / len as f64;
        tracing::debug!(
            "Reconciled {} bits in {} passes ({} corrections, QBER {:.4})",
            len,
            passes,
            corrections,
            qber
        );

        Ok(Reconciled {
            key: working,
            corrections,
            qber,
            passes,
        })
    }

    fn pass_order(&self, pass: usize, len: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..len).collect();
        if pass > 0 {
            let mut rng = ChaCha20Rng::seed_from_u64(pass as u64);
            order.shuffle(&mut rng);
        }
        order
    }

    fn pass_block_size(&self, pass: usize, len: usize) -> usize {
        let doublings = (pass as u32).min(MAX_BLOCK_DOUBLINGS);
        (self.block_size << doublings).min(len)
    }
}

fn parity(bits: &[bool], indices: &[usize]) -> bool {
    indices.iter().fold(false, |acc, &i| acc ^ bits[i])
}

/// Locate one erroneous position in a block with mismatched parity
fn bisect(reference: &[bool], working: &[bool], indices: &[usize]) -> usize {
    let mut range = indices;
    while range.len() > 1 {
        let (left, right) = range.split_at(range.len() / 2);
        range = if parity(reference, left) != parity(working, left) {
            left
        } else {
            right
        };
    }
    range[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::index::sample;
    use rand::Rng;

    fn random_key(len: usize, seed: u64) -> Vec<bool> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen()).collect()
    }

    fn with_flips(key: &[bool], flips: usize, seed: u64) -> Vec<bool> {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let mut noisy = key.to_vec();
        for i in sample(&mut rng, key.len(), flips).into_vec() {
            noisy[i] = !noisy[i];
        }
        noisy
    }

    fn reconciler() -> Reconciler {
        Reconciler::from_config(&QkdConfig::default())
    }

    #[test]
    fn test_identical_keys_need_no_passes() {
        let key = random_key(512, 1);
        let result = reconciler().reconcile(&key, &key).unwrap();
        assert_eq!(result.passes, 0);
        assert_eq!(result.corrections, 0);
        assert_eq!(result.key, key);
    }

    #[test]
    fn test_low_error_rate_converges() {
        let key = random_key(512, 2);
        // ~5% errors, under the 11% gate
        let noisy = with_flips(&key, 26, 3);

        let result = reconciler().reconcile(&key, &noisy).unwrap();
        assert_eq!(result.key, key);
        assert_eq!(result.corrections, 26);
        assert!(result.qber <= 0.11);
    }

    #[test]
    fn test_high_error_rate_aborts() {
        let key = random_key(512, 4);
        // 25% errors
        let noisy = with_flips(&key, 128, 5);

        let err = reconciler().reconcile(&key, &noisy).unwrap_err();
        assert_eq!(err.code(), "HIGH_QBER");
        match err {
            Error::HighQber { qber, threshold } => {
                assert!(qber > threshold);
                assert_eq!(threshold, 0.11);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = reconciler().reconcile(&[true, false], &[true]).unwrap_err();
        assert_eq!(err.code(), "INTERNAL");
    }

    #[test]
    fn test_bisect_finds_single_error() {
        let key = random_key(16, 6);
        let mut noisy = key.clone();
        noisy[11] = !noisy[11];
        let indices: Vec<usize> = (0..16).collect();
        assert_eq!(bisect(&key, &noisy, &indices), 11);
    }
}
