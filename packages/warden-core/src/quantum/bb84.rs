//! Simulated BB84 raw key exchange.
//!
//! Each "EPR pair" is a random unit 2-vector shared by both sides. A side
//! measures it in one of two bases and reads a bit from the projection. When
//! the bases agree both sides read the same bit; sifting keeps exactly those
//! positions. The simulated channel then flips a small fraction of the
//! receiver's bits so reconciliation has something to do.

use std::f64::consts::{FRAC_1_SQRT_2, TAU};

use rand::Rng;

/// Measurement basis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Basis {
    /// Identity projector
    Rectilinear,
    /// Hadamard projector
    Diagonal,
}

impl Basis {
    /// Pick a basis uniformly at random
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        if rng.gen::<bool>() {
            Basis::Diagonal
        } else {
            Basis::Rectilinear
        }
    }
}

/// A normalized two-component state shared by both parties
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EprPair {
    amplitudes: [f64; 2],
}

impl EprPair {
    /// A state at a uniformly random angle on the unit circle
    pub fn random<R: Rng>(rng: &mut R) -> Self {
        let theta = rng.gen_range(0.0..TAU);
        Self {
            amplitudes: [theta.cos(), theta.sin()],
        }
    }

    /// Build from raw amplitudes, normalizing them
    ///
    /// Returns `None` for the zero vector.
    pub fn from_amplitudes(a: f64, b: f64) -> Option<Self> {
        let norm = (a * a + b * b).sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return None;
        }
        Some(Self {
            amplitudes: [a / norm, b / norm],
        })
    }

    /// Project onto `basis` and read a bit
    ///
    /// The bit is 1 when the probability of the `|1⟩` outcome exceeds 1/2.
    pub fn measure(&self, basis: Basis) -> bool {
        let [a, b] = self.amplitudes;
        let one = match basis {
            Basis::Rectilinear => b,
            Basis::Diagonal => (a - b) * FRAC_1_SQRT_2,
        };
        one * one > 0.5
    }
}

/// Sifted key material of both parties
#[derive(Debug, Clone)]
pub struct SiftedKeys {
    /// Sender's bits, the reconciliation reference
    pub alice: Vec<bool>,
    /// Receiver's bits after channel noise
    pub bob: Vec<bool>,
    /// Number of pairs exchanged before sifting
    pub exchanged: usize,
}

impl SiftedKeys {
    /// Sifted key length in bits
    pub fn len(&self) -> usize {
        self.alice.len()
    }

    /// Whether sifting kept no bits
    pub fn is_empty(&self) -> bool {
        self.alice.is_empty()
    }
}

/// Exchange `pairs` EPR pairs and sift the matching-basis positions
pub fn exchange<R: Rng>(pairs: usize, channel_error_rate: f64, rng: &mut R) -> SiftedKeys {
    let mut alice = Vec::with_capacity(pairs / 2);
    let mut bob = Vec::with_capacity(pairs / 2);

    for _ in 0..pairs {
        let pair = EprPair::random(rng);
        let alice_basis = Basis::random(rng);
        let bob_basis = Basis::random(rng);

        if alice_basis != bob_basis {
            continue;
        }

        let bit = pair.measure(alice_basis);
        let received = pair.measure(bob_basis);
        let flipped = channel_error_rate > 0.0 && rng.gen_bool(channel_error_rate.min(1.0));

        alice.push(bit);
        bob.push(received ^ flipped);
    }

    SiftedKeys {
        alice,
        bob,
        exchanged: pairs,
    }
}

/// Pack bits MSB-first into bytes, zero-padding the last byte
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (i, &bit)| byte | ((bit as u8) << (7 - i)))
        })
        .collect()
}
