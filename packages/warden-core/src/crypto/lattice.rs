//! # LWE Encryption
//!
//! Learning-With-Errors public-key encryption over real-valued vectors with
//! additive homomorphism.
//!
//! ## Scheme
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          LWE OVER R^n  (n = 256)                        │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  KeyGen                                                                 │
//! │    s ← {0,1}^n              secret bit vector                           │
//! │    A ← U[-1,1]^{n×n}        public matrix                               │
//! │    e ← N(0, 0.1)^n          key error                                   │
//! │    b = A·s + e              public vector                               │
//! │                                                                         │
//! │  Encrypt(m ∈ Z^L)   for each element i:                                 │
//! │    r_i ← {0,1}^n with |r_i| = w                                         │
//! │    u_i = Aᵗ·r_i                                                         │
//! │    v_i = bᵗ·r_i + Δ·m_i + η_i,   η_i ← N(0, 3.2)                        │
//! │                                                                         │
//! │  Decrypt                                                                │
//! │    v_i − sᵗ·u_i = eᵗ·r_i + Δ·m_i + η_i                                  │
//! │    m_i = round((v_i − sᵗ·u_i) / Δ)                                      │
//! │                                                                         │
//! │  The residual eᵗ·r_i + η_i has σ ≈ sqrt(w·0.01 + 3.2²) ≈ 3.3,           │
//! │  so with Δ = 1024 rounding is exact far beyond any practical number    │
//! │  of trials, including sums of many ciphertexts.                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Ciphertexts add element-wise, and so do the plaintexts they decrypt to.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::matrix::{add_vec, dot, Matrix};
use super::timing::guarded;
use crate::config::{LatticeParams, TimingBudgets};
use crate::error::{Error, Result};

/// LWE public key: the matrix `A` and the noisy product `b = A·s + e`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicKey {
    a: Matrix,
    b: Vec<f64>,
}

impl PublicKey {
    /// The public matrix `A`
    pub fn matrix(&self) -> &Matrix {
        &self.a
    }

    /// The public vector `b`
    pub fn vector(&self) -> &[f64] {
        &self.b
    }

    /// Lattice dimension this key was generated for
    pub fn dimension(&self) -> usize {
        self.b.len()
    }
}

/// LWE secret key `s ∈ {0,1}^n`
///
/// Zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(Vec<f64>);

impl SecretKey {
    /// Wrap raw coefficients
    pub fn from_coefficients(coefficients: Vec<f64>) -> Self {
        Self(coefficients)
    }

    /// Number of coefficients
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the key has no coefficients
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn coefficients(&self) -> &[f64] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("len", &self.0.len())
            .finish_non_exhaustive()
    }
}

/// A public/secret key pair
///
/// The public key is shared behind an `Arc`; it is large (n² entries) and
/// handed to aggregation rounds without copying.
#[derive(Debug, Clone)]
pub struct QuantumKeyPair {
    /// Public half
    pub public_key: Arc<PublicKey>,
    /// Secret half
    pub secret_key: SecretKey,
}

/// An LWE ciphertext
///
/// `u` has one row of width `n` per plaintext element; `v.len()` equals the
/// plaintext length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ciphertext {
    /// Mask rows `Aᵗ·r_i`
    pub u: Matrix,
    /// Masked, scaled plaintext
    pub v: Vec<f64>,
}

impl Ciphertext {
    /// Plaintext length this ciphertext encrypts
    pub fn len(&self) -> usize {
        self.v.len()
    }

    /// Whether the ciphertext encrypts an empty vector
    pub fn is_empty(&self) -> bool {
        self.v.is_empty()
    }

    /// Check the `u`/`v` shapes agree with each other and with `dimension`
    pub fn validate(&self, dimension: usize) -> Result<()> {
        if self.u.rows() != self.v.len() {
            return Err(Error::InvalidCiphertext(format!(
                "u has {} rows but v has {} entries",
                self.u.rows(),
                self.v.len()
            )));
        }
        if self.u.cols() != dimension {
            return Err(Error::InvalidCiphertext(format!(
                "u has width {}, expected {}",
                self.u.cols(),
                dimension
            )));
        }
        Ok(())
    }
}

/// The LWE scheme with its parameters and timing budgets
#[derive(Debug, Clone)]
pub struct LatticeCrypto {
    params: LatticeParams,
    budgets: TimingBudgets,
}

impl LatticeCrypto {
    /// Create the scheme
    pub fn new(params: LatticeParams, budgets: TimingBudgets) -> Self {
        Self { params, budgets }
    }

    /// Scheme parameters
    pub fn params(&self) -> &LatticeParams {
        &self.params
    }

    /// Generate a fresh key pair from OS-seeded randomness
    pub fn generate_key_pair(&self) -> Result<QuantumKeyPair> {
        guarded("keygen", self.budgets.keygen, || {
            let mut rng = ChaCha20Rng::from_entropy();
            self.sample_key_pair(&mut rng)
        })
    }

    /// Generate a key pair deterministically from 32 bytes of key material
    pub fn generate_key_pair_from_seed(&self, seed: [u8; 32]) -> Result<QuantumKeyPair> {
        guarded("keygen", self.budgets.keygen, || {
            let mut rng = ChaCha20Rng::from_seed(seed);
            self.sample_key_pair(&mut rng)
        })
    }

    /// Encrypt an integer-valued message vector
    ///
    /// Fractional parts do not survive decryption; callers encode data as
    /// whole numbers.
    pub fn encrypt(&self, message: &[f64], public_key: &PublicKey) -> Result<Ciphertext> {
        guarded("encrypt", self.budgets.encrypt, || {
            self.encrypt_with_rng(message, public_key, &mut rand::thread_rng())
        })
    }

    /// Recover the message vector
    pub fn decrypt(&self, ciphertext: &Ciphertext, secret_key: &SecretKey) -> Result<Vec<f64>> {
        guarded("decrypt", self.budgets.decrypt, || {
            ciphertext.validate(secret_key.len())?;
            let s = secret_key.coefficients();
            let scale = self.params.plaintext_scale;

            Ok(ciphertext
                .v
                .iter()
                .enumerate()
                .map(|(i, v)| ((v - dot(s, ciphertext.u.row(i))) / scale).round())
                .collect())
        })
    }

    /// Add two ciphertexts; the result decrypts to the sum of the plaintexts
    pub fn homomorphic_add(&self, c1: &Ciphertext, c2: &Ciphertext) -> Result<Ciphertext> {
        Ok(Ciphertext {
            u: c1.u.add(&c2.u)?,
            v: add_vec(&c1.v, &c2.v)?,
        })
    }

    fn sample_key_pair<R: Rng>(&self, rng: &mut R) -> Result<QuantumKeyPair> {
        let n = self.params.dimension;
        let error = Normal::new(0.0, self.params.key_error_sigma)
            .map_err(|e| Error::InvalidConfig(format!("Invalid key error sigma: {}", e)))?;

        let s: Vec<f64> = (0..n)
            .map(|_| if rng.gen::<bool>() { 1.0 } else { 0.0 })
            .collect();
        let a_data: Vec<f64> = (0..n * n).map(|_| rng.gen_range(-1.0..=1.0)).collect();
        let a = Matrix::from_vec(n, n, a_data)?;

        let b = a
            .mul_vec(&s)?
            .into_iter()
            .map(|x| x + error.sample(rng))
            .collect();

        Ok(QuantumKeyPair {
            public_key: Arc::new(PublicKey { a, b }),
            secret_key: SecretKey(s),
        })
    }

    fn encrypt_with_rng<R: Rng>(
        &self,
        message: &[f64],
        public_key: &PublicKey,
        rng: &mut R,
    ) -> Result<Ciphertext> {
        let n = self.params.dimension;
        if public_key.a.rows() != n || public_key.a.cols() != n || public_key.b.len() != n {
            return Err(Error::InvalidKey(format!(
                "Public key does not match lattice dimension {}",
                n
            )));
        }
        if let Some(bad) = message.iter().find(|m| !m.is_finite()) {
            return Err(Error::InvalidCiphertext(format!(
                "Cannot encrypt non-finite value {}",
                bad
            )));
        }

        let noise = Normal::new(0.0, self.params.encryption_noise_sigma)
            .map_err(|e| Error::InvalidConfig(format!("Invalid noise sigma: {}", e)))?;
        let weight = self.params.encryption_weight;
        let scale = self.params.plaintext_scale;

        let mut u_data = Vec::with_capacity(message.len() * n);
        let mut v = Vec::with_capacity(message.len());

        for m in message {
            let ones = rand::seq::index::sample(rng, n, weight).into_vec();
            u_data.extend(public_key.a.transpose_mul_indicator(&ones));

            let mask: f64 = ones.iter().map(|&j| public_key.b[j]).sum();
            v.push(mask + scale * m + noise.sample(rng));
        }

        Ok(Ciphertext {
            u: Matrix::from_vec(message.len(), n, u_data)?,
            v,
        })
    }
}
