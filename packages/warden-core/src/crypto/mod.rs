//! # Cryptography Module
//!
//! Numeric primitives behind every protected value in Warden Core.
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CRYPTOGRAPHIC ARCHITECTURE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   serde value                                                           │
//! │       │  serde_json                                                     │
//! │       ▼                                                                 │
//! │   bytes ──► codec::encode_bytes ──► f64 slots (multiple of 32)          │
//! │                                          │                              │
//! │                                          ▼                              │
//! │                             lattice::encrypt (LWE, n = 256)             │
//! │                                          │                              │
//! │                                          ▼                              │
//! │                              Ciphertext { u: Matrix, v }                │
//! │                                          │                              │
//! │                    ┌─────────────────────┴──────────┐                   │
//! │                    ▼                                ▼                   │
//! │         homomorphic_add (aggregation)     bincode + base64 (storage)    │
//! │                                                                         │
//! │   timing::guarded wraps keygen / encrypt / decrypt                      │
//! │   hashing: Argon2id secrets, SHA-256 digests, constant-time compare     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Algorithm Choices
//!
//! | Algorithm | Purpose |
//! |-----------|---------|
//! | LWE over R^n | Additively homomorphic public-key encryption |
//! | ChaCha20 stream | Deterministic key generation from QKD key material |
//! | Argon2id | Password and recovery-answer hashing |
//! | SHA-256 | Integrity digests, privacy amplification, tokens |
//! | HKDF-SHA256 | Expanding quantum key material |
//!
//! ## Security Considerations
//!
//! 1. **Key Zeroization**: LWE secret keys are zeroized when dropped
//! 2. **Constant-Time Comparison**: digests and codes compare via `subtle`
//! 3. **Timing Budgets**: guarded operations fail rather than return late

pub mod codec;
pub mod hashing;
pub mod lattice;
pub mod matrix;
pub mod timing;

pub use codec::{decode_bytes, encode_bytes, BLOCK_WIDTH};
pub use hashing::{constant_time_eq, random_bytes, sha256, sha256_hex, SecretHasher};
pub use lattice::{Ciphertext, LatticeCrypto, PublicKey, QuantumKeyPair, SecretKey};
pub use matrix::Matrix;
