//! Bit and key pipeline for the simulated BB84 exchange.
//!
//! Every function here is pure: no I/O, no shared state. Randomness is taken
//! from a caller-supplied [`Rng`] so tests can seed it.
//!
//! # Pipeline
//!
//! ```text
//! raw bits + bases ──sift──▶ sifted key ──check bits──▶ error check
//!                                 │
//!                                 └──privacy_amplify──▶ final key ──xor_stream──▶ ciphertext
//! ```

use crate::error::KeyError;
use crate::{DEFAULT_CHECK_FRACTION, DEFAULT_ERROR_THRESHOLD};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single simulated bit, always `0` or `1`
pub type Bit = u8;

/// Encoding basis for one simulated bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Basis {
    /// Rectilinear basis, written `+`
    #[serde(rename = "+")]
    Rectilinear,
    /// Diagonal basis, written `x`
    #[serde(rename = "x")]
    Diagonal,
}

impl Basis {
    /// Pick a basis uniformly at random
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        if rng.gen_bool(0.5) {
            Basis::Rectilinear
        } else {
            Basis::Diagonal
        }
    }

    /// Symbol used on the wire
    #[must_use]
    pub const fn symbol(self) -> char {
        match self {
            Basis::Rectilinear => '+',
            Basis::Diagonal => 'x',
        }
    }
}

impl fmt::Display for Basis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Check bits revealed to estimate the error rate
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckSelection {
    /// Positions into the sifted key
    pub indices: Vec<usize>,
    /// Key values at those positions, in the same order
    pub values: Vec<Bit>,
}

impl CheckSelection {
    /// Read the values of `key` at the given positions
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::IndexOutOfRange`] if any index is past the end of `key`.
    pub fn at(key: &[Bit], indices: &[usize]) -> Result<Self, KeyError> {
        let values = indices
            .iter()
            .map(|&index| {
                key.get(index).copied().ok_or(KeyError::IndexOutOfRange {
                    index,
                    len: key.len(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            indices: indices.to_vec(),
            values,
        })
    }

    /// Sample `floor(fraction * len)` distinct positions uniformly without replacement
    pub fn sample<R: Rng + ?Sized>(key: &[Bit], fraction: f64, rng: &mut R) -> Self {
        let count = check_bit_count(key.len(), fraction);
        let indices = rand::seq::index::sample(rng, key.len(), count).into_vec();
        let values = indices.iter().map(|&i| key[i]).collect();
        Self { indices, values }
    }

    /// Number of selected positions
    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// True if nothing was selected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Number of check bits taken from a key of length `len`
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn check_bit_count(len: usize, fraction: f64) -> usize {
    let count = (len as f64 * fraction.clamp(0.0, 1.0)).floor() as usize;
    count.min(len)
}

/// Expand a message into bits, eight per byte, most significant first
#[must_use]
pub fn to_bits(message: &str) -> Vec<Bit> {
    message
        .as_bytes()
        .iter()
        .flat_map(|&byte| (0..8).rev().map(move |shift| (byte >> shift) & 1))
        .collect()
}

/// Pack bits back into bytes; a trailing group shorter than 8 bits is dropped
#[must_use]
pub fn bits_to_bytes(bits: &[Bit]) -> Vec<u8> {
    bits.chunks_exact(8)
        .map(|chunk| chunk.iter().fold(0u8, |byte, &bit| (byte << 1) | (bit & 1)))
        .collect()
}

/// Generate `n` uniformly random bits
pub fn random_bits<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<Bit> {
    (0..n).map(|_| Bit::from(rng.gen_bool(0.5))).collect()
}

/// Generate `n` uniformly random bases
pub fn random_bases<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<Basis> {
    (0..n).map(|_| Basis::random(rng)).collect()
}

/// Basis reconciliation: keep the initiator's bit wherever both bases agree
///
/// Iterates up to the shortest of the three sequences.
#[must_use]
pub fn sift(initiator_bits: &[Bit], initiator_bases: &[Basis], responder_bases: &[Basis]) -> Vec<Bit> {
    initiator_bits
        .iter()
        .zip(initiator_bases.iter().zip(responder_bases))
        .filter(|(_, (ours, theirs))| ours == theirs)
        .map(|(&bit, _)| bit)
        .collect()
}

/// Select check bits from `key`
///
/// With explicit indices the values are read verbatim at those positions;
/// otherwise 20% of the key is sampled at random.
///
/// # Errors
///
/// Returns [`KeyError::IndexOutOfRange`] if an explicit index is past the end of `key`.
pub fn select_check_bits<R: Rng + ?Sized>(
    key: &[Bit],
    explicit_indices: Option<&[usize]>,
    rng: &mut R,
) -> Result<CheckSelection, KeyError> {
    match explicit_indices {
        Some(indices) => CheckSelection::at(key, indices),
        None => Ok(CheckSelection::sample(key, DEFAULT_CHECK_FRACTION, rng)),
    }
}

/// Fraction of positions at which `a` and `b` differ
///
/// Returns `None` when the lengths differ. Two empty sequences agree
/// perfectly.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mismatch_fraction(a: &[Bit], b: &[Bit]) -> Option<f64> {
    if a.len() != b.len() {
        return None;
    }
    if a.is_empty() {
        return Some(0.0);
    }
    let mismatched = a.iter().zip(b).filter(|(x, y)| x != y).count();
    Some(mismatched as f64 / a.len() as f64)
}

/// Compare check bits against the default 0.11 threshold
#[must_use]
pub fn error_check(a: &[Bit], b: &[Bit]) -> bool {
    error_check_with_threshold(a, b, DEFAULT_ERROR_THRESHOLD)
}

/// Compare check bits; passes when the mismatch fraction is at most `threshold`
///
/// Always fails when the lengths differ.
#[must_use]
pub fn error_check_with_threshold(a: &[Bit], b: &[Bit], threshold: f64) -> bool {
    match mismatch_fraction(a, b) {
        Some(rate) => rate <= threshold,
        None => {
            tracing::debug!("Unequal check bit lengths: {} vs {}", a.len(), b.len());
            false
        }
    }
}

/// Privacy amplification: XOR consecutive pairs, dropping an unpaired tail
///
/// Keys shorter than two bits are returned unchanged.
#[must_use]
pub fn privacy_amplify(key: &[Bit]) -> Vec<Bit> {
    if key.len() < 2 {
        return key.to_vec();
    }
    key.chunks_exact(2).map(|pair| pair[0] ^ pair[1]).collect()
}

/// XOR `bits` against `key` repeated cyclically
///
/// Self-inverse, so the same call encrypts and decrypts.
///
/// # Errors
///
/// Returns [`KeyError::EmptyKey`] if `key` is empty.
pub fn xor_stream(key: &[Bit], bits: &[Bit]) -> Result<Vec<Bit>, KeyError> {
    if key.is_empty() {
        return Err(KeyError::EmptyKey);
    }
    Ok(bits
        .iter()
        .zip(key.iter().cycle())
        .map(|(bit, key_bit)| bit ^ key_bit)
        .collect())
}

/// Encrypt a text message under `key`
///
/// # Errors
///
/// Returns [`KeyError::EmptyKey`] if `key` is empty.
pub fn encrypt_message(key: &[Bit], message: &str) -> Result<Vec<Bit>, KeyError> {
    xor_stream(key, &to_bits(message))
}

/// Decrypt ciphertext bits under `key` back into text
///
/// Invalid UTF-8 is replaced rather than rejected.
///
/// # Errors
///
/// Returns [`KeyError::EmptyKey`] if `key` is empty.
pub fn decrypt_message(key: &[Bit], ciphertext: &[Bit]) -> Result<String, KeyError> {
    let plain = xor_stream(key, ciphertext)?;
    Ok(String::from_utf8_lossy(&bits_to_bytes(&plain)).into_owned())
}

/// Render bits in groups of eight, e.g. `01001000 01001001`
#[must_use]
pub fn format_bits(bits: &[Bit]) -> String {
    bits.chunks(8)
        .map(|chunk| chunk.iter().map(|b| if *b == 0 { '0' } else { '1' }).collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}
