//! Fingerprint Function
//!
//! Derives the `input_hash` that identifies "the same decision situation"
//! across live capture and later replay. The digest covers the market
//! partition, the last observed bar time, the ordered feature list and a
//! caller-supplied digest of the quantized market window.
//!
//! Encoding (SHA-256 over):
//!
//! ```text
//! "RPFP_V1" || str(pair) || str(timeframe) || i64_be(last_observed_time)
//!           || u64_be(n) || (str(name_i) || u64_be(bits(value_i)))*n
//!           || str(feature_digest)
//! ```
//!
//! where `str(s)` is `u64_be(len) || utf8(s)`. Length prefixes keep
//! `pair`/`timeframe` distinguishable even when feature vectors coincide.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ReplayError, ReplayResult};
use crate::types::Feature;

/// Fingerprint version tag, bump when the encoding changes.
pub const FINGERPRINT_VERSION: &str = "RPFP_V1";

const DIGEST_VERSION: &str = "RPQD_V1";
const HEX_LEN: usize = 64;

/// 256-bit lowercase hex digest identifying a decision situation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = ReplayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let valid = value.len() == HEX_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Fingerprint(value))
        } else {
            Err(ReplayError::InvalidInput(format!(
                "fingerprint must be {} lowercase hex chars, got '{}'",
                HEX_LEN, value
            )))
        }
    }
}

impl FromStr for Fingerprint {
    type Err = ReplayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::try_from(s.to_string())
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

/// Bit pattern with -0.0 folded onto 0.0 so numerically equal inputs agree.
fn canonical_bits(value: f64) -> u64 {
    if value == 0.0 {
        0
    } else {
        value.to_bits()
    }
}

/// Compute the fingerprint of a decision situation.
///
/// Pure and wall-clock independent. Features must already be quantized by
/// the caller; their order is significant.
pub fn compute_fingerprint(
    pair: &str,
    timeframe: &str,
    last_observed_time: i64,
    features: &[Feature],
    feature_digest: &str,
) -> ReplayResult<Fingerprint> {
    if pair.trim().is_empty() || timeframe.trim().is_empty() {
        return Err(ReplayError::InvalidInput(
            "pair and timeframe must be non-empty".into(),
        ));
    }
    if features.is_empty() {
        return Err(ReplayError::InvalidInput("feature list is empty".into()));
    }

    let mut seen = HashSet::with_capacity(features.len());
    for feature in features {
        if feature.name.is_empty() {
            return Err(ReplayError::InvalidInput("feature with empty name".into()));
        }
        if !feature.value.is_finite() {
            return Err(ReplayError::InvalidInput(format!(
                "feature '{}' is not finite ({})",
                feature.name, feature.value
            )));
        }
        if !seen.insert(feature.name.as_str()) {
            return Err(ReplayError::InvalidInput(format!(
                "duplicate feature '{}'",
                feature.name
            )));
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_VERSION.as_bytes());
    write_str(&mut hasher, pair);
    write_str(&mut hasher, timeframe);
    hasher.update(last_observed_time.to_be_bytes());
    hasher.update((features.len() as u64).to_be_bytes());
    for feature in features {
        write_str(&mut hasher, &feature.name);
        hasher.update(canonical_bits(feature.value).to_be_bytes());
    }
    write_str(&mut hasher, feature_digest);

    Ok(Fingerprint(hex::encode(hasher.finalize())))
}

/// Round `value` to `decimals` places, rejecting non-finite input.
pub fn quantize(value: f64, decimals: u32) -> ReplayResult<f64> {
    if !value.is_finite() {
        return Err(ReplayError::InvalidInput(format!(
            "cannot quantize non-finite value {}",
            value
        )));
    }
    let scale = 10f64.powi(decimals as i32);
    Ok((value * scale).round() / scale)
}

/// Digest of a numeric window after conversion to fixed-point integers
/// (`round(value * 10^decimals)`), suitable as `feature_digest`.
pub fn quantized_digest(values: &[f64], decimals: u32) -> ReplayResult<String> {
    let scale = 10f64.powi(decimals as i32);
    let mut hasher = Sha256::new();
    hasher.update(DIGEST_VERSION.as_bytes());
    hasher.update(decimals.to_be_bytes());
    hasher.update((values.len() as u64).to_be_bytes());

    for (i, value) in values.iter().enumerate() {
        if !value.is_finite() {
            return Err(ReplayError::InvalidInput(format!(
                "window value {} at index {} is not finite",
                value, i
            )));
        }
        let scaled = (value * scale).round();
        if scaled.abs() >= i64::MAX as f64 {
            return Err(ReplayError::InvalidInput(format!(
                "window value {} overflows fixed-point at {} decimals",
                value, decimals
            )));
        }
        hasher.update((scaled as i64).to_be_bytes());
    }

    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 hex digest of arbitrary bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
