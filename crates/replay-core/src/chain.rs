//! Tamper-evident hash chain shared by the capture audit trail and the
//! replay log. Each entry stores a SHA-256 hash of its contents plus the
//! previous entry's hash, forming an append-only verifiable chain.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub prev_hash: String,
    pub entry_hash: String,
}

impl ChainLink {
    /// Link a new entry onto `prev_hash` (empty for the first entry).
    pub fn extend(prev_hash: &str, fields: &[String]) -> Self {
        Self {
            prev_hash: prev_hash.to_string(),
            entry_hash: chain_hash(prev_hash, fields),
        }
    }
}

/// Anything stored in a hash chain.
pub trait Chained {
    fn sequence_number(&self) -> i64;
    fn link(&self) -> &ChainLink;
    /// Hashed content, in a fixed order.
    fn chain_fields(&self) -> Vec<String>;
}

/// Compute a SHA-256 hash for a chain entry.
pub fn chain_hash(prev_hash: &str, fields: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    for field in fields {
        hasher.update(b"|");
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainVerification {
    pub is_valid: bool,
    pub total_entries: i64,
    pub first_broken_sequence: Option<i64>,
    pub message: String,
}

/// Walk entries in sequence order and recompute hashes.
pub fn verify_chain<T: Chained>(entries: &[T]) -> ChainVerification {
    if entries.is_empty() {
        return ChainVerification {
            is_valid: true,
            total_entries: 0,
            first_broken_sequence: None,
            message: "No hash-chained entries found".to_string(),
        };
    }

    let total = entries.len() as i64;
    let mut expected_prev_hash = String::new();

    for entry in entries {
        let link = entry.link();
        if link.prev_hash != expected_prev_hash {
            return ChainVerification {
                is_valid: false,
                total_entries: total,
                first_broken_sequence: Some(entry.sequence_number()),
                message: format!(
                    "Chain broken at sequence {}: expected prev_hash '{}', got '{}'",
                    entry.sequence_number(),
                    &expected_prev_hash[..expected_prev_hash.len().min(16)],
                    &link.prev_hash[..link.prev_hash.len().min(16)],
                ),
            };
        }

        let recomputed = chain_hash(&link.prev_hash, &entry.chain_fields());
        if recomputed != link.entry_hash {
            return ChainVerification {
                is_valid: false,
                total_entries: total,
                first_broken_sequence: Some(entry.sequence_number()),
                message: format!(
                    "Hash mismatch at sequence {}: entry may have been tampered with",
                    entry.sequence_number(),
                ),
            };
        }

        expected_prev_hash = link.entry_hash.clone();
    }

    ChainVerification {
        is_valid: true,
        total_entries: total,
        first_broken_sequence: None,
        message: format!("All {} entries verified successfully", entries.len()),
    }
}
