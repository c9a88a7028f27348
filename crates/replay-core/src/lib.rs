//! Replay Core
//!
//! Shared vocabulary for capturing model inferences and replaying them
//! deterministically: the record/decision data model, the error taxonomy,
//! the fingerprint function, the audit hash chain and the capability
//! traits implemented by stores, indexes and surrogate models.

pub mod chain;
pub mod error;
pub mod fingerprint;
pub mod traits;
pub mod types;

pub use chain::{chain_hash, verify_chain, ChainLink, ChainVerification, Chained};
pub use error::*;
pub use fingerprint::{
    compute_fingerprint, quantize, quantized_digest, sha256_hex, Fingerprint, FINGERPRINT_VERSION,
};
pub use traits::*;
pub use types::*;
