//! Surrogate Predictor
//!
//! Stand-in models that synthesize a decision from the raw market context
//! when no recorded inference can be replayed. Every implementation is
//! deterministic for a fixed model version.

pub mod http;
pub mod linear;
pub mod rule_based;

pub use http::HttpSurrogate;
pub use linear::{ClassWeights, LinearModelSnapshot, LinearSurrogate};
pub use rule_based::{RuleBasedSurrogate, RuleWeights};
