//! Replay Engine
//!
//! Capture of live inferences and deterministic replay of them during
//! backtests, with an exact -> nearest -> surrogate -> default fallback
//! chain.

pub mod config;
pub mod recorder;
pub mod resolver;
pub mod runtime;
pub mod stats;


pub use config::{IndexBackend, ReplayConfig, ResolverConfig, SurrogateConfig};
pub use recorder::{CaptureOutcome, CaptureRequest, Recorder};
pub use resolver::{ReplayResolver, Resolution, ResolveRequest};
pub use runtime::{build_surrogate, ReplayRuntime};
pub use stats::{ResolverStats, StatsSnapshot};
