//! fp-core: shared types, errors, configuration, and event payloads.
//!
//! This crate is the foundational dependency for the other fp-* crates,
//! providing the unified error type, run identifiers, the configuration
//! model and the payloads reported while a transcode runs.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, ErrorCategory, Result};
pub use events::{CodecData, Progress};
pub use ids::RunId;
