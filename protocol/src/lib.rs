//! Shared data model for the valuation session runtime.
//!
//! This crate is the leaf of the workspace: sessions and their payload
//! values as they travel over the wire, correlation identifiers for
//! cross-tier tracing, and the error taxonomy that drives every
//! retry/fail-fast decision in the crates above it.

pub mod correlation;
pub mod error;
pub mod session;
pub mod values;

pub use correlation::CorrelationId;
pub use error::{ApplicationError, ErrorKind, Result, classify_status};
pub use session::{SessionView, ValuationRange, ValuationResult, ValuationSession};
pub use values::{Value, ValueMap};
