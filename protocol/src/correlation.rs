//! Correlation identifiers for cross-tier request tracing.
//!
//! Every outbound backend call carries one of these so a client-side
//! failure can be matched against backend logs.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque trace identifier, generated client-side and echoed through logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(format!("corr-{}", Uuid::new_v4().simple()))
    }

    /// Wrap an identifier received from elsewhere (e.g. a response header).
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
