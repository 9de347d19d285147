//! Correlation identifiers linking a request message to its reply.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque token carried in the `correlation_id` message property.
///
/// Freshly generated ids are random UUID v4 strings. Ids received from the
/// wire are kept verbatim, so any string a foreign producer chose round-trips
/// unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generates a new random correlation id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// Lets `DashMap<CorrelationId, _>` be queried with a plain `&str`.
impl Borrow<str> for CorrelationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
