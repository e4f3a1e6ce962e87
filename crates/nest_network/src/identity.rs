//! Nest identity.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A unique identifier for a nest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NestId(pub String);

impl NestId {
    /// Generate a random nest ID (UUID v4), for nests nobody needs to name.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for NestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&NestId> for NestId {
    fn from(id: &NestId) -> Self {
        id.clone()
    }
}

impl Borrow<str> for NestId {
    fn borrow(&self) -> &str {
        &self.0
    }
}
