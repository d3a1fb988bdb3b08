//! Owner tokens group accounts so they can be released together.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::job::JobId;

/// Caller-supplied identifier under which accounts are held.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// A token no other caller can collide with.
    #[must_use]
    pub fn unique() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OwnerToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OwnerToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<JobId> for OwnerToken {
    fn from(id: JobId) -> Self {
        Self(format!("job-{id}"))
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
