use std::fmt;
use serde::{Deserialize, Serialize};
use crate::error::{StorageError, StorageResult};

/// Opaque caller key shared by quota tracking and premium status.
///
/// Usually the caller's network address; an authenticated user id works the
/// same way since nothing downstream interprets the value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new(raw: impl Into<String>) -> StorageResult<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(StorageError::InvalidIdentity(raw));
        }
        Ok(Identity(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = StorageError;

    fn try_from(value: String) -> StorageResult<Self> {
        Identity::new(value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
