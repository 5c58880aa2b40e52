//! Validated client identifiers.

use crate::error::{ParleyError, ParleyResult};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// The stable id a client announces when it connects.
///
/// Ids are compared byte-for-byte; the only rule is that they are non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> ParleyResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(ParleyError::InvalidMessage("client id must not be empty".into()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ClientId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ClientId {
    type Error = ParleyError;

    fn try_from(value: String) -> ParleyResult<Self> {
        Self::new(value)
    }
}

impl From<ClientId> for String {
    fn from(id: ClientId) -> String {
        id.0
    }
}
