//! Identifier types for indexed marketplace events
//!
//! `TxHash` is the primary key of every stored event and is validated on
//! construction. Order hashes and addresses are carried opaquely; their
//! format is owned by the upstream chain.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::errors::TypeError;

/// Upstream transaction identifier
///
/// Format: `0x` followed by one or more hex digits. Case is preserved, so
/// `0xAA` and `0xaa` are distinct keys, matching how the upstream feed
/// reports them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    /// Parse a transaction hash, rejecting anything that is not `0x`-prefixed hex
    pub fn parse(raw: impl Into<String>) -> Result<Self, TypeError> {
        let raw = raw.into();
        let valid = raw
            .strip_prefix("0x")
            .map(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit()))
            .unwrap_or(false);

        if valid {
            Ok(Self(raw))
        } else {
            Err(TypeError::InvalidTxHash(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TxHash::parse(raw).map_err(serde::de::Error::custom)
    }
}

impl std::str::FromStr for TxHash {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TxHash::parse(s)
    }
}

/// Hash of a signed marketplace order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderHash(String);

impl OrderHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// On-chain account address (maker, transaction sender)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
