//! Downstream delivery outcome for a stored event
//!
//! A stored event with no status is pending: it has not been confirmed by
//! the orderbook yet. Holders represent that as `Option::<DeliveryStatus>::None`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::errors::TypeError;

/// Status reported by the orderbook for one forwarded event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    /// The orderbook applied the event
    Success,
    /// The orderbook does not know the referenced order
    NotFound,
    /// The orderbook rejected the event with a description
    Error(String),
}

impl DeliveryStatus {
    pub const SUCCESS: &'static str = "success";
    pub const NOT_FOUND: &'static str = "not_found";

    /// Parse the wire/storage representation
    ///
    /// Any non-empty text other than the two well-known values is kept
    /// verbatim as an error description.
    pub fn parse(raw: &str) -> Result<Self, TypeError> {
        match raw {
            "" => Err(TypeError::EmptyDeliveryStatus),
            Self::SUCCESS => Ok(DeliveryStatus::Success),
            Self::NOT_FOUND => Ok(DeliveryStatus::NotFound),
            other => Ok(DeliveryStatus::Error(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeliveryStatus::Success => Self::SUCCESS,
            DeliveryStatus::NotFound => Self::NOT_FOUND,
            DeliveryStatus::Error(description) => description,
        }
    }

    /// Whether the orderbook reached a definitive verdict on the order
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Success | DeliveryStatus::NotFound)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DeliveryStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DeliveryStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DeliveryStatus::parse(&raw).map_err(serde::de::Error::custom)
    }
}
