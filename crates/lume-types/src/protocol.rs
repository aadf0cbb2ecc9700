//! Wire protocol identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The two process-variable protocols a server can speak.
///
/// Serialised as the conventional short names `"ca"` and `"pva"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    /// Channel Access: flat scalar/array points, images split into a
    /// family of `:..._RBV` points.
    #[serde(rename = "ca")]
    ChannelAccess,
    /// pvAccess: structured values (NDArray with attributes, structures).
    #[serde(rename = "pva")]
    PvAccess,
}

impl Protocol {
    /// Both protocols, in start order.
    pub const ALL: [Protocol; 2] = [Protocol::ChannelAccess, Protocol::PvAccess];

    /// Short protocol name (`"ca"` / `"pva"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChannelAccess => "ca",
            Self::PvAccess => "pva",
        }
    }

    /// Whether the protocol can carry structured values natively.
    #[must_use]
    pub fn supports_structures(&self) -> bool {
        matches!(self, Self::PvAccess)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a protocol name is neither `ca` nor `pva`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown protocol '{0}' (expected 'ca' or 'pva')")]
pub struct UnknownProtocol(pub String);

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ca" => Ok(Self::ChannelAccess),
            "pva" => Ok(Self::PvAccess),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        assert_eq!("ca".parse::<Protocol>(), Ok(Protocol::ChannelAccess));
        assert_eq!(" PVA ".parse::<Protocol>(), Ok(Protocol::PvAccess));
        assert!("http".parse::<Protocol>().is_err());
        assert_eq!(Protocol::PvAccess.to_string(), "pva");
    }

    #[test]
    fn serde_short_names() {
        let json = serde_json::to_string(&Protocol::ChannelAccess).unwrap();
        assert_eq!(json, "\"ca\"");
        let back: Protocol = serde_json::from_str("\"pva\"").unwrap();
        assert_eq!(back, Protocol::PvAccess);
    }
}
