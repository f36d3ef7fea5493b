//! Message types and metadata for the A2A protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Protocol version stamped on every new envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Major version this implementation understands.
pub const SUPPORTED_MAJOR_VERSION: u32 = 1;

/// Default delivery window in seconds.
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Default informational priority (1-10, higher = more urgent).
pub const DEFAULT_PRIORITY: i32 = 5;

/// Message type classification. The set is closed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Initial plan put forward by the planning agent
    Proposal,
    /// Refined plan returned by the optimizing agent
    OptimizedPlan,
    /// Request for information
    Query,
    /// Answer to a query
    Response,
    /// Error report; moves the receiving workflow to `errored`
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Proposal => "proposal",
            MessageType::OptimizedPlan => "optimized_plan",
            MessageType::Query => "query",
            MessageType::Response => "response",
            MessageType::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposal" => Ok(MessageType::Proposal),
            "optimized_plan" => Ok(MessageType::OptimizedPlan),
            "query" => Ok(MessageType::Query),
            "response" => Ok(MessageType::Response),
            "error" => Ok(MessageType::Error),
            other => Err(Error::Validation(format!("unknown message type '{}'", other))),
        }
    }
}

/// Routing metadata carried by every envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageMeta {
    /// Sender agent ID
    pub sender: String,
    /// Receiver agent ID
    pub receiver: String,
    /// Informational only; never affects delivery order
    pub priority: i32,
    /// Delivery window in seconds, 0 = no expiry
    pub ttl: u64,
}

/// Parse the major component of a dotted version string.
pub fn major_version(version: &str) -> Option<u32> {
    version.split('.').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_parse() {
        assert_eq!("proposal".parse::<MessageType>().unwrap(), MessageType::Proposal);
        assert_eq!(
            "optimized_plan".parse::<MessageType>().unwrap(),
            MessageType::OptimizedPlan
        );
        assert!(matches!(
            "handshake".parse::<MessageType>(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_message_type_wire_name() {
        let json = serde_json::to_string(&MessageType::OptimizedPlan).unwrap();
        assert_eq!(json, "\"optimized_plan\"");
        assert_eq!(MessageType::OptimizedPlan.to_string(), "optimized_plan");
    }

    #[test]
    fn test_major_version() {
        assert_eq!(major_version("1.0"), Some(1));
        assert_eq!(major_version("2.3.1"), Some(2));
        assert_eq!(major_version("v1"), None);
        assert_eq!(major_version(""), None);
    }
}
