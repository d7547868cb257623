//! Kinds of server push events a connection can REGISTER for.

use std::fmt;
use std::str::FromStr;

use super::frame_errors::CqlResponseParseError;

/// Represents the type of a CQL event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum EventType {
    /// A node joined or left the ring.
    TopologyChange,
    /// A node was reported up or down.
    StatusChange,
    /// A keyspace, table, type, function or aggregate changed.
    SchemaChange,
}

impl EventType {
    /// Every event type; a control connection registers for all of them.
    pub const ALL: [EventType; 3] = [
        EventType::TopologyChange,
        EventType::StatusChange,
        EventType::SchemaChange,
    ];
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match &self {
            Self::TopologyChange => "TOPOLOGY_CHANGE",
            Self::StatusChange => "STATUS_CHANGE",
            Self::SchemaChange => "SCHEMA_CHANGE",
        };

        write!(f, "{s}")
    }
}

impl FromStr for EventType {
    type Err = CqlResponseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOPOLOGY_CHANGE" => Ok(Self::TopologyChange),
            "STATUS_CHANGE" => Ok(Self::StatusChange),
            "SCHEMA_CHANGE" => Ok(Self::SchemaChange),
            _ => Err(CqlResponseParseError::UnknownEventType(s.to_string())),
        }
    }
}
