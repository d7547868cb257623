//! CQL protocol-level representation of an `EVENT` response.

use crate::frame::frame_errors::CqlResponseParseError;
use crate::frame::server_event_type::EventType;
use crate::frame::types;
use crate::frame::ProtocolVersion;
use bytes::BufMut;
use std::net::SocketAddr;

/// Event that the server notified the client about.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
    /// Sent by servers speaking protocol v3 or older.
    MovedNode(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

/// A schema element that was created, updated or dropped.
///
/// Protocol v1 and v2 only report keyspaces and tables; an empty table name
/// denotes a keyspace change there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChangeEvent {
    pub change_type: SchemaChangeType,
    pub target: SchemaChangeTarget,
    pub keyspace_name: String,
    /// Table, type, function or aggregate name; empty for keyspaces.
    pub object_name: String,
    /// Argument types of a changed function or aggregate.
    pub arguments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeTarget {
    Keyspace,
    Table,
    Type,
    Function,
    Aggregate,
}

impl SchemaChangeType {
    fn as_str(self) -> &'static str {
        match self {
            SchemaChangeType::Created => "CREATED",
            SchemaChangeType::Updated => "UPDATED",
            SchemaChangeType::Dropped => "DROPPED",
        }
    }
}

impl SchemaChangeTarget {
    fn as_str(self) -> &'static str {
        match self {
            SchemaChangeTarget::Keyspace => "KEYSPACE",
            SchemaChangeTarget::Table => "TABLE",
            SchemaChangeTarget::Type => "TYPE",
            SchemaChangeTarget::Function => "FUNCTION",
            SchemaChangeTarget::Aggregate => "AGGREGATE",
        }
    }
}

impl Event {
    pub fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, CqlResponseParseError> {
        let event_type: EventType = types::read_string(buf)?.parse()?;
        match event_type {
            EventType::TopologyChange => {
                Ok(Self::TopologyChange(TopologyChangeEvent::deserialize(buf)?))
            }
            EventType::StatusChange => Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?)),
            EventType::SchemaChange => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(
                version, buf,
            )?)),
        }
    }

    /// Writes the body of an EVENT response. Used by scripted servers in tests.
    pub fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut impl BufMut,
    ) -> Result<(), std::num::TryFromIntError> {
        match self {
            Event::TopologyChange(event) => {
                types::write_string("TOPOLOGY_CHANGE", buf)?;
                let (change, addr) = match event {
                    TopologyChangeEvent::NewNode(addr) => ("NEW_NODE", addr),
                    TopologyChangeEvent::RemovedNode(addr) => ("REMOVED_NODE", addr),
                    TopologyChangeEvent::MovedNode(addr) => ("MOVED_NODE", addr),
                };
                types::write_string(change, buf)?;
                types::write_inet(*addr, buf);
            }
            Event::StatusChange(event) => {
                types::write_string("STATUS_CHANGE", buf)?;
                let (change, addr) = match event {
                    StatusChangeEvent::Up(addr) => ("UP", addr),
                    StatusChangeEvent::Down(addr) => ("DOWN", addr),
                };
                types::write_string(change, buf)?;
                types::write_inet(*addr, buf);
            }
            Event::SchemaChange(event) => {
                types::write_string("SCHEMA_CHANGE", buf)?;
                event.serialize(version, buf)?;
            }
        }
        Ok(())
    }
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            "MOVED_NODE" => Ok(Self::MovedNode(addr)),
            _ => Err(CqlResponseParseError::UnknownEventChange {
                event: "TOPOLOGY_CHANGE",
                change: type_of_change.to_string(),
            }),
        }
    }
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let type_of_change = types::read_string(buf)?;
        let addr = types::read_inet(buf)?;

        match type_of_change {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(CqlResponseParseError::UnknownEventChange {
                event: "STATUS_CHANGE",
                change: type_of_change.to_string(),
            }),
        }
    }
}

impl SchemaChangeEvent {
    pub fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, CqlResponseParseError> {
        let change = types::read_string(buf)?;
        let change_type = match change {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => {
                return Err(CqlResponseParseError::UnknownEventChange {
                    event: "SCHEMA_CHANGE",
                    change: change.to_string(),
                })
            }
        };

        if version < ProtocolVersion::V3 {
            let keyspace_name = types::read_string(buf)?.to_string();
            let object_name = types::read_string(buf)?.to_string();
            let target = if object_name.is_empty() {
                SchemaChangeTarget::Keyspace
            } else {
                SchemaChangeTarget::Table
            };
            return Ok(Self {
                change_type,
                target,
                keyspace_name,
                object_name,
                arguments: Vec::new(),
            });
        }

        let target_str = types::read_string(buf)?;
        let target = match target_str {
            "KEYSPACE" => SchemaChangeTarget::Keyspace,
            "TABLE" => SchemaChangeTarget::Table,
            "TYPE" => SchemaChangeTarget::Type,
            "FUNCTION" => SchemaChangeTarget::Function,
            "AGGREGATE" => SchemaChangeTarget::Aggregate,
            _ => {
                return Err(CqlResponseParseError::UnknownEventChange {
                    event: "SCHEMA_CHANGE",
                    change: target_str.to_string(),
                })
            }
        };
        let keyspace_name = types::read_string(buf)?.to_string();

        let (object_name, arguments) = match target {
            SchemaChangeTarget::Keyspace => (String::new(), Vec::new()),
            SchemaChangeTarget::Table | SchemaChangeTarget::Type => {
                (types::read_string(buf)?.to_string(), Vec::new())
            }
            SchemaChangeTarget::Function | SchemaChangeTarget::Aggregate => (
                types::read_string(buf)?.to_string(),
                types::read_string_list(buf)?,
            ),
        };

        Ok(Self {
            change_type,
            target,
            keyspace_name,
            object_name,
            arguments,
        })
    }

    pub fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut impl BufMut,
    ) -> Result<(), std::num::TryFromIntError> {
        types::write_string(self.change_type.as_str(), buf)?;
        if version < ProtocolVersion::V3 {
            types::write_string(&self.keyspace_name, buf)?;
            return types::write_string(&self.object_name, buf);
        }

        types::write_string(self.target.as_str(), buf)?;
        types::write_string(&self.keyspace_name, buf)?;
        match self.target {
            SchemaChangeTarget::Keyspace => {}
            SchemaChangeTarget::Table | SchemaChangeTarget::Type => {
                types::write_string(&self.object_name, buf)?;
            }
            SchemaChangeTarget::Function | SchemaChangeTarget::Aggregate => {
                types::write_string(&self.object_name, buf)?;
                types::write_string_list(&self.arguments, buf)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn status_change_carries_the_node_address() {
        let mut body = Vec::new();
        types::write_string("STATUS_CHANGE", &mut body).unwrap();
        types::write_string("DOWN", &mut body).unwrap();
        types::write_inet("10.0.0.7:9042".parse().unwrap(), &mut body);

        let event = Event::deserialize(ProtocolVersion::V4, &mut &body[..]).unwrap();
        assert_eq!(
            event,
            Event::StatusChange(StatusChangeEvent::Down("10.0.0.7:9042".parse().unwrap()))
        );
    }

    #[test]
    fn schema_change_layout_differs_before_v3() {
        let event = SchemaChangeEvent {
            change_type: SchemaChangeType::Dropped,
            target: SchemaChangeTarget::Table,
            keyspace_name: "ks".to_string(),
            object_name: "t".to_string(),
            arguments: Vec::new(),
        };

        for version in [ProtocolVersion::V2, ProtocolVersion::V4] {
            let mut body = Vec::new();
            event.serialize(version, &mut body).unwrap();
            let parsed = SchemaChangeEvent::deserialize(version, &mut &body[..]).unwrap();
            assert_eq!(parsed, event);
        }

        // In v2 the body is change, keyspace, table with no target
        let mut body = Vec::new();
        event.serialize(ProtocolVersion::V2, &mut body).unwrap();
        assert_eq!(body.len(), (2 + 7) + (2 + 2) + (2 + 1));
    }

    #[test]
    fn unknown_topology_change_is_rejected() {
        let mut body = Vec::new();
        types::write_string("TOPOLOGY_CHANGE", &mut body).unwrap();
        types::write_string("EXPLODED_NODE", &mut body).unwrap();
        types::write_inet("10.0.0.7:9042".parse().unwrap(), &mut body);

        assert_matches!(
            Event::deserialize(ProtocolVersion::V3, &mut &body[..]),
            Err(CqlResponseParseError::UnknownEventChange {
                event: "TOPOLOGY_CHANGE",
                ..
            })
        );
    }
}
