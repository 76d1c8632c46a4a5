//! Server-pushed EVENT responses and the kinds a connection can register for.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use bytes::BufMut;

use crate::frame::frame_errors::CqlEventParseError;
use crate::frame::types;

/// Kinds of server-pushed events a connection can REGISTER for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match &self {
            Self::TopologyChange => "TOPOLOGY_CHANGE",
            Self::StatusChange => "STATUS_CHANGE",
            Self::SchemaChange => "SCHEMA_CHANGE",
        };

        f.write_str(s)
    }
}

impl FromStr for EventType {
    type Err = CqlEventParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TOPOLOGY_CHANGE" => Ok(Self::TopologyChange),
            "STATUS_CHANGE" => Ok(Self::StatusChange),
            "SCHEMA_CHANGE" => Ok(Self::SchemaChange),
            _ => Err(CqlEventParseError::UnknownEventType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

/// A schema element was created, altered or dropped.
///
/// The same layout is carried by `RESULT::SchemaChange`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChangeEvent {
    pub change_type: SchemaChangeType,
    pub target: SchemaChangeTarget,
    pub keyspace_name: String,
    /// Table, type, function or aggregate name. Absent for keyspace changes.
    pub object_name: Option<String>,
    /// Argument types, for functions and aggregates.
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
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::Dropped => "DROPPED",
        }
    }
}

impl SchemaChangeTarget {
    fn as_str(self) -> &'static str {
        match self {
            Self::Keyspace => "KEYSPACE",
            Self::Table => "TABLE",
            Self::Type => "TYPE",
            Self::Function => "FUNCTION",
            Self::Aggregate => "AGGREGATE",
        }
    }
}

impl SchemaChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlEventParseError> {
        let change_type = match types::read_string(buf)
            .map_err(CqlEventParseError::ChangeTypeParseError)?
        {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            other => return Err(CqlEventParseError::UnknownChangeType(other.to_string())),
        };

        let target_str =
            types::read_string(buf).map_err(CqlEventParseError::SchemaChangeParseError)?;
        let target = match target_str {
            "KEYSPACE" => SchemaChangeTarget::Keyspace,
            "TABLE" => SchemaChangeTarget::Table,
            "TYPE" => SchemaChangeTarget::Type,
            "FUNCTION" => SchemaChangeTarget::Function,
            "AGGREGATE" => SchemaChangeTarget::Aggregate,
            other => return Err(CqlEventParseError::UnknownChangeType(other.to_string())),
        };

        let keyspace_name = types::read_string(buf)
            .map_err(CqlEventParseError::SchemaChangeParseError)?
            .to_owned();

        let object_name = match target {
            SchemaChangeTarget::Keyspace => None,
            _ => Some(
                types::read_string(buf)
                    .map_err(CqlEventParseError::SchemaChangeParseError)?
                    .to_owned(),
            ),
        };

        let arguments = match target {
            SchemaChangeTarget::Function | SchemaChangeTarget::Aggregate => {
                types::read_string_list(buf).map_err(CqlEventParseError::SchemaChangeParseError)?
            }
            _ => Vec::new(),
        };

        Ok(Self {
            change_type,
            target,
            keyspace_name,
            object_name,
            arguments,
        })
    }

    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
        types::write_string(self.change_type.as_str(), buf)?;
        types::write_string(self.target.as_str(), buf)?;
        types::write_string(&self.keyspace_name, buf)?;
        if self.target != SchemaChangeTarget::Keyspace {
            types::write_string(self.object_name.as_deref().unwrap_or_default(), buf)?;
        }
        if matches!(
            self.target,
            SchemaChangeTarget::Function | SchemaChangeTarget::Aggregate
        ) {
            types::write_string_list(self.arguments.as_slice(), buf)?;
        }
        Ok(())
    }
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::TopologyChange(_) => EventType::TopologyChange,
            Event::StatusChange(_) => EventType::StatusChange,
            Event::SchemaChange(_) => EventType::SchemaChange,
        }
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlEventParseError> {
        let event_type: EventType = types::read_string(buf)
            .map_err(CqlEventParseError::EventTypeParseError)?
            .parse()?;
        match event_type {
            EventType::TopologyChange => {
                let change = types::read_string(buf)
                    .map_err(CqlEventParseError::ChangeTypeParseError)?;
                let addr =
                    types::read_inet(buf).map_err(CqlEventParseError::NodeAddressParseError)?;
                let event = match change {
                    "NEW_NODE" => TopologyChangeEvent::NewNode(addr),
                    "REMOVED_NODE" => TopologyChangeEvent::RemovedNode(addr),
                    other => {
                        return Err(CqlEventParseError::UnknownChangeType(other.to_string()))
                    }
                };
                Ok(Self::TopologyChange(event))
            }
            EventType::StatusChange => {
                let status = types::read_string(buf)
                    .map_err(CqlEventParseError::ChangeTypeParseError)?;
                let addr =
                    types::read_inet(buf).map_err(CqlEventParseError::NodeAddressParseError)?;
                let event = match status {
                    "UP" => StatusChangeEvent::Up(addr),
                    "DOWN" => StatusChangeEvent::Down(addr),
                    other => {
                        return Err(CqlEventParseError::UnknownChangeType(other.to_string()))
                    }
                };
                Ok(Self::StatusChange(event))
            }
            EventType::SchemaChange => {
                Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(buf)?))
            }
        }
    }

    /// Writes the body of an EVENT frame. Test servers use this to push events.
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
        types::write_string(&self.event_type().to_string(), buf)?;
        match self {
            Event::TopologyChange(change) => {
                let (name, addr) = match change {
                    TopologyChangeEvent::NewNode(addr) => ("NEW_NODE", addr),
                    TopologyChangeEvent::RemovedNode(addr) => ("REMOVED_NODE", addr),
                };
                types::write_string(name, buf)?;
                types::write_inet(*addr, buf);
            }
            Event::StatusChange(status) => {
                let (name, addr) = match status {
                    StatusChangeEvent::Up(addr) => ("UP", addr),
                    StatusChangeEvent::Down(addr) => ("DOWN", addr),
                };
                types::write_string(name, buf)?;
                types::write_inet(*addr, buf);
            }
            Event::SchemaChange(schema) => schema.serialize(buf)?,
        }
        Ok(())
    }
}
