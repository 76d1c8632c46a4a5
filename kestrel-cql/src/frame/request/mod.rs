//! CQL requests sent by the client.

pub mod execute;
pub mod options;
pub mod prepare;
pub mod query;
pub mod register;
pub mod startup;

use crate::frame::frame_errors::{CqlRequestSerializationError, RequestDeserializationError};
use crate::frame::protocol_version::ProtocolVersion;
use crate::frame::TryFromPrimitiveError;

pub use execute::Execute;
pub use options::Options;
pub use prepare::Prepare;
pub use query::Query;
pub use register::Register;
pub use startup::Startup;

/// Opcode of a request, used to identify the request type in a CQL frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Batch = 0x0D,
    AuthResponse = 0x0F,
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Startup),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0B => Ok(Self::Register),
            0x0D => Ok(Self::Batch),
            0x0F => Ok(Self::AuthResponse),
            _ => Err(TryFromPrimitiveError {
                enum_name: "RequestOpcode",
                primitive: value,
            }),
        }
    }
}

impl std::fmt::Display for RequestOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind_str = match self {
            RequestOpcode::Startup => "STARTUP",
            RequestOpcode::Options => "OPTIONS",
            RequestOpcode::Query => "QUERY",
            RequestOpcode::Prepare => "PREPARE",
            RequestOpcode::Execute => "EXECUTE",
            RequestOpcode::Register => "REGISTER",
            RequestOpcode::Batch => "BATCH",
            RequestOpcode::AuthResponse => "AUTH_RESPONSE",
        };
        f.write_str(kind_str)
    }
}

/// Requests that can be serialized into a CQL frame body.
pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    /// Appends the body to `buf`, laid out for `version`.
    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError>;
}

/// Requests that can be deserialized from a CQL frame body.
///
/// The driver never reads requests; test servers use this to inspect
/// what the driver sent.
pub trait DeserializableRequest: SerializableRequest + Sized {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError>;
}

/// Parsed requests understood by test servers.
#[derive(Debug)]
#[non_exhaustive]
pub enum Request {
    Startup(Startup),
    Options,
    Query(Query),
    Prepare(Prepare),
    Execute(Execute),
    Register(Register),
}

impl Request {
    /// Deserializes a request body. Returns `None` for opcodes without a parser.
    pub fn deserialize(
        version: ProtocolVersion,
        opcode: RequestOpcode,
        buf: &mut &[u8],
    ) -> Result<Option<Self>, RequestDeserializationError> {
        let request = match opcode {
            RequestOpcode::Startup => Request::Startup(Startup::deserialize(version, buf)?),
            RequestOpcode::Options => Request::Options,
            RequestOpcode::Query => Request::Query(Query::deserialize(version, buf)?),
            RequestOpcode::Prepare => Request::Prepare(Prepare::deserialize(version, buf)?),
            RequestOpcode::Execute => Request::Execute(Execute::deserialize(version, buf)?),
            RequestOpcode::Register => Request::Register(Register::deserialize(version, buf)?),
            _ => return Ok(None),
        };
        Ok(Some(request))
    }
}
