//! Errors raised while reading, writing and parsing CQL frames.

use std::num::TryFromIntError;
use std::sync::Arc;

use thiserror::Error;

use super::protocol_version::ProtocolVersion;
use super::response::ResponseOpcode;
use super::TryFromPrimitiveError;
use crate::value::SerializationError;

/// An error that occurred while reading a frame from, or writing a frame to, a stream.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameError {
    /// The frame header said it was sent by a client, but we expected a response.
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,

    /// The frame header said it was sent by a server, but we expected a request.
    #[error("Received frame marked as coming from the server")]
    FrameFromServer,

    /// The opcode in the frame header is not known.
    #[error("Unrecognized opcode: {0}")]
    UnknownOpcode(#[from] TryFromPrimitiveError<u8>),

    /// The frame body is larger than the protocol allows.
    #[error("Frame body too large: {length} bytes, at most {max} allowed")]
    TooLarge { length: usize, max: usize },

    /// The connection was closed before the body was read.
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),

    /// The frame is compressed, but no compression was negotiated.
    #[error("Frame is compressed, but no compression negotiated for connection.")]
    NoCompressionNegotiated,

    /// Compression of the frame body failed.
    #[error("Frame compression failed.")]
    FrameCompression,

    /// Decompression of the frame body failed.
    #[error("Frame decompression failed.")]
    FrameDecompression,

    /// Extensions (tracing id, warnings, custom payload) could not be parsed.
    #[error("Malformed frame body extensions: {0}")]
    BodyExtensionsParse(LowLevelDeserializationError),

    /// An I/O error on the underlying stream.
    #[error("Frame I/O error: {0}")]
    StdIoError(Arc<std::io::Error>),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::StdIoError(Arc::new(err))
    }
}

/// A low level error raised when reading a primitive protocol type from a buffer.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
    #[error(transparent)]
    TryFromIntError(#[from] TryFromIntError),
    #[error("Too few bytes received: expected {expected}, received {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

/// An error that occurred while serializing a request body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlRequestSerializationError {
    /// A string, list or map did not fit into the length prefix the protocol uses.
    #[error("Request field too long: {0}")]
    FieldTooLong(#[from] TryFromIntError),

    /// A bound value failed to serialize.
    #[error("Failed to serialize query values: {0}")]
    ValuesSerialization(#[from] SerializationError),

    /// The request uses a feature the negotiated protocol version lacks.
    #[error("Protocol version {version} does not support {feature}")]
    UnsupportedFeature {
        version: ProtocolVersion,
        feature: &'static str,
    },

    /// Compression of the serialized body failed.
    #[error("Failed to compress request body")]
    Compression,
}

/// An error that occurred while deserializing a request. Used by test servers.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestDeserializationError {
    #[error("Low level deser error: {0}")]
    LowLevelDeserialization(#[from] LowLevelDeserializationError),
    #[error("Specified flags are not recognised: {flags:#x}")]
    UnknownFlags { flags: u32 },
    #[error("Expected SerialConsistency, got regular Consistency: {0}")]
    ExpectedSerialConsistency(crate::Consistency),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

impl From<std::io::Error> for RequestDeserializationError {
    fn from(err: std::io::Error) -> Self {
        LowLevelDeserializationError::from(err).into()
    }
}

/// An error that occurred while parsing a response body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlResponseParseError {
    #[error("Failed to deserialize ERROR response: {0}")]
    CqlErrorParseError(#[from] CqlErrorParseError),
    #[error("Failed to deserialize SUPPORTED response: {0}")]
    CqlSupportedParseError(LowLevelDeserializationError),
    #[error("Failed to deserialize EVENT response: {0}")]
    CqlEventParseError(#[from] CqlEventParseError),
    #[error("Failed to deserialize RESULT response: {0}")]
    CqlResultParseError(#[from] CqlResultParseError),
    #[error("Failed to deserialize AUTHENTICATE response: {0}")]
    CqlAuthenticateParseError(LowLevelDeserializationError),
    #[error("Received a {0:?} response where none was expected")]
    UnexpectedOpcode(ResponseOpcode),
}

/// An error while parsing an ERROR response.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlErrorParseError {
    #[error("Malformed error code: {0}")]
    ErrorCodeParseError(LowLevelDeserializationError),
    #[error("Malformed error reason: {0}")]
    ReasonParseError(LowLevelDeserializationError),
    #[error("Malformed error field {field} of DB error {db_error}: {err}")]
    MalformedErrorField {
        db_error: &'static str,
        field: &'static str,
        err: LowLevelDeserializationError,
    },
}

/// An error while parsing an EVENT response.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlEventParseError {
    #[error("Malformed event type string: {0}")]
    EventTypeParseError(LowLevelDeserializationError),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Malformed change type string: {0}")]
    ChangeTypeParseError(LowLevelDeserializationError),
    #[error("Unknown change type: {0}")]
    UnknownChangeType(String),
    #[error("Malformed node address: {0}")]
    NodeAddressParseError(LowLevelDeserializationError),
    #[error("Malformed schema change target: {0}")]
    SchemaChangeParseError(LowLevelDeserializationError),
}

/// An error while parsing a RESULT response.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlResultParseError {
    #[error("Malformed RESULT response id: {0}")]
    ResultIdParseError(LowLevelDeserializationError),
    #[error("Unknown RESULT response id: {0}")]
    UnknownResultId(i32),
    #[error("Malformed RESULT::SetKeyspace: {0}")]
    SetKeyspaceParseError(LowLevelDeserializationError),
    #[error("Malformed RESULT::SchemaChange: {0}")]
    SchemaChangeParseError(CqlEventParseError),
    #[error("Malformed RESULT::Prepared id: {0}")]
    PreparedIdParseError(LowLevelDeserializationError),
    #[error("Malformed RESULT::Prepared metadata: {0}")]
    PreparedMetadataParseError(LowLevelDeserializationError),
    #[error("Malformed RESULT::Rows metadata: {0}")]
    RowsMetadataParseError(LowLevelDeserializationError),
    #[error("Unknown column type id: {0:#x}")]
    UnknownColumnType(u16),
    #[error("Malformed RESULT::Rows content: {0}")]
    RowsParseError(LowLevelDeserializationError),
}
