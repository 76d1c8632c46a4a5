//! The ERROR response and the server error codes it carries.

use byteorder::ReadBytesExt;
use bytes::{BufMut, Bytes};
use thiserror::Error;

use crate::frame::frame_errors::{CqlErrorParseError, LowLevelDeserializationError};
use crate::frame::types;
use crate::Consistency;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

// Reads the code-specific fields of one error kind; a failure names the kind and the field.
struct ErrorFields<'a, 'b> {
    db_error: &'static str,
    buf: &'a mut &'b [u8],
}

impl<'a, 'b> ErrorFields<'a, 'b> {
    fn new(db_error: &'static str, buf: &'a mut &'b [u8]) -> Self {
        Self { db_error, buf }
    }

    fn malformed(
        &self,
        field: &'static str,
        err: impl Into<LowLevelDeserializationError>,
    ) -> CqlErrorParseError {
        CqlErrorParseError::MalformedErrorField {
            db_error: self.db_error,
            field,
            err: err.into(),
        }
    }

    fn consistency(&mut self) -> Result<Consistency, CqlErrorParseError> {
        types::read_consistency(self.buf).map_err(|err| self.malformed("CONSISTENCY", err))
    }

    fn int(&mut self, field: &'static str) -> Result<i32, CqlErrorParseError> {
        types::read_int(self.buf).map_err(|err| self.malformed(field, err))
    }

    fn data_present(&mut self) -> Result<bool, CqlErrorParseError> {
        let flag = self
            .buf
            .read_u8()
            .map_err(|err| self.malformed("DATA_PRESENT", err))?;
        Ok(flag != 0)
    }

    fn string(&mut self, field: &'static str) -> Result<String, CqlErrorParseError> {
        match types::read_string(self.buf) {
            Ok(value) => Ok(value.to_owned()),
            Err(err) => Err(self.malformed(field, err)),
        }
    }

    fn short_bytes(&mut self, field: &'static str) -> Result<Bytes, CqlErrorParseError> {
        match types::read_short_bytes(self.buf) {
            Ok(value) => Ok(Bytes::copy_from_slice(value)),
            Err(err) => Err(self.malformed(field, err)),
        }
    }

    fn write_type(&mut self) -> Result<WriteType, CqlErrorParseError> {
        Ok(WriteType::from(self.string("WRITE_TYPE")?.as_str()))
    }
}

impl Error {
    pub fn new(error: DbError, reason: impl Into<String>) -> Self {
        Self {
            error,
            reason: reason.into(),
        }
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlErrorParseError> {
        let code = types::read_int(buf)
            .map_err(|err| CqlErrorParseError::ErrorCodeParseError(err.into()))?;
        let reason = types::read_string(buf)
            .map_err(CqlErrorParseError::ReasonParseError)?
            .to_owned();

        let error = match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1000 => {
                let mut f = ErrorFields::new("UNAVAILABLE", buf);
                DbError::Unavailable {
                    consistency: f.consistency()?,
                    required: f.int("REQUIRED")?,
                    alive: f.int("ALIVE")?,
                }
            }
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => {
                let mut f = ErrorFields::new("WRITE_TIMEOUT", buf);
                DbError::WriteTimeout {
                    consistency: f.consistency()?,
                    received: f.int("RECEIVED")?,
                    required: f.int("REQUIRED")?,
                    write_type: f.write_type()?,
                }
            }
            0x1200 => {
                let mut f = ErrorFields::new("READ_TIMEOUT", buf);
                DbError::ReadTimeout {
                    consistency: f.consistency()?,
                    received: f.int("RECEIVED")?,
                    required: f.int("REQUIRED")?,
                    data_present: f.data_present()?,
                }
            }
            0x1300 => {
                let mut f = ErrorFields::new("READ_FAILURE", buf);
                DbError::ReadFailure {
                    consistency: f.consistency()?,
                    received: f.int("RECEIVED")?,
                    required: f.int("REQUIRED")?,
                    numfailures: f.int("NUM_FAILURES")?,
                    data_present: f.data_present()?,
                }
            }
            0x1500 => {
                let mut f = ErrorFields::new("WRITE_FAILURE", buf);
                DbError::WriteFailure {
                    consistency: f.consistency()?,
                    received: f.int("RECEIVED")?,
                    required: f.int("REQUIRED")?,
                    numfailures: f.int("NUM_FAILURES")?,
                    write_type: f.write_type()?,
                }
            }
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => {
                let mut f = ErrorFields::new("ALREADY_EXISTS", buf);
                DbError::AlreadyExists {
                    keyspace: f.string("KEYSPACE")?,
                    table: f.string("TABLE")?,
                }
            }
            0x2500 => DbError::Unprepared {
                statement_id: ErrorFields::new("UNPREPARED", buf).short_bytes("STATEMENT_ID")?,
            },
            _ => DbError::Other(code),
        };

        Ok(Error { error, reason })
    }

    /// Writes the body of an ERROR frame. Test servers use this to forge errors.
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
        types::write_int(self.error.code(), buf);
        types::write_string(&self.reason, buf)?;
        match &self.error {
            DbError::Unavailable {
                consistency,
                required,
                alive,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*required, buf);
                types::write_int(*alive, buf);
            }
            DbError::WriteTimeout {
                consistency,
                received,
                required,
                write_type,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                types::write_string(write_type.as_str(), buf)?;
            }
            DbError::ReadTimeout {
                consistency,
                received,
                required,
                data_present,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                buf.put_u8(*data_present as u8);
            }
            DbError::ReadFailure {
                consistency,
                received,
                required,
                numfailures,
                data_present,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                types::write_int(*numfailures, buf);
                buf.put_u8(*data_present as u8);
            }
            DbError::WriteFailure {
                consistency,
                received,
                required,
                numfailures,
                write_type,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                types::write_int(*numfailures, buf);
                types::write_string(write_type.as_str(), buf)?;
            }
            DbError::AlreadyExists { keyspace, table } => {
                types::write_string(keyspace, buf)?;
                types::write_string(table, buf)?;
            }
            DbError::Unprepared { statement_id } => {
                types::write_short_bytes(statement_id, buf)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether the server rejected the protocol version of the frame.
    ///
    /// Servers report this as a PROTOCOL_ERROR whose message names the
    /// version, so the message text is the only signal available.
    pub fn is_unsupported_protocol_version(&self) -> bool {
        matches!(self.error, DbError::ProtocolError)
            && self.reason.to_lowercase().contains("protocol version")
    }
}

/// An error sent from the database in response to a query.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DbError {
    /// The submitted query has a syntax error
    #[error("The submitted query has a syntax error")]
    SyntaxError,

    /// The query is syntactically correct but invalid
    #[error("The query is syntactically correct but invalid")]
    Invalid,

    /// Attempted to create a keyspace or a table that was already existing
    #[error(
        "Attempted to create a keyspace or a table that was already existing \
        (keyspace: {keyspace}, table: {table})"
    )]
    AlreadyExists { keyspace: String, table: String },

    /// Authentication failed - bad credentials
    #[error("Authentication failed - bad credentials")]
    AuthenticationError,

    /// The logged user doesn't have the right to perform the query
    #[error("The logged user doesn't have the right to perform the query")]
    Unauthorized,

    /// The query is invalid because of some configuration issue
    #[error("The query is invalid because of some configuration issue")]
    ConfigError,

    /// Not enough nodes are alive to satisfy required consistency level
    #[error(
        "Not enough nodes are alive to satisfy required consistency level \
        (consistency: {consistency}, required: {required}, alive: {alive})"
    )]
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },

    /// The request cannot be processed because the coordinator node is overloaded
    #[error("The request cannot be processed because the coordinator node is overloaded")]
    Overloaded,

    /// The coordinator node is still bootstrapping
    #[error("The coordinator node is still bootstrapping")]
    IsBootstrapping,

    /// Error during truncate operation
    #[error("Error during truncate operation")]
    TruncateError,

    /// Not enough replicas answered a read in time
    #[error("Not enough nodes responded to the read request in time to satisfy required consistency level \
            (consistency: {consistency}, received: {received}, required: {required}, data_present: {data_present})")]
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        /// The replica asked for data has responded
        data_present: bool,
    },

    /// Not enough replicas acknowledged a write in time
    #[error("Not enough nodes responded to the write request in time to satisfy required consistency level \
            (consistency: {consistency}, received: {received}, required: {required}, write_type: {write_type})")]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    },

    /// A non-timeout error during a read request
    #[error(
        "A non-timeout error during a read request \
        (consistency: {consistency}, received: {received}, required: {required}, \
        numfailures: {numfailures}, data_present: {data_present})"
    )]
    ReadFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        data_present: bool,
    },

    /// A non-timeout error during a write request
    #[error(
        "A non-timeout error during a write request \
        (consistency: {consistency}, received: {received}, required: {required}, \
        numfailures: {numfailures}, write_type: {write_type})"
    )]
    WriteFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        write_type: WriteType,
    },

    /// Tried to execute a prepared statement the node does not know
    #[error("Tried to execute a prepared statement that is not prepared")]
    Unprepared { statement_id: Bytes },

    /// Internal server error. This indicates a server-side bug
    #[error("Internal server error. This indicates a server-side bug")]
    ServerError,

    /// Invalid protocol message received from the driver
    #[error("Invalid protocol message received from the driver")]
    ProtocolError,

    /// Error code outside of the known set
    #[error("Other error not specified in the protocol. Error code: {0}")]
    Other(i32),
}

impl DbError {
    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Unavailable { .. } => 0x1000,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::WriteTimeout { .. } => 0x1100,
            DbError::ReadTimeout { .. } => 0x1200,
            DbError::ReadFailure { .. } => 0x1300,
            DbError::WriteFailure { .. } => 0x1500,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::AlreadyExists { .. } => 0x2400,
            DbError::Unprepared { .. } => 0x2500,
            DbError::Other(code) => *code,
        }
    }
}

/// Type of write operation requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteType {
    /// Non-batched non-counter write
    Simple,
    /// Logged batch write that made it into the batch log
    Batch,
    /// Unlogged batch. No batch log write has been attempted.
    UnloggedBatch,
    /// Counter write (batched or not)
    Counter,
    /// Timeout while writing to the batch log of a logged batch
    BatchLog,
    /// Timeout during a Compare And Set write
    Cas,
    /// Timeout acquiring the local materialized view lock
    View,
    /// CDC space limit exceeded
    Cdc,
    Other(String),
}

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<&str> for WriteType {
    fn from(write_type_str: &str) -> WriteType {
        match write_type_str {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            "VIEW" => WriteType::View,
            "CDC" => WriteType::Cdc,
            _ => WriteType::Other(write_type_str.to_string()),
        }
    }
}

impl WriteType {
    pub fn as_str(&self) -> &str {
        match self {
            WriteType::Simple => "SIMPLE",
            WriteType::Batch => "BATCH",
            WriteType::UnloggedBatch => "UNLOGGED_BATCH",
            WriteType::Counter => "COUNTER",
            WriteType::BatchLog => "BATCH_LOG",
            WriteType::Cas => "CAS",
            WriteType::View => "VIEW",
            WriteType::Cdc => "CDC",
            WriteType::Other(write_type) => write_type.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DbError, Error, WriteType};
    use crate::frame::frame_errors::CqlErrorParseError;
    use crate::Consistency;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    fn make_error_request_bytes(error_code: i32, message: &str) -> Vec<u8> {
        let mut bytes: Vec<u8> = Vec::new();
        let message_len: u16 = message.len().try_into().unwrap();

        bytes.extend(error_code.to_be_bytes());
        bytes.extend(message_len.to_be_bytes());
        bytes.extend(message.as_bytes());

        bytes
    }

    #[test]
    fn deserialize_simple_errors() {
        let simple_error_mappings: [(i32, DbError); 11] = [
            (0x0000, DbError::ServerError),
            (0x000A, DbError::ProtocolError),
            (0x0100, DbError::AuthenticationError),
            (0x1001, DbError::Overloaded),
            (0x1002, DbError::IsBootstrapping),
            (0x1003, DbError::TruncateError),
            (0x2000, DbError::SyntaxError),
            (0x2100, DbError::Unauthorized),
            (0x2200, DbError::Invalid),
            (0x2300, DbError::ConfigError),
            (0x1234, DbError::Other(0x1234)),
        ];

        for (error_code, expected_error) in &simple_error_mappings {
            let bytes: Vec<u8> = make_error_request_bytes(*error_code, "simple message");
            let error: Error = Error::deserialize(&mut bytes.as_slice()).unwrap();
            assert_eq!(error.error, *expected_error);
            assert_eq!(error.reason, "simple message");
        }
    }

    #[test]
    fn forged_errors_parse_back() {
        let errors = [
            DbError::Unavailable {
                consistency: Consistency::Quorum,
                required: 2,
                alive: 1,
            },
            DbError::ReadTimeout {
                consistency: Consistency::LocalQuorum,
                received: 1,
                required: 2,
                data_present: true,
            },
            DbError::WriteTimeout {
                consistency: Consistency::All,
                received: 0,
                required: 3,
                write_type: WriteType::BatchLog,
            },
            DbError::WriteFailure {
                consistency: Consistency::Two,
                received: 1,
                required: 2,
                numfailures: 1,
                write_type: WriteType::Other("SOMETHING_NEW".to_owned()),
            },
            DbError::Unprepared {
                statement_id: Bytes::from_static(b"id"),
            },
        ];

        for db_error in errors {
            let error = Error::new(db_error, "forged");
            let mut buf = Vec::new();
            error.serialize(&mut buf).unwrap();
            assert_eq!(Error::deserialize(&mut &buf[..]).unwrap(), error);
        }
    }

    #[test]
    fn truncated_error_fields_are_reported() {
        let mut bytes = make_error_request_bytes(0x1000, "message");
        bytes.extend(0x0004_u16.to_be_bytes());
        let err = Error::deserialize(&mut bytes.as_slice()).unwrap_err();
        assert!(err.to_string().contains("REQUIRED"), "{err}");
    }

    #[test]
    fn malformed_fields_name_their_error_kind() {
        // UNPREPARED announcing a 16-byte id but carrying two.
        let mut unprepared = make_error_request_bytes(0x2500, "unprepared");
        unprepared.extend(16_u16.to_be_bytes());
        unprepared.extend(b"id");
        assert_matches!(
            Error::deserialize(&mut unprepared.as_slice()),
            Err(CqlErrorParseError::MalformedErrorField {
                db_error: "UNPREPARED",
                field: "STATEMENT_ID",
                ..
            })
        );

        // READ_TIMEOUT cut off right before its data-present flag.
        let mut read_timeout = make_error_request_bytes(0x1200, "timeout");
        read_timeout.extend(0x0001_u16.to_be_bytes());
        read_timeout.extend(1_i32.to_be_bytes());
        read_timeout.extend(1_i32.to_be_bytes());
        assert_matches!(
            Error::deserialize(&mut read_timeout.as_slice()),
            Err(CqlErrorParseError::MalformedErrorField {
                db_error: "READ_TIMEOUT",
                field: "DATA_PRESENT",
                ..
            })
        );
    }

    #[test]
    fn unsupported_version_detection() {
        let rejected = Error::new(
            DbError::ProtocolError,
            "Invalid or unsupported Protocol Version (5); supported versions are (3/v3, 4/v4)",
        );
        assert!(rejected.is_unsupported_protocol_version());

        let other_protocol_error = Error::new(DbError::ProtocolError, "Unknown opcode 77");
        assert!(!other_protocol_error.is_unsupported_protocol_version());

        let not_protocol = Error::new(DbError::Invalid, "bad protocol version in column name");
        assert!(!not_protocol.is_unsupported_protocol_version());
    }
}
