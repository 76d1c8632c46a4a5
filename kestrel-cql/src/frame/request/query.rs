use bytes::{BufMut, Bytes};

use crate::frame::frame_errors::{CqlRequestSerializationError, RequestDeserializationError};
use crate::frame::protocol_version::ProtocolVersion;
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types::{self, SerialConsistency};
use crate::value::SerializedValues;

// Query flags
const FLAG_VALUES: u32 = 0x01;
const FLAG_SKIP_METADATA: u32 = 0x02;
const FLAG_PAGE_SIZE: u32 = 0x04;
const FLAG_WITH_PAGING_STATE: u32 = 0x08;
const FLAG_WITH_SERIAL_CONSISTENCY: u32 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u32 = 0x20;
const FLAG_WITH_KEYSPACE: u32 = 0x80;
const ALL_FLAGS: u32 = FLAG_VALUES
    | FLAG_SKIP_METADATA
    | FLAG_PAGE_SIZE
    | FLAG_WITH_PAGING_STATE
    | FLAG_WITH_SERIAL_CONSISTENCY
    | FLAG_WITH_DEFAULT_TIMESTAMP
    | FLAG_WITH_KEYSPACE;

/// QUERY: an unprepared statement with positional values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub contents: String,
    pub parameters: QueryParameters,
}

impl SerializableRequest for Query {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        types::write_long_string(&self.contents, buf)?;
        self.parameters.serialize(version, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Query {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let contents = types::read_long_string(buf)?.to_owned();
        let parameters = QueryParameters::deserialize(version, buf)?;

        Ok(Self {
            contents,
            parameters,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryParameters {
    pub consistency: types::Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub timestamp: Option<i64>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    /// Per-request keyspace. Needs a protocol version with `set_keyspace`.
    pub keyspace: Option<String>,
    pub values: SerializedValues,
}

impl QueryParameters {
    pub fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }

        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }

        if self.paging_state.is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }

        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }

        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        if self.keyspace.is_some() {
            if !version.supports_set_keyspace() {
                return Err(CqlRequestSerializationError::UnsupportedFeature {
                    version,
                    feature: "per-request keyspace",
                });
            }
            flags |= FLAG_WITH_KEYSPACE;
        }

        if version.uses_int_query_flags() {
            buf.put_u32(flags);
        } else {
            // Only the low byte is defined before the flags were widened.
            buf.put_u8(flags as u8);
        }

        if !self.values.is_empty() {
            self.values.write_to_request(buf);
        }

        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }

        if let Some(paging_state) = &self.paging_state {
            types::write_bytes(paging_state, buf)?;
        }

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }

        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        if let Some(keyspace) = &self.keyspace {
            types::write_string(keyspace, buf)?;
        }

        Ok(())
    }

    pub fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let consistency = types::read_consistency(buf)?;

        let flags = if version.uses_int_query_flags() {
            types::read_int(buf)? as u32
        } else {
            types::read_raw_bytes(1, buf)?[0] as u32
        };
        let unknown_flags = flags & !ALL_FLAGS;
        if unknown_flags != 0 {
            return Err(RequestDeserializationError::UnknownFlags {
                flags: unknown_flags,
            });
        }
        let values_flag = (flags & FLAG_VALUES) != 0;
        let page_size_flag = (flags & FLAG_PAGE_SIZE) != 0;
        let paging_state_flag = (flags & FLAG_WITH_PAGING_STATE) != 0;
        let serial_consistency_flag = (flags & FLAG_WITH_SERIAL_CONSISTENCY) != 0;
        let default_timestamp_flag = (flags & FLAG_WITH_DEFAULT_TIMESTAMP) != 0;
        let keyspace_flag = (flags & FLAG_WITH_KEYSPACE) != 0;

        let values = if values_flag {
            SerializedValues::new_from_frame(buf)?
        } else {
            SerializedValues::new()
        };

        let page_size = page_size_flag.then(|| types::read_int(buf)).transpose()?;
        let paging_state = if paging_state_flag {
            Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
        } else {
            None
        };
        let serial_consistency = serial_consistency_flag
            .then(|| types::read_consistency(buf))
            .transpose()?
            .map(|consistency| {
                SerialConsistency::try_from(consistency)
                    .map_err(|err| RequestDeserializationError::ExpectedSerialConsistency(err.0))
            })
            .transpose()?;
        let timestamp = if default_timestamp_flag {
            Some(types::read_long(buf)?)
        } else {
            None
        };
        let keyspace = if keyspace_flag {
            Some(types::read_string(buf)?.to_owned())
        } else {
            None
        };

        Ok(Self {
            consistency,
            serial_consistency,
            timestamp,
            page_size,
            paging_state,
            keyspace,
            values,
        })
    }
}
