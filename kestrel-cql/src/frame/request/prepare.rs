use crate::frame::frame_errors::{CqlRequestSerializationError, RequestDeserializationError};
use crate::frame::protocol_version::ProtocolVersion;
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types;

const FLAG_WITH_KEYSPACE: u32 = 0x01;

/// PREPARE: asks the node to parse a statement once, for later EXECUTE requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepare {
    pub query: String,
    /// Keyspace to prepare the statement in. Needs a protocol version with `set_keyspace`.
    pub keyspace: Option<String>,
}

impl SerializableRequest for Prepare {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        types::write_long_string(&self.query, buf)?;
        if !version.supports_set_keyspace() {
            if self.keyspace.is_some() {
                return Err(CqlRequestSerializationError::UnsupportedFeature {
                    version,
                    feature: "per-request keyspace",
                });
            }
            return Ok(());
        }

        match &self.keyspace {
            Some(keyspace) => {
                types::write_int(FLAG_WITH_KEYSPACE as i32, buf);
                types::write_string(keyspace, buf)?;
            }
            None => types::write_int(0, buf),
        }
        Ok(())
    }
}

impl DeserializableRequest for Prepare {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let query = types::read_long_string(buf)?.to_owned();
        let mut keyspace = None;
        if version.supports_set_keyspace() {
            let flags = types::read_int(buf)? as u32;
            let unknown_flags = flags & !FLAG_WITH_KEYSPACE;
            if unknown_flags != 0 {
                return Err(RequestDeserializationError::UnknownFlags {
                    flags: unknown_flags,
                });
            }
            if flags & FLAG_WITH_KEYSPACE != 0 {
                keyspace = Some(types::read_string(buf)?.to_owned());
            }
        }
        Ok(Self { query, keyspace })
    }
}
