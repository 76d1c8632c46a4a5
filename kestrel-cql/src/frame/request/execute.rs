use bytes::Bytes;

use crate::frame::frame_errors::{CqlRequestSerializationError, RequestDeserializationError};
use crate::frame::protocol_version::ProtocolVersion;
use crate::frame::request::query::QueryParameters;
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::types;

/// EXECUTE: runs a statement prepared on the receiving node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execute {
    pub id: Bytes,
    /// Sent only by versions that support it; an empty id is sent when it is missing.
    pub result_metadata_id: Option<Bytes>,
    /// The keyspace is bound at PREPARE time; `parameters.keyspace` must be `None`.
    pub parameters: QueryParameters,
}

impl SerializableRequest for Execute {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        types::write_short_bytes(&self.id, buf)?;
        if version.supports_result_metadata_id() {
            let result_metadata_id = self.result_metadata_id.as_deref().unwrap_or_default();
            types::write_short_bytes(result_metadata_id, buf)?;
        }
        self.parameters.serialize(version, buf)
    }
}

impl DeserializableRequest for Execute {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
        let result_metadata_id = version
            .supports_result_metadata_id()
            .then(|| types::read_short_bytes(buf).map(Bytes::copy_from_slice))
            .transpose()?;
        let parameters = QueryParameters::deserialize(version, buf)?;

        Ok(Self {
            id,
            result_metadata_id,
            parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::types::Consistency;
    use crate::value::SerializedValues;

    #[test]
    fn result_metadata_id_travels_from_v5() {
        let mut values = SerializedValues::new();
        values.add_value(&42_i32).unwrap();
        let execute = Execute {
            id: Bytes::from_static(b"\xca\xfe"),
            result_metadata_id: Some(Bytes::from_static(b"\x01\x02")),
            parameters: QueryParameters {
                consistency: Consistency::LocalQuorum,
                values,
                ..Default::default()
            },
        };

        let mut v5 = Vec::new();
        execute.serialize(ProtocolVersion::V5, &mut v5).unwrap();
        assert_eq!(
            Execute::deserialize(ProtocolVersion::V5, &mut &v5[..]).unwrap(),
            execute
        );

        let mut v4 = Vec::new();
        execute.serialize(ProtocolVersion::V4, &mut v4).unwrap();
        let parsed = Execute::deserialize(ProtocolVersion::V4, &mut &v4[..]).unwrap();
        assert_eq!(parsed.id, execute.id);
        assert_eq!(parsed.result_metadata_id, None);
        assert_eq!(parsed.parameters, execute.parameters);
    }
}
