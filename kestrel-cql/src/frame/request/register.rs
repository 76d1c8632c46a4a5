use crate::frame::frame_errors::{CqlRequestSerializationError, RequestDeserializationError};
use crate::frame::protocol_version::ProtocolVersion;
use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};
use crate::frame::response::event::EventType;
use crate::frame::types;

/// REGISTER: subscribes the connection to server-pushed events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub event_types_to_register_for: Vec<EventType>,
}

impl SerializableRequest for Register {
    const OPCODE: RequestOpcode = RequestOpcode::Register;

    fn serialize(
        &self,
        _version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        let event_types_list = self
            .event_types_to_register_for
            .iter()
            .map(|event| event.to_string())
            .collect::<Vec<_>>();

        types::write_string_list(&event_types_list, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Register {
    fn deserialize(
        _version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let event_types_to_register_for = types::read_string_list(buf)?
            .iter()
            .map(|name| {
                name.parse::<EventType>()
                    .map_err(|_| RequestDeserializationError::UnknownEventType(name.clone()))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            event_types_to_register_for,
        })
    }
}
