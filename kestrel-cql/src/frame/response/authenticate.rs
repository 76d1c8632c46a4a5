use crate::frame::frame_errors::LowLevelDeserializationError;
use crate::frame::types;

/// AUTHENTICATE: the server demands a SASL exchange before READY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticate {
    pub authenticator_name: String,
}

impl Authenticate {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, LowLevelDeserializationError> {
        let authenticator_name = types::read_string(buf)?.to_string();

        Ok(Authenticate { authenticator_name })
    }
}
