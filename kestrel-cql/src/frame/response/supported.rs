use std::collections::HashMap;

use bytes::BufMut;

use crate::frame::frame_errors::LowLevelDeserializationError;
use crate::frame::types;

/// SUPPORTED: the STARTUP options the server accepts, with their allowed values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, LowLevelDeserializationError> {
        let options = types::read_string_multimap(buf)?;

        Ok(Supported { options })
    }

    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
        types::write_string_multimap(&self.options, buf)
    }
}
