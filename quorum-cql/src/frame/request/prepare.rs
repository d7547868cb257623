use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::ProtocolVersion;

use crate::{
    frame::request::{RequestOpcode, SerializableRequest},
    frame::types,
};

use super::{DeserializableRequest, RequestDeserializationError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepare<'a> {
    pub query: std::borrow::Cow<'a, str>,
}

impl SerializableRequest for Prepare<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(
        &self,
        _version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        types::write_long_string(&self.query, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Prepare<'_> {
    fn deserialize(
        _version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let query = types::read_long_string(buf)?.to_owned().into();
        Ok(Self { query })
    }
}
