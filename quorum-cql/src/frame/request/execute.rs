use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::ProtocolVersion;
use bytes::Bytes;

use crate::{
    frame::request::{query::QueryParameters, RequestOpcode, SerializableRequest},
    frame::types,
};

use super::{DeserializableRequest, RequestDeserializationError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execute<'a> {
    pub id: Bytes,
    pub parameters: QueryParameters<'a>,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        // Serializing statement id
        types::write_short_bytes(&self.id[..], buf)?;

        // Serializing params
        match version {
            ProtocolVersion::V1 => self.parameters.serialize_v1_execute(buf)?,
            _ => self.parameters.serialize(version, buf)?,
        }
        Ok(())
    }
}

impl DeserializableRequest for Execute<'_> {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let id = Bytes::copy_from_slice(types::read_short_bytes(buf)?);
        let parameters = match version {
            ProtocolVersion::V1 => QueryParameters::deserialize_v1_execute(buf)?,
            _ => QueryParameters::deserialize(version, buf)?,
        };

        Ok(Self { id, parameters })
    }
}
