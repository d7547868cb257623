use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::ProtocolVersion;

use crate::frame::{
    request::{RequestOpcode, SerializableRequest},
    server_event_type::EventType,
    types,
};

use super::{DeserializableRequest, RequestDeserializationError};

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
            .filter_map(|name| name.parse().ok())
            .collect();
        Ok(Self {
            event_types_to_register_for,
        })
    }
}
