use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::ProtocolVersion;

use std::{borrow::Cow, collections::HashMap};

use crate::{
    frame::request::{RequestOpcode, SerializableRequest},
    frame::types,
};

use super::{DeserializableRequest, RequestDeserializationError};

pub struct Startup<'a> {
    pub options: HashMap<Cow<'a, str>, Cow<'a, str>>,
}

impl SerializableRequest for Startup<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(
        &self,
        _version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        types::write_string_map(&self.options, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Startup<'_> {
    fn deserialize(
        _version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let options = types::read_string_map(buf)?
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Ok(Self { options })
    }
}
