use std::collections::HashMap;

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::ProtocolVersion;

use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

/// Protocol v1 answer to AUTHENTICATE: a plain map of credentials.
pub struct Credentials {
    pub credentials: HashMap<String, String>,
}

impl SerializableRequest for Credentials {
    const OPCODE: RequestOpcode = RequestOpcode::Credentials;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        if version != ProtocolVersion::V1 {
            return Err(CqlRequestSerializationError::UnsupportedInVersion {
                request: "CREDENTIALS",
                version: version.as_u8(),
            });
        }
        types::write_string_map(&self.credentials, buf)?;
        Ok(())
    }
}
