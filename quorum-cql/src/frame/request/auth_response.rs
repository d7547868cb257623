use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::ProtocolVersion;

use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types::write_bytes_opt;

/// SASL token answering an AUTHENTICATE or AUTH_CHALLENGE (protocol v2+).
pub struct AuthResponse {
    pub response: Option<Vec<u8>>,
}

impl SerializableRequest for AuthResponse {
    const OPCODE: RequestOpcode = RequestOpcode::AuthResponse;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        if !version.supports_sasl() {
            return Err(CqlRequestSerializationError::UnsupportedInVersion {
                request: "AUTH_RESPONSE",
                version: version.as_u8(),
            });
        }
        Ok(write_bytes_opt(self.response.as_ref(), buf)?)
    }
}
