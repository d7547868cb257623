use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::ProtocolVersion;

use crate::frame::request::{RequestOpcode, SerializableRequest};

// Keys of the STARTUP options map and the SUPPORTED multimap.
pub const CQL_VERSION: &str = "CQL_VERSION";
pub const DEFAULT_CQL_PROTOCOL_VERSION: &str = "3.0.0";
pub const COMPRESSION: &str = "COMPRESSION";

pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(
        &self,
        _version: ProtocolVersion,
        _buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        Ok(())
    }
}
