//! CQL protocol-level representation of a `SUPPORTED` response.

use crate::frame::frame_errors::CqlResponseParseError;
use crate::frame::types;
use crate::frame::Compression;
use std::collections::HashMap;

const COMPRESSION_KEY: &str = "COMPRESSION";

/// The server's answer to OPTIONS: every startup option it accepts with its allowed values.
#[derive(Debug, Default)]
pub struct Supported {
    pub options: HashMap<String, Vec<String>>,
}

impl Supported {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let options = types::read_string_multimap(buf)?;

        Ok(Supported { options })
    }

    /// Whether the server listed `compression` among its algorithms.
    pub fn supports_compression(&self, compression: Compression) -> bool {
        self.options
            .get(COMPRESSION_KEY)
            .is_some_and(|algorithms| algorithms.iter().any(|a| a == compression.as_str()))
    }
}
