//! CQL requests sent by the client.

pub mod auth_response;
pub mod batch;
pub mod credentials;
pub mod execute;
pub mod options;
pub mod prepare;
pub mod query;
pub mod register;
pub mod startup;

use bytes::Bytes;
use thiserror::Error;

pub use auth_response::AuthResponse;
pub use batch::Batch;
pub use credentials::Credentials;
pub use execute::Execute;
pub use options::Options;
pub use prepare::Prepare;
pub use query::Query;
pub use register::Register;
pub use startup::Startup;

use super::frame_errors::{CqlRequestSerializationError, LowLevelDeserializationError};
use super::{ProtocolVersion, TryFromPrimitiveError};

/// Opcode of a request, used to identify the request type in a CQL frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Credentials = 0x04,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Batch = 0x0D,
    AuthResponse = 0x0F,
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Startup),
            0x04 => Ok(Self::Credentials),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0B => Ok(Self::Register),
            0x0D => Ok(Self::Batch),
            0x0F => Ok(Self::AuthResponse),
            _ => Err(TryFromPrimitiveError {
                enum_name: "RequestOpcode",
                primitive: value,
            }),
        }
    }
}

impl std::fmt::Display for RequestOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind_str = match self {
            RequestOpcode::Startup => "STARTUP",
            RequestOpcode::Credentials => "CREDENTIALS",
            RequestOpcode::Options => "OPTIONS",
            RequestOpcode::Query => "QUERY",
            RequestOpcode::Prepare => "PREPARE",
            RequestOpcode::Execute => "EXECUTE",
            RequestOpcode::Register => "REGISTER",
            RequestOpcode::Batch => "BATCH",
            RequestOpcode::AuthResponse => "AUTH_RESPONSE",
        };

        f.write_str(kind_str)
    }
}

/// Requests that can be serialized into a CQL frame.
pub trait SerializableRequest {
    /// Opcode of the request, used to identify the request type in the CQL frame.
    const OPCODE: RequestOpcode;

    /// Serializes the request body for the given protocol version.
    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError>;

    /// Serializes the request into a heap-allocated `Bytes` object.
    fn to_bytes(&self, version: ProtocolVersion) -> Result<Bytes, CqlRequestSerializationError> {
        let mut v = Vec::new();
        self.serialize(version, &mut v)?;
        Ok(v.into())
    }
}

/// Requests that can be deserialized from a CQL frame.
///
/// The driver itself never reads requests; scripted test servers do.
pub trait DeserializableRequest: SerializableRequest + Sized {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError>;
}

/// An error type returned by [`DeserializableRequest::deserialize`].
#[doc(hidden)]
#[derive(Debug, Error)]
pub enum RequestDeserializationError {
    #[error("Low level deser error: {0}")]
    LowLevelDeserialization(#[from] LowLevelDeserializationError),
    #[error("Io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Specified flags are not recognised: {:02x}", flags)]
    UnknownFlags { flags: u8 },
    #[error("Unexpected batch type: {0}")]
    UnexpectedBatchType(u8),
    #[error("Unexpected batch statement kind: {0}")]
    UnexpectedBatchStatementKind(u8),
}

/// Writes the common size check for counts that travel as a `[short]`.
pub(crate) fn checked_short_count(count: usize) -> Result<u16, CqlRequestSerializationError> {
    u16::try_from(count).map_err(|_| CqlRequestSerializationError::TooManyItems(count))
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use bytes::Bytes;

    use super::batch::{Batch, BatchStatement, BatchType};
    use super::execute::Execute;
    use super::query::{Query, QueryParameters};
    use super::{DeserializableRequest, SerializableRequest};
    use crate::frame::types::{Consistency, SerialConsistency};
    use crate::frame::value::SerializedValues;
    use crate::frame::ProtocolVersion;

    fn values() -> SerializedValues {
        let mut values = SerializedValues::new();
        values.add_value(Some(&[0, 0, 0, 42])).unwrap();
        values.add_value(None).unwrap();
        values
    }

    #[test]
    fn query_survives_every_version() {
        for version in [
            ProtocolVersion::V1,
            ProtocolVersion::V2,
            ProtocolVersion::V3,
            ProtocolVersion::V4,
        ] {
            let query = Query {
                contents: Cow::Borrowed("SELECT host_id FROM system.local"),
                parameters: QueryParameters {
                    consistency: Consistency::Two,
                    serial_consistency: Some(SerialConsistency::LocalSerial),
                    timestamp: Some(1234),
                    page_size: Some(100),
                    paging_state: Some(Bytes::from_static(b"state")),
                    values: Cow::Owned(values()),
                },
            };

            let bytes = query.to_bytes(version).unwrap();
            let parsed = Query::deserialize(version, &mut &bytes[..]).unwrap();

            assert_eq!(parsed.contents, query.contents);
            assert_eq!(parsed.parameters.consistency, Consistency::Two);
            if version == ProtocolVersion::V1 {
                // v1 only carries the consistency
                assert_eq!(parsed.parameters.page_size, None);
                assert!(parsed.parameters.values.is_empty());
            } else {
                assert_eq!(parsed.parameters.page_size, Some(100));
                assert_eq!(parsed.parameters.values.element_count(), 2);
            }
            if version >= ProtocolVersion::V3 {
                assert_eq!(parsed.parameters.timestamp, Some(1234));
            } else {
                assert_eq!(parsed.parameters.timestamp, None);
            }
        }
    }

    #[test]
    fn execute_carries_the_prepared_id() {
        let execute = Execute {
            id: Bytes::from_static(&[1, 2, 3]),
            parameters: QueryParameters::default(),
        };
        for version in [ProtocolVersion::V1, ProtocolVersion::V4] {
            let bytes = execute.to_bytes(version).unwrap();
            let parsed = Execute::deserialize(version, &mut &bytes[..]).unwrap();
            assert_eq!(parsed.id, execute.id);
        }
    }

    #[test]
    fn batch_requires_version_two() {
        let batch = Batch {
            statements: vec![
                BatchStatement::Query {
                    text: Cow::Borrowed("INSERT INTO t (a) VALUES (1)"),
                },
                BatchStatement::Prepared {
                    id: Cow::Borrowed(&[7, 7]),
                },
            ],
            values: vec![SerializedValues::new(), values()],
            batch_type: BatchType::Unlogged,
            consistency: Consistency::One,
            serial_consistency: None,
            timestamp: None,
        };

        assert!(batch.to_bytes(ProtocolVersion::V1).is_err());

        let bytes = batch.to_bytes(ProtocolVersion::V3).unwrap();
        let parsed = Batch::deserialize(ProtocolVersion::V3, &mut &bytes[..]).unwrap();
        assert_eq!(parsed.statements, batch.statements);
        assert_eq!(parsed.values[1].element_count(), 2);
        assert_eq!(parsed.consistency, Consistency::One);
    }

    #[test]
    fn batch_rejects_mismatched_values() {
        let batch = Batch {
            statements: vec![BatchStatement::Query {
                text: Cow::Borrowed("INSERT INTO t (a) VALUES (1)"),
            }],
            values: vec![],
            batch_type: BatchType::Logged,
            consistency: Consistency::One,
            serial_consistency: None,
            timestamp: None,
        };
        assert!(batch.to_bytes(ProtocolVersion::V4).is_err());
    }
}
