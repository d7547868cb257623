use bytes::{Buf, BufMut};

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::value::SerializedValues;
use crate::frame::ProtocolVersion;
use std::borrow::Cow;

use crate::frame::{
    request::{RequestOpcode, SerializableRequest},
    types,
};

use super::{checked_short_count, DeserializableRequest, RequestDeserializationError};

// Batch flags
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;

/// A BATCH request; one value list per statement.
#[derive(Debug, Clone)]
pub struct Batch<'b> {
    pub statements: Vec<BatchStatement<'b>>,
    pub values: Vec<SerializedValues>,
    pub batch_type: BatchType,
    pub consistency: types::Consistency,
    pub serial_consistency: Option<types::SerialConsistency>,
    pub timestamp: Option<i64>,
}

/// The type of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

impl TryFrom<u8> for BatchType {
    type Error = RequestDeserializationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Logged),
            1 => Ok(Self::Unlogged),
            2 => Ok(Self::Counter),
            _ => Err(RequestDeserializationError::UnexpectedBatchType(value)),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub enum BatchStatement<'a> {
    Query { text: Cow<'a, str> },
    Prepared { id: Cow<'a, [u8]> },
}

impl BatchStatement<'_> {
    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), CqlRequestSerializationError> {
        match self {
            Self::Query { text } => {
                buf.put_u8(0);
                types::write_long_string(text, buf)?;
            }
            Self::Prepared { id } => {
                buf.put_u8(1);
                types::write_short_bytes(id, buf)?;
            }
        }

        Ok(())
    }

    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        if !buf.has_remaining() {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        match buf.get_u8() {
            0 => {
                let text = Cow::Owned(types::read_long_string(buf)?.to_owned());
                Ok(BatchStatement::Query { text })
            }
            1 => {
                let id = types::read_short_bytes(buf)?.to_vec().into();
                Ok(BatchStatement::Prepared { id })
            }
            kind => Err(RequestDeserializationError::UnexpectedBatchStatementKind(
                kind,
            )),
        }
    }
}

impl SerializableRequest for Batch<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        if !version.supports_batch() {
            return Err(CqlRequestSerializationError::UnsupportedInVersion {
                request: "BATCH",
                version: version.as_u8(),
            });
        }
        if self.statements.len() != self.values.len() {
            return Err(CqlRequestSerializationError::BatchValuesMismatch {
                statements: self.statements.len(),
                values: self.values.len(),
            });
        }

        // Serializing type of batch
        buf.put_u8(self.batch_type as u8);

        // Serializing queries
        types::write_short(checked_short_count(self.statements.len())?, buf);
        for (statement, values) in self.statements.iter().zip(self.values.iter()) {
            statement.serialize(buf)?;
            values.write_to_request(buf);
        }

        // Serializing consistency
        types::write_consistency(self.consistency, buf);

        if version == ProtocolVersion::V2 {
            return Ok(());
        }

        // Serializing flags
        let mut flags = 0;
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        buf.put_u8(flags);

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }
        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }
}

impl DeserializableRequest for Batch<'_> {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        if !buf.has_remaining() {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        let batch_type = buf.get_u8().try_into()?;

        let statements_count: usize = types::read_short(buf)?.into();
        let mut statements = Vec::with_capacity(statements_count);
        let mut values = Vec::with_capacity(statements_count);
        for _ in 0..statements_count {
            statements.push(BatchStatement::deserialize(buf)?);
            values.push(SerializedValues::read_from_request(buf)?);
        }

        let consistency = types::read_consistency(buf)?;

        let mut serial_consistency = None;
        let mut timestamp = None;
        if version >= ProtocolVersion::V3 && buf.has_remaining() {
            let flags = buf.get_u8();
            if flags & FLAG_WITH_SERIAL_CONSISTENCY != 0 {
                serial_consistency = match types::read_consistency(buf)? {
                    types::Consistency::LocalSerial => Some(types::SerialConsistency::LocalSerial),
                    _ => Some(types::SerialConsistency::Serial),
                };
            }
            if flags & FLAG_WITH_DEFAULT_TIMESTAMP != 0 {
                timestamp = Some(types::read_long(buf)?);
            }
        }

        Ok(Self {
            statements,
            values,
            batch_type,
            consistency,
            serial_consistency,
            timestamp,
        })
    }
}
