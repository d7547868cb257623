use std::borrow::Cow;

use crate::frame::frame_errors::CqlRequestSerializationError;
use crate::frame::types::SerialConsistency;
use crate::frame::value::SerializedValues;
use crate::frame::ProtocolVersion;
use bytes::{Buf, BufMut, Bytes};

use crate::{
    frame::request::{RequestOpcode, SerializableRequest},
    frame::types,
};

use super::{DeserializableRequest, RequestDeserializationError};

// Query flags
const FLAG_VALUES: u8 = 0x01;
const FLAG_SKIP_METADATA: u8 = 0x02;
const FLAG_PAGE_SIZE: u8 = 0x04;
const FLAG_WITH_PAGING_STATE: u8 = 0x08;
const FLAG_WITH_SERIAL_CONSISTENCY: u8 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u8 = 0x20;
const ALL_FLAGS: u8 = FLAG_VALUES
    | FLAG_SKIP_METADATA
    | FLAG_PAGE_SIZE
    | FLAG_WITH_PAGING_STATE
    | FLAG_WITH_SERIAL_CONSISTENCY
    | FLAG_WITH_DEFAULT_TIMESTAMP;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query<'q> {
    pub contents: Cow<'q, str>,
    pub parameters: QueryParameters<'q>,
}

impl<'q> Query<'q> {
    pub fn new(contents: impl Into<Cow<'q, str>>, parameters: QueryParameters<'q>) -> Self {
        Self {
            contents: contents.into(),
            parameters,
        }
    }
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), CqlRequestSerializationError> {
        types::write_long_string(&self.contents, buf)?;
        self.parameters.serialize(version, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Query<'_> {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let contents = Cow::Owned(types::read_long_string(buf)?.to_owned());
        let parameters = QueryParameters::deserialize(version, buf)?;

        Ok(Self {
            contents,
            parameters,
        })
    }
}

/// Parameters shared by QUERY and EXECUTE.
///
/// Protocol v1 only transmits the consistency; the remaining fields are silently
/// dropped there. The default timestamp appeared in v3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParameters<'a> {
    pub consistency: types::Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    pub timestamp: Option<i64>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub values: Cow<'a, SerializedValues>,
}

impl Default for QueryParameters<'_> {
    fn default() -> Self {
        Self {
            consistency: Default::default(),
            serial_consistency: None,
            timestamp: None,
            page_size: None,
            paging_state: None,
            values: Cow::Borrowed(SerializedValues::EMPTY),
        }
    }
}

impl QueryParameters<'_> {
    pub fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut impl BufMut,
    ) -> Result<(), CqlRequestSerializationError> {
        types::write_consistency(self.consistency, buf);

        if version == ProtocolVersion::V1 {
            return Ok(());
        }

        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }

        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }

        if self.paging_state.is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }

        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }

        let with_timestamp = self.timestamp.is_some() && version >= ProtocolVersion::V3;
        if with_timestamp {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        buf.put_u8(flags);

        if !self.values.is_empty() {
            self.values.write_to_request(buf);
        }

        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }

        if let Some(paging_state) = &self.paging_state {
            types::write_bytes(paging_state, buf)?;
        }

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }

        if let (true, Some(timestamp)) = (with_timestamp, self.timestamp) {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }

    /// v1 EXECUTE puts the values before the consistency and has no flags at all.
    pub(crate) fn serialize_v1_execute(
        &self,
        buf: &mut impl BufMut,
    ) -> Result<(), CqlRequestSerializationError> {
        self.values.write_to_request(buf);
        types::write_consistency(self.consistency, buf);
        Ok(())
    }
}

impl QueryParameters<'_> {
    pub fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let consistency = types::read_consistency(buf)?;
        if version == ProtocolVersion::V1 {
            return Ok(Self {
                consistency,
                ..Default::default()
            });
        }

        if !buf.has_remaining() {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        let flags = buf.get_u8();
        let unknown_flags = flags & (!ALL_FLAGS);
        if unknown_flags != 0 {
            return Err(RequestDeserializationError::UnknownFlags {
                flags: unknown_flags,
            });
        }

        let values = if flags & FLAG_VALUES != 0 {
            Cow::Owned(SerializedValues::read_from_request(buf)?)
        } else {
            Cow::Borrowed(SerializedValues::EMPTY)
        };

        let page_size = (flags & FLAG_PAGE_SIZE != 0)
            .then(|| types::read_int(buf))
            .transpose()?;
        let paging_state = (flags & FLAG_WITH_PAGING_STATE != 0)
            .then(|| types::read_bytes(buf).map(Bytes::copy_from_slice))
            .transpose()?;
        let serial_consistency = if flags & FLAG_WITH_SERIAL_CONSISTENCY != 0 {
            match types::read_consistency(buf)? {
                types::Consistency::LocalSerial => Some(SerialConsistency::LocalSerial),
                _ => Some(SerialConsistency::Serial),
            }
        } else {
            None
        };
        let timestamp = (flags & FLAG_WITH_DEFAULT_TIMESTAMP != 0)
            .then(|| types::read_long(buf))
            .transpose()?;

        Ok(Self {
            consistency,
            serial_consistency,
            timestamp,
            page_size,
            paging_state,
            values,
        })
    }

    pub(crate) fn deserialize_v1_execute(
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let values = SerializedValues::read_from_request(buf)?;
        let consistency = types::read_consistency(buf)?;
        Ok(Self {
            consistency,
            values: Cow::Owned(values),
            ..Default::default()
        })
    }
}
