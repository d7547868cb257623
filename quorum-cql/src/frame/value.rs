//! Bound values, already encoded by the caller.

use bytes::BufMut;

use super::frame_errors::{CqlRequestSerializationError, LowLevelDeserializationError};
use super::types;

/// A list of bound values in their wire form.
///
/// Encoding a value of a particular CQL type is the caller's business; this type only
/// frames each value as `[bytes]` and counts them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedValues {
    serialized: Vec<u8>,
    element_count: u16,
}

impl SerializedValues {
    /// An empty list, for statements without bind markers.
    pub const EMPTY: &'static SerializedValues = &SerializedValues {
        serialized: Vec::new(),
        element_count: 0,
    };

    pub const fn new() -> Self {
        SerializedValues {
            serialized: Vec::new(),
            element_count: 0,
        }
    }

    /// Appends one encoded value; `None` is a CQL null.
    pub fn add_value(&mut self, value: Option<&[u8]>) -> Result<(), CqlRequestSerializationError> {
        if self.element_count == u16::MAX {
            return Err(CqlRequestSerializationError::TooManyItems(
                self.element_count as usize + 1,
            ));
        }
        types::write_bytes_opt(value, &mut self.serialized)?;
        self.element_count += 1;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn element_count(&self) -> u16 {
        self.element_count
    }

    pub fn buffer_size(&self) -> usize {
        self.serialized.len()
    }

    /// Writes `[short n][value_1]...[value_n]`.
    pub(crate) fn write_to_request(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.element_count);
        buf.put_slice(&self.serialized);
    }

    /// Iterates over the values, `None` standing for null.
    pub fn iter(&self) -> impl Iterator<Item = Option<&[u8]>> {
        let mut buf = &self.serialized[..];
        (0..self.element_count).map(move |_| {
            // Every value was framed by `add_value`, so reading it back cannot fail.
            types::read_bytes_opt(&mut buf).unwrap_or(None)
        })
    }

    pub(crate) fn read_from_request(buf: &mut &[u8]) -> Result<Self, LowLevelDeserializationError> {
        let count = types::read_short(buf)?;
        let mut values = SerializedValues::new();
        for _ in 0..count {
            let value = types::read_bytes_opt(buf)?;
            types::write_bytes_opt(value, &mut values.serialized)?;
            values.element_count += 1;
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::SerializedValues;

    #[test]
    fn values_keep_nulls() {
        let mut values = SerializedValues::new();
        values.add_value(Some(b"abc")).unwrap();
        values.add_value(None).unwrap();

        let collected: Vec<_> = values.iter().collect();
        assert_eq!(collected, vec![Some(&b"abc"[..]), None]);
        assert_eq!(values.buffer_size(), 4 + 3 + 4);
    }

    #[test]
    fn request_framing_prefixes_the_count() {
        let mut values = SerializedValues::new();
        values.add_value(Some(&[1])).unwrap();
        let mut buf = Vec::new();
        values.write_to_request(&mut buf);
        assert_eq!(buf, vec![0, 1, 0, 0, 0, 1, 1]);

        let read = SerializedValues::read_from_request(&mut &buf[..]).unwrap();
        assert_eq!(read, values);
    }
}
