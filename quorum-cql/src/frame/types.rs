//! CQL binary protocol in-wire types.

use super::frame_errors::LowLevelDeserializationError;
use super::TryFromPrimitiveError;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::convert::TryInto;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::str;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    #[default]
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    LocalOne = 0x000A,

    // Apparently, Consistency can be set to Serial or LocalSerial in SELECT statements
    // to make them use Paxos.
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

impl TryFrom<u16> for Consistency {
    type Error = TryFromPrimitiveError<u16>;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Consistency::Any),
            0x0001 => Ok(Consistency::One),
            0x0002 => Ok(Consistency::Two),
            0x0003 => Ok(Consistency::Three),
            0x0004 => Ok(Consistency::Quorum),
            0x0005 => Ok(Consistency::All),
            0x0006 => Ok(Consistency::LocalQuorum),
            0x0007 => Ok(Consistency::EachQuorum),
            0x000A => Ok(Consistency::LocalOne),
            0x0008 => Ok(Consistency::Serial),
            0x0009 => Ok(Consistency::LocalSerial),
            _ => Err(TryFromPrimitiveError {
                enum_name: "Consistency",
                primitive: value,
            }),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i16)]
pub enum SerialConsistency {
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

impl TryFrom<i16> for SerialConsistency {
    type Error = TryFromPrimitiveError<i16>;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            0x0008 => Ok(Self::Serial),
            0x0009 => Ok(Self::LocalSerial),
            _ => Err(TryFromPrimitiveError {
                enum_name: "SerialConsistency",
                primitive: value,
            }),
        }
    }
}

impl Consistency {
    pub fn is_serial(&self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }

    /// Levels whose replicas are confined to the coordinator's datacenter.
    pub fn is_dc_local(&self) -> bool {
        matches!(
            self,
            Consistency::LocalOne | Consistency::LocalQuorum | Consistency::LocalSerial
        )
    }
}

#[derive(Debug, Error)]
#[error("Expected Consistency Serial or LocalSerial, got: {0}")]
pub struct NonSerialConsistencyError(Consistency);

impl TryFrom<Consistency> for SerialConsistency {
    type Error = NonSerialConsistencyError;

    fn try_from(c: Consistency) -> Result<Self, Self::Error> {
        match c {
            Consistency::Any
            | Consistency::One
            | Consistency::Two
            | Consistency::Three
            | Consistency::Quorum
            | Consistency::All
            | Consistency::LocalQuorum
            | Consistency::EachQuorum
            | Consistency::LocalOne => Err(NonSerialConsistencyError(c)),
            Consistency::Serial => Ok(SerialConsistency::Serial),
            Consistency::LocalSerial => Ok(SerialConsistency::LocalSerial),
        }
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::fmt::Display for SerialConsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub(crate) fn read_raw_bytes<'a>(
    count: usize,
    buf: &mut &'a [u8],
) -> Result<&'a [u8], LowLevelDeserializationError> {
    if buf.len() < count {
        return Err(LowLevelDeserializationError::TooFewBytesReceived {
            expected: count,
            received: buf.len(),
        });
    }
    let (ret, rest) = buf.split_at(count);
    *buf = rest;
    Ok(ret)
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, std::io::Error> {
    let v = buf.read_i32::<BigEndian>()?;
    Ok(v)
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub fn read_int_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    let v = read_int(buf)?;
    let v: usize = v.try_into()?;

    Ok(v)
}

pub(crate) fn write_int_length(
    v: usize,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    let v: i32 = v.try_into()?;

    write_int(v, buf);
    Ok(())
}

pub fn read_long(buf: &mut &[u8]) -> Result<i64, std::io::Error> {
    let v = buf.read_i64::<BigEndian>()?;
    Ok(v)
}

pub fn write_long(v: i64, buf: &mut impl BufMut) {
    buf.put_i64(v);
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, std::io::Error> {
    let v = buf.read_u16::<BigEndian>()?;
    Ok(v)
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

pub(crate) fn read_short_length(buf: &mut &[u8]) -> Result<usize, std::io::Error> {
    let v = read_short(buf)?;
    let v: usize = v.into();
    Ok(v)
}

pub(crate) fn write_short_length(
    v: usize,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    let v: u16 = v.try_into()?;
    write_short(v, buf);
    Ok(())
}

// https://github.com/apache/cassandra/blob/trunk/doc/native_protocol_v4.spec#L208
pub fn read_bytes_opt<'a>(
    buf: &mut &'a [u8],
) -> Result<Option<&'a [u8]>, LowLevelDeserializationError> {
    let len = read_int(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    let v = Some(read_raw_bytes(len, buf)?);
    Ok(v)
}

// Same as read_bytes_opt, but we assume the value won't be `null`
pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    let v = read_raw_bytes(len, buf)?;
    Ok(v)
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let v = read_raw_bytes(len, buf)?;
    Ok(v)
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn write_bytes_opt(
    v: Option<impl AsRef<[u8]>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    match v {
        Some(bytes) => {
            write_int_length(bytes.as_ref().len(), buf)?;
            buf.put_slice(bytes.as_ref());
        }
        None => write_int(-1, buf),
    }

    Ok(())
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let raw = read_raw_bytes(len, buf)?;
    let v = str::from_utf8(raw)?;
    Ok(v)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    let raw = v.as_bytes();
    write_short_length(v.len(), buf)?;
    buf.put_slice(raw);
    Ok(())
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    let raw = read_raw_bytes(len, buf)?;
    let v = str::from_utf8(raw)?;
    Ok(v)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
    let raw = v.as_bytes();
    let len = raw.len();
    write_int_length(len, buf)?;
    buf.put_slice(raw);
    Ok(())
}

pub fn read_string_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string(buf)?.to_owned();
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    let len = v.len();
    write_short_length(len, buf)?;
    for (key, val) in v.iter() {
        write_string(key.as_ref(), buf)?;
        write_string(val.as_ref(), buf)?;
    }
    Ok(())
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = Vec::with_capacity(len);
    for _ in 0..len {
        v.push(read_string(buf)?.to_owned());
    }
    Ok(v)
}

pub fn write_string_list(
    v: &[String],
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    let len = v.len();
    write_short_length(len, buf)?;
    for v in v.iter() {
        write_string(v, buf)?;
    }
    Ok(())
}

pub fn read_string_multimap(
    buf: &mut &[u8],
) -> Result<HashMap<String, Vec<String>>, LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    let mut v = HashMap::with_capacity(len);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let val = read_string_list(buf)?;
        v.insert(key, val);
    }
    Ok(v)
}

pub fn write_string_multimap(
    v: &HashMap<String, Vec<String>>,
    buf: &mut impl BufMut,
) -> Result<(), std::num::TryFromIntError> {
    let len = v.len();
    write_short_length(len, buf)?;
    for (key, val) in v.iter() {
        write_string(key, buf)?;
        write_string_list(val, buf)?;
    }
    Ok(())
}

pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, LowLevelDeserializationError> {
    let raw = read_raw_bytes(16, buf)?;
    let raw_array: [u8; 16] = raw.try_into()?;

    Ok(Uuid::from_bytes(raw_array))
}

pub fn write_uuid(uuid: &Uuid, buf: &mut impl BufMut) {
    buf.put_slice(&uuid.as_bytes()[..]);
}

pub fn read_consistency(buf: &mut &[u8]) -> Result<Consistency, LowLevelDeserializationError> {
    let raw = read_short(buf)?;
    Consistency::try_from(raw).map_err(LowLevelDeserializationError::UnknownConsistency)
}

pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn write_serial_consistency(c: SerialConsistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn read_inet(buf: &mut &[u8]) -> Result<SocketAddr, LowLevelDeserializationError> {
    let len = buf.read_u8()?;
    let ip_addr = read_ip_addr(len as usize, buf)?;
    let port = read_int(buf)?;

    Ok(SocketAddr::new(ip_addr, port as u16))
}

/// Reads a bare IP address whose length is already known, e.g. the contents of an
/// `inet` cell.
pub fn read_ip_addr(len: usize, buf: &mut &[u8]) -> Result<IpAddr, LowLevelDeserializationError> {
    let ip_addr = match len {
        4 => {
            let raw: [u8; 4] = read_raw_bytes(4, buf)?.try_into()?;
            IpAddr::from(raw)
        }
        16 => {
            let raw: [u8; 16] = read_raw_bytes(16, buf)?.try_into()?;
            IpAddr::from(raw)
        }
        v => return Err(LowLevelDeserializationError::InvalidInetLength(v as u8)),
    };
    Ok(ip_addr)
}

pub fn write_inet(addr: SocketAddr, buf: &mut impl BufMut) {
    write_ip_addr(addr.ip(), buf);
    write_int(addr.port() as i32, buf)
}

fn write_ip_addr(addr: IpAddr, buf: &mut impl BufMut) {
    match addr {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }
}

/// Advances the buffer by `count` bytes, failing if fewer are left.
pub(crate) fn skip(count: usize, buf: &mut &[u8]) -> Result<(), LowLevelDeserializationError> {
    read_raw_bytes(count, buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn type_int() {
        let vals = [i32::MIN, -1, 0, 1, i32::MAX];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_int(*val, &mut buf);
            assert_eq!(read_int(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_short() {
        let vals: [u16; 3] = [0, 1, u16::MAX];
        for val in vals.iter() {
            let mut buf = Vec::new();
            write_short(*val, &mut buf);
            assert_eq!(read_short(&mut &buf[..]).unwrap(), *val);
        }
    }

    #[test]
    fn type_string_map() {
        let mut val = HashMap::new();
        val.insert(String::from("CQL_VERSION"), String::from("3.0.0"));
        let mut buf = Vec::new();
        write_string_map(&val, &mut buf).unwrap();
        assert_eq!(read_string_map(&mut &*buf).unwrap(), val);
    }

    #[test]
    fn type_string_multimap() {
        let mut val = HashMap::new();
        val.insert(
            String::from("COMPRESSION"),
            vec![String::from("snappy"), String::from("lz4")],
        );
        let mut buf = Vec::new();
        write_string_multimap(&val, &mut buf).unwrap();
        assert_eq!(read_string_multimap(&mut &*buf).unwrap(), val);
    }

    #[test]
    fn type_uuid() {
        let u = Uuid::parse_str("f3b4958c-52a1-11e7-802a-010203040506").unwrap();
        let mut buf = Vec::new();
        write_uuid(&u, &mut buf);
        let u2 = read_uuid(&mut &*buf).unwrap();
        assert_eq!(u, u2);
    }

    #[test]
    fn type_consistency() {
        let c = Consistency::Quorum;
        let mut buf = Vec::new();
        write_consistency(c, &mut buf);
        let c2 = read_consistency(&mut &*buf).unwrap();
        assert_eq!(c, c2);

        let c: i16 = 0x1234;
        buf.clear();
        buf.put_i16(c);
        let c_result = read_consistency(&mut &*buf);
        assert!(c_result.is_err());

        // Check that the error message contains information about the invalid value
        let err_str = format!("{}", c_result.unwrap_err());
        assert!(err_str.contains(&format!("{}", c)));
    }

    #[test]
    fn type_inet() {
        let iv4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1234);
        let iv6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1)), 2345);
        let mut buf = Vec::new();

        write_inet(iv4, &mut buf);
        let read_iv4 = read_inet(&mut &*buf).unwrap();
        assert_eq!(iv4, read_iv4);
        buf.clear();

        write_inet(iv6, &mut buf);
        let read_iv6 = read_inet(&mut &*buf).unwrap();
        assert_eq!(iv6, read_iv6);
    }

    #[test]
    fn truncated_input_is_reported() {
        let buf = [0u8, 5, b'a', b'b'];
        assert!(matches!(
            read_string(&mut &buf[..]),
            Err(LowLevelDeserializationError::TooFewBytesReceived {
                expected: 5,
                received: 2
            })
        ));
    }

    #[test]
    fn local_consistencies() {
        assert!(Consistency::LocalOne.is_dc_local());
        assert!(Consistency::LocalQuorum.is_dc_local());
        assert!(!Consistency::Quorum.is_dc_local());
        assert!(Consistency::LocalSerial.is_serial());
    }
}
