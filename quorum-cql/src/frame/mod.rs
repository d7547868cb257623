pub mod frame_errors;
pub mod request;
pub mod response;
pub mod server_event_type;
pub mod types;
pub mod value;

use crate::frame::frame_errors::{FrameBodyExtensionsParseError, FrameHeaderParseError};
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use std::convert::TryFrom;
use std::fmt::Display;

use request::SerializableRequest;
use response::ResponseOpcode;

// The largest header, used by protocol v3 and later.
const MAX_HEADER_SIZE: usize = 9;

// Frame flags
const FLAG_COMPRESSION: u8 = 0x01;
const FLAG_TRACING: u8 = 0x02;
const FLAG_WARNING: u8 = 0x08;

// Responses carry this bit in their version byte.
const RESPONSE_BIT: u8 = 0x80;

/// Version of the CQL binary protocol spoken on a connection.
///
/// Versions 1 and 2 address streams with a single signed byte, so at most 128 requests
/// may be in flight on one connection. Version 3 widened the stream id to two bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
    V4 = 4,
}

impl ProtocolVersion {
    /// The highest version this crate can speak.
    pub const MAX: ProtocolVersion = ProtocolVersion::V4;

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Size of the frame header in bytes.
    pub fn header_size(self) -> usize {
        match self {
            ProtocolVersion::V1 | ProtocolVersion::V2 => 8,
            ProtocolVersion::V3 | ProtocolVersion::V4 => 9,
        }
    }

    /// Number of distinct non-negative stream ids available on a connection.
    pub fn stream_id_capacity(self) -> usize {
        match self {
            ProtocolVersion::V1 | ProtocolVersion::V2 => i8::MAX as usize + 1,
            ProtocolVersion::V3 | ProtocolVersion::V4 => i16::MAX as usize + 1,
        }
    }

    /// The next version to try when a server refuses this one, `None` below version 1.
    pub fn lower(self) -> Option<ProtocolVersion> {
        match self {
            ProtocolVersion::V1 => None,
            ProtocolVersion::V2 => Some(ProtocolVersion::V1),
            ProtocolVersion::V3 => Some(ProtocolVersion::V2),
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
        }
    }

    /// BATCH appeared in version 2.
    pub fn supports_batch(self) -> bool {
        self >= ProtocolVersion::V2
    }

    /// SASL authentication (AUTH_RESPONSE) replaced CREDENTIALS in version 2.
    pub fn supports_sasl(self) -> bool {
        self >= ProtocolVersion::V2
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::MAX
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            3 => Ok(ProtocolVersion::V3),
            4 => Ok(ProtocolVersion::V4),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ProtocolVersion",
                primitive: value,
            }),
        }
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Compression {
    /// Name of the algorithm as used in the STARTUP options.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request frame ready to be written to a socket.
///
/// The stream id is left as a placeholder until the connection assigns a free one
/// with [`SerializedRequest::set_stream`].
#[derive(Debug, Clone)]
pub struct SerializedRequest {
    version: ProtocolVersion,
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, frame_errors::CqlRequestSerializationError> {
        let header_size = version.header_size();
        let mut flags = 0;
        let mut data = vec![0; header_size];

        if let Some(compression) = compression {
            flags |= FLAG_COMPRESSION;
            let body = req.to_bytes(version)?;
            compress_append(&body, compression, &mut data)?;
        } else {
            req.serialize(version, &mut data)?;
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        data[0] = version.as_u8();
        data[1] = flags;
        // Leave space for the stream number
        data[header_size - 5] = R::OPCODE as u8;

        let req_size = (data.len() - header_size) as u32;
        data[header_size - 4..header_size].copy_from_slice(&req_size.to_be_bytes());

        Ok(Self { version, data })
    }

    /// Overwrites the stream id of the frame.
    pub fn set_stream(&mut self, stream: i16) {
        match self.version {
            ProtocolVersion::V1 | ProtocolVersion::V2 => self.data[2] = stream as i8 as u8,
            ProtocolVersion::V3 | ProtocolVersion::V4 => {
                self.data[2..4].copy_from_slice(&stream.to_be_bytes())
            }
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: ProtocolVersion,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::MAX,
            flags: 0x00,
            stream: 0,
        }
    }
}

/// Reads one response frame.
///
/// The header size depends on the protocol version, so the version byte is read first.
/// Servers answer a request sent in an unsupported version with an error frame in their
/// own version, therefore any supported version is accepted here.
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameHeaderParseError> {
    let mut raw_header = [0u8; MAX_HEADER_SIZE];
    reader
        .read_exact(&mut raw_header[..1])
        .await
        .map_err(FrameHeaderParseError::HeaderIoError)?;

    let raw_version = raw_header[0];
    if raw_version & RESPONSE_BIT != RESPONSE_BIT {
        return Err(FrameHeaderParseError::FrameFromClient);
    }
    let version = ProtocolVersion::try_from(raw_version & !RESPONSE_BIT)
        .map_err(|_| FrameHeaderParseError::VersionNotSupported(raw_version & !RESPONSE_BIT))?;

    let header_size = version.header_size();
    reader
        .read_exact(&mut raw_header[1..header_size])
        .await
        .map_err(FrameHeaderParseError::HeaderIoError)?;

    let mut buf = &raw_header[1..header_size];
    let flags = buf.get_u8();
    let stream = match version {
        ProtocolVersion::V1 | ProtocolVersion::V2 => buf.get_i8() as i16,
        ProtocolVersion::V3 | ProtocolVersion::V4 => buf.get_i16(),
    };

    let frame_params = FrameParams {
        version,
        flags,
        stream,
    };

    let opcode = ResponseOpcode::try_from(buf.get_u8())?;

    let length = buf.get_u32() as usize;

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader
            .read_buf(&mut raw_body)
            .await
            .map_err(FrameHeaderParseError::BodyChunkIoError)?;
        if n == 0 {
            // EOF, too early
            return Err(FrameHeaderParseError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
}

pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameBodyExtensionsParseError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameBodyExtensionsParseError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id =
            types::read_uuid(buf).map_err(FrameBodyExtensionsParseError::TraceIdParse)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf)
            .map_err(FrameBodyExtensionsParseError::WarningsListParse)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        warnings
    } else {
        Vec::new()
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
    })
}

fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), frame_errors::CqlRequestSerializationError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = uncomp_body.len() as u32;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|_| frame_errors::CqlRequestSerializationError::SnapCompressError)?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

fn decompress(
    mut comp_body: &[u8],
    compression: Compression,
) -> Result<Vec<u8>, FrameBodyExtensionsParseError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(FrameBodyExtensionsParseError::FrameDecompression);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            lz4_flex::decompress(comp_body, uncomp_len)
                .map_err(|e| FrameBodyExtensionsParseError::Lz4DecompressError(e.to_string()))
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|_| FrameBodyExtensionsParseError::FrameDecompression),
    }
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discrimant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::request::{Options, Query};

    #[test]
    fn test_lz4_compress() {
        let mut out = Vec::from(&b"Hello"[..]);
        let uncomp_body = b", World!";
        let compression = Compression::Lz4;
        let expect = vec![
            72, 101, 108, 108, 111, 0, 0, 0, 8, 128, 44, 32, 87, 111, 114, 108, 100, 33,
        ];

        compress_append(uncomp_body, compression, &mut out).unwrap();
        assert_eq!(expect, out);
    }

    #[test]
    fn test_lz4_decompress() {
        let mut comp_body = Vec::new();
        let uncomp_body = "Hello, World!".repeat(100);
        let compression = Compression::Lz4;
        compress_append(uncomp_body.as_bytes(), compression, &mut comp_body).unwrap();
        let result = decompress(&comp_body[..], compression).unwrap();
        assert_eq!(32, comp_body.len());
        assert_eq!(uncomp_body.as_bytes(), result);
    }

    #[test]
    fn test_snappy_roundtrip_through_body_extensions() {
        let mut comp_body = Vec::new();
        let uncomp_body = "SELECT * FROM system.peers".repeat(10);
        compress_append(uncomp_body.as_bytes(), Compression::Snappy, &mut comp_body).unwrap();

        let parsed = parse_response_body_extensions(
            FLAG_COMPRESSION,
            Some(Compression::Snappy),
            comp_body.into(),
        )
        .unwrap();
        assert_eq!(parsed.body, uncomp_body.as_bytes());
        assert!(parsed.trace_id.is_none());
    }

    #[test]
    fn compressed_body_without_negotiated_compression_is_rejected() {
        let res = parse_response_body_extensions(FLAG_COMPRESSION, None, Bytes::new());
        assert!(matches!(
            res,
            Err(FrameBodyExtensionsParseError::NoCompressionNegotiated)
        ));
    }

    #[test]
    fn header_layout_depends_on_version() {
        let mut v4 = SerializedRequest::make(&Options, ProtocolVersion::V4, None, false).unwrap();
        v4.set_stream(0x0102);
        assert_eq!(v4.get_data(), &[4, 0, 1, 2, 0x05, 0, 0, 0, 0]);

        let mut v2 = SerializedRequest::make(&Options, ProtocolVersion::V2, None, true).unwrap();
        v2.set_stream(127);
        assert_eq!(v2.get_data(), &[2, FLAG_TRACING, 127, 0x05, 0, 0, 0, 0]);
    }

    #[test]
    fn body_length_is_written_big_endian() {
        let query = Query::new("SELECT 1", Default::default());
        let req = SerializedRequest::make(&query, ProtocolVersion::V3, None, false).unwrap();
        let data = req.get_data();
        let len = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
        assert_eq!(len, data.len() - 9);
    }

    #[tokio::test]
    async fn read_response_frame_handles_both_header_sizes() {
        // v2 EVENT frame on stream -1 with an empty body
        let v2 = [0x82u8, 0, 0xFF, 0x0C, 0, 0, 0, 0];
        let (params, opcode, body) = read_response_frame(&mut &v2[..]).await.unwrap();
        assert_eq!(params.version, ProtocolVersion::V2);
        assert_eq!(params.stream, -1);
        assert_eq!(opcode, ResponseOpcode::Event);
        assert!(body.is_empty());

        // v4 READY frame on stream 300 with a two byte body
        let v4 = [0x84u8, 0, 0x01, 0x2C, 0x02, 0, 0, 0, 2, 0xAB, 0xCD];
        let (params, opcode, body) = read_response_frame(&mut &v4[..]).await.unwrap();
        assert_eq!(params.version, ProtocolVersion::V4);
        assert_eq!(params.stream, 300);
        assert_eq!(opcode, ResponseOpcode::Ready);
        assert_eq!(&body[..], &[0xAB, 0xCD]);
    }

    #[tokio::test]
    async fn read_response_frame_rejects_request_frames_and_short_bodies() {
        let request = [0x04u8, 0, 0, 0, 0x02, 0, 0, 0, 0];
        assert!(matches!(
            read_response_frame(&mut &request[..]).await,
            Err(FrameHeaderParseError::FrameFromClient)
        ));

        let truncated = [0x84u8, 0, 0, 1, 0x02, 0, 0, 0, 4, 1];
        assert!(matches!(
            read_response_frame(&mut &truncated[..]).await,
            Err(FrameHeaderParseError::ConnectionClosed(3, 4))
        ));
    }

    #[test]
    fn versions_step_down_to_one() {
        let mut version = Some(ProtocolVersion::MAX);
        let mut seen = Vec::new();
        while let Some(v) = version {
            seen.push(v.as_u8());
            version = v.lower();
        }
        assert_eq!(seen, vec![4, 3, 2, 1]);
        assert_eq!(ProtocolVersion::V2.stream_id_capacity(), 128);
        assert!(ProtocolVersion::try_from(5).is_err());
    }
}
