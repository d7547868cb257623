//! Errors raised while building request frames and parsing response frames.

use std::sync::Arc;

use super::response::ResponseOpcode;
use super::TryFromPrimitiveError;
use thiserror::Error;

/// An error that occurred while serializing a request into a frame.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlRequestSerializationError {
    /// A length did not fit into the field the protocol reserves for it.
    #[error("Value too big to be sent in a request - max 2GiB allowed")]
    ValueTooBig(#[from] std::num::TryFromIntError),

    /// The request is not expressible in the negotiated protocol version.
    #[error("{request} is not supported by protocol version {version}")]
    UnsupportedInVersion {
        request: &'static str,
        version: u8,
    },

    /// Too many statements or values for a 16-bit count.
    #[error("Too many items in a request: {0}, max 65535 allowed")]
    TooManyItems(usize),

    /// A batch must carry exactly one value list per statement.
    #[error("Length of provided values must be equal to number of batch statements (got {values} values, {statements} statements)")]
    BatchValuesMismatch { statements: usize, values: usize },

    /// Snappy refused to compress the body.
    #[error("Failed to compress the frame with snappy")]
    SnapCompressError,
}

/// An error that occurred while reading a frame header and its body from the socket.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FrameHeaderParseError {
    #[error("Failed to read the frame header: {0}")]
    HeaderIoError(std::io::Error),
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received a frame from version {0}, but only 1-4 are supported")]
    VersionNotSupported(u8),
    #[error("Unrecognized response opcode {0}")]
    UnknownResponseOpcode(#[from] TryFromPrimitiveError<u8>),
    #[error("Failed to read a chunk of the frame body: {0}")]
    BodyChunkIoError(std::io::Error),
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
}

/// An error that occurred while stripping compression, tracing id and warnings off a
/// response body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameBodyExtensionsParseError {
    #[error("Frame is compressed, but no compression negotiated for connection.")]
    NoCompressionNegotiated,
    #[error("Malformed tracing id: {0}")]
    TraceIdParse(LowLevelDeserializationError),
    #[error("Malformed warnings list: {0}")]
    WarningsListParse(LowLevelDeserializationError),
    #[error("Frame decompression failed.")]
    FrameDecompression,
    #[error("Error decompressing lz4 data {0}")]
    Lz4DecompressError(String),
}

/// An error that occurred while parsing the body of a response.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlResponseParseError {
    #[error("Failed to parse the body of a {opcode:?} response: {error}")]
    Body {
        opcode: ResponseOpcode,
        error: LowLevelDeserializationError,
    },
    #[error("Unknown RESULT kind: {0}")]
    UnknownResultKind(i32),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Unknown {event} change: {change}")]
    UnknownEventChange { event: &'static str, change: String },
    #[error("Unsupported column type id {0:#06x}")]
    UnsupportedColumnType(u16),
    #[error(transparent)]
    LowLevel(#[from] LowLevelDeserializationError),
}

impl From<std::io::Error> for CqlResponseParseError {
    fn from(value: std::io::Error) -> Self {
        Self::LowLevel(value.into())
    }
}

/// A low level deserialization error.
///
/// This type of error is returned when deserialization
/// of some primitive value fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    TryFromSliceError(#[from] std::array::TryFromSliceError),
    #[error("Not enough bytes! expected: {expected}, received: {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}
