//! CQL responses sent by the server.

pub mod authenticate;
pub mod error;
pub mod event;
pub mod result;
pub mod supported;

pub use error::{DbError, Error, WriteType};
pub use supported::Supported;

use super::frame_errors::CqlResponseParseError;
use super::{ProtocolVersion, TryFromPrimitiveError};

/// Opcode of a response, used to identify the response type in a CQL frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<u8>> {
        match value {
            0x00 => Ok(Self::Error),
            0x02 => Ok(Self::Ready),
            0x03 => Ok(Self::Authenticate),
            0x06 => Ok(Self::Supported),
            0x08 => Ok(Self::Result),
            0x0C => Ok(Self::Event),
            0x0E => Ok(Self::AuthChallenge),
            0x10 => Ok(Self::AuthSuccess),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ResponseOpcode",
                primitive: value,
            }),
        }
    }
}

impl std::fmt::Display for ResponseOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind_str = match self {
            ResponseOpcode::Error => "ERROR",
            ResponseOpcode::Ready => "READY",
            ResponseOpcode::Authenticate => "AUTHENTICATE",
            ResponseOpcode::Supported => "SUPPORTED",
            ResponseOpcode::Result => "RESULT",
            ResponseOpcode::Event => "EVENT",
            ResponseOpcode::AuthChallenge => "AUTH_CHALLENGE",
            ResponseOpcode::AuthSuccess => "AUTH_SUCCESS",
        };

        f.write_str(kind_str)
    }
}

#[derive(Debug)]
pub enum Response {
    Error(Error),
    Ready,
    Result(result::Result),
    Authenticate(authenticate::Authenticate),
    AuthSuccess(authenticate::AuthSuccess),
    AuthChallenge(authenticate::AuthChallenge),
    Supported(Supported),
    Event(event::Event),
}

impl Response {
    pub fn deserialize(
        version: ProtocolVersion,
        opcode: ResponseOpcode,
        buf: &mut &[u8],
    ) -> Result<Response, CqlResponseParseError> {
        let response = match opcode {
            ResponseOpcode::Error => Error::deserialize(buf).map(Response::Error),
            ResponseOpcode::Ready => Ok(Response::Ready),
            ResponseOpcode::Authenticate => {
                authenticate::Authenticate::deserialize(buf).map(Response::Authenticate)
            }
            ResponseOpcode::Supported => Supported::deserialize(buf).map(Response::Supported),
            ResponseOpcode::Result => result::deserialize(version, buf).map(Response::Result),
            ResponseOpcode::Event => event::Event::deserialize(version, buf).map(Response::Event),
            ResponseOpcode::AuthChallenge => {
                authenticate::AuthChallenge::deserialize(buf).map(Response::AuthChallenge)
            }
            ResponseOpcode::AuthSuccess => {
                authenticate::AuthSuccess::deserialize(buf).map(Response::AuthSuccess)
            }
        };

        response.map_err(|err| match err {
            CqlResponseParseError::LowLevel(error) => CqlResponseParseError::Body { opcode, error },
            err => err,
        })
    }

    pub fn opcode(&self) -> ResponseOpcode {
        match self {
            Response::Error(_) => ResponseOpcode::Error,
            Response::Ready => ResponseOpcode::Ready,
            Response::Result(_) => ResponseOpcode::Result,
            Response::Authenticate(_) => ResponseOpcode::Authenticate,
            Response::AuthSuccess(_) => ResponseOpcode::AuthSuccess,
            Response::AuthChallenge(_) => ResponseOpcode::AuthChallenge,
            Response::Supported(_) => ResponseOpcode::Supported,
            Response::Event(_) => ResponseOpcode::Event,
        }
    }
}
