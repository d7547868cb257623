//! Errors returned by the driver.
//!
//! Errors are layered. [`ExecutionError`] is what a caller of the
//! [`Dispatcher`](crate::Dispatcher) sees; it is assembled from per-attempt
//! [`RequestAttemptError`]s, which in turn may wrap a [`BrokenConnectionError`]
//! describing why a connection stopped working.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;

use crate::authentication::AuthError;
use crate::frame::frame_errors::{
    CqlRequestSerializationError, CqlResponseParseError, FrameBodyExtensionsParseError,
    FrameHeaderParseError, LowLevelDeserializationError,
};
use crate::frame::request::RequestOpcode;
use crate::frame::response::ResponseOpcode;
use crate::frame::ProtocolVersion;

pub use crate::frame::response::error::{DbError, WriteType};

/// Error that occurred during request execution.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    /// Database sent a response containing some error with a message.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Every host of the plan failed without a server response.
    #[error(transparent)]
    NoHostsAvailable(#[from] NoHostsAvailable),

    /// The request did not complete within its timeout.
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Caller passed an invalid request.
    #[error(transparent)]
    BadQuery(#[from] BadQuery),

    /// Switching the connection to the target keyspace failed.
    #[error("Failed to switch keyspace: {0}")]
    UseKeyspaceError(#[from] UseKeyspaceError),

    /// Preparing the statement failed.
    #[error(transparent)]
    PrepareError(#[from] PrepareError),

    /// The dispatcher was closed.
    #[error("The dispatcher has been closed")]
    Closed,

    /// The server answered with something the driver cannot make sense of.
    #[error("Protocol error: {0}")]
    ProtocolError(RequestAttemptError),

    /// The load balancing policy produced a plan without any host.
    #[error("Load balancing policy returned an empty plan")]
    EmptyPlan,

    /// Waiting for the hosts to agree on the schema failed.
    #[error(transparent)]
    SchemaAgreementError(#[from] SchemaAgreementError),
}

/// Every host of a plan failed at the transport level.
#[derive(Error, Debug, Clone, Default)]
pub struct NoHostsAvailable {
    /// The last error observed for each host that was tried.
    pub errors: HashMap<SocketAddr, RequestAttemptError>,
}

impl fmt::Display for NoHostsAvailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tried = self
            .errors
            .iter()
            .sorted_by_key(|(address, _)| **address)
            .map(|(address, error)| format!("{address} ({error})"))
            .join(", ");
        write!(f, "All hosts tried for the request failed (tried: {tried})")
    }
}

/// An error of a single attempt to perform a request on a single connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    /// Database sent a response containing some error with a message.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// The connection broke before a response arrived.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// The host had no usable connection.
    #[error("No connection to the host: {0}")]
    ConnectionPool(#[from] ConnectionPoolError),

    /// Failed to serialize the request.
    #[error("Failed to serialize the request: {0}")]
    UnableToSerialize(#[from] CqlRequestSerializationError),

    /// Received a response that does not fit the request.
    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(ResponseOpcode),

    /// Failed to strip compression, tracing id or warnings off the response.
    #[error("Failed to read the response frame body: {0}")]
    BodyExtensionsParseError(#[from] FrameBodyExtensionsParseError),

    /// Failed to parse the response.
    #[error("Failed to parse the response: {0}")]
    ResponseParseError(#[from] CqlResponseParseError),

    /// The server answered in a different protocol version than the request used.
    #[error("Sent a {expected} request, but the response came in {received}")]
    UnexpectedProtocolVersion {
        expected: ProtocolVersion,
        received: ProtocolVersion,
    },

    /// A statement prepared again got a different id than before.
    #[error("Statement {statement:?} was prepared again with a different id")]
    RepreparedIdChanged { statement: String },
}

impl RequestAttemptError {
    /// Whether no server response was involved, so the request may be tried on
    /// another host.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RequestAttemptError::BrokenConnection(_) | RequestAttemptError::ConnectionPool(_)
        )
    }
}

/// A connection stopped working; every request pending on it fails with this error.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(Arc<BrokenConnectionErrorKind>);

impl BrokenConnectionError {
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.0
    }
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(value: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(value))
    }
}

/// The reason a connection broke.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    /// Failed to read a frame from the socket.
    #[error("Failed to read a frame: {0}")]
    FrameHeaderParseError(FrameHeaderParseError),

    /// Failed to write data to the socket.
    #[error("Failed to write data: {0}")]
    WriteError(std::io::Error),

    /// Too many requests were abandoned while the server kept their stream ids.
    #[error("Too many orphaned stream ids: {0}")]
    TooManyOrphanedStreamIds(u16),

    /// The server answered on a stream id no request was using.
    #[error("Received a server frame with unexpected stream id: {0}")]
    UnexpectedStreamId(i16),

    /// One half of an internal channel was dropped.
    #[error(
        "Failed to send/receive data needed to perform a request via tokio channel. \
        It implies that other half of the channel has been dropped. \
        The connection was already broken for some other reason."
    )]
    ChannelError,

    /// Failed to handle a server push event.
    #[error("Failed to handle server event: {0}")]
    EventHandlingError(#[from] CqlEventHandlingError),

    /// The connection was closed by the driver.
    #[error("Connection was closed locally")]
    ClosedLocally,

    /// The peer closed the socket.
    #[error("Connection was closed by the peer")]
    ClosedByPeer,

    /// A heartbeat OPTIONS request failed.
    #[error("Heartbeat request failed: {0}")]
    HeartbeatRequestError(Arc<RequestAttemptError>),

    /// Nothing was read from the socket for too long.
    #[error("No data received for {0:?}")]
    IdleTimeout(Duration),
}

/// Failed to handle a frame sent on the event stream.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlEventHandlingError {
    #[error("Failed to read the event frame body: {0}")]
    BodyExtensionParseError(#[from] FrameBodyExtensionsParseError),
    #[error("Failed to deserialize EVENT response: {0}")]
    EventParseError(#[from] CqlResponseParseError),
    #[error("Received unexpected response on the event stream: {0}. Expected EVENT.")]
    UnexpectedResponse(ResponseOpcode),
    #[error("Failed to pass the event to its receiver")]
    SendError,
}

/// Failed to open a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// The TCP connection was not established in time.
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    /// Input/Output error has occurred.
    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    /// A request sent while setting up the connection failed.
    #[error(transparent)]
    ConnectionSetupRequestError(#[from] ConnectionSetupRequestError),

    /// The connection broke while it was being set up.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(value))
    }
}

impl ConnectionError {
    /// Whether the server refused the protocol version of the handshake.
    ///
    /// Servers answer an unsupported version with a PROTOCOL_ERROR whose message names
    /// the protocol version, sometimes framed in their own, lower version. Other protocol
    /// errors are not taken as a refusal.
    pub fn is_unsupported_protocol_version(&self) -> bool {
        let ConnectionError::ConnectionSetupRequestError(err) = self else {
            return false;
        };
        if !matches!(
            err.request_kind,
            RequestOpcode::Options | RequestOpcode::Startup
        ) {
            return false;
        }
        match &err.error {
            ConnectionSetupRequestErrorKind::DbError(DbError::ProtocolError, message) => {
                message.to_ascii_lowercase().contains("protocol version")
            }
            ConnectionSetupRequestErrorKind::RequestError(
                RequestAttemptError::UnexpectedProtocolVersion { .. },
            ) => true,
            _ => false,
        }
    }
}

/// A request sent while setting up a connection failed.
#[derive(Error, Debug, Clone)]
#[error("Failed to perform a connection setup request. Request: {request_kind}, reason: {error}")]
pub struct ConnectionSetupRequestError {
    pub request_kind: RequestOpcode,
    pub error: ConnectionSetupRequestErrorKind,
}

impl ConnectionSetupRequestError {
    pub(crate) fn new(request_kind: RequestOpcode, error: ConnectionSetupRequestErrorKind) -> Self {
        ConnectionSetupRequestError {
            request_kind,
            error,
        }
    }
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionSetupRequestErrorKind {
    #[error(transparent)]
    RequestError(#[from] RequestAttemptError),
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),
    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(ResponseOpcode),
    #[error(
        "Authentication is required. You can use DispatcherBuilder::user(\"user\", \"pass\") \
        to provide credentials or DispatcherBuilder::authenticator_provider to provide \
        custom authenticator"
    )]
    MissingAuthentication,
    #[error("Failed to start client's auth session: {0}")]
    StartAuthSessionError(AuthError),
    #[error("Failed to evaluate auth challenge on client side: {0}")]
    AuthChallengeEvaluationError(AuthError),
    #[error("Failed to finish auth challenge on client side: {0}")]
    AuthFinishError(AuthError),
}

/// A host's connection pool cannot serve a request.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    /// Every connection of the pool is gone.
    #[error("The pool is broken; Last connection failed with: {last_connection_error}")]
    Broken {
        last_connection_error: Box<ConnectionError>,
    },

    /// No pool is open for the host: it is down, ignored or still connecting.
    #[error("No pool is open for the host")]
    NotOpen,
}

/// Error that occurred while creating a dispatcher.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewDispatcherError {
    /// List of known nodes passed to the builder is empty.
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    /// None of the known nodes could be resolved.
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// Could not open the control connection to any known node.
    #[error("Failed to open the control connection: {0}")]
    ControlConnection(ConnectionError),

    /// Every known node refused every protocol version down to 1.
    #[error("No known node supports any protocol version between 1 and {0}")]
    UnsupportedProtocolVersion(ProtocolVersion),

    /// No connection pool could be opened.
    #[error(transparent)]
    NoHostsAvailable(#[from] NoHostsAvailable),

    /// The keyspace passed to the builder is not a valid name.
    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// The topology could not be read from any known node.
    #[error("Failed to read the cluster topology: {0}")]
    MetadataError(#[from] MetadataError),
}

/// Caller passed an invalid request.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BadQuery {
    /// The request could not be serialized.
    #[error("Serializing the request failed: {0}")]
    SerializationError(#[from] CqlRequestSerializationError),

    /// Invalid keyspace name.
    #[error("Invalid keyspace name: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),
}

/// Invalid keyspace name given to `Dispatcher::use_keyspace()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BadKeyspaceName {
    /// Keyspace name is empty.
    #[error("Keyspace name is empty")]
    Empty,

    /// Keyspace name too long, must be up to 48 characters.
    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    /// Illegal character - only alphanumeric and underscores allowed.
    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}

/// Switching a connection to a keyspace failed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum UseKeyspaceError {
    /// Passed invalid keyspace name to use.
    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// The server switched to a keyspace other than the requested one.
    #[error(
        "Keyspace name mismatch; expected: {expected_keyspace_name_lowercase}, \
        received: {result_keyspace_name_lowercase}"
    )]
    KeyspaceNameMismatch {
        expected_keyspace_name_lowercase: String,
        result_keyspace_name_lowercase: String,
    },

    /// The USE request failed.
    #[error(transparent)]
    RequestError(#[from] RequestAttemptError),
}

/// Preparing a statement failed.
#[derive(Error, Debug, Clone)]
#[error("Failed to prepare statement {statement:?}: {error}")]
pub struct PrepareError {
    pub statement: String,
    pub error: RequestAttemptError,
}

/// Failed to read the cluster topology from the system tables.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum MetadataError {
    /// The control connection could not be opened.
    #[error("Control connection unavailable: {0}")]
    ConnectionError(#[from] ConnectionError),

    /// A query against a system table failed.
    #[error("Failed to query system tables: {0}")]
    RequestError(#[from] RequestAttemptError),

    /// A system table query returned something other than rows.
    #[error("Expected rows from system.{0}")]
    NotRows(&'static str),

    /// `system.local` returned no row.
    #[error("system.local returned no rows")]
    EmptyLocal,

    /// A row lacks a column the driver relies on.
    #[error("system.{table} has no column {column}")]
    MissingColumn {
        table: &'static str,
        column: &'static str,
    },

    /// A cell could not be read.
    #[error("Malformed value in system.{table}.{column}: {error}")]
    MalformedCell {
        table: &'static str,
        column: &'static str,
        error: LowLevelDeserializationError,
    },
}

/// Hosts could not be shown to agree on a schema version.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SchemaAgreementError {
    /// No host has an open pool to ask.
    #[error("No connection to any host to read schema versions from")]
    NoConnection,

    /// Reading the schema version of a host failed.
    #[error("Failed to read a schema version: {0}")]
    RequestError(#[from] RequestAttemptError),

    /// `system.local` answered without a usable `schema_version`.
    #[error("Failed to read a schema version: {0}")]
    MetadataError(#[from] MetadataError),

    /// The hosts did not agree in time.
    #[error("Schema agreement not reached within {0:?}")]
    Timeout(Duration),
}

/// A reconnection schedule ran out of delays before a connection could be opened.
#[derive(Error, Debug, Clone)]
#[error("Gave up reconnecting to {address} after {attempts} attempts, last error: {last_error:?}")]
pub struct ReconnectionGaveUp {
    pub address: SocketAddr,
    pub attempts: usize,
    /// `None` if the schedule allowed no attempt at all.
    pub last_error: Option<ConnectionError>,
}
