use crate::frame::frame_errors::CqlResponseParseError;
use crate::frame::types;
use crate::Consistency;
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

/// An ERROR response: the typed error and the server's message.
#[derive(Debug, Clone)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

impl Error {
    pub fn new(error: DbError, reason: impl Into<String>) -> Self {
        Self {
            error,
            reason: reason.into(),
        }
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlResponseParseError> {
        let code = types::read_int(buf)?;
        let reason = types::read_string(buf)?.to_owned();

        let error: DbError = match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1000 => DbError::Unavailable {
                consistency: types::read_consistency(buf)?,
                required: types::read_int(buf)?,
                alive: types::read_int(buf)?,
            },
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => DbError::WriteTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x1200 => DbError::ReadTimeout {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                data_present: read_bool(buf)?,
            },
            0x1300 => DbError::ReadFailure {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                numfailures: types::read_int(buf)?,
                data_present: read_bool(buf)?,
            },
            0x1400 => DbError::FunctionFailure {
                keyspace: types::read_string(buf)?.to_string(),
                function: types::read_string(buf)?.to_string(),
                arg_types: types::read_string_list(buf)?,
            },
            0x1500 => DbError::WriteFailure {
                consistency: types::read_consistency(buf)?,
                received: types::read_int(buf)?,
                required: types::read_int(buf)?,
                numfailures: types::read_int(buf)?,
                write_type: WriteType::from(types::read_string(buf)?),
            },
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => DbError::AlreadyExists {
                keyspace: types::read_string(buf)?.to_string(),
                table: types::read_string(buf)?.to_string(),
            },
            0x2500 => DbError::Unprepared {
                statement_id: Bytes::from(types::read_short_bytes(buf)?.to_owned()),
            },
            _ => DbError::Other(code),
        };

        Ok(Error { error, reason })
    }

    /// Writes the body of an ERROR response. Used by scripted servers in tests.
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
        types::write_int(self.error.code(), buf);
        types::write_string(&self.reason, buf)?;

        match &self.error {
            DbError::Unavailable {
                consistency,
                required,
                alive,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*required, buf);
                types::write_int(*alive, buf);
            }
            DbError::WriteTimeout {
                consistency,
                received,
                required,
                write_type,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                types::write_string(write_type.as_str(), buf)?;
            }
            DbError::ReadTimeout {
                consistency,
                received,
                required,
                data_present,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                buf.put_u8(*data_present as u8);
            }
            DbError::ReadFailure {
                consistency,
                received,
                required,
                numfailures,
                data_present,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                types::write_int(*numfailures, buf);
                buf.put_u8(*data_present as u8);
            }
            DbError::FunctionFailure {
                keyspace,
                function,
                arg_types,
            } => {
                types::write_string(keyspace, buf)?;
                types::write_string(function, buf)?;
                types::write_string_list(arg_types, buf)?;
            }
            DbError::WriteFailure {
                consistency,
                received,
                required,
                numfailures,
                write_type,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                types::write_int(*numfailures, buf);
                types::write_string(write_type.as_str(), buf)?;
            }
            DbError::AlreadyExists { keyspace, table } => {
                types::write_string(keyspace, buf)?;
                types::write_string(table, buf)?;
            }
            DbError::Unprepared { statement_id } => {
                types::write_short_bytes(statement_id, buf)?;
            }
            _ => {}
        }

        Ok(())
    }
}

fn read_bool(buf: &mut &[u8]) -> Result<bool, CqlResponseParseError> {
    if !buf.has_remaining() {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }
    Ok(buf.get_u8() != 0)
}

/// An error sent from the database in response to a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DbError {
    /// The submitted query has a syntax error
    #[error("The submitted query has a syntax error")]
    SyntaxError,

    /// The query is syntactically correct but invalid
    #[error("The query is syntactically correct but invalid")]
    Invalid,

    /// Attempted to create a keyspace or a table that was already existing
    #[error(
        "Attempted to create a keyspace or a table that was already existing \
        (keyspace: {keyspace}, table: {table})"
    )]
    AlreadyExists {
        /// Created keyspace name or name of the keyspace in which table was created
        keyspace: String,
        /// Name of the table created, in case of keyspace creation it's an empty string
        table: String,
    },

    /// User defined function failed during execution
    #[error(
        "User defined function failed during execution \
        (keyspace: {keyspace}, function: {function}, arg_types: {arg_types:?})"
    )]
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },

    /// Authentication failed - bad credentials
    #[error("Authentication failed - bad credentials")]
    AuthenticationError,

    /// The logged user doesn't have the right to perform the query
    #[error("The logged user doesn't have the right to perform the query")]
    Unauthorized,

    /// The query is invalid because of some configuration issue
    #[error("The query is invalid because of some configuration issue")]
    ConfigError,

    /// Not enough nodes are alive to satisfy required consistency level
    #[error(
        "Not enough nodes are alive to satisfy required consistency level \
        (consistency: {consistency}, required: {required}, alive: {alive})"
    )]
    Unavailable {
        consistency: Consistency,
        /// Number of nodes required to be alive to satisfy required consistency level
        required: i32,
        /// Found number of active nodes
        alive: i32,
    },

    /// The request cannot be processed because the coordinator node is overloaded
    #[error("The request cannot be processed because the coordinator node is overloaded")]
    Overloaded,

    /// The coordinator node is still bootstrapping
    #[error("The coordinator node is still bootstrapping")]
    IsBootstrapping,

    /// Error during truncate operation
    #[error("Error during truncate operation")]
    TruncateError,

    /// Not enough nodes responded to the read request in time to satisfy required consistency level
    #[error("Not enough nodes responded to the read request in time to satisfy required consistency level \
            (consistency: {consistency}, received: {received}, required: {required}, data_present: {data_present})")]
    ReadTimeout {
        consistency: Consistency,
        /// Number of nodes that responded to the read request
        received: i32,
        /// Number of nodes required to respond to satisfy required consistency level
        required: i32,
        /// Replica that was asked for data has responded
        data_present: bool,
    },

    /// Not enough nodes responded to the write request in time to satisfy required consistency level
    #[error("Not enough nodes responded to the write request in time to satisfy required consistency level \
            (consistency: {consistency}, received: {received}, required: {required}, write_type: {write_type})")]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    },

    /// A non-timeout error during a read request
    #[error(
        "A non-timeout error during a read request \
        (consistency: {consistency}, received: {received}, required: {required}, \
        numfailures: {numfailures}, data_present: {data_present})"
    )]
    ReadFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        /// Number of nodes that experience a failure while executing the request
        numfailures: i32,
        data_present: bool,
    },

    /// A non-timeout error during a write request
    #[error(
        "A non-timeout error during a write request \
        (consistency: {consistency}, received: {received}, required: {required}, \
        numfailures: {numfailures}, write_type: {write_type})"
    )]
    WriteFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        write_type: WriteType,
    },

    /// Tried to execute a prepared statement that is not prepared. Driver should prepare it again
    #[error(
        "Tried to execute a prepared statement that is not prepared. Driver should prepare it again"
    )]
    Unprepared {
        /// Statement id of the requested prepared query
        statement_id: Bytes,
    },

    /// Internal server error. This indicates a server-side bug
    #[error("Internal server error. This indicates a server-side bug")]
    ServerError,

    /// Invalid protocol message received from the driver
    #[error("Invalid protocol message received from the driver")]
    ProtocolError,

    /// Other error code not specified in the specification
    #[error("Other error not specified in the specification. Error code: {0}")]
    Other(i32),
}

impl DbError {
    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Unavailable { .. } => 0x1000,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::WriteTimeout { .. } => 0x1100,
            DbError::ReadTimeout { .. } => 0x1200,
            DbError::ReadFailure { .. } => 0x1300,
            DbError::FunctionFailure { .. } => 0x1400,
            DbError::WriteFailure { .. } => 0x1500,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::AlreadyExists { .. } => 0x2400,
            DbError::Unprepared { .. } => 0x2500,
            DbError::Other(code) => *code,
        }
    }
}

/// Type of write operation requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteType {
    /// Non-batched non-counter write
    Simple,
    /// Logged batch write. If this type is received, it means the batch log has been successfully written
    /// (otherwise BatchLog type would be present)
    Batch,
    /// Unlogged batch. No batch log write has been attempted.
    UnloggedBatch,
    /// Counter write (batched or not)
    Counter,
    /// Timeout occurred during the write to the batch log when a logged batch was requested
    BatchLog,
    /// Timeout occurred during Compare And Set write/update
    Cas,
    /// Write involves VIEW update and failure to acquire local view(MV) lock for key within timeout
    View,
    /// Timeout occurred when a cdc_total_space_in_mb is exceeded when doing a write to data tracked by cdc
    Cdc,
    /// Other type not specified in the specification
    Other(String),
}

impl WriteType {
    pub fn as_str(&self) -> &str {
        match self {
            WriteType::Simple => "SIMPLE",
            WriteType::Batch => "BATCH",
            WriteType::UnloggedBatch => "UNLOGGED_BATCH",
            WriteType::Counter => "COUNTER",
            WriteType::BatchLog => "BATCH_LOG",
            WriteType::Cas => "CAS",
            WriteType::View => "VIEW",
            WriteType::Cdc => "CDC",
            WriteType::Other(write_type) => write_type.as_str(),
        }
    }
}

impl From<&str> for WriteType {
    fn from(write_type_str: &str) -> WriteType {
        match write_type_str {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            "VIEW" => WriteType::View,
            "CDC" => WriteType::Cdc,
            _ => WriteType::Other(write_type_str.to_string()),
        }
    }
}

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
