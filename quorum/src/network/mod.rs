//! Connections to nodes and the pools keeping them.

mod connection;
pub(crate) use connection::{
    open_connection, Connection, ConnectionConfig, ErrorReceiver, VerifiedKeyspaceName,
};

mod connection_pool;
pub use connection_pool::PoolSize;
pub(crate) use connection_pool::{NodeConnectionPool, PoolBroken};
