//! Async request execution engine for databases speaking the CQL binary protocol.
//!
//! # Overview
//! All activity revolves around the [`Dispatcher`]. It is created from a few known
//! nodes, discovers the rest of the cluster through a dedicated control connection
//! and keeps a small pool of connections to every host worth talking to:
//!
//! ```rust,no_run
//! use quorum::DispatcherBuilder;
//! use std::error::Error;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let dispatcher = DispatcherBuilder::new()
//!         .known_node("127.0.0.1:9042")
//!         .build()
//!         .await?;
//!
//!     dispatcher.use_keyspace("ks", false).await?;
//!     let result = dispatcher.query("SELECT a, b FROM t").await?;
//!     println!("Served by {:?}", result.execution_info().hosts_tried);
//!     Ok(())
//! }
//! ```
//!
//! ### Requests
//! Every request walks a plan produced by the [load balancing
//! policy](crate::policies::load_balancing). Each host of the plan is tried in turn
//! until one of them answers; server errors that may go away on a second attempt are
//! submitted to the [retry policy](crate::policies::retry), which can retry the
//! request on the same host, ignore the error or give up.
//!
//! Bound values are passed in their wire form ([`SerializedValues`](crate::frame::value::SerializedValues));
//! encoding Rust values into CQL types is outside of the scope of this crate.
//!
//! ### Topology
//! Hosts known to the driver live in the [`HostRegistry`](crate::cluster::HostRegistry).
//! The control connection keeps it in sync with the cluster, and the policies and the
//! dispatcher subscribe to its notifications.

pub use quorum_cql::frame;
pub use quorum_cql::{Consistency, ProtocolVersion, SerialConsistency};

pub mod authentication;
pub mod client;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod policies;
pub mod response;
pub mod statement;

pub(crate) mod utils;

pub use client::{Dispatcher, DispatcherBuilder, DispatcherConfig};
pub use response::{ExecutionInfo, QueryResult};
pub use statement::{Batch, ExecutionOptions, PreparedStatement, Statement};
