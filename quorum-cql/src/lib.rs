//! Defines CQL protocol-level types used by the `quorum` driver.
//!
//! The crate knows how to lay out a frame header for every protocol version from 1 to 4,
//! how to serialize the requests the driver issues and how to parse the responses it
//! consumes. Serialization of individual bound values is left to the caller: values
//! travel through this crate as already-encoded byte buffers.

pub mod frame;

pub use crate::frame::types::{Consistency, SerialConsistency};
pub use crate::frame::ProtocolVersion;
