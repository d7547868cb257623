//! Cluster topology: the hosts known to the driver and the control connection that
//! discovers them.

pub(crate) mod control_connection;
mod host;
mod registry;

pub use host::{Host, HostInfo, HostStatus};
pub use registry::{HostEvent, HostListener, HostRegistry, ListenerId};
