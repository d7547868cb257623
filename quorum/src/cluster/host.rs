use std::fmt;
use std::net::SocketAddr;

use uuid::Uuid;

/// What a node says about itself in the system tables.
///
/// Two discoveries of the same address with different identities mean that a different
/// node now lives there.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    pub host_id: Option<Uuid>,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    pub release_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Up,
    Down,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostStatus::Up => f.write_str("up"),
            HostStatus::Down => f.write_str("down"),
        }
    }
}

/// Immutable snapshot of a known node. Status changes replace the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    address: SocketAddr,
    info: HostInfo,
    status: HostStatus,
}

impl Host {
    pub(crate) fn new(address: SocketAddr, info: HostInfo, status: HostStatus) -> Self {
        Self {
            address,
            info,
            status,
        }
    }

    pub(crate) fn with_status(&self, status: HostStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn info(&self) -> &HostInfo {
        &self.info
    }

    pub fn host_id(&self) -> Option<Uuid> {
        self.info.host_id
    }

    pub fn datacenter(&self) -> Option<&str> {
        self.info.datacenter.as_deref()
    }

    pub fn rack(&self) -> Option<&str> {
        self.info.rack.as_deref()
    }

    pub fn release_version(&self) -> Option<&str> {
        self.info.release_version.as_deref()
    }

    pub fn status(&self) -> HostStatus {
        self.status
    }

    pub fn is_up(&self) -> bool {
        self.status == HostStatus::Up
    }
}
