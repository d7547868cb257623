//! Address resolution maps the addresses nodes advertise to addresses this client can
//! reach.
//!
//! The control connection learns about peers from `system.peers` and from server events.
//! Each of them advertises its `rpc_address`, which is usually right, but not always
//! reachable from where the driver runs: the cluster may sit behind NAT, or span regions
//! with private addresses inside each of them. Known nodes given to the builder are never
//! resolved.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;

#[async_trait]
pub trait AddressResolutionPolicy: Send + Sync {
    /// Returns the address to connect to for a node advertising `advertised`.
    async fn resolve(&self, advertised: SocketAddr) -> SocketAddr;
}

/// Connects to nodes at the address they advertise. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityAddressResolution;

#[async_trait]
impl AddressResolutionPolicy for IdentityAddressResolution {
    async fn resolve(&self, advertised: SocketAddr) -> SocketAddr {
        advertised
    }
}

/// Fixed rules; addresses without a rule are used as advertised.
#[async_trait]
impl AddressResolutionPolicy for HashMap<SocketAddr, SocketAddr> {
    async fn resolve(&self, advertised: SocketAddr) -> SocketAddr {
        self.get(&advertised).copied().unwrap_or(advertised)
    }
}
