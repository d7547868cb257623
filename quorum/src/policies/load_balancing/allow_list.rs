use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use super::{LoadBalancingPolicy, NodeDistance, Plan, RoutingInfo};
use crate::cluster::{Host, HostEvent, HostListener};

/// Restricts a wrapped policy to a fixed set of addresses.
///
/// Events about other hosts never reach the wrapped policy, so they cannot appear in
/// its plans, and their distance is always [`NodeDistance::Ignored`].
pub struct AllowListPolicy {
    addresses: HashSet<SocketAddr>,
    wrapped: Arc<dyn LoadBalancingPolicy>,
}

impl AllowListPolicy {
    pub fn new(
        addresses: impl IntoIterator<Item = SocketAddr>,
        wrapped: Arc<dyn LoadBalancingPolicy>,
    ) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
            wrapped,
        }
    }

    fn allows(&self, host: &Host) -> bool {
        self.addresses.contains(&host.address())
    }
}

impl fmt::Debug for AllowListPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllowListPolicy")
            .field("addresses", &self.addresses)
            .field("wrapped", &self.wrapped.name())
            .finish()
    }
}

impl HostListener for AllowListPolicy {
    fn on_event(&self, host: &Arc<Host>, event: HostEvent) {
        if self.allows(host) {
            self.wrapped.on_event(host, event);
        }
    }
}

impl LoadBalancingPolicy for AllowListPolicy {
    fn distance(&self, host: &Host) -> NodeDistance {
        if self.allows(host) {
            self.wrapped.distance(host)
        } else {
            NodeDistance::Ignored
        }
    }

    fn plan(&self, request: &RoutingInfo<'_>) -> Plan {
        self.wrapped.plan(request)
    }

    fn name(&self) -> String {
        format!("AllowListPolicy({})", self.wrapped.name())
    }
}
