use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::plan::{self, Rotation};
use super::{LoadBalancingPolicy, NodeDistance, Plan, RoutingInfo};
use crate::cluster::{Host, HostEvent, HostListener};

/// Spreads requests evenly over every host that is up, regardless of datacenter.
///
/// Each plan starts one host further than the previous one.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    hosts: ArcSwap<Vec<Arc<Host>>>,
    position: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostListener for RoundRobinPolicy {
    fn on_event(&self, host: &Arc<Host>, event: HostEvent) {
        match event {
            HostEvent::Found | HostEvent::Up if host.is_up() => {
                self.hosts.rcu(|hosts| plan::upsert(hosts, host));
            }
            HostEvent::Found | HostEvent::Up => {}
            HostEvent::Down | HostEvent::Lost => {
                self.hosts.rcu(|hosts| plan::without(hosts, host));
            }
        }
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn distance(&self, host: &Host) -> NodeDistance {
        if host.is_up() {
            NodeDistance::Local
        } else {
            NodeDistance::Ignored
        }
    }

    fn plan(&self, _request: &RoutingInfo<'_>) -> Plan {
        let hosts = self.hosts.load_full();
        let start = self.position.fetch_add(1, Ordering::Relaxed);
        Box::new(Rotation::new(hosts, start))
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::RoundRobinPolicy;
    use crate::cluster::{HostInfo, HostRegistry};
    use crate::policies::load_balancing::{
        LoadBalancingPolicy, NodeDistance, PolicyListener, RoutingInfo,
    };
    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 9042))
    }

    fn plan_addresses(policy: &RoundRobinPolicy) -> Vec<SocketAddr> {
        policy
            .plan(&RoutingInfo::default())
            .map(|h| h.address())
            .collect()
    }

    #[test]
    fn plans_rotate_over_up_hosts() {
        let registry = HostRegistry::new();
        let policy = Arc::new(RoundRobinPolicy::new());
        registry.add_listener(Arc::new(PolicyListener(policy.clone())));

        for i in 1..=3 {
            registry.host_found(addr(i), HostInfo::default());
        }

        let first = plan_addresses(&policy);
        let second = plan_addresses(&policy);
        assert_eq!(first.len(), 3);
        assert_eq!(
            first.iter().collect::<HashSet<_>>(),
            second.iter().collect::<HashSet<_>>()
        );
        assert_eq!(second[0], first[1]);

        registry.host_down(addr(2));
        let plan = plan_addresses(&policy);
        assert_eq!(plan.len(), 2);
        assert!(!plan.contains(&addr(2)));
        assert_eq!(
            policy.distance(&registry.host(addr(2)).unwrap()),
            NodeDistance::Ignored
        );
        assert_eq!(
            policy.distance(&registry.host(addr(1)).unwrap()),
            NodeDistance::Local
        );

        registry.host_lost(addr(1));
        registry.host_lost(addr(3));
        assert!(plan_addresses(&policy).is_empty());
    }
}
