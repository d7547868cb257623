use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::plan::{self, Rotation};
use super::{LoadBalancingPolicy, NodeDistance, Plan, RoutingInfo};
use crate::cluster::{Host, HostEvent, HostListener};

#[derive(Debug, Default)]
struct DcHosts {
    local: Arc<Vec<Arc<Host>>>,
    remote: Arc<Vec<Arc<Host>>>,
}

/// Prefers the hosts of one datacenter, falling back to a bounded number of remote ones.
///
/// Hosts that report no datacenter are treated as local. Up to `max_remote_hosts` hosts of
/// other datacenters are kept as remote candidates and tried after all local ones, except
/// for requests at a datacenter-local consistency (LOCAL_ONE, LOCAL_QUORUM) unless
/// [`use_remote_for_local_consistency`](Self::use_remote_for_local_consistency) is set.
///
/// ```
/// # use quorum::policies::load_balancing::DcAwareRoundRobinPolicy;
/// let policy = DcAwareRoundRobinPolicy::new("eu-west")
///     .max_remote_hosts(2)
///     .use_remote_for_local_consistency(false);
/// ```
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    local_dc: String,
    max_remote_hosts: usize,
    use_remote_for_local_consistency: bool,
    hosts: ArcSwap<DcHosts>,
    position: AtomicUsize,
}

impl DcAwareRoundRobinPolicy {
    /// Creates a policy that only uses hosts of `local_dc`.
    pub fn new(local_dc: impl Into<String>) -> Self {
        Self {
            local_dc: local_dc.into(),
            max_remote_hosts: 0,
            use_remote_for_local_consistency: false,
            hosts: ArcSwap::default(),
            position: AtomicUsize::new(0),
        }
    }

    /// Number of hosts outside of the local datacenter that may be used. Defaults to 0.
    pub fn max_remote_hosts(mut self, max_remote_hosts: usize) -> Self {
        self.max_remote_hosts = max_remote_hosts;
        self
    }

    /// Whether remote hosts may serve requests at LOCAL_ONE or LOCAL_QUORUM.
    pub fn use_remote_for_local_consistency(mut self, allow: bool) -> Self {
        self.use_remote_for_local_consistency = allow;
        self
    }

    fn is_local(&self, host: &Host) -> bool {
        host.datacenter()
            .is_none_or(|datacenter| datacenter == self.local_dc)
    }
}

impl HostListener for DcAwareRoundRobinPolicy {
    fn on_event(&self, host: &Arc<Host>, event: HostEvent) {
        match event {
            HostEvent::Found | HostEvent::Up if host.is_up() => {
                let is_local = self.is_local(host);
                self.hosts.rcu(|hosts| {
                    if is_local {
                        DcHosts {
                            local: Arc::new(plan::upsert(&hosts.local, host)),
                            remote: hosts.remote.clone(),
                        }
                    } else if plan::contains(&hosts.remote, host)
                        || hosts.remote.len() < self.max_remote_hosts
                    {
                        DcHosts {
                            local: hosts.local.clone(),
                            remote: Arc::new(plan::upsert(&hosts.remote, host)),
                        }
                    } else {
                        DcHosts {
                            local: hosts.local.clone(),
                            remote: hosts.remote.clone(),
                        }
                    }
                });
            }
            HostEvent::Found | HostEvent::Up => {}
            HostEvent::Down | HostEvent::Lost => {
                self.hosts.rcu(|hosts| DcHosts {
                    local: Arc::new(plan::without(&hosts.local, host)),
                    remote: Arc::new(plan::without(&hosts.remote, host)),
                });
            }
        }
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn distance(&self, host: &Host) -> NodeDistance {
        if self.is_local(host) {
            return if host.is_up() {
                NodeDistance::Local
            } else {
                NodeDistance::Ignored
            };
        }

        if plan::contains(&self.hosts.load().remote, host) {
            NodeDistance::Remote
        } else {
            NodeDistance::Ignored
        }
    }

    fn plan(&self, request: &RoutingInfo<'_>) -> Plan {
        let hosts = self.hosts.load_full();
        let start = self.position.fetch_add(1, Ordering::Relaxed);

        let local = Rotation::new(hosts.local.clone(), start);
        if request.consistency.is_dc_local() && !self.use_remote_for_local_consistency {
            return Box::new(local);
        }
        Box::new(local.chain(Rotation::new(hosts.remote.clone(), start)))
    }

    fn name(&self) -> String {
        "DcAwareRoundRobinPolicy".to_string()
    }
}
