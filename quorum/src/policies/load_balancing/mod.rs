//! Load balancing configurations\
//! `Dispatcher` can use any load balancing policy which implements the `LoadBalancingPolicy` trait.
//!
//! A policy observes the [`HostRegistry`](crate::cluster::HostRegistry) as a
//! [`HostListener`] and keeps its own view of the hosts worth contacting. For every request
//! it produces a [`Plan`]: a lazy sequence of hosts, tried one after another until one of
//! them answers. The [`NodeDistance`] it assigns to a host decides how many connections the
//! dispatcher keeps to it.

use std::sync::Arc;

use crate::cluster::{Host, HostEvent, HostListener};
use crate::{Consistency, SerialConsistency};

mod allow_list;
mod dc_aware;
mod plan;
mod round_robin;

pub use allow_list::AllowListPolicy;
pub use dc_aware::DcAwareRoundRobinPolicy;
pub use plan::Plan;
pub use round_robin::RoundRobinPolicy;

/// How far a host is from the client, which decides the size of its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeDistance {
    Local,
    Remote,
    /// The host is never contacted and gets no pool.
    Ignored,
}

/// Represents info about a request that can be used by load balancing policies.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingInfo<'a> {
    /// Keyspace the request will run in, if any.
    pub keyspace: Option<&'a str>,
    /// Statement text; `None` for batches.
    pub statement: Option<&'a str>,
    /// Requested consistency information allows to route requests to the appropriate
    /// datacenters. E.g. requests with a LOCAL_ONE consistency should stay in the local one.
    pub consistency: Consistency,
    pub serial_consistency: Option<SerialConsistency>,
}

/// Policy that decides which hosts to contact for each request.
///
/// Implementations receive registry notifications through [`HostListener::on_event`].
/// Those come from arbitrary threads, concurrently with [`plan`](Self::plan) calls.
pub trait LoadBalancingPolicy: HostListener + std::fmt::Debug {
    /// Classifies `host`. Only called for hosts the registry reports as up.
    fn distance(&self, host: &Host) -> NodeDistance;

    /// Returns the hosts to try for `request`, in order. Ignored hosts never appear.
    fn plan(&self, request: &RoutingInfo<'_>) -> Plan;

    /// Returns the name of load balancing policy.
    fn name(&self) -> String;
}

// Registers a policy in the registry under its listener face.
pub(crate) struct PolicyListener(pub(crate) Arc<dyn LoadBalancingPolicy>);

impl HostListener for PolicyListener {
    fn on_event(&self, host: &Arc<Host>, event: HostEvent) {
        self.0.on_event(host, event)
    }
}
