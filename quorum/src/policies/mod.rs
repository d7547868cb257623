//! This module holds policies, which are entities that allow configuring
//! the driver's behaviour in various aspects. The common feature of all policies
//! is that users can implement a policy on their own (because they simply need
//! to implement a certain trait), allowing flexible customizability of the driver.
//!
//! This includes:
//! - [load balancing](load_balancing): which hosts to contact for a request, and in what order,
//! - [retry](retry): what to do after a server reported a timeout or missing replicas,
//! - [reconnection](reconnection): how long to wait between attempts to reach a host,
//! - [address resolution](address_resolution): where to reach the peers a node reports.

pub mod address_resolution;
pub mod load_balancing;
pub mod reconnection;
pub mod retry;
