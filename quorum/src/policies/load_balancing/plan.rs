use std::sync::Arc;

use crate::cluster::Host;

/// Lazy, single-use sequence of hosts to try for one request, best candidates first.
///
/// Running out of hosts is signalled by the iterator returning `None`.
pub type Plan = Box<dyn Iterator<Item = Arc<Host>> + Send + Sync>;

/// Walks a snapshot of hosts once, starting at `start` and wrapping around.
pub(crate) struct Rotation {
    hosts: Arc<Vec<Arc<Host>>>,
    start: usize,
    yielded: usize,
}

impl Rotation {
    pub(crate) fn new(hosts: Arc<Vec<Arc<Host>>>, start: usize) -> Self {
        Self {
            hosts,
            start,
            yielded: 0,
        }
    }
}

impl Iterator for Rotation {
    type Item = Arc<Host>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.hosts.len();
        if self.yielded >= len {
            return None;
        }
        let host = self.hosts[(self.start + self.yielded) % len].clone();
        self.yielded += 1;
        Some(host)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.hosts.len().saturating_sub(self.yielded);
        (remaining, Some(remaining))
    }
}

// Replaces the entry with the same address, or appends.
pub(crate) fn upsert(hosts: &[Arc<Host>], host: &Arc<Host>) -> Vec<Arc<Host>> {
    let mut hosts = hosts.to_vec();
    match hosts.iter_mut().find(|h| h.address() == host.address()) {
        Some(entry) => *entry = host.clone(),
        None => hosts.push(host.clone()),
    }
    hosts
}

pub(crate) fn without(hosts: &[Arc<Host>], host: &Host) -> Vec<Arc<Host>> {
    hosts
        .iter()
        .filter(|h| h.address() != host.address())
        .cloned()
        .collect()
}

pub(crate) fn contains(hosts: &[Arc<Host>], host: &Host) -> bool {
    hosts.iter().any(|h| h.address() == host.address())
}
