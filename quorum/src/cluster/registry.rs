use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tracing::{debug, info};

use super::host::{Host, HostInfo, HostStatus};
use crate::utils::lock;

/// Kind of host event signalled to a [`HostListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// The host joined the set of known hosts. Always followed by [`HostEvent::Up`].
    Found,
    /// The host is believed to be reachable.
    Up,
    /// The host is believed to be unreachable.
    Down,
    /// The host left the set of known hosts. Preceded by [`HostEvent::Down`] if it was up.
    Lost,
}

/// Allows listening to host events: FOUND, UP, DOWN and LOST.
///
/// Events for one address are delivered one at a time and in order. Listeners are called
/// synchronously from within the registry, so they must not call back into it; anything
/// that needs to do I/O should be handed off to a task.
pub trait HostListener: Send + Sync {
    fn on_event(&self, host: &Arc<Host>, event: HostEvent);
}

/// Handle returned by [`HostRegistry::add_listener`], used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The set of hosts known to the driver, with their up/down status.
///
/// The control connection feeds discoveries into it and pools report connectivity
/// changes; policies and the dispatcher observe it through [`HostListener`]s.
pub struct HostRegistry {
    hosts: StdMutex<HashMap<SocketAddr, Arc<Host>>>,
    // Serializes mutation and notification per address.
    address_locks: StdMutex<HashMap<SocketAddr, Arc<StdMutex<()>>>>,
    listeners: StdMutex<Vec<(ListenerId, Arc<dyn HostListener>)>>,
    next_listener_id: AtomicU64,
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRegistry {
    pub fn new() -> Self {
        Self {
            hosts: StdMutex::new(HashMap::new()),
            address_locks: StdMutex::new(HashMap::new()),
            listeners: StdMutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn HostListener>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, listener));
        id
    }

    /// Returns false if no listener was registered under `id`.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        lock(&self.hosts).values().cloned().collect()
    }

    pub fn up_hosts(&self) -> Vec<Arc<Host>> {
        lock(&self.hosts)
            .values()
            .filter(|host| host.is_up())
            .cloned()
            .collect()
    }

    pub fn host(&self, address: SocketAddr) -> Option<Arc<Host>> {
        lock(&self.hosts).get(&address).cloned()
    }

    pub fn has_host(&self, address: SocketAddr) -> bool {
        lock(&self.hosts).contains_key(&address)
    }

    /// Records that a node with `info` lives at `address`.
    ///
    /// A new address is announced as found, then up. A known address that was down comes
    /// back up. A known address reporting a different identity is treated as the old host
    /// leaving and a new one joining.
    pub fn host_found(&self, address: SocketAddr, info: HostInfo) {
        self.serialized(address, || {
            let known = lock(&self.hosts).get(&address).cloned();
            let mut events = Vec::new();

            match known {
                Some(known) if *known.info() == info => {
                    if known.is_up() {
                        return;
                    }
                    let host = self.replace(known.with_status(HostStatus::Up));
                    events.push((host, HostEvent::Up));
                }
                Some(known) => {
                    info!(
                        host = %address,
                        old_host_id = ?known.host_id(),
                        new_host_id = ?info.host_id,
                        "Host identity changed, replacing it"
                    );
                    let old = if known.is_up() {
                        let down = Arc::new(known.with_status(HostStatus::Down));
                        events.push((down.clone(), HostEvent::Down));
                        down
                    } else {
                        known
                    };
                    events.push((old, HostEvent::Lost));

                    let host = self.replace(Host::new(address, info, HostStatus::Up));
                    events.push((host.clone(), HostEvent::Found));
                    events.push((host, HostEvent::Up));
                }
                None => {
                    debug!(host = %address, "Host found");
                    let host = self.replace(Host::new(address, info, HostStatus::Up));
                    events.push((host.clone(), HostEvent::Found));
                    events.push((host, HostEvent::Up));
                }
            }

            self.notify(&events);
        })
    }

    /// Marks a known host as up. Does nothing if it is unknown or already up.
    pub fn host_up(&self, address: SocketAddr) {
        self.set_status(address, HostStatus::Up);
    }

    /// Marks a known host as down. Does nothing if it is unknown or already down.
    pub fn host_down(&self, address: SocketAddr) {
        self.set_status(address, HostStatus::Down);
    }

    /// Forgets a host, reporting it down first if it was up.
    pub fn host_lost(&self, address: SocketAddr) {
        self.serialized(address, || {
            let Some(known) = lock(&self.hosts).remove(&address) else {
                return;
            };
            debug!(host = %address, "Host lost");

            let mut events = Vec::new();
            let lost = if known.is_up() {
                let down = Arc::new(known.with_status(HostStatus::Down));
                events.push((down.clone(), HostEvent::Down));
                down
            } else {
                known
            };
            events.push((lost, HostEvent::Lost));

            self.notify(&events);
        })
    }

    fn set_status(&self, address: SocketAddr, status: HostStatus) {
        self.serialized(address, || {
            let Some(known) = lock(&self.hosts).get(&address).cloned() else {
                return;
            };
            if known.status() == status {
                return;
            }
            debug!(host = %address, %status, "Host status changed");

            let host = self.replace(known.with_status(status));
            let event = match status {
                HostStatus::Up => HostEvent::Up,
                HostStatus::Down => HostEvent::Down,
            };
            self.notify(&[(host, event)]);
        })
    }

    fn replace(&self, host: Host) -> Arc<Host> {
        let host = Arc::new(host);
        lock(&self.hosts).insert(host.address(), host.clone());
        host
    }

    /// Runs `f` holding the lock of `address`. The lock is dropped from `address_locks`
    /// once the address is unknown and nobody else holds or waits for it.
    fn serialized<R>(&self, address: SocketAddr, f: impl FnOnce() -> R) -> R {
        let address_lock = lock(&self.address_locks)
            .entry(address)
            .or_default()
            .clone();
        let result = {
            let _serialized = lock(&address_lock);
            f()
        };

        let mut address_locks = lock(&self.address_locks);
        // One reference is in the map, the other one is ours.
        if Arc::strong_count(&address_lock) == 2 && !self.has_host(address) {
            address_locks.remove(&address);
        }
        result
    }

    fn notify(&self, events: &[(Arc<Host>, HostEvent)]) {
        let listeners = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect::<Vec<_>>();

        for (host, event) in events {
            for listener in &listeners {
                listener.on_event(host, *event);
            }
        }
    }
}
