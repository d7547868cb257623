use crate::errors::{ConnectionError, ConnectionPoolError};
use crate::policies::load_balancing::NodeDistance;
use crate::policies::reconnection::{ReconnectionPolicy, ReconnectionSchedule};
use crate::utils::lock;

use super::connection::{open_connection, Connection, ConnectionConfig, ErrorReceiver};

use futures::future::{BoxFuture, RemoteHandle};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use itertools::Itertools;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot::error::RecvError;
use tracing::{debug, trace, warn};

/// The number of connections kept open to each host, depending on its distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSize {
    /// Connections per host of the local datacenter.
    pub local: usize,
    /// Connections per remote host.
    pub remote: usize,
}

impl Default for PoolSize {
    fn default() -> Self {
        Self {
            local: 2,
            remote: 1,
        }
    }
}

impl PoolSize {
    /// Returns `None` for ignored hosts, which get no pool at all.
    pub fn for_distance(&self, distance: NodeDistance) -> Option<usize> {
        match distance {
            NodeDistance::Local => Some(self.local.max(1)),
            NodeDistance::Remote => Some(self.remote.max(1)),
            NodeDistance::Ignored => None,
        }
    }
}

/// Sent by a pool which lost all of its connections and could not replace them.
#[derive(Debug)]
pub(crate) struct PoolBroken {
    pub(crate) address: SocketAddr,
    pub(crate) error: ConnectionError,
}

struct PoolState {
    connections: StdMutex<Vec<Arc<Connection>>>,
    last_error: StdMutex<Option<ConnectionError>>,
    closed: AtomicBool,
}

/// The connections to a single host.
pub(crate) struct NodeConnectionPool {
    address: SocketAddr,
    state: Arc<PoolState>,
    _refiller_handle: RemoteHandle<()>,
}

impl std::fmt::Debug for NodeConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionPool")
            .field("address", &self.address)
            .field("connections", &lock(&self.state.connections).len())
            .field("closed", &self.state.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl NodeConnectionPool {
    /// Opens `size` connections to `address`. Fails only if none of them could be opened;
    /// the missing ones are then opened in the background, following `reconnection_policy`.
    pub(crate) async fn open(
        address: SocketAddr,
        size: usize,
        config: &ConnectionConfig,
        reconnection_policy: Arc<dyn ReconnectionPolicy>,
        broken_sender: mpsc::UnboundedSender<PoolBroken>,
    ) -> Result<Self, ConnectionError> {
        let attempts =
            futures::future::join_all((0..size).map(|_| open_connection(address, config))).await;
        let (opened, mut errors): (Vec<_>, Vec<_>) = attempts.into_iter().partition_result();

        if let Some(error) = errors.pop().filter(|_| opened.is_empty()) {
            debug!(node = %address, "Failed to open any connection: {}", error);
            return Err(error);
        }
        if let Some(error) = errors.pop() {
            warn!(
                node = %address,
                "Opened {} out of {} connections: {}",
                opened.len(),
                size,
                error
            );
        }

        let state = Arc::new(PoolState {
            connections: StdMutex::new(Vec::with_capacity(size)),
            last_error: StdMutex::new(None),
            closed: AtomicBool::new(false),
        });

        let breakages = FuturesUnordered::new();
        for (connection, error_receiver) in opened {
            let connection = Arc::new(connection);
            breakages.push(watch_breakage(&connection, error_receiver));
            lock(&state.connections).push(connection);
        }

        let refiller = PoolRefiller {
            address,
            size,
            config: config.clone(),
            reconnection_policy,
            state: Arc::downgrade(&state),
            breakages,
            refill_schedule: None,
            broken_sender,
        };
        let (refiller, _refiller_handle) = refiller.run().remote_handle();
        tokio::spawn(refiller);

        trace!(node = %address, connections = size, "Pool opened");
        Ok(Self {
            address,
            state,
            _refiller_handle,
        })
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    /// Number of usable connections.
    pub(crate) fn size(&self) -> usize {
        lock(&self.state.connections)
            .iter()
            .filter(|connection| !connection.is_closed())
            .count()
    }

    /// Picks a usable connection uniformly at random.
    pub(crate) fn random_connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(ConnectionPoolError::NotOpen);
        }

        let usable = lock(&self.state.connections)
            .iter()
            .filter(|connection| !connection.is_closed())
            .cloned()
            .collect::<Vec<_>>();

        if usable.is_empty() {
            return Err(match lock(&self.state.last_error).clone() {
                Some(last_connection_error) => ConnectionPoolError::Broken {
                    last_connection_error: Box::new(last_connection_error),
                },
                None => ConnectionPoolError::NotOpen,
            });
        }

        let index = rand::rng().random_range(0..usable.len());
        Ok(usable[index].clone())
    }

    /// Closes every connection. Requests in flight fail; the pool is not refilled.
    pub(crate) fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        for connection in lock(&self.state.connections).drain(..) {
            connection.close();
        }
        debug!(node = %self.address, "Pool closed");
    }
}

type Breakage = BoxFuture<'static, (Weak<Connection>, Result<ConnectionError, RecvError>)>;

fn watch_breakage(connection: &Arc<Connection>, error_receiver: ErrorReceiver) -> Breakage {
    let connection = Arc::downgrade(connection);
    async move { (connection, error_receiver.await) }.boxed()
}

// Keeps the pool at its size. A broken connection is replaced right away; while the
// pool stays short, further attempts follow the reconnection schedule. When the last
// connection is gone and cannot be replaced, the pool reports itself broken and stops.
struct PoolRefiller {
    address: SocketAddr,
    size: usize,
    config: ConnectionConfig,
    reconnection_policy: Arc<dyn ReconnectionPolicy>,
    state: Weak<PoolState>,
    breakages: FuturesUnordered<Breakage>,
    // `None` until the pool falls short; the first attempt then happens immediately.
    refill_schedule: Option<ReconnectionSchedule>,
    broken_sender: mpsc::UnboundedSender<PoolBroken>,
}

impl PoolRefiller {
    async fn run(mut self) {
        loop {
            let missing = {
                let Some(state) = self.state.upgrade() else { return };
                if state.closed.load(Ordering::Acquire) {
                    return;
                }
                let open = lock(&state.connections).len();
                self.size.saturating_sub(open)
            };

            let refill_delay = if missing == 0 {
                self.refill_schedule = None;
                None
            } else {
                self.next_refill_delay()
            };

            tokio::select! {
                Some((broken, error)) = self.breakages.next(), if !self.breakages.is_empty() => {
                    self.forget(broken, error);
                }
                _ = tokio::time::sleep(refill_delay.unwrap_or_default()), if refill_delay.is_some() => {
                    if !self.refill().await {
                        return;
                    }
                }
                else => return,
            }
        }
    }

    // `None` once the schedule is exhausted; refilling resumes after the next breakage.
    fn next_refill_delay(&mut self) -> Option<Duration> {
        match &mut self.refill_schedule {
            Some(schedule) => schedule.next(),
            None => {
                self.refill_schedule = Some(self.reconnection_policy.schedule());
                Some(Duration::ZERO)
            }
        }
    }

    fn forget(&mut self, broken: Weak<Connection>, error: Result<ConnectionError, RecvError>) {
        // A dropped connection did not break.
        let Ok(error) = error else { return };
        let Some(state) = self.state.upgrade() else { return };
        debug!(node = %self.address, "Connection broken, replacing it: {}", error);

        lock(&state.connections)
            .retain(|connection| !Weak::ptr_eq(&Arc::downgrade(connection), &broken));
        *lock(&state.last_error) = Some(error);
        self.refill_schedule = None;
    }

    // Opens one connection. Returns false once the pool is closed or reported broken.
    async fn refill(&mut self) -> bool {
        let opened = open_connection(self.address, &self.config).await;
        let Some(state) = self.state.upgrade() else { return false };
        if state.closed.load(Ordering::Acquire) {
            if let Ok((connection, _)) = &opened {
                connection.close();
            }
            return false;
        }

        match opened {
            Ok((connection, error_receiver)) => {
                let connection = Arc::new(connection);
                self.breakages
                    .push(watch_breakage(&connection, error_receiver));
                let open = {
                    let mut connections = lock(&state.connections);
                    connections.push(connection);
                    connections.len()
                };
                trace!(node = %self.address, open, size = self.size, "Pool refilled a connection");
                true
            }
            Err(error) => {
                debug!(node = %self.address, "Failed to refill the pool: {}", error);
                *lock(&state.last_error) = Some(error.clone());
                if !lock(&state.connections).is_empty() {
                    return true;
                }
                warn!(node = %self.address, "All connections of the pool are broken");
                let _ = self.broken_sender.send(PoolBroken {
                    address: self.address,
                    error,
                });
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{NodeConnectionPool, PoolBroken, PoolSize};
    use crate::errors::ConnectionPoolError;
    use crate::frame::request::RequestOpcode;
    use crate::network::ConnectionConfig;
    use crate::policies::load_balancing::NodeDistance;
    use crate::policies::reconnection::ConstantReconnectionPolicy;
    use crate::utils::test_utils::{
        default_reply, setup_tracing, MockNode, NodeInfo, Reaction, Topology,
    };
    use assert_matches::assert_matches;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn node(address: &str) -> MockNode {
        let address: SocketAddr = address.parse().unwrap();
        let info = NodeInfo::new(&address.ip().to_string(), "dc1");
        MockNode::healthy(address, Topology::seen_from(&[info], 0)).await
    }

    async fn open_pool(
        address: SocketAddr,
        size: usize,
        broken_sender: mpsc::UnboundedSender<PoolBroken>,
    ) -> Result<NodeConnectionPool, crate::errors::ConnectionError> {
        NodeConnectionPool::open(
            address,
            size,
            &ConnectionConfig::default(),
            Arc::new(ConstantReconnectionPolicy::new(Duration::from_millis(20))),
            broken_sender,
        )
        .await
    }

    async fn eventually(condition: impl Fn() -> bool) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn pool_size_depends_on_distance() {
        let size = PoolSize::default();
        assert_eq!(size.for_distance(NodeDistance::Local), Some(2));
        assert_eq!(size.for_distance(NodeDistance::Remote), Some(1));
        assert_eq!(size.for_distance(NodeDistance::Ignored), None);

        let size = PoolSize {
            local: 0,
            remote: 0,
        };
        assert_eq!(size.for_distance(NodeDistance::Local), Some(1));
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn broken_connection_is_replaced() {
        setup_tracing();
        let node = node("127.0.3.1:9042").await;
        let (broken_sender, mut broken_receiver) = mpsc::unbounded_channel();

        let pool = open_pool(node.address(), 2, broken_sender).await.unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(node.accepted_connections(), 2);

        pool.random_connection().unwrap().close();

        while node.accepted_connections() < 3 || pool.size() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(broken_receiver.try_recv().is_err());
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn pool_reports_when_every_connection_is_gone() {
        setup_tracing();
        let node = node("127.0.3.2:9042").await;
        let (broken_sender, mut broken_receiver) = mpsc::unbounded_channel();

        let pool = open_pool(node.address(), 1, broken_sender).await.unwrap();

        node.stop();

        let broken = broken_receiver.recv().await.unwrap();
        assert_eq!(broken.address, node.address());
        assert_matches!(
            pool.random_connection(),
            Err(ConnectionPoolError::Broken { .. })
        );
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn closed_pool_is_not_refilled() {
        setup_tracing();
        let node = node("127.0.3.3:9042").await;
        let (broken_sender, mut broken_receiver) = mpsc::unbounded_channel();

        let pool = open_pool(node.address(), 2, broken_sender).await.unwrap();
        pool.close();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(node.accepted_connections(), 2);
        assert!(broken_receiver.try_recv().is_err());
        assert_matches!(pool.random_connection(), Err(ConnectionPoolError::NotOpen));
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn opening_fails_when_no_connection_can_be_made() {
        setup_tracing();
        let (broken_sender, _broken_receiver) = mpsc::unbounded_channel();
        // Nothing listens there.
        let res = open_pool("127.0.3.4:9042".parse().unwrap(), 2, broken_sender).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn pool_short_of_connections_keeps_refilling_on_schedule() {
        setup_tracing();
        let address: SocketAddr = "127.0.3.5:9042".parse().unwrap();
        let topology = Topology::seen_from(&[NodeInfo::new("127.0.3.5", "dc1")], 0);
        let handshakes = Arc::new(AtomicUsize::new(0));
        // The third connection, the first replacement, is refused during its handshake.
        let node = MockNode::start(address, {
            let handshakes = handshakes.clone();
            move |frame| {
                if frame.opcode == RequestOpcode::Options
                    && handshakes.fetch_add(1, Ordering::SeqCst) == 2
                {
                    return Reaction::Close;
                }
                default_reply(frame, &topology)
            }
        })
        .await;
        let (broken_sender, mut broken_receiver) = mpsc::unbounded_channel();

        let pool = open_pool(address, 2, broken_sender).await.unwrap();
        assert_eq!(pool.size(), 2);

        pool.random_connection().unwrap().close();

        eventually(|| handshakes.load(Ordering::SeqCst) >= 4 && pool.size() == 2).await;
        assert_eq!(node.accepted_connections(), 4);
        assert!(broken_receiver.try_recv().is_err());
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn partially_opened_pool_is_filled_up_later() {
        setup_tracing();
        let address: SocketAddr = "127.0.3.6:9042".parse().unwrap();
        let topology = Topology::seen_from(&[NodeInfo::new("127.0.3.6", "dc1")], 0);
        let handshakes = Arc::new(AtomicUsize::new(0));
        // Of the three connections opened together, two are refused.
        let node = MockNode::start(address, {
            let handshakes = handshakes.clone();
            move |frame| {
                if frame.opcode == RequestOpcode::Options
                    && (1..3).contains(&handshakes.fetch_add(1, Ordering::SeqCst))
                {
                    return Reaction::Close;
                }
                default_reply(frame, &topology)
            }
        })
        .await;
        let (broken_sender, _broken_receiver) = mpsc::unbounded_channel();

        let pool = open_pool(address, 3, broken_sender).await.unwrap();
        eventually(|| pool.size() == 3).await;
        assert_eq!(node.accepted_connections(), 5);
    }
}
