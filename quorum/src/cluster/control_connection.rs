//! The control connection keeps the [`HostRegistry`] in sync with the cluster.
//!
//! It is a single connection, never used for user requests, which REGISTERs for server
//! events and reads `system.local` and `system.peers`. The protocol version is negotiated
//! when it is first opened and then used by every other connection of the dispatcher.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{HostInfo, HostRegistry};
use crate::errors::{ConnectionError, MetadataError, NewDispatcherError};
use crate::frame::frame_errors::LowLevelDeserializationError;
use crate::frame::response::event::{Event, StatusChangeEvent, TopologyChangeEvent};
use crate::frame::response::result::{self, Row, Rows};
use crate::network::{open_connection, Connection, ConnectionConfig, ErrorReceiver};
use crate::policies::address_resolution::AddressResolutionPolicy;
use crate::policies::load_balancing::{LoadBalancingPolicy, RoutingInfo};
use crate::policies::reconnection::{reconnect_with_schedule, ReconnectionPolicy};
use crate::ProtocolVersion;

const LOCAL_QUERY: &str = "SELECT rack, data_center, host_id, release_version FROM system.local";
const PEERS_QUERY: &str =
    "SELECT peer, rack, data_center, host_id, rpc_address, release_version FROM system.peers";
const LOCAL_SCHEMA_VERSION_QUERY: &str =
    "SELECT schema_version FROM system.local WHERE key='local'";

const EVENT_CHANNEL_SIZE: usize = 32;

pub(crate) struct ControlConnectionConfig {
    /// Its protocol version is the highest one tried.
    pub(crate) connection_config: ConnectionConfig,
    pub(crate) reconnection_policy: Arc<dyn ReconnectionPolicy>,
    pub(crate) address_resolution_policy: Arc<dyn AddressResolutionPolicy>,
    pub(crate) refresh_interval: Duration,
}

/// Handle to the background task owning the control connection. Dropping it closes the
/// connection.
pub(crate) struct ControlConnection {
    protocol_version: ProtocolVersion,
    _worker_handle: RemoteHandle<()>,
}

impl std::fmt::Debug for ControlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlConnection")
            .field("protocol_version", &self.protocol_version)
            .finish_non_exhaustive()
    }
}

impl ControlConnection {
    /// Connects to the first contact point that accepts some protocol version and
    /// populates `registry` from its system tables.
    pub(crate) async fn bootstrap(
        contact_points: &[SocketAddr],
        config: ControlConnectionConfig,
        registry: Arc<HostRegistry>,
        policy: Arc<dyn LoadBalancingPolicy>,
    ) -> Result<Self, NewDispatcherError> {
        let ceiling = config.connection_config.protocol_version;
        let mut worker = ControlWorker {
            config,
            registry,
            policy,
            contact_points: contact_points.to_vec(),
        };

        let mut last_error = None;
        let mut version_refused = false;
        for &address in contact_points {
            let working = match worker.open(address).await {
                Ok(working) => working,
                Err(error) => {
                    warn!(node = %address, "Failed to open the control connection: {}", error);
                    version_refused |= error.is_unsupported_protocol_version();
                    last_error = Some(NewDispatcherError::ControlConnection(error));
                    continue;
                }
            };

            if let Err(error) = worker.refresh_topology(&working.connection).await {
                warn!(node = %address, "Failed to read the topology: {}", error);
                working.connection.close();
                last_error = Some(error.into());
                continue;
            }

            let protocol_version = working.connection.protocol_version();
            info!(node = %address, version = %protocol_version, "Control connection established");
            worker.config.connection_config.protocol_version = protocol_version;

            let (fut, _worker_handle) = worker.work(working).remote_handle();
            tokio::spawn(fut);
            return Ok(Self {
                protocol_version,
                _worker_handle,
            });
        }

        if version_refused {
            return Err(NewDispatcherError::UnsupportedProtocolVersion(ceiling));
        }
        Err(last_error.unwrap_or(NewDispatcherError::EmptyKnownNodesList))
    }

    /// The version every connection of the dispatcher must speak.
    pub(crate) fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }
}

struct WorkingConnection {
    connection: Connection,
    error_receiver: ErrorReceiver,
    events: mpsc::Receiver<Event>,
}

struct ControlWorker {
    config: ControlConnectionConfig,
    registry: Arc<HostRegistry>,
    policy: Arc<dyn LoadBalancingPolicy>,
    contact_points: Vec<SocketAddr>,
}

impl ControlWorker {
    async fn work(self, mut working: WorkingConnection) {
        let mut next_refresh = Instant::now() + self.config.refresh_interval;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_refresh) => {
                    trace!("Periodic topology refresh");
                    self.refresh_or_close(&working.connection).await;
                    next_refresh = Instant::now() + self.config.refresh_interval;
                }
                Some(event) = working.events.recv() => {
                    let port = working.connection.get_connect_address().port();
                    let mut refresh_needed = self.handle_event(event, port).await;
                    // Coalesce a burst of events into a single refresh.
                    while let Ok(event) = working.events.try_recv() {
                        refresh_needed |= self.handle_event(event, port).await;
                    }
                    if refresh_needed {
                        self.refresh_or_close(&working.connection).await;
                        next_refresh = Instant::now() + self.config.refresh_interval;
                    }
                }
                broken = &mut working.error_receiver => {
                    let address = working.connection.get_connect_address();
                    match broken {
                        Ok(error) => warn!(node = %address, "Control connection broken: {}", error),
                        Err(_) => warn!(node = %address, "Control connection dropped"),
                    }
                    working = self.reconnect(address).await;
                    next_refresh = Instant::now() + self.config.refresh_interval;
                }
            }
        }
    }

    // Returns whether the event calls for a topology refresh.
    async fn handle_event(&self, event: Event, port: u16) -> bool {
        debug!("Received server event: {:?}", event);

        match event {
            Event::TopologyChange(TopologyChangeEvent::NewNode(_))
            | Event::TopologyChange(TopologyChangeEvent::MovedNode(_)) => true,
            Event::TopologyChange(TopologyChangeEvent::RemovedNode(address)) => {
                self.registry
                    .host_lost(self.resolve(address.ip(), port).await);
                false
            }
            Event::StatusChange(StatusChangeEvent::Up(address)) => {
                let address = self.resolve(address.ip(), port).await;
                if self.registry.has_host(address) {
                    self.registry.host_up(address);
                    false
                } else {
                    true
                }
            }
            Event::StatusChange(StatusChangeEvent::Down(address)) => {
                self.registry
                    .host_down(self.resolve(address.ip(), port).await);
                false
            }
            Event::SchemaChange(_) => false,
        }
    }

    // Nodes advertise addresses without a port; they listen on the port of the control
    // connection.
    async fn resolve(&self, advertised: IpAddr, port: u16) -> SocketAddr {
        let advertised = SocketAddr::new(advertised, port);
        let resolved = self
            .config
            .address_resolution_policy
            .resolve(advertised)
            .await;
        if resolved != advertised {
            trace!(%advertised, %resolved, "Resolved a node address");
        }
        resolved
    }

    // A failed refresh means the connection cannot be trusted; closing it starts a
    // reconnection.
    async fn refresh_or_close(&self, connection: &Connection) {
        if let Err(error) = self.refresh_topology(connection).await {
            warn!(
                node = %connection.get_connect_address(),
                "Topology refresh failed, reconnecting: {}",
                error
            );
            connection.close();
        }
    }

    async fn reconnect(&self, last_address: SocketAddr) -> WorkingConnection {
        loop {
            let schedule = self.config.reconnection_policy.schedule();
            let working =
                match reconnect_with_schedule(last_address, schedule, || self.open_any()).await {
                    Ok(working) => working,
                    Err(gave_up) => {
                        error!("Control connection: {}", gave_up);
                        tokio::time::sleep(self.config.refresh_interval).await;
                        continue;
                    }
                };

            match self.refresh_topology(&working.connection).await {
                Ok(()) => {
                    info!(
                        node = %working.connection.get_connect_address(),
                        "Control connection reestablished"
                    );
                    return working;
                }
                Err(error) => {
                    warn!("Failed to read the topology after reconnecting: {}", error);
                    working.connection.close();
                }
            }
        }
    }

    // Hosts of the load balancing plan first, then the rest of the registry, then the
    // contact points.
    fn candidates(&self) -> Vec<SocketAddr> {
        let mut seen = HashSet::new();
        self.policy
            .plan(&RoutingInfo::default())
            .map(|host| host.address())
            .chain(self.registry.hosts().iter().map(|host| host.address()))
            .chain(self.contact_points.iter().copied())
            .filter(|address| seen.insert(*address))
            .collect()
    }

    async fn open_any(&self) -> Result<WorkingConnection, ConnectionError> {
        let mut last_error = ConnectionError::ConnectTimeout;
        for address in self.candidates() {
            match self.open(address).await {
                Ok(working) => return Ok(working),
                Err(error) => {
                    debug!(node = %address, "Control connection attempt failed: {}", error);
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    // Opens a connection registered for events, stepping the protocol version down for as
    // long as the node refuses it.
    async fn open(&self, address: SocketAddr) -> Result<WorkingConnection, ConnectionError> {
        let mut config = self.config.connection_config.clone();
        loop {
            let (event_sender, events) = mpsc::channel(EVENT_CHANNEL_SIZE);
            config.event_sender = Some(event_sender);

            let error = match open_connection(address, &config).await {
                Ok((connection, error_receiver)) => {
                    return Ok(WorkingConnection {
                        connection,
                        error_receiver,
                        events,
                    })
                }
                Err(error) => error,
            };
            if !error.is_unsupported_protocol_version() {
                return Err(error);
            }

            let refused = config.protocol_version;
            let Some(lower) = refused.lower() else {
                return Err(error);
            };
            debug!(
                node = %address,
                refused = %refused,
                "Protocol version not supported, trying {}",
                lower
            );
            config.protocol_version = lower;
        }
    }

    /// Registers every node found in the system tables and forgets the known ones that
    /// were not.
    async fn refresh_topology(&self, connection: &Connection) -> Result<(), MetadataError> {
        let local_address = connection.get_connect_address();
        let port = local_address.port();

        let local = SystemRows::query(connection, "local", LOCAL_QUERY).await?;
        let local_row = local.rows.rows.first().ok_or(MetadataError::EmptyLocal)?;
        // The local node is reached through the address the connection was opened to.
        let mut found = vec![(local_address, local.host_info(local_row)?)];

        let peers = SystemRows::query(connection, "peers", PEERS_QUERY).await?;
        for row in &peers.rows.rows {
            match peers.peer_address(row)? {
                Some(ip) => found.push((self.resolve(ip, port).await, peers.host_info(row)?)),
                None => warn!("Skipping a peer without an address: {:?}", row),
            }
        }

        let seen = found
            .iter()
            .map(|(address, _)| *address)
            .collect::<HashSet<_>>();
        for (address, info) in found {
            self.registry.host_found(address, info);
        }
        for host in self.registry.hosts() {
            if !seen.contains(&host.address()) {
                debug!(node = %host.address(), "Host no longer in the system tables");
                self.registry.host_lost(host.address());
            }
        }

        trace!(hosts = seen.len(), "Topology refreshed");
        Ok(())
    }
}

/// Reads the schema version the node behind `connection` is on.
pub(crate) async fn read_schema_version(connection: &Connection) -> Result<Uuid, MetadataError> {
    let local = SystemRows::query(connection, "local", LOCAL_SCHEMA_VERSION_QUERY).await?;
    let row = local.rows.rows.first().ok_or(MetadataError::EmptyLocal)?;
    local
        .uuid(row, "schema_version")?
        .ok_or(MetadataError::MissingColumn {
            table: "local",
            column: "schema_version",
        })
}

/// The result of a system table query, with typed access to its columns.
struct SystemRows {
    table: &'static str,
    rows: Rows,
}

impl SystemRows {
    async fn query(
        connection: &Connection,
        table: &'static str,
        cql: &str,
    ) -> Result<Self, MetadataError> {
        match connection.query_unpaged(cql).await? {
            result::Result::Rows(rows) => Ok(Self { table, rows }),
            _ => Err(MetadataError::NotRows(table)),
        }
    }

    fn column(&self, column: &'static str) -> Result<usize, MetadataError> {
        self.rows
            .column_index(column)
            .ok_or(MetadataError::MissingColumn {
                table: self.table,
                column,
            })
    }

    fn malformed(
        &self,
        column: &'static str,
    ) -> impl FnOnce(LowLevelDeserializationError) -> MetadataError {
        let table = self.table;
        move |error| MetadataError::MalformedCell {
            table,
            column,
            error,
        }
    }

    fn text(&self, row: &Row, column: &'static str) -> Result<Option<String>, MetadataError> {
        Ok(row
            .text(self.column(column)?)
            .map_err(self.malformed(column))?
            .map(str::to_string))
    }

    fn uuid(&self, row: &Row, column: &'static str) -> Result<Option<Uuid>, MetadataError> {
        row.uuid(self.column(column)?)
            .map_err(self.malformed(column))
    }

    fn inet(&self, row: &Row, column: &'static str) -> Result<Option<IpAddr>, MetadataError> {
        row.inet(self.column(column)?)
            .map_err(self.malformed(column))
    }

    fn host_info(&self, row: &Row) -> Result<HostInfo, MetadataError> {
        Ok(HostInfo {
            host_id: self.uuid(row, "host_id")?,
            datacenter: self.text(row, "data_center")?,
            rack: self.text(row, "rack")?,
            release_version: self.text(row, "release_version")?,
        })
    }

    // Nodes listening on every interface report 0.0.0.0 as their rpc_address; the
    // peer column is used for them instead.
    fn peer_address(&self, row: &Row) -> Result<Option<IpAddr>, MetadataError> {
        match self.inet(row, "rpc_address")? {
            Some(rpc_address) if !rpc_address.is_unspecified() => Ok(Some(rpc_address)),
            _ => self.inet(row, "peer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ControlConnection, ControlConnectionConfig};
    use crate::cluster::{HostRegistry, HostStatus};
    use crate::errors::NewDispatcherError;
    use crate::frame::request::RequestOpcode;
    use crate::frame::response::event::{Event, StatusChangeEvent, TopologyChangeEvent};
    use crate::frame::response::DbError;
    use crate::network::ConnectionConfig;
    use crate::policies::address_resolution::IdentityAddressResolution;
    use crate::policies::load_balancing::{PolicyListener, RoundRobinPolicy};
    use crate::policies::reconnection::ConstantReconnectionPolicy;
    use crate::utils::test_utils::{
        default_reply, handshake_reply, setup_tracing, ForgedResponse, MockCluster, MockNode,
        NodeInfo, Reaction, Topology,
    };
    use crate::ProtocolVersion;
    use assert_matches::assert_matches;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(refresh_interval: Duration) -> ControlConnectionConfig {
        ControlConnectionConfig {
            connection_config: ConnectionConfig::default(),
            reconnection_policy: Arc::new(ConstantReconnectionPolicy::new(
                Duration::from_millis(10),
            )),
            address_resolution_policy: Arc::new(IdentityAddressResolution),
            refresh_interval,
        }
    }

    async fn bootstrap(
        contact_points: &[SocketAddr],
        refresh_interval: Duration,
    ) -> (Result<ControlConnection, NewDispatcherError>, Arc<HostRegistry>) {
        bootstrap_with(contact_points, config(refresh_interval)).await
    }

    async fn bootstrap_with(
        contact_points: &[SocketAddr],
        config: ControlConnectionConfig,
    ) -> (Result<ControlConnection, NewDispatcherError>, Arc<HostRegistry>) {
        let registry = Arc::new(HostRegistry::new());
        let policy = Arc::new(RoundRobinPolicy::new());
        registry.add_listener(Arc::new(PolicyListener(policy.clone())));
        let control =
            ControlConnection::bootstrap(contact_points, config, registry.clone(), policy).await;
        (control, registry)
    }

    async fn eventually(condition: impl Fn() -> bool) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn refuse_versions_above(
        highest: ProtocolVersion,
        topology: Topology,
    ) -> impl Fn(&crate::utils::test_utils::RequestFrame) -> Reaction + Send + Sync + 'static {
        move |frame| {
            if frame.opcode == RequestOpcode::Options && frame.params.version > highest {
                return Reaction::Reply(ForgedResponse::Error(
                    DbError::ProtocolError,
                    "Invalid or unsupported protocol version".to_string(),
                ));
            }
            default_reply(frame, &topology)
        }
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn bootstrap_registers_every_node() {
        setup_tracing();
        let cluster = MockCluster::start(2, 3, |_, _| None).await;
        let (control, registry) = bootstrap(&[cluster.address(0)], Duration::from_secs(60)).await;
        let control = control.unwrap();
        assert_eq!(control.protocol_version(), ProtocolVersion::V4);

        let mut hosts = registry.hosts();
        hosts.sort_by_key(|host| host.address());
        assert_eq!(hosts.len(), 3);
        for (host, info) in hosts.iter().zip(&cluster.infos) {
            assert_eq!(host.address(), SocketAddr::new(info.ip, 9042));
            assert_eq!(host.host_id(), Some(info.host_id));
            assert_eq!(host.datacenter(), Some("dc1"));
            assert_eq!(host.status(), HostStatus::Up);
        }
        assert_eq!(
            cluster.nodes[0]
                .requests_with_opcode(RequestOpcode::Register)
                .len(),
            1
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn protocol_version_is_stepped_down_until_accepted() {
        setup_tracing();
        let info = NodeInfo::new("127.0.4.1", "dc1");
        let node = MockNode::start(
            "127.0.4.1:9042".parse().unwrap(),
            refuse_versions_above(ProtocolVersion::V2, Topology::seen_from(&[info], 0)),
        )
        .await;

        let (control, registry) = bootstrap(&[node.address()], Duration::from_secs(60)).await;
        assert_eq!(control.unwrap().protocol_version(), ProtocolVersion::V2);
        assert!(registry.has_host(node.address()));

        let tried = node
            .requests_with_opcode(RequestOpcode::Options)
            .iter()
            .map(|frame| frame.params.version)
            .collect::<Vec<_>>();
        assert_eq!(
            tried,
            vec![ProtocolVersion::V4, ProtocolVersion::V3, ProtocolVersion::V2]
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn node_refusing_every_version_fails_bootstrap() {
        setup_tracing();
        let node = MockNode::start("127.0.4.2:9042".parse().unwrap(), |_| {
            Reaction::Reply(ForgedResponse::Error(
                DbError::ProtocolError,
                "Invalid or unsupported protocol version".to_string(),
            ))
        })
        .await;

        let (control, registry) = bootstrap(&[node.address()], Duration::from_secs(60)).await;
        assert_matches!(
            control,
            Err(NewDispatcherError::UnsupportedProtocolVersion(
                ProtocolVersion::V4
            ))
        );
        assert!(registry.hosts().is_empty());
        assert_eq!(node.requests_with_opcode(RequestOpcode::Options).len(), 4);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn unrelated_protocol_error_does_not_step_the_version_down() {
        setup_tracing();
        let node = MockNode::start("127.0.27.1:9042".parse().unwrap(), |frame| {
            if frame.opcode == RequestOpcode::Startup {
                return Reaction::Reply(ForgedResponse::Error(
                    DbError::ProtocolError,
                    "Unknown compression algorithm".to_string(),
                ));
            }
            handshake_reply(frame).unwrap_or(Reaction::Ignore)
        })
        .await;

        let (control, registry) = bootstrap(&[node.address()], Duration::from_secs(60)).await;
        assert_matches!(control, Err(NewDispatcherError::ControlConnection(_)));
        assert!(registry.hosts().is_empty());

        let tried = node
            .requests_with_opcode(RequestOpcode::Options)
            .iter()
            .map(|frame| frame.params.version)
            .collect::<Vec<_>>();
        assert_eq!(tried, vec![ProtocolVersion::V4]);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn advertised_peer_addresses_are_resolved() {
        setup_tracing();
        let mut infos = vec![
            NodeInfo::new("127.0.26.1", "dc1"),
            NodeInfo::new("127.0.26.2", "dc1"),
        ];
        // The second node advertises an address this client cannot reach.
        infos[1].rpc_address = "10.9.9.2".parse().unwrap();
        let cluster = MockCluster::start_with_infos(infos, |_, _| None).await;

        let advertised: SocketAddr = "10.9.9.2:9042".parse().unwrap();
        let reachable = cluster.address(1);
        let mut config = config(Duration::from_secs(60));
        config.address_resolution_policy = Arc::new(HashMap::from([(advertised, reachable)]));

        let (control, registry) = bootstrap_with(&[cluster.address(0)], config).await;
        let _control = control.unwrap();
        assert!(registry.has_host(reachable));
        assert!(!registry.has_host(advertised));

        // Events name nodes by their advertised address too.
        cluster.nodes[0].push_event(Event::StatusChange(StatusChangeEvent::Down(advertised)));
        eventually(|| !registry.host(reachable).unwrap().is_up()).await;
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn unreachable_contact_point_is_skipped() {
        setup_tracing();
        let cluster = MockCluster::start(6, 1, |_, _| None).await;
        // Nothing listens on 127.0.6.9.
        let (control, registry) = bootstrap(
            &["127.0.6.9:9042".parse().unwrap(), cluster.address(0)],
            Duration::from_secs(60),
        )
        .await;
        assert!(control.is_ok());
        assert_eq!(registry.hosts().len(), 1);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn peer_bound_to_every_interface_is_reached_through_its_peer_address() {
        setup_tracing();
        let mut infos = vec![
            NodeInfo::new("127.0.5.1", "dc1"),
            NodeInfo::new("127.0.5.2", "dc1"),
        ];
        infos[1].rpc_address = "0.0.0.0".parse().unwrap();
        let cluster = MockCluster::start_with_infos(infos, |_, _| None).await;

        let (control, registry) = bootstrap(&[cluster.address(0)], Duration::from_secs(60)).await;
        let _control = control.unwrap();
        assert!(registry.has_host("127.0.5.2:9042".parse().unwrap()));
        assert!(!registry.has_host("0.0.0.0:9042".parse().unwrap()));
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn server_events_update_the_registry() {
        setup_tracing();
        let cluster = MockCluster::start(7, 2, |_, _| None).await;
        let (control, registry) = bootstrap(&[cluster.address(0)], Duration::from_secs(60)).await;
        let _control = control.unwrap();
        let second = cluster.address(1);

        cluster.nodes[0].push_event(Event::StatusChange(StatusChangeEvent::Down(second)));
        eventually(|| !registry.host(second).unwrap().is_up()).await;

        cluster.nodes[0].push_event(Event::StatusChange(StatusChangeEvent::Up(second)));
        eventually(|| registry.host(second).unwrap().is_up()).await;

        cluster.nodes[0].push_event(Event::TopologyChange(TopologyChangeEvent::RemovedNode(
            second,
        )));
        eventually(|| !registry.has_host(second)).await;

        // NEW_NODE refreshes the topology, which also forgets hosts the cluster no
        // longer reports.
        let stale: SocketAddr = "127.0.7.99:9042".parse().unwrap();
        registry.host_found(stale, Default::default());
        cluster.nodes[0].push_event(Event::TopologyChange(TopologyChangeEvent::NewNode(second)));
        eventually(|| registry.has_host(second) && !registry.has_host(stale)).await;
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn topology_is_refreshed_periodically() {
        setup_tracing();
        let cluster = MockCluster::start(8, 1, |_, _| None).await;
        let (control, _registry) =
            bootstrap(&[cluster.address(0)], Duration::from_millis(50)).await;
        let _control = control.unwrap();

        let local_queries = || {
            cluster.nodes[0]
                .requests()
                .iter()
                .filter(|frame| {
                    frame
                        .cql()
                        .is_some_and(|cql| cql.contains("system.local"))
                })
                .count()
        };
        eventually(|| local_queries() >= 3).await;
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn broken_control_connection_moves_to_another_host() {
        setup_tracing();
        let cluster = MockCluster::start(9, 2, |_, _| None).await;
        let (control, registry) = bootstrap(&[cluster.address(0)], Duration::from_secs(60)).await;
        let _control = control.unwrap();
        assert_eq!(registry.hosts().len(), 2);

        cluster.nodes[0].stop();

        eventually(|| {
            cluster.nodes[1]
                .requests_with_opcode(RequestOpcode::Register)
                .len()
                == 1
        })
        .await;
        // The new connection read the topology again.
        eventually(|| {
            cluster.nodes[1]
                .requests()
                .iter()
                .any(|frame| frame.cql().is_some_and(|cql| cql.contains("system.peers")))
        })
        .await;
    }
}
