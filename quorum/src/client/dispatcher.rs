//! `Dispatcher` is the main object used in the driver.\
//! It manages all connections to the cluster and allows to perform requests.

use std::borrow::{Borrow, Cow};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::{join_all, try_join_all, BoxFuture, RemoteHandle, Shared};
use futures::FutureExt;
use itertools::{Either, Itertools};
use tokio::net::lookup_host;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, trace_span, warn, Instrument};
use uuid::Uuid;

use crate::authentication::AuthenticatorProvider;
use crate::cluster::control_connection::{
    read_schema_version, ControlConnection, ControlConnectionConfig,
};
use crate::cluster::{Host, HostEvent, HostListener, HostRegistry, ListenerId};
use crate::errors::{
    BrokenConnectionErrorKind, ConnectionError, ConnectionPoolError, DbError, ExecutionError,
    MetadataError, NewDispatcherError, NoHostsAvailable, PrepareError, RequestAttemptError,
    SchemaAgreementError, UseKeyspaceError,
};
use crate::frame::request::batch::{Batch as BatchRequest, BatchStatement};
use crate::frame::request::query::{Query, QueryParameters};
use crate::frame::request::{Execute, Prepare};
use crate::frame::response::{result, ResponseOpcode};
use crate::frame::Compression;
use crate::network::{
    Connection, ConnectionConfig, NodeConnectionPool, PoolBroken, PoolSize, VerifiedKeyspaceName,
};
use crate::policies::address_resolution::{AddressResolutionPolicy, IdentityAddressResolution};
use crate::policies::load_balancing::{
    LoadBalancingPolicy, PolicyListener, RoundRobinPolicy, RoutingInfo,
};
use crate::policies::reconnection::{
    reconnect_with_schedule, ExponentialReconnectionPolicy, ReconnectionPolicy,
    ReconnectionSchedule,
};
use crate::policies::retry::{decide, DefaultRetryPolicy, RequestInfo, RetryDecision, RetryPolicy};
use crate::response::{ExecutionInfo, NonErrorQueryResponse, QueryResult, ResultKind};
use crate::statement::{Batch, BatchEntry, ExecutionOptions, PreparedStatement, SerializedValues, Statement};
use crate::utils::lock;
use crate::{Consistency, ProtocolVersion};

const DEFAULT_PORT: u16 = 9042;

/// A node the dispatcher may bootstrap from.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum KnownNode {
    /// `host` or `host:port`, resolved when the dispatcher is built.
    Hostname(String),
    Address(SocketAddr),
}

/// Configuration options for [`Dispatcher`].
/// Can be created manually, but usually it's easier to use
/// [`DispatcherBuilder`](super::DispatcherBuilder).
#[derive(Clone)]
pub struct DispatcherConfig {
    /// Tried in order until one accepts the control connection.
    pub known_nodes: Vec<KnownNode>,

    /// Highest protocol version to try. The control connection steps down from it until
    /// a node accepts; every other connection then speaks the accepted version.
    pub protocol_version: ProtocolVersion,

    /// Preferred compression algorithm to use on connections.
    /// If it's not supported by database server Dispatcher will fall back to no compression.
    pub compression: Option<Compression>,
    pub tcp_nodelay: bool,
    pub tcp_keepalive_interval: Option<Duration>,
    pub connect_timeout: Duration,

    /// How often an OPTIONS request is sent on every connection to check it still works.
    /// `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// A connection that receives nothing for this long is considered broken.
    /// `None` disables the check.
    pub idle_timeout: Option<Duration>,

    /// Requests sent at once on one connection. Further requests wait in a queue.
    pub stream_capacity: usize,
    pub pool_size: PoolSize,

    pub load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,
    /// Applied to the addresses of discovered nodes, not to known nodes.
    pub address_resolution_policy: Arc<dyn AddressResolutionPolicy>,

    /// Fills in whatever a request leaves unset.
    pub default_execution_options: ExecutionOptions,

    /// Keyspace every connection switches to before its first request.
    pub used_keyspace: Option<String>,
    pub keyspace_case_sensitive: bool,

    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    /// How often the control connection rereads the topology without being told to.
    pub topology_refresh_interval: Duration,

    /// Whether a request that changed the schema waits for every host to agree on it
    /// before returning.
    pub automatic_schema_agreement: bool,
    pub schema_agreement_interval: Duration,
    pub schema_agreement_timeout: Duration,
}

impl DispatcherConfig {
    /// Creates a [`DispatcherConfig`] with default configuration
    /// # Default configuration
    /// * Protocol version: 4 (stepped down if the cluster is older)
    /// * Compression: None
    /// * Connect timeout: 10 seconds, request timeout: 12 seconds
    /// * Heartbeat every 30 seconds, idle timeout: 60 seconds
    /// * Pool size: 2 connections per local host, 1 per remote host
    /// * Policies: round robin, default retry, exponential reconnection from 0.5s to 30s,
    ///   identity address resolution
    /// * Topology refresh every 60 seconds
    /// * Automatic schema agreement, checked every 200ms for up to 10 seconds
    pub fn new() -> Self {
        DispatcherConfig {
            known_nodes: Vec::new(),
            protocol_version: ProtocolVersion::V4,
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Some(Duration::from_secs(30)),
            idle_timeout: Some(Duration::from_secs(60)),
            stream_capacity: 128,
            pool_size: PoolSize::default(),
            load_balancing_policy: Arc::new(RoundRobinPolicy::new()),
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
            address_resolution_policy: Arc::new(IdentityAddressResolution),
            default_execution_options: ExecutionOptions::default()
                .with_consistency(Consistency::default())
                .with_timeout(Duration::from_secs(12))
                .with_tracing(false),
            used_keyspace: None,
            keyspace_case_sensitive: false,
            authenticator: None,
            topology_refresh_interval: Duration::from_secs(60),
            automatic_schema_agreement: true,
            schema_agreement_interval: Duration::from_millis(200),
            schema_agreement_timeout: Duration::from_secs(10),
        }
    }

    /// Adds a known database server with a hostname.
    /// If the port is not explicitly specified, 9042 is used as default
    pub fn add_known_node(&mut self, hostname: impl AsRef<str>) {
        self.known_nodes
            .push(KnownNode::Hostname(hostname.as_ref().to_string()));
    }

    /// Adds a known database server with an IP address
    pub fn add_known_node_addr(&mut self, node_addr: SocketAddr) {
        self.known_nodes.push(KnownNode::Address(node_addr));
    }

    /// Adds a list of known database server with hostnames.
    /// If the port is not explicitly specified, 9042 is used as default
    pub fn add_known_nodes(&mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) {
        for hostname in hostnames {
            self.add_known_node(hostname);
        }
    }

    /// Adds a list of known database servers with IP addresses
    pub fn add_known_nodes_addr(
        &mut self,
        node_addrs: impl IntoIterator<Item = impl Borrow<SocketAddr>>,
    ) {
        for address in node_addrs {
            self.add_known_node_addr(*address.borrow());
        }
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            protocol_version: self.protocol_version,
            compression: self.compression,
            tcp_nodelay: self.tcp_nodelay,
            tcp_keepalive_interval: self.tcp_keepalive_interval,
            connect_timeout: self.connect_timeout,
            stream_capacity: self.stream_capacity,
            authenticator: self.authenticator.clone(),
            event_sender: None,
            heartbeat_interval: self.heartbeat_interval,
            idle_timeout: self.idle_timeout,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::new()
    }
}

// Where a request currently is, reported in its trace span.
#[derive(Debug, Clone, Copy)]
enum RequestStage {
    AwaitingConnection,
    AwaitingKeyspaceSwitch,
    AwaitingPrepare,
    AwaitingResponse,
    Done,
}

// What a failed attempt means for the rest of the request.
enum AttemptError {
    // No response came from the host; the next host of the plan is tried.
    Transport(RequestAttemptError),
    // Handed to the retry policy.
    Server(DbError, String),
    // Fails the request as is.
    Fatal(ExecutionError),
}

impl From<RequestAttemptError> for AttemptError {
    fn from(error: RequestAttemptError) -> Self {
        match error {
            error if error.is_transport() => AttemptError::Transport(error),
            RequestAttemptError::DbError(error, message) => AttemptError::Server(error, message),
            RequestAttemptError::UnableToSerialize(error) => {
                AttemptError::Fatal(ExecutionError::BadQuery(error.into()))
            }
            error => AttemptError::Fatal(ExecutionError::ProtocolError(error)),
        }
    }
}

impl From<UseKeyspaceError> for AttemptError {
    fn from(error: UseKeyspaceError) -> Self {
        match error {
            UseKeyspaceError::RequestError(error) if error.is_transport() => {
                AttemptError::Transport(error)
            }
            error => AttemptError::Fatal(error.into()),
        }
    }
}

impl AttemptError {
    fn preparing(statement: &str, error: RequestAttemptError) -> Self {
        if error.is_transport() {
            return AttemptError::Transport(error);
        }
        AttemptError::Fatal(ExecutionError::PrepareError(PrepareError {
            statement: statement.to_owned(),
            error,
        }))
    }
}

// `None` stands for an error the retry policy chose to ignore.
type RequestOutcome = (Option<NonErrorQueryResponse>, ExecutionInfo);

type SharedPrepare = Shared<BoxFuture<'static, Result<Bytes, RequestAttemptError>>>;

/// `Dispatcher` manages connections to the cluster and allows to perform requests.
///
/// Every request walks a plan of the load balancing policy, moving to the next host when
/// one cannot be reached. Once built, the dispatcher keeps itself in sync with the
/// cluster: hosts that come up get a connection pool, hosts that go down lose theirs.
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    connection_config: ConnectionConfig,
    pool_size: PoolSize,
    load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    retry_policy: Arc<dyn RetryPolicy>,
    reconnection_policy: Arc<dyn ReconnectionPolicy>,
    default_execution_options: ExecutionOptions,

    registry: Arc<HostRegistry>,
    pools: StdMutex<HashMap<SocketAddr, Arc<NodeConnectionPool>>>,
    // Hosts a pool is being opened for. Dropping the handle stops the attempts.
    connecting: StdMutex<HashMap<SocketAddr, (u64, RemoteHandle<()>)>>,
    next_connecting_id: AtomicU64,
    // Statement text to id, per host.
    prepared: DashMap<SocketAddr, HashMap<String, Bytes>>,
    // PREPAREs in flight, so that concurrent requests for one statement share them.
    preparing: DashMap<(SocketAddr, String), SharedPrepare>,
    keyspace: ArcSwapOption<VerifiedKeyspaceName>,

    automatic_schema_agreement: bool,
    schema_agreement_interval: Duration,
    schema_agreement_timeout: Duration,

    broken_sender: mpsc::UnboundedSender<PoolBroken>,
    runtime: Handle,
    closed: AtomicBool,

    control_connection: StdMutex<Option<ControlConnection>>,
    background: StdMutex<Vec<RemoteHandle<()>>>,
    listener_ids: StdMutex<Vec<ListenerId>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hosts = lock(&self.inner.pools).keys().copied().collect::<Vec<_>>();
        f.debug_struct("Dispatcher")
            .field("protocol_version", &self.protocol_version())
            .field("keyspace", &self.keyspace())
            .field("connected_hosts", &hosts)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// Feeds registry notifications into the pool lifecycle.
struct DispatcherListener {
    inner: Weak<DispatcherInner>,
}

impl HostListener for DispatcherListener {
    fn on_event(&self, host: &Arc<Host>, event: HostEvent) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if inner.is_closed() {
            return;
        }

        match event {
            HostEvent::Found => {}
            HostEvent::Up => inner.start_connecting(host, true),
            HostEvent::Down | HostEvent::Lost => inner.disconnect(host.address()),
        }
    }
}

impl Dispatcher {
    /// Estabilishes a CQL connection with the database.
    ///
    /// Usually it's easier to use [`DispatcherBuilder`](super::DispatcherBuilder)
    /// instead of calling `Dispatcher::connect` directly.
    pub async fn connect(config: DispatcherConfig) -> Result<Self, NewDispatcherError> {
        let contact_points = resolve_contact_points(&config.known_nodes).await?;
        let keyspace = config
            .used_keyspace
            .clone()
            .map(|name| VerifiedKeyspaceName::new(name, config.keyspace_case_sensitive))
            .transpose()?;

        let registry = Arc::new(HostRegistry::new());
        // The policy must know a host before the dispatcher asks for its distance.
        let policy_listener = registry.add_listener(Arc::new(PolicyListener(
            config.load_balancing_policy.clone(),
        )));

        let control_config = ControlConnectionConfig {
            connection_config: config.connection_config(),
            reconnection_policy: config.reconnection_policy.clone(),
            address_resolution_policy: config.address_resolution_policy.clone(),
            refresh_interval: config.topology_refresh_interval,
        };
        let control_connection = ControlConnection::bootstrap(
            &contact_points,
            control_config,
            registry.clone(),
            config.load_balancing_policy.clone(),
        )
        .await?;

        let connection_config = ConnectionConfig {
            protocol_version: control_connection.protocol_version(),
            ..config.connection_config()
        };

        let (broken_sender, broken_receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(DispatcherInner {
            connection_config,
            pool_size: config.pool_size,
            load_balancing_policy: config.load_balancing_policy,
            retry_policy: config.retry_policy,
            reconnection_policy: config.reconnection_policy,
            default_execution_options: config.default_execution_options,
            registry: registry.clone(),
            pools: StdMutex::new(HashMap::new()),
            connecting: StdMutex::new(HashMap::new()),
            next_connecting_id: AtomicU64::new(0),
            prepared: DashMap::new(),
            preparing: DashMap::new(),
            keyspace: ArcSwapOption::new(keyspace.map(Arc::new)),
            automatic_schema_agreement: config.automatic_schema_agreement,
            schema_agreement_interval: config.schema_agreement_interval,
            schema_agreement_timeout: config.schema_agreement_timeout,
            broken_sender,
            runtime: Handle::current(),
            closed: AtomicBool::new(false),
            control_connection: StdMutex::new(Some(control_connection)),
            background: StdMutex::new(Vec::new()),
            listener_ids: StdMutex::new(vec![policy_listener]),
        });

        let (watcher, watcher_handle) =
            DispatcherInner::watch_broken_pools(Arc::downgrade(&inner), broken_receiver)
                .remote_handle();
        inner.runtime.spawn(watcher);
        lock(&inner.background).push(watcher_handle);

        let listener = registry.add_listener(Arc::new(DispatcherListener {
            inner: Arc::downgrade(&inner),
        }));
        lock(&inner.listener_ids).push(listener);

        if let Err(error) = inner.open_initial_pools().await {
            inner.close();
            return Err(error.into());
        }

        info!(
            version = %inner.connection_config.protocol_version,
            hosts = lock(&inner.pools).len(),
            "Dispatcher connected"
        );
        Ok(Dispatcher { inner })
    }

    /// Sends a request to the database and receives a response.
    ///
    /// The statement is sent as text, so it is parsed by the server on every execution.
    /// Statements executed more than once should be [prepared](Self::prepare) instead.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use quorum::Dispatcher;
    /// # async fn example(dispatcher: &Dispatcher) -> Result<(), Box<dyn std::error::Error>> {
    /// use quorum::statement::Statement;
    /// use quorum::Consistency;
    ///
    /// dispatcher
    ///     .query(Statement::new("INSERT INTO ks.tab (a) VALUES (1)").with_consistency(Consistency::One))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn query(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<QueryResult, ExecutionError> {
        let statement = statement.into();
        let options = statement
            .options
            .or(&self.inner.default_execution_options);
        let inner = &self.inner;

        let outcome = inner
            .run_request(Some(&statement.cql), &options, |connection, _, consistency| {
                inner.query_on(connection, &statement, &options, consistency)
            })
            .await?;

        Ok(into_query_result(outcome))
    }

    /// Prepares a statement on the server side and returns a prepared statement,
    /// which can later be used to perform more efficient requests.
    ///
    /// The statement is prepared on a single host; every other host prepares it
    /// the first time it is asked to execute it.
    pub async fn prepare(&self, cql: impl Into<String>) -> Result<PreparedStatement, ExecutionError> {
        let cql = cql.into();
        let options = self.inner.default_execution_options.clone();
        let inner = &self.inner;

        let (response, _) = inner
            .run_request(Some(&cql), &options, |connection, address, _| {
                inner.prepare_statement_on(connection, address, &cql)
            })
            .await?;

        match response.map(|response| response.result) {
            Some(result::Result::Prepared(prepared)) => Ok(PreparedStatement::new(
                cql,
                prepared.id,
                prepared.prepared_metadata,
                prepared.result_metadata,
            )),
            _ => Err(ExecutionError::ProtocolError(
                RequestAttemptError::UnexpectedResponse(ResponseOpcode::Result),
            )),
        }
    }

    /// Executes a prepared statement with the given values.
    ///
    /// Hosts that do not know the statement yet are asked to prepare it first. A host that
    /// forgot it (e.g. after a restart) answers UNPREPARED; the statement is then prepared
    /// again and sent once more to the same host.
    pub async fn execute(
        &self,
        prepared: &PreparedStatement,
        values: SerializedValues,
    ) -> Result<QueryResult, ExecutionError> {
        let options = prepared.options.or(&self.inner.default_execution_options);
        let inner = &self.inner;

        let outcome = inner
            .run_request(Some(prepared.cql()), &options, |connection, address, consistency| {
                inner.execute_on(connection, address, prepared, &values, &options, consistency)
            })
            .await?;

        Ok(into_query_result(outcome))
    }

    /// Performs a batch request.
    ///
    /// Prepared statements of the batch that the chosen host does not know yet are prepared
    /// on it concurrently before the batch is sent.
    pub async fn batch(&self, batch: &Batch) -> Result<QueryResult, ExecutionError> {
        let options = batch.options.or(&self.inner.default_execution_options);
        let inner = &self.inner;

        let outcome = inner
            .run_request(None, &options, |connection, address, consistency| {
                inner.batch_on(connection, address, batch, &options, consistency)
            })
            .await?;

        Ok(into_query_result(outcome))
    }

    /// Sends `USE <keyspace_name>` and makes it the keyspace of every following request.
    ///
    /// Connections are switched lazily, right before they are used.
    ///
    /// # Arguments
    ///
    /// * `keyspace_name` - keyspace name to use,
    ///   keyspace names can have up to 48 alphanumeric characters and contain underscores
    /// * `case_sensitive` - if set to true the generated statement will put keyspace name in quotes
    pub async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), ExecutionError> {
        let keyspace = VerifiedKeyspaceName::new(keyspace_name.into(), case_sensitive)
            .map_err(UseKeyspaceError::from)?;

        // The SET_KEYSPACE result switches the target keyspace.
        self.query(keyspace.use_statement()).await?;
        Ok(())
    }

    /// The keyspace requests currently run in.
    pub fn keyspace(&self) -> Option<String> {
        self.inner
            .keyspace
            .load()
            .as_deref()
            .map(|keyspace| keyspace.as_str().to_owned())
    }

    /// Hosts known to the dispatcher.
    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.inner.registry
    }

    /// The protocol version negotiated with the cluster.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.inner.connection_config.protocol_version
    }

    /// Reads the schema version of every host with an open pool.
    /// Returns it if they all report the same one.
    pub async fn check_schema_agreement(&self) -> Result<Option<Uuid>, SchemaAgreementError> {
        self.inner.check_schema_agreement().await
    }

    /// Waits until every host with an open pool reports the same schema version.
    ///
    /// Versions are read every [`DispatcherConfig::schema_agreement_interval`]; after
    /// [`DispatcherConfig::schema_agreement_timeout`] this fails with
    /// [`SchemaAgreementError::Timeout`].
    pub async fn await_schema_agreement(&self) -> Result<Uuid, SchemaAgreementError> {
        self.inner.await_schema_agreement().await
    }

    /// Stops the control connection and closes every pool.
    ///
    /// Requests in flight fail; later requests fail with [`ExecutionError::Closed`].
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl DispatcherInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Runs a request along a plan of the load balancing policy.
    ///
    /// `run_request_once` sends the request on a connection that already uses the target
    /// keyspace. Transport failures move on to the next host; server errors go through the
    /// retry policy, whose retries stay on the same host.
    async fn run_request<'a, F, Fut>(
        &'a self,
        statement: Option<&'a str>,
        options: &'a ExecutionOptions,
        run_request_once: F,
    ) -> Result<RequestOutcome, ExecutionError>
    where
        F: Fn(Arc<Connection>, SocketAddr, Consistency) -> Fut,
        Fut: Future<Output = Result<NonErrorQueryResponse, AttemptError>>,
    {
        if self.is_closed() {
            return Err(ExecutionError::Closed);
        }

        let keyspace = self.keyspace.load_full();
        let routing = RoutingInfo {
            keyspace: keyspace.as_deref().map(VerifiedKeyspaceName::as_str),
            statement,
            consistency: options.determine_consistency(),
            serial_consistency: options.serial_consistency,
        };

        let runner = async {
            let mut consistency = routing.consistency;
            let mut retries = 0;
            let mut attempts = 0;
            let mut hosts_tried = Vec::new();
            let mut errors = HashMap::new();

            'nodes_in_plan: for host in self.load_balancing_policy.plan(&routing) {
                let address = host.address();
                let span = trace_span!("Executing request", node = %address);
                hosts_tried.push(address);

                'same_node_retries: loop {
                    trace!(parent: &span, stage = ?RequestStage::AwaitingConnection);
                    let connection = match self.connection_for(address) {
                        Ok(connection) => connection,
                        Err(error) => {
                            trace!(parent: &span, error = %error, "Choosing connection failed");
                            errors.insert(address, error);
                            continue 'nodes_in_plan;
                        }
                    };
                    attempts += 1;

                    let attempt = async {
                        if let Some(keyspace) = &keyspace {
                            if !connection.is_keyspace_current(keyspace) {
                                trace!(stage = ?RequestStage::AwaitingKeyspaceSwitch);
                                connection.use_keyspace(keyspace).await?;
                            }
                        }
                        run_request_once(connection, address, consistency).await
                    }
                    .instrument(span.clone())
                    .await;

                    let info = |hosts_tried: Vec<SocketAddr>, trace_id| ExecutionInfo {
                        hosts_tried,
                        consistency,
                        attempts,
                        trace_id,
                    };

                    match attempt {
                        Ok(response) => {
                            trace!(parent: &span, stage = ?RequestStage::Done, "Request succeeded");
                            let info = info(hosts_tried, response.trace_id);
                            return Ok((Some(response), info));
                        }
                        Err(AttemptError::Transport(error)) => {
                            trace!(parent: &span, last_error = %error, "Request failed");
                            if self.is_closed() {
                                return Err(ExecutionError::Closed);
                            }
                            errors.insert(address, error);
                            continue 'nodes_in_plan;
                        }
                        Err(AttemptError::Server(error, message)) => {
                            let request = RequestInfo {
                                statement,
                                consistency,
                                retries,
                            };
                            let decision = decide(&*self.retry_policy, &error, &request);
                            trace!(parent: &span, error = %error, retry_decision = ?decision);

                            match decision {
                                Some(RetryDecision::Retry(new_consistency)) => {
                                    retries += 1;
                                    consistency = new_consistency;
                                    continue 'same_node_retries;
                                }
                                Some(RetryDecision::Ignore) => {
                                    return Ok((None, info(hosts_tried, None)));
                                }
                                Some(RetryDecision::Rethrow) | None => {
                                    return Err(ExecutionError::DbError(error, message));
                                }
                            }
                        }
                        Err(AttemptError::Fatal(error)) => return Err(error),
                    }
                }
            }

            if hosts_tried.is_empty() {
                return Err(ExecutionError::EmptyPlan);
            }
            Err(NoHostsAvailable { errors }.into())
        };

        let result = match options.determine_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, runner).await.unwrap_or_else(
                |_: tokio::time::error::Elapsed| Err(ExecutionError::RequestTimeout(timeout)),
            ),
            None => runner.await,
        };

        if let Ok((Some(response), _)) = &result {
            if let Some(set_keyspace) = response.as_set_keyspace() {
                self.set_target_keyspace(&set_keyspace.keyspace_name);
            }
            if response.as_schema_change().is_some() && self.automatic_schema_agreement {
                // The change itself succeeded, so it is reported even without agreement.
                match self.await_schema_agreement().await {
                    Ok(version) => debug!(%version, "Hosts agree on the new schema"),
                    Err(error) => warn!("Hosts did not agree on a schema change: {}", error),
                }
            }
        }
        result
    }

    async fn query_on(
        &self,
        connection: Arc<Connection>,
        statement: &Statement,
        options: &ExecutionOptions,
        consistency: Consistency,
    ) -> Result<NonErrorQueryResponse, AttemptError> {
        let query = Query::new(
            statement.cql.as_str(),
            query_parameters(options, consistency, &statement.values),
        );
        trace!(stage = ?RequestStage::AwaitingResponse, "Sending query");
        let response = connection
            .send_request(&query, true, options.tracing.unwrap_or(false))
            .await?
            .into_non_error_query_response()?;
        Ok(response)
    }

    async fn prepare_statement_on(
        &self,
        connection: Arc<Connection>,
        address: SocketAddr,
        cql: &str,
    ) -> Result<NonErrorQueryResponse, AttemptError> {
        trace!(stage = ?RequestStage::AwaitingPrepare, "Preparing statement");
        let request = Prepare {
            query: Cow::Borrowed(cql),
        };
        let response = match connection.send_request(&request, true, false).await {
            Ok(response) => response.into_non_error_query_response(),
            Err(error) => Err(error),
        }
        .map_err(|error| AttemptError::preparing(cql, error))?;

        if let result::Result::Prepared(prepared) = &response.result {
            self.remember_prepared(address, cql, prepared.id.clone());
        }
        Ok(response)
    }

    async fn execute_on(
        &self,
        connection: Arc<Connection>,
        address: SocketAddr,
        prepared: &PreparedStatement,
        values: &SerializedValues,
        options: &ExecutionOptions,
        consistency: Consistency,
    ) -> Result<NonErrorQueryResponse, AttemptError> {
        let tracing = options.tracing.unwrap_or(false);
        let execute = |id: Bytes| Execute {
            id,
            parameters: query_parameters(options, consistency, values),
        };

        let id = self
            .prepared_id_on(&connection, address, prepared.cql())
            .await?;
        trace!(stage = ?RequestStage::AwaitingResponse, "Sending execution");
        let response = connection
            .send_request(&execute(id), true, tracing)
            .await?
            .into_non_error_query_response();

        let response = match response {
            Err(RequestAttemptError::DbError(DbError::Unprepared { statement_id }, _)) => {
                let id = self
                    .reprepare_on(&connection, address, prepared.cql(), &statement_id)
                    .await?;
                connection
                    .send_request(&execute(id), true, tracing)
                    .await?
                    .into_non_error_query_response()?
            }
            response => response?,
        };
        Ok(response)
    }

    async fn batch_on(
        &self,
        connection: Arc<Connection>,
        address: SocketAddr,
        batch: &Batch,
        options: &ExecutionOptions,
        consistency: Consistency,
    ) -> Result<NonErrorQueryResponse, AttemptError> {
        let tracing = options.tracing.unwrap_or(false);
        let mut ids = self.batch_ids_on(&connection, address, batch).await?;

        trace!(
            stage = ?RequestStage::AwaitingResponse,
            statements = batch.len(),
            "Sending batch"
        );
        let request = batch_request(batch, &ids, options, consistency);
        let response = connection
            .send_request(&request, true, tracing)
            .await?
            .into_non_error_query_response();

        let (statement_id, message) = match response {
            Err(RequestAttemptError::DbError(DbError::Unprepared { statement_id }, message)) => {
                (statement_id, message)
            }
            response => return Ok(response?),
        };

        let forgotten = ids
            .iter()
            .find(|(_, id)| **id == statement_id)
            .map(|(cql, _)| *cql);
        let Some(cql) = forgotten else {
            return Err(AttemptError::Server(
                DbError::Unprepared { statement_id },
                message,
            ));
        };
        let id = self
            .reprepare_on(&connection, address, cql, &statement_id)
            .await?;
        ids.insert(cql, id);

        let request = batch_request(batch, &ids, options, consistency);
        Ok(connection
            .send_request(&request, true, tracing)
            .await?
            .into_non_error_query_response()?)
    }

    fn connection_for(&self, address: SocketAddr) -> Result<Arc<Connection>, RequestAttemptError> {
        let pool = lock(&self.pools)
            .get(&address)
            .cloned()
            .ok_or(ConnectionPoolError::NotOpen)?;
        Ok(pool.random_connection()?)
    }

    fn set_target_keyspace(&self, name: &str) {
        // The server reports the name exactly as stored.
        match VerifiedKeyspaceName::new(name.to_owned(), true) {
            Ok(keyspace) => {
                debug!(keyspace = name, "Target keyspace changed");
                self.keyspace.store(Some(Arc::new(keyspace)));
            }
            Err(error) => warn!(keyspace = name, "Ignoring a keyspace switch: {}", error),
        }
    }

    fn cached_id(&self, address: SocketAddr, cql: &str) -> Option<Bytes> {
        self.prepared
            .get(&address)
            .and_then(|ids| ids.get(cql).cloned())
    }

    fn remember_prepared(&self, address: SocketAddr, cql: &str, id: Bytes) {
        self.prepared
            .entry(address)
            .or_default()
            .insert(cql.to_owned(), id);
    }

    // Requests preparing the same statement on the same host at once share one PREPARE.
    async fn prepare_on(
        &self,
        connection: &Arc<Connection>,
        address: SocketAddr,
        cql: &str,
    ) -> Result<Bytes, AttemptError> {
        trace!(stage = ?RequestStage::AwaitingPrepare, statement = cql, "Preparing statement on host");
        let key = (address, cql.to_owned());
        let preparing = self
            .preparing
            .entry(key.clone())
            .or_insert_with(|| {
                let connection = connection.clone();
                let cql = key.1.clone();
                async move { connection.prepare(&cql).await.map(|prepared| prepared.id) }
                    .boxed()
                    .shared()
            })
            .clone();

        let prepared = preparing.await;
        self.preparing
            .remove_if(&key, |_, preparing| preparing.peek().is_some());

        let id = prepared.map_err(|error| AttemptError::preparing(cql, error))?;
        self.remember_prepared(address, cql, id.clone());
        Ok(id)
    }

    // The id of `cql` on the host, preparing it there first if the host has not seen it.
    async fn prepared_id_on(
        &self,
        connection: &Arc<Connection>,
        address: SocketAddr,
        cql: &str,
    ) -> Result<Bytes, AttemptError> {
        match self.cached_id(address, cql) {
            Some(id) => Ok(id),
            None => self.prepare_on(connection, address, cql).await,
        }
    }

    async fn reprepare_on(
        &self,
        connection: &Arc<Connection>,
        address: SocketAddr,
        cql: &str,
        forgotten_id: &Bytes,
    ) -> Result<Bytes, AttemptError> {
        debug!(node = %address, statement = cql, "Host forgot a prepared statement, preparing it again");
        if let Some(mut ids) = self.prepared.get_mut(&address) {
            ids.remove(cql);
        }

        let id = self.prepare_on(connection, address, cql).await?;
        if id != *forgotten_id {
            return Err(RequestAttemptError::RepreparedIdChanged {
                statement: cql.to_owned(),
            }
            .into());
        }
        Ok(id)
    }

    // Ids of the prepared statements of `batch` on the host. The ones the host does not
    // know yet are prepared concurrently.
    async fn batch_ids_on<'b>(
        &self,
        connection: &Arc<Connection>,
        address: SocketAddr,
        batch: &'b Batch,
    ) -> Result<HashMap<&'b str, Bytes>, AttemptError> {
        let mut ids = HashMap::new();
        let mut missing = Vec::new();

        for (entry, _) in batch.entries() {
            let BatchEntry::Prepared(prepared) = entry else {
                continue;
            };
            let cql = prepared.cql();
            if ids.contains_key(cql) || missing.contains(&cql) {
                continue;
            }
            match self.cached_id(address, cql) {
                Some(id) => {
                    ids.insert(cql, id);
                }
                None => missing.push(cql),
            }
        }

        if !missing.is_empty() {
            trace!(
                stage = ?RequestStage::AwaitingPrepare,
                statements = missing.len(),
                "Preparing batch statements"
            );
            let prepared = try_join_all(
                missing
                    .iter()
                    .map(|cql| self.prepare_on(connection, address, cql)),
            )
            .await?;
            ids.extend(missing.into_iter().zip(prepared));
        }

        Ok(ids)
    }

    async fn check_schema_agreement(&self) -> Result<Option<Uuid>, SchemaAgreementError> {
        let connections = lock(&self.pools)
            .values()
            .filter_map(|pool| Some((pool.address(), pool.random_connection().ok()?)))
            .collect::<Vec<_>>();

        let versions = join_all(
            connections
                .iter()
                .map(|(_, connection)| read_schema_version(connection)),
        )
        .await;

        let mut read = Vec::with_capacity(versions.len());
        for ((address, _), version) in connections.iter().zip(versions) {
            match version {
                Ok(version) => read.push(version),
                // A host that lost its connection takes no part.
                Err(MetadataError::RequestError(error)) if error.is_transport() => {
                    debug!(node = %address, "Skipping host in schema agreement: {}", error);
                }
                Err(MetadataError::RequestError(error)) => return Err(error.into()),
                Err(error) => return Err(error.into()),
            }
        }

        if read.is_empty() {
            return Err(SchemaAgreementError::NoConnection);
        }
        trace!(versions = ?read, "Read schema versions");
        Ok(read.iter().all_equal_value().ok().copied())
    }

    async fn wait_for_schema_agreement(&self) -> Result<Uuid, SchemaAgreementError> {
        loop {
            if let Some(version) = self.check_schema_agreement().await? {
                return Ok(version);
            }
            tokio::time::sleep(self.schema_agreement_interval).await;
        }
    }

    async fn await_schema_agreement(&self) -> Result<Uuid, SchemaAgreementError> {
        let timeout = self.schema_agreement_timeout;
        tokio::time::timeout(timeout, self.wait_for_schema_agreement())
            .await
            .unwrap_or(Err(SchemaAgreementError::Timeout(timeout)))
    }

    async fn open_pool(
        &self,
        address: SocketAddr,
        size: usize,
    ) -> Result<NodeConnectionPool, ConnectionError> {
        NodeConnectionPool::open(
            address,
            size,
            &self.connection_config,
            self.reconnection_policy.clone(),
            self.broken_sender.clone(),
        )
        .await
    }

    // Returns false, closing `pool`, if the host already has one.
    fn install_pool(&self, pool: NodeConnectionPool) -> bool {
        let address = pool.address();
        let mut pools = lock(&self.pools);
        if pools.contains_key(&address) {
            drop(pools);
            pool.close();
            return false;
        }
        pools.insert(address, Arc::new(pool));
        debug!(node = %address, "Pool ready");
        true
    }

    async fn open_initial_pools(self: &Arc<Self>) -> Result<(), NoHostsAvailable> {
        let hosts = self
            .registry
            .up_hosts()
            .into_iter()
            .filter_map(|host| {
                let distance = self.load_balancing_policy.distance(&host);
                let size = self.pool_size.for_distance(distance)?;
                Some((host, size))
            })
            .collect::<Vec<_>>();

        let results = join_all(
            hosts
                .iter()
                .map(|(host, size)| self.open_pool(host.address(), *size)),
        )
        .await;

        let mut errors = HashMap::new();
        let mut opened = 0;
        for ((host, _), result) in hosts.iter().zip(results) {
            match result {
                Ok(pool) => {
                    self.install_pool(pool);
                    opened += 1;
                }
                Err(error) => {
                    warn!(node = %host.address(), "Failed to open a pool: {}", error);
                    errors.insert(
                        host.address(),
                        ConnectionPoolError::Broken {
                            last_connection_error: Box::new(error),
                        }
                        .into(),
                    );
                    self.start_connecting(host, false);
                }
            }
        }

        if opened == 0 {
            return Err(NoHostsAvailable { errors });
        }
        Ok(())
    }

    /// Opens a pool to `host` in the background, retrying along a reconnection schedule.
    /// Does nothing for ignored hosts, hosts that have a pool and hosts already connecting.
    fn start_connecting(self: &Arc<Self>, host: &Host, immediately: bool) {
        let distance = self.load_balancing_policy.distance(host);
        match self.pool_size.for_distance(distance) {
            Some(size) => self.spawn_connecting(host.address(), size, immediately, false),
            None => trace!(node = %host.address(), "Host is ignored, no pool opened"),
        }
    }

    // `revive` marks the host up once the pool is open.
    fn spawn_connecting(
        self: &Arc<Self>,
        address: SocketAddr,
        size: usize,
        immediately: bool,
        revive: bool,
    ) {
        if lock(&self.pools).contains_key(&address) {
            return;
        }

        let mut connecting = lock(&self.connecting);
        if connecting.contains_key(&address) {
            return;
        }
        let id = self.next_connecting_id.fetch_add(1, Ordering::Relaxed);
        let (task, handle) = Self::keep_connecting(
            Arc::downgrade(self),
            address,
            size,
            id,
            immediately,
            revive,
            self.reconnection_policy.schedule(),
        )
        .remote_handle();
        connecting.insert(address, (id, handle));
        drop(connecting);

        self.runtime.spawn(task);
    }

    async fn keep_connecting(
        inner: Weak<Self>,
        address: SocketAddr,
        size: usize,
        id: u64,
        immediately: bool,
        revive: bool,
        schedule: ReconnectionSchedule,
    ) {
        let open = || {
            let inner = inner.clone();
            async move {
                match inner.upgrade() {
                    Some(inner) => inner.open_pool(address, size).await,
                    None => Err(ConnectionError::BrokenConnection(
                        BrokenConnectionErrorKind::ClosedLocally.into(),
                    )),
                }
            }
        };

        let mut opened = None;
        if immediately {
            match open().await {
                Ok(pool) => opened = Some(pool),
                Err(error) => debug!(node = %address, "Failed to open a pool: {}", error),
            }
        }
        let pool = match opened {
            Some(pool) => pool,
            None => match reconnect_with_schedule(address, schedule, open).await {
                Ok(pool) => pool,
                Err(gave_up) => {
                    warn!(node = %address, "{}", gave_up);
                    if let Some(inner) = inner.upgrade() {
                        inner.abandon_connecting(address, id);
                    }
                    return;
                }
            },
        };

        let Some(inner) = inner.upgrade() else {
            pool.close();
            return;
        };
        inner.complete_connecting(pool, id, revive);
    }

    // Installs a pool opened by the attempt `id`. Returns false, closing `pool`, if the
    // attempt was called off in the meantime, which a host going down or leaving does.
    fn complete_connecting(&self, pool: NodeConnectionPool, id: u64, revive: bool) -> bool {
        let address = pool.address();
        let mut connecting = lock(&self.connecting);
        let current = matches!(connecting.get(&address), Some((current, _)) if *current == id);
        if !current || self.is_closed() {
            drop(connecting);
            debug!(node = %address, "Connecting was called off, closing the new pool");
            pool.close();
            return false;
        }

        // Installed under the lock, so a concurrent `disconnect` either calls the attempt
        // off or finds the pool to close.
        let finished = connecting.remove(&address);
        let installed = self.install_pool(pool);
        drop(connecting);
        // Dropping our own handle is fine: the task ends in this very poll.
        drop(finished);

        if installed && revive {
            self.registry.host_up(address);
        }
        installed
    }

    // Forgets the attempt `id` unless it was called off or replaced already.
    fn abandon_connecting(&self, address: SocketAddr, id: u64) {
        let mut connecting = lock(&self.connecting);
        if matches!(connecting.get(&address), Some((current, _)) if *current == id) {
            // Dropping our own handle is fine: the task ends in this very poll.
            let abandoned = connecting.remove(&address);
            drop(connecting);
            drop(abandoned);
        }
    }

    // Closes the pool of a host that went down or left, and forgets what it prepared.
    fn disconnect(&self, address: SocketAddr) {
        let cancelled = lock(&self.connecting).remove(&address);
        drop(cancelled);

        let pool = lock(&self.pools).remove(&address);
        if let Some(pool) = pool {
            pool.close();
        }
        self.preparing.retain(|(host, _), _| *host != address);
        if self.prepared.remove(&address).is_some() {
            trace!(node = %address, "Dropped the prepared statements of the host");
        }
    }

    async fn watch_broken_pools(
        inner: Weak<Self>,
        mut broken_receiver: mpsc::UnboundedReceiver<PoolBroken>,
    ) {
        while let Some(PoolBroken { address, error }) = broken_receiver.recv().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if inner.is_closed() {
                return;
            }
            // A replacement pool may already be in place.
            let broken = lock(&inner.pools)
                .get(&address)
                .is_some_and(|pool| pool.size() == 0);
            if !broken {
                continue;
            }

            warn!(node = %address, "Lost every connection to the host, marking it down: {}", error);
            // Policies ignore down hosts, so the size is taken while the host is still up.
            let size = inner
                .registry
                .host(address)
                .and_then(|host| {
                    let distance = inner.load_balancing_policy.distance(&host);
                    inner.pool_size.for_distance(distance)
                });
            inner.registry.host_down(address);
            inner.disconnect(address);
            if let Some(size) = size {
                inner.spawn_connecting(address, size, false, true);
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing the dispatcher");

        for id in std::mem::take(&mut *lock(&self.listener_ids)) {
            self.registry.remove_listener(id);
        }
        let control_connection = lock(&self.control_connection).take();
        drop(control_connection);
        let background = std::mem::take(&mut *lock(&self.background));
        drop(background);
        let connecting = std::mem::take(&mut *lock(&self.connecting));
        drop(connecting);

        let pools = std::mem::take(&mut *lock(&self.pools));
        for pool in pools.values() {
            pool.close();
        }
        self.prepared.clear();
        self.preparing.clear();
    }
}

fn query_parameters<'a>(
    options: &ExecutionOptions,
    consistency: Consistency,
    values: &'a SerializedValues,
) -> QueryParameters<'a> {
    QueryParameters {
        consistency,
        serial_consistency: options.serial_consistency,
        timestamp: None,
        page_size: options.page_size,
        paging_state: options.paging_state.clone(),
        values: Cow::Borrowed(values),
    }
}

fn batch_request<'a>(
    batch: &'a Batch,
    ids: &HashMap<&str, Bytes>,
    options: &ExecutionOptions,
    consistency: Consistency,
) -> BatchRequest<'a> {
    let statements = batch
        .entries()
        .map(|(entry, _)| match entry {
            BatchEntry::Statement { cql } => BatchStatement::Query {
                text: Cow::Borrowed(cql.as_str()),
            },
            BatchEntry::Prepared(prepared) => {
                let id = ids.get(prepared.cql()).unwrap_or(prepared.id());
                BatchStatement::Prepared {
                    id: Cow::Owned(id.to_vec()),
                }
            }
        })
        .collect();

    BatchRequest {
        statements,
        values: batch.entries().map(|(_, values)| values.clone()).collect(),
        batch_type: batch.batch_type,
        consistency,
        serial_consistency: options.serial_consistency,
        timestamp: None,
    }
}

fn into_query_result((response, info): RequestOutcome) -> QueryResult {
    match response {
        Some(response) => QueryResult::new(response.result.into(), response.warnings, info),
        None => QueryResult::new(ResultKind::Void, Vec::new(), info),
    }
}

async fn resolve_hostname(hostname: &str) -> Result<SocketAddr, std::io::Error> {
    // `lookup_host` wants "host:port"; a bare host gets the default port.
    let addrs = match lookup_host(hostname).await {
        Ok(addrs) => Either::Left(addrs),
        Err(error) => {
            let addrs = lookup_host((hostname, DEFAULT_PORT)).await.or(Err(error))?;
            Either::Right(addrs)
        }
    };

    addrs
        .find_or_last(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Empty address list returned by DNS for {hostname}"),
            )
        })
}

async fn resolve_contact_points(
    known_nodes: &[KnownNode],
) -> Result<Vec<SocketAddr>, NewDispatcherError> {
    if known_nodes.is_empty() {
        return Err(NewDispatcherError::EmptyKnownNodesList);
    }

    let resolved = join_all(known_nodes.iter().map(|node| async move {
        match node {
            KnownNode::Address(address) => Ok(*address),
            KnownNode::Hostname(hostname) => resolve_hostname(hostname)
                .await
                .map_err(|error| (hostname.clone(), error)),
        }
    }))
    .await;

    let mut contact_points = Vec::with_capacity(resolved.len());
    let mut failed = Vec::new();
    for result in resolved {
        match result {
            Ok(address) => contact_points.push(address),
            Err((hostname, error)) => {
                warn!(hostname = hostname.as_str(), "Failed to resolve a known node: {}", error);
                failed.push(hostname);
            }
        }
    }

    if contact_points.is_empty() {
        return Err(NewDispatcherError::FailedToResolveAnyHostname(failed));
    }
    Ok(contact_points.into_iter().unique().collect())
}
