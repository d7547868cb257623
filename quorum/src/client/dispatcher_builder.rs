//! DispatcherBuilder provides an easy way to create new Dispatchers

use super::dispatcher::{Dispatcher, DispatcherConfig};
use super::Compression;
use crate::authentication::{AuthenticatorProvider, PlainTextAuthenticator};
use crate::errors::NewDispatcherError;
use crate::network::PoolSize;
use crate::policies::address_resolution::AddressResolutionPolicy;
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::reconnection::ReconnectionPolicy;
use crate::policies::retry::RetryPolicy;
use crate::statement::ExecutionOptions;
use crate::ProtocolVersion;
use std::borrow::Borrow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// DispatcherBuilder is used to create new Dispatcher instances
/// # Example
///
/// ```
/// # use quorum::{Dispatcher, DispatcherBuilder};
/// # use quorum::client::Compression;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dispatcher: Dispatcher = DispatcherBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .compression(Some(Compression::Snappy))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DispatcherBuilder {
    pub config: DispatcherConfig,
}

impl DispatcherBuilder {
    /// Creates new DispatcherBuilder with default configuration
    /// # Default configuration
    /// * Compression: None
    ///
    pub fn new() -> Self {
        DispatcherBuilder {
            config: DispatcherConfig::new(),
        }
    }

    /// Add a known node with a hostname
    /// # Examples
    /// ```
    /// # use quorum::{Dispatcher, DispatcherBuilder};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let dispatcher: Dispatcher = DispatcherBuilder::new().known_node("127.0.0.1:9042").build().await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// ```
    /// # use quorum::{Dispatcher, DispatcherBuilder};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let dispatcher: Dispatcher = DispatcherBuilder::new().known_node("db1.example.com").build().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config.add_known_node(hostname);
        self
    }

    /// Add a known node with an IP address
    /// # Example
    /// ```
    /// # use quorum::{Dispatcher, DispatcherBuilder};
    /// # use std::net::{SocketAddr, IpAddr, Ipv4Addr};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let dispatcher: Dispatcher = DispatcherBuilder::new()
    ///     .known_node_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9042))
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn known_node_addr(mut self, node_addr: SocketAddr) -> Self {
        self.config.add_known_node_addr(node_addr);
        self
    }

    /// Add a list of known nodes with hostnames
    pub fn known_nodes(mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        self.config.add_known_nodes(hostnames);
        self
    }

    /// Add a list of known nodes with IP addresses
    pub fn known_nodes_addr(
        mut self,
        node_addrs: impl IntoIterator<Item = impl Borrow<SocketAddr>>,
    ) -> Self {
        self.config.add_known_nodes_addr(node_addrs);
        self
    }

    /// Set username and password for plain text authentication.\
    /// If the database server will require authentication\
    ///
    /// # Example
    /// ```
    /// # use quorum::{Dispatcher, DispatcherBuilder};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let dispatcher: Dispatcher = DispatcherBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .user("cassandra", "cassandra")
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn user(mut self, username: impl Into<String>, passwd: impl Into<String>) -> Self {
        self.config.authenticator = Some(Arc::new(PlainTextAuthenticator::new(
            username.into(),
            passwd.into(),
        )));
        self
    }

    /// Set custom authenticator provider to create an authenticator instance during
    /// connection setup.
    pub fn authenticator_provider(
        mut self,
        authenticator_provider: Arc<dyn AuthenticatorProvider>,
    ) -> Self {
        self.config.authenticator = Some(authenticator_provider);
        self
    }

    /// Set preferred Compression algorithm.
    /// The default is no compression.
    /// If it is not supported by database server Dispatcher will fall back to no compression.
    ///
    /// # Example
    /// ```
    /// # use quorum::{Dispatcher, DispatcherBuilder};
    /// # use quorum::client::Compression;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let dispatcher: Dispatcher = DispatcherBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .compression(Some(Compression::Lz4))
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compression = compression;
        self
    }

    /// Set the nodelay TCP flag.
    /// The default is true.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// Set the TCP keepalive interval.
    /// The default is `None`, which leaves keepalive disabled.
    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Changes connection timeout
    /// The default is 10 seconds.
    /// If it's higher than underlying os's default connection timeout it won't effect.
    ///
    /// # Example
    /// ```
    /// # use quorum::{Dispatcher, DispatcherBuilder};
    /// # use std::time::Duration;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let dispatcher: Dispatcher = DispatcherBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .connection_timeout(Duration::from_secs(30))
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connect_timeout = duration;
        self
    }

    /// Sets how often an idle connection is checked with an OPTIONS request.
    /// The default is 30 seconds; `None` disables heartbeats.
    pub fn heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Sets how long a connection may receive nothing before it is considered broken.
    /// The default is 60 seconds; `None` disables the check.
    ///
    /// With heartbeats enabled, the timeout should be longer than their interval.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Sets how many requests a single connection carries at once.
    /// The default is 128.
    pub fn stream_capacity(mut self, capacity: usize) -> Self {
        self.config.stream_capacity = capacity;
        self
    }

    /// Sets the per-node connection pool size.
    /// The default is two connections per local node and one per remote node.
    ///
    /// # Example
    /// ```
    /// # use quorum::{Dispatcher, DispatcherBuilder};
    /// # use quorum::client::PoolSize;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let dispatcher: Dispatcher = DispatcherBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .pool_size(PoolSize { local: 4, remote: 1 })
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn pool_size(mut self, size: PoolSize) -> Self {
        self.config.pool_size = size;
        self
    }

    /// Sets the load balancing policy.
    /// The default is a round robin over every host that is up.
    ///
    /// # Example
    /// ```
    /// # use quorum::{Dispatcher, DispatcherBuilder};
    /// # use quorum::policies::load_balancing::DcAwareRoundRobinPolicy;
    /// # use std::sync::Arc;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let dispatcher: Dispatcher = DispatcherBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .load_balancing(Arc::new(DcAwareRoundRobinPolicy::new("dc1")))
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn load_balancing(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.config.load_balancing_policy = policy;
        self
    }

    /// Sets the retry policy.
    /// The default is [`DefaultRetryPolicy`](crate::policies::retry::DefaultRetryPolicy).
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Sets the policy spacing out attempts to reach hosts that went down.
    /// The default is an exponential backoff from half a second up to 30 seconds.
    pub fn reconnection_policy(mut self, policy: Arc<dyn ReconnectionPolicy>) -> Self {
        self.config.reconnection_policy = policy;
        self
    }

    /// Sets the policy mapping the addresses nodes advertise to reachable ones.
    /// The default connects to nodes at the address they advertise.
    ///
    /// # Example
    /// ```
    /// # use quorum::{Dispatcher, DispatcherBuilder};
    /// # use std::collections::HashMap;
    /// # use std::net::SocketAddr;
    /// # use std::sync::Arc;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let private: SocketAddr = "10.0.0.2:9042".parse()?;
    /// let public: SocketAddr = "203.0.113.2:9042".parse()?;
    /// let dispatcher: Dispatcher = DispatcherBuilder::new()
    ///     .known_node("203.0.113.1:9042")
    ///     .address_resolution(Arc::new(HashMap::from([(private, public)])))
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn address_resolution(mut self, policy: Arc<dyn AddressResolutionPolicy>) -> Self {
        self.config.address_resolution_policy = policy;
        self
    }

    /// Sets the highest protocol version to try.
    /// The default is [`ProtocolVersion::V4`]; older clusters are negotiated down from it.
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Sets the options used by requests that do not set their own.
    ///
    /// # Example
    /// ```
    /// # use quorum::{Dispatcher, DispatcherBuilder, ExecutionOptions, Consistency};
    /// # use std::time::Duration;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let options = ExecutionOptions::default()
    ///     .with_consistency(Consistency::One)
    ///     .with_timeout(Duration::from_secs(3));
    ///
    /// let dispatcher: Dispatcher = DispatcherBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .default_execution_options(options)
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn default_execution_options(mut self, options: ExecutionOptions) -> Self {
        self.config.default_execution_options = options;
        self
    }

    /// Set keyspace to be used on all connections.\
    /// Each connection will send `"USE <keyspace_name>"` before sending any requests.\
    /// This can be later changed with [`Dispatcher::use_keyspace`]
    ///
    /// # Example
    /// ```
    /// # use quorum::{Dispatcher, DispatcherBuilder};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let dispatcher: Dispatcher = DispatcherBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .use_keyspace("my_keyspace_name", false)
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn use_keyspace(mut self, keyspace_name: impl Into<String>, case_sensitive: bool) -> Self {
        self.config.used_keyspace = Some(keyspace_name.into());
        self.config.keyspace_case_sensitive = case_sensitive;
        self
    }

    /// Sets how often the topology is reread even without a change being announced.
    /// The default is 60 seconds.
    pub fn topology_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.topology_refresh_interval = interval;
        self
    }

    /// Sets whether requests that change the schema wait for the hosts to agree on it.
    /// The default is true.
    pub fn auto_await_schema_agreement(mut self, enabled: bool) -> Self {
        self.config.automatic_schema_agreement = enabled;
        self
    }

    /// Sets how often schema versions are read while waiting for agreement.
    /// The default is 200 milliseconds.
    pub fn schema_agreement_interval(mut self, interval: Duration) -> Self {
        self.config.schema_agreement_interval = interval;
        self
    }

    /// Sets how long to wait for schema agreement.
    /// The default is 10 seconds.
    pub fn schema_agreement_timeout(mut self, timeout: Duration) -> Self {
        self.config.schema_agreement_timeout = timeout;
        self
    }

    /// Builds the Dispatcher after setting all the options
    ///
    /// # Example
    /// ```
    /// # use quorum::{Dispatcher, DispatcherBuilder};
    /// # use quorum::client::Compression;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let dispatcher: Dispatcher = DispatcherBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .compression(Some(Compression::Snappy))
    ///     .build() // Turns DispatcherBuilder into Dispatcher
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn build(&self) -> Result<Dispatcher, NewDispatcherError> {
        Dispatcher::connect(self.config.clone()).await
    }
}

/// Creates a [`DispatcherBuilder`] with default configuration, same as [`DispatcherBuilder::new`]
impl Default for DispatcherBuilder {
    fn default() -> Self {
        DispatcherBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Compression, DispatcherBuilder};
    use crate::client::KnownNode;
    use crate::errors::NewDispatcherError;
    use crate::network::PoolSize;
    use crate::policies::address_resolution::AddressResolutionPolicy;
    use crate::policies::reconnection::ConstantReconnectionPolicy;
    use crate::statement::ExecutionOptions;
    use crate::utils::test_utils::setup_tracing;
    use crate::{Consistency, ProtocolVersion};
    use assert_matches::assert_matches;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn default_dispatcher_builder() {
        setup_tracing();
        let builder = DispatcherBuilder::new();

        assert!(builder.config.known_nodes.is_empty());
        assert_eq!(builder.config.compression, None);
        assert_eq!(builder.config.protocol_version, ProtocolVersion::V4);
        assert_eq!(builder.config.connect_timeout, Duration::from_secs(10));
        assert_eq!(builder.config.pool_size, PoolSize::default());
        assert_eq!(
            builder.config.heartbeat_interval,
            Some(Duration::from_secs(30))
        );
        assert_eq!(builder.config.idle_timeout, Some(Duration::from_secs(60)));
        assert!(builder.config.automatic_schema_agreement);
        assert_eq!(
            builder.config.schema_agreement_timeout,
            Duration::from_secs(10)
        );
        assert_eq!(
            builder.config.default_execution_options.timeout,
            Some(Duration::from_secs(12))
        );
        assert_eq!(
            builder.config.default_execution_options.consistency,
            Some(Consistency::LocalQuorum)
        );
    }

    #[test]
    fn add_known_node() {
        setup_tracing();
        let mut builder = DispatcherBuilder::new();

        builder = builder.known_node("test_hostname");

        assert_eq!(
            builder.config.known_nodes,
            vec![KnownNode::Hostname("test_hostname".into())]
        );
        assert_eq!(builder.config.compression, None);
    }

    #[test]
    fn add_known_nodes_addr() {
        setup_tracing();
        let mut builder = DispatcherBuilder::new();

        let addr1 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(172, 17, 0, 3)), 1357);
        let addr2 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(172, 17, 0, 4)), 9090);

        builder = builder.known_node_addr(addr1).known_nodes_addr([addr2]);

        assert_eq!(
            builder.config.known_nodes,
            vec![KnownNode::Address(addr1), KnownNode::Address(addr2)]
        );
    }

    #[test]
    fn compression() {
        setup_tracing();
        let mut builder = DispatcherBuilder::new();
        assert_eq!(builder.config.compression, None);

        builder = builder.compression(Some(Compression::Lz4));
        assert_eq!(builder.config.compression, Some(Compression::Lz4));

        builder = builder.compression(Some(Compression::Snappy));
        assert_eq!(builder.config.compression, Some(Compression::Snappy));

        builder = builder.compression(None);
        assert_eq!(builder.config.compression, None);
    }

    #[test]
    fn all_features() {
        setup_tracing();
        let builder = DispatcherBuilder::new()
            .known_node("hostname")
            .compression(Some(Compression::Snappy))
            .tcp_nodelay(false)
            .tcp_keepalive_interval(Duration::from_secs(30))
            .connection_timeout(Duration::from_secs(1))
            .heartbeat_interval(None)
            .idle_timeout(Some(Duration::from_secs(5)))
            .stream_capacity(16)
            .pool_size(PoolSize {
                local: 3,
                remote: 0,
            })
            .reconnection_policy(Arc::new(ConstantReconnectionPolicy::new(
                Duration::from_secs(2),
            )))
            .protocol_version(ProtocolVersion::V3)
            .default_execution_options(ExecutionOptions::default().with_page_size(100))
            .use_keyspace("ks", true)
            .topology_refresh_interval(Duration::from_secs(5))
            .auto_await_schema_agreement(false)
            .schema_agreement_interval(Duration::from_millis(50))
            .schema_agreement_timeout(Duration::from_secs(3));

        assert_eq!(builder.config.compression, Some(Compression::Snappy));
        assert!(!builder.config.tcp_nodelay);
        assert_eq!(
            builder.config.tcp_keepalive_interval,
            Some(Duration::from_secs(30))
        );
        assert_eq!(builder.config.connect_timeout, Duration::from_secs(1));
        assert_eq!(builder.config.heartbeat_interval, None);
        assert_eq!(builder.config.idle_timeout, Some(Duration::from_secs(5)));
        assert_eq!(builder.config.stream_capacity, 16);
        assert_eq!(builder.config.pool_size.local, 3);
        assert_eq!(builder.config.protocol_version, ProtocolVersion::V3);
        assert_eq!(builder.config.default_execution_options.page_size, Some(100));
        assert_eq!(builder.config.used_keyspace.as_deref(), Some("ks"));
        assert!(builder.config.keyspace_case_sensitive);
        assert_eq!(
            builder.config.topology_refresh_interval,
            Duration::from_secs(5)
        );
        assert!(!builder.config.automatic_schema_agreement);
        assert_eq!(
            builder.config.schema_agreement_interval,
            Duration::from_millis(50)
        );
        assert_eq!(
            builder.config.schema_agreement_timeout,
            Duration::from_secs(3)
        );
    }

    #[tokio::test]
    async fn address_resolution_rules_reach_the_config() {
        setup_tracing();
        let advertised: SocketAddr = "10.0.0.2:9042".parse().unwrap();
        let reachable: SocketAddr = "203.0.113.2:9042".parse().unwrap();
        let builder = DispatcherBuilder::new()
            .address_resolution(Arc::new(HashMap::from([(advertised, reachable)])));

        let policy = &builder.config.address_resolution_policy;
        assert_eq!(policy.resolve(advertised).await, reachable);
        assert_eq!(policy.resolve(reachable).await, reachable);
    }

    #[tokio::test]
    async fn building_without_known_nodes_fails() {
        setup_tracing();
        assert_matches!(
            DispatcherBuilder::new().build().await,
            Err(NewDispatcherError::EmptyKnownNodesList)
        );
    }

    #[tokio::test]
    async fn building_with_invalid_keyspace_fails() {
        setup_tracing();
        let res = DispatcherBuilder::new()
            .known_node_addr("127.0.0.1:9042".parse().unwrap())
            .use_keyspace("not a keyspace", false)
            .build()
            .await;
        assert_matches!(res, Err(NewDispatcherError::BadKeyspaceName(_)));
    }
}
