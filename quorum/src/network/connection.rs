use crate::authentication::AuthenticatorProvider;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError,
    ConnectionSetupRequestError, ConnectionSetupRequestErrorKind, CqlEventHandlingError,
    RequestAttemptError, UseKeyspaceError,
};
use crate::frame::frame_errors::FrameHeaderParseError;
use crate::frame::request::query::QueryParameters;
use crate::frame::request::{
    options, AuthResponse, Credentials, Options, Prepare, Query, Register, RequestOpcode,
    SerializableRequest, Startup,
};
use crate::frame::response::authenticate::Authenticate;
use crate::frame::response::event::Event;
use crate::frame::response::{result, Response, ResponseOpcode, Supported};
use crate::frame::server_event_type::EventType;
use crate::frame::{self, Compression, FrameParams, ProtocolVersion, SerializedRequest};
use crate::response::QueryResponse;
use crate::utils::lock;
use crate::Consistency;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures::future::{BoxFuture, RemoteHandle, Shared};
use futures::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

// The term "orphan" refers to stream ids that were allocated for a {request, response}
// that no one is waiting for anymore (the caller of `Connection::send_request` gave up).
// The server may still answer on such an id, so it stays taken until the late response
// arrives. A connection where more than half of the stream ids are held by orphans
// older than `OLD_AGE_ORPHAN_THRESHOLD` is shut down, and replaced by its pool.
const OLD_AGE_ORPHAN_THRESHOLD: Duration = Duration::from_secs(1);

/// Receives the error that broke a connection, at most once.
pub(crate) type ErrorReceiver = oneshot::Receiver<ConnectionError>;

type KeyspaceSwitch = Shared<BoxFuture<'static, Result<(), UseKeyspaceError>>>;

pub(crate) struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    router_handle: Arc<RouterHandle>,
    closer: StdMutex<Option<oneshot::Sender<()>>>,
    // The USE request in flight, shared by every caller that needs the same keyspace.
    pending_keyspace_switch: StdMutex<Option<(VerifiedKeyspaceName, KeyspaceSwitch)>>,
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,

    // Each request send by `Connection::send_request` needs a unique request id.
    // This field is a monotonic generator of such ids.
    request_id_generator: AtomicU64,
    // If a `Connection::send_request` is cancelled, it sends notification
    // about orphaning via the sender below.
    // Also, this sender is unbounded, because only unbounded channels support
    // pushing values in a synchronous way (without an `.await`), which is
    // needed for pushing values in `Drop` implementations.
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,

    version: ProtocolVersion,
    // Last keyspace reported by a SET_KEYSPACE result on this connection.
    current_keyspace: ArcSwapOption<String>,
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<TaskResponse, RequestAttemptError> {
        let serialized_request =
            SerializedRequest::make(request, self.version, compression, tracing)?;
        let request_id = self.allocate_request_id();

        let (response_sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender,
            request_id,
        };

        // Dropping `notifier` (before calling `notifier.disable()`) will send a notification to
        // `Connection::router`. This notification is then used to mark a `stream_id` associated
        // with this request as orphaned, or to drop the request from the overflow queue.
        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler,
            })
            .await
            .map_err(|_| -> BrokenConnectionError {
                BrokenConnectionErrorKind::ChannelError.into()
            })?;

        let task_response = receiver.await.map_err(|_| -> BrokenConnectionError {
            BrokenConnectionErrorKind::ChannelError.into()
        })?;

        // Response was successfully received, so it's time to disable
        // notification about orphaning.
        notifier.disable();

        Ok(task_response?)
    }

    /// Sends the request and parses the response, tracking keyspace changes on the way.
    async fn request(
        &self,
        request: &impl SerializableRequest,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let task_response = self.send_request(request, compression, tracing).await?;

        if task_response.params.version != self.version {
            return Err(RequestAttemptError::UnexpectedProtocolVersion {
                expected: self.version,
                received: task_response.params.version,
            });
        }

        let response = Connection::parse_response(task_response, compression)?;
        if let Response::Result(result::Result::SetKeyspace(set_keyspace)) = &response.response {
            self.current_keyspace
                .store(Some(Arc::new(set_keyspace.keyspace_name.clone())));
        }

        Ok(response)
    }
}

/// Settings of a single connection.
#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) compression: Option<Compression>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    /// An OPTIONS request is sent on every tick, keeping idle connections busy.
    pub(crate) heartbeat_interval: Option<Duration>,
    /// The connection breaks when nothing has been read from it for this long.
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) connect_timeout: Duration,
    /// Upper bound on requests in flight; capped by what the protocol version can address.
    pub(crate) stream_capacity: usize,
    pub(crate) authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    /// Set for the control connection, which REGISTERs for server events.
    pub(crate) event_sender: Option<mpsc::Sender<Event>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::MAX,
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            heartbeat_interval: None,
            idle_timeout: None,
            connect_timeout: Duration::from_secs(10),
            stream_capacity: 128,
            authenticator: None,
            event_sender: None,
        }
    }
}

impl ConnectionConfig {
    fn stream_capacity(&self) -> usize {
        self.stream_capacity
            .clamp(1, self.protocol_version.stream_id_capacity())
    }
}

type RequestId = u64;

struct ResponseHandler {
    response_sender: oneshot::Sender<Result<TaskResponse, BrokenConnectionError>>,
    request_id: RequestId,
}

// Used to notify `Connection::orphaner` about `Connection::send_request`
// future being dropped before receiving response.
struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(
        request_id: RequestId,
        notification_sender: &'a mpsc::UnboundedSender<RequestId>,
    ) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connect_address", &self.connect_address)
            .field("protocol_version", &self.router_handle.version)
            .field("current_keyspace", &self.router_handle.current_keyspace.load_full())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Opens a TCP connection and starts the router on it.
    /// No frames are sent yet; see [`open_connection`] for the handshake.
    async fn new(
        connect_address: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream = match tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(connect_address),
        )
        .await
        {
            Ok(stream) => stream?,
            Err(_) => return Err(ConnectionError::ConnectTimeout),
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        Ok(Self::new_with_stream(stream, connect_address, config))
    }

    /// Starts the router on an already established byte stream.
    pub(crate) fn new_with_stream(
        stream: impl AsyncRead + AsyncWrite + Send + 'static,
        connect_address: SocketAddr,
        config: ConnectionConfig,
    ) -> (Self, ErrorReceiver) {
        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();
        // Unbounded because it allows for synchronous pushes
        let (orphan_notification_sender, orphan_notification_receiver) = mpsc::unbounded_channel();
        let (close_sender, close_receiver) = oneshot::channel();

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            request_id_generator: AtomicU64::new(0),
            orphan_notification_sender,
            version: config.protocol_version,
            current_keyspace: ArcSwapOption::empty(),
        });

        let (task, _worker_handle) = Self::router(
            config.clone(),
            Arc::downgrade(&router_handle),
            stream,
            receiver,
            error_sender,
            orphan_notification_receiver,
            close_receiver,
            connect_address,
        )
        .remote_handle();
        tokio::task::spawn(task);

        let connection = Connection {
            _worker_handle,
            connect_address,
            config,
            router_handle,
            closer: StdMutex::new(Some(close_sender)),
            pending_keyspace_switch: StdMutex::new(None),
        };

        (connection, error_receiver)
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // Our interval is the idle time before keepalives begin to be sent,
        // which socket2 calls "time"; its "interval" is the time between probes.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        #[cfg(any(
            target_os = "android",
            target_os = "freebsd",
            target_os = "linux",
            target_os = "macos",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        #[cfg(any(
            target_os = "android",
            target_os = "freebsd",
            target_os = "linux",
            target_os = "macos",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_retries(10);
        }

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    /// Performs OPTIONS/STARTUP, authentication and REGISTER.
    async fn handshake(&mut self) -> Result<(), ConnectionError> {
        let supported = self.get_options().await?;

        let mut options = HashMap::new();
        options.insert(
            Cow::Borrowed(options::CQL_VERSION),
            Cow::Borrowed(options::DEFAULT_CQL_PROTOCOL_VERSION),
        );

        if let Some(compression) = self.config.compression {
            if supported.supports_compression(compression) {
                options.insert(
                    Cow::Borrowed(options::COMPRESSION),
                    Cow::Borrowed(compression.as_str()),
                );
            } else {
                warn!(
                    node = %self.connect_address,
                    "Requested compression <{}> is not supported by the node. Falling back to no compression",
                    compression
                );
                self.config.compression = None;
            }
        }

        match self.setup_request(&Startup { options }).await? {
            Response::Ready => {}
            Response::Authenticate(authenticate) => {
                self.perform_authenticate(&authenticate).await?;
            }
            other => {
                return Err(ConnectionSetupRequestError::new(
                    RequestOpcode::Startup,
                    ConnectionSetupRequestErrorKind::UnexpectedResponse(other.opcode()),
                )
                .into())
            }
        }

        if self.config.event_sender.is_some() {
            self.register(EventType::ALL.to_vec()).await?;
        }

        Ok(())
    }

    // Sends a request that is part of the connection setup. Server errors are turned
    // into setup errors tagged with the request kind.
    async fn setup_request<R: SerializableRequest>(
        &self,
        request: &R,
    ) -> Result<Response, ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| ConnectionSetupRequestError::new(R::OPCODE, kind);

        let compression = match R::OPCODE {
            RequestOpcode::Options | RequestOpcode::Startup => None,
            _ => self.config.compression,
        };
        let response = self
            .router_handle
            .request(request, compression, false)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::Error(error) => Err(err(ConnectionSetupRequestErrorKind::DbError(
                error.error,
                error.reason,
            ))),
            other => Ok(other),
        }
    }

    async fn get_options(&self) -> Result<Supported, ConnectionSetupRequestError> {
        match self.setup_request(&Options).await? {
            Response::Supported(supported) => Ok(supported),
            other => Err(ConnectionSetupRequestError::new(
                RequestOpcode::Options,
                ConnectionSetupRequestErrorKind::UnexpectedResponse(other.opcode()),
            )),
        }
    }

    async fn perform_authenticate(
        &self,
        authenticate: &Authenticate,
    ) -> Result<(), ConnectionSetupRequestError> {
        let Some(authenticator_provider) = self.config.authenticator.as_ref() else {
            return Err(ConnectionSetupRequestError::new(
                RequestOpcode::Startup,
                ConnectionSetupRequestErrorKind::MissingAuthentication,
            ));
        };

        if !self.config.protocol_version.supports_sasl() {
            return self.send_credentials(authenticator_provider.as_ref()).await;
        }

        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(RequestOpcode::AuthResponse, kind)
        };

        let (mut response, mut auth_session) = authenticator_provider
            .start_authentication_session(&authenticate.authenticator_name)
            .await
            .map_err(|e| err(ConnectionSetupRequestErrorKind::StartAuthSessionError(e)))?;

        loop {
            match self.setup_request(&AuthResponse { response }).await? {
                Response::AuthChallenge(challenge) => {
                    response = auth_session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(|e| {
                            err(ConnectionSetupRequestErrorKind::AuthChallengeEvaluationError(e))
                        })?;
                }
                Response::AuthSuccess(success) => {
                    auth_session
                        .success(success.success_message.as_deref())
                        .await
                        .map_err(|e| err(ConnectionSetupRequestErrorKind::AuthFinishError(e)))?;
                    return Ok(());
                }
                other => {
                    return Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                        other.opcode(),
                    )))
                }
            }
        }
    }

    // Protocol v1 predates SASL; the server expects a single CREDENTIALS map.
    async fn send_credentials(
        &self,
        authenticator_provider: &dyn AuthenticatorProvider,
    ) -> Result<(), ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(RequestOpcode::Credentials, kind)
        };

        let credentials = authenticator_provider
            .credentials()
            .ok_or_else(|| err(ConnectionSetupRequestErrorKind::MissingAuthentication))?;

        match self.setup_request(&Credentials { credentials }).await? {
            Response::Ready => Ok(()),
            other => Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                other.opcode(),
            ))),
        }
    }

    async fn register(
        &self,
        event_types_to_register_for: Vec<EventType>,
    ) -> Result<(), ConnectionSetupRequestError> {
        let register_frame = Register {
            event_types_to_register_for,
        };

        match self.setup_request(&register_frame).await? {
            Response::Ready => Ok(()),
            other => Err(ConnectionSetupRequestError::new(
                RequestOpcode::Register,
                ConnectionSetupRequestErrorKind::UnexpectedResponse(other.opcode()),
            )),
        }
    }

    pub(crate) async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let compression = if compress {
            self.config.compression
        } else {
            None
        };

        self.router_handle
            .request(request, compression, tracing)
            .await
    }

    /// Prepares `cql` on this connection.
    pub(crate) async fn prepare(&self, cql: &str) -> Result<result::Prepared, RequestAttemptError> {
        let request = Prepare {
            query: Cow::Borrowed(cql),
        };
        match self
            .send_request(&request, true, false)
            .await?
            .into_non_error_query_response()?
            .result
        {
            result::Result::Prepared(prepared) => Ok(prepared),
            _ => Err(RequestAttemptError::UnexpectedResponse(
                ResponseOpcode::Result,
            )),
        }
    }

    /// Runs a driver-internal query without values at consistency ONE.
    pub(crate) async fn query_unpaged(
        &self,
        cql: &str,
    ) -> Result<result::Result, RequestAttemptError> {
        let query = Query::new(
            cql,
            QueryParameters {
                consistency: Consistency::One,
                ..Default::default()
            },
        );

        Ok(self
            .send_request(&query, true, false)
            .await?
            .into_non_error_query_response()?
            .result)
    }

    /// Switches this connection to `keyspace_name`, unless it already uses it.
    ///
    /// Concurrent callers asking for the same keyspace share a single USE request.
    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        if self.is_keyspace_current(keyspace_name) {
            return Ok(());
        }

        let switch = {
            let mut pending = lock(&self.pending_keyspace_switch);
            match pending.as_ref() {
                Some((keyspace, switch)) if keyspace == keyspace_name => switch.clone(),
                _ => {
                    let switch = Self::switch_keyspace(
                        self.router_handle.clone(),
                        self.config.compression,
                        keyspace_name.clone(),
                    )
                    .boxed()
                    .shared();
                    *pending = Some((keyspace_name.clone(), switch.clone()));
                    switch
                }
            }
        };

        let result = switch.await;

        let mut pending = lock(&self.pending_keyspace_switch);
        if pending
            .as_ref()
            .is_some_and(|(_, switch)| switch.peek().is_some())
        {
            *pending = None;
        }

        result
    }

    async fn switch_keyspace(
        router_handle: Arc<RouterHandle>,
        compression: Option<Compression>,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        // Trying to pass keyspace_name as bound value doesn't work
        // We have to send "USE " + keyspace_name
        let query = Query::new(keyspace_name.use_statement(), QueryParameters::default());
        debug!(keyspace = keyspace_name.as_str(), "Switching connection keyspace");

        let query_response = router_handle.request(&query, compression, false).await?;
        Self::verify_use_keyspace_result(&keyspace_name, query_response)
    }

    fn verify_use_keyspace_result(
        keyspace_name: &VerifiedKeyspaceName,
        query_response: QueryResponse,
    ) -> Result<(), UseKeyspaceError> {
        match query_response.response {
            Response::Result(result::Result::SetKeyspace(set_keyspace)) => {
                if !set_keyspace
                    .keyspace_name
                    .eq_ignore_ascii_case(keyspace_name.as_str())
                {
                    let expected_keyspace_name_lowercase = keyspace_name.as_str().to_lowercase();
                    let result_keyspace_name_lowercase = set_keyspace.keyspace_name.to_lowercase();

                    return Err(UseKeyspaceError::KeyspaceNameMismatch {
                        expected_keyspace_name_lowercase,
                        result_keyspace_name_lowercase,
                    });
                }

                Ok(())
            }
            Response::Error(err) => Err(UseKeyspaceError::RequestError(
                RequestAttemptError::DbError(err.error, err.reason),
            )),
            other => Err(UseKeyspaceError::RequestError(
                RequestAttemptError::UnexpectedResponse(other.opcode()),
            )),
        }
    }

    /// Whether the last SET_KEYSPACE seen on this connection names `keyspace_name`.
    pub(crate) fn is_keyspace_current(&self, keyspace_name: &VerifiedKeyspaceName) -> bool {
        let current = self.router_handle.current_keyspace.load();
        match current.as_deref() {
            Some(current) if keyspace_name.is_case_sensitive => {
                current.as_str() == keyspace_name.as_str()
            }
            Some(current) => current.eq_ignore_ascii_case(keyspace_name.as_str()),
            None => false,
        }
    }

    /// Closes the connection. Every pending request fails and the error receiver
    /// is notified. Calling it again does nothing.
    pub(crate) fn close(&self) {
        if let Some(closer) = lock(&self.closer).take() {
            debug!(node = %self.connect_address, "Closing connection");
            let _ = closer.send(());
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.router_handle.submit_channel.is_closed()
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    pub(crate) fn protocol_version(&self) -> ProtocolVersion {
        self.router_handle.version
    }

    fn parse_response(
        task_response: TaskResponse,
        compression: Option<Compression>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response = Response::deserialize(
            task_response.params.version,
            task_response.opcode,
            &mut &*body_with_ext.body,
        )?;

        Ok(QueryResponse {
            response,
            trace_id: body_with_ext.trace_id,
            warnings: body_with_ext.warnings,
        })
    }

    async fn router(
        config: ConnectionConfig,
        router_handle: Weak<RouterHandle>,
        stream: impl AsyncRead + AsyncWrite,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<ConnectionError>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        close_receiver: oneshot::Receiver<()>,
        node_address: SocketAddr,
    ) {
        let (read_half, write_half) = split(stream);
        // The handler map is shared between the reader, writer and orphaner futures, which
        // run on the same task and never hold the lock across an .await point.
        let handler_map = StdMutex::new(ResponseHandlerMap::new(config.stream_capacity()));
        // Signalled by the reader whenever a stream id becomes free, so that the writer
        // can move queued requests onto it.
        let slot_freed = Notify::new();
        let last_read = StdMutex::new(Instant::now());

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &handler_map,
            &slot_freed,
            &last_read,
            config.event_sender,
            config.compression,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &handler_map,
            &slot_freed,
            receiver,
        );
        let o = Self::orphaner(&handler_map, orphan_notification_receiver);
        let c = Self::closer(close_receiver);
        let h = Self::heartbeat(router_handle, config.heartbeat_interval, node_address);
        let i = Self::idle_watchdog(&last_read, config.idle_timeout, node_address);

        let result = futures::try_join!(r, w, o, c, h, i);

        let error: BrokenConnectionError = match result {
            Ok(_) => return, // Connection was dropped, we can return
            Err(err) => err,
        };
        debug!(node = %node_address, "Connection broken: {}", error);

        // Respond to all pending requests with the error, queued ones included
        let response_handlers = handler_map
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .into_pending();

        for handler in response_handlers {
            // Ignore sending error, request was dropped
            let _ = handler.response_sender.send(Err(error.clone()));
        }

        // If someone is listening for connection errors notify them
        let _ = error_sender.send(error.into());
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        slot_freed: &Notify,
        last_read: &StdMutex<Instant>,
        event_sender: Option<mpsc::Sender<Event>>,
        compression: Option<Compression>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = match frame::read_response_frame(&mut read_half).await {
                Ok(frame) => frame,
                Err(FrameHeaderParseError::HeaderIoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Err(BrokenConnectionErrorKind::ClosedByPeer.into());
                }
                Err(e) => return Err(BrokenConnectionErrorKind::FrameHeaderParseError(e).into()),
            };
            *lock(last_read) = Instant::now();
            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            match params.stream.cmp(&-1) {
                Ordering::Less => {
                    // Negative streams other than -1 are reserved, ignore them.
                    continue;
                }
                Ordering::Equal => {
                    if let Some(event_sender) = event_sender.as_ref() {
                        Self::handle_event(response, compression, event_sender)
                            .await
                            .map_err(BrokenConnectionErrorKind::EventHandlingError)?
                    }
                    continue;
                }
                _ => {}
            }

            let handler_lookup_res = lock(handler_map).lookup(params.stream);

            use HandlerLookupResult::*;
            match handler_lookup_res {
                Handler(handler) => {
                    // Don't care if sending of the response fails. This must
                    // mean that the receiver side was impatient and is not
                    // waiting for the result anymore.
                    let _ = handler.response_sender.send(Ok(response));
                    slot_freed.notify_one();
                }
                Orphaned => {
                    // The late answer to an abandoned request; its stream id is free again.
                    slot_freed.notify_one();
                }
                Missing => {
                    // Unsolicited frame. This should not happen and indicates
                    // a bug either in the driver, or in the database
                    debug!(
                        "Received response with unexpected StreamId {}",
                        params.stream
                    );
                    return Err(BrokenConnectionErrorKind::UnexpectedStreamId(params.stream).into());
                }
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        slot_freed: &Notify,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let mut num_requests = 0;
            let mut total_sent = 0;

            // Queued requests go first, in the order they were submitted.
            loop {
                let next = lock(handler_map).next_queued();
                let Some(request) = next else { break };
                total_sent += request.get_data().len();
                num_requests += 1;
                Self::write_request(&mut write_half, &request).await?;
            }

            while let Ok(task) = task_receiver.try_recv() {
                let assigned = lock(handler_map).submit(task);
                if let Some(request) = assigned {
                    total_sent += request.get_data().len();
                    num_requests += 1;
                    Self::write_request(&mut write_half, &request).await?;
                }
            }

            if num_requests > 0 {
                trace!("Sending {} requests; {} bytes", num_requests, total_sent);
                write_half
                    .flush()
                    .await
                    .map_err(BrokenConnectionErrorKind::WriteError)?;
            }

            tokio::select! {
                task = task_receiver.recv() => {
                    // When the Connection object is dropped, the sender half
                    // of the channel will be dropped and the writer is done.
                    let Some(task) = task else { return Ok(()) };
                    let assigned = lock(handler_map).submit(task);
                    if let Some(request) = assigned {
                        Self::write_request(&mut write_half, &request).await?;
                        write_half
                            .flush()
                            .await
                            .map_err(BrokenConnectionErrorKind::WriteError)?;
                    }
                }
                _ = slot_freed.notified() => {}
            }
        }
    }

    async fn write_request(
        write_half: &mut (impl AsyncWrite + Unpin),
        request: &SerializedRequest,
    ) -> Result<(), BrokenConnectionError> {
        write_half
            .write_all(request.get_data())
            .await
            .map_err(|e| BrokenConnectionErrorKind::WriteError(e).into())
    }

    // This task receives notifications from `OrphanhoodNotifier`s and tries to
    // mark streams as orphaned. It also checks count of old orphans periodically.
    // After an old orphan threshold is reached, `orphaner` returns an error
    // causing the connection to break.
    async fn orphaner(
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) -> Result<(), BrokenConnectionError> {
        let mut interval = tokio::time::interval(OLD_AGE_ORPHAN_THRESHOLD);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let (old_orphan_count, threshold) = {
                        let handler_map_guard = lock(handler_map);
                        (handler_map_guard.old_orphans_count(), handler_map_guard.capacity / 2)
                    };
                    if old_orphan_count > threshold {
                        warn!(
                            "Too many old orphaned stream ids: {}",
                            old_orphan_count,
                        );
                        return Err(BrokenConnectionErrorKind::TooManyOrphanedStreamIds(old_orphan_count as u16).into())
                    }
                }
                Some(request_id) = orphan_receiver.recv() => {
                    trace!(
                        "Trying to orphan stream id associated with request_id = {}",
                        request_id,
                    );
                    lock(handler_map).orphan(request_id);
                }
                else => { break }
            }
        }

        Ok(())
    }

    async fn heartbeat(
        router_handle: Weak<RouterHandle>,
        heartbeat_interval: Option<Duration>,
        node_address: SocketAddr,
    ) -> Result<(), BrokenConnectionError> {
        let Some(heartbeat_interval) = heartbeat_interval else {
            return Ok(());
        };

        let mut interval = tokio::time::interval(heartbeat_interval);
        interval.tick().await; // The first tick is instant.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let Some(router_handle) = router_handle.upgrade() else {
                return Ok(());
            };

            if let Err(err) = router_handle.send_request(&Options, None, false).await {
                warn!(node = %node_address, "Heartbeat request failed: {}", err);
                return Err(BrokenConnectionErrorKind::HeartbeatRequestError(Arc::new(err)).into());
            }
            trace!(node = %node_address, "Heartbeat answered");
        }
    }

    // Breaks the connection once nothing has been read for `idle_timeout`.
    async fn idle_watchdog(
        last_read: &StdMutex<Instant>,
        idle_timeout: Option<Duration>,
        node_address: SocketAddr,
    ) -> Result<(), BrokenConnectionError> {
        let Some(idle_timeout) = idle_timeout else {
            return Ok(());
        };

        loop {
            let deadline = *lock(last_read) + idle_timeout;
            if Instant::now() >= deadline {
                warn!(
                    node = %node_address,
                    "Nothing received for {:?}, closing the connection",
                    idle_timeout
                );
                return Err(BrokenConnectionErrorKind::IdleTimeout(idle_timeout).into());
            }
            tokio::time::sleep_until(deadline).await;
        }
    }

    async fn closer(close_receiver: oneshot::Receiver<()>) -> Result<(), BrokenConnectionError> {
        match close_receiver.await {
            Ok(()) => Err(BrokenConnectionErrorKind::ClosedLocally.into()),
            // The connection was dropped without closing; the router is cancelled anyway.
            Err(_) => futures::future::pending().await,
        }
    }

    async fn handle_event(
        task_response: TaskResponse,
        compression: Option<Compression>,
        event_sender: &mpsc::Sender<Event>,
    ) -> Result<(), CqlEventHandlingError> {
        let body = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )?
        .body;

        let event = match Response::deserialize(
            task_response.params.version,
            task_response.opcode,
            &mut &*body,
        )? {
            Response::Event(event) => event,
            other => {
                error!("Expected to receive Event response, got {:?}", other);
                return Err(CqlEventHandlingError::UnexpectedResponse(other.opcode()));
            }
        };

        event_sender
            .send(event)
            .await
            .map_err(|_| CqlEventHandlingError::SendError)
    }
}

/// Connects to `addr` and performs the handshake: OPTIONS, STARTUP with the negotiated
/// compression, authentication if the node asks for it, and REGISTER when `config`
/// carries an event sender.
pub(crate) async fn open_connection(
    addr: SocketAddr,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let (mut connection, error_receiver) = Connection::new(addr, config.clone()).await?;
    connection.handshake().await?;
    trace!(
        node = %addr,
        version = %config.protocol_version,
        "Connection established"
    );
    Ok((connection, error_receiver))
}

struct OrphanageTracker {
    orphans: HashMap<i16, Instant>,
    by_orphaning_times: BTreeSet<(Instant, i16)>,
}

impl OrphanageTracker {
    fn new() -> Self {
        Self {
            orphans: HashMap::new(),
            by_orphaning_times: BTreeSet::new(),
        }
    }

    fn insert(&mut self, stream_id: i16) {
        let now = Instant::now();
        self.orphans.insert(stream_id, now);
        self.by_orphaning_times.insert((now, stream_id));
    }

    fn remove(&mut self, stream_id: i16) {
        if let Some(time) = self.orphans.remove(&stream_id) {
            self.by_orphaning_times.remove(&(time, stream_id));
        }
    }

    fn contains(&self, stream_id: i16) -> bool {
        self.orphans.contains_key(&stream_id)
    }

    fn orphans_older_than(&self, age: Duration) -> usize {
        let minimal_age = Instant::now() - age;
        // Linear in the number of old orphans only.
        self.by_orphaning_times
            .range(..(minimal_age, i16::MAX))
            .count()
    }
}

/// The stream table of a connection: which stream id waits for which response,
/// plus the requests waiting for a free stream id.
struct ResponseHandlerMap {
    capacity: usize,
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,

    request_to_stream: HashMap<RequestId, i16>,
    orphanage_tracker: OrphanageTracker,
    overflow: VecDeque<Task>,
}

enum HandlerLookupResult {
    Orphaned,
    Handler(ResponseHandler),
    Missing,
}

impl ResponseHandlerMap {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            stream_set: StreamIdSet::new(capacity),
            handlers: HashMap::new(),
            request_to_stream: HashMap::new(),
            orphanage_tracker: OrphanageTracker::new(),
            overflow: VecDeque::new(),
        }
    }

    // Returns the frame to write if a stream id could be assigned right away.
    // Otherwise the task waits in the overflow queue, behind earlier ones.
    fn submit(&mut self, task: Task) -> Option<SerializedRequest> {
        if task.response_handler.response_sender.is_closed() {
            // The caller gave up before the request reached the router.
            return None;
        }

        if self.overflow.is_empty() {
            if let Some(stream_id) = self.stream_set.allocate() {
                return Some(self.assign(stream_id, task));
            }
        }

        trace!(
            request_id = task.response_handler.request_id,
            queued = self.overflow.len() + 1,
            "No free stream id, queueing request"
        );
        self.overflow.push_back(task);
        None
    }

    // Moves the oldest queued request onto a free stream id, if there is one.
    fn next_queued(&mut self) -> Option<SerializedRequest> {
        while let Some(task) = self.overflow.front() {
            if task.response_handler.response_sender.is_closed() {
                self.overflow.pop_front();
                continue;
            }
            let stream_id = self.stream_set.allocate()?;
            let task = self.overflow.pop_front()?;
            return Some(self.assign(stream_id, task));
        }
        None
    }

    fn assign(&mut self, stream_id: i16, task: Task) -> SerializedRequest {
        let Task {
            mut serialized_request,
            response_handler,
        } = task;
        serialized_request.set_stream(stream_id);
        self.request_to_stream
            .insert(response_handler.request_id, stream_id);
        self.handlers.insert(stream_id, response_handler);
        serialized_request
    }

    // Orphan stream_id (associated with this request_id) by moving it to
    // `orphanage_tracker`, and freeing its handler. A request that was still
    // queued is simply dropped.
    fn orphan(&mut self, request_id: RequestId) {
        if let Some(stream_id) = self.request_to_stream.remove(&request_id) {
            debug!(
                "Orphaning stream_id = {} associated with request_id = {}",
                stream_id, request_id
            );
            self.orphanage_tracker.insert(stream_id);
            self.handlers.remove(&stream_id);
        } else {
            self.overflow
                .retain(|task| task.response_handler.request_id != request_id);
        }
    }

    fn old_orphans_count(&self) -> usize {
        self.orphanage_tracker
            .orphans_older_than(OLD_AGE_ORPHAN_THRESHOLD)
    }

    fn lookup(&mut self, stream_id: i16) -> HandlerLookupResult {
        if stream_id as usize >= self.capacity {
            return HandlerLookupResult::Missing;
        }

        if self.orphanage_tracker.contains(stream_id) {
            self.orphanage_tracker.remove(stream_id);
            self.stream_set.free(stream_id);
            // This `stream_id` had been orphaned, so its handler got removed.
            // This is a valid state (as opposed to missing handler)
            return HandlerLookupResult::Orphaned;
        }

        if let Some(handler) = self.handlers.remove(&stream_id) {
            self.stream_set.free(stream_id);
            // A mapping `request_id` -> `stream_id` must be removed, to
            // prevent marking this `stream_id` as orphaned by some late
            // orphan notification.
            self.request_to_stream.remove(&handler.request_id);

            HandlerLookupResult::Handler(handler)
        } else {
            HandlerLookupResult::Missing
        }
    }

    // Retrieves every request still waiting for a response, sent or queued. Used after
    // the connection breaks and we have to respond to all of them with an error.
    fn into_pending(self) -> impl Iterator<Item = ResponseHandler> {
        self.handlers.into_values().chain(
            self.overflow
                .into_iter()
                .map(|task| task.response_handler),
        )
    }
}

struct StreamIdSet {
    capacity: usize,
    used_bitmap: Box<[u64]>,
}

impl StreamIdSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used_bitmap: vec![0; capacity.div_ceil(64)].into_boxed_slice(),
        }
    }

    // Always hands out the lowest free id.
    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones() as usize;
                let stream_id = off + block_id * 64;
                if stream_id >= self.capacity {
                    return None;
                }
                *block |= 1u64 << off;
                return Some(stream_id as i16);
            }
        }
        None
    }

    fn free(&mut self, stream_id: i16) {
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        self.used_bitmap[block_id] &= !(1 << off);
    }
}

/// This type can only hold a valid keyspace name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub(crate) fn new(
        keyspace_name: String,
        case_sensitive: bool,
    ) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        self.name.as_str()
    }

    pub(crate) fn use_statement(&self) -> String {
        match self.is_case_sensitive {
            true => format!("USE \"{}\"", self.as_str()),
            false => format!("USE {}", self.as_str()),
        }
    }

    // Keyspace names can have up to 48 alphanumeric characters and contain underscores.
    // Cassandra accepts an underscore as the first character, so we do too.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        // Verify that length <= 48
        let keyspace_name_len: usize = keyspace_name.chars().count(); // Only ascii allowed so it's equal to .len()
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        // Verify all chars are alphanumeric or underscore
        for character in keyspace_name.chars() {
            match character {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => {}
                _ => {
                    return Err(BadKeyspaceName::IllegalCharacter(
                        keyspace_name.to_string(),
                        character,
                    ));
                }
            };
        }

        Ok(())
    }
}
