//! Scripted CQL nodes for tests.
//!
//! A [`MockNode`] listens on a loopback address, decodes every request frame it receives
//! and answers with whatever its handler decides. Every test uses its own 127.0.N.x
//! addresses so that tests can run in parallel.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::{Buf, BufMut, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::frame::request::{DeserializableRequest, Prepare, Query, RequestOpcode};
use crate::frame::response::event::{
    Event, SchemaChangeEvent, SchemaChangeTarget, SchemaChangeType,
};
use crate::frame::response::result::{
    self, ColumnSpec, ColumnType, PreparedMetadata, ResultMetadata, Row, Rows, SetKeyspace,
    TableSpec,
};
use crate::frame::response::{DbError, Error, ResponseOpcode};
use crate::frame::types;
use crate::frame::{FrameParams, ProtocolVersion};
use crate::utils::lock;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// A request frame as seen by a node.
#[derive(Debug, Clone)]
pub(crate) struct RequestFrame {
    pub(crate) params: FrameParams,
    pub(crate) opcode: RequestOpcode,
    pub(crate) body: Bytes,
}

impl RequestFrame {
    pub(crate) fn deserialize<R: DeserializableRequest>(&self) -> R {
        R::deserialize(self.params.version, &mut &*self.body).unwrap()
    }

    /// Statement text of a QUERY or PREPARE.
    pub(crate) fn cql(&self) -> Option<String> {
        match self.opcode {
            RequestOpcode::Query => Some(self.deserialize::<Query>().contents.into_owned()),
            RequestOpcode::Prepare => Some(self.deserialize::<Prepare>().query.into_owned()),
            _ => None,
        }
    }
}

pub(crate) async fn read_request_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> io::Result<RequestFrame> {
    let mut raw_version = [0u8; 1];
    reader.read_exact(&mut raw_version).await?;
    let version = ProtocolVersion::try_from(raw_version[0] & 0x7F)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{:?}", e)))?;

    let mut raw_header = vec![0u8; version.header_size() - 1];
    reader.read_exact(&mut raw_header).await?;
    let mut buf = &raw_header[..];
    let flags = buf.get_u8();
    let stream = match version {
        ProtocolVersion::V1 | ProtocolVersion::V2 => buf.get_i8() as i16,
        ProtocolVersion::V3 | ProtocolVersion::V4 => buf.get_i16(),
    };
    let opcode = RequestOpcode::try_from(buf.get_u8())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{:?}", e)))?;
    let length = buf.get_u32() as usize;

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    Ok(RequestFrame {
        params: FrameParams {
            version,
            flags,
            stream,
        },
        opcode,
        body: body.into(),
    })
}

/// A response a test wants a node to send.
#[derive(Debug, Clone)]
pub(crate) enum ForgedResponse {
    Ready,
    Supported(HashMap<String, Vec<String>>),
    Error(DbError, String),
    Result(result::Result),
    Event(Event),
    Authenticate(String),
    AuthChallenge(Option<Vec<u8>>),
    AuthSuccess,
}

impl ForgedResponse {
    pub(crate) fn void() -> Self {
        ForgedResponse::Result(result::Result::Void)
    }

    pub(crate) fn set_keyspace(name: &str) -> Self {
        ForgedResponse::Result(result::Result::SetKeyspace(SetKeyspace {
            keyspace_name: name.to_string(),
        }))
    }

    pub(crate) fn prepared(id: Bytes) -> Self {
        ForgedResponse::Result(result::Result::Prepared(result::Prepared {
            id,
            prepared_metadata: PreparedMetadata::default(),
            result_metadata: ResultMetadata::default(),
        }))
    }

    pub(crate) fn keyspace_created(name: &str) -> Self {
        ForgedResponse::Result(result::Result::SchemaChange(result::SchemaChange {
            event: SchemaChangeEvent {
                change_type: SchemaChangeType::Created,
                target: SchemaChangeTarget::Keyspace,
                keyspace_name: name.to_string(),
                object_name: String::new(),
                arguments: Vec::new(),
            },
        }))
    }

    pub(crate) fn error(error: DbError) -> Self {
        ForgedResponse::Error(error, "forged error".to_string())
    }

    fn serialize(&self, version: ProtocolVersion) -> (ResponseOpcode, Vec<u8>) {
        let mut body = Vec::new();
        let opcode = match self {
            ForgedResponse::Ready => ResponseOpcode::Ready,
            ForgedResponse::Supported(options) => {
                types::write_string_multimap(options, &mut body).unwrap();
                ResponseOpcode::Supported
            }
            ForgedResponse::Error(error, reason) => {
                Error::new(error.clone(), reason.as_str())
                    .serialize(&mut body)
                    .unwrap();
                ResponseOpcode::Error
            }
            ForgedResponse::Result(result) => {
                result.serialize(version, &mut body).unwrap();
                ResponseOpcode::Result
            }
            ForgedResponse::Event(event) => {
                event.serialize(version, &mut body).unwrap();
                ResponseOpcode::Event
            }
            ForgedResponse::Authenticate(name) => {
                types::write_string(name, &mut body).unwrap();
                ResponseOpcode::Authenticate
            }
            ForgedResponse::AuthChallenge(token) => {
                types::write_bytes_opt(token.as_ref(), &mut body).unwrap();
                ResponseOpcode::AuthChallenge
            }
            ForgedResponse::AuthSuccess => {
                types::write_bytes_opt(None::<&[u8]>, &mut body).unwrap();
                ResponseOpcode::AuthSuccess
            }
        };
        (opcode, body)
    }
}

fn response_frame(version: ProtocolVersion, stream: i16, response: &ForgedResponse) -> Vec<u8> {
    let (opcode, body) = response.serialize(version);
    let mut frame = Vec::with_capacity(version.header_size() + body.len());
    frame.put_u8(0x80 | version.as_u8());
    frame.put_u8(0);
    match version {
        ProtocolVersion::V1 | ProtocolVersion::V2 => frame.put_i8(stream as i8),
        ProtocolVersion::V3 | ProtocolVersion::V4 => frame.put_i16(stream),
    }
    frame.put_u8(opcode as u8);
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(&body);
    frame
}

pub(crate) async fn write_response(
    writer: &mut (impl AsyncWrite + Unpin),
    version: ProtocolVersion,
    stream: i16,
    response: &ForgedResponse,
) -> io::Result<()> {
    writer
        .write_all(&response_frame(version, stream, response))
        .await?;
    writer.flush().await
}

/// What a node does with a request.
#[derive(Debug, Clone)]
pub(crate) enum Reaction {
    Reply(ForgedResponse),
    /// Replies in the given version regardless of the version of the request.
    ReplyInVersion(ProtocolVersion, ForgedResponse),
    /// Never answers.
    Ignore,
    /// Drops the connection.
    Close,
}

/// Answers OPTIONS, STARTUP and REGISTER the way a node without authentication does.
pub(crate) fn handshake_reply(frame: &RequestFrame) -> Option<Reaction> {
    match frame.opcode {
        RequestOpcode::Options => Some(Reaction::Reply(ForgedResponse::Supported(
            HashMap::from([(
                "CQL_VERSION".to_string(),
                vec!["3.0.0".to_string()],
            )]),
        ))),
        RequestOpcode::Startup | RequestOpcode::Register => {
            Some(Reaction::Reply(ForgedResponse::Ready))
        }
        _ => None,
    }
}

/// Identity of a node, as reported by its system tables.
#[derive(Debug, Clone)]
pub(crate) struct NodeInfo {
    pub(crate) ip: IpAddr,
    pub(crate) rpc_address: IpAddr,
    pub(crate) host_id: Uuid,
    pub(crate) datacenter: String,
    pub(crate) rack: String,
    pub(crate) release_version: String,
    pub(crate) schema_version: Uuid,
}

/// The schema version every [`NodeInfo`] starts on.
pub(crate) const AGREED_SCHEMA_VERSION: Uuid = Uuid::from_u128(1);

impl NodeInfo {
    pub(crate) fn new(ip: &str, datacenter: &str) -> Self {
        let ip: IpAddr = ip.parse().unwrap();
        Self {
            ip,
            rpc_address: ip,
            host_id: Uuid::new_v4(),
            datacenter: datacenter.to_string(),
            rack: "rack1".to_string(),
            release_version: "4.0.11".to_string(),
            schema_version: AGREED_SCHEMA_VERSION,
        }
    }
}

fn text_cell(text: &str) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(text.as_bytes()))
}

fn inet_cell(ip: IpAddr) -> Option<Bytes> {
    Some(match ip {
        IpAddr::V4(ip) => Bytes::copy_from_slice(&ip.octets()),
        IpAddr::V6(ip) => Bytes::copy_from_slice(&ip.octets()),
    })
}

fn rows_response(table: &str, columns: &[(&str, ColumnType)], rows: Vec<Row>) -> ForgedResponse {
    let col_specs = columns
        .iter()
        .map(|(name, typ)| ColumnSpec::new(TableSpec::new("system", table), *name, typ.clone()))
        .collect::<Vec<_>>();
    ForgedResponse::Result(result::Result::Rows(Rows {
        metadata: ResultMetadata {
            col_count: col_specs.len(),
            paging_state: None,
            col_specs,
        },
        rows,
    }))
}

pub(crate) fn system_local_response(local: &NodeInfo) -> ForgedResponse {
    rows_response(
        "local",
        &[
            ("rack", ColumnType::Text),
            ("data_center", ColumnType::Text),
            ("host_id", ColumnType::Uuid),
            ("release_version", ColumnType::Text),
        ],
        vec![Row {
            columns: vec![
                text_cell(&local.rack),
                text_cell(&local.datacenter),
                Some(Bytes::copy_from_slice(local.host_id.as_bytes())),
                text_cell(&local.release_version),
            ],
        }],
    )
}

pub(crate) fn schema_version_response(version: Uuid) -> ForgedResponse {
    rows_response(
        "local",
        &[("schema_version", ColumnType::Uuid)],
        vec![Row {
            columns: vec![Some(Bytes::copy_from_slice(version.as_bytes()))],
        }],
    )
}

pub(crate) fn system_peers_response(peers: &[NodeInfo]) -> ForgedResponse {
    rows_response(
        "peers",
        &[
            ("peer", ColumnType::Inet),
            ("rack", ColumnType::Text),
            ("data_center", ColumnType::Text),
            ("host_id", ColumnType::Uuid),
            ("rpc_address", ColumnType::Inet),
            ("release_version", ColumnType::Text),
        ],
        peers
            .iter()
            .map(|peer| Row {
                columns: vec![
                    inet_cell(peer.ip),
                    text_cell(&peer.rack),
                    text_cell(&peer.datacenter),
                    Some(Bytes::copy_from_slice(peer.host_id.as_bytes())),
                    inet_cell(peer.rpc_address),
                    text_cell(&peer.release_version),
                ],
            })
            .collect(),
    )
}

/// The cluster as seen from one node: itself and its peers.
#[derive(Debug, Clone)]
pub(crate) struct Topology {
    pub(crate) local: NodeInfo,
    pub(crate) peers: Vec<NodeInfo>,
}

impl Topology {
    pub(crate) fn seen_from(nodes: &[NodeInfo], index: usize) -> Self {
        Self {
            local: nodes[index].clone(),
            peers: nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, node)| node.clone())
                .collect(),
        }
    }
}

/// Answers queries against `system.local` and `system.peers`, including schema version reads.
pub(crate) fn topology_reply(frame: &RequestFrame, topology: &Topology) -> Option<Reaction> {
    let cql = frame.cql().filter(|_| frame.opcode == RequestOpcode::Query)?;
    if cql.contains("schema_version") {
        Some(Reaction::Reply(schema_version_response(
            topology.local.schema_version,
        )))
    } else if cql.contains("system.local") {
        Some(Reaction::Reply(system_local_response(&topology.local)))
    } else if cql.contains("system.peers") {
        Some(Reaction::Reply(system_peers_response(&topology.peers)))
    } else {
        None
    }
}

/// Statement id a mock node hands out for `cql`.
pub(crate) fn prepared_id(cql: &str) -> Bytes {
    Bytes::copy_from_slice(format!("id:{}", cql).as_bytes())
}

/// Behaves like a healthy node: completes handshakes, serves the system tables,
/// prepares everything and answers every statement with VOID (or SET_KEYSPACE for USE).
pub(crate) fn default_reply(frame: &RequestFrame, topology: &Topology) -> Reaction {
    if let Some(reaction) = handshake_reply(frame).or_else(|| topology_reply(frame, topology)) {
        return reaction;
    }

    match frame.opcode {
        RequestOpcode::Query => {
            let cql = frame.cql().unwrap_or_default();
            match cql.strip_prefix("USE ") {
                Some(keyspace) => {
                    Reaction::Reply(ForgedResponse::set_keyspace(keyspace.trim_matches('"')))
                }
                None => Reaction::Reply(ForgedResponse::void()),
            }
        }
        RequestOpcode::Prepare => {
            let cql = frame.cql().unwrap_or_default();
            Reaction::Reply(ForgedResponse::prepared(prepared_id(&cql)))
        }
        RequestOpcode::Execute | RequestOpcode::Batch => {
            Reaction::Reply(ForgedResponse::void())
        }
        _ => Reaction::Reply(ForgedResponse::error(DbError::ProtocolError)),
    }
}

type Handler = Arc<dyn Fn(&RequestFrame) -> Reaction + Send + Sync>;

#[derive(Default)]
struct NodeState {
    requests: StdMutex<Vec<RequestFrame>>,
    registered: StdMutex<Vec<(ProtocolVersion, mpsc::UnboundedSender<Vec<u8>>)>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    accepted: AtomicUsize,
}

/// A scripted node listening on a loopback address.
pub(crate) struct MockNode {
    address: SocketAddr,
    state: Arc<NodeState>,
}

impl MockNode {
    pub(crate) async fn start(
        address: SocketAddr,
        handler: impl Fn(&RequestFrame) -> Reaction + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind(address).await.unwrap();
        let state = Arc::new(NodeState::default());
        let handler: Handler = Arc::new(handler);

        let accept_loop = tokio::spawn({
            let state = state.clone();
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    state.accepted.fetch_add(1, Ordering::Relaxed);
                    let (read_half, write_half) = socket.into_split();
                    let (frame_sender, frame_receiver) = mpsc::unbounded_channel();

                    let writer = tokio::spawn(Self::write_frames(write_half, frame_receiver));
                    let reader = tokio::spawn(Self::serve(
                        read_half,
                        frame_sender,
                        handler.clone(),
                        state.clone(),
                    ));
                    lock(&state.tasks).extend([writer, reader]);
                }
            }
        });
        lock(&state.tasks).push(accept_loop);

        Self { address, state }
    }

    /// A node that behaves like [`default_reply`].
    pub(crate) async fn healthy(address: SocketAddr, topology: Topology) -> Self {
        Self::start(address, move |frame| default_reply(frame, &topology)).await
    }

    async fn serve(
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        frame_sender: mpsc::UnboundedSender<Vec<u8>>,
        handler: Handler,
        state: Arc<NodeState>,
    ) {
        while let Ok(frame) = read_request_frame(&mut read_half).await {
            lock(&state.requests).push(frame.clone());
            let version = frame.params.version;
            let stream = frame.params.stream;

            if frame.opcode == RequestOpcode::Register {
                lock(&state.registered).push((version, frame_sender.clone()));
            }

            let bytes = match handler(&frame) {
                Reaction::Reply(response) => response_frame(version, stream, &response),
                Reaction::ReplyInVersion(version, response) => {
                    response_frame(version, stream, &response)
                }
                Reaction::Ignore => continue,
                Reaction::Close => return,
            };
            if frame_sender.send(bytes).is_err() {
                return;
            }
        }
    }

    async fn write_frames(
        mut write_half: tokio::net::tcp::OwnedWriteHalf,
        mut frame_receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        while let Some(frame) = frame_receiver.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    /// Every request received so far, across all connections.
    pub(crate) fn requests(&self) -> Vec<RequestFrame> {
        lock(&self.state.requests).clone()
    }

    pub(crate) fn requests_with_opcode(&self, opcode: RequestOpcode) -> Vec<RequestFrame> {
        self.requests()
            .into_iter()
            .filter(|frame| frame.opcode == opcode)
            .collect()
    }

    pub(crate) fn accepted_connections(&self) -> usize {
        self.state.accepted.load(Ordering::Relaxed)
    }

    /// Sends `event` to every connection that registered for events.
    pub(crate) fn push_event(&self, event: Event) {
        let response = ForgedResponse::Event(event);
        lock(&self.state.registered).retain(|(version, sender)| {
            sender
                .send(response_frame(*version, -1, &response))
                .is_ok()
        });
    }

    /// Stops listening and drops every connection.
    pub(crate) fn stop(&self) {
        for task in lock(&self.state.tasks).drain(..) {
            task.abort();
        }
        lock(&self.state.registered).clear();
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Several healthy nodes that know about each other, on 127.0.`subnet`.1, .2, ...
/// `handler` can take over any request; unhandled ones get the [`default_reply`].
pub(crate) struct MockCluster {
    pub(crate) nodes: Vec<MockNode>,
    pub(crate) infos: Vec<NodeInfo>,
}

impl MockCluster {
    pub(crate) async fn start(
        subnet: u8,
        node_count: usize,
        handler: impl Fn(usize, &RequestFrame) -> Option<Reaction> + Send + Sync + 'static,
    ) -> Self {
        let infos = (1..=node_count)
            .map(|i| NodeInfo::new(&format!("127.0.{}.{}", subnet, i), "dc1"))
            .collect::<Vec<_>>();
        Self::start_with_infos(infos, handler).await
    }

    pub(crate) async fn start_with_infos(
        infos: Vec<NodeInfo>,
        handler: impl Fn(usize, &RequestFrame) -> Option<Reaction> + Send + Sync + 'static,
    ) -> Self {
        let handler = Arc::new(handler);
        let mut nodes = Vec::with_capacity(infos.len());
        for index in 0..infos.len() {
            let topology = Topology::seen_from(&infos, index);
            let handler = handler.clone();
            let address = SocketAddr::new(infos[index].ip, 9042);
            nodes.push(
                MockNode::start(address, move |frame| {
                    handler(index, frame).unwrap_or_else(|| default_reply(frame, &topology))
                })
                .await,
            );
        }
        Self { nodes, infos }
    }

    pub(crate) fn address(&self, index: usize) -> SocketAddr {
        self.nodes[index].address()
    }
}
