//! Coordination over TCP.
//!
//! [`CoordinationServer`] exposes a [`MemoryEnsemble`] to other processes and
//! [`RemoteSession`] is the matching [`CoordinationClient`]. Frames are the
//! same length-prefixed JSON the call path uses.
//!
//! Each connection carries exactly one session. The first frame opens it and
//! fixes the session timeout; the client then pings at a third of that
//! timeout. The session ends when the connection closes or stays silent for
//! longer than the timeout, and its ephemeral nodes are deleted with it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ares_common::config::RegistrySection;
use ares_common::transport::TcpTransport;
use ares_common::{Result, RpcError};

use crate::coordination::{ChildChange, ChildChangeSink, CoordinationClient, MemoryEnsemble, MemorySession};

/// Correlation id used by heartbeats; replies to it are ignored.
const PING_ID: u64 = 0;

/// Floor for the session timeout a client may ask for.
const MIN_SESSION_TIMEOUT: Duration = Duration::from_millis(50);

/// Time a new connection has to open its session.
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Operation {
    Open { session_timeout_ms: u64 },
    Ping,
    Exists { path: String },
    CreatePersistent { path: String, recursive: bool },
    CreateEphemeral { path: String },
    GetChildren { path: String },
    Delete { path: String },
    Subscribe { path: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestFrame {
    id: u64,
    operation: Operation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Reply {
    Done,
    Session(u64),
    Exists(bool),
    Children(Vec<String>),
    NodeExists(String),
    NoNode(String),
    Failed(String),
}

impl Reply {
    fn from_result<T>(result: Result<T>, ok: impl FnOnce(T) -> Reply) -> Reply {
        match result {
            Ok(value) => ok(value),
            Err(RpcError::NodeExists(path)) => Reply::NodeExists(path),
            Err(RpcError::NoNode(path)) => Reply::NoNode(path),
            Err(RpcError::Coordination(message)) => Reply::Failed(message),
            Err(e) => Reply::Failed(e.to_string()),
        }
    }

    fn into_error(self) -> RpcError {
        match self {
            Reply::NodeExists(path) => RpcError::NodeExists(path),
            Reply::NoNode(path) => RpcError::NoNode(path),
            Reply::Failed(message) => RpcError::Coordination(message),
            other => RpcError::Coordination(format!("unexpected reply {:?}", other)),
        }
    }

    fn done(self) -> Result<()> {
        match self {
            Reply::Done => Ok(()),
            other => Err(other.into_error()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum ServerFrame {
    Reply { id: u64, reply: Reply },
    Watch(ChildChange),
}

// ============================================================================
// Server
// ============================================================================

/// Serves a [`MemoryEnsemble`] to remote sessions.
pub struct CoordinationServer {
    listener: TcpListener,
    ensemble: MemoryEnsemble,
}

impl CoordinationServer {
    pub async fn bind(bind_addr: &str, ensemble: MemoryEnsemble) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;
        Ok(Self { listener, ensemble })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RpcError::Connection(format!("Failed to get local addr: {}", e)))
    }

    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }

    /// Accepts sessions until the task is cancelled.
    pub async fn run(self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "Coordination server accepting sessions");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            let ensemble = self.ensemble.clone();
            tokio::spawn(async move {
                serve_session(stream, ensemble).await;
                debug!(peer = %peer_addr, "Coordination connection finished");
            });
        }
    }

    /// Runs the accept loop on a background task.
    pub fn spawn(self) -> Result<CoordinationServerHandle> {
        let local_addr = self.local_addr()?;
        let ensemble = self.ensemble.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!(error = %e, "Coordination server stopped");
            }
        });
        Ok(CoordinationServerHandle {
            local_addr,
            ensemble,
            task,
        })
    }
}

/// Handle to a coordination server running in the background.
pub struct CoordinationServerHandle {
    local_addr: SocketAddr,
    ensemble: MemoryEnsemble,
    task: JoinHandle<()>,
}

impl CoordinationServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }

    /// Stops accepting sessions. Open sessions live until their connection
    /// closes.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for CoordinationServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_request(reader: &mut OwnedReadHalf, timeout: Duration) -> Option<RequestFrame> {
    loop {
        let frame = match tokio::time::timeout(timeout, TcpTransport::receive_message(reader)).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => return None,
            Ok(Err(e)) => {
                debug!(error = %e, "Coordination read failed");
                return None;
            }
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "Coordination connection went silent");
                return None;
            }
        };

        match serde_json::from_slice(&frame) {
            Ok(request) => return Some(request),
            Err(e) => warn!(error = %e, "Discarding undecodable coordination frame"),
        }
    }
}

async fn serve_session(stream: TcpStream, ensemble: MemoryEnsemble) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Could not set TCP_NODELAY");
    }
    let (mut reader, writer) = stream.into_split();
    let (frames, frames_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_server_frames(writer, frames_rx));

    let (open_id, session_timeout) = match read_request(&mut reader, OPEN_TIMEOUT).await {
        Some(RequestFrame {
            id,
            operation: Operation::Open { session_timeout_ms },
        }) => (id, Duration::from_millis(session_timeout_ms).max(MIN_SESSION_TIMEOUT)),
        Some(other) => {
            warn!(operation = ?other.operation, "First frame did not open a session");
            writer_task.abort();
            return;
        }
        None => {
            writer_task.abort();
            return;
        }
    };

    let session = ensemble.connect();
    info!(
        session = session.id(),
        timeout_ms = session_timeout.as_millis() as u64,
        "Coordination session opened"
    );
    let _ = frames.send(ServerFrame::Reply {
        id: open_id,
        reply: Reply::Session(session.id()),
    });

    let (watches, mut watch_rx) = mpsc::unbounded_channel::<ChildChange>();
    let forwarder = {
        let frames = frames.clone();
        tokio::spawn(async move {
            while let Some(change) = watch_rx.recv().await {
                if frames.send(ServerFrame::Watch(change)).is_err() {
                    break;
                }
            }
        })
    };

    while let Some(request) = read_request(&mut reader, session_timeout).await {
        let reply = execute(&session, request.operation, &watches).await;
        if frames
            .send(ServerFrame::Reply {
                id: request.id,
                reply,
            })
            .is_err()
        {
            break;
        }
    }

    info!(session = session.id(), "Coordination session ended");
    session.close();
    forwarder.abort();
    writer_task.abort();
}

async fn execute(session: &MemorySession, operation: Operation, watches: &ChildChangeSink) -> Reply {
    match operation {
        Operation::Open { .. } => Reply::Failed(format!("session {} is already open", session.id())),
        Operation::Ping => Reply::Done,
        Operation::Exists { path } => Reply::from_result(session.exists(&path).await, Reply::Exists),
        Operation::CreatePersistent { path, recursive } => {
            Reply::from_result(session.create_persistent(&path, recursive).await, |_| Reply::Done)
        }
        Operation::CreateEphemeral { path } => {
            Reply::from_result(session.create_ephemeral(&path).await, |_| Reply::Done)
        }
        Operation::GetChildren { path } => {
            Reply::from_result(session.get_children(&path).await, Reply::Children)
        }
        Operation::Delete { path } => Reply::from_result(session.delete(&path).await, |_| Reply::Done),
        Operation::Subscribe { path } => Reply::from_result(
            session.subscribe_children(&path, watches.clone()).await,
            |_| Reply::Done,
        ),
    }
}

async fn write_server_frames(mut writer: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<ServerFrame>) {
    while let Some(frame) = frames.recv().await {
        let data = match serde_json::to_vec(&frame) {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, "Failed to encode coordination frame");
                continue;
            }
        };
        if let Err(e) = TcpTransport::send_message(&mut writer, &data).await {
            debug!(error = %e, "Coordination connection not writable");
            return;
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Where and how to reach a coordination server.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// `host:port` of the coordination server
    pub address: String,
    /// Silence after which the server ends the session
    pub session_timeout: Duration,
    /// Budget for connecting and opening the session
    pub connection_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self::from(&RegistrySection::default())
    }
}

impl From<&RegistrySection> for RemoteConfig {
    fn from(section: &RegistrySection) -> Self {
        Self {
            address: section.address.clone(),
            session_timeout: Duration::from_millis(section.session_timeout_ms),
            connection_timeout: Duration::from_millis(section.connection_timeout_ms),
        }
    }
}

/// State shared between a session and its background tasks.
#[derive(Default)]
struct SessionState {
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    watches: Mutex<HashMap<String, Vec<ChildChangeSink>>>,
    closed: AtomicBool,
}

impl SessionState {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Fails every waiting request and drops the subscribers.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pending.lock().clear();
        self.watches.lock().clear();
    }

    fn deliver(&self, change: ChildChange) {
        if let Some(sinks) = self.watches.lock().get_mut(&change.path) {
            sinks.retain(|sink| sink.send(change.clone()).is_ok());
        }
    }
}

/// A session on a [`CoordinationServer`].
///
/// Requests are written by a writer task and answered out of band by a
/// reader task that also delivers child-change notifications. Once the
/// connection is lost the session is closed for good: every later operation
/// fails and the server has already dropped its ephemeral nodes.
pub struct RemoteSession {
    address: String,
    id: u64,
    state: Arc<SessionState>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteSession {
    /// Connects to the server at `config.address` and opens a session.
    pub async fn connect(config: &RemoteConfig) -> Result<Self> {
        if config.session_timeout.is_zero() {
            return Err(RpcError::Config("session timeout must be greater than 0".to_string()));
        }

        let transport = TcpTransport::new().with_connect_timeout(config.connection_timeout);
        let stream = transport.connect(&config.address).await?;
        let (reader, writer) = stream.into_split();

        let state = Arc::new(SessionState::default());
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let heartbeat_every = (config.session_timeout / 3).max(Duration::from_millis(10));
        let tasks = vec![
            tokio::spawn(read_server_frames(reader, state.clone())),
            tokio::spawn(write_requests(writer, outbound_rx, state.clone())),
            tokio::spawn(heartbeat(outbound.clone(), heartbeat_every)),
        ];

        let mut session = Self {
            address: config.address.clone(),
            id: 0,
            state,
            outbound,
            next_id: AtomicU64::new(PING_ID + 1),
            request_timeout: config.session_timeout,
            tasks: Mutex::new(tasks),
        };

        let open = Operation::Open {
            session_timeout_ms: config.session_timeout.as_millis() as u64,
        };
        let reply = session.request_within(open, config.connection_timeout).await?;
        match reply {
            Reply::Session(id) => session.id = id,
            other => {
                session.close();
                return Err(other.into_error());
            }
        }

        info!(address = %session.address, session = session.id, "Coordination session opened");
        Ok(session)
    }

    /// Session id assigned by the server.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Ends the session. The server deletes its ephemeral nodes once it sees
    /// the connection close.
    pub fn close(&self) {
        self.state.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn request(&self, operation: Operation) -> Result<Reply> {
        self.request_within(operation, self.request_timeout).await
    }

    async fn request_within(&self, operation: Operation, timeout: Duration) -> Result<Reply> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let data = serde_json::to_vec(&RequestFrame { id, operation })?;

        let (tx, rx) = oneshot::channel();
        self.state.pending.lock().insert(id, tx);
        if self.state.is_closed() || self.outbound.send(data).is_err() {
            self.state.pending.lock().remove(&id);
            return Err(self.closed_error());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                self.state.pending.lock().remove(&id);
                Err(RpcError::Coordination(format!(
                    "no reply from {} after {}ms",
                    self.address,
                    timeout.as_millis()
                )))
            }
        }
    }

    fn closed_error(&self) -> RpcError {
        RpcError::Coordination(format!("session {} to {} is closed", self.id, self.address))
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("address", &self.address)
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl CoordinationClient for RemoteSession {
    async fn exists(&self, path: &str) -> Result<bool> {
        match self.request(Operation::Exists { path: path.to_string() }).await? {
            Reply::Exists(exists) => Ok(exists),
            other => Err(other.into_error()),
        }
    }

    async fn create_persistent(&self, path: &str, recursive: bool) -> Result<()> {
        self.request(Operation::CreatePersistent {
            path: path.to_string(),
            recursive,
        })
        .await?
        .done()
    }

    async fn create_ephemeral(&self, path: &str) -> Result<()> {
        self.request(Operation::CreateEphemeral { path: path.to_string() })
            .await?
            .done()
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        match self.request(Operation::GetChildren { path: path.to_string() }).await? {
            Reply::Children(children) => Ok(children),
            other => Err(other.into_error()),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.request(Operation::Delete { path: path.to_string() })
            .await?
            .done()
    }

    /// The server is asked to watch a path once; further sinks for the same
    /// path are fanned out locally.
    async fn subscribe_children(&self, path: &str, sink: ChildChangeSink) -> Result<()> {
        let first = {
            let mut watches = self.state.watches.lock();
            let first = !watches.contains_key(path);
            watches.entry(path.to_string()).or_default().push(sink);
            first
        };
        if !first {
            return Ok(());
        }

        let subscribed = self.request(Operation::Subscribe { path: path.to_string() }).await;
        if let Err(e) = subscribed.and_then(Reply::done) {
            self.state.watches.lock().remove(path);
            return Err(e);
        }
        Ok(())
    }
}

async fn read_server_frames(mut reader: OwnedReadHalf, state: Arc<SessionState>) {
    loop {
        match TcpTransport::receive_message(&mut reader).await {
            Ok(Some(frame)) => match serde_json::from_slice(&frame) {
                Ok(ServerFrame::Reply { id, reply }) => {
                    if let Some(tx) = state.pending.lock().remove(&id) {
                        let _ = tx.send(reply);
                    }
                }
                Ok(ServerFrame::Watch(change)) => state.deliver(change),
                Err(e) => warn!(error = %e, "Discarding undecodable coordination frame"),
            },
            Ok(None) => {
                warn!("Coordination server closed the session");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Coordination session lost");
                break;
            }
        }
    }
    state.close();
}

async fn write_requests(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    state: Arc<SessionState>,
) {
    while let Some(data) = outbound.recv().await {
        if let Err(e) = TcpTransport::send_message(&mut writer, &data).await {
            warn!(error = %e, "Coordination session not writable");
            break;
        }
    }
    state.close();
}

async fn heartbeat(outbound: mpsc::UnboundedSender<Vec<u8>>, every: Duration) {
    let ping = match serde_json::to_vec(&RequestFrame {
        id: PING_ID,
        operation: Operation::Ping,
    }) {
        Ok(ping) => ping,
        Err(e) => {
            error!(error = %e, "Failed to encode heartbeat");
            return;
        }
    };

    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if outbound.send(ping.clone()).is_err() {
            return;
        }
    }
}
