use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ares_common::transport::{JsonCodec, TcpTransport};
use ares_common::{CallResponse, FailureKind, Result, RpcError};

use crate::dispatcher::Dispatcher;

/// Responses buffered per connection before dispatch tasks wait on the writer.
const RESPONSE_QUEUE_DEPTH: usize = 1024;

/// TCP server feeding requests to a [`Dispatcher`].
///
/// Each connection gets a reader loop and a writer task. The reader spawns
/// one dispatch task per request, so slow handlers never block the
/// connection; responses are written back in completion order and matched
/// by correlation id on the client.
pub struct RpcServer {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
}

impl RpcServer {
    /// Creates a new server bound to the specified address.
    pub async fn bind(bind_addr: &str, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to bind to {}: {}", bind_addr, e)))?;

        Ok(Self { listener, dispatcher })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RpcError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// Accepts connections until the task is cancelled.
    pub async fn run(self) -> Result<()> {
        info!(addr = ?self.listener.local_addr().ok(), "Server accepting connections");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "Connection established");
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                handle_connection(stream, dispatcher).await;
                debug!(peer = %peer_addr, "Connection finished");
            });
        }
    }

    /// Runs the accept loop on a background task.
    pub fn spawn(self) -> Result<ServerHandle> {
        let local_addr = self.local_addr()?;
        let task = tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!(error = %e, "Server stopped");
            }
        });
        Ok(ServerHandle { local_addr, task })
    }
}

/// Handle to a server running in the background.
pub struct ServerHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections. Open connections finish on their own.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(stream: TcpStream, dispatcher: Arc<Dispatcher>) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Could not set TCP_NODELAY");
    }
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
    let closed = Arc::new(Notify::new());

    let writer_task = tokio::spawn(write_loop(writer, rx, closed.clone()));
    read_loop(reader, dispatcher, tx, closed).await;

    // the writer exits once every in-flight dispatch has sent or dropped its response
    let _ = writer_task.await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    dispatcher: Arc<Dispatcher>,
    tx: mpsc::Sender<CallResponse>,
    closed: Arc<Notify>,
) {
    loop {
        let frame = tokio::select! {
            frame = TcpTransport::receive_message(&mut reader) => frame,
            _ = closed.notified() => {
                debug!("Writer closed, stopping reader");
                return;
            }
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "Connection read failed");
                return;
            }
        };

        let request = match JsonCodec::decode_request(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Failed to decode request");
                if let Some(id) = request_id(&frame) {
                    let response = CallResponse::failure(id, 0, FailureKind::BadRequest, e.to_string());
                    let _ = tx.send(response).await;
                }
                continue;
            }
        };

        let dispatcher = dispatcher.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = dispatcher.dispatch(request).await;
            let id = response.id.clone();
            if tx.send(response).await.is_err() {
                error!(id = %id, "Connection closed, dropping response");
            }
        });
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<CallResponse>, closed: Arc<Notify>) {
    while let Some(response) = rx.recv().await {
        let data = match JsonCodec::encode_response(&response) {
            Ok(data) => data,
            Err(e) => {
                error!(id = %response.id, error = %e, "Failed to encode response");
                continue;
            }
        };

        if let Err(e) = TcpTransport::send_message(&mut writer, &data).await {
            error!(id = %response.id, error = %e, "Connection not writable, dropping response and closing");
            closed.notify_one();
            return;
        }
    }
}

/// Best-effort correlation id of an undecodable request.
fn request_id(frame: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(frame).ok()?;
    value.get("id")?.as_str().map(str::to_string)
}
