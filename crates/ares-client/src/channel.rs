use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ares_common::transport::{JsonCodec, TcpTransport};
use ares_common::{CallRequest, Result, RpcError};

use crate::holder::ResponseHolder;

/// One TCP connection to a provider.
///
/// Requests are written through the write half. A reader task owns the read
/// half and hands every inbound response to the [`ResponseHolder`]. The
/// health flags are cleared by the reader on EOF or error, by a failed write,
/// and by [`close`](Self::close).
pub struct Channel {
    address: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    open: AtomicBool,
    active: AtomicBool,
    writable: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Connects to `address` and starts the inbound handler.
    pub async fn connect(
        address: &str,
        transport: &TcpTransport,
        holder: Arc<ResponseHolder>,
    ) -> Result<Arc<Self>> {
        let stream = transport.connect(address).await?;
        let (read_half, write_half) = stream.into_split();

        let channel = Arc::new(Self {
            address: address.to_string(),
            writer: tokio::sync::Mutex::new(write_half),
            open: AtomicBool::new(true),
            active: AtomicBool::new(true),
            writable: AtomicBool::new(true),
            reader: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::read_loop(Arc::downgrade(&channel), read_half, holder));
        *channel.reader.lock() = Some(handle);

        debug!(address = %address, "Channel opened");
        Ok(channel)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        self.is_open() && self.is_active() && self.is_writable()
    }

    /// Encodes and writes one request, waiting until it is flushed.
    pub async fn write_request(&self, request: &CallRequest) -> Result<()> {
        if !self.is_healthy() {
            return Err(RpcError::Connection(format!("channel to {} is not usable", self.address)));
        }

        let data = JsonCodec::encode_request(request)?;
        let mut writer = self.writer.lock().await;
        // stays cleared if this future is dropped mid-frame
        self.writable.store(false, Ordering::Release);
        if let Err(e) = TcpTransport::send_message(&mut *writer, &data).await {
            warn!(address = %self.address, error = %e, "Write failed, channel marked unwritable");
            return Err(e);
        }
        self.writable.store(true, Ordering::Release);
        Ok(())
    }

    /// Marks the channel closed and stops its reader.
    pub fn close(&self) {
        self.mark_closed();
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
        self.active.store(false, Ordering::Release);
        self.writable.store(false, Ordering::Release);
    }

    async fn read_loop(channel: Weak<Channel>, mut reader: OwnedReadHalf, holder: Arc<ResponseHolder>) {
        loop {
            match TcpTransport::receive_message(&mut reader).await {
                Ok(Some(frame)) => match JsonCodec::decode_response(&frame) {
                    Ok(response) => {
                        holder.put_result(response);
                    }
                    Err(e) => warn!(error = %e, "Discarding undecodable response frame"),
                },
                Ok(None) => {
                    debug!("Peer closed channel");
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "Channel read failed");
                    break;
                }
            }
        }

        if let Some(channel) = channel.upgrade() {
            channel.open.store(false, Ordering::Release);
            channel.active.store(false, Ordering::Release);
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.get_mut().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.address)
            .field("open", &self.is_open())
            .field("active", &self.is_active())
            .field("writable", &self.is_writable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_peer_close_marks_unhealthy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let channel = Channel::connect(&addr, &TcpTransport::new(), Arc::new(ResponseHolder::new()))
            .await
            .unwrap();

        assert!(wait_until(|| !channel.is_healthy()).await);
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_close_rejects_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let channel = Channel::connect(&addr, &TcpTransport::new(), Arc::new(ResponseHolder::new()))
            .await
            .unwrap();
        assert!(channel.is_healthy());

        channel.close();
        assert!(!channel.is_healthy());

        let service = ares_common::ServiceDescriptor::new("svc", "127.0.0.1", 1);
        let request = CallRequest::new(service, "m", vec![]);
        assert!(matches!(
            channel.write_request(&request).await,
            Err(RpcError::Connection(_))
        ));
    }
}
