use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use ares_common::{CallRequest, CallResponse, Result, RpcError};

use crate::channel::Channel;
use crate::holder::ResponseHolder;
use crate::pool::{ChannelPool, ChannelQueue};

/// Turns the asynchronous request/response exchange into one awaitable call.
///
/// For each call:
///
/// 1. a result slot is registered under the correlation id before anything
///    is sent
/// 2. a channel to the target is borrowed within the call timeout; broken
///    channels are discarded and a fresh one is opened when the queue has room
/// 3. the request is written and flushed
/// 4. the caller waits on the slot for what is left of the budget
/// 5. the channel's reader deposits the response into the slot
/// 6. the slot is removed, whatever the outcome
/// 7. the channel goes back to the pool, or is discarded if broken
///
/// Steps 6 and 7 also run when the call future is dropped mid-flight.
pub struct InvocationEngine {
    pool: Arc<ChannelPool>,
    holder: Arc<ResponseHolder>,
}

impl InvocationEngine {
    pub fn new(pool: Arc<ChannelPool>, holder: Arc<ResponseHolder>) -> Self {
        Self { pool, holder }
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    pub fn holder(&self) -> &Arc<ResponseHolder> {
        &self.holder
    }

    /// Performs one call and returns the provider's response.
    ///
    /// # Errors
    ///
    /// - [`RpcError::PoolTimeout`] when no channel could be borrowed in time
    /// - [`RpcError::Timeout`] when no response arrived in time
    /// - connection and transport errors from opening or writing the channel
    pub async fn invoke(&self, request: CallRequest) -> Result<CallResponse> {
        let timeout = request.timeout();
        let deadline = Instant::now() + timeout;
        let address = request.service.address();

        let receiver = self.holder.register(request.id.clone(), timeout);
        let _slot = SlotGuard {
            holder: &self.holder,
            id: &request.id,
        };

        let queue = self.pool.acquire(&address);
        let lease = self.checkout(&queue, &address, deadline, request.timeout_ms).await?;

        match tokio::time::timeout_at(deadline, lease.channel().write_request(&request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(RpcError::Timeout(request.timeout_ms)),
        }
        debug!(id = %request.id, address = %address, method = %request.method, "Request sent");

        wait_for(receiver, deadline, request.timeout_ms).await
    }

    async fn checkout<'a>(
        &'a self,
        queue: &'a Arc<ChannelQueue>,
        address: &'a str,
        deadline: Instant,
        timeout_ms: u64,
    ) -> Result<ChannelLease<'a>> {
        loop {
            let room = queue.room_freed();
            tokio::pin!(room);
            room.as_mut().enable();

            let channel = if let Some(channel) = queue.try_poll() {
                channel
            } else if queue.try_reserve() {
                match tokio::time::timeout_at(deadline, self.pool.register_channel(address)).await {
                    Ok(Ok(channel)) => channel,
                    Ok(Err(e)) => {
                        queue.forget_one();
                        return Err(e);
                    }
                    Err(_) => {
                        queue.forget_one();
                        return Err(RpcError::PoolTimeout(timeout_ms));
                    }
                }
            } else {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining == Duration::ZERO {
                    return Err(RpcError::PoolTimeout(timeout_ms));
                }
                tokio::select! {
                    polled = queue.poll(remaining) => match polled {
                        Some(channel) => channel,
                        None if self.pool.is_closed() => return Err(RpcError::Shutdown),
                        None => return Err(RpcError::PoolTimeout(timeout_ms)),
                    },
                    // a discarded channel left room to open a new one
                    _ = &mut room => continue,
                }
            };

            if channel.is_healthy() {
                return Ok(ChannelLease {
                    pool: &self.pool,
                    queue,
                    address,
                    channel,
                });
            }

            warn!(address = %address, "Borrowed an unhealthy channel, discarding it");
            channel.close();
            queue.forget_one();
        }
    }
}

async fn wait_for(
    receiver: oneshot::Receiver<CallResponse>,
    deadline: Instant,
    timeout_ms: u64,
) -> Result<CallResponse> {
    match tokio::time::timeout_at(deadline, receiver).await {
        Ok(Ok(response)) => Ok(response),
        // the sweeper evicted the slot
        Ok(Err(_)) => Err(RpcError::Timeout(timeout_ms)),
        Err(_) => Err(RpcError::Timeout(timeout_ms)),
    }
}

/// Removes the call's slot when dropped.
struct SlotGuard<'a> {
    holder: &'a ResponseHolder,
    id: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.holder.remove(self.id);
    }
}

/// A borrowed channel, released back to its pool when dropped.
struct ChannelLease<'a> {
    pool: &'a ChannelPool,
    queue: &'a ChannelQueue,
    address: &'a str,
    channel: Arc<Channel>,
}

impl ChannelLease<'_> {
    fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl Drop for ChannelLease<'_> {
    fn drop(&mut self) {
        self.pool
            .release(self.queue, Arc::clone(&self.channel), self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ares_common::transport::{JsonCodec, TcpTransport};
    use ares_common::{Outcome, ServiceDescriptor};
    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};

    use crate::pool::PoolConfig;

    async fn answer(mut stream: TcpStream) {
        while let Ok(Some(frame)) = TcpTransport::receive_message(&mut stream).await {
            let request = JsonCodec::decode_request(&frame).unwrap();
            let response = CallResponse::success(request.id, request.timeout_ms, json!(request.method));
            let data = JsonCodec::encode_response(&response).unwrap();
            if TcpTransport::send_message(&mut stream, &data).await.is_err() {
                return;
            }
        }
    }

    /// Answers every request with its method name. The first `hang_up`
    /// connections are closed right after accept.
    async fn echo_server(hang_up: usize) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if counter.fetch_add(1, Ordering::SeqCst) < hang_up {
                    drop(stream);
                    continue;
                }
                tokio::spawn(answer(stream));
            }
        });
        (addr, accepted)
    }

    fn engine(channels: usize) -> InvocationEngine {
        let holder = Arc::new(ResponseHolder::new());
        let pool = Arc::new(ChannelPool::new(
            PoolConfig {
                channels_per_address: channels,
                connect_timeout_ms: 500,
            },
            holder.clone(),
        ));
        InvocationEngine::new(pool, holder)
    }

    fn request(addr: &str, method: &str, timeout_ms: u64) -> CallRequest {
        let (host, port) = addr.rsplit_once(':').unwrap();
        let service = ServiceDescriptor::new("svc", host, port.parse().unwrap());
        CallRequest::new(service, method, vec![]).with_timeout(timeout_ms)
    }

    fn seed(addr: &str) -> HashMap<String, Vec<ServiceDescriptor>> {
        HashMap::from([(addr.to_string(), Vec::new())])
    }

    #[tokio::test]
    async fn test_invoke_returns_response_and_releases() {
        let (addr, _) = echo_server(0).await;
        let engine = engine(2);

        let response = engine.invoke(request(&addr, "ping", 1000)).await.unwrap();
        assert_eq!(response.outcome, Outcome::Success(json!("ping")));
        assert!(response.received_at_ms.is_some());

        let queue = engine.pool().acquire(&addr);
        assert_eq!(queue.live(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(engine.holder().len(), 0);
    }

    #[tokio::test]
    async fn test_stale_idle_channel_is_replaced() {
        let (addr, accepted) = echo_server(1).await;
        let engine = engine(1);
        engine.pool().init(&seed(&addr)).await.unwrap();

        let queue = engine.pool().acquire(&addr);
        assert_eq!(queue.live(), 1);
        // the reader notices the hang-up and marks the idle channel broken
        tokio::time::sleep(Duration::from_millis(100)).await;

        let response = engine.invoke(request(&addr, "ping", 1000)).await.unwrap();
        assert_eq!(response.outcome, Outcome::Success(json!("ping")));
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(queue.live(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_waiter_opens_channel_when_borrowed_one_is_discarded() {
        let (addr, _) = echo_server(0).await;
        let engine = Arc::new(engine(1));
        engine.pool().init(&seed(&addr)).await.unwrap();

        let queue = engine.pool().acquire(&addr);
        let borrowed = queue.try_poll().unwrap();

        let started = Instant::now();
        let waiter = {
            let engine = engine.clone();
            let request = request(&addr, "ping", 1000);
            tokio::spawn(async move { engine.invoke(request).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        borrowed.close();
        engine.pool().release(&queue, borrowed, &addr);

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.outcome, Outcome::Success(json!("ping")));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(queue.live(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_times_out_waiting_for_channel() {
        let (addr, _) = echo_server(0).await;
        let engine = engine(1);
        engine.pool().init(&seed(&addr)).await.unwrap();

        let queue = engine.pool().acquire(&addr);
        let _borrowed = queue.try_poll().unwrap();

        let result = engine.invoke(request(&addr, "ping", 50)).await;
        assert!(matches!(result, Err(RpcError::PoolTimeout(50))));
        assert_eq!(engine.holder().len(), 0);
    }
}
