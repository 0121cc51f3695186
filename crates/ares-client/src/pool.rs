use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use ares_common::config::ClientSection;
use ares_common::transport::TcpTransport;
use ares_common::{Result, RpcError, ServiceDescriptor};

use crate::channel::Channel;
use crate::holder::ResponseHolder;

/// Connection pool configuration.
///
/// # Default Configuration
///
/// - `channels_per_address`: 10
/// - `connect_timeout_ms`: 3000
///
/// # Example
///
/// ```rust
/// use ares_client::PoolConfig;
///
/// let config = PoolConfig {
///     channels_per_address: 20,
///     connect_timeout_ms: 1000,
/// };
/// assert_eq!(config.channels_per_address, 20);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of channels per address
    pub channels_per_address: usize,
    /// Time allowed for opening one channel, in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            channels_per_address: 10,
            connect_timeout_ms: 3000,
        }
    }
}

impl From<&ClientSection> for PoolConfig {
    fn from(section: &ClientSection) -> Self {
        Self {
            channels_per_address: section.channels_per_address,
            connect_timeout_ms: section.connect_timeout_ms,
        }
    }
}

/// Bounded FIFO of idle channels for one address.
///
/// Besides the idle channels, the queue counts the channels that belong to
/// it, idle or borrowed, so the pool never opens more than `capacity`
/// channels to one address. Waiters are woken both when a channel is
/// offered back and when a discarded channel frees room for a new one.
pub struct ChannelQueue {
    address: String,
    idle: Mutex<VecDeque<Arc<Channel>>>,
    available: Semaphore,
    room: Notify,
    live: AtomicUsize,
    capacity: usize,
}

impl ChannelQueue {
    fn new(address: &str, capacity: usize) -> Self {
        Self {
            address: address.to_string(),
            idle: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Semaphore::new(0),
            room: Notify::new(),
            live: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Takes the oldest idle channel, waiting up to `timeout` for one.
    pub async fn poll(&self, timeout: Duration) -> Option<Arc<Channel>> {
        match tokio::time::timeout(timeout, self.available.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                self.idle.lock().pop_front()
            }
            _ => None,
        }
    }

    /// Takes an idle channel if one is ready.
    pub fn try_poll(&self) -> Option<Arc<Channel>> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        self.idle.lock().pop_front()
    }

    /// Returns a channel to the queue. Fails when the queue is full.
    pub fn offer(&self, channel: Arc<Channel>) -> bool {
        {
            let mut idle = self.idle.lock();
            if idle.len() >= self.capacity {
                return false;
            }
            idle.push_back(channel);
        }
        self.available.add_permits(1);
        true
    }

    /// Claims room for one more channel. Callers that fail to open the
    /// channel must hand the room back with [`forget_one`](Self::forget_one).
    pub fn try_reserve(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.capacity).then_some(live + 1)
            })
            .is_ok()
    }

    /// Gives back the room of a channel that was discarded and wakes every
    /// task waiting in [`room_freed`](Self::room_freed).
    pub fn forget_one(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| live.checked_sub(1));
        self.room.notify_waiters();
    }

    /// Completes on the next [`forget_one`](Self::forget_one). Enable the
    /// future before checking [`try_reserve`](Self::try_reserve) so a release
    /// in between is not missed.
    pub fn room_freed(&self) -> Notified<'_> {
        self.room.notified()
    }

    /// Number of idle channels.
    pub fn len(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of channels owned by this queue, idle or borrowed.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn drain(&self) -> Vec<Arc<Channel>> {
        self.available.close();
        self.idle.lock().drain(..).collect()
    }
}

/// Per-address pools of reusable channels.
///
/// # Architecture
///
/// - Channels are grouped by target address (`host:port`)
/// - Each address has one [`ChannelQueue`] bounded by `channels_per_address`
/// - Idle channels are reused in FIFO order
/// - Broken channels are closed on release instead of being re-queued
///
/// # Thread Safety
///
/// The pool is safe to share between tasks. A borrowed channel belongs to
/// its borrower until it is released.
pub struct ChannelPool {
    transport: TcpTransport,
    holder: Arc<ResponseHolder>,
    queues: DashMap<String, Arc<ChannelQueue>>,
    config: PoolConfig,
    closed: AtomicBool,
}

impl ChannelPool {
    pub fn new(config: PoolConfig, holder: Arc<ResponseHolder>) -> Self {
        let transport =
            TcpTransport::new().with_connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        Self {
            transport,
            holder,
            queues: DashMap::new(),
            config,
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Opens channels to every distinct address and seeds its queue.
    ///
    /// Unreachable addresses are logged and left with an empty queue; calls
    /// to them open channels on demand.
    pub async fn init(&self, addresses: &HashMap<String, Vec<ServiceDescriptor>>) -> Result<()> {
        for address in addresses.keys() {
            let queue = self.acquire(address);
            let mut opened = 0;

            while queue.try_reserve() {
                match self.register_channel(address).await {
                    Ok(channel) => {
                        if queue.offer(channel) {
                            opened += 1;
                        } else {
                            queue.forget_one();
                            break;
                        }
                    }
                    Err(e) => {
                        queue.forget_one();
                        warn!(address = %address, error = %e, "Could not seed channel pool");
                        break;
                    }
                }
            }

            info!(address = %address, channels = opened, "Channel pool seeded");
        }
        Ok(())
    }

    /// Queue for `address`, created empty on first sight.
    pub fn acquire(&self, address: &str) -> Arc<ChannelQueue> {
        if let Some(queue) = self.queues.get(address) {
            return queue.clone();
        }
        self.queues
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(ChannelQueue::new(address, self.config.channels_per_address)))
            .clone()
    }

    /// Opens a new channel to `address`.
    pub async fn register_channel(&self, address: &str) -> Result<Arc<Channel>> {
        if self.is_closed() {
            return Err(RpcError::Shutdown);
        }
        Channel::connect(address, &self.transport, self.holder.clone()).await
    }

    /// Returns a borrowed channel. Unhealthy channels are closed and their
    /// room in the queue is given back.
    pub fn release(&self, queue: &ChannelQueue, channel: Arc<Channel>, address: &str) {
        if self.is_closed() || !channel.is_healthy() {
            debug!(address = %address, "Discarding channel on release");
            channel.close();
            queue.forget_one();
            return;
        }

        if !queue.offer(channel.clone()) {
            warn!(address = %address, "Channel queue full, closing channel");
            channel.close();
            queue.forget_one();
        }
    }

    /// Closes every idle channel. Borrowed channels are closed when released.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut closed = 0;
        for entry in self.queues.iter() {
            for channel in entry.value().drain() {
                channel.close();
                entry.value().forget_one();
                closed += 1;
            }
        }
        info!(channels = closed, "Channel pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn idle_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    fn pool(channels: usize) -> ChannelPool {
        ChannelPool::new(
            PoolConfig {
                channels_per_address: channels,
                connect_timeout_ms: 500,
            },
            Arc::new(ResponseHolder::new()),
        )
    }

    fn seed(addr: &str) -> HashMap<String, Vec<ServiceDescriptor>> {
        let mut map = HashMap::new();
        map.insert(addr.to_string(), Vec::new());
        map
    }

    #[test]
    fn test_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.channels_per_address, 10);
        assert_eq!(config.connect_timeout_ms, 3000);
    }

    #[tokio::test]
    async fn test_init_seeds_queue() {
        let addr = idle_server().await;
        let pool = pool(3);
        pool.init(&seed(&addr)).await.unwrap();

        let queue = pool.acquire(&addr);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.live(), 3);
    }

    #[tokio::test]
    async fn test_init_tolerates_unreachable_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = pool(2);
        pool.init(&seed(&addr)).await.unwrap();
        let queue = pool.acquire(&addr);
        assert!(queue.is_empty());
        assert_eq!(queue.live(), 0);
    }

    #[tokio::test]
    async fn test_acquire_creates_empty_queue_once() {
        let pool = pool(2);
        let a = pool.acquire("127.0.0.1:1");
        let b = pool.acquire("127.0.0.1:1");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_empty());
    }

    #[tokio::test]
    async fn test_poll_times_out_on_empty_queue() {
        let pool = pool(1);
        let queue = pool.acquire("127.0.0.1:1");

        let start = std::time::Instant::now();
        assert!(queue.poll(Duration::from_millis(30)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_release_requeues_healthy_channel() {
        let addr = idle_server().await;
        let pool = pool(1);
        pool.init(&seed(&addr)).await.unwrap();
        let queue = pool.acquire(&addr);

        let channel = queue.poll(Duration::from_millis(100)).await.unwrap();
        assert!(queue.is_empty());

        pool.release(&queue, channel, &addr);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.live(), 1);
    }

    #[tokio::test]
    async fn test_release_never_requeues_broken_channel() {
        let addr = idle_server().await;
        let pool = pool(1);
        pool.init(&seed(&addr)).await.unwrap();
        let queue = pool.acquire(&addr);

        let channel = queue.try_poll().unwrap();
        channel.close();
        pool.release(&queue, channel, &addr);

        assert!(queue.is_empty());
        assert_eq!(queue.live(), 0);
        // the freed room can be claimed again
        assert!(queue.try_reserve());
    }

    #[tokio::test]
    async fn test_reserve_respects_capacity() {
        let pool = pool(2);
        let queue = pool.acquire("127.0.0.1:1");
        assert!(queue.try_reserve());
        assert!(queue.try_reserve());
        assert!(!queue.try_reserve());
        queue.forget_one();
        assert!(queue.try_reserve());
    }

    #[tokio::test]
    async fn test_close_drains_queues() {
        let addr = idle_server().await;
        let pool = pool(2);
        pool.init(&seed(&addr)).await.unwrap();
        let queue = pool.acquire(&addr);

        pool.close();
        assert!(queue.is_empty());
        assert!(queue.poll(Duration::from_millis(10)).await.is_none());
        assert!(matches!(pool.register_channel(&addr).await, Err(RpcError::Shutdown)));
    }

    #[tokio::test]
    async fn test_discarding_channel_wakes_room_waiters() {
        let addr = idle_server().await;
        let pool = Arc::new(pool(1));
        pool.init(&seed(&addr)).await.unwrap();
        let queue = pool.acquire(&addr);
        let channel = queue.try_poll().unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let freed = queue.room_freed();
                tokio::pin!(freed);
                freed.as_mut().enable();
                assert!(!queue.try_reserve());
                tokio::time::timeout(Duration::from_secs(1), freed).await.is_ok()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.close();
        pool.release(&queue, channel, &addr);

        assert!(waiter.await.unwrap());
        assert_eq!(queue.live(), 0);
        assert!(queue.try_reserve());
    }
}
