use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ares_common::{CallResponse, CorrelationId};

/// Rendezvous for one outstanding call.
///
/// Holds the sending half of the call's result channel, so at most one
/// response is ever delivered.
#[derive(Debug)]
pub struct PendingCallSlot {
    sender: Option<oneshot::Sender<CallResponse>>,
    created: Instant,
    touched: Instant,
    timeout: Duration,
}

impl PendingCallSlot {
    fn new(sender: oneshot::Sender<CallResponse>, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            sender: Some(sender),
            created: now,
            touched: now,
            timeout,
        }
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// True once the slot has gone untouched for longer than its timeout.
    pub fn is_expired(&self) -> bool {
        self.touched.elapsed() > self.timeout
    }

    pub fn is_filled(&self) -> bool {
        self.sender.is_none()
    }
}

/// Correlation map from call id to its pending slot.
///
/// The invocation engine registers a slot before writing a request and
/// removes it when the call finishes, whatever the outcome. Channel readers
/// deposit responses with [`put_result`](Self::put_result). A background
/// sweeper evicts slots that outlived their timeout.
#[derive(Debug, Default)]
pub struct ResponseHolder {
    slots: DashMap<CorrelationId, PendingCallSlot>,
}

impl ResponseHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot for `id` and returns the receiver the caller waits on.
    pub fn register(&self, id: CorrelationId, timeout: Duration) -> oneshot::Receiver<CallResponse> {
        let (tx, rx) = oneshot::channel();
        if self.slots.insert(id.clone(), PendingCallSlot::new(tx, timeout)).is_some() {
            warn!(id = %id, "Correlation id registered twice, previous caller dropped");
        }
        rx
    }

    /// Delivers a response to its slot, stamping the receipt time.
    ///
    /// Returns false when no caller is waiting: unknown or already removed
    /// ids, or a slot that was already filled.
    pub fn put_result(&self, mut response: CallResponse) -> bool {
        response.stamp_received();

        let Some(mut slot) = self.slots.get_mut(&response.id) else {
            debug!(id = %response.id, "Dropping response for unknown call");
            return false;
        };

        slot.touched = Instant::now();
        match slot.sender.take() {
            Some(sender) => sender.send(response).is_ok(),
            None => {
                debug!(id = %response.id, "Dropping duplicate response");
                false
            }
        }
    }

    /// Removes the slot for `id`. Returns true if this call removed it.
    pub fn remove(&self, id: &str) -> bool {
        self.slots.remove(id).is_some()
    }

    /// Evicts every expired slot and returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let expired: Vec<CorrelationId> = self
            .slots
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();

        let removed = expired
            .iter()
            .filter(|id| self.slots.remove_if(id.as_str(), |_, slot| slot.is_expired()).is_some())
            .count();

        if removed > 0 {
            debug!(removed, "Swept expired call slots");
        }
        removed
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every `interval` until the
    /// holder is dropped or the returned task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let holder: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match holder.upgrade() {
                    Some(holder) => {
                        holder.sweep_expired();
                    }
                    None => break,
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(id: &str) -> CallResponse {
        CallResponse::success(id.to_string(), 100, json!("ok"))
    }

    #[tokio::test]
    async fn test_put_result_wakes_waiter_and_stamps() {
        let holder = ResponseHolder::new();
        let rx = holder.register("a".to_string(), Duration::from_secs(1));

        assert!(holder.put_result(response("a")));
        let delivered = rx.await.unwrap();
        assert_eq!(delivered.id, "a");
        assert!(delivered.received_at_ms.is_some());
    }

    #[tokio::test]
    async fn test_unknown_id_is_dropped() {
        let holder = ResponseHolder::new();
        assert!(!holder.put_result(response("ghost")));
        assert!(holder.is_empty());
    }

    #[tokio::test]
    async fn test_second_response_is_dropped() {
        let holder = ResponseHolder::new();
        let _rx = holder.register("a".to_string(), Duration::from_secs(1));

        assert!(holder.put_result(response("a")));
        assert!(!holder.put_result(response("a")));
    }

    #[tokio::test]
    async fn test_remove_happens_once() {
        let holder = ResponseHolder::new();
        let _rx = holder.register("a".to_string(), Duration::from_secs(1));

        assert!(holder.remove("a"));
        assert!(!holder.remove("a"));
        assert!(!holder.contains("a"));
    }

    #[tokio::test]
    async fn test_sweep_only_removes_expired() {
        let holder = ResponseHolder::new();
        let _short = holder.register("short".to_string(), Duration::from_millis(5));
        let _long = holder.register("long".to_string(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(holder.sweep_expired(), 1);
        assert!(!holder.contains("short"));
        assert!(holder.contains("long"));
    }

    #[tokio::test]
    async fn test_swept_slot_closes_receiver() {
        let holder = ResponseHolder::new();
        let rx = holder.register("a".to_string(), Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        holder.sweep_expired();

        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_background_sweeper() {
        let holder = Arc::new(ResponseHolder::new());
        let sweeper = holder.spawn_sweeper(Duration::from_millis(5));
        let _rx = holder.register("a".to_string(), Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(holder.is_empty());

        sweeper.abort();
    }
}
