//! Skiff queue: the build queue client contract, the JSON envelope codec, and an
//! in-memory broker with manual acknowledgment.

#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use metrics::counter;
use skiff_core::envelope::{BuildRequest, BuildResponse};
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("publish to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },
    #[error("unknown delivery tag {0}")]
    UnknownTag(u64),
    #[error("transport: {0}")]
    Transport(String),
}

#[derive(Debug, thiserror::Error)]
#[error("malformed envelope: {0}")]
pub struct CodecError(#[from] serde_json::Error);

/// One message handed to a consumer. It stays unacknowledged until `ack` or `nack` is called with its tag.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

/// Durable publish/subscribe client with manual acknowledgment.
///
/// Consumers run with prefetch 1: `next_delivery` will not hand out a second
/// message on a queue while the previous one is unacknowledged.
#[async_trait]
pub trait BuildQueueClient: Send + Sync {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), QueueError>;

    /// Wait for the next message. `Ok(None)` once the queue is closed and drained.
    async fn next_delivery(&self, queue: &str) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, tag: u64) -> Result<(), QueueError>;

    /// Negative acknowledgment; without requeue the message is dead-lettered.
    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), QueueError>;
}

pub mod codec {
    use super::*;

    pub fn encode_request(req: &BuildRequest) -> Result<Vec<u8>, CodecError> { Ok(serde_json::to_vec(req)?) }

    pub fn decode_request(raw: &[u8]) -> Result<BuildRequest, CodecError> { Ok(serde_json::from_slice(raw)?) }

    pub fn encode_response(resp: &BuildResponse) -> Result<Vec<u8>, CodecError> { Ok(serde_json::to_vec(resp)?) }

    pub fn decode_response(raw: &[u8]) -> Result<BuildResponse, CodecError> { Ok(serde_json::from_slice(raw)?) }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(Vec<u8>, bool)>,
    unacked: Option<u64>,
    published: Vec<Vec<u8>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    in_flight: HashMap<u64, Delivery>,
    next_tag: u64,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
    dead_letters: Vec<Delivery>,
    closed: bool,
    fail_publish: Option<String>,
    fail_settle: Option<String>,
}

/// In-process broker. Keeps a history of acks, nacks and dead letters for inspection.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self { Self::default() }

    /// Make every subsequent publish fail with `reason` (`None` restores normal behaviour).
    pub fn fail_publishes(&self, reason: Option<&str>) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_publish = reason.map(str::to_string);
        }
    }

    /// Fail the next ack or nack with `reason`, as a dropped channel would. The
    /// delivery goes back to the front of its queue marked redelivered.
    pub fn fail_next_settle(&self, reason: &str) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_settle = Some(reason.to_string());
        }
    }

    /// Stop handing out new deliveries; waiting consumers observe `None`.
    pub fn close(&self) {
        if let Ok(mut s) = self.state.lock() {
            s.closed = true;
        }
        self.notify.notify_waiters();
    }

    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.snapshot(|s| s.queues.get(queue).map(|q| q.published.clone()).unwrap_or_default())
    }

    pub fn ready_len(&self, queue: &str) -> usize {
        self.snapshot(|s| s.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0))
    }

    pub fn in_flight_len(&self) -> usize { self.snapshot(|s| s.in_flight.len()) }

    pub fn acked(&self) -> Vec<u64> { self.snapshot(|s| s.acked.clone()) }

    pub fn nacked(&self) -> Vec<(u64, bool)> { self.snapshot(|s| s.nacked.clone()) }

    pub fn dead_letters(&self) -> Vec<Delivery> { self.snapshot(|s| s.dead_letters.clone()) }

    fn snapshot<T: Default>(&self, f: impl FnOnce(&BrokerState) -> T) -> T {
        self.state.lock().map(|s| f(&s)).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Transport("broker lock poisoned".into()))
    }

    fn settle(&self, tag: u64) -> Result<Delivery, QueueError> {
        let mut s = self.lock()?;
        let d = s.in_flight.remove(&tag).ok_or(QueueError::UnknownTag(tag))?;
        let lost = s.fail_settle.take();
        if let Some(q) = s.queues.get_mut(&d.queue) {
            if q.unacked == Some(tag) {
                q.unacked = None;
            }
            if lost.is_some() {
                q.ready.push_front((d.payload.clone(), true));
            }
        }
        if let Some(reason) = lost {
            drop(s);
            self.notify.notify_waiters();
            return Err(QueueError::Transport(reason));
        }
        Ok(d)
    }
}

#[async_trait]
impl BuildQueueClient for MemoryBroker {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        {
            let mut s = self.lock()?;
            if let Some(reason) = s.fail_publish.clone() {
                counter!("queue_publish_err", 1u64);
                return Err(QueueError::Publish { queue: queue.to_string(), reason });
            }
            let q = s.queues.entry(queue.to_string()).or_default();
            q.published.push(payload.clone());
            q.ready.push_back((payload, false));
        }
        counter!("queue_published", 1u64);
        debug!(queue = %queue, "broker: published");
        self.notify.notify_waiters();
        Ok(())
    }

    async fn next_delivery(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        loop {
            // Registered before the state check so a publish in between is not missed.
            let notified = self.notify.notified();
            {
                let mut s = self.lock()?;
                let tag = s.next_tag + 1;
                let q = s.queues.entry(queue.to_string()).or_default();
                if q.unacked.is_none() {
                    if let Some((payload, redelivered)) = q.ready.pop_front() {
                        q.unacked = Some(tag);
                        let d = Delivery { tag, queue: queue.to_string(), payload, redelivered };
                        s.next_tag = tag;
                        s.in_flight.insert(tag, d.clone());
                        return Ok(Some(d));
                    }
                }
                if s.closed {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    async fn ack(&self, tag: u64) -> Result<(), QueueError> {
        self.settle(tag)?;
        self.lock()?.acked.push(tag);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<(), QueueError> {
        let d = self.settle(tag)?;
        {
            let mut s = self.lock()?;
            s.nacked.push((tag, requeue));
            if requeue {
                let q = s.queues.entry(d.queue.clone()).or_default();
                q.ready.push_front((d.payload, true));
            } else {
                warn!(queue = %d.queue, tag, "broker: message dead-lettered");
                s.dead_letters.push(d);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn prefetch_one_holds_second_message_until_settled() {
        let b = Arc::new(MemoryBroker::new());
        b.publish("q", b"one".to_vec()).await.unwrap();
        b.publish("q", b"two".to_vec()).await.unwrap();
        let first = b.next_delivery("q").await.unwrap().unwrap();
        assert_eq!(first.payload, b"one");

        let blocked = tokio::time::timeout(Duration::from_millis(50), b.next_delivery("q")).await;
        assert!(blocked.is_err(), "second delivery must wait for ack");

        b.ack(first.tag).await.unwrap();
        let second = b.next_delivery("q").await.unwrap().unwrap();
        assert_eq!(second.payload, b"two");
        assert_eq!(b.acked(), vec![first.tag]);
    }

    #[tokio::test]
    async fn nack_without_requeue_dead_letters() {
        let b = MemoryBroker::new();
        b.publish("q", b"bad".to_vec()).await.unwrap();
        let d = b.next_delivery("q").await.unwrap().unwrap();
        b.nack(d.tag, false).await.unwrap();
        assert_eq!(b.dead_letters().len(), 1);
        assert_eq!(b.ready_len("q"), 0);
        assert_eq!(b.in_flight_len(), 0);
        assert!(matches!(b.ack(d.tag).await, Err(QueueError::UnknownTag(_))));
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let b = MemoryBroker::new();
        b.publish("q", b"m".to_vec()).await.unwrap();
        let d = b.next_delivery("q").await.unwrap().unwrap();
        b.nack(d.tag, true).await.unwrap();
        let again = b.next_delivery("q").await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_ne!(again.tag, d.tag);
    }

    #[tokio::test]
    async fn lost_ack_redelivers_the_message() {
        let b = MemoryBroker::new();
        b.publish("q", b"m".to_vec()).await.unwrap();
        let d = b.next_delivery("q").await.unwrap().unwrap();
        b.fail_next_settle("channel closed");
        assert!(matches!(b.ack(d.tag).await, Err(QueueError::Transport(_))));
        assert!(b.acked().is_empty());

        let again = b.next_delivery("q").await.unwrap().unwrap();
        assert!(again.redelivered);
        b.ack(again.tag).await.unwrap();
        assert_eq!(b.acked(), vec![again.tag]);
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_publish_and_close() {
        let b = Arc::new(MemoryBroker::new());
        let waiter = tokio::spawn({
            let b = Arc::clone(&b);
            async move { b.next_delivery("q").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        b.publish("q", b"late".to_vec()).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap().unwrap();
        assert_eq!(got.unwrap().payload, b"late");

        let closer = tokio::spawn({
            let b = Arc::clone(&b);
            async move { b.next_delivery("other").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        b.close();
        let none = tokio::time::timeout(Duration::from_secs(1), closer).await.unwrap().unwrap().unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn publish_failure_is_reported() {
        let b = MemoryBroker::new();
        b.fail_publishes(Some("connection reset"));
        let err = b.publish("q", b"x".to_vec()).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert!(b.published("q").is_empty());
    }

    #[test]
    fn codec_rejects_garbage() {
        assert!(codec::decode_response(b"{not json").is_err());
        assert!(codec::decode_response(br#"{"status":"success"}"#).is_err());
    }
}
