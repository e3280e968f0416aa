//! Message broker contract and the in-process broker.
//!
//! The contract mirrors the subset of an AMQP channel the RPC layer needs:
//! non-durable named queues, exclusive server-named reply queues, publishing
//! with correlation id and reply-to properties, and consumers with a
//! prefetch window and explicit acknowledgement.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker closed")]
    Closed,
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
    #[error("publish to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Bytes,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: u64,
    pub body: Bytes,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Unacknowledged deliveries allowed in flight; 0 means unbounded.
    pub prefetch: u16,
    /// Deliveries count as acknowledged as soon as they are handed out.
    pub auto_ack: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            prefetch: 1,
            auto_ack: false,
        }
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync + fmt::Debug {
    /// Declare a non-durable queue. Idempotent.
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Declare an exclusive queue with a generated name.
    async fn declare_reply_queue(&self) -> Result<String, BrokerError>;

    /// Remove a queue and drop anything buffered in it. Deleting a missing
    /// queue succeeds.
    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError>;

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Box<dyn Consumer>, BrokerError>;
}

#[async_trait]
pub trait Consumer: Send {
    /// Next delivery, or `None` once the broker is closed.
    async fn next(&mut self) -> Option<Delivery>;

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError>;
}

type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<Delivery>>>;

#[derive(Debug, Clone)]
struct MemoryQueue {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: SharedReceiver,
}

impl MemoryQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

#[derive(Debug, Default)]
struct BrokerStats {
    published: AtomicU64,
    acked: AtomicU64,
}

/// In-process broker over tokio channels.
///
/// Queues are created on first use, so publishing before a consumer exists
/// buffers the message. Consumers of the same queue compete for deliveries.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<DashMap<String, MemoryQueue>>,
    next_tag: Arc<AtomicU64>,
    stats: Arc<BrokerStats>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> MemoryQueue {
        self.queues
            .entry(name.to_string())
            .or_insert_with(MemoryQueue::new)
            .clone()
    }

    /// Drop every queue; consumers drain what is buffered and then end.
    pub fn close(&self) {
        self.queues.clear();
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub fn published_count(&self) -> u64 {
        self.stats.published.load(Ordering::SeqCst)
    }

    pub fn acked_count(&self) -> u64 {
        self.stats.acked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.queue(name);
        Ok(())
    }

    async fn declare_reply_queue(&self) -> Result<String, BrokerError> {
        let name = format!("amq.gen-{}", uuid::Uuid::new_v4());
        self.queue(&name);
        Ok(name)
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.queues.remove(name);
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        let delivery = Delivery {
            tag: self.next_tag.fetch_add(1, Ordering::SeqCst) + 1,
            body: message.body,
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
        };
        self.queue(queue).tx.send(delivery).map_err(|e| BrokerError::Publish {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;
        self.stats.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Box<dyn Consumer>, BrokerError> {
        let window = if options.prefetch == 0 {
            Semaphore::MAX_PERMITS
        } else {
            options.prefetch as usize
        };
        Ok(Box::new(MemoryConsumer {
            rx: self.queue(queue).rx,
            window: Arc::new(Semaphore::new(window)),
            unacked: HashMap::new(),
            auto_ack: options.auto_ack,
            stats: self.stats.clone(),
        }))
    }
}

struct MemoryConsumer {
    rx: SharedReceiver,
    window: Arc<Semaphore>,
    unacked: HashMap<u64, OwnedSemaphorePermit>,
    auto_ack: bool,
    stats: Arc<BrokerStats>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        let permit = self.window.clone().acquire_owned().await.ok()?;
        let delivery = self.rx.lock().await.recv().await?;

        if self.auto_ack {
            self.stats.acked.fetch_add(1, Ordering::SeqCst);
        } else {
            self.unacked.insert(delivery.tag, permit);
        }
        Some(delivery)
    }

    async fn ack(&mut self, tag: u64) -> Result<(), BrokerError> {
        match self.unacked.remove(&tag) {
            Some(_permit) => {
                self.stats.acked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(BrokerError::UnknownDeliveryTag(tag)),
        }
    }
}
