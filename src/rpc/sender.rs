//! Outbound RPC calls with reply correlation.
//!
//! # Data Flow
//! ```text
//! call(service, request)
//!     → pending[correlation_id] = {reply sender, created_at}
//!     → publish(service, {correlation_id, reply_to})
//!
//! reply loop (exclusive reply queue):
//!     → pending.remove(correlation_id) → resolve or reject the caller
//!     → unknown ids are logged and dropped
//!
//! sweep loop (every call_lifetime):
//!     → created_at + call_lifetime <= now → reject with Timeout
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::rpc::broker::{BrokerError, ConsumeOptions, Delivery, MessageBroker, OutboundMessage};
use crate::rpc::message::{RpcErrorEnvelope, RpcReply, RpcRequest, RpcResponse};

pub const DEFAULT_CALL_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// Lower bound for the sweep period; a zero lifetime still gets swept.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcCallError {
    #[error("neither processor name nor method/path are set")]
    InvalidRequest,
    #[error("broker error: {0}")]
    Broker(String),
    #[error("malformed reply: {0}")]
    InvalidReply(String),
    #[error("remote error {}: {}", .0.code, .0.message)]
    Remote(RpcErrorEnvelope),
    #[error("rpc call timed out")]
    Timeout,
    #[error("rpc client closed")]
    Closed,
}

impl From<BrokerError> for RpcCallError {
    fn from(err: BrokerError) -> Self {
        RpcCallError::Broker(err.to_string())
    }
}

type CallResult = Result<RpcResponse, RpcCallError>;

struct PendingCall {
    reply: oneshot::Sender<CallResult>,
    created_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct RpcClientOptions {
    pub call_lifetime: Duration,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        Self {
            call_lifetime: DEFAULT_CALL_LIFETIME,
        }
    }
}

struct ClientInner {
    broker: Arc<dyn MessageBroker>,
    reply_queue: String,
    pending: DashMap<String, PendingCall>,
    call_lifetime: Duration,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Caller side of the RPC multiplexer. Clones share one reply queue.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("reply_queue", &self.inner.reply_queue)
            .field("pending", &self.inner.pending.len())
            .field("call_lifetime", &self.inner.call_lifetime)
            .finish()
    }
}

impl RpcClient {
    /// Declare the reply queue and spawn the reply and sweep loops.
    pub async fn start(
        broker: Arc<dyn MessageBroker>,
        options: RpcClientOptions,
    ) -> Result<Self, BrokerError> {
        if options.call_lifetime.is_zero() {
            tracing::warn!("RPC call lifetime is zero, every call will time out at the next sweep");
        }
        let reply_queue = broker.declare_reply_queue().await?;
        let mut consumer = broker
            .consume(
                &reply_queue,
                ConsumeOptions {
                    prefetch: 0,
                    auto_ack: true,
                },
            )
            .await?;

        let inner = Arc::new(ClientInner {
            broker,
            reply_queue,
            pending: DashMap::new(),
            call_lifetime: options.call_lifetime,
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let reply_loop = {
            let inner = inner.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = inner.shutdown.wait() => break,
                        delivery = consumer.next() => match delivery {
                            Some(delivery) => inner.dispatch_reply(delivery),
                            None => break,
                        },
                    }
                }
                tracing::debug!("RPC reply loop stopped");
            })
        };

        let sweep_loop = {
            let inner = inner.clone();
            tokio::spawn(async move {
                let period = inner.call_lifetime.max(MIN_SWEEP_PERIOD);
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = inner.shutdown.wait() => break,
                        _ = ticker.tick() => {
                            inner.sweep_expired();
                        }
                    }
                }
                tracing::debug!("RPC sweep loop stopped");
            })
        };

        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.push(reply_loop);
            tasks.push(sweep_loop);
        }

        tracing::info!(reply_queue = %inner.reply_queue, "RPC client started");
        Ok(Self { inner })
    }

    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Publish `request` to `service` and return a future for its reply.
    pub async fn send(&self, service: &str, request: RpcRequest) -> Result<PendingReply, RpcCallError> {
        if !request.is_addressable() {
            return Err(RpcCallError::InvalidRequest);
        }

        let body = serde_json::to_vec(&request).map_err(|e| RpcCallError::Broker(e.to_string()))?;
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        match self.inner.pending.entry(correlation_id.clone()) {
            Entry::Occupied(_) => return Err(RpcCallError::Broker("correlation id collision".into())),
            Entry::Vacant(slot) => {
                slot.insert(PendingCall {
                    reply: tx,
                    created_at: Instant::now(),
                });
            }
        }
        // Checked after registering so a concurrent `stop` either drains this
        // entry or is seen here.
        if self.inner.shutdown.is_triggered() {
            self.inner.pending.remove(&correlation_id);
            return Err(RpcCallError::Closed);
        }
        metrics::record_rpc_pending(self.inner.pending.len());

        let message = OutboundMessage {
            body: Bytes::from(body),
            correlation_id: Some(correlation_id.clone()),
            reply_to: Some(self.inner.reply_queue.clone()),
        };
        if let Err(e) = self.inner.broker.publish(service, message).await {
            self.inner.pending.remove(&correlation_id);
            return Err(e.into());
        }

        tracing::debug!(service = %service, correlation_id = %correlation_id, "RPC request sent");
        Ok(PendingReply { correlation_id, rx })
    }

    /// `send` and wait for the reply.
    pub async fn call(&self, service: &str, request: RpcRequest) -> Result<RpcResponse, RpcCallError> {
        let result = match self.send(service, request).await {
            Ok(pending) => pending.await,
            Err(e) => Err(e),
        };
        metrics::record_rpc_call(match &result {
            Ok(_) => "ok",
            Err(RpcCallError::Remote(_)) => "remote_error",
            Err(RpcCallError::Timeout) => "timeout",
            Err(RpcCallError::Closed) => "closed",
            Err(_) => "error",
        });
        result
    }

    /// Reject calls older than the lifetime. Returns how many were rejected.
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep_expired()
    }

    /// Stop both loops and reject every pending call with `Closed`.
    pub async fn stop(&self) {
        self.inner.shutdown.trigger();

        let tasks = match self.inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }

        let ids: Vec<String> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, call)) = self.inner.pending.remove(&id) {
                let _ = call.reply.send(Err(RpcCallError::Closed));
            }
        }
        metrics::record_rpc_pending(0);

        if let Err(e) = self.inner.broker.delete_queue(&self.inner.reply_queue).await {
            tracing::warn!(reply_queue = %self.inner.reply_queue, error = %e, "Failed to delete reply queue");
        }
        tracing::info!(reply_queue = %self.inner.reply_queue, "RPC client stopped");
    }
}

impl ClientInner {
    fn dispatch_reply(&self, delivery: Delivery) {
        let Some(correlation_id) = delivery.correlation_id else {
            tracing::warn!("RPC reply without correlation id dropped");
            return;
        };

        let Some((_, call)) = self.pending.remove(&correlation_id) else {
            tracing::warn!(correlation_id = %correlation_id, "message received with no callback");
            return;
        };
        metrics::record_rpc_pending(self.pending.len());

        let result = match serde_json::from_slice::<RpcReply>(&delivery.body) {
            Ok(RpcReply::Success { headers, body }) => Ok(RpcResponse { headers, body }),
            Ok(RpcReply::Failure { error }) => Err(RpcCallError::Remote(error)),
            Err(e) => Err(RpcCallError::InvalidReply(e.to_string())),
        };
        if call.reply.send(result).is_err() {
            tracing::debug!(correlation_id = %correlation_id, "Caller no longer waiting for reply");
        }
    }

    fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.created_at + self.call_lifetime <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut rejected = 0;
        for id in expired {
            if let Some((_, call)) = self
                .pending
                .remove_if(&id, |_, call| call.created_at + self.call_lifetime <= now)
            {
                tracing::warn!(correlation_id = %id, "RPC call timed out");
                let _ = call.reply.send(Err(RpcCallError::Timeout));
                rejected += 1;
            }
        }
        if rejected > 0 {
            metrics::record_rpc_pending(self.pending.len());
        }
        rejected
    }
}

/// Resolves with the reply for one correlation id.
pub struct PendingReply {
    correlation_id: String,
    rx: oneshot::Receiver<CallResult>,
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.correlation_id)
            .finish()
    }
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Future for PendingReply {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RpcCallError::Closed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RouteMethod;
    use crate::rpc::broker::{Consumer, MemoryBroker};
    use serde_json::json;

    async fn start_client(broker: &MemoryBroker, lifetime: Duration) -> RpcClient {
        RpcClient::start(
            Arc::new(broker.clone()),
            RpcClientOptions {
                call_lifetime: lifetime,
            },
        )
        .await
        .unwrap()
    }

    async fn reply(broker: &MemoryBroker, delivery: &Delivery, reply: RpcReply) {
        broker
            .publish(
                delivery.reply_to.as_deref().unwrap(),
                OutboundMessage {
                    body: Bytes::from(serde_json::to_vec(&reply).unwrap()),
                    correlation_id: delivery.correlation_id.clone(),
                    reply_to: None,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejects_unaddressable_request() {
        let broker = MemoryBroker::new();
        let client = start_client(&broker, DEFAULT_CALL_LIFETIME).await;
        let err = client.send("svc", RpcRequest::default()).await.unwrap_err();
        assert_eq!(err, RpcCallError::InvalidRequest);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_replies_resolve_their_callers() {
        let broker = MemoryBroker::new();
        let client = start_client(&broker, DEFAULT_CALL_LIFETIME).await;
        let mut service = broker.consume("svc", ConsumeOptions { prefetch: 0, auto_ack: true }).await.unwrap();

        let first = client.send("svc", RpcRequest::named("a", json!({}))).await.unwrap();
        let second = client
            .send("svc", RpcRequest::to_path(RouteMethod::Get, "/b", json!({})))
            .await
            .unwrap();
        assert_ne!(first.correlation_id(), second.correlation_id());
        assert_eq!(client.pending_count(), 2);

        let d1 = service.next().await.unwrap();
        let d2 = service.next().await.unwrap();
        reply(&broker, &d2, RpcReply::Success { headers: Default::default(), body: json!("second") }).await;
        reply(&broker, &d1, RpcReply::Success { headers: Default::default(), body: json!("first") }).await;

        assert_eq!(second.await.unwrap().body, json!("second"));
        assert_eq!(first.await.unwrap().body, json!("first"));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_is_surfaced() {
        let broker = MemoryBroker::new();
        let client = start_client(&broker, DEFAULT_CALL_LIFETIME).await;
        let mut service = broker.consume("svc", ConsumeOptions::default()).await.unwrap();

        let pending = client.send("svc", RpcRequest::named("a", json!({}))).await.unwrap();
        let delivery = service.next().await.unwrap();
        let err = crate::error::RequestError::not_found("nope");
        reply(&broker, &delivery, RpcReply::failure(&err)).await;

        match pending.await {
            Err(RpcCallError::Remote(envelope)) => assert_eq!(envelope.code, 404),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_times_out_and_drops_late_reply() {
        let broker = MemoryBroker::new();
        let client = start_client(&broker, Duration::from_secs(10)).await;
        let mut service = broker.consume("svc", ConsumeOptions { prefetch: 0, auto_ack: true }).await.unwrap();

        let pending = client.send("svc", RpcRequest::named("slow", json!({}))).await.unwrap();
        assert_eq!(pending.await, Err(RpcCallError::Timeout));
        assert_eq!(client.pending_count(), 0);

        // A late reply finds no pending entry and is dropped.
        let delivery = service.next().await.unwrap();
        reply(&broker, &delivery, RpcReply::Success { headers: Default::default(), body: json!(1) }).await;
        tokio::task::yield_now().await;
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_fresh_calls() {
        let broker = MemoryBroker::new();
        let client = start_client(&broker, Duration::from_secs(10)).await;

        let _old = client.send("svc", RpcRequest::named("a", json!({}))).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        let _fresh = client.send("svc", RpcRequest::named("b", json!({}))).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;

        assert_eq!(client.sweep_expired(), 1);
        assert_eq!(client.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_rejects_pending_calls() {
        let broker = MemoryBroker::new();
        let client = start_client(&broker, DEFAULT_CALL_LIFETIME).await;
        let pending = client.send("svc", RpcRequest::named("a", json!({}))).await.unwrap();

        client.stop().await;
        assert_eq!(pending.await, Err(RpcCallError::Closed));
        assert_eq!(
            client.send("svc", RpcRequest::named("a", json!({}))).await.unwrap_err(),
            RpcCallError::Closed
        );
        assert!(!broker.has_queue(client.reply_queue()));
    }

    #[tokio::test]
    async fn test_send_during_stop_is_not_left_pending() {
        let broker = MemoryBroker::new();
        let client = start_client(&broker, DEFAULT_CALL_LIFETIME).await;

        // Shutdown observed, drain not yet run.
        client.inner.shutdown.trigger();
        let err = client.send("svc", RpcRequest::named("a", json!({}))).await.unwrap_err();
        assert_eq!(err, RpcCallError::Closed);
        assert_eq!(client.pending_count(), 0);

        client.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_lifetime_still_times_out() {
        let broker = MemoryBroker::new();
        let client = start_client(&broker, Duration::ZERO).await;

        let pending = client.send("svc", RpcRequest::named("a", json!({}))).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), pending).await;
        assert_eq!(result, Ok(Err(RpcCallError::Timeout)));
        assert_eq!(client.pending_count(), 0);

        client.stop().await;
    }
}
