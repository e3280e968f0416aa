//! Queue consumer that runs compiled pipelines.
//!
//! # Data Flow
//! ```text
//! delivery (prefetch 1, one at a time per queue)
//!     → parse RpcRequest          (malformed → BadRequest reply)
//!     → first matching route      (none → NotFound reply)
//!     → params merged into payload
//!     → Pipeline::handle          (error or panic → error envelope)
//!     → reply to reply_to with the same correlation id
//!     → ack
//!     → deferred actions
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::JoinSet;

use crate::error::RequestError;
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::pipeline::{Pipeline, RequestContext, Transport, TransportRequest};
use crate::rpc::broker::{BrokerError, ConsumeOptions, Delivery, MessageBroker, OutboundMessage};
use crate::rpc::matcher::RouteMatcher;
use crate::rpc::message::{RpcErrorEnvelope, RpcReply, RpcRequest};

struct RpcRoute {
    matcher: RouteMatcher,
    pipeline: Arc<Pipeline>,
}

/// Serves compiled pipelines over the message broker.
pub struct RpcServer {
    broker: Arc<dyn MessageBroker>,
    queues: Vec<String>,
    routes: Arc<Vec<RpcRoute>>,
}

impl RpcServer {
    /// Routes are tried in the order of `pipelines`.
    pub fn new(broker: Arc<dyn MessageBroker>, queues: Vec<String>, pipelines: Vec<Arc<Pipeline>>) -> Self {
        let routes = pipelines
            .into_iter()
            .map(|pipeline| RpcRoute {
                matcher: RouteMatcher::new(pipeline.name(), pipeline.method(), pipeline.pattern().clone()),
                pipeline,
            })
            .collect();
        Self {
            broker,
            queues,
            routes: Arc::new(routes),
        }
    }

    /// Consume every queue until shutdown.
    pub async fn run(self, shutdown: Shutdown) -> Result<(), BrokerError> {
        let mut consumers = JoinSet::new();

        for queue in &self.queues {
            self.broker.declare_queue(queue).await?;
            let consumer = self
                .broker
                .consume(
                    queue,
                    ConsumeOptions {
                        prefetch: 1,
                        auto_ack: false,
                    },
                )
                .await?;
            tracing::info!(queue = %queue, routes = self.routes.len(), "RPC server consuming");

            let worker = QueueWorker {
                queue: queue.clone(),
                broker: self.broker.clone(),
                routes: self.routes.clone(),
            };
            consumers.spawn(worker.run(consumer, shutdown.clone()));
        }

        while let Some(result) = consumers.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "RPC queue worker failed");
            }
        }
        tracing::info!("RPC server stopped");
        Ok(())
    }

    /// Process one raw request body and produce its reply.
    pub async fn process(&self, body: &[u8]) -> RpcReply {
        let (reply, ctx) = dispatch(&self.routes, body).await;
        if let Some(mut ctx) = ctx {
            ctx.complete().await;
        }
        reply
    }
}

struct QueueWorker {
    queue: String,
    broker: Arc<dyn MessageBroker>,
    routes: Arc<Vec<RpcRoute>>,
}

impl QueueWorker {
    async fn run(self, mut consumer: Box<dyn crate::rpc::broker::Consumer>, shutdown: Shutdown) {
        loop {
            let delivery = tokio::select! {
                _ = shutdown.wait() => break,
                delivery = consumer.next() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            let tag = delivery.tag;

            let (reply, ctx) = dispatch(&self.routes, &delivery.body).await;
            self.send_reply(&delivery, &reply).await;

            if let Err(e) = consumer.ack(tag).await {
                tracing::error!(queue = %self.queue, tag, error = %e, "Failed to ack delivery");
            }

            if let Some(mut ctx) = ctx {
                ctx.complete().await;
            }
        }
        tracing::debug!(queue = %self.queue, "RPC queue worker stopped");
    }

    async fn send_reply(&self, delivery: &Delivery, reply: &RpcReply) {
        let Some(reply_to) = delivery.reply_to.as_deref() else {
            tracing::warn!(queue = %self.queue, "Delivery without reply_to, reply dropped");
            return;
        };

        let body = match serde_json::to_vec(reply) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize RPC reply");
                let fallback = RpcReply::failure(&RequestError::internal("unserializable reply"));
                serde_json::to_vec(&fallback).unwrap_or_default()
            }
        };
        let message = OutboundMessage {
            body: Bytes::from(body),
            correlation_id: delivery.correlation_id.clone(),
            reply_to: None,
        };
        if let Err(e) = self.broker.publish(reply_to, message).await {
            tracing::error!(reply_to = %reply_to, error = %e, "Failed to publish RPC reply");
        }
    }
}

async fn dispatch(routes: &[RpcRoute], body: &[u8]) -> (RpcReply, Option<RequestContext>) {
    let started = Instant::now();

    let request: RpcRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed RPC request");
            let err = RequestError::bad_request(format!("malformed request: {e}"));
            return (RpcReply::failure(&err), None);
        }
    };

    let Some((route, params)) = routes
        .iter()
        .find_map(|route| route.matcher.matches(&request).map(|params| (route, params)))
    else {
        let err = RequestError::not_found(format!(
            "unknown request -> name: {}, method: {}, path: {}",
            request.name.as_deref().unwrap_or("none"),
            request.method.map(|m| m.as_str()).unwrap_or("none"),
            request.path.as_deref().unwrap_or("none"),
        ));
        tracing::warn!(error = %err, "No route for RPC request");
        return (RpcReply::failure(&err), None);
    };

    let pipeline = &route.pipeline;
    let ctx = RequestContext::new(transport_request(request, params));

    let (reply, ctx, status) = match AssertUnwindSafe(pipeline.handle(ctx)).catch_unwind().await {
        Ok(Ok(ctx)) => {
            let response = &ctx.response;
            let mut headers = response.headers.clone();
            headers.insert("content-type".to_string(), response.content_type_or_default().to_string());
            let reply = RpcReply::Success {
                headers,
                body: response.body.clone().unwrap_or(Value::Null),
            };
            let status = response.status;
            (reply, Some(ctx), status)
        }
        Ok(Err(err)) => {
            let envelope = RpcErrorEnvelope::from_error(&err).with_stack(format!("{err:?}"));
            (RpcReply::Failure { error: envelope }, None, err.status_code())
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(route = %pipeline.name(), panic = %message, "RPC handler panicked");
            let err = RequestError::internal("internal server error");
            let envelope = RpcErrorEnvelope::from_error(&err).with_stack(message);
            (RpcReply::Failure { error: envelope }, None, err.status_code())
        }
    };

    metrics::record_request("rpc", pipeline.name(), status, started.elapsed());
    tracing::debug!(
        route = %pipeline.name(),
        status,
        duration_ms = started.elapsed().as_millis() as u64,
        "RPC request handled"
    );
    (reply, ctx)
}

fn transport_request(request: RpcRequest, params: BTreeMap<String, String>) -> TransportRequest {
    let mut payload = request.payload_object();
    if let Value::Object(object) = &mut payload {
        for (name, value) in &params {
            object.insert(name.clone(), Value::String(value.clone()));
        }
    }

    let original_url = request
        .path
        .clone()
        .or_else(|| request.name.clone())
        .unwrap_or_default();

    TransportRequest {
        transport: Transport::Rpc,
        name: request.name,
        method: request.method,
        path: request.path,
        original_url,
        client_ip: request.ip.unwrap_or_default(),
        params,
        authorization: request.authentication_token,
        payload,
        ..Default::default()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{RouteDefinition, RouteMethod, Services};
    use crate::rpc::broker::{Consumer, MemoryBroker};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn server(broker: &MemoryBroker) -> RpcServer {
        let services = Services::new(Arc::new(MemoryStore::new()), "test");
        let send = RouteDefinition::new("send", RouteMethod::Post, "/send/:toId")
            .controller(|payload: Value| async move { Ok::<_, RequestError>(payload) });
        let boom = RouteDefinition::new("boom", RouteMethod::Get, "/boom").controller(|_payload: Value| async move {
            if true {
                panic!("exploded");
            }
            Ok::<_, RequestError>(Value::Null)
        });
        let pipelines = [send, boom]
            .iter()
            .map(|route| Arc::new(Pipeline::compile(route, &services).unwrap()))
            .collect();
        RpcServer::new(Arc::new(broker.clone()), vec!["svc".into()], pipelines)
    }

    fn encode(request: &RpcRequest) -> Vec<u8> {
        serde_json::to_vec(request).unwrap()
    }

    #[tokio::test]
    async fn test_path_params_are_injected() {
        let server = server(&MemoryBroker::new());
        let request = RpcRequest::to_path(RouteMethod::Post, "/send/42", json!({"text": "hi"}));

        match server.process(&encode(&request)).await {
            RpcReply::Success { headers, body } => {
                assert_eq!(body, json!({"text": "hi", "toId": "42"}));
                assert_eq!(headers.get("content-type").map(String::as_str), Some("application/json; charset=utf-8"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_requests() {
        let server = server(&MemoryBroker::new());

        let extra = RpcRequest::to_path(RouteMethod::Post, "/send/42/extra", json!({}));
        match server.process(&encode(&extra)).await {
            RpcReply::Failure { error } => {
                assert_eq!(error.code, 404);
                assert_eq!(error.message, "unknown request -> name: none, method: POST, path: /send/42/extra");
            }
            other => panic!("unexpected reply {other:?}"),
        }

        match server.process(b"{not json").await {
            RpcReply::Failure { error } => assert_eq!(error.code, 400),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let server = server(&MemoryBroker::new());
        match server.process(&encode(&RpcRequest::named("boom", json!({})))).await {
            RpcReply::Failure { error } => {
                assert_eq!(error.code, 500);
                assert_eq!(error.stack.as_deref(), Some("exploded"));
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_every_delivery_is_replied_and_acked() {
        let broker = MemoryBroker::new();
        let shutdown = Shutdown::new();
        let running = tokio::spawn(server(&broker).run(shutdown.clone()));

        let mut replies = broker
            .consume("replies", ConsumeOptions { prefetch: 0, auto_ack: true })
            .await
            .unwrap();
        let bodies = [
            encode(&RpcRequest::named("send", json!({}))),
            b"garbage".to_vec(),
            encode(&RpcRequest::named("missing", json!({}))),
            encode(&RpcRequest::named("boom", json!({}))),
        ];
        for (i, body) in bodies.iter().enumerate() {
            broker
                .publish(
                    "svc",
                    OutboundMessage {
                        body: Bytes::from(body.clone()),
                        correlation_id: Some(format!("c{i}")),
                        reply_to: Some("replies".into()),
                    },
                )
                .await
                .unwrap();
        }

        for i in 0..bodies.len() {
            let reply = replies.next().await.unwrap();
            assert_eq!(reply.correlation_id, Some(format!("c{i}")));
        }

        shutdown.trigger();
        running.await.unwrap().unwrap();
        // 4 requests + 4 replies published; 4 requests acked by the server,
        // 4 replies auto-acked by the test consumer.
        assert_eq!(broker.published_count(), 8);
        assert_eq!(broker.acked_count(), 8);
    }
}
