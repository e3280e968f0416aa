//! RPC multiplexer over a message broker.
//!
//! # Data Flow
//! ```text
//! Caller side (sender.rs):
//!     RpcClient::call(service, request)
//!         → publish {correlation_id, reply_to} → await reply or Timeout
//!
//! Service side (receiver.rs):
//!     queue → RpcServer → matcher.rs (name, else method + path)
//!         → compiled Pipeline → reply {headers, body} | {error}
//! ```
//!
//! # Responsibilities
//! - Wire messages (message.rs)
//! - Broker contract and in-process broker (broker.rs), AMQP broker (amqp.rs)
//! - Route matching with path parameters (matcher.rs)
//! - Correlation of replies to pending calls (sender.rs)
//!
//! # Design Decisions
//! - Every delivery gets exactly one reply and one ack
//! - Pending calls belong to one `RpcClient` instance, no process globals
//! - Unanswered calls are rejected by a periodic sweep, not per-call timers

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod broker;
pub mod matcher;
pub mod message;
pub mod receiver;
pub mod sender;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use broker::{BrokerError, ConsumeOptions, Consumer, Delivery, MemoryBroker, MessageBroker, OutboundMessage};
pub use matcher::{PathPattern, RouteMatcher};
pub use message::{RpcErrorEnvelope, RpcReply, RpcRequest, RpcResponse};
pub use receiver::RpcServer;
pub use sender::{PendingReply, RpcCallError, RpcClient, RpcClientOptions, DEFAULT_CALL_LIFETIME};
