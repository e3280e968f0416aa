//! Routeway: one request pipeline served over HTTP and RPC.
//!
//! # Architecture Overview
//!
//! ```text
//!                       ┌──────────────────────────────────────────────────┐
//!                       │                    ROUTEWAY                      │
//!                       │                                                  │
//!   HTTP request ───────┼─▶ http ──┐                                       │
//!                       │          ├─▶ pipeline ─▶ [auth, files, mw,       │
//!   queue message ──────┼─▶ rpc  ──┘   (compiled    shape, validate,       │
//!                       │              once)        rate limit, cache,     │
//!                       │                           controller | proxy]    │
//!                       │                                                  │
//!                       │  ┌────────────────────────────────────────────┐  │
//!                       │  │           Cross-Cutting Concerns           │  │
//!                       │  │  config  store  security  cache  lifecycle │  │
//!                       │  │  observability  validation  error          │  │
//!                       │  └────────────────────────────────────────────┘  │
//!                       └──────────────────────────────────────────────────┘
//! ```

// Core subsystems
pub mod app;
pub mod config;
pub mod http;
pub mod net;
pub mod pipeline;
pub mod rpc;

// Request processing
pub mod cache;
pub mod error;
pub mod security;
pub mod store;
pub mod validation;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use app::{App, AppError};
pub use config::RoutewayConfig;
pub use error::{ErrorKind, RequestError};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use pipeline::{Pipeline, RequestContext, RouteDefinition, RouteMethod, Services};
