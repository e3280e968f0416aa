//! Transport-agnostic request pipeline.
//!
//! # Data Flow
//! ```text
//! Route definitions (startup):
//!     → route.rs (RouteDefinition builder)
//!     → compiler.rs (Pipeline::compile, fixed stage order)
//!
//! Each request (HTTP or RPC):
//!     → context.rs (TransportRequest → RequestContext)
//!     → stage.rs (authenticate .. controller | proxy)
//!     → adapter renders ResponseAccumulator or RequestError
//!     → RequestContext::complete (deferred actions, e.g. cache write-back)
//! ```
//!
//! # Design Decisions
//! - Routes are compiled once and shared behind `Arc` by both transports
//! - Stages never write transport responses; errors are returned
//! - A finalized response short-circuits the remaining stages

pub mod compiler;
pub mod context;
pub mod route;
pub mod stage;

pub use compiler::{CompileError, Pipeline, Services};
pub use context::{
    DeferredAction, RequestContext, ResponseAccumulator, ResponseSource, Transport,
    TransportRequest, UploadedFile, DEFAULT_CONTENT_TYPE,
};
pub use route::{Controller, PayloadShaper, ProxyTarget, RouteDefinition, RouteMethod};
pub use stage::Stage;
