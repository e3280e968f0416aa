//! HTTP transport adapter.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (axum router, tower-http layers)
//!     → server.rs (normalize into TransportRequest, merge payload)
//!     → compiled Pipeline
//!     → response.rs (ResponseAccumulator or RequestError → Response)
//!     → deferred actions (cache write-back)
//! ```

pub mod response;
pub mod server;

pub use response::{error_response, pipeline_response};
pub use server::HttpServer;
