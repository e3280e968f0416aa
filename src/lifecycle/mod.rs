//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Trigger → HTTP server stops accepting → RPC server stops consuming
//!             → RPC client rejects pending calls → Store stops
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - One coordinator is shared by every long-running task
//! - Components have explicit start/stop instead of process-wide state

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
