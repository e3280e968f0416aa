//! Network layer.
//!
//! # Design Decisions
//! - TLS is optional and terminated by axum-server with rustls
//! - Certificates are loaded once at startup
pub mod tls;

pub use tls::load_tls_config;
