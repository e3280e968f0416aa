//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → loader.rs (ROUTEWAY_* environment overrides)
//!     → validation.rs (semantic checks)
//!     → RoutewayConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    AppConfig, AuthenticationConfig, CorsConfig, ListenerConfig, ObservabilityConfig,
    RateLimitConfig, RoutewayConfig, RpcConfig, StoreConfig, StoreKind, TimeoutConfig, TlsConfig,
};
