//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request (either transport):
//!     → auth.rs (decode bearer token, roles, lifetime, authenticator chain)
//!     → ... payload shaping and validation ...
//!     → rate_limit.rs (sliding window, quadratic delay, hard ceiling)
//! ```
//!
//! # Design Decisions
//! - Fail closed: reject on any security check failure
//! - Store failures during rate limiting surface as errors, never fail open
//! - Both checks run as pipeline stages, not as transport middleware

pub mod auth;
pub mod rate_limit;

pub use auth::{
    Authentication, AuthenticationOptions, AuthenticationToken, Authenticator, AuthVerifier,
};
pub use rate_limit::{RateLimitOptions, RateLimitOutcome, RateLimitPolicy, RateLimiter};
