//! Cross-cutting request guards.

pub mod rate_limit;

pub use rate_limit::{CredentialRateLimiter, RateLimitConfig};
