//! Admission control for the handshake: pairing tokens and per-address
//! failure tracking.

mod guard;
mod tokens;

pub use guard::{FailureOutcome, RateLimiter, RateLimiterConfig};
pub use tokens::TokenStore;
