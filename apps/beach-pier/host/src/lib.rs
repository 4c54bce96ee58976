//! Beach Pier host agent.
//!
//! Serves interactive shell sessions to paired devices over QUIC. A device
//! pairs once with a token and the host certificate fingerprint, then can
//! drop and resume its session for as long as the grace period allows.

pub mod auth;
pub mod config;
pub mod identity;
pub mod pairing;
pub mod pipeline;
pub mod session;
pub mod snapshot;
pub mod telemetry;
pub mod terminal;
pub mod transport;

pub use config::HostConfig;
pub use transport::{HostContext, HostServer};
