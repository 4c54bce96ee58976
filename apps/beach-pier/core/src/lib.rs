//! Shared primitives for the Beach Pier host agent and its clients.
//!
//! The host exposes one interactive shell per session over QUIC. Everything a
//! client needs to speak to it lives here: the wire messages, the
//! length-prefixed codec, the pairing token and the pairing payload.

pub mod codec;
pub mod error;
pub mod pairing;
pub mod protocol;
pub mod token;

pub use codec::{MessageCodec, FRAME_HEADER_LEN, MAX_MESSAGE_SIZE};
pub use error::{CoreError, Result};
pub use pairing::PairingPayload;
pub use protocol::{ErrorCode, NetworkMessage, SessionId};
pub use token::AuthToken;

/// Protocol revision spoken by this build. Mismatches are rejected, never negotiated.
pub const PROTOCOL_VERSION: u32 = 1;

/// Application version reported in `Hello`.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// ALPN identifier negotiated on the QUIC handshake.
pub const ALPN_PROTOCOL: &[u8] = b"beach-pier/1";

/// Default snapshot buffer size, in approximate terminal lines.
pub const SNAPSHOT_BUFFER_LINES: usize = 1000;

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
