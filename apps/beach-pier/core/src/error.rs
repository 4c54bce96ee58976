use std::io;
use thiserror::Error;

use crate::protocol::ErrorCode;

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),
    #[error("authentication failed")]
    AuthFailed,
    #[error("too many failed attempts")]
    RateLimited,
    #[error("address banned")]
    Banned,
    #[error("message too large: {size} bytes exceeds limit of {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("terminal error: {0}")]
    Terminal(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("session {0} not found")]
    NotFound(u64),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl CoreError {
    /// Code reported to the peer. Ban and rate-limit failures are folded into
    /// `AuthFailed` so the response does not reveal which check tripped.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            CoreError::ProtocolVersionMismatch { .. } => ErrorCode::ProtocolVersionMismatch,
            CoreError::InvalidHandshake(_) => ErrorCode::InvalidHandshake,
            CoreError::AuthFailed | CoreError::RateLimited | CoreError::Banned => {
                ErrorCode::AuthFailed
            }
            CoreError::MessageTooLarge { .. } => ErrorCode::MessageTooLarge,
            CoreError::Serialization(_) => ErrorCode::Serialization,
            CoreError::Terminal(_) => ErrorCode::Terminal,
            CoreError::NotFound(_) => ErrorCode::NotFound,
            CoreError::ConnectionClosed | CoreError::Io(_) => ErrorCode::Internal,
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        match self {
            CoreError::ConnectionClosed => true,
            CoreError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

impl From<bincode::Error> for CoreError {
    fn from(value: bincode::Error) -> Self {
        CoreError::Serialization(value.to_string())
    }
}
