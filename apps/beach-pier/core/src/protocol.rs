use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::token::AuthToken;

pub type SessionId = u64;

/// Every frame exchanged between a client and the host.
///
/// Client → host: `Hello`, `Input`, `Resize`, `Ping`, `RequestSnapshot`, `Close`.
/// Host → client: `Event`, `Pong`, `Snapshot`, `SessionInfo`, `Error`, `Close`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMessage {
    Hello {
        protocol_version: u32,
        app_version: String,
        auth_token: Option<AuthToken>,
        /// Session to resume, if the client was attached to one before.
        session_id: Option<SessionId>,
    },
    /// Keystrokes for the bound session. An empty payload only spawns the session.
    Input { data: Bytes },
    Event {
        session_id: SessionId,
        data: Bytes,
        timestamp: u64,
    },
    Resize { rows: u16, cols: u16 },
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    RequestSnapshot,
    Snapshot { data: Bytes },
    SessionInfo {
        session_id: SessionId,
        resumed: bool,
        rows: u16,
        cols: u16,
    },
    Error { code: ErrorCode, message: String },
    Close,
}

impl NetworkMessage {
    pub fn hello(auth_token: AuthToken, session_id: Option<SessionId>) -> Self {
        NetworkMessage::Hello {
            protocol_version: crate::PROTOCOL_VERSION,
            app_version: crate::APP_VERSION.to_string(),
            auth_token: Some(auth_token),
            session_id,
        }
    }

    pub fn input(data: impl Into<Bytes>) -> Self {
        NetworkMessage::Input { data: data.into() }
    }

    pub fn error(code: ErrorCode) -> Self {
        NetworkMessage::Error {
            code,
            message: code.description().to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NetworkMessage::Hello { .. } => "hello",
            NetworkMessage::Input { .. } => "input",
            NetworkMessage::Event { .. } => "event",
            NetworkMessage::Resize { .. } => "resize",
            NetworkMessage::Ping { .. } => "ping",
            NetworkMessage::Pong { .. } => "pong",
            NetworkMessage::RequestSnapshot => "request_snapshot",
            NetworkMessage::Snapshot { .. } => "snapshot",
            NetworkMessage::SessionInfo { .. } => "session_info",
            NetworkMessage::Error { .. } => "error",
            NetworkMessage::Close => "close",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    ProtocolVersionMismatch,
    InvalidHandshake,
    AuthFailed,
    MessageTooLarge,
    Serialization,
    Terminal,
    SessionEnded,
    NotFound,
    Internal,
}

impl ErrorCode {
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::ProtocolVersionMismatch => "protocol version mismatch",
            ErrorCode::InvalidHandshake => "invalid handshake",
            ErrorCode::AuthFailed => "authentication failed",
            ErrorCode::MessageTooLarge => "message too large",
            ErrorCode::Serialization => "malformed message",
            ErrorCode::Terminal => "terminal error",
            ErrorCode::SessionEnded => "session ended",
            ErrorCode::NotFound => "session not found",
            ErrorCode::Internal => "internal error",
        }
    }
}
