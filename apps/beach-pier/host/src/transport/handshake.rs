use std::net::SocketAddr;
use std::time::{Duration, Instant};

use beach_pier_core::{CoreError, ErrorCode, NetworkMessage, SessionId, PROTOCOL_VERSION};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::frame::read_message;
use super::HostContext;

/// Where a connection is in its lifecycle. Steps are strictly sequential;
/// `Rejected` is reachable from every pre-streaming phase and `Closed` from
/// everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Listening,
    Accepted,
    VersionChecked,
    Authenticated,
    SessionBound,
    Streaming,
    Rejected,
    Closed,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid connection transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ConnectionPhase,
    pub to: ConnectionPhase,
}

impl ConnectionPhase {
    pub fn can_transition(self, to: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        match (self, to) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Listening, Accepted)
            | (Accepted, VersionChecked)
            | (VersionChecked, Authenticated)
            | (Authenticated, SessionBound)
            | (SessionBound, Streaming) => true,
            // The bound session ended; the connection stays authenticated
            // until the next input spawns a replacement.
            (Streaming, Authenticated) => true,
            (Accepted | VersionChecked | Authenticated | SessionBound, Rejected) => true,
            _ => false,
        }
    }

    pub fn advance(&mut self, to: ConnectionPhase) -> Result<(), InvalidTransition> {
        if !self.can_transition(to) {
            return Err(InvalidTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }

    pub fn is_streaming(self) -> bool {
        self == ConnectionPhase::Streaming
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("client did not send Hello in time")]
    TimedOut,
    #[error("client closed the stream before Hello")]
    SocketClosed,
    #[error("malformed first message: {0}")]
    InvalidPayload(#[source] CoreError),
    #[error("expected Hello, got {0}")]
    UnexpectedMessage(&'static str),
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },
    #[error("address is banned")]
    Banned,
    #[error("no auth token supplied")]
    MissingToken,
    #[error("auth token invalid or expired")]
    InvalidToken,
    #[error(transparent)]
    Phase(#[from] InvalidTransition),
}

impl HandshakeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::TimedOut => "timeout",
            HandshakeError::SocketClosed => "socket_closed",
            HandshakeError::InvalidPayload(_) => "invalid_payload",
            HandshakeError::UnexpectedMessage(_) => "unexpected_message",
            HandshakeError::VersionMismatch { .. } => "version_mismatch",
            HandshakeError::Banned => "banned",
            HandshakeError::MissingToken => "missing_token",
            HandshakeError::InvalidToken => "invalid_token",
            HandshakeError::Phase(_) => "phase",
        }
    }

    pub fn wire_code(&self) -> ErrorCode {
        match self {
            HandshakeError::VersionMismatch { .. } => ErrorCode::ProtocolVersionMismatch,
            HandshakeError::Banned | HandshakeError::MissingToken | HandshakeError::InvalidToken => {
                ErrorCode::AuthFailed
            }
            HandshakeError::InvalidPayload(err) => err.wire_code(),
            HandshakeError::TimedOut
            | HandshakeError::SocketClosed
            | HandshakeError::UnexpectedMessage(_) => ErrorCode::InvalidHandshake,
            HandshakeError::Phase(_) => ErrorCode::Internal,
        }
    }

    /// Text sent to the client. Auth failures share one message so a probe
    /// cannot tell a ban from a bad token.
    pub fn client_message(&self) -> String {
        match self.wire_code() {
            ErrorCode::AuthFailed => ErrorCode::AuthFailed.description().to_string(),
            _ => self.to_string(),
        }
    }

    fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            HandshakeError::Banned | HandshakeError::MissingToken | HandshakeError::InvalidToken
        )
    }
}

impl From<HandshakeError> for CoreError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::VersionMismatch { expected, actual } => {
                CoreError::ProtocolVersionMismatch { expected, actual }
            }
            HandshakeError::Banned => CoreError::Banned,
            HandshakeError::MissingToken | HandshakeError::InvalidToken => CoreError::AuthFailed,
            HandshakeError::InvalidPayload(err) => err,
            HandshakeError::SocketClosed => CoreError::ConnectionClosed,
            other => CoreError::InvalidHandshake(other.to_string()),
        }
    }
}

/// The parts of `Hello` that outlive the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub protocol_version: u32,
    pub app_version: String,
    pub session_id: Option<SessionId>,
}

/// Reads the first message and runs it through version, ban and token checks,
/// in that order. Nothing is allocated for the client before this returns Ok.
pub async fn perform_handshake<R>(
    ctx: &HostContext,
    peer: SocketAddr,
    reader: &mut R,
    phase: &mut ConnectionPhase,
) -> Result<ClientHello, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let started = Instant::now();
    let result = run_checks(ctx, peer, reader, phase).await;
    match &result {
        Ok(hello) => record_handshake_success(hello, started.elapsed()),
        Err(err) => {
            record_handshake_failure(err);
            if err.is_auth_failure() {
                let outcome = ctx.limiter.record_failure(peer.ip());
                debug!(peer = %peer, ?outcome, "authentication failure recorded");
            }
            if phase.can_transition(ConnectionPhase::Rejected) {
                *phase = ConnectionPhase::Rejected;
            }
            warn!(
                target: "pier::handshake",
                peer = %peer,
                reason = err.metric_label(),
                error = %err,
                "handshake rejected"
            );
        }
    }
    result
}

async fn run_checks<R>(
    ctx: &HostContext,
    peer: SocketAddr,
    reader: &mut R,
    phase: &mut ConnectionPhase,
) -> Result<ClientHello, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let first = timeout(ctx.handshake_timeout, read_message(reader))
        .await
        .map_err(|_| HandshakeError::TimedOut)?
        .map_err(|err| {
            if err.is_connection_closed() {
                HandshakeError::SocketClosed
            } else {
                HandshakeError::InvalidPayload(err)
            }
        })?
        .ok_or(HandshakeError::SocketClosed)?;

    let kind = first.kind();
    let NetworkMessage::Hello {
        protocol_version,
        app_version,
        auth_token,
        session_id,
    } = first
    else {
        return Err(HandshakeError::UnexpectedMessage(kind));
    };

    if protocol_version != PROTOCOL_VERSION {
        return Err(HandshakeError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: protocol_version,
        });
    }
    phase.advance(ConnectionPhase::VersionChecked)?;

    // Banned peers are turned away before their token is even looked at.
    if ctx.limiter.is_banned(peer.ip()) {
        return Err(HandshakeError::Banned);
    }
    let token = auth_token.ok_or(HandshakeError::MissingToken)?;
    if !ctx.tokens.validate(&token) {
        return Err(HandshakeError::InvalidToken);
    }
    ctx.limiter.reset(peer.ip());
    phase.advance(ConnectionPhase::Authenticated)?;

    info!(
        target: "pier::handshake",
        peer = %peer,
        app_version = %app_version,
        resume = ?session_id,
        "client authenticated"
    );
    Ok(ClientHello {
        protocol_version,
        app_version,
        session_id,
    })
}

fn record_handshake_success(hello: &ClientHello, duration: Duration) {
    let protocol_label = hello.protocol_version.to_string();
    counter!(
        "beach_pier_handshakes_success_total",
        1,
        "protocol_version" => protocol_label.clone()
    );
    histogram!(
        "beach_pier_handshake_duration_ms",
        duration.as_secs_f64() * 1000.0,
        "protocol_version" => protocol_label
    );
}

fn record_handshake_failure(error: &HandshakeError) {
    counter!(
        "beach_pier_handshakes_failure_total",
        1,
        "reason" => error.metric_label()
    );
}
