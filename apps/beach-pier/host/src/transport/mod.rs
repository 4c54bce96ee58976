//! QUIC transport: one bidirectional stream per client, carrying
//! length-prefixed [`NetworkMessage`](beach_pier_core::NetworkMessage) frames.

pub mod client;
mod connection;
mod frame;
mod handshake;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use beach_pier_core::ALPN_PROTOCOL;
use metrics::counter;
use quinn::crypto::rustls::QuicServerConfig;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub use connection::serve_connection;
pub use frame::{read_message, write_message};
pub use handshake::{perform_handshake, ClientHello, ConnectionPhase, HandshakeError, InvalidTransition};

use crate::auth::{RateLimiter, RateLimiterConfig, TokenStore};
use crate::config::HostConfig;
use crate::identity::HostIdentity;
use crate::session::{SessionConfig, SessionManager};
use crate::terminal::TerminalSpawner;

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Server name clients present in SNI. The certificate is checked by
/// fingerprint, so this only has to match the certificate's SAN list.
pub const SERVER_NAME: &str = "beach-pier";

/// How long the host waits for the client to hang up after its stream is done.
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Shared state handed to every connection.
#[derive(Clone)]
pub struct HostContext {
    pub tokens: TokenStore,
    pub limiter: RateLimiter,
    pub sessions: SessionManager,
    pub handshake_timeout: Duration,
    token_sweep_interval: Duration,
}

impl HostContext {
    pub fn new(config: &HostConfig, spawner: Arc<dyn TerminalSpawner>) -> Self {
        Self {
            tokens: TokenStore::new(config.token_ttl),
            limiter: RateLimiter::new(RateLimiterConfig::from(config)),
            sessions: SessionManager::new(SessionConfig::from(config), spawner),
            handshake_timeout: config.handshake_timeout,
            token_sweep_interval: config.token_sweep_interval,
        }
    }

    /// Starts the session reaper, token sweeper and failure-record pruner.
    /// The tasks stop when the returned handle is dropped.
    pub fn spawn_maintenance(&self) -> Maintenance {
        let prune_every = self.limiter.config().window;
        Maintenance {
            tasks: vec![
                self.sessions.spawn_reaper(),
                self.tokens.spawn_sweeper(self.token_sweep_interval),
                self.limiter.spawn_pruner(prune_every),
            ],
        }
    }
}

pub struct Maintenance {
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub(crate) fn transport_config() -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport
        .max_idle_timeout(Some(
            quinn::IdleTimeout::try_from(IDLE_TIMEOUT).context("idle timeout out of range")?,
        ))
        .keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    Ok(transport)
}

/// TLS 1.3 only, ALPN `beach-pier/1`, no client certificates.
pub fn server_config(identity: &HostIdentity) -> Result<quinn::ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("configure tls protocol versions")?
        .with_no_client_auth()
        .with_single_cert(vec![identity.certificate()], identity.private_key())
        .context("load host certificate")?;
    tls.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let crypto = QuicServerConfig::try_from(tls).context("build quic server crypto")?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config()?));
    Ok(config)
}

pub struct HostServer {
    endpoint: quinn::Endpoint,
    ctx: HostContext,
}

impl HostServer {
    pub fn bind(addr: SocketAddr, identity: &HostIdentity, ctx: HostContext) -> Result<Self> {
        let endpoint = quinn::Endpoint::server(server_config(identity)?, addr)
            .with_context(|| format!("bind quic endpoint on {addr}"))?;
        info!(
            addr = %endpoint.local_addr().unwrap_or(addr),
            fingerprint = identity.fingerprint(),
            "quic endpoint listening"
        );
        Ok(Self { endpoint, ctx })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    pub fn context(&self) -> &HostContext {
        &self.ctx
    }

    /// Accepts connections until the endpoint is closed.
    pub async fn run(&self) {
        while let Some(incoming) = self.endpoint.accept().await {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let peer = incoming.remote_address();
                if let Err(err) = handle_incoming(ctx, incoming).await {
                    debug!(peer = %peer, error = %err, "connection ended with error");
                }
            });
        }
        debug!("accept loop finished");
    }

    pub fn close(&self) {
        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"host shutting down");
    }

    pub async fn wait_idle(&self) {
        self.endpoint.wait_idle().await;
    }
}

async fn handle_incoming(ctx: HostContext, incoming: quinn::Incoming) -> Result<()> {
    let peer = incoming.remote_address();
    let connection = incoming.await.context("quic handshake")?;
    counter!("beach_pier_connections_accepted_total", 1);
    info!(peer = %peer, "connection accepted");

    let (send, recv) = timeout(ctx.handshake_timeout, connection.accept_bi())
        .await
        .context("client opened no stream")?
        .context("accept stream")?;

    let result = serve_connection(ctx, peer, recv, send).await;
    // The peer learns only the wire code; which check failed stays in the log.
    let (code, reason): (u32, &[u8]) = match &result {
        Ok(()) => (0, b"closed"),
        Err(err) => {
            warn!(peer = %peer, reason = err.metric_label(), "closing rejected connection");
            (1, err.wire_code().description().as_bytes())
        }
    };
    // Let the client read the final frames and hang up first.
    let _ = timeout(CLOSE_LINGER, connection.closed()).await;
    connection.close(quinn::VarInt::from_u32(code), reason);
    result.map_err(Into::into)
}
