#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use beach_pier_core::{AuthToken, NetworkMessage, SessionId};
use beach_pier_host::config::HostConfig;
use beach_pier_host::terminal::LoopbackSpawner;
use beach_pier_host::transport::{read_message, serve_connection, write_message, HandshakeError};
use beach_pier_host::HostContext;
use tokio::io::{duplex, split, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

pub const PEER: &str = "192.0.2.50:51000";

pub struct Host {
    pub ctx: HostContext,
    pub spawner: LoopbackSpawner,
    pub token: AuthToken,
}

impl Host {
    pub fn new() -> Self {
        Self::with_config(HostConfig::default())
    }

    pub fn with_config(config: HostConfig) -> Self {
        let spawner = LoopbackSpawner::new();
        let ctx = HostContext::new(&config, Arc::new(spawner.clone()));
        let token = ctx.tokens.generate();
        Self { ctx, spawner, token }
    }

    pub fn connect(&self) -> Client {
        self.connect_with_buffer(64 * 1024)
    }

    /// `buffer` bounds how many unread bytes the pipe holds before the
    /// host's writer blocks.
    pub fn connect_with_buffer(&self, buffer: usize) -> Client {
        serve(&self.ctx, buffer)
    }
}

/// Runs a host connection for `ctx` over an in-memory pipe.
pub fn serve(ctx: &HostContext, buffer: usize) -> Client {
    let (client, server) = duplex(buffer);
    let (server_rx, server_tx) = split(server);
    let peer: SocketAddr = PEER.parse().unwrap();
    let task = tokio::spawn(serve_connection(ctx.clone(), peer, server_rx, server_tx));
    let (rx, tx) = split(client);
    Client { rx, tx, task }
}

pub struct Client {
    rx: ReadHalf<DuplexStream>,
    tx: WriteHalf<DuplexStream>,
    pub task: JoinHandle<Result<(), HandshakeError>>,
}

impl Client {
    pub async fn send(&mut self, message: NetworkMessage) {
        write_message(&mut self.tx, &message).await.unwrap();
    }

    pub async fn hello(&mut self, token: AuthToken, resume: Option<SessionId>) {
        self.send(NetworkMessage::hello(token, resume)).await;
    }

    pub async fn recv(&mut self) -> NetworkMessage {
        tokio::time::timeout(Duration::from_secs(5), read_message(&mut self.rx))
            .await
            .expect("no message within 5s")
            .unwrap()
            .expect("host closed the stream")
    }

    /// `None` once the host has finished writing.
    pub async fn recv_or_end(&mut self) -> Option<NetworkMessage> {
        read_message(&mut self.rx).await.unwrap()
    }

    pub async fn session_info(&mut self) -> (SessionId, bool) {
        match self.recv().await {
            NetworkMessage::SessionInfo {
                session_id, resumed, ..
            } => (session_id, resumed),
            other => panic!("expected SessionInfo, got {other:?}"),
        }
    }

    /// Collects `Event` payloads until `len` bytes have arrived.
    pub async fn events(&mut self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            match self.recv().await {
                NetworkMessage::Event { data, .. } => out.extend_from_slice(&data),
                other => panic!("expected Event, got {other:?}"),
            }
        }
        out
    }

    /// Half-closes the stream and waits for the host to finish with it.
    pub async fn disconnect(mut self) -> Result<(), HandshakeError> {
        self.tx.shutdown().await.unwrap();
        while read_message(&mut self.rx).await.ok().flatten().is_some() {}
        self.task.await.unwrap()
    }
}
