use std::net::SocketAddr;
use std::sync::Arc;

use beach_pier_core::{now_millis, CoreError, ErrorCode, NetworkMessage};
use metrics::counter;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::frame::{read_message, write_message};
use super::handshake::{perform_handshake, ConnectionPhase, HandshakeError};
use super::HostContext;
use crate::pipeline::OutputReceiver;
use crate::session::Session;
use crate::terminal::TerminalSize;

const OUTBOUND_DEPTH: usize = 64;
const SNAPSHOT_REQUEST_DEPTH: usize = 1;

/// Runs one client stream from `Hello` to close.
///
/// Everything the host sends goes through a single writer task, so terminal
/// output, pongs and errors never interleave mid-frame. `Err` is returned only
/// when the handshake rejected the client; failures after that are reported
/// to the client and logged.
pub async fn serve_connection<R, W>(
    ctx: HostContext,
    peer: SocketAddr,
    mut reader: R,
    writer: W,
) -> Result<(), HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_DEPTH);
    let writer_task = tokio::spawn(write_loop(writer, outbound_rx));
    let mut phase = ConnectionPhase::Accepted;

    let hello = match perform_handshake(&ctx, peer, &mut reader, &mut phase).await {
        Ok(hello) => hello,
        Err(err) => {
            let _ = outbound
                .send(NetworkMessage::Error {
                    code: err.wire_code(),
                    message: err.client_message(),
                })
                .await;
            drop(outbound);
            finish_writer(writer_task).await;
            return Err(err);
        }
    };

    let mut connection = Connection {
        ctx,
        peer,
        outbound,
        phase,
        binding: None,
        pending_size: TerminalSize::default(),
    };

    if let Some(id) = hello.session_id {
        match connection.ctx.sessions.resume(id) {
            Some(session) => connection.bind(session, true).await,
            None => debug!(peer = %peer, session_id = id, "resume hint names no live session"),
        }
    }

    connection.run(&mut reader).await;
    connection.close();
    drop(connection);
    finish_writer(writer_task).await;
    counter!("beach_pier_connections_closed_total", 1);
    info!(peer = %peer, "connection closed");
    Ok(())
}

struct Connection {
    ctx: HostContext,
    peer: SocketAddr,
    outbound: mpsc::Sender<NetworkMessage>,
    phase: ConnectionPhase,
    binding: Option<Binding>,
    pending_size: TerminalSize,
}

struct Binding {
    session: Arc<Session>,
    generation: u64,
    snapshots: mpsc::Sender<()>,
    pump: JoinHandle<()>,
}

impl Binding {
    fn release(self) {
        self.session.detach(self.generation);
        self.pump.abort();
    }

    /// Lets the pump finish on its own so any eviction notice it owes is
    /// queued before whatever the connection sends next.
    async fn retire(self) {
        self.session.detach(self.generation);
        if let Err(err) = self.pump.await {
            debug!(error = %err, "output pump failed");
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

impl Connection {
    async fn run<R>(&mut self, reader: &mut R)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let message = match read_message(reader).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) if err.is_connection_closed() => {
                    debug!(peer = %self.peer, error = %err, "stream ended");
                    break;
                }
                Err(err) => {
                    // A corrupt frame leaves no way to find the next boundary.
                    warn!(peer = %self.peer, error = %err, "dropping connection after bad frame");
                    self.send_error(err.wire_code(), err.to_string()).await;
                    break;
                }
            };
            if let Flow::Stop = self.handle(message).await {
                break;
            }
        }
    }

    async fn handle(&mut self, message: NetworkMessage) -> Flow {
        match message {
            NetworkMessage::Input { data } => {
                let Some(session) = self.ensure_session().await else {
                    return Flow::Continue;
                };
                if let Err(err) = session.write(&data) {
                    self.send_error(ErrorCode::Terminal, err.to_string()).await;
                }
            }
            NetworkMessage::Resize { rows, cols } => {
                self.pending_size = TerminalSize::new(rows, cols);
                if let Some(session) = self.live_session() {
                    if let Err(err) = session.resize(rows, cols) {
                        self.send_error(ErrorCode::Terminal, err.to_string()).await;
                    }
                }
            }
            NetworkMessage::RequestSnapshot => {
                if self.ensure_session().await.is_some() {
                    if let Some(binding) = &self.binding {
                        // A full queue already holds a pending request.
                        let _ = binding.snapshots.try_send(());
                    }
                }
            }
            NetworkMessage::Ping { timestamp } => {
                let _ = self.outbound.send(NetworkMessage::Pong { timestamp }).await;
            }
            NetworkMessage::Close => {
                debug!(peer = %self.peer, "client sent close");
                return Flow::Stop;
            }
            NetworkMessage::Hello { .. } => {
                self.send_error(ErrorCode::InvalidHandshake, "duplicate hello".into())
                    .await;
            }
            other => {
                debug!(peer = %self.peer, kind = other.kind(), "ignoring host-bound message");
            }
        }
        Flow::Continue
    }

    /// The bound session, unless it ended or another connection took it over.
    fn live_session(&self) -> Option<Arc<Session>> {
        self.binding
            .as_ref()
            .filter(|binding| {
                binding.session.is_alive() && binding.session.is_attached_as(binding.generation)
            })
            .map(|binding| binding.session.clone())
    }

    /// Returns the bound session, spawning a fresh one when there is none,
    /// the previous one ended, or it was resumed elsewhere.
    async fn ensure_session(&mut self) -> Option<Arc<Session>> {
        if let Some(session) = self.live_session() {
            return Some(session);
        }
        if let Some(stale) = self.binding.take() {
            debug!(peer = %self.peer, session_id = stale.session.id(), "dropping stale binding");
            stale.retire().await;
            self.enter(ConnectionPhase::Authenticated);
        }
        match self.ctx.sessions.spawn_session(self.pending_size) {
            Ok(session) => {
                self.bind(session.clone(), false).await;
                Some(session)
            }
            Err(err) => {
                warn!(peer = %self.peer, error = %err, "failed to start session");
                self.send_error(err.wire_code(), err.to_string()).await;
                None
            }
        }
    }

    async fn bind(&mut self, session: Arc<Session>, resumed: bool) {
        self.enter(ConnectionPhase::SessionBound);
        let attach = session.attach();
        let size = session.size();
        let _ = self
            .outbound
            .send(NetworkMessage::SessionInfo {
                session_id: session.id(),
                resumed,
                rows: size.rows,
                cols: size.cols,
            })
            .await;

        let (snapshots, snapshot_rx) = mpsc::channel(SNAPSHOT_REQUEST_DEPTH);
        let pump = tokio::spawn(pump_output(
            session.clone(),
            attach.evicted,
            snapshot_rx,
            self.outbound.clone(),
        ));
        counter!(
            "beach_pier_session_binds_total",
            1,
            "kind" => if resumed { "resumed" } else { "new" }
        );
        info!(peer = %self.peer, session_id = session.id(), resumed, "session bound");

        self.binding = Some(Binding {
            session,
            generation: attach.generation,
            snapshots,
            pump,
        });
        self.enter(ConnectionPhase::Streaming);
    }

    fn enter(&mut self, next: ConnectionPhase) {
        if let Err(err) = self.phase.advance(next) {
            debug!(peer = %self.peer, error = %err, "unexpected phase change");
            self.phase = next;
        }
    }

    async fn send_error(&self, code: ErrorCode, message: String) {
        let _ = self
            .outbound
            .send(NetworkMessage::Error { code, message })
            .await;
    }

    /// Detaches from the session (starting its grace period) and stops the pump.
    fn close(&mut self) {
        if let Some(binding) = self.binding.take() {
            binding.release();
        }
        self.enter(ConnectionPhase::Closed);
    }
}

enum PumpExit {
    /// Another connection attached, or the session was killed.
    Evicted,
    /// The owning connection let go.
    Released,
    Ended,
    Disconnected,
}

/// Moves terminal output for one attachment onto the connection's outbound
/// queue until the session ends or the attachment is evicted.
async fn pump_output(
    session: Arc<Session>,
    mut evicted: oneshot::Receiver<()>,
    mut snapshots: mpsc::Receiver<()>,
    outbound: mpsc::Sender<NetworkMessage>,
) {
    let session_id = session.id();
    let exit = tokio::select! {
        guard = session.lock_output() => {
            stream_output(&session, guard, &mut evicted, &mut snapshots, &outbound).await
        }
        signal = &mut evicted => eviction(signal),
    };

    match exit {
        PumpExit::Evicted => {
            let notice = if session.is_alive() {
                info!(session_id, "attachment taken over by another connection");
                NetworkMessage::Error {
                    code: ErrorCode::SessionEnded,
                    message: "session resumed by another connection".into(),
                }
            } else {
                info!(session_id, "session ended");
                NetworkMessage::error(ErrorCode::SessionEnded)
            };
            let _ = outbound.send(notice).await;
        }
        PumpExit::Ended => {
            info!(session_id, "session ended");
            let _ = outbound.send(NetworkMessage::error(ErrorCode::SessionEnded)).await;
        }
        PumpExit::Released | PumpExit::Disconnected => {}
    }
}

fn eviction(signal: Result<(), oneshot::error::RecvError>) -> PumpExit {
    // A dropped sender is the owner detaching; an explicit send is a takeover.
    match signal {
        Ok(()) => PumpExit::Evicted,
        Err(_) => PumpExit::Released,
    }
}

async fn stream_output(
    session: &Session,
    mut output: OwnedMutexGuard<OutputReceiver>,
    evicted: &mut oneshot::Receiver<()>,
    snapshots: &mut mpsc::Receiver<()>,
    outbound: &mpsc::Sender<NetworkMessage>,
) -> PumpExit {
    let session_id = session.id();
    // Chunks at or below this sequence were already delivered inside a Snapshot.
    let mut covered = 0u64;
    loop {
        let message = tokio::select! {
            biased;
            signal = &mut *evicted => return eviction(signal),
            Some(()) = snapshots.recv() => {
                let snapshot = session.snapshot();
                covered = snapshot.last_seq;
                counter!("beach_pier_snapshots_served_total", 1);
                debug!(session_id, bytes = snapshot.data.len(), last_seq = covered, "serving snapshot");
                NetworkMessage::Snapshot { data: snapshot.data }
            }
            chunk = output.recv() => match chunk {
                Some(chunk) if chunk.seq <= covered => continue,
                Some(chunk) => NetworkMessage::Event {
                    session_id,
                    data: chunk.data,
                    timestamp: now_millis(),
                },
                None => return PumpExit::Ended,
            },
        };

        tokio::select! {
            biased;
            signal = &mut *evicted => return eviction(signal),
            sent = outbound.send(message) => {
                if sent.is_err() {
                    return PumpExit::Disconnected;
                }
            }
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<NetworkMessage>,
) -> Result<(), CoreError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        write_message(&mut writer, &message).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

async fn finish_writer(task: JoinHandle<Result<(), CoreError>>) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "writer finished with error"),
        Err(err) => warn!(error = %err, "writer task failed"),
    }
}
