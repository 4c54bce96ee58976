//! Terminal sessions and the manager that owns them.
//!
//! A [`Session`] couples one terminal backend with its reader thread, its
//! snapshot buffer and the receiving half of its output pipeline. The reader
//! thread is the only producer; whichever connection is attached drains the
//! receiver. Keystrokes go the other way through a writer thread, and kills
//! run on a thread of their own, so async callers never block on the terminal.

mod manager;

pub use manager::{SessionConfig, SessionManager};

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use beach_pier_core::{ErrorCode, SessionId};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::pipeline::{output_channel, OutputChunk, OutputReceiver, OutputSender, PipelineStats};
use crate::snapshot::{Snapshot, SnapshotBuffer};
use crate::terminal::{SpawnConfig, TerminalBackend, TerminalError, TerminalSize, TerminalSpawner};

const READ_CHUNK: usize = 8192;
/// Input messages queued for a terminal that is not reading.
pub const INPUT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    #[error("failed to start terminal reader: {0}")]
    Reader(#[source] io::Error),
    #[error("failed to start terminal writer: {0}")]
    Writer(#[source] io::Error),
}

impl SessionError {
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            SessionError::NotFound(_) => ErrorCode::NotFound,
            SessionError::Terminal(_) | SessionError::Reader(_) | SessionError::Writer(_) => {
                ErrorCode::Terminal
            }
        }
    }
}

/// Handed to a connection when it attaches. `evicted` resolves once another
/// connection takes over or the attachment is released.
#[derive(Debug)]
pub struct Attach {
    pub generation: u64,
    pub evicted: oneshot::Receiver<()>,
}

#[derive(Debug)]
struct AttachState {
    generation: u64,
    evict: Option<oneshot::Sender<()>>,
    detached_at: Option<Instant>,
}

pub struct Session {
    id: SessionId,
    terminal: Arc<dyn TerminalBackend>,
    input: Sender<Bytes>,
    killed: AtomicBool,
    snapshot: Arc<SnapshotBuffer>,
    output: Arc<AsyncMutex<OutputReceiver>>,
    stats: Arc<PipelineStats>,
    reader_exited: Arc<AtomicBool>,
    attachment: Mutex<AttachState>,
    created_at: Instant,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("size", &self.terminal.size())
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Session {
    pub(crate) fn spawn(
        id: SessionId,
        spawner: &dyn TerminalSpawner,
        config: &SpawnConfig,
        snapshot_capacity: usize,
        output_capacity: usize,
    ) -> Result<Arc<Self>, SessionError> {
        let spawned = spawner.spawn(config)?;
        let terminal: Arc<dyn TerminalBackend> = Arc::from(spawned.backend);
        let (sender, receiver) = output_channel(output_capacity);
        let snapshot = Arc::new(SnapshotBuffer::new(snapshot_capacity));
        let reader_exited = Arc::new(AtomicBool::new(false));
        let stats = sender.stats();

        if let Err(err) = spawn_reader(
            id,
            spawned.output,
            snapshot.clone(),
            sender,
            reader_exited.clone(),
        ) {
            terminal.kill();
            return Err(SessionError::Reader(err));
        }

        let (input, queued) = crossbeam_channel::bounded(INPUT_QUEUE_DEPTH);
        if let Err(err) = spawn_writer(id, terminal.clone(), queued) {
            terminal.kill();
            return Err(SessionError::Writer(err));
        }

        let now = Instant::now();
        Ok(Arc::new(Self {
            id,
            terminal,
            input,
            killed: AtomicBool::new(false),
            snapshot,
            output: Arc::new(AsyncMutex::new(receiver)),
            stats,
            reader_exited,
            attachment: Mutex::new(AttachState {
                generation: 0,
                evict: None,
                // A session nobody ever attaches to ages out like a detached one.
                detached_at: Some(now),
            }),
            created_at: now,
        }))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn size(&self) -> TerminalSize {
        self.terminal.size()
    }

    /// Queues keystrokes for the writer thread. Never blocks; a terminal
    /// that stopped reading fills the queue and further input is refused.
    pub fn write(&self, bytes: &[u8]) -> Result<(), TerminalError> {
        if !self.is_alive() {
            return Err(TerminalError::NotAlive);
        }
        if bytes.is_empty() {
            return Ok(());
        }
        match self.input.try_send(Bytes::copy_from_slice(bytes)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TerminalError::Backlogged),
            Err(TrySendError::Disconnected(_)) => Err(TerminalError::NotAlive),
        }
    }

    /// Applies a clamped size and returns what the terminal now reports.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<TerminalSize, TerminalError> {
        if !self.is_alive() {
            return Err(TerminalError::NotAlive);
        }
        let size = TerminalSize::new(rows, cols);
        self.terminal.resize(size)?;
        Ok(size)
    }

    /// False once the reader has seen EOF or the terminal was killed.
    pub fn is_alive(&self) -> bool {
        !self.killed.load(Ordering::Acquire)
            && !self.reader_exited.load(Ordering::Acquire)
            && self.terminal.is_alive()
    }

    /// Marks the session dead at once and reaps the terminal in the background.
    pub fn kill(&self) {
        self.terminate();
        if let Some(evict) = self.attachment.lock().evict.take() {
            let _ = evict.send(());
        }
    }

    fn terminate(&self) {
        if self.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        let id = self.id;
        let terminal = self.terminal.clone();
        let reaper = thread::Builder::new()
            .name(format!("pier-kill-{id}"))
            .spawn(move || {
                terminal.kill();
                debug!(session_id = id, "terminal killed");
            });
        if let Err(err) = reaper {
            warn!(session_id = id, error = %err, "no thread for terminal kill, killing inline");
            self.terminal.kill();
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.snapshot()
    }

    pub fn pipeline_stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Makes the caller the session's only consumer. Any previous attachment
    /// is evicted.
    pub fn attach(&self) -> Attach {
        let (evict, evicted) = oneshot::channel();
        let mut state = self.attachment.lock();
        if let Some(previous) = state.evict.replace(evict) {
            let _ = previous.send(());
            debug!(session_id = self.id, "evicted previous attachment");
        }
        state.generation += 1;
        state.detached_at = None;
        Attach {
            generation: state.generation,
            evicted,
        }
    }

    /// Releases the attachment made at `generation` and starts the grace
    /// period. Stale generations are ignored.
    pub fn detach(&self, generation: u64) {
        let mut state = self.attachment.lock();
        if state.generation != generation || state.evict.is_none() {
            return;
        }
        state.evict = None;
        state.detached_at = Some(Instant::now());
        debug!(session_id = self.id, generation, "session detached");
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.lock().evict.is_some()
    }

    /// True while the attachment made at `generation` is still the current one.
    pub fn is_attached_as(&self, generation: u64) -> bool {
        let state = self.attachment.lock();
        state.generation == generation && state.evict.is_some()
    }

    pub fn detached_since(&self) -> Option<Instant> {
        self.attachment.lock().detached_at
    }

    pub(crate) fn grace_expired(&self, now: Instant, grace: Duration) -> bool {
        match self.attachment.lock().detached_at {
            Some(since) => now.saturating_duration_since(since) >= grace,
            None => false,
        }
    }

    /// Waits until the previous consumer has released the output receiver.
    pub async fn lock_output(&self) -> OwnedMutexGuard<OutputReceiver> {
        self.output.clone().lock_owned().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn spawn_writer(
    id: SessionId,
    terminal: Arc<dyn TerminalBackend>,
    queued: Receiver<Bytes>,
) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("pier-writer-{id}"))
        .spawn(move || {
            for bytes in queued.iter() {
                if let Err(err) = terminal.write(&bytes) {
                    debug!(session_id = id, error = %err, "terminal write failed");
                    break;
                }
            }
            debug!(session_id = id, "terminal writer exited");
        })?;
    Ok(())
}

fn spawn_reader(
    id: SessionId,
    mut output: Box<dyn Read + Send>,
    snapshot: Arc<SnapshotBuffer>,
    sender: OutputSender,
    exited: Arc<AtomicBool>,
) -> io::Result<()> {
    thread::Builder::new()
        .name(format!("pier-reader-{id}"))
        .spawn(move || {
            let mut buffer = vec![0u8; READ_CHUNK];
            let mut seq = 0u64;
            loop {
                match output.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        seq += 1;
                        let data = Bytes::copy_from_slice(&buffer[..n]);
                        snapshot.push(seq, &data);
                        trace!(session_id = id, seq, bytes = n, "terminal output");
                        if sender.send_blocking(OutputChunk { seq, data }).is_err() {
                            debug!(session_id = id, "output receiver dropped");
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(session_id = id, error = %err, "terminal read ended");
                        break;
                    }
                }
            }
            exited.store(true, Ordering::Release);
            debug!(session_id = id, chunks = seq, "terminal reader exited");
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminal::{Command, LoopbackSpawner, SpawnedTerminal, LOOPBACK_PROMPT};

    /// A terminal whose writes and kill hang until `release` is dropped,
    /// like a shell that stopped reading its input.
    struct StalledTerminal {
        gate: Receiver<()>,
        written: Arc<Mutex<Vec<u8>>>,
        output: Mutex<Option<Sender<Vec<u8>>>>,
    }

    impl TerminalBackend for StalledTerminal {
        fn write(&self, bytes: &[u8]) -> Result<(), TerminalError> {
            let _ = self.gate.recv();
            self.written.lock().extend_from_slice(bytes);
            Ok(())
        }

        fn resize(&self, _size: TerminalSize) -> Result<(), TerminalError> {
            Ok(())
        }

        fn size(&self) -> TerminalSize {
            TerminalSize::default()
        }

        fn kill(&self) {
            let _ = self.gate.recv();
            self.output.lock().take();
        }

        fn is_alive(&self) -> bool {
            self.output.lock().is_some()
        }
    }

    struct StalledOutput(Receiver<Vec<u8>>);

    impl Read for StalledOutput {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.recv() {
                Ok(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                Err(_) => Ok(0),
            }
        }
    }

    struct StalledSpawner {
        gate: Receiver<()>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl TerminalSpawner for StalledSpawner {
        fn spawn(&self, _config: &SpawnConfig) -> Result<SpawnedTerminal, TerminalError> {
            let (tx, rx) = crossbeam_channel::unbounded();
            Ok(SpawnedTerminal {
                backend: Box::new(StalledTerminal {
                    gate: self.gate.clone(),
                    written: self.written.clone(),
                    output: Mutex::new(Some(tx)),
                }),
                output: Box::new(StalledOutput(rx)),
            })
        }
    }

    fn spawn_stalled() -> (Arc<Session>, Sender<()>, Arc<Mutex<Vec<u8>>>) {
        let (release, gate) = crossbeam_channel::bounded(0);
        let written = Arc::new(Mutex::new(Vec::new()));
        let spawner = StalledSpawner {
            gate,
            written: written.clone(),
        };
        let config = SpawnConfig::new(Command::new("stalled"), TerminalSize::default());
        let session = Session::spawn(11, &spawner, &config, 1024, 16).expect("spawn session");
        (session, release, written)
    }

    fn spawn_loopback(spawner: &LoopbackSpawner) -> Arc<Session> {
        let config = SpawnConfig::new(Command::new("loopback"), TerminalSize::default());
        Session::spawn(7, spawner, &config, 1024, 16).expect("spawn session")
    }

    #[tokio::test]
    async fn output_reaches_receiver_and_snapshot() {
        let spawner = LoopbackSpawner::new();
        let session = spawn_loopback(&spawner);
        let mut output = session.lock_output().await;

        let first = output.recv().await.expect("prompt chunk");
        assert_eq!(first.seq, 1);
        assert_eq!(first.data.as_ref(), LOOPBACK_PROMPT);

        session.write(b"pwd\r").expect("write");
        let echoed = output.recv().await.expect("echo chunk");
        assert_eq!(echoed.seq, 2);
        assert!(echoed.data.starts_with(b"pwd\r\n"));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.last_seq, 2);
        assert!(snapshot.data.starts_with(LOOPBACK_PROMPT));
    }

    #[tokio::test]
    async fn kill_ends_stream_and_liveness() {
        let spawner = LoopbackSpawner::new();
        let session = spawn_loopback(&spawner);
        let mut output = session.lock_output().await;
        let _ = output.recv().await;

        session.kill();
        assert!(!session.is_alive());
        assert!(output.recv().await.is_none());
        assert!(matches!(session.write(b"x"), Err(TerminalError::NotAlive)));
    }

    #[tokio::test]
    async fn second_attach_evicts_first() {
        let spawner = LoopbackSpawner::new();
        let session = spawn_loopback(&spawner);

        let first = session.attach();
        assert!(session.is_attached());
        let second = session.attach();
        assert!(first.evicted.await.is_ok());

        assert!(!session.is_attached_as(first.generation));
        assert!(session.is_attached_as(second.generation));

        // The evicted generation can no longer detach the newcomer.
        session.detach(first.generation);
        assert!(session.is_attached());

        session.detach(second.generation);
        assert!(!session.is_attached());
        assert!(!session.is_attached_as(second.generation));
        assert!(session.detached_since().is_some());
    }

    #[tokio::test]
    async fn resize_is_clamped() {
        let spawner = LoopbackSpawner::new();
        let session = spawn_loopback(&spawner);
        let applied = session.resize(0, 900).expect("resize");
        assert_eq!(applied, TerminalSize { rows: 1, cols: 500 });
        assert_eq!(session.size(), applied);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn write_and_kill_return_while_the_terminal_is_stuck() {
        let (session, release, written) = spawn_stalled();
        let started = std::time::Instant::now();

        session.write(b"first ").expect("queue first");
        session.write(b"second").expect("queue second");
        session.kill();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!session.is_alive());
        assert!(matches!(session.write(b"late"), Err(TerminalError::NotAlive)));

        drop(release);
        while written.lock().as_slice() != b"first second" {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn input_queue_is_bounded() {
        let (session, release, _written) = spawn_stalled();
        // One write is held by the stuck terminal, the rest fill the queue.
        let refused = (0..INPUT_QUEUE_DEPTH + 2)
            .map(|_| session.write(b"x"))
            .filter(|result| matches!(result, Err(TerminalError::Backlogged)))
            .count();
        assert!(refused >= 1, "queue never filled");
        assert!(session.is_alive());
        drop(release);
    }
}
