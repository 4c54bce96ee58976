use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtyPair, PtySize};
use tracing::debug;

use super::{
    Command, SpawnConfig, SpawnedTerminal, TerminalBackend, TerminalError, TerminalSize,
    TerminalSpawner,
};

/// Spawns shells on the platform pseudo-terminal (Unix PTY or Windows ConPTY,
/// picked by `portable-pty` at build time).
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl TerminalSpawner for PtySpawner {
    fn spawn(&self, config: &SpawnConfig) -> Result<SpawnedTerminal, TerminalError> {
        let (terminal, output) = PtyTerminal::spawn(config)?;
        Ok(SpawnedTerminal {
            backend: Box::new(terminal),
            output,
        })
    }
}

pub struct PtyTerminal {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    size: Mutex<TerminalSize>,
    killed: AtomicBool,
}

impl PtyTerminal {
    pub fn spawn(
        config: &SpawnConfig,
    ) -> Result<(Self, Box<dyn std::io::Read + Send>), TerminalError> {
        let pair = spawn_pair(config.size)?;
        let child = spawn_child(&pair, &config.command)?;
        let master = pair.master;
        let reader = master
            .try_clone_reader()
            .map_err(|err| TerminalError::Spawn(format!("clone PTY reader: {err}")))?;
        let writer = master
            .take_writer()
            .map_err(|err| TerminalError::Spawn(format!("take PTY writer: {err}")))?;
        // The slave end must close in this process or the reader never sees EOF.
        drop(pair.slave);

        debug!(
            target: "pier::terminal",
            program = %config.command.program,
            rows = config.size.rows,
            cols = config.size.cols,
            "spawned pty"
        );

        Ok((
            Self {
                master: Mutex::new(master),
                writer: Mutex::new(writer),
                child: Mutex::new(Some(child)),
                size: Mutex::new(config.size),
                killed: AtomicBool::new(false),
            },
            reader,
        ))
    }
}

impl TerminalBackend for PtyTerminal {
    fn write(&self, bytes: &[u8]) -> Result<(), TerminalError> {
        if !self.is_alive() {
            return Err(TerminalError::NotAlive);
        }
        let mut writer = self.writer.lock();
        writer.write_all(bytes).map_err(TerminalError::Write)?;
        writer.flush().map_err(TerminalError::Write)
    }

    fn resize(&self, size: TerminalSize) -> Result<(), TerminalError> {
        if !self.is_alive() {
            return Err(TerminalError::NotAlive);
        }
        // Hold the size lock across the ioctl so concurrent resizes apply in order.
        let mut current = self.size.lock();
        self.master
            .lock()
            .resize(pty_size(size))
            .map_err(|err| TerminalError::Resize(err.to_string()))?;
        *current = size;
        Ok(())
    }

    fn size(&self) -> TerminalSize {
        *self.size.lock()
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        // Taken out first so liveness checks never wait behind the reap.
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn is_alive(&self) -> bool {
        if self.killed.load(Ordering::SeqCst) {
            return false;
        }
        match self.child.lock().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

impl Drop for PtyTerminal {
    fn drop(&mut self) {
        self.kill();
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn spawn_pair(size: TerminalSize) -> Result<PtyPair, TerminalError> {
    native_pty_system()
        .openpty(pty_size(size))
        .map_err(|err| TerminalError::Spawn(format!("open PTY pair: {err}")))
}

fn spawn_child(
    pair: &PtyPair,
    command: &Command,
) -> Result<Box<dyn Child + Send + Sync>, TerminalError> {
    let mut cmd = CommandBuilder::new(&command.program);
    for arg in &command.args {
        cmd.arg(arg);
    }
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    pair.slave
        .spawn_command(cmd)
        .map_err(|err| TerminalError::Spawn(format!("spawn {}: {err}", command.program)))
}
