use std::io::{self, Read};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use super::{
    SpawnConfig, SpawnedTerminal, TerminalBackend, TerminalError, TerminalSize, TerminalSpawner,
};

pub const LOOPBACK_PROMPT: &[u8] = b"\x1b[1;34mpier\x1b[0m$ ";

/// In-process terminal: prints a prompt, echoes keystrokes, and answers a
/// carriage return with a fresh prompt. Used for headless hosts and tests.
pub struct LoopbackTerminal {
    output: Mutex<Option<Sender<Vec<u8>>>>,
    size: Mutex<TerminalSize>,
}

impl LoopbackTerminal {
    pub fn spawn(size: TerminalSize) -> (Arc<Self>, LoopbackReader) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let _ = tx.send(LOOPBACK_PROMPT.to_vec());
        let terminal = Arc::new(Self {
            output: Mutex::new(Some(tx)),
            size: Mutex::new(size),
        });
        (terminal, LoopbackReader::new(rx))
    }

    /// Injects raw output as if the shell had printed it.
    pub fn emit(&self, bytes: &[u8]) -> Result<(), TerminalError> {
        let guard = self.output.lock();
        let sender = guard.as_ref().ok_or(TerminalError::NotAlive)?;
        sender
            .send(bytes.to_vec())
            .map_err(|_| TerminalError::NotAlive)
    }
}

impl TerminalBackend for LoopbackTerminal {
    fn write(&self, bytes: &[u8]) -> Result<(), TerminalError> {
        let mut echoed = Vec::with_capacity(bytes.len() + LOOPBACK_PROMPT.len());
        for &byte in bytes {
            if byte == b'\r' || byte == b'\n' {
                echoed.extend_from_slice(b"\r\n");
                echoed.extend_from_slice(LOOPBACK_PROMPT);
            } else {
                echoed.push(byte);
            }
        }
        self.emit(&echoed)
    }

    fn resize(&self, size: TerminalSize) -> Result<(), TerminalError> {
        if !self.is_alive() {
            return Err(TerminalError::NotAlive);
        }
        *self.size.lock() = size;
        Ok(())
    }

    fn size(&self) -> TerminalSize {
        *self.size.lock()
    }

    fn kill(&self) {
        self.output.lock().take();
    }

    fn is_alive(&self) -> bool {
        self.output.lock().is_some()
    }
}

// SpawnedTerminal carries a Box<dyn TerminalBackend>; the spawner keeps the Arc for tests.
struct SharedLoopback(Arc<LoopbackTerminal>);

impl TerminalBackend for SharedLoopback {
    fn write(&self, bytes: &[u8]) -> Result<(), TerminalError> {
        self.0.write(bytes)
    }

    fn resize(&self, size: TerminalSize) -> Result<(), TerminalError> {
        self.0.resize(size)
    }

    fn size(&self) -> TerminalSize {
        self.0.size()
    }

    fn kill(&self) {
        self.0.kill()
    }

    fn is_alive(&self) -> bool {
        self.0.is_alive()
    }
}

pub struct LoopbackReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
}

impl LoopbackReader {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            offset: 0,
        }
    }
}

impl Read for LoopbackReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.offset = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let available = &self.pending[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }
}

#[derive(Clone, Default)]
pub struct LoopbackSpawner {
    spawned: Arc<Mutex<Vec<Arc<LoopbackTerminal>>>>,
}

impl LoopbackSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently spawned terminal.
    pub fn last(&self) -> Option<Arc<LoopbackTerminal>> {
        self.spawned.lock().last().cloned()
    }

    pub fn spawned_count(&self) -> usize {
        self.spawned.lock().len()
    }
}

impl TerminalSpawner for LoopbackSpawner {
    fn spawn(&self, config: &SpawnConfig) -> Result<SpawnedTerminal, TerminalError> {
        let (terminal, reader) = LoopbackTerminal::spawn(config.size);
        self.spawned.lock().push(terminal.clone());
        Ok(SpawnedTerminal {
            backend: Box::new(SharedLoopback(terminal)),
            output: Box::new(reader),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_some(reader: &mut LoopbackReader) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let n = reader.read(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn prompt_then_echo() {
        let (terminal, mut reader) = LoopbackTerminal::spawn(TerminalSize::default());
        assert_eq!(read_some(&mut reader), LOOPBACK_PROMPT);

        terminal.write(b"ls\r").unwrap();
        let mut expected = b"ls\r\n".to_vec();
        expected.extend_from_slice(LOOPBACK_PROMPT);
        assert_eq!(read_some(&mut reader), expected);
    }

    #[test]
    fn small_reads_drain_a_chunk_in_pieces() {
        let (terminal, mut reader) = LoopbackTerminal::spawn(TerminalSize::default());
        let _ = read_some(&mut reader);
        terminal.emit(b"abcdef").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn kill_closes_output() {
        let (terminal, mut reader) = LoopbackTerminal::spawn(TerminalSize::default());
        let _ = read_some(&mut reader);
        terminal.kill();
        assert!(!terminal.is_alive());
        assert_eq!(read_some(&mut reader), Vec::<u8>::new());
        assert!(matches!(terminal.write(b"x"), Err(TerminalError::NotAlive)));
    }
}
