mod loopback;
mod pty;

pub use loopback::{LoopbackReader, LoopbackSpawner, LoopbackTerminal, LOOPBACK_PROMPT};
pub use pty::{PtySpawner, PtyTerminal};

use std::io::Read;

use thiserror::Error;

pub const MIN_DIMENSION: u16 = 1;
pub const MAX_DIMENSION: u16 = 500;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("terminal not alive")]
    NotAlive,
    #[error("failed to spawn terminal: {0}")]
    Spawn(String),
    #[error("terminal write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("terminal resize failed: {0}")]
    Resize(String),
    #[error("terminal is not keeping up with input")]
    Backlogged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows: rows.clamp(MIN_DIMENSION, MAX_DIMENSION),
            cols: cols.clamp(MIN_DIMENSION, MAX_DIMENSION),
        }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

#[derive(Clone, Debug)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The user's interactive shell, honouring an explicit override.
    pub fn shell(shell: Option<&str>) -> Self {
        let program = shell
            .map(str::to_string)
            .unwrap_or_else(default_shell);
        Command::new(program).env("TERM", "xterm-256color")
    }
}

#[derive(Clone, Debug)]
pub struct SpawnConfig {
    pub command: Command,
    pub size: TerminalSize,
}

impl SpawnConfig {
    pub fn new(command: Command, size: TerminalSize) -> Self {
        Self { command, size }
    }
}

/// A live terminal. Implementations synchronise internally so `write` and
/// `resize` can race with the reader thread.
pub trait TerminalBackend: Send + Sync {
    fn write(&self, bytes: &[u8]) -> Result<(), TerminalError>;
    fn resize(&self, size: TerminalSize) -> Result<(), TerminalError>;
    fn size(&self) -> TerminalSize;
    fn kill(&self);
    fn is_alive(&self) -> bool;
}

pub struct SpawnedTerminal {
    pub backend: Box<dyn TerminalBackend>,
    /// Blocking byte source; EOF means the child has gone.
    pub output: Box<dyn Read + Send>,
}

pub trait TerminalSpawner: Send + Sync {
    fn spawn(&self, config: &SpawnConfig) -> Result<SpawnedTerminal, TerminalError>;
}

#[cfg(unix)]
pub fn default_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.trim().is_empty() {
            return shell;
        }
    }

    for shell in &["/bin/bash", "/bin/zsh", "/bin/sh"] {
        if std::path::Path::new(shell).exists() {
            return shell.to_string();
        }
    }

    "/bin/sh".to_string()
}

#[cfg(windows)]
pub fn default_shell() -> String {
    std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_clamped() {
        assert_eq!(TerminalSize::new(0, 0), TerminalSize { rows: 1, cols: 1 });
        assert_eq!(
            TerminalSize::new(9000, 120),
            TerminalSize {
                rows: MAX_DIMENSION,
                cols: 120
            }
        );
    }

    #[test]
    fn shell_override_wins() {
        let command = Command::shell(Some("/usr/bin/fish"));
        assert_eq!(command.program, "/usr/bin/fish");
        assert!(command
            .env
            .iter()
            .any(|(k, v)| k == "TERM" && v == "xterm-256color"));
    }

    #[test]
    fn default_shell_is_never_empty() {
        assert!(!default_shell().is_empty());
    }
}
