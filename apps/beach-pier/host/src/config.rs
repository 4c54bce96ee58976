use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use beach_pier_core::SNAPSHOT_BUFFER_LINES;
use clap::Parser;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8443";
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_OUTPUT_CAPACITY: usize = 1024;
pub const DEFAULT_SESSION_GRACE: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Byte budget per "line" of snapshot history. Escape-heavy prompts blow well
/// past 80 columns, so this errs high.
pub const SNAPSHOT_BYTES_PER_LINE: usize = 256;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub bind_addr: SocketAddr,
    pub token_ttl: Duration,
    pub snapshot_lines: usize,
    pub output_capacity: usize,
    pub session_grace: Duration,
    pub reap_interval: Duration,
    pub token_sweep_interval: Duration,
    pub handshake_timeout: Duration,
    pub failure_threshold: u32,
    pub failure_window: Duration,
    /// `None` keeps bans in place until the address is reset.
    pub ban_duration: Option<Duration>,
    pub shell: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub advertise_host: Option<String>,
}

impl HostConfig {
    pub fn snapshot_capacity_bytes(&self) -> usize {
        self.snapshot_lines.saturating_mul(SNAPSHOT_BYTES_PER_LINE).max(1)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8443))),
            token_ttl: DEFAULT_TOKEN_TTL,
            snapshot_lines: SNAPSHOT_BUFFER_LINES,
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
            session_grace: DEFAULT_SESSION_GRACE,
            reap_interval: DEFAULT_REAP_INTERVAL,
            token_sweep_interval: DEFAULT_TOKEN_SWEEP_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            failure_window: DEFAULT_FAILURE_WINDOW,
            ban_duration: None,
            shell: None,
            data_dir: None,
            advertise_host: None,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier",
    author,
    version,
    about = "Serve this machine's shell to a paired device over QUIC"
)]
pub struct Cli {
    /// Address the QUIC endpoint binds to.
    #[arg(long, env = "BEACH_PIER_BIND_ADDR", default_value = DEFAULT_BIND_ADDR)]
    pub bind_addr: String,

    /// Lifetime of the pairing token.
    #[arg(long, env = "BEACH_PIER_TOKEN_TTL_SECS", default_value_t = DEFAULT_TOKEN_TTL.as_secs())]
    pub token_ttl_secs: u64,

    /// Approximate number of terminal lines kept for reconnect replay.
    #[arg(long, env = "BEACH_PIER_SNAPSHOT_LINES", default_value_t = SNAPSHOT_BUFFER_LINES)]
    pub snapshot_lines: usize,

    /// Depth of the per-session output channel, in chunks.
    #[arg(long, env = "BEACH_PIER_OUTPUT_CAPACITY", default_value_t = DEFAULT_OUTPUT_CAPACITY)]
    pub output_capacity: usize,

    /// How long a disconnected session waits for its client to come back.
    #[arg(long, env = "BEACH_PIER_SESSION_GRACE_SECS", default_value_t = DEFAULT_SESSION_GRACE.as_secs())]
    pub session_grace_secs: u64,

    /// Time a client has to send its Hello.
    #[arg(long, env = "BEACH_PIER_HANDSHAKE_TIMEOUT_SECS", default_value_t = DEFAULT_HANDSHAKE_TIMEOUT.as_secs())]
    pub handshake_timeout_secs: u64,

    /// Expire bans after this many seconds instead of holding them until restart.
    #[arg(long, env = "BEACH_PIER_BAN_SECS")]
    pub ban_secs: Option<u64>,

    /// Shell to launch; defaults to $SHELL or the first available system shell.
    #[arg(long, env = "BEACH_PIER_SHELL")]
    pub shell: Option<String>,

    /// Directory holding host.crt / host.key.
    #[arg(long, env = "BEACH_PIER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Hostname or address written into the pairing payload.
    #[arg(long, env = "BEACH_PIER_ADVERTISE_HOST")]
    pub advertise_host: Option<String>,
}

impl TryFrom<Cli> for HostConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let bind_addr: SocketAddr = cli
            .bind_addr
            .parse()
            .with_context(|| format!("invalid bind address: {}", cli.bind_addr))?;
        if cli.output_capacity == 0 {
            bail!("output capacity must be at least one chunk");
        }
        if cli.snapshot_lines == 0 {
            bail!("snapshot buffer must hold at least one line");
        }
        if cli.token_ttl_secs == 0 {
            bail!("token ttl must be positive");
        }
        Ok(HostConfig {
            bind_addr,
            token_ttl: Duration::from_secs(cli.token_ttl_secs),
            snapshot_lines: cli.snapshot_lines,
            output_capacity: cli.output_capacity,
            session_grace: Duration::from_secs(cli.session_grace_secs),
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            ban_duration: cli.ban_secs.map(Duration::from_secs),
            shell: cli.shell.filter(|s| !s.trim().is_empty()),
            data_dir: cli.data_dir,
            advertise_host: cli.advertise_host,
            ..HostConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<HostConfig> {
        let mut argv = vec!["beach-pier"];
        argv.extend_from_slice(args);
        HostConfig::try_from(Cli::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = HostConfig::default();
        assert_eq!(config.bind_addr.port(), 8443);
        assert_eq!(config.token_ttl, Duration::from_secs(604_800));
        assert_eq!(config.snapshot_lines, 1000);
        assert_eq!(config.output_capacity, 1024);
        assert_eq!(config.session_grace, Duration::from_secs(900));
        assert_eq!(config.reap_interval, Duration::from_secs(30));
        assert_eq!(config.failure_threshold, 3);
        assert!(config.ban_duration.is_none());
        assert_eq!(config.snapshot_capacity_bytes(), 1000 * SNAPSHOT_BYTES_PER_LINE);
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--bind-addr",
            "127.0.0.1:9000",
            "--token-ttl-secs",
            "60",
            "--snapshot-lines",
            "10",
            "--output-capacity",
            "8",
            "--ban-secs",
            "120",
        ])
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.token_ttl, Duration::from_secs(60));
        assert_eq!(config.snapshot_capacity_bytes(), 10 * SNAPSHOT_BYTES_PER_LINE);
        assert_eq!(config.output_capacity, 8);
        assert_eq!(config.ban_duration, Some(Duration::from_secs(120)));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse(&["--bind-addr", "not-an-addr"]).is_err());
        assert!(parse(&["--output-capacity", "0"]).is_err());
        assert!(parse(&["--snapshot-lines", "0"]).is_err());
    }
}
