use anyhow::{Context, Result};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,quinn=warn,rustls=warn";

pub struct Telemetry;

impl Telemetry {
    /// Installs the global subscriber. Logs go to stderr so the pairing
    /// payload on stdout stays machine-readable.
    pub fn init() -> Result<Self> {
        let ansi = !env_truthy("NO_COLOR");
        tracing_subscriber::registry()
            .with(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(ansi)
                    .with_target(true),
            )
            .try_init()
            .context("failed to initialise tracing subscriber")?;
        debug!(ansi, "telemetry initialised");
        Ok(Self)
    }
}

fn env_truthy(key: &str) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(
            val.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
