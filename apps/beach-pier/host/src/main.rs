use std::sync::Arc;

use anyhow::{Context, Result};
use beach_pier_host::config::{Cli, HostConfig};
use beach_pier_host::identity::CertificateStore;
use beach_pier_host::pairing::pairing_payload;
use beach_pier_host::telemetry::Telemetry;
use beach_pier_host::terminal::PtySpawner;
use beach_pier_host::{HostContext, HostServer};
use clap::Parser;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = HostConfig::try_from(cli)?;
    info!(
        bind_addr = %config.bind_addr,
        token_ttl_secs = config.token_ttl.as_secs(),
        snapshot_lines = config.snapshot_lines,
        "starting beach-pier host"
    );

    run(config).await
}

async fn run(config: HostConfig) -> Result<()> {
    let data_dir = match &config.data_dir {
        Some(dir) => dir.clone(),
        None => CertificateStore::default_dir()?,
    };
    let identity = CertificateStore::new(data_dir)
        .load_or_generate()
        .context("failed to load host identity")?;

    let ctx = HostContext::new(&config, Arc::new(PtySpawner));
    let token = ctx.tokens.generate();
    let server = HostServer::bind(config.bind_addr, &identity, ctx.clone())?;
    let _maintenance = ctx.spawn_maintenance();

    let local = server.local_addr().context("endpoint has no local address")?;
    let payload = pairing_payload(local, config.advertise_host.as_deref(), &identity, &token);
    println!("{}", payload.to_json()?);
    info!(
        host = %payload.host,
        port = payload.port,
        fingerprint = %payload.fingerprint,
        "pairing payload written to stdout"
    );

    tokio::select! {
        _ = server.run() => {}
        _ = signal::ctrl_c() => info!("shutdown signal received"),
    }

    server.close();
    let killed = ctx.sessions.shutdown();
    server.wait_idle().await;
    info!(killed, "shutdown complete");
    Ok(())
}
