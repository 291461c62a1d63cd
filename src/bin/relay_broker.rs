//! `relay-broker` - standalone Relay Broker Server process.
//!
//! This is the binary entry point. See the `relay_core` library for the
//! listener/OCE/ICM components an application embeds directly.

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relay_core::broker::RelayBroker;
use relay_core::config::Config;
use relay_core::crypto::keys::LocalIdentityKeyPair;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "relay-broker")]
#[command(version)]
#[command(about = "Relay Broker Server: WebSocket rendezvous for end-to-end encrypted peer connections")]
struct Cli {
    /// Path to the JSON config file (defaults to the platform config directory).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the WebSocket listener to.
    #[arg(long, default_value = "127.0.0.1:8765")]
    bind: String,

    /// Increase log verbosity (info by default, debug with -v, trace with -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Load this broker's long-term identity keypair from `{config_dir}/identity.key`,
/// generating and persisting a fresh one on first run.
fn load_or_create_identity() -> Result<LocalIdentityKeyPair> {
    let path = Config::config_dir()?.join("identity.key");
    if let Ok(bytes) = fs::read(&path) {
        return LocalIdentityKeyPair::from_secret_bytes(&bytes)
            .context("identity.key is not a valid 32-byte secret key");
    }

    let identity = LocalIdentityKeyPair::generate();
    fs::write(&path, identity.secret_bytes())
        .with_context(|| format!("writing identity key to {}", path.display()))?;

    #[cfg(unix)]
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("setting permissions on {}", path.display()))?;

    log::info!("[relay-broker] generated a new identity key at {}", path.display());
    Ok(identity)
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => {
            let content = fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str(&content).context("parsing config file")?
        }
        None => Config::load()?,
    };
    config.broker_url = format!("ws://{}", cli.bind);

    let identity = load_or_create_identity()?;
    log::info!(
        "[relay-broker] identity public key: {}",
        hex::encode(identity.public_key().as_bytes())
    );

    let listener = TcpListener::bind(&cli.bind)
        .await
        .with_context(|| format!("binding {}", cli.bind))?;
    log::info!("[relay-broker] listening on {}", cli.bind);

    let broker = Arc::new(RelayBroker::new(identity, config));
    let mut accept_handle = Arc::clone(&broker).serve(listener);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("installing Ctrl-C handler")?;

    tokio::select! {
        result = &mut accept_handle => {
            if let Err(err) = result {
                log::error!("[relay-broker] accept loop task panicked: {err}");
            } else {
                log::error!("[relay-broker] accept loop exited unexpectedly");
            }
        }
        _ = shutdown_rx.recv() => {
            log::info!("[relay-broker] shutdown signal received");
        }
    }

    accept_handle.abort();
    broker.shutdown().await;
    log::info!("[relay-broker] shut down cleanly");

    Ok(())
}
