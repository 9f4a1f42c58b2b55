//! `rvd`: the public rendezvous relay (spec.md §4.1, §6).

use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use sshnp_common::Address;
use sshnp_core::{serve_rendezvous_requests, Relay, RelayConfig, SessionError};
use sshnp_ssh::{load_or_generate_signing_key, SshKeyAlgo};
use sshnp_substrate::SubstrateNetwork;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Run the neutral TCP rendezvous relay (spec.md §4.1, §6).
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Non-secret defaults (atsign, bind IP); CLI flags override them.
    #[arg(long = "config")]
    config: Option<std::path::PathBuf>,

    #[arg(long = "atsign", env = "SSHNP_ATSIGN")]
    atsign: Option<Address>,

    /// Public IP to bind allocation listeners on.
    #[arg(long = "ip")]
    ip: Option<IpAddr>,

    /// Hex-dump spliced bytes without altering them (spec.md §4.1).
    #[arg(long = "snoop")]
    snoop: bool,

    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileConfig {
    atsign: Option<Address>,
    ip: Option<IpAddr>,
    #[serde(default)]
    snoop: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn signing_key_path() -> std::path::PathBuf {
    let home = std::env::var_os("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    home.join(".sshnp").join("keys").join("rvd_identity")
}

fn build_config(cli: &Cli) -> Result<RelayConfig, SessionError> {
    let file_config = match &cli.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            serde_yaml::from_str(&contents)
                .map_err(|e| SessionError::Remote(format!("invalid config file {}: {e}", path.display())))?
        }
        None => FileConfig::default(),
    };

    let atsign = cli
        .atsign
        .clone()
        .or(file_config.atsign)
        .ok_or_else(|| SessionError::Remote("--atsign is required (flag or --config)".into()))?;
    let ip = cli
        .ip
        .or(file_config.ip)
        .ok_or_else(|| SessionError::Remote("--ip is required (flag or --config)".into()))?;
    let snoop = cli.snoop || file_config.snoop;

    Ok(RelayConfig { atsign, ip, snoop })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error:?}");
            // `.context(...)` wraps the typed `SessionError` in an opaque
            // `anyhow::Error`, so the exit code is recovered by walking the
            // causal chain rather than downcasting the top frame.
            let code = error
                .chain()
                .find_map(|cause| cause.downcast_ref::<SessionError>())
                .map(|e| e.exit_code())
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

/// `anyhow` at the CLI boundary (SPEC_FULL.md §2): internal components
/// return the typed `SessionError` taxonomy (spec.md §7), threaded through
/// here with `?` and contextualised for the user-facing message.
async fn run(cli: Cli) -> Result<()> {
    let config = build_config(&cli).context("invalid relay configuration")?;
    let key_path = signing_key_path();
    let signing_key = load_or_generate_signing_key(&key_path, SshKeyAlgo::Ed25519)
        .map_err(|e| {
            SessionError::Config(sshnp_common::ConfigError::UnreadableKeyFile {
                path: key_path.display().to_string(),
                source: std::io::Error::other(e.to_string()),
            })
        })
        .with_context(|| format!("failed to load or generate signing key at {}", key_path.display()))?;

    // Each process mints its own isolated substrate network: the real
    // identity/messaging substrate is out of scope (spec.md §1) and this
    // reference implementation has no wire transport to bind to, so a
    // single-process demo is the limit of what can be exercised here.
    let network = SubstrateNetwork::new();
    let substrate = Arc::new(network.handle(config.atsign.clone(), signing_key.public_key_record()).await);

    info!(atsign = %config.atsign, ip = %config.ip, snoop = config.snoop, "starting rendezvous relay");

    let relay = Arc::new(Relay::new(config.ip, config.snoop));
    let shutdown = CancellationToken::new();

    tokio::select! {
        result = serve_rendezvous_requests(relay, substrate, shutdown.clone()) => {
            result
                .map_err(|e| SessionError::Remote(e.to_string()))
                .context("rendezvous relay loop failed")
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
            shutdown.cancel();
            Ok(())
        }
    }
}
