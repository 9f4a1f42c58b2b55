//! `npd`: the daemon that answers session requests on behalf of one device
//! (spec.md §4.2, §6).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use data_encoding::BASE64;
use serde::{Deserialize, Serialize};
use sshnp_common::{Address, DeviceName};
use sshnp_core::{DaemonConfig, DaemonController, SessionError};
use sshnp_ssh::{load_or_generate_signing_key, SshKeyAlgo};
use sshnp_substrate::SubstrateNetwork;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Run the daemon side of the tunnel for one device (spec.md §6).
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Non-secret defaults (device name, allow-list, sshd port); CLI flags
    /// below override whatever this file sets (spec.md §6).
    #[arg(long = "config")]
    config: Option<PathBuf>,

    #[arg(long = "atsign", env = "SSHNP_ATSIGN")]
    atsign: Option<Address>,

    /// Allow-list of manager addresses; empty means every sender is accepted.
    #[arg(long = "manager")]
    manager: Vec<Address>,

    #[arg(long = "device", env = "SSHNP_DEVICE")]
    device: Option<DeviceName>,

    /// Print this daemon's long-term public key and exit, for onboarding
    /// it onto the substrate's key directory.
    #[arg(long = "sshpublickey")]
    sshpublickey: bool,

    /// Don't announce device_info/heartbeat (spec.md §4.2).
    #[arg(long = "hide")]
    hide: bool,

    /// Force-clear a previously configured `--hide`.
    #[arg(long = "un-hide")]
    un_hide: bool,

    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileConfig {
    atsign: Option<Address>,
    #[serde(default)]
    manager: Vec<Address>,
    device: Option<DeviceName>,
    sshd_port: Option<u16>,
    #[serde(default)]
    hidden: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn signing_key_path(device: &DeviceName) -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    home.join(".sshnp").join("keys").join(format!("npd_{device}"))
}

fn build_config(cli: &Cli) -> Result<DaemonConfig, SessionError> {
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
    let device = cli
        .device
        .clone()
        .or(file_config.device)
        .ok_or_else(|| SessionError::Remote("--device is required (flag or --config)".into()))?;
    let manager = if cli.manager.is_empty() { file_config.manager } else { cli.manager.clone() };
    let hidden = if cli.un_hide { false } else { cli.hide || file_config.hidden };

    Ok(DaemonConfig {
        atsign,
        manager,
        device,
        sshd_port: file_config.sshd_port.unwrap_or(22),
        hidden,
        idle_timeout: sshnp_core::config::DEFAULT_IDLE_TIMEOUT,
        shared_key_ttl: sshnp_core::config::DEFAULT_SHARED_KEY_TTL,
    })
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
    let config = build_config(&cli).context("invalid daemon configuration")?;
    let key_path = signing_key_path(&config.device);
    let signing_key = load_or_generate_signing_key(&key_path, SshKeyAlgo::Ed25519)
        .map_err(|e| {
            SessionError::Config(sshnp_common::ConfigError::UnreadableKeyFile {
                path: key_path.display().to_string(),
                source: std::io::Error::other(e.to_string()),
            })
        })
        .with_context(|| format!("failed to load or generate signing key at {}", key_path.display()))?;

    if cli.sshpublickey {
        let record = signing_key.public_key_record();
        println!("{:?} {}", record.algo, BASE64.encode(&record.key_bytes));
        return Ok(());
    }

    let network = SubstrateNetwork::new();
    let substrate = Arc::new(network.handle(config.atsign.clone(), signing_key.public_key_record()).await);

    info!(device = %config.device, atsign = %config.atsign, "starting daemon");

    let controller = DaemonController::new(substrate, config, signing_key);
    let shutdown = CancellationToken::new();

    tokio::select! {
        result = controller.run(shutdown.clone()) => result.context("daemon run loop failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("received interrupt, shutting down");
            shutdown.cancel();
            Ok(())
        }
    }
}
