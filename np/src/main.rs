//! `np`: the session-establishment client (spec.md §4.3, §6).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sshnp_common::{Address, ConfigError, DeviceName};
use sshnp_core::{ClientConfig, SessionError, SessionOrchestrator, SshAlgoConfig, SshClientConfig};
use sshnp_ssh::{load_or_generate_signing_key, ExecSshDriver, SshKeyAlgo};
use sshnp_substrate::SubstrateNetwork;
use tracing::*;

/// Tunnel a local port through a device behind NAT (spec.md §6).
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// This client's own address on the identity substrate.
    #[arg(short = 'f', long = "from", env = "SSHNP_FROM")]
    from: Address,

    /// The target device's daemon address.
    #[arg(short = 't', long = "to", env = "SSHNP_TO")]
    to: Address,

    /// The target device's name.
    #[arg(short = 'd', long = "device", env = "SSHNP_DEVICE")]
    device: DeviceName,

    /// Rendezvous address for direct mode, or a host for legacy reverse mode.
    #[arg(short = 'h', long = "host", default_value = "localhost")]
    host: String,

    /// Remote sshd port (reverse mode) or rendezvous port (ignored in direct mode).
    #[arg(short = 'p', long = "port", default_value_t = 22)]
    port: u16,

    /// Local port to bind the bridge on; 0 picks an ephemeral port.
    #[arg(short = 'l', long = "local-port", default_value_t = 0)]
    local_port: u16,

    /// Use this OpenSSH identity file instead of a freshly generated one.
    #[arg(short = 'i', long = "identity-file")]
    identity_file: Option<PathBuf>,

    /// Remote username to connect as; if omitted, read from the daemon's shared value.
    #[arg(short = 'u', long = "remote-username")]
    remote_username: Option<String>,

    /// Share this client's ephemeral public key with the daemon up front
    /// instead of letting the daemon mint one (legacy reverse mode).
    #[arg(short = 's', long = "send-ssh-public-key")]
    send_ssh_public_key: bool,

    /// Extra options appended verbatim to the printed `ssh` command line.
    #[arg(short = 'o', long = "local-ssh-options")]
    local_ssh_options: Vec<String>,

    /// List devices visible behind `--to` instead of starting a session.
    #[arg(long = "list-devices")]
    list_devices: bool,

    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn signing_key_path() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    home.join(".sshnp").join("keys").join("np_identity")
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    tokio::select! {
        result = run(cli) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                error!("{error:?}");
                // `.context(...)` wraps the typed `SessionError` in an opaque
                // `anyhow::Error`, so the exit code is recovered by walking
                // the causal chain rather than downcasting the top frame.
                let code = error
                    .chain()
                    .find_map(|cause| cause.downcast_ref::<SessionError>())
                    .map(|e| e.exit_code())
                    .unwrap_or(1);
                ExitCode::from(code as u8)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, exiting");
            ExitCode::from(130)
        }
    }
}

/// `anyhow` at the CLI boundary (SPEC_FULL.md §2): internal components
/// return the typed `SessionError` taxonomy (spec.md §7), which is threaded
/// through here with `?` and contextualised for the user-facing message;
/// `main` downcasts back to `SessionError` for the exit code.
async fn run(cli: Cli) -> Result<()> {
    let key_path = signing_key_path();
    let signing_key = load_or_generate_signing_key(&key_path, SshKeyAlgo::Ed25519)
        .map_err(|e| {
            SessionError::Config(ConfigError::UnreadableKeyFile {
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
    let substrate = Arc::new(network.handle(cli.from.clone(), signing_key.public_key_record()).await);

    if cli.list_devices {
        let report = sshnp_core::discover_devices(substrate, &cli.to, sshnp_core::config::PING_TIMEOUT)
            .await
            .context("device discovery failed")?;
        for (name, device) in &report.devices {
            println!(
                "{name}\tversion={}\tfeatures={}\tlive={}",
                device.info.version,
                device.info.supported_features.join(","),
                device.responded_to_ping
            );
        }
        return Ok(());
    }

    let config = ClientConfig {
        client_address: cli.from,
        daemon_address: cli.to,
        device: cli.device,
        ssh_client: SshClientConfig::Exec,
        ssh_algo: SshAlgoConfig::Ed25519,
        host: cli.host,
        port: cli.port,
        local_port: cli.local_port,
        remote_username: cli.remote_username,
        identity_file: cli.identity_file,
        list_devices: false,
        verbose: cli.verbose,
        legacy_daemon: false,
        // `--send-ssh-public-key` is accepted for CLI compatibility; the
        // orchestrator already shares the ephemeral public key up front on
        // every request (spec.md §4.3 step 4), so this flag has no
        // additional effect today.
        add_forwards_to_tunnel: false,
        shared_key_ttl: sshnp_core::config::DEFAULT_SHARED_KEY_TTL,
    };

    let orchestrator = SessionOrchestrator::new(substrate, config, signing_key, Arc::new(ExecSshDriver));
    let outcome = orchestrator.run().await.context("session establishment failed")?;

    let mut command = outcome.ssh_command;
    for option in &cli.local_ssh_options {
        command.push(' ');
        command.push_str(option);
    }
    println!("{command}");

    Ok(())
}
