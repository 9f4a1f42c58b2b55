use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sshnp_common::{Address, DeviceName};

/// Shared-key TTL default (spec.md §9 Open Question, resolved as
/// configurable rather than hard-coded, default `10s`).
pub const DEFAULT_SHARED_KEY_TTL: Duration = Duration::from_secs(10);
/// Control-response wait, per spec.md §5.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Rendezvous-allocation wait, per spec.md §4.3 step 2.
pub const RENDEZVOUS_TIMEOUT: Duration = Duration::from_secs(10);
/// Device-ping wait, per spec.md §4.3 "Discovery".
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);
/// Daemon idle timeout for an ephemeral authorised key, per spec.md §4.2.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20);
/// Daemon heartbeat interval, per spec.md §4.2.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Which SSH algorithm the client generates for a session's ephemeral key
/// pair (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshAlgoConfig {
    Ed25519,
    Rsa,
}

impl From<SshAlgoConfig> for sshnp_ssh::SshKeyAlgo {
    fn from(value: SshAlgoConfig) -> Self {
        match value {
            SshAlgoConfig::Ed25519 => sshnp_ssh::SshKeyAlgo::Ed25519,
            SshAlgoConfig::Rsa => sshnp_ssh::SshKeyAlgo::Rsa,
        }
    }
}

/// How the orchestrator drives the post-establishment SSH session
/// (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshClientConfig {
    Exec,
    Dart,
}

/// `np` client configuration (spec.md §4.3, §6). CLI flags in the `np`
/// binary override a loaded file's values field-by-field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub client_address: Address,
    pub daemon_address: Address,
    pub device: DeviceName,
    #[serde(default = "default_ssh_client")]
    pub ssh_client: SshClientConfig,
    #[serde(default = "default_ssh_algo")]
    pub ssh_algo: SshAlgoConfig,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub remote_username: Option<String>,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub list_devices: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub legacy_daemon: bool,
    #[serde(default)]
    pub add_forwards_to_tunnel: bool,
    #[serde(default = "default_shared_key_ttl", with = "humantime_serde")]
    pub shared_key_ttl: Duration,
}

fn default_ssh_client() -> SshClientConfig {
    SshClientConfig::Exec
}

fn default_ssh_algo() -> SshAlgoConfig {
    SshAlgoConfig::Ed25519
}

fn default_ssh_port() -> u16 {
    22
}

fn default_shared_key_ttl() -> Duration {
    DEFAULT_SHARED_KEY_TTL
}

/// `npd` daemon configuration (spec.md §4.2, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub atsign: Address,
    #[serde(default)]
    pub manager: Vec<Address>,
    pub device: DeviceName,
    #[serde(default = "default_ssh_port")]
    pub sshd_port: u16,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(default = "default_shared_key_ttl", with = "humantime_serde")]
    pub shared_key_ttl: Duration,
}

fn default_idle_timeout() -> Duration {
    DEFAULT_IDLE_TIMEOUT
}

impl DaemonConfig {
    /// Allow-list mode is active whenever `manager` is non-empty (spec.md
    /// §4.2 step 1).
    pub fn is_allow_listed(&self, sender: &Address) -> bool {
        self.manager.is_empty() || self.manager.contains(sender)
    }
}

/// `rvd` relay configuration (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub atsign: Address,
    pub ip: IpAddr,
    #[serde(default)]
    pub snoop: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_empty_means_everyone_is_authorised() {
        let config = DaemonConfig {
            atsign: "@device".parse().unwrap(),
            manager: vec![],
            device: DeviceName::new("office").unwrap(),
            sshd_port: 22,
            hidden: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            shared_key_ttl: DEFAULT_SHARED_KEY_TTL,
        };
        assert!(config.is_allow_listed(&"@anyone".parse().unwrap()));
    }

    #[test]
    fn allow_list_rejects_unlisted_sender() {
        let config = DaemonConfig {
            atsign: "@device".parse().unwrap(),
            manager: vec!["@owner".parse().unwrap()],
            device: DeviceName::new("office").unwrap(),
            sshd_port: 22,
            hidden: false,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            shared_key_ttl: DEFAULT_SHARED_KEY_TTL,
        };
        assert!(config.is_allow_listed(&"@owner".parse().unwrap()));
        assert!(!config.is_allow_listed(&"@intruder".parse().unwrap()));
    }
}
