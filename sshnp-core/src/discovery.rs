//! Device discovery for `np --list-devices` (spec.md §4.3 "Discovery"
//! supplement): asks every daemon behind an address to re-announce itself,
//! then collects replies for a bounded window.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use sshnp_common::{Address, DeviceInfo};
use sshnp_substrate::Substrate;

use crate::config::PING_TIMEOUT;
use crate::error::SessionError;
use crate::topics;

/// One device observed during a discovery sweep.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub info: DeviceInfo,
    pub responded_to_ping: bool,
}

/// Result of a full discovery sweep against one address.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    pub devices: HashMap<String, DiscoveredDevice>,
}

/// Broadcasts a `discover` request to every daemon behind `address`,
/// collects `device_info`/`heartbeat` announcements for `window`, then
/// pings each discovered device and waits up to [`PING_TIMEOUT`] for a
/// `pong` to mark it live.
///
/// Announcements aren't retained by the substrate for late subscribers, so
/// without the `discover` round-trip a client that starts after a daemon's
/// last heartbeat would never learn that device exists.
pub async fn discover_devices<S: Substrate>(
    substrate: Arc<S>,
    address: &Address,
    window: std::time::Duration,
) -> Result<DiscoveryReport, SessionError> {
    let mut announcements = substrate.watch(address, topics::announcement_pattern()).await?;

    substrate.notify(address, topics::DISCOVER_KEY, "").await?;

    let mut report = DiscoveryReport::default();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, announcements.next()).await {
            Ok(Some(notification)) => {
                let Ok(info) = serde_json::from_str::<DeviceInfo>(&notification.value) else {
                    continue;
                };
                report
                    .devices
                    .entry(info.devicename.clone())
                    .and_modify(|existing| existing.info = info.clone())
                    .or_insert(DiscoveredDevice {
                        info,
                        responded_to_ping: false,
                    });
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }

    for device_name in report.devices.keys().cloned().collect::<Vec<_>>() {
        let Ok(device) = device_name.parse() else { continue };
        let responded = ping_device(substrate.as_ref(), address, &device).await?;
        if let Some(entry) = report.devices.get_mut(&device_name) {
            entry.responded_to_ping = responded;
        }
    }

    Ok(report)
}

async fn ping_device<S: Substrate>(
    substrate: &S,
    address: &Address,
    device: &sshnp_common::DeviceName,
) -> Result<bool, SessionError> {
    let mut pongs = substrate
        .watch(address, &format!("^pong\\.{}$", regex::escape(device.as_str())))
        .await?;
    substrate.notify(address, &topics::ping_key(device), "").await?;

    match tokio::time::timeout(PING_TIMEOUT, pongs.next()).await {
        Ok(Some(_)) => Ok(true),
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sshnp_common::{DeviceName, PublicKeyRecord, SigningAlgo};
    use sshnp_substrate::SubstrateNetwork;

    use super::*;

    fn test_key() -> PublicKeyRecord {
        PublicKeyRecord {
            algo: SigningAlgo::Ed25519,
            key_bytes: vec![0u8; 32],
        }
    }

    #[tokio::test]
    async fn discovery_collects_device_announcements() {
        let network = SubstrateNetwork::new();
        let client_addr: Address = "@client".parse().unwrap();
        let daemon_addr: Address = "@daemon".parse().unwrap();
        let client = network.handle(client_addr.clone(), test_key()).await;
        let daemon = Arc::new(network.handle(daemon_addr.clone(), test_key()).await);

        let device = DeviceName::new("office").unwrap();
        let info = DeviceInfo {
            devicename: device.to_string(),
            version: "0.1.0".into(),
            core_package_version: "0.1.0".into(),
            supported_features: vec!["direct".into()],
        };

        let daemon_task = {
            let daemon = daemon.clone();
            let info = info.clone();
            tokio::spawn(async move {
                let mut discovers = daemon.subscribe(topics::discover_pattern()).await.unwrap();
                discovers.next().await;
                let json = serde_json::to_string(&info).unwrap();
                daemon
                    .announce(&topics::device_info_key(&device), &json)
                    .await
                    .unwrap();
            })
        };

        let report = discover_devices(Arc::new(client), &daemon_addr, Duration::from_millis(300))
            .await
            .unwrap();

        daemon_task.await.unwrap();
        assert!(report.devices.contains_key("office"));
        assert_eq!(report.devices["office"].info.version, "0.1.0");
    }
}
