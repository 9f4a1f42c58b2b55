use serde::{Deserialize, Serialize};

/// Payload published once at daemon startup under `device_info.<device>`
/// and mirrored into each `heartbeat.<device>` (spec.md §4.2, §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub devicename: String,
    pub version: String,
    pub core_package_version: String,
    #[serde(default)]
    pub supported_features: Vec<String>,
}
