use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    /// Root directory for disks/images/logs, e.g. `/var/lib/fdu-kvm`.
    pub base_dir: PathBuf,

    pub fabric: FabricConfig,

    #[serde(default)]
    pub qemu: QemuConfig,

    #[serde(default)]
    pub os_bridge: OsBridgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FabricConfig {
    /// `redis://host:port` or `memory://` for the in-process backend.
    pub locator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QemuConfig {
    pub machine: String,
    pub os_type: String,
    pub bridge: String,
    pub arch: String,
    pub kvm: bool,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            machine: "q35".to_string(),
            os_type: "hvm".to_string(),
            bridge: "br0".to_string(),
            arch: "x86_64".to_string(),
            kvm: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OsBridgeConfig {
    /// Base URL of the OS plugin's RPC endpoint.
    pub endpoint: String,
}

impl Default for OsBridgeConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8090".to_string(),
        }
    }
}

#[cfg(test)]
pub fn mock_settings() -> Settings {
    Settings {
        base_dir: PathBuf::from("/tmp/fdu-kvm-test"),
        fabric: FabricConfig {
            locator: "memory://".to_string(),
        },
        qemu: QemuConfig::default(),
        os_bridge: OsBridgeConfig::default(),
    }
}
