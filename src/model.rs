use crate::status::{DesiredAction, FduState};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// A base disk image, identified by UUID, materialized to local disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Image {
    pub uuid: Uuid,
    pub name: String,
    pub base_image: String,
    pub format: String,
    #[serde(rename = "type")]
    pub image_type: String,
    pub local_path: Option<PathBuf>,
}

impl Image {
    /// Derive an image record from an FDU manifest whose `base_image` is a
    /// bare URL rather than an existing image UUID.
    pub fn derive(fdu_uuid: Uuid, fdu_name: &str, base_image: &str) -> Self {
        let format = base_image
            .rsplit('.')
            .next()
            .unwrap_or("qcow2")
            .to_string();
        Self {
            uuid: fdu_uuid,
            name: format!("{fdu_name}_img"),
            base_image: base_image.to_string(),
            format,
            image_type: "kvm".to_string(),
            local_path: None,
        }
    }
}

/// A resource shape: cpu core count, memory in MiB, disk size in GiB.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Flavor {
    pub uuid: Uuid,
    pub cpu: u32,
    pub memory: u64,
    pub disk_size: u64,
}

impl Flavor {
    pub fn derive(fdu_uuid: Uuid, cpu: u32, memory: u64, disk_size: u64) -> Self {
        Self {
            uuid: fdu_uuid,
            cpu,
            memory,
            disk_size,
        }
    }
}

/// A network attachment as declared in the manifest and progressively
/// resolved by [`crate::lifecycle::LifecycleEngine::configure_fdu`].
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct NetworkAttachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub network_uuid: Option<Uuid>,
    pub intf_name: Option<String>,
    pub br_name: Option<String>,
    pub direct_intf: Option<String>,
    pub mac: Option<String>,
}

/// The raw `entity_data` payload carried by a desired-state manifest.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct EntityData {
    pub base_image: Option<String>,
    pub flavor_id: Option<Uuid>,
    pub cpu: Option<u32>,
    pub memory: Option<u64>,
    pub disk_size: Option<u64>,
    #[serde(rename = "user-data")]
    pub user_data: Option<String>,
    #[serde(rename = "ssh-key")]
    pub ssh_key: Option<String>,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
}

/// A desired-state notification as delivered by the fabric observer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DesiredFdu {
    pub uuid: Uuid,
    pub name: String,
    pub status: DesiredAction,
    pub entity_data: EntityData,
}

/// The locally-owned record for a single FDU.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Fdu {
    pub uuid: Uuid,
    pub name: String,
    pub image_id: Uuid,
    pub flavor_id: Uuid,
    pub networks: Vec<NetworkAttachment>,
    pub user_file: Option<PathBuf>,
    pub ssh_key: Option<String>,
    pub disk_path: PathBuf,
    pub cdrom_path: PathBuf,
    pub domain_xml: Option<String>,
    pub state: FduState,
}
