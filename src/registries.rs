use crate::fabric::FabricClient;
use crate::model::{Flavor, Image};
use crate::os_bridge::OsBridge;
use anyhow::{Context, Result};
use log::warn;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

struct RegistryState {
    images: HashMap<Uuid, Image>,
    flavors: HashMap<Uuid, Flavor>,
}

/// Image and flavor tables for this node. Both live behind a single mutex
/// so a lookup never observes an image whose materialization is only
/// half-applied (the Python original locks these inconsistently; this
/// implementation does not repeat that). Every insert/remove is mirrored
/// to the fabric so other observers see the same table this node does.
pub struct Registries {
    state: Mutex<RegistryState>,
    os_bridge: Arc<dyn OsBridge>,
    fabric: Arc<dyn FabricClient>,
    node_id: String,
    plugin_uuid: Uuid,
    images_dir: PathBuf,
}

impl Registries {
    pub fn new(
        os_bridge: Arc<dyn OsBridge>,
        fabric: Arc<dyn FabricClient>,
        node_id: String,
        plugin_uuid: Uuid,
        images_dir: PathBuf,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                images: HashMap::new(),
                flavors: HashMap::new(),
            }),
            os_bridge,
            fabric,
            node_id,
            plugin_uuid,
            images_dir,
        }
    }

    /// Download or copy `image.base_image` into the local image cache and
    /// register the result. `image.local_path` is overwritten with the
    /// materialized path regardless of what the caller passed in.
    pub async fn add_image(&self, mut image: Image) -> Result<Image> {
        let filename = image
            .base_image
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&image.uuid.to_string())
            .to_string();
        let dest = self.images_dir.join(&filename);

        let mut state = self.state.lock().await;
        self.os_bridge
            .download_file(&image.base_image, &dest)
            .await
            .with_context(|| format!("materializing image {}", image.uuid))?;
        image.local_path = Some(dest);
        state.images.insert(image.uuid, image.clone());
        drop(state);

        if let Err(e) = self
            .fabric
            .add_node_image(&self.node_id, self.plugin_uuid, &image)
            .await
        {
            warn!("failed to publish image {} to fabric: {e}", image.uuid);
        }
        Ok(image)
    }

    pub async fn remove_image(&self, uuid: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let removed = state.images.remove(&uuid);
        drop(state);

        if let Some(image) = removed {
            if let Some(path) = image.local_path {
                self.os_bridge.remove_file(&path).await?;
            }
        }
        if let Err(e) = self
            .fabric
            .remove_node_image(&self.node_id, self.plugin_uuid, uuid)
            .await
        {
            warn!("failed to publish removal of image {uuid} to fabric: {e}");
        }
        Ok(())
    }

    pub async fn get_image(&self, uuid: Uuid) -> Option<Image> {
        self.state.lock().await.images.get(&uuid).cloned()
    }

    pub async fn image_uuids(&self) -> Vec<Uuid> {
        self.state.lock().await.images.keys().copied().collect()
    }

    pub async fn flavor_uuids(&self) -> Vec<Uuid> {
        self.state.lock().await.flavors.keys().copied().collect()
    }

    pub async fn add_flavor(&self, flavor: Flavor) -> Result<Flavor> {
        self.state.lock().await.flavors.insert(flavor.uuid, flavor);
        if let Err(e) = self
            .fabric
            .add_node_flavor(&self.node_id, self.plugin_uuid, &flavor)
            .await
        {
            warn!("failed to publish flavor {} to fabric: {e}", flavor.uuid);
        }
        Ok(flavor)
    }

    pub async fn remove_flavor(&self, uuid: Uuid) -> Result<()> {
        self.state.lock().await.flavors.remove(&uuid);
        if let Err(e) = self
            .fabric
            .remove_node_flavor(&self.node_id, self.plugin_uuid, uuid)
            .await
        {
            warn!("failed to publish removal of flavor {uuid} to fabric: {e}");
        }
        Ok(())
    }

    pub async fn get_flavor(&self, uuid: Uuid) -> Option<Flavor> {
        self.state.lock().await.flavors.get(&uuid).copied()
    }

    /// Resolve a flavor, returning a descriptive error if the caller
    /// supplied an id that isn't registered (the `ResolutionFailure` path).
    pub async fn require_flavor(&self, uuid: Uuid) -> Result<Flavor> {
        self.get_flavor(uuid)
            .await
            .ok_or_else(|| anyhow::anyhow!("Flavor not found!"))
    }

    pub async fn require_image(&self, uuid: Uuid) -> Result<Image> {
        self.get_image(uuid)
            .await
            .ok_or_else(|| anyhow::anyhow!("Image not found!"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::InMemoryFabric;
    use crate::os_bridge::mock::MockOsBridge;

    fn registries(bridge: Arc<MockOsBridge>, fabric: Arc<InMemoryFabric>) -> Registries {
        Registries::new(
            bridge,
            fabric,
            "node-1".to_string(),
            Uuid::nil(),
            PathBuf::from("/var/lib/fdu-kvm/images"),
        )
    }

    #[tokio::test]
    async fn add_image_stamps_local_path_and_publishes() {
        let bridge = Arc::new(MockOsBridge::new(vec![]));
        let fabric = Arc::new(InMemoryFabric::new());
        let registries = registries(bridge, fabric.clone());
        let image = Image::derive(Uuid::new_v4(), "vm1", "http://example.test/cirros.qcow2");
        let stored = registries.add_image(image).await.unwrap();
        assert!(stored.local_path.is_some());
        assert_eq!(
            registries.get_image(stored.uuid).await.unwrap().local_path,
            stored.local_path
        );
        assert!(fabric.image(stored.uuid).await.is_some());

        registries.remove_image(stored.uuid).await.unwrap();
        assert!(fabric.image(stored.uuid).await.is_none());
    }

    #[tokio::test]
    async fn missing_flavor_resolution_fails() {
        let bridge = Arc::new(MockOsBridge::new(vec![]));
        let fabric = Arc::new(InMemoryFabric::new());
        let registries = registries(bridge, fabric);
        assert!(registries.require_flavor(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn add_flavor_publishes_to_fabric() {
        let bridge = Arc::new(MockOsBridge::new(vec![]));
        let fabric = Arc::new(InMemoryFabric::new());
        let registries = registries(bridge, fabric.clone());
        let flavor = Flavor::derive(Uuid::new_v4(), 2, 512, 10);
        registries.add_flavor(flavor).await.unwrap();
        assert!(fabric.flavor(flavor.uuid).await.is_some());

        registries.remove_flavor(flavor.uuid).await.unwrap();
        assert!(fabric.flavor(flavor.uuid).await.is_none());
    }
}
