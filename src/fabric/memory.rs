use super::{FabricClient, NetworkInfo, NodeConfiguration};
use crate::model::{DesiredFdu, Flavor, Image};
use crate::status::{FduActualState, PluginState};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// In-process fabric backend: actual-state documents live in a `RwLock`ed
/// map, desired-state notifications ride a broadcast channel. Used for
/// single-node deployments and as the default in tests.
#[derive(Clone)]
pub struct InMemoryFabric {
    plugins: Arc<RwLock<HashMap<String, PluginState>>>,
    fdus: Arc<RwLock<HashMap<Uuid, FduActualState>>>,
    images: Arc<RwLock<HashMap<Uuid, Image>>>,
    flavors: Arc<RwLock<HashMap<Uuid, Flavor>>>,
    networks: Arc<RwLock<HashMap<Uuid, NetworkInfo>>>,
    configurations: Arc<RwLock<HashMap<String, NodeConfiguration>>>,
    desired_tx: broadcast::Sender<DesiredFdu>,
}

impl InMemoryFabric {
    pub fn new() -> Self {
        let (desired_tx, _) = broadcast::channel(256);
        Self {
            plugins: Arc::new(RwLock::new(HashMap::new())),
            fdus: Arc::new(RwLock::new(HashMap::new())),
            images: Arc::new(RwLock::new(HashMap::new())),
            flavors: Arc::new(RwLock::new(HashMap::new())),
            networks: Arc::new(RwLock::new(HashMap::new())),
            configurations: Arc::new(RwLock::new(HashMap::new())),
            desired_tx,
        }
    }

    /// Test/dev helper: register a network so `find_node_network` resolves it.
    pub async fn register_network(&self, info: NetworkInfo) {
        self.networks.write().await.insert(info.uuid, info);
    }

    /// Test/dev helper: publish a node's configuration so
    /// `get_node_configuration` resolves it.
    pub async fn register_configuration(&self, node: &str, config: NodeConfiguration) {
        self.configurations.write().await.insert(node.to_string(), config);
    }

    /// Test/dev helper: push a desired-state notification to every current
    /// subscriber, as the real fabric's pub/sub would.
    pub fn publish_desired(&self, fdu: DesiredFdu) {
        // No subscribers yet is not an error; the notification is simply dropped.
        let _ = self.desired_tx.send(fdu);
    }

    pub async fn image(&self, uuid: Uuid) -> Option<Image> {
        self.images.read().await.get(&uuid).cloned()
    }

    pub async fn flavor(&self, uuid: Uuid) -> Option<Flavor> {
        self.flavors.read().await.get(&uuid).cloned()
    }

    pub async fn fdu_state(&self, uuid: Uuid) -> Option<FduActualState> {
        self.fdus.read().await.get(&uuid).cloned()
    }
}

impl Default for InMemoryFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FabricClient for InMemoryFabric {
    async fn add_node_plugin(&self, node: &str, _plugin: Uuid, state: &PluginState) -> Result<()> {
        self.plugins
            .write()
            .await
            .insert(node.to_string(), state.clone());
        Ok(())
    }

    async fn add_node_fdu(
        &self,
        _node: &str,
        _plugin: Uuid,
        fdu: Uuid,
        state: &FduActualState,
    ) -> Result<()> {
        self.fdus.write().await.insert(fdu, state.clone());
        Ok(())
    }

    async fn get_node_fdu(
        &self,
        _node: &str,
        _plugin: Uuid,
        fdu: Uuid,
    ) -> Result<Option<FduActualState>> {
        Ok(self.fdus.read().await.get(&fdu).cloned())
    }

    async fn remove_node_fdu(&self, _node: &str, _plugin: Uuid, fdu: Uuid) -> Result<()> {
        self.fdus.write().await.remove(&fdu);
        Ok(())
    }

    async fn add_node_image(&self, _node: &str, _plugin: Uuid, image: &Image) -> Result<()> {
        self.images.write().await.insert(image.uuid, image.clone());
        Ok(())
    }

    async fn remove_node_image(&self, _node: &str, _plugin: Uuid, image: Uuid) -> Result<()> {
        self.images.write().await.remove(&image);
        Ok(())
    }

    async fn add_node_flavor(&self, _node: &str, _plugin: Uuid, flavor: &Flavor) -> Result<()> {
        self.flavors
            .write()
            .await
            .insert(flavor.uuid, *flavor);
        Ok(())
    }

    async fn remove_node_flavor(&self, _node: &str, _plugin: Uuid, flavor: Uuid) -> Result<()> {
        self.flavors.write().await.remove(&flavor);
        Ok(())
    }

    async fn find_node_network(
        &self,
        _node: &str,
        network: Uuid,
    ) -> Result<Option<NetworkInfo>> {
        Ok(self.networks.read().await.get(&network).cloned())
    }

    async fn get_node_configuration(&self, node: &str) -> Result<Option<NodeConfiguration>> {
        Ok(self.configurations.read().await.get(node).cloned())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn subscribe_desired_state(
        &self,
        _node: &str,
        _plugin: Uuid,
    ) -> Result<UnboundedReceiver<DesiredFdu>> {
        let mut rx = self.desired_tx.subscribe();
        let (tx, out_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(out_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::DesiredAction;
    use crate::model::EntityData;

    #[tokio::test]
    async fn publishes_and_receives_desired_state() {
        let fabric = InMemoryFabric::new();
        let mut rx = fabric
            .subscribe_desired_state("node-1", Uuid::nil())
            .await
            .unwrap();

        let fdu = DesiredFdu {
            uuid: Uuid::new_v4(),
            name: "vm1".to_string(),
            status: DesiredAction::Define,
            entity_data: EntityData::default(),
        };
        fabric.publish_desired(fdu.clone());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.uuid, fdu.uuid);
    }

    #[tokio::test]
    async fn actual_state_round_trips() {
        let fabric = InMemoryFabric::new();
        let fdu = Uuid::new_v4();
        fabric
            .add_node_fdu("node-1", Uuid::nil(), fdu, &FduActualState::ok(crate::status::FduStatus::Defined))
            .await
            .unwrap();
        assert!(fabric.fdu_state(fdu).await.is_some());
        fabric.remove_node_fdu("node-1", Uuid::nil(), fdu).await.unwrap();
        assert!(fabric.fdu_state(fdu).await.is_none());
    }
}
