use super::{FabricClient, NetworkInfo, NodeConfiguration};
use crate::model::{DesiredFdu, Flavor, Image};
use crate::status::{FduActualState, PluginState};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

fn desired_channel(node: &str, plugin: Uuid) -> String {
    format!("desired/node/{node}/runtime/{plugin}/fdu")
}

fn fdu_key(plugin: Uuid, fdu: Uuid) -> String {
    format!("actual:{plugin}:fdu:{fdu}")
}

fn image_key(plugin: Uuid, image: Uuid) -> String {
    format!("actual:{plugin}:image:{image}")
}

fn flavor_key(plugin: Uuid, flavor: Uuid) -> String {
    format!("actual:{plugin}:flavor:{flavor}")
}

fn plugin_key(node: &str) -> String {
    format!("actual:node:{node}:plugin")
}

fn network_key(network: Uuid) -> String {
    format!("network:{network}")
}

fn configuration_key(node: &str) -> String {
    format!("configuration:node:{node}")
}

/// Redis-backed fabric client: actual-state documents are JSON strings under
/// well-known keys, desired-state notifications are delivered over a
/// per-node pub/sub channel.
#[derive(Clone)]
pub struct RedisFabric {
    client: Arc<redis::Client>,
}

impl RedisFabric {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    async fn set_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(value)?;
        let _: () = conn.set(key, serialized).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        match conn.get::<_, Option<String>>(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl FabricClient for RedisFabric {
    async fn add_node_plugin(&self, node: &str, _plugin: Uuid, state: &PluginState) -> Result<()> {
        self.set_json(&plugin_key(node), state).await
    }

    async fn add_node_fdu(
        &self,
        _node: &str,
        plugin: Uuid,
        fdu: Uuid,
        state: &FduActualState,
    ) -> Result<()> {
        self.set_json(&fdu_key(plugin, fdu), state).await
    }

    async fn get_node_fdu(&self, _node: &str, plugin: Uuid, fdu: Uuid) -> Result<Option<FduActualState>> {
        self.get_json(&fdu_key(plugin, fdu)).await
    }

    async fn remove_node_fdu(&self, _node: &str, plugin: Uuid, fdu: Uuid) -> Result<()> {
        self.del(&fdu_key(plugin, fdu)).await
    }

    async fn add_node_image(&self, _node: &str, plugin: Uuid, image: &Image) -> Result<()> {
        self.set_json(&image_key(plugin, image.uuid), image).await
    }

    async fn remove_node_image(&self, _node: &str, plugin: Uuid, image: Uuid) -> Result<()> {
        self.del(&image_key(plugin, image)).await
    }

    async fn add_node_flavor(&self, _node: &str, plugin: Uuid, flavor: &Flavor) -> Result<()> {
        self.set_json(&flavor_key(plugin, flavor.uuid), flavor).await
    }

    async fn remove_node_flavor(&self, _node: &str, plugin: Uuid, flavor: Uuid) -> Result<()> {
        self.del(&flavor_key(plugin, flavor)).await
    }

    async fn find_node_network(&self, _node: &str, network: Uuid) -> Result<Option<NetworkInfo>> {
        self.get_json(&network_key(network)).await
    }

    async fn get_node_configuration(&self, node: &str) -> Result<Option<NodeConfiguration>> {
        self.get_json(&configuration_key(node)).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn subscribe_desired_state(
        &self,
        node: &str,
        plugin: Uuid,
    ) -> Result<UnboundedReceiver<DesiredFdu>> {
        let channel = desired_channel(node, plugin);
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("discarding malformed desired-state message: {e}");
                        continue;
                    }
                };
                match serde_json::from_str::<DesiredFdu>(&payload) {
                    Ok(fdu) => {
                        if tx.send(fdu).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("discarding undecodable desired-state message: {e}"),
                }
            }
        });
        Ok(rx)
    }
}
