mod memory;
#[cfg(feature = "redis-fabric")]
mod redis_backend;

pub use memory::InMemoryFabric;
#[cfg(feature = "redis-fabric")]
pub use redis_backend::RedisFabric;

use crate::model::{DesiredFdu, Flavor, Image};
use crate::status::{FduActualState, PluginState};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub uuid: Uuid,
    pub virtual_device: String,
}

/// Per-node configuration published to the fabric by whatever agent manages
/// this node, e.g. the base directory an FDU runtime should use. Mirrors the
/// `agent.path` lookup the source plugin performs once at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfiguration {
    pub base_dir: PathBuf,
}

/// Actual-state producer and desired-state consumer for a single node.
///
/// Two backends are provided: [`InMemoryFabric`] (used in tests and for a
/// single-node deployment) and, behind the `redis-fabric` feature,
/// [`RedisFabric`]. Both implement this trait so the lifecycle engine and
/// worker dispatcher never need to know which backend is in play.
#[async_trait]
pub trait FabricClient: Send + Sync {
    async fn add_node_plugin(&self, node: &str, plugin: Uuid, state: &PluginState) -> Result<()>;
    async fn add_node_fdu(
        &self,
        node: &str,
        plugin: Uuid,
        fdu: Uuid,
        state: &FduActualState,
    ) -> Result<()>;
    async fn get_node_fdu(&self, node: &str, plugin: Uuid, fdu: Uuid) -> Result<Option<FduActualState>>;
    async fn remove_node_fdu(&self, node: &str, plugin: Uuid, fdu: Uuid) -> Result<()>;
    async fn add_node_image(&self, node: &str, plugin: Uuid, image: &Image) -> Result<()>;
    async fn remove_node_image(&self, node: &str, plugin: Uuid, image: Uuid) -> Result<()>;
    async fn add_node_flavor(&self, node: &str, plugin: Uuid, flavor: &Flavor) -> Result<()>;
    async fn remove_node_flavor(&self, node: &str, plugin: Uuid, flavor: Uuid) -> Result<()>;
    async fn find_node_network(&self, node: &str, network: Uuid) -> Result<Option<NetworkInfo>>;

    /// Node-level configuration this agent should honor, e.g. an override of
    /// the base working directory. `None` means the node has published no
    /// configuration and the caller should fall back to its own defaults.
    async fn get_node_configuration(&self, node: &str) -> Result<Option<NodeConfiguration>>;

    /// Subscribe to desired-state notifications for every FDU belonging to
    /// this node+plugin. Each call spawns its own delivery task; callers
    /// keep the receiver for the lifetime of the subscription.
    async fn subscribe_desired_state(
        &self,
        node: &str,
        plugin: Uuid,
    ) -> Result<UnboundedReceiver<DesiredFdu>>;

    /// Close the connection to the fabric backend. Errors are logged by the
    /// caller, not propagated as a shutdown failure.
    async fn close(&self) -> Result<()>;
}
