use crate::error::LifecycleError;
use crate::fabric::FabricClient;
use crate::hypervisor::{DomainState, HypervisorDriver};
use crate::model::{DesiredFdu, Fdu, Flavor, Image, NetworkAttachment};
use crate::os_bridge::OsBridge;
use crate::registries::Registries;
use crate::renderer::Renderer;
use crate::status::{FduActualState, FduState, FduStatus};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

const DOMAIN_TEMPLATE: &str = include_str!("../../templates/vm.xml.mustache");
const VENDOR_TEMPLATE: &str = include_str!("../../templates/vendor_data.yaml.mustache");
const CONFIG_DRIVE_SCRIPT: &str = "templates/create_config_drive.sh";

const RUN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const RUN_POLL_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(15);
const STOP_POLL_ATTEMPTS: u32 = 100;

/// Drives every FDU on this node through its lifecycle. Single-owner by
/// construction: the worker dispatcher (see [`crate::worker`]) is the only
/// caller, and it processes one desired-state event at a time, so no
/// transition for the same FDU ever runs concurrently with another.
///
/// Live migration is not implemented (non-goal). Were it to be added, the
/// shape would mirror the source plugin's handshake: the destination
/// observes a `landing` intent, resolves image/flavor, stages the disk and
/// domain XML, and publishes readiness; the source observes readiness,
/// calls the hypervisor's migrate primitive, then self-terminates via
/// `force_terminate_fdu`.
pub struct LifecycleEngine {
    node_id: String,
    plugin_uuid: Uuid,
    base_dir: PathBuf,
    registries: Arc<Registries>,
    fabric: Arc<dyn FabricClient>,
    os_bridge: Arc<dyn OsBridge>,
    hypervisor: Arc<dyn HypervisorDriver>,
    fdus: Mutex<HashMap<Uuid, Fdu>>,
}

impl LifecycleEngine {
    pub fn new(
        node_id: String,
        plugin_uuid: Uuid,
        base_dir: PathBuf,
        registries: Arc<Registries>,
        fabric: Arc<dyn FabricClient>,
        os_bridge: Arc<dyn OsBridge>,
        hypervisor: Arc<dyn HypervisorDriver>,
    ) -> Self {
        Self {
            node_id,
            plugin_uuid,
            base_dir,
            registries,
            fabric,
            os_bridge,
            hypervisor,
            fdus: Mutex::new(HashMap::new()),
        }
    }

    fn disks_dir(&self) -> PathBuf {
        self.base_dir.join("disks")
    }

    fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Write the new status, logging the transition from whatever the
    /// fabric currently holds (mirrors the source plugin's read-before-write
    /// pattern around its actual-state record).
    async fn publish(&self, fdu: Uuid, state: FduActualState) {
        if let Ok(Some(previous)) = self
            .fabric
            .get_node_fdu(&self.node_id, self.plugin_uuid, fdu)
            .await
        {
            if previous.status != state.status {
                info!("fdu {fdu} status {:?} -> {:?}", previous.status, state.status);
            }
        }
        if let Err(e) = self
            .fabric
            .add_node_fdu(&self.node_id, self.plugin_uuid, fdu, &state)
            .await
        {
            warn!("failed to publish actual state for fdu {fdu}: {e}");
        }
    }

    async fn require_state(&self, uuid: Uuid, expected: FduState, action: &'static str) -> Result<Fdu> {
        let fdus = self.fdus.lock().await;
        let fdu = fdus
            .get(&uuid)
            .cloned()
            .ok_or(LifecycleError::FDUNotExisting(uuid))?;
        if fdu.state != expected {
            return Err(LifecycleError::StateTransitionNotAllowed {
                fdu: uuid,
                from: fdu.state,
                requested: action,
            }
            .into());
        }
        Ok(fdu)
    }

    // ---- define / undefine -------------------------------------------------

    pub async fn define_fdu(&self, manifest: DesiredFdu) -> Result<()> {
        let fdu_uuid = manifest.uuid;
        let entity = manifest.entity_data;

        let image_id = match self.resolve_or_derive_image(fdu_uuid, &manifest.name, &entity.base_image).await {
            Ok(id) => id,
            Err(reason) => {
                self.publish(fdu_uuid, FduActualState::error(reason.to_string()))
                    .await;
                return Err(reason);
            }
        };

        let flavor_id = match self
            .resolve_or_derive_flavor(fdu_uuid, entity.flavor_id, entity.cpu, entity.memory, entity.disk_size)
            .await
        {
            Ok(id) => id,
            Err(reason) => {
                self.publish(fdu_uuid, FduActualState::error("Flavor not found!"))
                    .await;
                return Err(reason);
            }
        };

        let image = self.registries.require_image(image_id).await?;
        let disk_path = self
            .disks_dir()
            .join(format!("{fdu_uuid}.{}", image.format));
        let cdrom_path = self.disks_dir().join(format!("{fdu_uuid}_config.iso"));

        let fdu = Fdu {
            uuid: fdu_uuid,
            name: manifest.name,
            image_id,
            flavor_id,
            networks: entity.networks,
            user_file: entity.user_data.map(PathBuf::from),
            ssh_key: entity.ssh_key,
            disk_path,
            cdrom_path,
            domain_xml: None,
            state: FduState::Defined,
        };

        self.fdus.lock().await.insert(fdu_uuid, fdu);
        info!("fdu {fdu_uuid} defined");
        self.publish(fdu_uuid, FduActualState::ok(FduStatus::Defined))
            .await;
        Ok(())
    }

    async fn resolve_or_derive_image(
        &self,
        fdu_uuid: Uuid,
        fdu_name: &str,
        base_image: &Option<String>,
    ) -> Result<Uuid> {
        let base_image = base_image.as_deref().ok_or_else(|| {
            LifecycleError::ResolutionFailure {
                fdu: fdu_uuid,
                kind: "image",
                reason: "no base_image given".to_string(),
            }
        })?;

        if let Ok(existing) = Uuid::parse_str(base_image) {
            if self.registries.get_image(existing).await.is_some() {
                return Ok(existing);
            }
        }

        let image = Image::derive(fdu_uuid, fdu_name, base_image);
        self.registries
            .add_image(image)
            .await
            .with_context(|| format!("materializing image for fdu {fdu_uuid}"))?;
        Ok(fdu_uuid)
    }

    async fn resolve_or_derive_flavor(
        &self,
        fdu_uuid: Uuid,
        flavor_id: Option<Uuid>,
        cpu: Option<u32>,
        memory: Option<u64>,
        disk_size: Option<u64>,
    ) -> Result<Uuid> {
        if let Some(id) = flavor_id {
            return match self.registries.get_flavor(id).await {
                Some(_) => Ok(id),
                None => Err(LifecycleError::ResolutionFailure {
                    fdu: fdu_uuid,
                    kind: "flavor",
                    reason: format!("flavor {id} not found"),
                }
                .into()),
            };
        }

        let cpu = cpu.context("no flavor_id and no cpu given to derive one")?;
        let memory = memory.context("no flavor_id and no memory given to derive one")?;
        let disk_size = disk_size.context("no flavor_id and no disk_size given to derive one")?;
        let flavor = Flavor::derive(fdu_uuid, cpu, memory, disk_size);
        self.registries.add_flavor(flavor).await?;
        Ok(fdu_uuid)
    }

    pub async fn undefine_fdu(&self, uuid: Uuid) -> Result<()> {
        self.require_state(uuid, FduState::Defined, "undefine").await?;
        self.fdus.lock().await.remove(&uuid);
        self.fabric
            .remove_node_fdu(&self.node_id, self.plugin_uuid, uuid)
            .await?;
        info!("fdu {uuid} undefined");
        Ok(())
    }

    // ---- configure ----------------------------------------------------------

    pub async fn configure_fdu(&self, uuid: Uuid) -> Result<()> {
        let mut fdu = self.require_state(uuid, FduState::Defined, "configure").await?;

        if let Err(e) = self.configure_fdu_inner(&mut fdu).await {
            self.publish(uuid, FduActualState::error(e.to_string())).await;
            return Err(e);
        }

        fdu.state = FduState::Configured;
        self.fdus.lock().await.insert(uuid, fdu);
        self.publish(uuid, FduActualState::ok(FduStatus::Configured))
            .await;
        info!("fdu {uuid} configured");
        Ok(())
    }

    async fn configure_fdu_inner(&self, fdu: &mut Fdu) -> Result<()> {
        let image = self.registries.require_image(fdu.image_id).await?;
        let flavor = self.registries.require_flavor(fdu.flavor_id).await?;

        for (i, attachment) in fdu.networks.iter_mut().enumerate() {
            self.resolve_network_attachment(&self.node_id, i, attachment)
                .await?;
        }

        let networks_xml = render_network_fragments(&fdu.networks);
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), fdu.name.clone());
        vars.insert("uuid".to_string(), fdu.uuid.to_string());
        vars.insert("memory".to_string(), flavor.memory.to_string());
        vars.insert("cpu".to_string(), flavor.cpu.to_string());
        vars.insert("disk_image".to_string(), fdu.disk_path.display().to_string());
        vars.insert("iso_image".to_string(), fdu.cdrom_path.display().to_string());
        vars.insert("format".to_string(), image.format.clone());
        vars.insert("networks".to_string(), networks_xml);
        let domain_xml = Renderer::render(DOMAIN_TEMPLATE, &vars)
            .context("rendering domain xml")?;

        let vendor_path = self.base_dir.join(format!("vendor_{}.yaml", fdu.uuid));
        let mut vendor_vars = HashMap::new();
        vendor_vars.insert("nodeid".to_string(), self.node_id.clone());
        vendor_vars.insert("entityid".to_string(), fdu.uuid.to_string());
        let vendor_yaml = Renderer::render(VENDOR_TEMPLATE, &vendor_vars)
            .context("rendering vendor data")?;
        // Contract with the OS plugin's store_file RPC: payload is utf8,
        // then base64, then hex encoded; the plugin reverses all three.
        self.os_bridge
            .store_file(&vendor_path, &encode_for_store(vendor_yaml.as_bytes()))
            .await?;

        let mut drive_args = vec![
            "--hostname".to_string(),
            fdu.name.clone(),
            "--uuid".to_string(),
            fdu.uuid.to_string(),
            "--vendor-data".to_string(),
            vendor_path.display().to_string(),
        ];

        let user_data_path = self.base_dir.join(format!("userdata_{}.yaml", fdu.uuid));
        if let Some(user_file) = &fdu.user_file {
            let contents = self.os_bridge.read_file(user_file).await.unwrap_or_default();
            self.os_bridge
                .store_file(&user_data_path, &encode_for_store(&contents))
                .await?;
            drive_args.push("--user-data".to_string());
            drive_args.push(user_data_path.display().to_string());
        }

        let ssh_key_path = self.base_dir.join(format!("key_{}.pub", fdu.uuid));
        if let Some(key) = &fdu.ssh_key {
            self.os_bridge
                .store_file(&ssh_key_path, &encode_for_store(key.as_bytes()))
                .await?;
            drive_args.push("--ssh-key".to_string());
            drive_args.push(ssh_key_path.display().to_string());
        }
        drive_args.push(fdu.cdrom_path.display().to_string());

        self.os_bridge.create_dir(&self.disks_dir()).await?;
        self.run_external(
            "qemu-img",
            vec![
                "create".to_string(),
                "-f".to_string(),
                image.format.clone(),
                fdu.disk_path.display().to_string(),
                format!("{}G", flavor.disk_size),
            ],
        )
        .await?;

        self.run_external(CONFIG_DRIVE_SCRIPT, drive_args).await?;

        let local_image_path = image
            .local_path
            .as_ref()
            .context("image has no local path after materialization")?;
        self.run_external(
            "dd",
            vec![
                format!("if={}", local_image_path.display()),
                format!("of={}", fdu.disk_path.display()),
            ],
        )
        .await?;

        let _ = self.os_bridge.remove_file(&vendor_path).await;
        let _ = self.os_bridge.remove_file(&user_data_path).await;
        let _ = self.os_bridge.remove_file(&ssh_key_path).await;

        self.hypervisor
            .define(fdu.uuid, &domain_xml)
            .await
            .map_err(|e| LifecycleError::HypervisorTransportError(e.into_inner()))?;

        fdu.domain_xml = Some(domain_xml);
        Ok(())
    }

    async fn resolve_network_attachment(
        &self,
        node: &str,
        index: usize,
        attachment: &mut NetworkAttachment,
    ) -> Result<()> {
        if attachment.kind == "wifi" {
            let interfaces = self.os_bridge.get_network_informations().await?;
            // Corrected from the source: take the FIRST available wireless
            // interface and stop, instead of stamping every match (which
            // left only the last one bound while marking them all unavailable).
            let chosen = interfaces
                .into_iter()
                .find(|i| i.intf_type == "wireless" && i.available);
            match chosen {
                Some(iface) => {
                    self.os_bridge.set_interface_unaviable(&iface.name).await?;
                    attachment.direct_intf = Some(iface.name);
                }
                None => {
                    anyhow::bail!("no available wireless interface found");
                }
            }
        } else if let Some(network_uuid) = attachment.network_uuid {
            match self.fabric.find_node_network(node, network_uuid).await? {
                Some(net) => attachment.br_name = Some(net.virtual_device),
                None => anyhow::bail!("network {network_uuid} not found on node {node}"),
            }
        }

        if attachment.intf_name.is_none() {
            attachment.intf_name = Some(format!("veth{index}"));
        }
        Ok(())
    }

    async fn run_external(&self, command: &str, args: Vec<String>) -> Result<()> {
        let output = self.os_bridge.execute_command(command, &args).await?;
        if !output.status.success() {
            return Err(LifecycleError::ExternalCommandFailure {
                command: command.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }
        Ok(())
    }

    // ---- clean ---------------------------------------------------------------

    pub async fn clean_fdu(&self, uuid: Uuid) -> Result<()> {
        let fdu = self.require_state(uuid, FduState::Configured, "clean").await?;

        if let Err(e) = self.hypervisor.undefine(uuid).await {
            warn!("undefine on clean for {uuid} failed (continuing): {}", e.into_inner());
        }
        self.os_bridge.remove_file(&fdu.cdrom_path).await?;
        self.os_bridge.remove_file(&fdu.disk_path).await?;
        let _ = self.os_bridge.remove_file(&self.logs_dir().join(uuid.to_string())).await;

        let mut fdus = self.fdus.lock().await;
        if let Some(entry) = fdus.get_mut(&uuid) {
            entry.state = FduState::Defined;
            entry.domain_xml = None;
        }
        drop(fdus);
        self.publish(uuid, FduActualState::ok(FduStatus::Defined)).await;
        info!("fdu {uuid} cleaned");
        Ok(())
    }

    // ---- run / stop / pause / resume -----------------------------------------

    pub async fn run_fdu(&self, uuid: Uuid) -> Result<()> {
        self.require_state(uuid, FduState::Configured, "run").await?;
        self.publish(uuid, FduActualState::ok(FduStatus::Starting)).await;

        self.hypervisor
            .create(uuid)
            .await
            .map_err(|e| LifecycleError::HypervisorTransportError(e.into_inner()))?;

        tokio::time::timeout(RUN_POLL_TIMEOUT, async {
            loop {
                match self.hypervisor.state(uuid).await {
                    Ok(DomainState::Running) => return Ok(()),
                    Ok(_) => tokio::time::sleep(RUN_POLL_INTERVAL).await,
                    Err(e) => return Err(e.into_inner()),
                }
            }
        })
        .await
        .context("timed out waiting for domain to reach running state")??;

        self.set_state(uuid, FduState::Running).await;
        self.publish(uuid, FduActualState::ok(FduStatus::Run)).await;
        info!("fdu {uuid} running");
        Ok(())
    }

    pub async fn stop_fdu(&self, uuid: Uuid) -> Result<()> {
        self.require_state(uuid, FduState::Running, "stop").await?;

        self.hypervisor
            .shutdown(uuid)
            .await
            .map_err(|e| LifecycleError::HypervisorTransportError(e.into_inner()))?;

        let mut shut_off = false;
        for _ in 0..STOP_POLL_ATTEMPTS {
            // Wait while the domain is still shutting down or running;
            // break out the moment it reports shutoff. The source's
            // predicate here was inverted and never actually detected
            // shutoff, relying on the forced destroy below every time.
            match self.hypervisor.state(uuid).await {
                Ok(DomainState::Shutoff) => {
                    shut_off = true;
                    break;
                }
                // Wait while still shutting down (or, transiently, still
                // reported running) rather than the source's inverted check.
                Ok(_) => tokio::time::sleep(STOP_POLL_INTERVAL).await,
                Err(e) => return Err(LifecycleError::HypervisorTransportError(e.into_inner()).into()),
            }
        }

        if !shut_off {
            warn!("fdu {uuid} did not shut down in time, forcing destroy");
            self.hypervisor
                .destroy(uuid)
                .await
                .map_err(|e| LifecycleError::HypervisorTransportError(e.into_inner()))?;
        }

        self.set_state(uuid, FduState::Configured).await;
        self.publish(uuid, FduActualState::ok(FduStatus::Stop)).await;
        info!("fdu {uuid} stopped");
        Ok(())
    }

    pub async fn pause_fdu(&self, uuid: Uuid) -> Result<()> {
        self.require_state(uuid, FduState::Running, "pause").await?;
        self.hypervisor
            .suspend(uuid)
            .await
            .map_err(|e| LifecycleError::HypervisorTransportError(e.into_inner()))?;
        self.set_state(uuid, FduState::Paused).await;
        self.publish(uuid, FduActualState::ok(FduStatus::Pause)).await;
        Ok(())
    }

    pub async fn resume_fdu(&self, uuid: Uuid) -> Result<()> {
        self.require_state(uuid, FduState::Paused, "resume").await?;
        self.hypervisor
            .resume(uuid)
            .await
            .map_err(|e| LifecycleError::HypervisorTransportError(e.into_inner()))?;
        self.set_state(uuid, FduState::Running).await;
        self.publish(uuid, FduActualState::ok(FduStatus::Run)).await;
        Ok(())
    }

    async fn set_state(&self, uuid: Uuid, state: FduState) {
        if let Some(fdu) = self.fdus.lock().await.get_mut(&uuid) {
            fdu.state = state;
        }
    }

    /// Drive an FDU in any state down to fully undefined. Used at node
    /// shutdown and available for an operator-initiated force-stop.
    pub async fn force_terminate_fdu(&self, uuid: Uuid) {
        let state = match self.fdus.lock().await.get(&uuid) {
            Some(fdu) => fdu.state,
            None => return,
        };

        let chain: &[fn(&LifecycleEngine, Uuid) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>>] =
            match state {
                FduState::Paused => &[
                    |e, u| Box::pin(e.resume_fdu(u)),
                    |e, u| Box::pin(e.stop_fdu(u)),
                    |e, u| Box::pin(e.clean_fdu(u)),
                    |e, u| Box::pin(e.undefine_fdu(u)),
                ],
                FduState::Running => &[
                    |e, u| Box::pin(e.stop_fdu(u)),
                    |e, u| Box::pin(e.clean_fdu(u)),
                    |e, u| Box::pin(e.undefine_fdu(u)),
                ],
                FduState::Configured => &[
                    |e, u| Box::pin(e.clean_fdu(u)),
                    |e, u| Box::pin(e.undefine_fdu(u)),
                ],
                FduState::Defined => &[|e, u| Box::pin(e.undefine_fdu(u))],
            };

        for step in chain {
            if let Err(e) = step(self, uuid).await {
                warn!("force-terminate step failed for fdu {uuid} (continuing): {e}");
            }
        }
    }

    pub async fn known_fdus(&self) -> Vec<Uuid> {
        self.fdus.lock().await.keys().copied().collect()
    }
}

fn encode_for_store(bytes: &[u8]) -> Vec<u8> {
    let b64 = STANDARD.encode(bytes);
    hex::encode(b64).into_bytes()
}

fn render_network_fragments(networks: &[NetworkAttachment]) -> String {
    networks
        .iter()
        .map(|n| {
            if let Some(direct) = &n.direct_intf {
                format!(
                    "<interface type=\"direct\"><source dev=\"{direct}\"/></interface>"
                )
            } else {
                let bridge = n.br_name.clone().unwrap_or_default();
                format!("<interface type=\"bridge\"><source bridge=\"{bridge}\"/></interface>")
            }
        })
        .collect::<Vec<_>>()
        .join("\n    ")
}

#[cfg(test)]
mod tests;
