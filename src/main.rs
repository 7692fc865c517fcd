use anyhow::{Context, Result};
use clap::Parser;
use fdu_kvm_runtime::fabric::{FabricClient, InMemoryFabric};
use fdu_kvm_runtime::hypervisor::{HypervisorDriver, LibVirtDriver};
use fdu_kvm_runtime::lifecycle::LifecycleEngine;
use fdu_kvm_runtime::os_bridge::{LocalOsBridge, OsBridge};
use fdu_kvm_runtime::registries::Registries;
use fdu_kvm_runtime::settings::Settings;
use fdu_kvm_runtime::status::{PluginState, PluginStatus};
use fdu_kvm_runtime::worker::Worker;
use log::{info, warn};
use std::process::exit;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "fdu-kvm-runtime")]
struct Args {
    /// Fabric connection string, e.g. `redis://localhost:6379` or `memory://`.
    fabric_locator: String,
    /// This node's identifier in the fabric.
    node_id: String,
    #[arg(long, default_value = "config.yaml")]
    config: String,
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("{e}");
            // Matches the external CLI contract's exit(-1), which the OS
            // truncates to 255.
            exit(255);
        }
    };

    if let Err(e) = run(args).await {
        eprintln!("fatal: {e:?}");
        exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut settings = load_settings(&args.config)?;
    let plugin_uuid = Uuid::new_v4();

    let os_bridge = Arc::new(LocalOsBridge::new());
    let fabric = build_fabric(&args.fabric_locator)?;

    if let Some(node_config) = fabric.get_node_configuration(&args.node_id).await? {
        info!(
            "using base_dir {} from node configuration, overriding {}",
            node_config.base_dir.display(),
            settings.base_dir.display()
        );
        settings.base_dir = node_config.base_dir;
    }

    let hypervisor: Arc<dyn HypervisorDriver> = Arc::new(
        LibVirtDriver::connect("qemu:///system", settings.qemu.clone())
            .context("opening libvirt connection")?,
    );
    let registries = Arc::new(Registries::new(
        os_bridge.clone(),
        fabric.clone(),
        args.node_id.clone(),
        plugin_uuid,
        settings.base_dir.join("images"),
    ));

    for dir in ["disks", "images", "logs"] {
        os_bridge.create_dir(&settings.base_dir.join(dir)).await?;
    }

    let engine = Arc::new(LifecycleEngine::new(
        args.node_id.clone(),
        plugin_uuid,
        settings.base_dir.clone(),
        registries.clone(),
        fabric.clone(),
        os_bridge.clone(),
        hypervisor.clone(),
    ));

    fabric
        .add_node_plugin(
            &args.node_id,
            plugin_uuid,
            &PluginState {
                uuid: plugin_uuid,
                name: "fdu-kvm-runtime".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                pid: std::process::id(),
                status: PluginStatus::Running,
            },
        )
        .await?;

    let desired = fabric
        .subscribe_desired_state(&args.node_id, plugin_uuid)
        .await?;

    let mut worker = Worker::new(engine.clone());
    let forward = Worker::forward_from(worker.sender(), desired);
    let dispatch = tokio::spawn(async move { worker.handle().await });

    info!("fdu-kvm-runtime started on node {}", args.node_id);

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received, terminating known fdus");

    for uuid in engine.known_fdus().await {
        engine.force_terminate_fdu(uuid).await;
    }

    for uuid in registries.image_uuids().await {
        if let Err(e) = registries.remove_image(uuid).await {
            warn!("failed to remove image {uuid} during shutdown: {e}");
        }
    }
    for uuid in registries.flavor_uuids().await {
        if let Err(e) = registries.remove_flavor(uuid).await {
            warn!("failed to remove flavor {uuid} during shutdown: {e}");
        }
    }

    forward.abort();
    dispatch.abort();

    if let Err(e) = fabric.close().await {
        warn!("failed to close fabric connection: {e}");
    }
    Ok(())
}

fn load_settings(path: &str) -> Result<Settings> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .build()
        .context("loading configuration")?;
    cfg.try_deserialize()
        .with_context(|| format!("deserializing configuration at {path}"))
}

fn build_fabric(locator: &str) -> Result<Arc<dyn FabricClient>> {
    if locator.starts_with("memory://") {
        return Ok(Arc::new(InMemoryFabric::new()));
    }
    #[cfg(feature = "redis-fabric")]
    {
        use fdu_kvm_runtime::fabric::RedisFabric;
        return Ok(Arc::new(RedisFabric::new(locator)?));
    }
    #[cfg(not(feature = "redis-fabric"))]
    anyhow::bail!("fabric locator `{locator}` requires the redis-fabric feature")
}
