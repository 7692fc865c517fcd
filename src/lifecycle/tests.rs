use super::*;
use crate::fabric::InMemoryFabric;
use crate::hypervisor::FakeHypervisorDriver;
use crate::model::EntityData;
use crate::os_bridge::mock::MockOsBridge;
use crate::os_bridge::NetworkInterfaceInfo;
use crate::status::DesiredAction;

fn engine(
    bridge: Arc<MockOsBridge>,
    hypervisor: Arc<FakeHypervisorDriver>,
    fabric: Arc<InMemoryFabric>,
) -> LifecycleEngine {
    let registries = Arc::new(Registries::new(
        bridge.clone(),
        fabric.clone(),
        "node-1".to_string(),
        Uuid::nil(),
        PathBuf::from("/var/lib/fdu-kvm/images"),
    ));
    LifecycleEngine::new(
        "node-1".to_string(),
        Uuid::nil(),
        PathBuf::from("/var/lib/fdu-kvm"),
        registries,
        fabric,
        bridge,
        hypervisor,
    )
}

fn define_manifest(uuid: Uuid, entity: EntityData) -> DesiredFdu {
    DesiredFdu {
        uuid,
        name: "vm1".to_string(),
        status: DesiredAction::Define,
        entity_data: entity,
    }
}

// define with derived image and flavor.
#[tokio::test]
async fn define_derives_image_and_flavor() {
    let fabric = Arc::new(InMemoryFabric::new());
    let engine = engine(
        Arc::new(MockOsBridge::new(vec![])),
        Arc::new(FakeHypervisorDriver::new()),
        fabric.clone(),
    );

    let fdu_uuid = Uuid::new_v4();
    let entity = EntityData {
        base_image: Some("http://example.test/cirros.qcow2".to_string()),
        cpu: Some(1),
        memory: Some(256),
        disk_size: Some(2),
        ..Default::default()
    };
    engine
        .define_fdu(define_manifest(fdu_uuid, entity))
        .await
        .unwrap();

    let state = fabric.fdu_state(fdu_uuid).await.unwrap();
    assert_eq!(state.status, crate::status::FduStatus::Defined);

    let image = engine.registries.get_image(fdu_uuid).await.unwrap();
    assert_eq!(image.format, "qcow2");
    assert!(image.local_path.is_some());

    let flavor = engine.registries.get_flavor(fdu_uuid).await.unwrap();
    assert_eq!(flavor.cpu, 1);
    assert_eq!(flavor.memory, 256);
}

// missing flavor reference fails resolution, fdu is not added.
#[tokio::test]
async fn define_with_missing_flavor_id_fails() {
    let fabric = Arc::new(InMemoryFabric::new());
    let engine = engine(
        Arc::new(MockOsBridge::new(vec![])),
        Arc::new(FakeHypervisorDriver::new()),
        fabric.clone(),
    );

    let fdu_uuid = Uuid::new_v4();
    let entity = EntityData {
        base_image: Some("http://example.test/cirros.qcow2".to_string()),
        flavor_id: Some(Uuid::new_v4()),
        ..Default::default()
    };
    let err = engine
        .define_fdu(define_manifest(fdu_uuid, entity))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));

    let state = fabric.fdu_state(fdu_uuid).await.unwrap();
    assert_eq!(state.status, crate::status::FduStatus::Error);
    assert!(engine.known_fdus().await.is_empty());
}

// configure happy path.
#[tokio::test]
async fn configure_happy_path() {
    let fabric = Arc::new(InMemoryFabric::new());
    let bridge = Arc::new(MockOsBridge::new(vec![]));
    let hypervisor = Arc::new(FakeHypervisorDriver::new());
    let engine = engine(bridge.clone(), hypervisor.clone(), fabric.clone());

    let fdu_uuid = Uuid::new_v4();
    let entity = EntityData {
        base_image: Some("http://example.test/cirros.qcow2".to_string()),
        cpu: Some(1),
        memory: Some(256),
        disk_size: Some(2),
        ..Default::default()
    };
    engine
        .define_fdu(define_manifest(fdu_uuid, entity))
        .await
        .unwrap();
    engine.configure_fdu(fdu_uuid).await.unwrap();

    assert!(hypervisor.domain_exists(fdu_uuid));
    let commands = bridge.commands.lock().await;
    assert!(commands.iter().any(|(cmd, _)| cmd == "qemu-img"));
    assert!(commands.iter().any(|(cmd, _)| cmd == "dd"));
}

// undefine on the wrong state is rejected, state is untouched.
#[tokio::test]
async fn undefine_wrong_state_rejected() {
    let fabric = Arc::new(InMemoryFabric::new());
    let engine = engine(
        Arc::new(MockOsBridge::new(vec![])),
        Arc::new(FakeHypervisorDriver::new()),
        fabric.clone(),
    );

    let fdu_uuid = Uuid::new_v4();
    let entity = EntityData {
        base_image: Some("http://example.test/cirros.qcow2".to_string()),
        cpu: Some(1),
        memory: Some(256),
        disk_size: Some(2),
        ..Default::default()
    };
    engine
        .define_fdu(define_manifest(fdu_uuid, entity))
        .await
        .unwrap();
    engine.configure_fdu(fdu_uuid).await.unwrap();

    let err = engine.undefine_fdu(fdu_uuid).await.unwrap_err();
    assert!(err.to_string().contains("not allowed"));
}

// run then stop.
#[tokio::test]
async fn run_then_stop() {
    let fabric = Arc::new(InMemoryFabric::new());
    let hypervisor = Arc::new(FakeHypervisorDriver::new());
    let engine = engine(Arc::new(MockOsBridge::new(vec![])), hypervisor.clone(), fabric.clone());

    let fdu_uuid = Uuid::new_v4();
    let entity = EntityData {
        base_image: Some("http://example.test/cirros.qcow2".to_string()),
        cpu: Some(1),
        memory: Some(256),
        disk_size: Some(2),
        ..Default::default()
    };
    engine.define_fdu(define_manifest(fdu_uuid, entity)).await.unwrap();
    engine.configure_fdu(fdu_uuid).await.unwrap();

    engine.run_fdu(fdu_uuid).await.unwrap();
    assert_eq!(fabric.fdu_state(fdu_uuid).await.unwrap().status, crate::status::FduStatus::Run);

    hypervisor.set_shutdown_delay(fdu_uuid, 2);
    engine.stop_fdu(fdu_uuid).await.unwrap();
    assert_eq!(fabric.fdu_state(fdu_uuid).await.unwrap().status, crate::status::FduStatus::Stop);
}

// pause then resume.
#[tokio::test]
async fn pause_then_resume() {
    let fabric = Arc::new(InMemoryFabric::new());
    let hypervisor = Arc::new(FakeHypervisorDriver::new());
    let engine = engine(Arc::new(MockOsBridge::new(vec![])), hypervisor, fabric.clone());

    let fdu_uuid = Uuid::new_v4();
    let entity = EntityData {
        base_image: Some("http://example.test/cirros.qcow2".to_string()),
        cpu: Some(1),
        memory: Some(256),
        disk_size: Some(2),
        ..Default::default()
    };
    engine.define_fdu(define_manifest(fdu_uuid, entity)).await.unwrap();
    engine.configure_fdu(fdu_uuid).await.unwrap();
    engine.run_fdu(fdu_uuid).await.unwrap();

    engine.pause_fdu(fdu_uuid).await.unwrap();
    assert_eq!(fabric.fdu_state(fdu_uuid).await.unwrap().status, crate::status::FduStatus::Pause);

    engine.resume_fdu(fdu_uuid).await.unwrap();
    assert_eq!(fabric.fdu_state(fdu_uuid).await.unwrap().status, crate::status::FduStatus::Run);
}

// Corrected wireless-interface selection: first available match wins, and
// only that one is marked unavailable.
#[tokio::test]
async fn wireless_attachment_takes_first_available_match() {
    let fabric = Arc::new(InMemoryFabric::new());
    let bridge = Arc::new(MockOsBridge::new(vec![
        NetworkInterfaceInfo {
            name: "wlan0".to_string(),
            intf_type: "wireless".to_string(),
            available: true,
        },
        NetworkInterfaceInfo {
            name: "wlan1".to_string(),
            intf_type: "wireless".to_string(),
            available: true,
        },
    ]));
    let engine = engine(bridge.clone(), Arc::new(FakeHypervisorDriver::new()), fabric.clone());

    let fdu_uuid = Uuid::new_v4();
    let entity = EntityData {
        base_image: Some("http://example.test/cirros.qcow2".to_string()),
        cpu: Some(1),
        memory: Some(256),
        disk_size: Some(2),
        networks: vec![NetworkAttachment {
            kind: "wifi".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };
    engine.define_fdu(define_manifest(fdu_uuid, entity)).await.unwrap();
    engine.configure_fdu(fdu_uuid).await.unwrap();

    let interfaces = bridge.interfaces.lock().await;
    let wlan0 = interfaces.iter().find(|i| i.name == "wlan0").unwrap();
    let wlan1 = interfaces.iter().find(|i| i.name == "wlan1").unwrap();
    assert!(!wlan0.available, "first match must be marked unavailable");
    assert!(wlan1.available, "second match must be left untouched");
}

// Force-termination chains down from running to fully undefined.
#[tokio::test]
async fn force_terminate_from_running_undefines() {
    let fabric = Arc::new(InMemoryFabric::new());
    let hypervisor = Arc::new(FakeHypervisorDriver::new());
    let engine = engine(Arc::new(MockOsBridge::new(vec![])), hypervisor.clone(), fabric.clone());

    let fdu_uuid = Uuid::new_v4();
    let entity = EntityData {
        base_image: Some("http://example.test/cirros.qcow2".to_string()),
        cpu: Some(1),
        memory: Some(256),
        disk_size: Some(2),
        ..Default::default()
    };
    engine.define_fdu(define_manifest(fdu_uuid, entity)).await.unwrap();
    engine.configure_fdu(fdu_uuid).await.unwrap();
    engine.run_fdu(fdu_uuid).await.unwrap();

    engine.force_terminate_fdu(fdu_uuid).await;

    assert!(engine.known_fdus().await.is_empty());
    assert!(!hypervisor.domain_exists(fdu_uuid));
}
