//! Integration tests for the hypervisor crate.
//!
//! These tests drive profiles, documents and statistics end to end against
//! the mock backend.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use virtkit_hypervisor::descriptor;
use virtkit_hypervisor::image::ImageInspector;
use virtkit_hypervisor::{
    DomainDocumentBuilder, DomainRequest, Hypervisor, HypervisorError, HypervisorFamily, ImageInfo,
    InitRequest, MacAddress, MockBackend, NetCounters, ProfileResolver, ProfileSettings,
    SerialTemplateRegistry, VirtManager,
};

/// Inspector that reports every file as a 1 GiB qcow2 image.
struct StaticInspector;

impl ImageInspector for StaticInspector {
    fn inspect(&self, _path: &Path) -> virtkit_hypervisor::Result<ImageInfo> {
        Ok(ImageInfo {
            format: "qcow2".to_string(),
            virtual_size: 1 << 30,
            actual_size: 1 << 20,
            backing_file: None,
        })
    }
}

fn settings_with_profiles() -> ProfileSettings {
    let yaml = r#"
images: /srv/images
nic:
  dual:
    - eth0:
        bridge: br0
    - eth1:
        network: isolated
        model: e1000
disk:
  data:
    - system:
        size: 4096
    - data:
        size: 20480
        format: raw
"#;
    serde_yaml::from_str(yaml).expect("Failed to parse YAML")
}

fn manager(backend: Arc<MockBackend>) -> VirtManager {
    VirtManager::new(backend, HypervisorFamily::Kvm, settings_with_profiles())
        .with_inspector(Arc::new(StaticInspector))
}

/// Test that a built document parses back to the same disks and MACs.
#[test]
fn test_document_round_trip() {
    let resolver = ProfileResolver::new(settings_with_profiles());
    let disks = resolver.disk_profile("data", HypervisorFamily::Kvm).unwrap();
    let interfaces = resolver
        .nic_profile("dual", HypervisorFamily::Kvm, &Default::default())
        .unwrap();

    let mut request = DomainRequest::new("db01", HypervisorFamily::Kvm)
        .with_cpu(2)
        .with_memory(2048);
    request.disks = disks.clone();
    request.interfaces = interfaces.clone();

    let registry = SerialTemplateRegistry::default();
    let xml = DomainDocumentBuilder::new(&request, &registry).build().unwrap();

    let parsed_disks = descriptor::parse_disks(&xml).unwrap();
    let expected: BTreeMap<String, String> = [
        ("vda".to_string(), "/srv/images/db01/system.qcow2".to_string()),
        ("vdb".to_string(), "/srv/images/db01/data.raw".to_string()),
    ]
    .into_iter()
    .collect();
    assert_eq!(parsed_disks, expected);

    let macs = descriptor::parse_macs(&xml).unwrap();
    let expected_macs: Vec<String> = interfaces.iter().map(|i| i.mac.to_string()).collect();
    assert_eq!(macs, expected_macs);
}

/// Test that ESXi datastore paths survive a build and parse.
#[test]
fn test_esxi_document_round_trip() {
    let mut settings = settings_with_profiles();
    settings.datastore = "ds1".to_string();
    let resolver = ProfileResolver::new(settings);
    let disks = resolver.disk_profile("data", HypervisorFamily::Esxi).unwrap();

    let mut request = DomainRequest::new("db01", HypervisorFamily::Esxi)
        .with_cpu(1)
        .with_memory(1024);
    request.disks = disks;

    let registry = SerialTemplateRegistry::default();
    let xml = DomainDocumentBuilder::new(&request, &registry).build().unwrap();

    let parsed_disks = descriptor::parse_disks(&xml).unwrap();
    let expected: BTreeMap<String, String> = [
        ("sda".to_string(), "[ds1] db01/system.vmdk".to_string()),
        ("sdb".to_string(), "[ds1] db01/data.raw".to_string()),
    ]
    .into_iter()
    .collect();
    assert_eq!(parsed_disks, expected);
}

/// Test that every generated MAC is locally administered and unique.
#[test]
fn test_generated_macs_are_distinct() {
    let resolver = ProfileResolver::new(settings_with_profiles());
    let interfaces = resolver
        .nic_profile("dual", HypervisorFamily::Kvm, &Default::default())
        .unwrap();

    assert_eq!(interfaces.len(), 2);
    assert_ne!(interfaces[0].mac, interfaces[1].mac);
    for interface in &interfaces {
        let parsed: MacAddress = interface.mac.to_string().parse().unwrap();
        assert_eq!(parsed, interface.mac);
    }
}

/// Test the full init flow followed by introspection.
#[tokio::test]
async fn test_init_and_inspect() {
    let backend = Arc::new(MockBackend::new());
    let manager = manager(backend.clone());

    let outcome = manager
        .init(
            InitRequest::new("db01", 2, 2048)
                .with_nic_profile("dual")
                .with_disk_profile("data")
                .with_mac("eth0", "52:54:00:aa:bb:cc"),
        )
        .await
        .unwrap();

    assert_eq!(
        outcome.completed,
        ["create_volume:system", "create_volume:data", "define", "start"]
    );
    assert_eq!(outcome.volumes.len(), 2);

    let nics = manager.get_nics("db01").await.unwrap();
    assert_eq!(nics.len(), 2);
    let eth0 = &nics["52:54:00:aa:bb:cc"];
    assert_eq!(eth0.kind, "bridge");
    assert_eq!(eth0.source.as_ref().unwrap()["bridge"], "br0");

    let disks = manager.get_disks("db01").await.unwrap();
    assert_eq!(disks["vda"].file, "/srv/images/db01/system.qcow2");
    assert_eq!(disks["vda"].image.as_ref().unwrap().format, "qcow2");

    let info = manager.stats().vm_info(Some("db01")).await.unwrap().single().unwrap();
    assert_eq!(info.cpu, 2);
    assert_eq!(info.max_mem, 2048 * 1024);
    assert_eq!(info.nics.len(), 2);
}

/// Test that a failing step reports what already happened.
#[tokio::test]
async fn test_init_partial_failure_at_start() {
    let backend = Arc::new(MockBackend::new());
    backend.fail_operation("start");
    let manager = manager(backend.clone());

    let err = manager
        .init(InitRequest::new("db01", 1, 512))
        .await
        .unwrap_err();

    match err {
        HypervisorError::PartialFailure {
            step_name, completed, ..
        } => {
            assert_eq!(step_name, "start");
            assert_eq!(completed, ["create_volume:system", "define"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(manager.list_inactive_vms().await.unwrap(), ["db01"]);
}

/// Test that template images are refused on ESXi before anything happens.
#[tokio::test]
async fn test_esxi_template_image_rejected() {
    let backend = Arc::new(MockBackend::new());
    let manager = VirtManager::new(backend.clone(), HypervisorFamily::Esxi, ProfileSettings::default());

    let result = manager
        .init(InitRequest::new("db01", 1, 512).with_image("/srv/templates/base.vmdk"))
        .await;

    assert!(matches!(
        result,
        Err(HypervisorError::UnsupportedCombination { .. })
    ));
    assert!(backend.list_vms().await.unwrap().is_empty());
    assert!(backend.volumes("default").is_empty());
}

/// Test that network counters sum over every interface with a target.
#[tokio::test]
async fn test_netstats_sum_over_interfaces() {
    let backend = Arc::new(MockBackend::new());
    let manager = manager(backend.clone());
    manager
        .init(InitRequest::new("db01", 1, 512).with_nic_profile("dual"))
        .await
        .unwrap();

    // The live descriptor carries the tap devices assigned at start.
    let xml = backend.xml_desc("db01").await.unwrap();
    let live = xml
        .replacen("</interface>", "<target dev='vnet0'/></INTERFACE>", 1)
        .replacen("</interface>", "<target dev='vnet1'/></INTERFACE>", 1)
        .replace("</INTERFACE>", "</interface>");
    backend.set_xml("db01", &live).unwrap();

    let counters = |rx_bytes| NetCounters {
        rx_bytes,
        rx_packets: 1,
        ..Default::default()
    };
    backend.set_interface_stats("db01", "vnet0", counters(100)).unwrap();
    backend.set_interface_stats("db01", "vnet1", counters(50)).unwrap();

    let stats = manager.stats().vm_netstats(Some("db01")).await.unwrap().single().unwrap();
    assert_eq!(stats.rx_bytes, 150);
    assert_eq!(stats.rx_packets, 2);
}

/// Test that free memory accounts for the host reserve and running VMs.
#[tokio::test]
async fn test_free_resources() {
    let backend = Arc::new(MockBackend::new());
    let manager = manager(backend.clone());
    manager.init(InitRequest::new("db01", 2, 2048)).await.unwrap();
    manager
        .init(InitRequest::new("web01", 1, 1024).with_start(false))
        .await
        .unwrap();

    assert_eq!(manager.freemem().await.unwrap(), 16384 - 256 - 2048);
    assert_eq!(manager.freecpu().await.unwrap(), 8 - 2);
}
