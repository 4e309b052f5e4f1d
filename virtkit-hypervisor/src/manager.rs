//! VM management operations over any [`Hypervisor`] backend.
//!
//! `VirtManager` ties profile resolution, document building, descriptor
//! parsing and statistics to a control-plane connection. Multi-step
//! operations (`init`, `purge`) validate and render everything up front,
//! then run their external steps in order. A failure once those steps have
//! begun is reported as [`HypervisorError::PartialFailure`] naming the
//! failing step and the steps that completed; nothing is rolled back.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::descriptor::{self, InterfaceDescriptor};
use crate::error::{HypervisorError, Result};
use crate::family::HypervisorFamily;
use crate::image::{inspect_disks, DiskDetails, ImageInfo, ImageInspector, QemuImgInspector};
use crate::profile::{MacOverrides, ProfileCatalog, ProfileResolver, ProfileSettings, DEFAULT_PROFILE};
use crate::provision::{ImageProvisioner, LocalProvisioner};
use crate::stats::{StatsAggregator, VmState};
use crate::traits::{Hypervisor, KEYCODE_SET_LINUX};
use crate::types::*;
use crate::xml::{DomainDocumentBuilder, SerialTemplateRegistry, VolumeDocumentBuilder};

/// Default libvirt storage pool for profile disks.
pub const DEFAULT_STORAGE_POOL: &str = "default";

/// Loaded kernel modules, checked for the kvm vendor module.
const PROC_MODULES: &str = "/proc/modules";

/// Linux key codes for KEY_LEFTCTRL, KEY_LEFTALT and KEY_DELETE.
pub const CTRL_ALT_DEL: [u32; 3] = [29, 56, 111];

/// Parameters of a new VM.
#[derive(Debug, Clone)]
pub struct InitRequest {
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    /// Template image copied in as the system disk
    pub image: Option<PathBuf>,
    pub nic_profile: String,
    /// Ignored when `image` is set; the default disk profile is used then
    pub disk_profile: String,
    pub mac_overrides: MacOverrides,
    pub boot_devices: Option<Vec<BootDevice>>,
    pub serial: Option<SerialOptions>,
    /// Seed the copied template image
    pub seed: bool,
    /// Ask the seed command to install the configuration agent
    pub install: bool,
    pub start: bool,
}

impl InitRequest {
    pub fn new(name: impl Into<String>, vcpus: u32, memory_mb: u64) -> Self {
        Self {
            name: name.into(),
            vcpus,
            memory_mb,
            image: None,
            nic_profile: DEFAULT_PROFILE.to_string(),
            disk_profile: DEFAULT_PROFILE.to_string(),
            mac_overrides: MacOverrides::new(),
            boot_devices: None,
            serial: None,
            seed: false,
            install: true,
            start: true,
        }
    }

    pub fn with_image(mut self, image: impl Into<PathBuf>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_nic_profile(mut self, profile: impl Into<String>) -> Self {
        self.nic_profile = profile.into();
        self
    }

    pub fn with_disk_profile(mut self, profile: impl Into<String>) -> Self {
        self.disk_profile = profile.into();
        self
    }

    pub fn with_mac(mut self, device: &str, mac: impl Into<String>) -> Self {
        self.mac_overrides.insert(format!("{}_mac", device), mac.into());
        self
    }

    pub fn with_start(mut self, start: bool) -> Self {
        self.start = start;
        self
    }

    pub fn with_seed(mut self, seed: bool) -> Self {
        self.seed = seed;
        self
    }
}

/// What `init` did.
#[derive(Debug, Clone, Serialize)]
pub struct InitOutcome {
    pub name: String,
    /// Steps in execution order
    pub completed: Vec<String>,
    /// Paths of created storage volumes
    pub volumes: Vec<String>,
    /// Destination of the copied template image
    pub image_path: Option<PathBuf>,
}

/// A storage volume `init` creates, optionally cloned from a source image.
struct VolumePlan {
    disk: String,
    xml: String,
    clone_from: Option<PathBuf>,
    dest: PathBuf,
}

/// Records completed steps of a multi-step operation.
struct StepTracker {
    operation: &'static str,
    vm: String,
    completed: Vec<String>,
}

impl StepTracker {
    fn new(operation: &'static str, vm: &str) -> Self {
        Self {
            operation,
            vm: vm.to_string(),
            completed: Vec::new(),
        }
    }

    fn mark(&mut self, step_name: impl Into<String>) {
        let step_name = step_name.into();
        debug!(operation = self.operation, vm = %self.vm, step = %step_name, "Step completed");
        self.completed.push(step_name);
    }

    /// Record the outcome of one step; a failure becomes `PartialFailure`.
    fn record<T>(&mut self, step_name: impl Into<String>, result: Result<T>) -> Result<T> {
        let step_name = step_name.into();
        match result {
            Ok(value) => {
                self.mark(step_name);
                Ok(value)
            }
            Err(e) => {
                warn!(
                    operation = self.operation,
                    vm = %self.vm,
                    step = %step_name,
                    completed = ?self.completed,
                    error = %e,
                    "Step failed after external changes"
                );
                Err(HypervisorError::PartialFailure {
                    operation: self.operation.to_string(),
                    vm: self.vm.clone(),
                    step: self.completed.len(),
                    step_name,
                    completed: self.completed.clone(),
                    source: Box::new(e),
                })
            }
        }
    }
}

/// High-level VM management.
pub struct VirtManager {
    backend: Arc<dyn Hypervisor>,
    family: HypervisorFamily,
    resolver: ProfileResolver,
    serial: SerialTemplateRegistry,
    inspector: Arc<dyn ImageInspector>,
    provisioner: Arc<dyn ImageProvisioner>,
    storage_pool: String,
}

impl VirtManager {
    pub fn new(backend: Arc<dyn Hypervisor>, family: HypervisorFamily, settings: ProfileSettings) -> Self {
        Self {
            backend,
            family,
            resolver: ProfileResolver::new(settings),
            serial: SerialTemplateRegistry::default(),
            inspector: Arc::new(QemuImgInspector::new()),
            provisioner: Arc::new(LocalProvisioner::default()),
            storage_pool: DEFAULT_STORAGE_POOL.to_string(),
        }
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn ImageInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn ImageProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_storage_pool(mut self, pool: impl Into<String>) -> Self {
        self.storage_pool = pool.into();
        self
    }

    pub fn with_serial_templates(mut self, registry: SerialTemplateRegistry) -> Self {
        self.serial = registry;
        self
    }

    pub fn family(&self) -> HypervisorFamily {
        self.family
    }

    pub fn backend(&self) -> &dyn Hypervisor {
        self.backend.as_ref()
    }

    pub fn stats(&self) -> StatsAggregator<'_> {
        StatsAggregator::new(self.backend.as_ref(), self.inspector.as_ref(), self.family)
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Create (and by default start) a VM from profiles or a template image.
    #[instrument(skip(self, request), fields(vm = %request.name, family = %self.family))]
    pub async fn init(&self, request: InitRequest) -> Result<InitOutcome> {
        let family = self.family;
        let name = request.name.as_str();

        // Everything below up to the first external call only validates.
        let interfaces = self
            .resolver
            .nic_profile(&request.nic_profile, family, &request.mac_overrides)?;

        let disk_profile = match request.image {
            Some(_) => DEFAULT_PROFILE,
            None => request.disk_profile.as_str(),
        };
        let mut disks = self.resolver.disk_profile(disk_profile, family)?;
        let images = match request.image {
            Some(_) => BTreeMap::new(),
            None => self.inspect_disk_images(&mut disks)?,
        };

        let image_dest = match &request.image {
            Some(_) if !family.profile().template_images => {
                return Err(HypervisorError::UnsupportedCombination {
                    feature: "template image".to_string(),
                    family: family.to_string(),
                });
            }
            Some(_) => {
                let system = disks.first().ok_or_else(|| {
                    HypervisorError::Validation("default disk profile has no disks".to_string())
                })?;
                Some(PathBuf::from(system.source_path(name)))
            }
            None => None,
        };

        let seeding = request.seed && image_dest.is_some();
        if seeding && !self.provisioner.can_seed() {
            return Err(HypervisorError::Validation(
                "seeding requested but no seed command is configured".to_string(),
            ));
        }

        let mut domain = DomainRequest::new(name, family)
            .with_cpu(request.vcpus)
            .with_memory(request.memory_mb);
        domain.disks = disks.clone();
        domain.interfaces = interfaces;
        domain.boot_devices = request.boot_devices.clone();
        domain.serial = request.serial.clone();
        let domain_xml = DomainDocumentBuilder::new(&domain, &self.serial).build()?;

        let volume_plans = match image_dest {
            Some(_) => Vec::new(),
            None => disks
                .iter()
                .map(|disk| -> Result<VolumePlan> {
                    let mut builder = VolumeDocumentBuilder::new(name, disk);
                    if let Some(info) = images.get(&disk.name) {
                        builder = builder.with_image(info);
                    }
                    Ok(VolumePlan {
                        disk: disk.name.clone(),
                        xml: builder.build()?,
                        clone_from: disk.image.as_ref().map(PathBuf::from),
                        dest: PathBuf::from(disk.source_path(name)),
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };

        // External side effects start here.
        let mut steps = StepTracker::new("init", name);
        let mut volumes = Vec::new();

        match (&request.image, &image_dest) {
            (Some(source), Some(dest)) => {
                let copied = self.provisioner.copy_template(source, dest).await;
                steps.record("copy_image", copied)?;
            }
            _ => {
                for plan in &volume_plans {
                    let created = self.backend.define_volume(&self.storage_pool, &plan.xml).await;
                    volumes.push(steps.record(format!("create_volume:{}", plan.disk), created)?);

                    if let Some(source) = &plan.clone_from {
                        let copied = self.provisioner.copy_template(source, &plan.dest).await;
                        steps.record(format!("copy_image:{}", plan.disk), copied)?;
                    }
                }
            }
        }

        let defined = self.backend.define_domain(&domain_xml).await;
        steps.record("define", defined)?;

        if let (true, Some(dest)) = (seeding, &image_dest) {
            let seeded = self.provisioner.seed(dest, name, request.install).await;
            steps.record("seed", seeded)?;
        }

        if request.start {
            let started = self.backend.start(name).await;
            steps.record("start", started)?;
        }

        info!(steps = ?steps.completed, "VM initialized");
        Ok(InitOutcome {
            name: name.to_string(),
            completed: steps.completed,
            volumes,
            image_path: image_dest,
        })
    }

    /// Read the source images named by profile disks.
    ///
    /// Each such disk takes the format of its image, so the domain and
    /// volume documents describe the file that will actually be cloned in.
    fn inspect_disk_images(&self, disks: &mut [DiskSpec]) -> Result<BTreeMap<String, ImageInfo>> {
        let mut images = BTreeMap::new();

        for disk in disks.iter_mut() {
            let Some(source) = disk.image.clone() else {
                continue;
            };
            if !self.family.profile().template_images {
                return Err(HypervisorError::UnsupportedCombination {
                    feature: "disk source image".to_string(),
                    family: self.family.to_string(),
                });
            }

            let info = self.inspector.inspect(Path::new(&source)).map_err(|e| {
                HypervisorError::Validation(format!(
                    "cannot read source image {} of disk '{}': {}",
                    source, disk.name, e
                ))
            })?;
            disk.format = info.format.parse()?;
            debug!(disk = %disk.name, format = %info.format, virtual_size = info.virtual_size, "Source image inspected");
            images.insert(disk.name.clone(), info);
        }
        Ok(images)
    }

    /// Destroy a VM, delete its local disk images and undefine it.
    ///
    /// Only file-backed disks are deleted; block devices and network
    /// sources are left alone. With `dirs`, the directories of the files
    /// deleted here are removed too.
    /// Returns the deleted paths.
    #[instrument(skip(self))]
    pub async fn purge(&self, name: &str, dirs: bool) -> Result<Vec<PathBuf>> {
        self.backend.ensure_vm(name).await?;
        let disks = descriptor::parse_file_disks(&self.backend.xml_desc(name).await?)?;
        let mut steps = StepTracker::new("purge", name);

        if self.backend.is_active(name).await? {
            match self.backend.destroy(name).await {
                Ok(()) => steps.mark("destroy"),
                Err(e) => {
                    if self.backend.is_active(name).await? {
                        return Err(e);
                    }
                    debug!(error = %e, "VM stopped before destroy");
                }
            }
        }

        let mut removed = Vec::new();
        let mut directories = BTreeSet::new();
        for (dev, source) in &disks {
            let path = Path::new(source);
            if !path.is_absolute() {
                debug!(device = %dev, source = %source, "Skipping non-local disk");
                continue;
            }
            let deleted = remove_file_if_present(path).await;
            if steps.record(format!("delete_disk:{}", dev), deleted)? {
                removed.push(path.to_path_buf());
                if let Some(dir) = path.parent() {
                    directories.insert(dir.to_path_buf());
                }
            }
        }

        if dirs {
            for dir in directories {
                let deleted = remove_dir_if_present(&dir).await;
                if steps.record(format!("delete_dir:{}", dir.display()), deleted)? {
                    removed.push(dir);
                }
            }
        }

        let undefined = self.backend.undefine(name).await;
        steps.record("undefine", undefined)?;

        info!(removed = removed.len(), "VM purged");
        Ok(removed)
    }

    // =========================================================================
    // Raw documents
    // =========================================================================

    pub async fn define_xml_str(&self, xml: &str) -> Result<String> {
        self.backend.define_domain(xml).await
    }

    pub async fn define_xml_path(&self, path: &Path) -> Result<String> {
        let xml = tokio::fs::read_to_string(path).await?;
        self.define_xml_str(&xml).await
    }

    pub async fn create_xml_str(&self, xml: &str) -> Result<String> {
        self.backend.create_domain(xml).await
    }

    pub async fn create_xml_path(&self, path: &Path) -> Result<String> {
        let xml = tokio::fs::read_to_string(path).await?;
        self.create_xml_str(&xml).await
    }

    /// Create a volume in the configured storage pool.
    pub async fn define_vol_xml_str(&self, xml: &str) -> Result<String> {
        self.backend.define_volume(&self.storage_pool, xml).await
    }

    pub async fn define_vol_xml_path(&self, path: &Path) -> Result<String> {
        let xml = tokio::fs::read_to_string(path).await?;
        self.define_vol_xml_str(&xml).await
    }

    // =========================================================================
    // Listing & lifecycle
    // =========================================================================

    pub async fn list_vms(&self) -> Result<Vec<String>> {
        self.backend.list_vms().await
    }

    pub async fn list_active_vms(&self) -> Result<Vec<String>> {
        self.backend.list_active_vms().await
    }

    pub async fn list_inactive_vms(&self) -> Result<Vec<String>> {
        self.backend.list_inactive_vms().await
    }

    /// Start a defined VM.
    pub async fn start(&self, name: &str) -> Result<()> {
        self.backend.ensure_vm(name).await?;
        self.backend.start(name).await
    }

    /// Hard stop.
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.backend.ensure_vm(name).await?;
        self.backend.destroy(name).await
    }

    pub async fn shutdown(&self, name: &str) -> Result<()> {
        self.backend.ensure_vm(name).await?;
        self.backend.shutdown(name).await
    }

    pub async fn pause(&self, name: &str) -> Result<()> {
        self.backend.ensure_vm(name).await?;
        self.backend.suspend(name).await
    }

    pub async fn resume(&self, name: &str) -> Result<()> {
        self.backend.ensure_vm(name).await?;
        self.backend.resume(name).await
    }

    pub async fn reboot(&self, name: &str) -> Result<()> {
        self.backend.ensure_vm(name).await?;
        self.backend.reboot(name).await
    }

    pub async fn reset(&self, name: &str) -> Result<()> {
        self.backend.ensure_vm(name).await?;
        self.backend.reset(name).await
    }

    pub async fn send_key(&self, name: &str, keys: &[u32]) -> Result<()> {
        if keys.is_empty() {
            return Err(HypervisorError::Validation("no key codes given".to_string()));
        }
        self.backend.ensure_vm(name).await?;
        self.backend.send_key(name, KEYCODE_SET_LINUX, 0, keys).await
    }

    pub async fn ctrl_alt_del(&self, name: &str) -> Result<()> {
        self.send_key(name, &CTRL_ALT_DEL).await
    }

    pub async fn undefine(&self, name: &str) -> Result<()> {
        self.backend.ensure_vm(name).await?;
        self.backend.undefine(name).await
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub async fn set_autostart(&self, name: &str, enabled: bool) -> Result<()> {
        self.backend.ensure_vm(name).await?;
        self.backend.set_autostart(name, enabled).await
    }

    /// Change the memory (MB) of a shut down VM.
    ///
    /// The maximum is raised first (and persisted with `config`), then the
    /// current allocation.
    #[instrument(skip(self))]
    pub async fn setmem(&self, name: &str, memory_mb: u64, config: bool) -> Result<()> {
        if memory_mb == 0 {
            return Err(HypervisorError::Validation("memory must be greater than zero".to_string()));
        }
        let kib = memory_mb
            .checked_mul(1024)
            .ok_or_else(|| HypervisorError::Validation(format!("memory size {} MB is out of range", memory_mb)))?;
        self.require_shutdown(name).await?;

        self.backend
            .set_memory(name, kib, ResourceFlags::maximum(config))
            .await?;
        self.backend
            .set_memory(name, kib, ResourceFlags::current())
            .await?;
        info!(memory_mb, "Memory changed");
        Ok(())
    }

    /// Change the vCPU count of a shut down VM.
    #[instrument(skip(self))]
    pub async fn setvcpus(&self, name: &str, vcpus: u32, config: bool) -> Result<()> {
        if vcpus == 0 {
            return Err(HypervisorError::Validation("vcpu count must be greater than zero".to_string()));
        }
        self.require_shutdown(name).await?;

        self.backend
            .set_vcpus(name, vcpus, ResourceFlags::maximum(config))
            .await?;
        self.backend
            .set_vcpus(name, vcpus, ResourceFlags::current())
            .await?;
        info!(vcpus, "vCPUs changed");
        Ok(())
    }

    async fn require_shutdown(&self, name: &str) -> Result<()> {
        self.backend.ensure_vm(name).await?;
        let state = VmState::from_code(self.backend.domain_info(name).await?.state);
        if state != VmState::Shutdown {
            return Err(HypervisorError::InvalidState(format!(
                "VM {} must be shut down, it is {}",
                name, state
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub async fn get_xml(&self, name: &str) -> Result<String> {
        self.backend.ensure_vm(name).await?;
        self.backend.xml_desc(name).await
    }

    pub async fn get_nics(&self, name: &str) -> Result<BTreeMap<String, InterfaceDescriptor>> {
        descriptor::parse_interfaces(&self.get_xml(name).await?)
    }

    pub async fn get_macs(&self, name: &str) -> Result<Vec<String>> {
        descriptor::parse_macs(&self.get_xml(name).await?)
    }

    pub async fn get_graphics(&self, name: &str) -> Result<BTreeMap<String, String>> {
        descriptor::parse_graphics(&self.get_xml(name).await?)
    }

    /// Disks keyed by target device, with image metadata where readable.
    pub async fn get_disks(&self, name: &str) -> Result<BTreeMap<String, DiskDetails>> {
        let disks = descriptor::parse_disks(&self.get_xml(name).await?)?;
        Ok(inspect_disks(self.family, disks, self.inspector.as_ref()))
    }

    /// Resolved nic and disk profiles for `family` (the manager's by default).
    pub fn get_profiles(&self, family: Option<HypervisorFamily>) -> Result<ProfileCatalog> {
        self.resolver.profiles(family.unwrap_or(self.family))
    }

    pub async fn node_info(&self) -> Result<NodeInfo> {
        self.backend.node_info().await
    }

    /// Driver name of the control-plane connection.
    pub async fn virt_type(&self) -> Result<String> {
        self.backend.hypervisor_type().await
    }

    /// Whether this host runs KVM guests: a QEMU connection with the kvm
    /// vendor module loaded.
    pub async fn is_kvm_hyper(&self) -> Result<bool> {
        if !self.virt_type().await?.eq_ignore_ascii_case("qemu") {
            return Ok(false);
        }
        match tokio::fs::read_to_string(PROC_MODULES).await {
            Ok(modules) => Ok(kvm_module_loaded(&modules)),
            Err(e) => {
                debug!(error = %e, "Cannot read kernel modules");
                Ok(false)
            }
        }
    }

    pub async fn freemem(&self) -> Result<i64> {
        self.stats().freemem().await
    }

    pub async fn freecpu(&self) -> Result<i64> {
        self.stats().freecpu().await
    }

    pub async fn full_info(&self) -> Result<crate::stats::FullInfo> {
        self.stats().full_info().await
    }
}

/// `kvm_intel` or `kvm_amd` in `/proc/modules` content.
fn kvm_module_loaded(modules: &str) -> bool {
    modules.lines().any(|line| line.starts_with("kvm_"))
}

/// `Ok(false)` when there was nothing to delete or the path is not a
/// regular file.
async fn remove_file_if_present(path: &Path) -> Result<bool> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if !meta.is_file() => {
            warn!(path = %path.display(), "Not a regular file, leaving it in place");
            return Ok(false);
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn remove_dir_if_present(path: &Path) -> Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;

    fn settings(images: &Path) -> ProfileSettings {
        ProfileSettings {
            images: images.display().to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_init_from_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let manager = VirtManager::new(backend.clone(), HypervisorFamily::Kvm, settings(dir.path()));

        let outcome = manager
            .init(InitRequest::new("web01", 2, 1024).with_mac("eth0", "52:54:00:00:00:01"))
            .await
            .unwrap();

        assert_eq!(outcome.completed, ["create_volume:system", "define", "start"]);
        assert_eq!(backend.volumes("default"), ["web01/system.qcow2"]);
        assert_eq!(manager.list_active_vms().await.unwrap(), ["web01"]);
        assert_eq!(manager.get_macs("web01").await.unwrap(), ["52:54:00:00:00:01"]);
    }

    #[tokio::test]
    async fn test_init_without_start() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let manager = VirtManager::new(backend, HypervisorFamily::Kvm, settings(dir.path()));

        manager
            .init(InitRequest::new("web01", 1, 512).with_start(false))
            .await
            .unwrap();
        assert_eq!(manager.list_inactive_vms().await.unwrap(), ["web01"]);
    }

    #[tokio::test]
    async fn test_init_with_template_image() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.qcow2");
        std::fs::write(&template, b"qcow").unwrap();
        let images = dir.path().join("images");

        let backend = Arc::new(MockBackend::new());
        let manager = VirtManager::new(backend.clone(), HypervisorFamily::Kvm, settings(&images));

        let outcome = manager
            .init(InitRequest::new("web01", 1, 512).with_image(&template))
            .await
            .unwrap();

        let dest = images.join("web01/system.qcow2");
        assert_eq!(outcome.image_path.as_deref(), Some(dest.as_path()));
        assert!(dest.exists());
        assert!(backend.volumes("default").is_empty());
        assert_eq!(outcome.completed, ["copy_image", "define", "start"]);
    }

    struct RawImages;

    impl ImageInspector for RawImages {
        fn inspect(&self, _path: &Path) -> Result<ImageInfo> {
            Ok(ImageInfo {
                format: "raw".to_string(),
                virtual_size: 16 * 1024 * 1024 * 1024,
                actual_size: 4096,
                backing_file: None,
            })
        }
    }

    #[tokio::test]
    async fn test_init_clones_disk_source_image() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("base.img");
        std::fs::write(&source, b"raw").unwrap();
        let images = dir.path().join("images");

        let yaml = format!(
            "images: {}\ndisk:\n  cloned:\n    - system:\n        size: 8192\n        image: {}\n",
            images.display(),
            source.display()
        );
        let settings: ProfileSettings = serde_yaml::from_str(&yaml).unwrap();
        let backend = Arc::new(MockBackend::new());
        let manager = VirtManager::new(backend.clone(), HypervisorFamily::Kvm, settings)
            .with_inspector(Arc::new(RawImages));

        let outcome = manager
            .init(InitRequest::new("web01", 1, 512).with_disk_profile("cloned"))
            .await
            .unwrap();

        assert_eq!(
            outcome.completed,
            ["create_volume:system", "copy_image:system", "define", "start"]
        );
        assert_eq!(backend.volumes("default"), ["web01/system.raw"]);
        assert!(images.join("web01/system.raw").exists());

        let disks = descriptor::parse_disks(&manager.get_xml("web01").await.unwrap()).unwrap();
        assert_eq!(disks["vda"], images.join("web01/system.raw").display().to_string());
    }

    #[tokio::test]
    async fn test_init_template_on_esxi_is_unsupported() {
        let backend = Arc::new(MockBackend::new());
        let manager = VirtManager::new(backend.clone(), HypervisorFamily::Esxi, ProfileSettings::default());

        let result = manager
            .init(InitRequest::new("web01", 1, 512).with_image("/tmp/template.vmdk"))
            .await;

        assert!(matches!(result, Err(HypervisorError::UnsupportedCombination { .. })));
        assert!(manager.list_vms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_init_validation_precedes_side_effects() {
        let backend = Arc::new(MockBackend::new());
        let manager = VirtManager::new(backend.clone(), HypervisorFamily::Kvm, ProfileSettings::default());

        let result = manager.init(InitRequest::new("web01", 0, 512)).await;

        assert!(matches!(result, Err(HypervisorError::Validation(_))));
        assert!(backend.volumes("default").is_empty());
    }

    #[tokio::test]
    async fn test_init_partial_failure_names_step() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_operation("define_domain");
        let manager = VirtManager::new(backend.clone(), HypervisorFamily::Kvm, ProfileSettings::default());

        let err = manager.init(InitRequest::new("web01", 1, 512)).await.unwrap_err();
        match err {
            HypervisorError::PartialFailure {
                operation,
                vm,
                step,
                step_name,
                completed,
                ..
            } => {
                assert_eq!(operation, "init");
                assert_eq!(vm, "web01");
                assert_eq!(step, 1);
                assert_eq!(step_name, "define");
                assert_eq!(completed, ["create_volume:system"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        // The created volume is left in place for manual cleanup.
        assert_eq!(backend.volumes("default"), ["web01/system.qcow2"]);
    }

    #[tokio::test]
    async fn test_init_first_step_failure() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_operation("define_volume");
        let manager = VirtManager::new(backend.clone(), HypervisorFamily::Kvm, ProfileSettings::default());

        let err = manager.init(InitRequest::new("web01", 1, 512)).await.unwrap_err();
        assert!(matches!(
            err,
            HypervisorError::PartialFailure { step: 0, ref completed, .. } if completed.is_empty()
        ));
        assert!(manager.list_vms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_setmem_requires_shutdown() {
        let backend = Arc::new(MockBackend::new());
        let manager = VirtManager::new(backend.clone(), HypervisorFamily::Kvm, ProfileSettings::default());
        manager.init(InitRequest::new("web01", 1, 512)).await.unwrap();

        assert!(matches!(
            manager.setmem("web01", 2048, true).await,
            Err(HypervisorError::InvalidState(_))
        ));

        manager.stop("web01").await.unwrap();
        manager.setmem("web01", 2048, true).await.unwrap();
        manager.setvcpus("web01", 4, false).await.unwrap();

        let info = backend.domain_info("web01").await.unwrap();
        assert_eq!(info.max_mem_kib, 2048 * 1024);
        assert_eq!(info.mem_kib, 2048 * 1024);
        assert_eq!(info.vcpus, 4);
    }

    #[tokio::test]
    async fn test_unknown_vm_is_not_found() {
        let backend = Arc::new(MockBackend::new());
        let manager = VirtManager::new(backend, HypervisorFamily::Kvm, ProfileSettings::default());

        assert!(matches!(manager.start("ghost").await, Err(HypervisorError::VmNotFound(_))));
        assert!(matches!(manager.get_nics("ghost").await, Err(HypervisorError::VmNotFound(_))));
    }

    #[tokio::test]
    async fn test_purge_removes_disks() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.qcow2");
        std::fs::write(&template, b"qcow").unwrap();
        let images = dir.path().join("images");

        let backend = Arc::new(MockBackend::new());
        let manager = VirtManager::new(backend.clone(), HypervisorFamily::Kvm, settings(&images));
        manager
            .init(InitRequest::new("web01", 1, 512).with_image(&template))
            .await
            .unwrap();

        let removed = manager.purge("web01", true).await.unwrap();

        assert!(removed.contains(&images.join("web01/system.qcow2")));
        assert!(!images.join("web01").exists());
        assert!(manager.list_vms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_leaves_block_devices() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images/web01");
        let vg = dir.path().join("dev/vg0");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&vg).unwrap();
        std::fs::write(images.join("system.qcow2"), b"qcow").unwrap();
        std::fs::write(vg.join("web01-data"), b"lv").unwrap();
        std::fs::write(vg.join("other-vm-lv"), b"lv").unwrap();

        let xml = format!(
            "<domain type='kvm'><name>web01</name><devices>\
             <disk type='file' device='disk'><source file='{}'/><target dev='vda'/></disk>\
             <disk type='block' device='disk'><source dev='{}'/><target dev='vdb'/></disk>\
             <disk type='network' device='disk'><source protocol='rbd' name='pool/web01'/><target dev='vdc'/></disk>\
             </devices></domain>",
            images.join("system.qcow2").display(),
            vg.join("web01-data").display(),
        );
        let backend = Arc::new(MockBackend::new());
        let manager = VirtManager::new(backend, HypervisorFamily::Kvm, ProfileSettings::default());
        manager.define_xml_str(&xml).await.unwrap();

        let removed = manager.purge("web01", true).await.unwrap();

        assert_eq!(removed, [images.join("system.qcow2"), images.clone()]);
        assert!(!images.exists());
        assert!(vg.join("web01-data").exists());
        assert!(vg.join("other-vm-lv").exists());
        assert!(manager.list_vms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ctrl_alt_del_and_autostart() {
        let backend = Arc::new(MockBackend::new());
        let manager = VirtManager::new(backend.clone(), HypervisorFamily::Kvm, ProfileSettings::default());
        manager.init(InitRequest::new("web01", 1, 512)).await.unwrap();

        manager.ctrl_alt_del("web01").await.unwrap();
        let sent = backend.sent_keys("web01");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].codeset, KEYCODE_SET_LINUX);
        assert_eq!(sent[0].holdtime_ms, 0);
        assert_eq!(sent[0].keys, CTRL_ALT_DEL);

        manager.set_autostart("web01", true).await.unwrap();
        assert!(backend.autostart("web01"));
    }

    #[test]
    fn test_kvm_module_detection() {
        let loaded = "kvm_intel 372736 0 - Live 0x0000000000000000\nkvm 1142784 1 kvm_intel, Live 0x0000000000000000\n";
        assert!(kvm_module_loaded(loaded));
        assert!(!kvm_module_loaded("kvm 1142784 0 - Live 0x0000000000000000\n"));
        assert!(!kvm_module_loaded(""));
    }

    #[tokio::test]
    async fn test_virt_type() {
        let backend = Arc::new(MockBackend::new().with_hypervisor_type("ESX"));
        let manager = VirtManager::new(backend, HypervisorFamily::Esxi, ProfileSettings::default());

        assert_eq!(manager.virt_type().await.unwrap(), "ESX");
        assert!(!manager.is_kvm_hyper().await.unwrap());
    }

    #[tokio::test]
    async fn test_define_xml_path_missing_file() {
        let backend = Arc::new(MockBackend::new());
        let manager = VirtManager::new(backend, HypervisorFamily::Kvm, ProfileSettings::default());

        let result = manager.define_xml_path(Path::new("/nonexistent/domain.xml")).await;
        assert!(matches!(result, Err(HypervisorError::Io(_))));
    }
}
