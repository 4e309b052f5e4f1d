//! Mock hypervisor backend for testing and development.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::traits::Hypervisor;
use crate::types::*;
use crate::xml::Element;

/// Mock hypervisor backend for testing.
///
/// This backend simulates the control plane in memory without requiring
/// an actual hypervisor. Useful for:
/// - Unit and integration testing
/// - Development without libvirt installed (`--dev`)
///
/// Runtime counters that were never configured read as zero. Any trait
/// operation can be made to fail with [`MockBackend::fail_operation`].
pub struct MockBackend {
    domains: RwLock<HashMap<String, MockDomain>>,
    volumes: RwLock<HashMap<String, Vec<String>>>,
    failures: RwLock<HashSet<String>>,
    node: NodeInfo,
    hypervisor_type: String,
}

#[derive(Debug, Clone)]
struct MockDomain {
    xml: String,
    state: u32,
    persistent: bool,
    autostart: bool,
    max_mem_kib: u64,
    mem_kib: u64,
    max_vcpus: u32,
    vcpus: u32,
    cpu_time_ns: u64,
    interface_stats: HashMap<String, NetCounters>,
    block_stats: HashMap<String, DiskCounters>,
    sent_keys: Vec<SentKeys>,
}

/// One `send_key` call recorded by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentKeys {
    pub codeset: u32,
    pub holdtime_ms: u32,
    pub keys: Vec<u32>,
}

impl MockDomain {
    fn from_xml(xml: &str, state: u32, persistent: bool) -> Result<(String, Self)> {
        let doc = Element::parse(xml)?;
        let name = doc
            .find("name")
            .map(Element::text_content)
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| HypervisorError::XmlError("domain document has no name".to_string()))?;

        let mem_kib = match doc.find("memory") {
            Some(memory) => memory_kib(memory)?,
            None => 0,
        };
        let vcpus = match doc.find("vcpu") {
            Some(vcpu) => vcpu.text_content().trim().parse().map_err(|_| {
                HypervisorError::XmlError(format!("invalid vcpu count in domain {}", name))
            })?,
            None => 1,
        };

        Ok((
            name,
            Self {
                xml: xml.to_string(),
                state,
                persistent,
                autostart: false,
                max_mem_kib: mem_kib,
                mem_kib,
                max_vcpus: vcpus,
                vcpus,
                cpu_time_ns: 0,
                interface_stats: HashMap::new(),
                block_stats: HashMap::new(),
                sent_keys: Vec::new(),
            },
        ))
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            state_code::RUNNING | state_code::BLOCKED | state_code::PAUSED
        )
    }

    fn require_active(&self, name: &str) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(HypervisorError::InvalidState(format!("domain {} is not running", name)))
        }
    }
}

fn memory_kib(memory: &Element) -> Result<u64> {
    let value: u64 = memory
        .text_content()
        .trim()
        .parse()
        .map_err(|_| HypervisorError::XmlError("invalid memory size".to_string()))?;
    let factor = match memory.get_attr("unit").unwrap_or("KiB") {
        "b" | "bytes" => return Ok(value / 1024),
        "KiB" | "k" => 1,
        "MiB" | "M" => 1024,
        "GiB" | "G" => 1024 * 1024,
        other => {
            return Err(HypervisorError::XmlError(format!("unsupported memory unit '{}'", other)))
        }
    };
    value
        .checked_mul(factor)
        .ok_or_else(|| HypervisorError::XmlError(format!("memory size {} is out of range", value)))
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        Self {
            domains: RwLock::new(HashMap::new()),
            volumes: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashSet::new()),
            node: NodeInfo {
                cpu_model: "x86_64".to_string(),
                memory_mib: 16384,
                cpus: 8,
                mhz: 2400,
                numa_nodes: 1,
                sockets: 1,
                cores: 4,
                threads: 2,
            },
            hypervisor_type: "QEMU".to_string(),
        }
    }

    /// Replace the reported connection driver name.
    pub fn with_hypervisor_type(mut self, hypervisor_type: impl Into<String>) -> Self {
        self.hypervisor_type = hypervisor_type.into();
        self
    }

    /// Replace the reported host information.
    pub fn with_node_info(mut self, node: NodeInfo) -> Self {
        self.node = node;
        self
    }

    /// Make every later call of `operation` (a trait method name) fail.
    pub fn fail_operation(&self, operation: &str) {
        if let Ok(mut failures) = self.failures.write() {
            failures.insert(operation.to_string());
        }
    }

    /// Override the raw state code of a domain.
    pub fn set_state(&self, name: &str, state: u32) -> Result<()> {
        self.update(name, |domain| domain.state = state)
    }

    pub fn set_cpu_time(&self, name: &str, cpu_time_ns: u64) -> Result<()> {
        self.update(name, |domain| domain.cpu_time_ns = cpu_time_ns)
    }

    pub fn set_interface_stats(&self, name: &str, device: &str, counters: NetCounters) -> Result<()> {
        self.update(name, |domain| {
            domain.interface_stats.insert(device.to_string(), counters);
        })
    }

    pub fn set_block_stats(&self, name: &str, device: &str, counters: DiskCounters) -> Result<()> {
        self.update(name, |domain| {
            domain.block_stats.insert(device.to_string(), counters);
        })
    }

    /// Replace the stored document of a domain, e.g. with a live descriptor.
    pub fn set_xml(&self, name: &str, xml: &str) -> Result<()> {
        self.update(name, |domain| domain.xml = xml.to_string())
    }

    /// Volume names created in `pool`, in creation order.
    pub fn volumes(&self, pool: &str) -> Vec<String> {
        self.volumes
            .read()
            .map(|volumes| volumes.get(pool).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Key sequences sent to a domain, oldest first.
    pub fn sent_keys(&self, name: &str) -> Vec<SentKeys> {
        self.read()
            .ok()
            .and_then(|domains| domains.get(name).map(|d| d.sent_keys.clone()))
            .unwrap_or_default()
    }

    pub fn autostart(&self, name: &str) -> bool {
        self.read()
            .ok()
            .and_then(|domains| domains.get(name).map(|d| d.autostart))
            .unwrap_or(false)
    }

    fn check_failure(&self, operation: &str) -> Result<()> {
        let failures = self
            .failures
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        if failures.contains(operation) {
            return Err(HypervisorError::OperationFailed(format!(
                "injected failure in {}",
                operation
            )));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, MockDomain>>> {
        self.domains
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, MockDomain>>> {
        self.domains
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    fn update<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut MockDomain),
    {
        self.with_domain_mut(name, |domain| {
            f(domain);
            Ok(())
        })
    }

    fn with_domain<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(&MockDomain) -> Result<T>,
    {
        let domains = self.read()?;
        let domain = domains
            .get(name)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))?;
        f(domain)
    }

    fn with_domain_mut<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut MockDomain) -> Result<T>,
    {
        let mut domains = self.write()?;
        let domain = domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))?;
        f(domain)
    }

    fn list_where(&self, active: bool) -> Result<Vec<String>> {
        let domains = self.read()?;
        let mut names: Vec<String> = domains
            .iter()
            .filter(|(_, d)| d.is_active() == active)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for MockBackend {
    async fn health_check(&self) -> Result<bool> {
        self.check_failure("health_check")?;
        Ok(true)
    }

    async fn node_info(&self) -> Result<NodeInfo> {
        self.check_failure("node_info")?;
        Ok(self.node.clone())
    }

    async fn hypervisor_type(&self) -> Result<String> {
        self.check_failure("hypervisor_type")?;
        Ok(self.hypervisor_type.clone())
    }

    async fn list_active_vms(&self) -> Result<Vec<String>> {
        self.check_failure("list_active_vms")?;
        self.list_where(true)
    }

    async fn list_inactive_vms(&self) -> Result<Vec<String>> {
        self.check_failure("list_inactive_vms")?;
        self.list_where(false)
    }

    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<String> {
        self.check_failure("define_domain")?;
        let (name, defined) = MockDomain::from_xml(xml, state_code::SHUTOFF, true)?;

        let mut domains = self.write()?;
        match domains.get_mut(&name) {
            Some(existing) => {
                existing.xml = defined.xml;
                existing.persistent = true;
                debug!(vm = %name, "Redefined mock domain");
            }
            None => {
                domains.insert(name.clone(), defined);
                info!(vm = %name, "Mock domain defined");
            }
        }
        Ok(name)
    }

    #[instrument(skip(self, xml))]
    async fn create_domain(&self, xml: &str) -> Result<String> {
        self.check_failure("create_domain")?;
        let (name, created) = MockDomain::from_xml(xml, state_code::RUNNING, false)?;

        let mut domains = self.write()?;
        if domains.get(&name).map_or(false, MockDomain::is_active) {
            return Err(HypervisorError::OperationFailed(format!(
                "domain {} is already running",
                name
            )));
        }
        domains.insert(name.clone(), created);
        info!(vm = %name, "Mock transient domain created");
        Ok(name)
    }

    #[instrument(skip(self, xml))]
    async fn define_volume(&self, pool: &str, xml: &str) -> Result<String> {
        self.check_failure("define_volume")?;
        let doc = Element::parse(xml)?;
        let name = doc
            .find("name")
            .map(Element::text_content)
            .ok_or_else(|| HypervisorError::XmlError("volume document has no name".to_string()))?;
        let path = doc
            .find("target")
            .and_then(|t| t.find("path"))
            .map(Element::text_content)
            .unwrap_or_else(|| name.clone());

        let mut volumes = self
            .volumes
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        let pool_volumes = volumes.entry(pool.to_string()).or_default();
        if pool_volumes.contains(&name) {
            return Err(HypervisorError::OperationFailed(format!(
                "volume {} already exists in pool {}",
                name, pool
            )));
        }
        pool_volumes.push(name.clone());

        info!(volume = %name, "Mock volume created");
        Ok(path)
    }

    #[instrument(skip(self))]
    async fn undefine(&self, name: &str) -> Result<()> {
        self.check_failure("undefine")?;
        let mut domains = self.write()?;
        let domain = domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))?;

        if domain.is_active() {
            domain.persistent = false;
        } else {
            domains.remove(name);
        }
        info!("Mock domain undefined");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start(&self, name: &str) -> Result<()> {
        self.check_failure("start")?;
        self.with_domain_mut(name, |domain| {
            if domain.is_active() {
                return Err(HypervisorError::InvalidState(format!(
                    "domain {} is already running",
                    name
                )));
            }
            domain.state = state_code::RUNNING;
            Ok(())
        })?;
        info!("Mock domain started");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn shutdown(&self, name: &str) -> Result<()> {
        self.check_failure("shutdown")?;
        self.power_off(name)
    }

    #[instrument(skip(self))]
    async fn destroy(&self, name: &str) -> Result<()> {
        self.check_failure("destroy")?;
        self.power_off(name)
    }

    #[instrument(skip(self))]
    async fn suspend(&self, name: &str) -> Result<()> {
        self.check_failure("suspend")?;
        self.with_domain_mut(name, |domain| {
            if domain.state != state_code::RUNNING {
                return Err(HypervisorError::InvalidState(format!("domain {} is not running", name)));
            }
            domain.state = state_code::PAUSED;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    async fn resume(&self, name: &str) -> Result<()> {
        self.check_failure("resume")?;
        self.with_domain_mut(name, |domain| {
            if domain.state != state_code::PAUSED {
                return Err(HypervisorError::InvalidState(format!("domain {} is not paused", name)));
            }
            domain.state = state_code::RUNNING;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    async fn reboot(&self, name: &str) -> Result<()> {
        self.check_failure("reboot")?;
        self.with_domain(name, |domain| domain.require_active(name))
    }

    #[instrument(skip(self))]
    async fn reset(&self, name: &str) -> Result<()> {
        self.check_failure("reset")?;
        self.with_domain(name, |domain| domain.require_active(name))
    }

    #[instrument(skip(self, keys))]
    async fn send_key(&self, name: &str, codeset: u32, holdtime_ms: u32, keys: &[u32]) -> Result<()> {
        self.check_failure("send_key")?;
        self.with_domain_mut(name, |domain| {
            domain.require_active(name)?;
            domain.sent_keys.push(SentKeys {
                codeset,
                holdtime_ms,
                keys: keys.to_vec(),
            });
            Ok(())
        })?;
        debug!(keys = ?keys, "Mock keys sent");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_autostart(&self, name: &str, enabled: bool) -> Result<()> {
        self.check_failure("set_autostart")?;
        self.with_domain_mut(name, |domain| {
            if !domain.persistent {
                return Err(HypervisorError::OperationFailed(format!(
                    "cannot set autostart for transient domain {}",
                    name
                )));
            }
            domain.autostart = enabled;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    async fn set_memory(&self, name: &str, kib: u64, flags: ResourceFlags) -> Result<()> {
        self.check_failure("set_memory")?;
        self.with_domain_mut(name, |domain| {
            if flags.maximum {
                domain.max_mem_kib = kib;
                domain.mem_kib = domain.mem_kib.min(kib);
            } else if kib > domain.max_mem_kib {
                return Err(HypervisorError::OperationFailed(format!(
                    "cannot set memory higher than max memory ({} KiB)",
                    domain.max_mem_kib
                )));
            } else {
                domain.mem_kib = kib;
            }
            Ok(())
        })
    }

    #[instrument(skip(self))]
    async fn set_vcpus(&self, name: &str, count: u32, flags: ResourceFlags) -> Result<()> {
        self.check_failure("set_vcpus")?;
        if count == 0 {
            return Err(HypervisorError::OperationFailed("vcpu count must be positive".to_string()));
        }
        self.with_domain_mut(name, |domain| {
            if flags.maximum {
                domain.max_vcpus = count;
                domain.vcpus = domain.vcpus.min(count);
            } else if count > domain.max_vcpus {
                return Err(HypervisorError::OperationFailed(format!(
                    "requested vcpus is greater than max allowable vcpus ({})",
                    domain.max_vcpus
                )));
            } else {
                domain.vcpus = count;
            }
            Ok(())
        })
    }

    async fn xml_desc(&self, name: &str) -> Result<String> {
        self.check_failure("xml_desc")?;
        self.with_domain(name, |domain| Ok(domain.xml.clone()))
    }

    async fn domain_info(&self, name: &str) -> Result<DomainInfo> {
        self.check_failure("domain_info")?;
        self.with_domain(name, |domain| {
            Ok(DomainInfo {
                state: domain.state,
                max_mem_kib: domain.max_mem_kib,
                mem_kib: domain.mem_kib,
                vcpus: domain.vcpus,
                cpu_time_ns: domain.cpu_time_ns,
            })
        })
    }

    async fn is_active(&self, name: &str) -> Result<bool> {
        self.check_failure("is_active")?;
        self.with_domain(name, |domain| Ok(domain.is_active()))
    }

    async fn interface_stats(&self, name: &str, device: &str) -> Result<NetCounters> {
        self.check_failure("interface_stats")?;
        self.with_domain(name, |domain| {
            domain.require_active(name)?;
            Ok(domain.interface_stats.get(device).copied().unwrap_or_default())
        })
    }

    async fn block_stats(&self, name: &str, device: &str) -> Result<DiskCounters> {
        self.check_failure("block_stats")?;
        self.with_domain(name, |domain| {
            domain.require_active(name)?;
            Ok(domain.block_stats.get(device).copied().unwrap_or_default())
        })
    }
}

impl MockBackend {
    fn power_off(&self, name: &str) -> Result<()> {
        let mut domains = self.write()?;
        let domain = domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string()))?;
        domain.require_active(name)?;

        if domain.persistent {
            domain.state = state_code::SHUTOFF;
        } else {
            domains.remove(name);
        }
        info!(vm = %name, "Mock domain stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = "<domain type='kvm'><name>test-vm</name><vcpu>2</vcpu>\
                          <memory unit='MiB'>1024</memory></domain>";

    #[tokio::test]
    async fn test_define_domain() {
        let backend = MockBackend::new();

        let name = backend.define_domain(DOMAIN).await.unwrap();
        assert_eq!(name, "test-vm");
        assert_eq!(backend.list_inactive_vms().await.unwrap(), ["test-vm"]);
        assert!(backend.list_active_vms().await.unwrap().is_empty());

        let info = backend.domain_info("test-vm").await.unwrap();
        assert_eq!(info.mem_kib, 1024 * 1024);
        assert_eq!(info.vcpus, 2);
        assert_eq!(info.state, state_code::SHUTOFF);
    }

    #[tokio::test]
    async fn test_vm_lifecycle() {
        let backend = MockBackend::new();
        backend.define_domain(DOMAIN).await.unwrap();

        backend.start("test-vm").await.unwrap();
        assert!(backend.is_active("test-vm").await.unwrap());
        assert!(matches!(
            backend.start("test-vm").await,
            Err(HypervisorError::InvalidState(_))
        ));

        backend.suspend("test-vm").await.unwrap();
        assert_eq!(backend.domain_info("test-vm").await.unwrap().state, state_code::PAUSED);

        backend.resume("test-vm").await.unwrap();
        backend.reboot("test-vm").await.unwrap();

        backend.destroy("test-vm").await.unwrap();
        assert!(!backend.is_active("test-vm").await.unwrap());

        backend.undefine("test-vm").await.unwrap();
        assert!(matches!(
            backend.ensure_vm("test-vm").await,
            Err(HypervisorError::VmNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transient_domain_disappears_on_destroy() {
        let backend = MockBackend::new();
        backend.create_domain(DOMAIN).await.unwrap();
        assert_eq!(backend.list_active_vms().await.unwrap(), ["test-vm"]);

        backend.destroy("test-vm").await.unwrap();
        assert!(backend.list_vms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resource_flags() {
        let backend = MockBackend::new();
        backend.define_domain(DOMAIN).await.unwrap();

        assert!(backend
            .set_memory("test-vm", 4 * 1024 * 1024, ResourceFlags::current())
            .await
            .is_err());

        backend
            .set_memory("test-vm", 4 * 1024 * 1024, ResourceFlags::maximum(true))
            .await
            .unwrap();
        backend
            .set_memory("test-vm", 2 * 1024 * 1024, ResourceFlags::current())
            .await
            .unwrap();

        let info = backend.domain_info("test-vm").await.unwrap();
        assert_eq!(info.max_mem_kib, 4 * 1024 * 1024);
        assert_eq!(info.mem_kib, 2 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_counters_require_running_domain() {
        let backend = MockBackend::new();
        backend.define_domain(DOMAIN).await.unwrap();
        assert!(backend.block_stats("test-vm", "vda").await.is_err());

        backend.start("test-vm").await.unwrap();
        let counters = DiskCounters { rd_req: 3, ..Default::default() };
        backend.set_block_stats("test-vm", "vda", counters).unwrap();
        assert_eq!(backend.block_stats("test-vm", "vda").await.unwrap(), counters);
        assert_eq!(
            backend.block_stats("test-vm", "vdb").await.unwrap(),
            DiskCounters::default()
        );
    }

    #[tokio::test]
    async fn test_memory_overflow_is_an_error() {
        let backend = MockBackend::new();
        let xml = format!(
            "<domain><name>huge</name><memory unit='GiB'>{}</memory></domain>",
            u64::MAX / 2
        );
        assert!(matches!(
            backend.define_domain(&xml).await,
            Err(HypervisorError::XmlError(_))
        ));
        assert!(backend.list_vms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_operation() {
        let backend = MockBackend::new();
        backend.fail_operation("define_domain");
        assert!(matches!(
            backend.define_domain(DOMAIN).await,
            Err(HypervisorError::OperationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_volume_rejected() {
        let backend = MockBackend::new();
        let xml = "<volume><name>vm/system.qcow2</name><target><path>/img/vm/system.qcow2</path></target></volume>";

        let path = backend.define_volume("default", xml).await.unwrap();
        assert_eq!(path, "/img/vm/system.qcow2");
        assert!(backend.define_volume("default", xml).await.is_err());
        assert_eq!(backend.volumes("default"), ["vm/system.qcow2"]);
    }
}
