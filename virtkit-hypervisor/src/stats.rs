//! Runtime statistics: per-VM and fleet summaries built from live counters.
//!
//! Every entry point takes an optional VM filter. Without one the result is
//! a map keyed by VM name; with one it is the record for that VM alone. The
//! two shapes are modelled by [`PerVm`].

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, instrument};

use crate::descriptor::{DomainDescriptor, InterfaceDescriptor};
use crate::error::{HypervisorError, Result};
use crate::family::HypervisorFamily;
use crate::image::{inspect_disks, DiskDetails, ImageInspector};
use crate::traits::Hypervisor;
use crate::types::*;

/// Host memory (MiB) kept back from the free-memory figure.
pub const HOST_MEMORY_RESERVE_MIB: i64 = 256;

/// Factor turning cumulative CPU nanoseconds into the reported percentage.
const CPU_TIME_SCALE: f64 = 1.0e-7;

/// Domain state as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Running,
    Paused,
    Shutdown,
    Crashed,
    Unknown,
}

impl VmState {
    /// Fixed lookup from raw libvirt state codes.
    pub fn from_code(code: u32) -> Self {
        match code {
            state_code::NOSTATE | state_code::RUNNING | state_code::BLOCKED => VmState::Running,
            state_code::PAUSED => VmState::Paused,
            state_code::SHUTDOWN | state_code::SHUTOFF => VmState::Shutdown,
            state_code::CRASHED => VmState::Crashed,
            _ => VmState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Running => "running",
            VmState::Paused => "paused",
            VmState::Shutdown => "shutdown",
            VmState::Crashed => "crashed",
            VmState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a stats query: one VM, or every VM keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PerVm<T> {
    Single(T),
    Fleet(BTreeMap<String, T>),
}

impl<T> PerVm<T> {
    pub fn single(self) -> Option<T> {
        match self {
            PerVm::Single(value) => Some(value),
            PerVm::Fleet(_) => None,
        }
    }

    pub fn fleet(self) -> Option<BTreeMap<String, T>> {
        match self {
            PerVm::Single(_) => None,
            PerVm::Fleet(map) => Some(map),
        }
    }
}

/// CPU time sample of one VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CpuTime {
    /// Cumulative CPU time (nanoseconds)
    pub cputime: u64,
    pub cputime_percent: u64,
}

/// Usage percentage from a cumulative counter; zero when any input is zero.
pub fn cpu_percent(cpu_time_ns: u64, host_cpus: u32, vcpus: u32) -> u64 {
    if cpu_time_ns == 0 || host_cpus == 0 || vcpus == 0 {
        return 0;
    }
    (CPU_TIME_SCALE * cpu_time_ns as f64 / host_cpus as f64 / vcpus as f64).round() as u64
}

/// Combined runtime and descriptor information of one VM.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInfo {
    pub cpu: u32,
    pub cputime: u64,
    /// KiB
    pub max_mem: u64,
    /// KiB
    pub mem: u64,
    pub state: VmState,
    pub disks: BTreeMap<String, DiskDetails>,
    pub graphics: BTreeMap<String, String>,
    pub nics: BTreeMap<String, InterfaceDescriptor>,
}

/// Host-wide summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullInfo {
    pub freecpu: i64,
    pub freemem: i64,
    pub node_info: NodeInfo,
    pub vm_info: BTreeMap<String, VmInfo>,
}

/// Aggregates device counters into VM-level and fleet-level summaries.
///
/// Nothing is cached; every call re-reads descriptors and counters.
pub struct StatsAggregator<'a> {
    backend: &'a dyn Hypervisor,
    inspector: &'a dyn ImageInspector,
    family: HypervisorFamily,
}

impl<'a> StatsAggregator<'a> {
    pub fn new(
        backend: &'a dyn Hypervisor,
        inspector: &'a dyn ImageInspector,
        family: HypervisorFamily,
    ) -> Self {
        Self {
            backend,
            inspector,
            family,
        }
    }

    /// VMs a query covers: the filtered VM, or every known VM.
    async fn targets(&self, vm: Option<&str>) -> Result<Vec<String>> {
        match vm {
            Some(name) => {
                self.backend.ensure_vm(name).await?;
                Ok(vec![name.to_string()])
            }
            None => self.backend.list_vms().await,
        }
    }

    #[instrument(skip(self))]
    pub async fn vm_state(&self, vm: Option<&str>) -> Result<PerVm<VmState>> {
        let mut results = BTreeMap::new();
        for name in self.targets(vm).await? {
            let info = self.backend.domain_info(&name).await?;
            results.insert(name, VmState::from_code(info.state));
        }
        shape(vm, results)
    }

    #[instrument(skip(self))]
    pub async fn vm_info(&self, vm: Option<&str>) -> Result<PerVm<VmInfo>> {
        let mut results = BTreeMap::new();
        for name in self.targets(vm).await? {
            let info = self.single_vm_info(&name).await?;
            results.insert(name, info);
        }
        shape(vm, results)
    }

    async fn single_vm_info(&self, name: &str) -> Result<VmInfo> {
        let raw = self.backend.domain_info(name).await?;
        let descriptor = DomainDescriptor::parse(&self.backend.xml_desc(name).await?)?;

        Ok(VmInfo {
            cpu: raw.vcpus,
            cputime: raw.cpu_time_ns,
            max_mem: raw.max_mem_kib,
            mem: raw.mem_kib,
            state: VmState::from_code(raw.state),
            disks: inspect_disks(self.family, descriptor.disks, self.inspector),
            graphics: descriptor.graphics,
            nics: descriptor.interfaces,
        })
    }

    #[instrument(skip(self))]
    pub async fn vm_cputime(&self, vm: Option<&str>) -> Result<PerVm<CpuTime>> {
        let host_cpus = self.backend.node_info().await?.cpus;
        let mut results = BTreeMap::new();

        for name in self.targets(vm).await? {
            let info = self.backend.domain_info(&name).await?;
            results.insert(
                name,
                CpuTime {
                    cputime: info.cpu_time_ns,
                    cputime_percent: cpu_percent(info.cpu_time_ns, host_cpus, info.vcpus),
                },
            );
        }
        shape(vm, results)
    }

    /// Sum of interface counters per VM, over interfaces with a host device.
    #[instrument(skip(self))]
    pub async fn vm_netstats(&self, vm: Option<&str>) -> Result<PerVm<NetCounters>> {
        let mut results = BTreeMap::new();

        for name in self.targets(vm).await? {
            let descriptor = DomainDescriptor::parse(&self.backend.xml_desc(&name).await?)?;
            let mut total = NetCounters::default();
            for nic in descriptor.interfaces.values() {
                if let Some(device) = &nic.target {
                    total += self.backend.interface_stats(&name, device).await?;
                }
            }
            debug!(vm = %name, rx_bytes = total.rx_bytes, tx_bytes = total.tx_bytes, "Network counters");
            results.insert(name, total);
        }
        shape(vm, results)
    }

    /// Sum of block counters per VM. Inactive VMs have no live block
    /// counters and report zeros.
    #[instrument(skip(self))]
    pub async fn vm_diskstats(&self, vm: Option<&str>) -> Result<PerVm<DiskCounters>> {
        let mut results = BTreeMap::new();

        for name in self.targets(vm).await? {
            let mut total = DiskCounters::default();
            if self.backend.is_active(&name).await? {
                let descriptor = DomainDescriptor::parse(&self.backend.xml_desc(&name).await?)?;
                for device in descriptor.disks.keys() {
                    total += self.backend.block_stats(&name, device).await?;
                }
            } else {
                debug!(vm = %name, "VM inactive, no block counters");
            }
            results.insert(name, total);
        }
        shape(vm, results)
    }

    pub async fn node_info(&self) -> Result<NodeInfo> {
        self.backend.node_info().await
    }

    /// Host memory (MiB) not promised to running VMs.
    pub async fn freemem(&self) -> Result<i64> {
        let mut free = self.backend.node_info().await?.memory_mib as i64 - HOST_MEMORY_RESERVE_MIB;
        for name in self.backend.list_active_vms().await? {
            free -= (self.backend.domain_info(&name).await?.mem_kib / 1024) as i64;
        }
        Ok(free)
    }

    /// Host CPUs not assigned to running VMs.
    pub async fn freecpu(&self) -> Result<i64> {
        let mut free = self.backend.node_info().await?.cpus as i64;
        for name in self.backend.list_active_vms().await? {
            free -= self.backend.domain_info(&name).await?.vcpus as i64;
        }
        Ok(free)
    }

    #[instrument(skip(self))]
    pub async fn full_info(&self) -> Result<FullInfo> {
        let vm_info = self
            .vm_info(None)
            .await?
            .fleet()
            .ok_or_else(|| HypervisorError::Internal("expected per-VM map".to_string()))?;

        Ok(FullInfo {
            freecpu: self.freecpu().await?,
            freemem: self.freemem().await?,
            node_info: self.node_info().await?,
            vm_info,
        })
    }
}

fn shape<T>(vm: Option<&str>, mut results: BTreeMap<String, T>) -> Result<PerVm<T>> {
    match vm {
        None => Ok(PerVm::Fleet(results)),
        Some(name) => results
            .remove(name)
            .map(PerVm::Single)
            .ok_or_else(|| HypervisorError::VmNotFound(name.to_string())),
    }
}
