//! Type definitions for canonical device specs, requests and runtime info.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;

use crate::error::HypervisorError;
use crate::family::HypervisorFamily;

// =============================================================================
// DEVICE MODELS
// =============================================================================

/// Disk bus type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    Virtio,
    Scsi,
    Sata,
    Ide,
}

impl DiskBus {
    /// Get the libvirt bus name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "virtio",
            DiskBus::Scsi => "scsi",
            DiskBus::Sata => "sata",
            DiskBus::Ide => "ide",
        }
    }
}

impl FromStr for DiskBus {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "virtio" => Ok(DiskBus::Virtio),
            "scsi" => Ok(DiskBus::Scsi),
            "sata" => Ok(DiskBus::Sata),
            "ide" => Ok(DiskBus::Ide),
            other => Err(HypervisorError::Validation(format!("unknown disk model '{}'", other))),
        }
    }
}

/// Disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vmdk,
}

impl DiskFormat {
    /// Get the format string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vmdk => "vmdk",
        }
    }
}

impl FromStr for DiskFormat {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qcow2" => Ok(DiskFormat::Qcow2),
            "raw" => Ok(DiskFormat::Raw),
            "vmdk" => Ok(DiskFormat::Vmdk),
            other => Err(HypervisorError::Validation(format!("unknown disk format '{}'", other))),
        }
    }
}

/// Network interface model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicModel {
    Virtio,
    E1000,
    E1000e,
    Rtl8139,
    Vmxnet3,
}

impl NicModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicModel::Virtio => "virtio",
            NicModel::E1000 => "e1000",
            NicModel::E1000e => "e1000e",
            NicModel::Rtl8139 => "rtl8139",
            NicModel::Vmxnet3 => "vmxnet3",
        }
    }
}

impl FromStr for NicModel {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "virtio" => Ok(NicModel::Virtio),
            "e1000" => Ok(NicModel::E1000),
            "e1000e" => Ok(NicModel::E1000e),
            "rtl8139" => Ok(NicModel::Rtl8139),
            "vmxnet3" => Ok(NicModel::Vmxnet3),
            other => Err(HypervisorError::Validation(format!("unknown nic model '{}'", other))),
        }
    }
}

/// How an interface is attached to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Bridge,
    Network,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Bridge => "bridge",
            ConnectionKind::Network => "network",
        }
    }
}

impl FromStr for ConnectionKind {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bridge" => Ok(ConnectionKind::Bridge),
            "network" => Ok(ConnectionKind::Network),
            other => Err(HypervisorError::Validation(format!("unknown connection type '{}'", other))),
        }
    }
}

// =============================================================================
// MAC ADDRESS
// =============================================================================

/// A 6-octet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Generate a random MAC in the QEMU `52:54:00` range.
    ///
    /// 0x52 carries the locally administered bit and a clear multicast bit.
    pub fn generate() -> Self {
        let bytes: [u8; 3] = rand::random();
        Self([0x52, 0x54, 0x00, bytes[0] & 0x7f, bytes[1], bytes[2]])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HypervisorError::Validation(format!("invalid MAC address '{}'", s));

        let mut octets = [0u8; 6];
        let mut parts = s.split(|c| c == ':' || c == '-');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = HypervisorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

// =============================================================================
// CANONICAL SPECS
// =============================================================================

/// Fully resolved network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    /// Device name from the profile (e.g. "eth0")
    pub name: String,
    /// Connection kind
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    /// Bridge or network name
    pub source: String,
    /// NIC model
    pub model: NicModel,
    /// MAC address
    pub mac: MacAddress,
}

/// Fully resolved disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Disk name from the profile (e.g. "system")
    pub name: String,
    /// Size in MB, always > 0
    pub size_mb: u64,
    /// Image format
    pub format: DiskFormat,
    /// Bus model
    pub model: DiskBus,
    /// Storage pool location (directory or "[datastore] " prefix)
    pub pool: String,
    /// Source image cloned into the new volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl DiskSpec {
    /// Image file name, `<name>.<format>`.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, self.format.as_str())
    }

    /// Backing file location for this disk of `vm_name`.
    ///
    /// Shared by the domain and the volume documents.
    pub fn source_path(&self, vm_name: &str) -> String {
        let relative = format!("{}/{}", vm_name, self.file_name());
        if self.pool.is_empty() || self.pool.ends_with('/') || self.pool.ends_with(' ') {
            format!("{}{}", self.pool, relative)
        } else {
            format!("{}/{}", self.pool, relative)
        }
    }
}

/// Boot device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    Hd,
    Cdrom,
    Network,
    Fd,
}

impl BootDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootDevice::Hd => "hd",
            BootDevice::Cdrom => "cdrom",
            BootDevice::Network => "network",
            BootDevice::Fd => "fd",
        }
    }
}

impl FromStr for BootDevice {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hd" => Ok(BootDevice::Hd),
            "cdrom" => Ok(BootDevice::Cdrom),
            "network" => Ok(BootDevice::Network),
            "fd" => Ok(BootDevice::Fd),
            other => Err(HypervisorError::Validation(format!("unknown boot device '{}'", other))),
        }
    }
}

/// Serial/console transport request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialOptions {
    /// Transport kind looked up in the serial template registry ("pty", "tcp")
    pub kind: String,
    /// Listening port for the tcp (telnet) transport
    pub telnet_port: Option<u16>,
    /// Also expose the serial device as the domain console
    pub console: bool,
}

impl SerialOptions {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            telnet_port: None,
            console: true,
        }
    }
}

/// Everything needed to render a domain definition document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRequest {
    /// VM name
    pub name: String,
    /// Number of virtual CPUs
    pub vcpus: u32,
    /// Memory in MB
    pub memory_mb: u64,
    /// Disks in target order
    pub disks: Vec<DiskSpec>,
    /// Interfaces in document order
    pub interfaces: Vec<InterfaceSpec>,
    /// Hypervisor family the document is rendered for
    pub family: HypervisorFamily,
    /// Explicit boot order (defaults to a single hard-disk entry)
    pub boot_devices: Option<Vec<BootDevice>>,
    /// Optional serial/console section
    pub serial: Option<SerialOptions>,
}

impl DomainRequest {
    pub fn new(name: impl Into<String>, family: HypervisorFamily) -> Self {
        Self {
            name: name.into(),
            vcpus: 1,
            memory_mb: 512,
            disks: Vec::new(),
            interfaces: Vec::new(),
            family,
            boot_devices: None,
            serial: None,
        }
    }

    pub fn with_cpu(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    pub fn with_memory(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_disk(mut self, disk: DiskSpec) -> Self {
        self.disks.push(disk);
        self
    }

    pub fn with_interface(mut self, interface: InterfaceSpec) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn with_boot_devices(mut self, devices: Vec<BootDevice>) -> Self {
        self.boot_devices = Some(devices);
        self
    }

    pub fn with_serial(mut self, serial: SerialOptions) -> Self {
        self.serial = Some(serial);
        self
    }
}

// =============================================================================
// RUNTIME INFO
// =============================================================================

/// Raw domain state codes as reported by libvirt.
pub mod state_code {
    pub const NOSTATE: u32 = 0;
    pub const RUNNING: u32 = 1;
    pub const BLOCKED: u32 = 2;
    pub const PAUSED: u32 = 3;
    pub const SHUTDOWN: u32 = 4;
    pub const SHUTOFF: u32 = 5;
    pub const CRASHED: u32 = 6;
}

/// Raw domain information as reported by the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    /// Raw state code
    pub state: u32,
    /// Maximum memory (KiB)
    pub max_mem_kib: u64,
    /// Current memory (KiB)
    pub mem_kib: u64,
    /// Number of virtual CPUs
    pub vcpus: u32,
    /// Cumulative CPU time (nanoseconds)
    pub cpu_time_ns: u64,
}

/// Host information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(rename = "cpumodel")]
    pub cpu_model: String,
    /// Physical memory (MiB)
    #[serde(rename = "phymemory")]
    pub memory_mib: u64,
    pub cpus: u32,
    #[serde(rename = "cpumhz")]
    pub mhz: u32,
    #[serde(rename = "numanodes")]
    pub numa_nodes: u32,
    pub sockets: u32,
    #[serde(rename = "cpucores")]
    pub cores: u32,
    #[serde(rename = "cputhreads")]
    pub threads: u32,
}

/// Flags for memory and vCPU changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceFlags {
    /// Change the maximum instead of the current value
    pub maximum: bool,
    /// Also change the persisted configuration
    pub persist_config: bool,
}

impl ResourceFlags {
    /// Current value of the running instance only.
    pub fn current() -> Self {
        Self::default()
    }

    /// Maximum value, optionally persisted.
    pub fn maximum(persist_config: bool) -> Self {
        Self {
            maximum: true,
            persist_config,
        }
    }
}

/// Combined network counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetCounters {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errs: u64,
    pub rx_drop: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errs: u64,
    pub tx_drop: u64,
}

impl AddAssign for NetCounters {
    fn add_assign(&mut self, other: Self) {
        self.rx_bytes = self.rx_bytes.saturating_add(other.rx_bytes);
        self.rx_packets = self.rx_packets.saturating_add(other.rx_packets);
        self.rx_errs = self.rx_errs.saturating_add(other.rx_errs);
        self.rx_drop = self.rx_drop.saturating_add(other.rx_drop);
        self.tx_bytes = self.tx_bytes.saturating_add(other.tx_bytes);
        self.tx_packets = self.tx_packets.saturating_add(other.tx_packets);
        self.tx_errs = self.tx_errs.saturating_add(other.tx_errs);
        self.tx_drop = self.tx_drop.saturating_add(other.tx_drop);
    }
}

/// Combined block device counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskCounters {
    pub rd_req: u64,
    pub rd_bytes: u64,
    pub wr_req: u64,
    pub wr_bytes: u64,
    pub errs: u64,
}

impl AddAssign for DiskCounters {
    fn add_assign(&mut self, other: Self) {
        self.rd_req = self.rd_req.saturating_add(other.rd_req);
        self.rd_bytes = self.rd_bytes.saturating_add(other.rd_bytes);
        self.wr_req = self.wr_req.saturating_add(other.wr_req);
        self.wr_bytes = self.wr_bytes.saturating_add(other.wr_bytes);
        self.errs = self.errs.saturating_add(other.errs);
    }
}
