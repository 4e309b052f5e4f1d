//! Command-line argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// virtkit - Profile-driven virtual machine management
#[derive(Parser, Debug)]
#[command(name = "virtkit")]
#[command(about = "virtkit - Profile-driven virtual machine management")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Hypervisor family (kvm, qemu, esxi)
    #[arg(long, env = "VIRTKIT_HYPERVISOR", global = true)]
    pub hypervisor: Option<String>,

    /// Connection URI, or the host name of an ESXi target
    #[arg(long, env = "VIRTKIT_CONNECTION", global = true)]
    pub connection: Option<String>,

    /// Enable development mode (in-memory mock hypervisor)
    #[arg(long, global = true)]
    pub dev: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Arguments naming a single VM.
#[derive(clap::Args, Debug, Clone)]
pub struct VmArg {
    /// VM name
    pub vm: String,
}

/// Arguments naming one VM or, when omitted, every VM.
#[derive(clap::Args, Debug, Clone)]
pub struct OptionalVmArg {
    /// VM name (all VMs when omitted)
    pub vm: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    // ========================================================================
    // Provisioning
    // ========================================================================
    /// Define a VM from profiles or a template image and start it
    Init {
        /// VM name
        name: String,

        /// Number of vCPUs
        #[arg(long)]
        cpu: u32,

        /// Memory in MB
        #[arg(long)]
        mem: u64,

        /// Template image copied in as the system disk
        #[arg(long)]
        image: Option<PathBuf>,

        /// Network interface profile
        #[arg(long, default_value = "default")]
        nic: String,

        /// Disk profile (ignored with --image)
        #[arg(long, default_value = "default")]
        disk: String,

        /// MAC override as <device>=<mac>, e.g. eth0=52:54:00:12:34:56
        #[arg(long = "mac", value_name = "DEVICE=MAC")]
        macs: Vec<String>,

        /// Boot device order (hd, cdrom, network, fd)
        #[arg(long = "boot", value_name = "DEVICE")]
        boot_devices: Vec<String>,

        /// Serial console type (pty, tcp)
        #[arg(long)]
        serial: Option<String>,

        /// Telnet port of a tcp serial console
        #[arg(long)]
        telnet_port: Option<u16>,

        /// Omit the console element of the serial device
        #[arg(long, requires = "serial")]
        no_console: bool,

        /// Seed the copied template image
        #[arg(long)]
        seed: bool,

        /// Do not start the VM after defining it
        #[arg(long)]
        no_start: bool,
    },

    /// Define a VM from a domain document
    Define {
        path: PathBuf,
    },

    /// Create a transient VM from a domain document
    Create {
        path: PathBuf,
    },

    /// Create a storage volume from a volume document
    DefineVol {
        path: PathBuf,
    },

    /// Remove a VM definition
    Undefine(VmArg),

    /// Destroy a VM, delete its disk images and undefine it
    Purge {
        vm: String,

        /// Also remove the directories that held the images
        #[arg(long)]
        dirs: bool,
    },

    // ========================================================================
    // Listing & lifecycle
    // ========================================================================
    /// List VMs
    List {
        /// Only running VMs
        #[arg(long, conflicts_with = "inactive")]
        active: bool,

        /// Only defined, stopped VMs
        #[arg(long)]
        inactive: bool,
    },

    Start(VmArg),

    /// Hard stop
    Stop(VmArg),

    Shutdown(VmArg),

    Pause(VmArg),

    Resume(VmArg),

    Reboot(VmArg),

    Reset(VmArg),

    /// Send Ctrl+Alt+Del
    CtrlAltDel(VmArg),

    /// Send Linux key codes
    SendKey {
        vm: String,
        #[arg(required = true)]
        keys: Vec<u32>,
    },

    /// Enable or disable starting the VM with the host
    Autostart {
        vm: String,

        /// Disable instead of enable
        #[arg(long)]
        off: bool,
    },

    /// Change the memory (MB) of a shut down VM
    Setmem {
        vm: String,
        memory_mb: u64,

        /// Persist the new maximum in the VM configuration
        #[arg(long)]
        persist: bool,
    },

    /// Change the vCPU count of a shut down VM
    Setvcpus {
        vm: String,
        vcpus: u32,

        /// Persist the new maximum in the VM configuration
        #[arg(long)]
        persist: bool,
    },

    // ========================================================================
    // Introspection
    // ========================================================================
    /// Combined runtime and device information
    Info(OptionalVmArg),

    State(OptionalVmArg),

    Cputime(OptionalVmArg),

    /// Network counters summed over interfaces
    Netstats(OptionalVmArg),

    /// Block counters summed over disks
    Diskstats(OptionalVmArg),

    Xml(VmArg),

    Nics(VmArg),

    Macs(VmArg),

    Graphics(VmArg),

    Disks(VmArg),

    /// Resolved nic and disk profiles
    Profiles {
        /// Family to resolve for (the configured one by default)
        #[arg(long = "for")]
        family: Option<String>,
    },

    NodeInfo,

    /// Connection driver name and whether this host is a KVM hypervisor
    VirtType,

    /// Memory (MiB) left for new VMs
    Freemem,

    /// vCPUs left for new VMs
    Freecpu,

    /// Host summary with every VM
    FullInfo,
}
