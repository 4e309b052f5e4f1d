//! Core control-plane abstraction trait.

use async_trait::async_trait;

use crate::error::{HypervisorError, Result};
use crate::types::*;

/// Key codeset used by libvirt for Linux input event codes.
pub const KEYCODE_SET_LINUX: u32 = 0;

/// Core control-plane abstraction trait.
///
/// This trait defines the interface that all backends must implement.
/// Domains are addressed by name; every call maps onto one control-plane
/// request and is serialized by the control plane itself.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // =========================================================================
    // Connection & Host
    // =========================================================================

    /// Check if the control-plane connection is healthy.
    async fn health_check(&self) -> Result<bool>;

    /// Get host information.
    async fn node_info(&self) -> Result<NodeInfo>;

    /// Driver name of the connection (e.g. "QEMU", "ESX").
    async fn hypervisor_type(&self) -> Result<String>;

    // =========================================================================
    // Listing
    // =========================================================================

    /// Names of running (and paused) domains.
    async fn list_active_vms(&self) -> Result<Vec<String>>;

    /// Names of defined but inactive domains.
    async fn list_inactive_vms(&self) -> Result<Vec<String>>;

    /// Active followed by inactive domains.
    async fn list_vms(&self) -> Result<Vec<String>> {
        let mut vms = self.list_active_vms().await?;
        vms.extend(self.list_inactive_vms().await?);
        Ok(vms)
    }

    /// Fail with `VmNotFound` unless the domain is active or defined.
    async fn ensure_vm(&self, name: &str) -> Result<()> {
        if self.list_vms().await?.iter().any(|vm| vm == name) {
            Ok(())
        } else {
            Err(HypervisorError::VmNotFound(name.to_string()))
        }
    }

    // =========================================================================
    // Definition
    // =========================================================================

    /// Define a persistent domain from a document. Returns the domain name.
    async fn define_domain(&self, xml: &str) -> Result<String>;

    /// Create and start a transient domain from a document.
    async fn create_domain(&self, xml: &str) -> Result<String>;

    /// Create a storage volume in `pool`. Returns the volume path.
    async fn define_volume(&self, pool: &str, xml: &str) -> Result<String>;

    /// Remove the persistent definition of a domain.
    async fn undefine(&self, name: &str) -> Result<()>;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start a defined domain.
    async fn start(&self, name: &str) -> Result<()>;

    /// Request a graceful (ACPI) shutdown.
    async fn shutdown(&self, name: &str) -> Result<()>;

    /// Hard power-off.
    async fn destroy(&self, name: &str) -> Result<()>;

    async fn suspend(&self, name: &str) -> Result<()>;

    async fn resume(&self, name: &str) -> Result<()>;

    async fn reboot(&self, name: &str) -> Result<()>;

    /// Hard reset without a guest shutdown.
    async fn reset(&self, name: &str) -> Result<()>;

    /// Send a key combination to the guest.
    async fn send_key(&self, name: &str, codeset: u32, holdtime_ms: u32, keys: &[u32]) -> Result<()>;

    // =========================================================================
    // Configuration
    // =========================================================================

    async fn set_autostart(&self, name: &str, enabled: bool) -> Result<()>;

    /// Set memory in KiB.
    async fn set_memory(&self, name: &str, kib: u64, flags: ResourceFlags) -> Result<()>;

    async fn set_vcpus(&self, name: &str, count: u32, flags: ResourceFlags) -> Result<()>;

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Current definition document of a domain.
    async fn xml_desc(&self, name: &str) -> Result<String>;

    async fn domain_info(&self, name: &str) -> Result<DomainInfo>;

    async fn is_active(&self, name: &str) -> Result<bool>;

    /// Counters of one interface, addressed by its host-side device name.
    async fn interface_stats(&self, name: &str, device: &str) -> Result<NetCounters>;

    /// Counters of one block device, addressed by its target name.
    async fn block_stats(&self, name: &str, device: &str) -> Result<DiskCounters>;
}
