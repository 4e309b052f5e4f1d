//! Libvirt backend implementation.

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;
use virt::sys;

use crate::error::{HypervisorError, Result};
use crate::family::HypervisorFamily;
use crate::traits::Hypervisor;
use crate::types::*;

/// Libvirt hypervisor backend.
pub struct LibvirtBackend {
    uri: String,
    connection: Connect,
}

impl LibvirtBackend {
    /// Default connection URI for a family.
    ///
    /// ESXi hosts are reached through the `esx://` driver; `target` is the
    /// host name (without verification of the host certificate).
    pub fn default_uri(family: HypervisorFamily, target: Option<&str>) -> String {
        match family {
            HypervisorFamily::Esxi => {
                format!("esx://{}/?no_verify=1", target.unwrap_or("localhost"))
            }
            HypervisorFamily::Kvm | HypervisorFamily::Qemu => "qemu:///system".to_string(),
        }
    }

    /// Connect to the control plane for `family`.
    ///
    /// An explicit `uri` wins over the family default.
    pub fn open(family: HypervisorFamily, uri: Option<&str>) -> Result<Self> {
        let uri = uri
            .map(str::to_string)
            .unwrap_or_else(|| Self::default_uri(family, None));
        info!(uri = %uri, family = %family, "Connecting to libvirt");

        let connection = Connect::open(Some(&uri)).map_err(|e| {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string());
            HypervisorError::ConnectionFailed {
                target: uri.clone(),
                reason: format!("{} (from host {})", e, host),
            }
        })?;

        info!("Connected to libvirt");
        Ok(Self { uri, connection })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn get_domain(&self, name: &str) -> Result<Domain> {
        Domain::lookup_by_name(&self.connection, name)
            .map_err(|_| HypervisorError::VmNotFound(name.to_string()))
    }
}

fn op_err(e: virt::error::Error) -> HypervisorError {
    HypervisorError::OperationFailed(e.to_string())
}

fn resource_flags(flags: ResourceFlags, maximum: u32) -> u32 {
    let mut raw = if flags.persist_config {
        sys::VIR_DOMAIN_AFFECT_CONFIG
    } else {
        sys::VIR_DOMAIN_AFFECT_CURRENT
    };
    if flags.maximum {
        raw |= maximum;
    }
    raw
}

fn counter(value: i64) -> u64 {
    value.max(0) as u64
}

#[async_trait]
impl Hypervisor for LibvirtBackend {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<bool> {
        Ok(self.connection.is_alive().unwrap_or(false))
    }

    #[instrument(skip(self))]
    async fn node_info(&self) -> Result<NodeInfo> {
        let info = self.connection.get_node_info().map_err(op_err)?;
        Ok(NodeInfo {
            cpu_model: info.model,
            memory_mib: info.memory / 1024,
            cpus: info.cpus,
            mhz: info.mhz,
            numa_nodes: info.nodes,
            sockets: info.sockets,
            cores: info.cores,
            threads: info.threads,
        })
    }

    async fn hypervisor_type(&self) -> Result<String> {
        self.connection.get_type().map_err(op_err)
    }

    #[instrument(skip(self))]
    async fn list_active_vms(&self) -> Result<Vec<String>> {
        let ids = self.connection.list_domains().map_err(op_err)?;
        let mut names = Vec::with_capacity(ids.len());
        for id in ids {
            // Domains can stop between listing and lookup.
            match Domain::lookup_by_id(&self.connection, id) {
                Ok(domain) => names.push(domain.get_name().map_err(op_err)?),
                Err(e) => debug!(id, error = %e, "Active domain vanished during listing"),
            }
        }
        Ok(names)
    }

    #[instrument(skip(self))]
    async fn list_inactive_vms(&self) -> Result<Vec<String>> {
        self.connection.list_defined_domains().map_err(op_err)
    }

    #[instrument(skip(self, xml))]
    async fn define_domain(&self, xml: &str) -> Result<String> {
        debug!(xml = %xml, "Defining domain");
        let domain = Domain::define_xml(&self.connection, xml).map_err(op_err)?;
        let name = domain.get_name().map_err(op_err)?;
        info!(vm = %name, "Domain defined");
        Ok(name)
    }

    #[instrument(skip(self, xml))]
    async fn create_domain(&self, xml: &str) -> Result<String> {
        let domain = Domain::create_xml(&self.connection, xml, 0).map_err(op_err)?;
        let name = domain.get_name().map_err(op_err)?;
        info!(vm = %name, "Transient domain created");
        Ok(name)
    }

    #[instrument(skip(self, xml))]
    async fn define_volume(&self, pool: &str, xml: &str) -> Result<String> {
        let storage_pool = StoragePool::lookup_by_name(&self.connection, pool).map_err(|e| {
            HypervisorError::OperationFailed(format!("storage pool {}: {}", pool, e))
        })?;
        let volume = StorageVol::create_xml(&storage_pool, xml, 0).map_err(op_err)?;
        let path = volume.get_path().map_err(op_err)?;
        info!(path = %path, "Volume created");
        Ok(path)
    }

    #[instrument(skip(self))]
    async fn undefine(&self, name: &str) -> Result<()> {
        self.get_domain(name)?.undefine().map_err(op_err)?;
        info!("Domain undefined");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start(&self, name: &str) -> Result<()> {
        self.get_domain(name)?.create().map_err(op_err)?;
        info!("Domain started");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn shutdown(&self, name: &str) -> Result<()> {
        self.get_domain(name)?.shutdown().map_err(op_err)?;
        info!("Shutdown requested");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn destroy(&self, name: &str) -> Result<()> {
        self.get_domain(name)?.destroy().map_err(op_err)?;
        info!("Domain destroyed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn suspend(&self, name: &str) -> Result<()> {
        self.get_domain(name)?.suspend().map_err(op_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn resume(&self, name: &str) -> Result<()> {
        self.get_domain(name)?.resume().map_err(op_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reboot(&self, name: &str) -> Result<()> {
        self.get_domain(name)?
            .reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT)
            .map_err(op_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reset(&self, name: &str) -> Result<()> {
        self.get_domain(name)?.reset().map_err(op_err)?;
        Ok(())
    }

    #[instrument(skip(self, keys))]
    async fn send_key(&self, name: &str, codeset: u32, holdtime_ms: u32, keys: &[u32]) -> Result<()> {
        let domain = self.get_domain(name)?;
        let mut keycodes = keys.to_vec();
        domain
            .send_key(
                codeset,
                holdtime_ms,
                keycodes.as_mut_ptr(),
                keycodes.len() as i32,
                0,
            )
            .map_err(op_err)?;
        debug!(keys = ?keys, "Keys sent");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_autostart(&self, name: &str, enabled: bool) -> Result<()> {
        self.get_domain(name)?.set_autostart(enabled).map_err(op_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_memory(&self, name: &str, kib: u64, flags: ResourceFlags) -> Result<()> {
        let raw = resource_flags(flags, sys::VIR_DOMAIN_MEM_MAXIMUM);
        self.get_domain(name)?
            .set_memory_flags(kib, raw)
            .map_err(op_err)?;
        info!(kib, "Memory updated");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn set_vcpus(&self, name: &str, count: u32, flags: ResourceFlags) -> Result<()> {
        let raw = resource_flags(flags, sys::VIR_DOMAIN_VCPU_MAXIMUM);
        self.get_domain(name)?
            .set_vcpus_flags(count, raw)
            .map_err(op_err)?;
        info!(count, "vCPUs updated");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn xml_desc(&self, name: &str) -> Result<String> {
        self.get_domain(name)?.get_xml_desc(0).map_err(op_err)
    }

    #[instrument(skip(self))]
    async fn domain_info(&self, name: &str) -> Result<DomainInfo> {
        let info = self.get_domain(name)?.get_info().map_err(op_err)?;
        Ok(DomainInfo {
            state: info.state as u32,
            max_mem_kib: info.max_mem,
            mem_kib: info.memory,
            vcpus: info.nr_virt_cpu,
            cpu_time_ns: info.cpu_time,
        })
    }

    #[instrument(skip(self))]
    async fn is_active(&self, name: &str) -> Result<bool> {
        self.get_domain(name)?.is_active().map_err(op_err)
    }

    #[instrument(skip(self))]
    async fn interface_stats(&self, name: &str, device: &str) -> Result<NetCounters> {
        let stats = self
            .get_domain(name)?
            .interface_stats(device)
            .map_err(op_err)?;
        Ok(NetCounters {
            rx_bytes: counter(stats.rx_bytes),
            rx_packets: counter(stats.rx_packets),
            rx_errs: counter(stats.rx_errs),
            rx_drop: counter(stats.rx_drop),
            tx_bytes: counter(stats.tx_bytes),
            tx_packets: counter(stats.tx_packets),
            tx_errs: counter(stats.tx_errs),
            tx_drop: counter(stats.tx_drop),
        })
    }

    #[instrument(skip(self))]
    async fn block_stats(&self, name: &str, device: &str) -> Result<DiskCounters> {
        let stats = self
            .get_domain(name)?
            .get_block_stats(device)
            .map_err(op_err)?;
        if stats.errs < 0 {
            warn!(device = %device, "Block error counter not supported by driver");
        }
        Ok(DiskCounters {
            rd_req: counter(stats.rd_req),
            rd_bytes: counter(stats.rd_bytes),
            wr_req: counter(stats.wr_req),
            wr_bytes: counter(stats.wr_bytes),
            errs: counter(stats.errs),
        })
    }
}
