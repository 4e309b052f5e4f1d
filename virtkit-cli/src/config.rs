//! Configuration management for the virtkit CLI.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use virtkit_hypervisor::manager::DEFAULT_STORAGE_POOL;
use virtkit_hypervisor::{HypervisorFamily, ProfileSettings};

use crate::cli::Args;

/// Configuration file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/virtkit/virtkit.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Control-plane connection
    pub libvirt: LibvirtConfig,
    /// Image locations and nic/disk profiles
    pub virt: ProfileSettings,
    /// Template image seeding
    pub seed: SeedConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).with_context(|| "Failed to parse config file")?;
        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref hypervisor) = args.hypervisor {
            self.libvirt.hypervisor = hypervisor.clone();
        }

        if let Some(ref connection) = args.connection {
            self.libvirt.connection = Some(connection.clone());
        }

        self
    }

    pub fn family(&self) -> Result<HypervisorFamily> {
        self.libvirt
            .hypervisor
            .parse()
            .with_context(|| format!("Invalid hypervisor '{}'", self.libvirt.hypervisor))
    }
}

/// Control-plane connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LibvirtConfig {
    /// Hypervisor family (kvm, qemu, esxi)
    pub hypervisor: String,
    /// Connection URI, or an ESXi host name
    pub connection: Option<String>,
    /// Storage pool receiving profile disks
    pub storage_pool: String,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            hypervisor: HypervisorFamily::default().to_string(),
            connection: None,
            storage_pool: DEFAULT_STORAGE_POOL.to_string(),
        }
    }
}

impl LibvirtConfig {
    /// Full connection URI, if one is configured.
    ///
    /// A bare host name is expanded with the family's URI scheme.
    pub fn uri(&self, family: HypervisorFamily) -> Option<String> {
        let connection = self.connection.as_deref()?;
        if connection.contains("://") {
            return Some(connection.to_string());
        }
        match family {
            HypervisorFamily::Esxi => Some(format!("esx://{}/?no_verify=1", connection)),
            HypervisorFamily::Kvm | HypervisorFamily::Qemu => {
                Some(format!("qemu+ssh://{}/system", connection))
            }
        }
    }
}

/// Template image seeding.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    /// Command run as `<command> <image> <vm> [--install]`
    pub command: Option<PathBuf>,
    /// Install the configuration agent while seeding
    pub install: bool,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            command: None,
            install: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_config_yaml_parsing() {
        let yaml = r#"
libvirt:
  hypervisor: esxi
  connection: esx01.example.com
virt:
  datastore: "1"
  nic:
    dual:
      - eth0: { bridge: br0 }
      - eth1: { network: isolated }
seed:
  command: /usr/local/bin/seed-image
  install: false
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.family().unwrap(), HypervisorFamily::Esxi);
        assert_eq!(config.libvirt.storage_pool, "default");
        assert_eq!(config.virt.datastore, "1");
        assert_eq!(config.virt.default_disk_size_mb, 8192);
        assert!(config.virt.nic.contains_key("dual"));
        assert_eq!(
            config.seed.command.as_deref(),
            Some(Path::new("/usr/local/bin/seed-image"))
        );
        assert!(!config.seed.install);
        assert_eq!(
            config.libvirt.uri(HypervisorFamily::Esxi).as_deref(),
            Some("esx://esx01.example.com/?no_verify=1")
        );
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.family().unwrap(), HypervisorFamily::Kvm);
        assert!(config.libvirt.uri(HypervisorFamily::Kvm).is_none());
        assert!(config.seed.install);
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "virtkit",
            "--hypervisor",
            "qemu",
            "--connection",
            "qemu:///session",
            "freemem",
        ]);
        let config = Config::default().with_cli_overrides(&args);

        assert_eq!(config.family().unwrap(), HypervisorFamily::Qemu);
        assert_eq!(config.libvirt.uri(HypervisorFamily::Qemu).as_deref(), Some("qemu:///session"));
    }

    #[test]
    fn test_invalid_family() {
        let config = Config::from_yaml("libvirt:\n  hypervisor: xen\n").unwrap();
        assert!(config.family().is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(Config::load("/nonexistent/virtkit.yaml").is_err());
    }
}
