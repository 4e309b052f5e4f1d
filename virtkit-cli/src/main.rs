//! # virtkit
//!
//! Command-line front end for profile-driven VM management. Every command
//! prints its result as JSON on stdout; logs go to stderr.
//!
//! ## Usage
//! ```bash
//! virtkit --config /etc/virtkit/virtkit.yaml init web01 --cpu 2 --mem 2048 --nic dual
//! virtkit info web01
//! virtkit --hypervisor esxi --connection esx01.example.com list --active
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use virtkit_hypervisor::{
    BootDevice, Hypervisor, HypervisorFamily, InitRequest, LocalProvisioner, MockBackend,
    SerialOptions, VirtManager,
};

mod cli;
mod config;

use cli::{Args, Command};
use config::{Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    if args.log_json {
        virtkit_common::init_logging_json(&args.log_level)?;
    } else {
        virtkit_common::init_logging(&args.log_level)?;
    }

    debug!(version = env!("CARGO_PKG_VERSION"), "Starting virtkit");

    // Load configuration
    let config = match &args.config {
        Some(config_path) => match Config::load(config_path) {
            Ok(cfg) => {
                info!(config_path = %config_path, "Configuration loaded");
                cfg.with_cli_overrides(&args)
            }
            Err(e) => {
                error!(error = %e, path = %config_path, "Failed to load configuration");
                return Err(e);
            }
        },
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(cfg) => {
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                cfg.with_cli_overrides(&args)
            }
            Err(_) => {
                debug!("No config file found, using CLI arguments and defaults");
                Config::default().with_cli_overrides(&args)
            }
        },
    };

    let family = config.family()?;
    let backend = connect(&config, family, args.dev)?;

    // Check hypervisor health
    match backend.health_check().await {
        Ok(true) => debug!("Hypervisor is healthy"),
        Ok(false) => warn!("Hypervisor health check failed"),
        Err(e) => warn!(error = %e, "Hypervisor health check error"),
    }

    let manager = VirtManager::new(backend, family, config.virt.clone())
        .with_storage_pool(config.libvirt.storage_pool.clone())
        .with_provisioner(Arc::new(LocalProvisioner::new(config.seed.command.clone())));

    let output = run(&manager, &config, args.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

/// Open the control-plane connection.
fn connect(config: &Config, family: HypervisorFamily, dev: bool) -> Result<Arc<dyn Hypervisor>> {
    let uri = config.libvirt.uri(family);

    let backend: Arc<dyn Hypervisor> = if dev {
        info!("Development mode: using in-memory mock hypervisor");
        Arc::new(MockBackend::new())
    } else {
        #[cfg(feature = "libvirt")]
        {
            Arc::new(
                virtkit_hypervisor::LibvirtBackend::open(family, uri.as_deref())
                    .context("Failed to connect to hypervisor")?,
            )
        }
        #[cfg(not(feature = "libvirt"))]
        {
            anyhow::bail!(
                "virtkit was built without libvirt support (target {}); rebuild with --features libvirt or use --dev",
                uri.as_deref().unwrap_or("default")
            )
        }
    };

    Ok(backend)
}

fn to_json<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).context("Failed to serialize result")
}

/// Parse `<device>=<mac>` overrides into the `<device>_mac` form.
fn mac_overrides(request: &mut InitRequest, macs: &[String]) -> Result<()> {
    for entry in macs {
        let (device, mac) = entry
            .split_once('=')
            .with_context(|| format!("Invalid MAC override '{}', expected DEVICE=MAC", entry))?;
        request
            .mac_overrides
            .insert(format!("{}_mac", device), mac.to_string());
    }
    Ok(())
}

/// Execute one command and return its JSON result.
async fn run(manager: &VirtManager, config: &Config, command: Command) -> Result<Value> {
    let stats = manager.stats();

    let output = match command {
        Command::Init {
            name,
            cpu,
            mem,
            image,
            nic,
            disk,
            macs,
            boot_devices,
            serial,
            telnet_port,
            no_console,
            seed,
            no_start,
        } => {
            let mut request = InitRequest::new(name, cpu, mem)
                .with_nic_profile(nic)
                .with_disk_profile(disk)
                .with_start(!no_start)
                .with_seed(seed);
            if let Some(image) = image {
                request = request.with_image(image);
            }
            request.install = config.seed.install;
            mac_overrides(&mut request, &macs)?;

            if !boot_devices.is_empty() {
                let devices = boot_devices
                    .iter()
                    .map(|d| d.parse::<BootDevice>())
                    .collect::<Result<Vec<_>, _>>()?;
                request.boot_devices = Some(devices);
            }
            if let Some(kind) = serial {
                let mut options = SerialOptions::new(kind);
                options.telnet_port = telnet_port;
                options.console = !no_console;
                request.serial = Some(options);
            }

            to_json(manager.init(request).await?)?
        }
        Command::Define { path } => json!({ "name": manager.define_xml_path(&path).await? }),
        Command::Create { path } => json!({ "name": manager.create_xml_path(&path).await? }),
        Command::DefineVol { path } => json!({ "path": manager.define_vol_xml_path(&path).await? }),
        Command::Undefine(arg) => {
            manager.undefine(&arg.vm).await?;
            json!(true)
        }
        Command::Purge { vm, dirs } => to_json(manager.purge(&vm, dirs).await?)?,

        Command::List { active, inactive } => {
            let vms = if active {
                manager.list_active_vms().await?
            } else if inactive {
                manager.list_inactive_vms().await?
            } else {
                manager.list_vms().await?
            };
            to_json(vms)?
        }
        Command::Start(arg) => {
            manager.start(&arg.vm).await?;
            json!(true)
        }
        Command::Stop(arg) => {
            manager.stop(&arg.vm).await?;
            json!(true)
        }
        Command::Shutdown(arg) => {
            manager.shutdown(&arg.vm).await?;
            json!(true)
        }
        Command::Pause(arg) => {
            manager.pause(&arg.vm).await?;
            json!(true)
        }
        Command::Resume(arg) => {
            manager.resume(&arg.vm).await?;
            json!(true)
        }
        Command::Reboot(arg) => {
            manager.reboot(&arg.vm).await?;
            json!(true)
        }
        Command::Reset(arg) => {
            manager.reset(&arg.vm).await?;
            json!(true)
        }
        Command::CtrlAltDel(arg) => {
            manager.ctrl_alt_del(&arg.vm).await?;
            json!(true)
        }
        Command::SendKey { vm, keys } => {
            manager.send_key(&vm, &keys).await?;
            json!(true)
        }
        Command::Autostart { vm, off } => {
            manager.set_autostart(&vm, !off).await?;
            json!(true)
        }
        Command::Setmem { vm, memory_mb, persist } => {
            manager.setmem(&vm, memory_mb, persist).await?;
            json!(true)
        }
        Command::Setvcpus { vm, vcpus, persist } => {
            manager.setvcpus(&vm, vcpus, persist).await?;
            json!(true)
        }

        Command::Info(arg) => to_json(stats.vm_info(arg.vm.as_deref()).await?)?,
        Command::State(arg) => to_json(stats.vm_state(arg.vm.as_deref()).await?)?,
        Command::Cputime(arg) => to_json(stats.vm_cputime(arg.vm.as_deref()).await?)?,
        Command::Netstats(arg) => to_json(stats.vm_netstats(arg.vm.as_deref()).await?)?,
        Command::Diskstats(arg) => to_json(stats.vm_diskstats(arg.vm.as_deref()).await?)?,
        Command::Xml(arg) => Value::String(manager.get_xml(&arg.vm).await?),
        Command::Nics(arg) => to_json(manager.get_nics(&arg.vm).await?)?,
        Command::Macs(arg) => to_json(manager.get_macs(&arg.vm).await?)?,
        Command::Graphics(arg) => to_json(manager.get_graphics(&arg.vm).await?)?,
        Command::Disks(arg) => to_json(manager.get_disks(&arg.vm).await?)?,
        Command::Profiles { family } => {
            let family = family
                .map(|f| f.parse::<HypervisorFamily>())
                .transpose()?;
            to_json(manager.get_profiles(family)?)?
        }
        Command::NodeInfo => to_json(manager.node_info().await?)?,
        Command::VirtType => json!({
            "type": manager.virt_type().await?,
            "is_kvm_hyper": manager.is_kvm_hyper().await?,
        }),
        Command::Freemem => json!(manager.freemem().await?),
        Command::Freecpu => json!(manager.freecpu().await?),
        Command::FullInfo => to_json(manager.full_info().await?)?,
    };

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev_manager() -> VirtManager {
        VirtManager::new(
            Arc::new(MockBackend::new()),
            HypervisorFamily::Kvm,
            Default::default(),
        )
    }

    #[tokio::test]
    async fn test_init_then_info() {
        let manager = dev_manager();
        let config = Config::default();

        let args = Args::parse_from([
            "virtkit", "init", "web01", "--cpu", "2", "--mem", "1024", "--mac",
            "eth0=52:54:00:00:00:01",
        ]);
        let outcome = run(&manager, &config, args.command).await.unwrap();
        assert_eq!(outcome["name"], "web01");

        let args = Args::parse_from(["virtkit", "macs", "web01"]);
        let macs = run(&manager, &config, args.command).await.unwrap();
        assert_eq!(macs, json!(["52:54:00:00:00:01"]));

        let args = Args::parse_from(["virtkit", "info"]);
        let info = run(&manager, &config, args.command).await.unwrap();
        assert_eq!(info["web01"]["cpu"], 2);
        assert_eq!(info["web01"]["state"], "running");
    }

    #[tokio::test]
    async fn test_serial_console_by_default() {
        let manager = dev_manager();
        let config = Config::default();

        let args = Args::parse_from([
            "virtkit", "init", "web01", "--cpu", "1", "--mem", "512", "--serial", "pty",
        ]);
        run(&manager, &config, args.command).await.unwrap();
        let xml = manager.get_xml("web01").await.unwrap();
        assert!(xml.contains("<serial type=\"pty\">"));
        assert!(xml.contains("<console type=\"pty\">"));

        let args = Args::parse_from([
            "virtkit", "init", "web02", "--cpu", "1", "--mem", "512", "--serial", "pty",
            "--no-console",
        ]);
        run(&manager, &config, args.command).await.unwrap();
        let xml = manager.get_xml("web02").await.unwrap();
        assert!(xml.contains("<serial"));
        assert!(!xml.contains("<console"));
    }

    #[tokio::test]
    async fn test_virt_type() {
        let manager = dev_manager();
        let args = Args::parse_from(["virtkit", "virt-type"]);
        let output = run(&manager, &Config::default(), args.command).await.unwrap();
        assert_eq!(output["type"], "QEMU");
        assert!(output["is_kvm_hyper"].is_boolean());
    }

    #[tokio::test]
    async fn test_bad_mac_override() {
        let manager = dev_manager();
        let args = Args::parse_from([
            "virtkit", "init", "web01", "--cpu", "1", "--mem", "512", "--mac", "eth0",
        ]);
        assert!(run(&manager, &Config::default(), args.command).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_vm_fails() {
        let manager = dev_manager();
        let args = Args::parse_from(["virtkit", "start", "ghost"]);
        assert!(run(&manager, &Config::default(), args.command).await.is_err());
    }
}
