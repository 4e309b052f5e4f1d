//! Profile resolution for network interfaces and disks.
//!
//! Profiles are loosely-structured YAML device collections. Three legacy
//! shapes are accepted and normalized to one ordered list of named devices:
//!
//! ```yaml
//! # mapping of device name to attributes
//! eth0: { bridge: br0 }
//! eth1: { network: internal }
//!
//! # sequence of single-key mappings
//! - eth0: { bridge: br0 }
//! - eth1: { network: internal }
//!
//! # sequence of attribute maps with an explicit name
//! - name: eth0
//!   bridge: br0
//! ```
//!
//! After normalization the family overlay fills in whatever the profile left
//! unset and the result is validated into [`InterfaceSpec`] / [`DiskSpec`].
//! Configured profiles are cloned before they are touched, so resolving the
//! same profile twice never sees state left behind by an earlier call.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::error::{HypervisorError, Result};
use crate::family::{is_falsy, HypervisorFamily};
use crate::types::*;

/// Per-device MAC overrides keyed by `<device-name>_mac`.
pub type MacOverrides = HashMap<String, String>;

/// Name of the profile used when none is requested.
pub const DEFAULT_PROFILE: &str = "default";

/// Default image directory for kvm/qemu disks.
pub const DEFAULT_IMAGE_PATH: &str = "/var/lib/virtkit/images";

/// Profile configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    /// Image directory used as the kvm/qemu disk pool
    pub images: String,
    /// ESXi datastore used for "[<datastore>] " pools
    pub datastore: String,
    /// Size of the built-in default system disk (MB)
    pub default_disk_size_mb: u64,
    /// Named nic profiles (raw device collections)
    pub nic: BTreeMap<String, Value>,
    /// Named disk profiles (raw device collections)
    pub disk: BTreeMap<String, Value>,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            images: DEFAULT_IMAGE_PATH.to_string(),
            datastore: "0".to_string(),
            default_disk_size_mb: 8192,
            nic: BTreeMap::new(),
            disk: BTreeMap::new(),
        }
    }
}

/// A device after shape normalization, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDevice {
    pub name: String,
    pub attributes: Mapping,
}

/// Resolved profiles per kind, as returned by profile introspection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileCatalog {
    pub nic: BTreeMap<String, Vec<InterfaceSpec>>,
    pub disk: BTreeMap<String, Vec<DiskSpec>>,
}

/// Turns profile names into canonical device specs.
#[derive(Debug, Clone, Default)]
pub struct ProfileResolver {
    settings: ProfileSettings,
}

impl ProfileResolver {
    pub fn new(settings: ProfileSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ProfileSettings {
        &self.settings
    }

    /// Resolve a nic profile into interface specs.
    ///
    /// MAC precedence: `<name>_mac` override, then an explicit `mac`
    /// attribute, then a freshly generated address.
    pub fn nic_profile(
        &self,
        profile: &str,
        family: HypervisorFamily,
        macs: &MacOverrides,
    ) -> Result<Vec<InterfaceSpec>> {
        let raw = match self.settings.nic.get(profile) {
            Some(value) => value.clone(),
            None => {
                if profile != DEFAULT_PROFILE {
                    warn!(profile = %profile, "Unknown nic profile, using built-in default");
                }
                default_nic_collection()
            }
        };

        let overlay = family.profile().nic_overlay();
        let mut interfaces = Vec::new();

        for mut device in normalize_collection(&raw)? {
            normalize_net_type(&mut device.attributes);
            overlay.apply(&mut device.attributes);
            let mac = assign_mac(&device, macs)?;
            interfaces.push(interface_spec(device, mac)?);
        }

        debug!(profile = %profile, family = %family, count = interfaces.len(), "Resolved nic profile");
        Ok(interfaces)
    }

    /// Resolve a disk profile into disk specs.
    pub fn disk_profile(&self, profile: &str, family: HypervisorFamily) -> Result<Vec<DiskSpec>> {
        let raw = match self.settings.disk.get(profile) {
            Some(value) => value.clone(),
            None => {
                if profile != DEFAULT_PROFILE {
                    warn!(profile = %profile, "Unknown disk profile, using built-in default");
                }
                self.default_disk_collection()
            }
        };

        let overlay = family.profile().disk_overlay(&self.settings);
        let mut disks = Vec::new();

        for mut device in normalize_collection(&raw)? {
            overlay.apply(&mut device.attributes);
            disks.push(disk_spec(device)?);
        }

        debug!(profile = %profile, family = %family, count = disks.len(), "Resolved disk profile");
        Ok(disks)
    }

    /// Resolve the default profile and every configured profile of both kinds.
    pub fn profiles(&self, family: HypervisorFamily) -> Result<ProfileCatalog> {
        let mut catalog = ProfileCatalog::default();
        let no_overrides = MacOverrides::new();

        catalog.nic.insert(
            DEFAULT_PROFILE.to_string(),
            self.nic_profile(DEFAULT_PROFILE, family, &no_overrides)?,
        );
        for name in self.settings.nic.keys() {
            catalog.nic.insert(name.clone(), self.nic_profile(name, family, &no_overrides)?);
        }

        catalog.disk.insert(DEFAULT_PROFILE.to_string(), self.disk_profile(DEFAULT_PROFILE, family)?);
        for name in self.settings.disk.keys() {
            catalog.disk.insert(name.clone(), self.disk_profile(name, family)?);
        }

        Ok(catalog)
    }

    fn default_disk_collection(&self) -> Value {
        let mut attrs = Mapping::new();
        attrs.insert("size".into(), Value::from(self.settings.default_disk_size_mb));
        let mut system = Mapping::new();
        system.insert("system".into(), Value::Mapping(attrs));
        Value::Sequence(vec![Value::Mapping(system)])
    }
}

fn default_nic_collection() -> Value {
    let mut eth0 = Mapping::new();
    eth0.insert("eth0".into(), Value::Mapping(Mapping::new()));
    Value::Sequence(vec![Value::Mapping(eth0)])
}

/// Normalize any of the three accepted collection shapes to an ordered list.
pub fn normalize_collection(raw: &Value) -> Result<Vec<RawDevice>> {
    match raw {
        Value::Null => Ok(Vec::new()),
        Value::Mapping(map) => map
            .iter()
            .map(|(name, attrs)| named_device(name, attrs))
            .collect(),
        Value::Sequence(items) => items.iter().map(sequence_item).collect(),
        other => Err(HypervisorError::Validation(format!(
            "device collection must be a mapping or a list, got {:?}",
            other
        ))),
    }
}

fn sequence_item(item: &Value) -> Result<RawDevice> {
    let map = item.as_mapping().ok_or_else(|| {
        HypervisorError::Validation(format!("device entry must be a mapping, got {:?}", item))
    })?;

    if let Some(name) = map.get("name").and_then(scalar_string) {
        let mut attributes = map.clone();
        attributes.remove("name");
        return Ok(RawDevice { name, attributes });
    }

    match map.iter().next() {
        Some((name, attrs)) if map.len() == 1 => named_device(name, attrs),
        _ => Err(HypervisorError::Validation(
            "device entry needs either a single device key or a 'name' field".to_string(),
        )),
    }
}

fn named_device(name: &Value, attrs: &Value) -> Result<RawDevice> {
    let name = scalar_string(name)
        .filter(|n| !n.is_empty())
        .ok_or_else(|| HypervisorError::Validation(format!("invalid device name {:?}", name)))?;

    let attributes = match attrs {
        Value::Null => Mapping::new(),
        Value::Mapping(m) => m.clone(),
        other => {
            return Err(HypervisorError::Validation(format!(
                "attributes of device '{}' must be a mapping, got {:?}",
                name, other
            )))
        }
    };

    Ok(RawDevice { name, attributes })
}

/// Fold `bridge: X` / `network: X` into `type` + `source`.
///
/// Without either key, `type` and `source` stay unset for the overlay.
pub fn normalize_net_type(attributes: &mut Mapping) {
    for kind in ["bridge", "network"] {
        if let Some(source) = attributes.remove(kind) {
            attributes.insert("type".into(), Value::String(kind.to_string()));
            attributes.insert("source".into(), source);
        }
    }
}

fn assign_mac(device: &RawDevice, macs: &MacOverrides) -> Result<MacAddress> {
    let key = format!("{}_mac", device.name);
    if let Some(mac) = macs.get(&key) {
        return mac.parse();
    }
    match attribute(&device.attributes, "mac") {
        Some(mac) => mac.parse(),
        None => Ok(MacAddress::generate()),
    }
}

fn interface_spec(device: RawDevice, mac: MacAddress) -> Result<InterfaceSpec> {
    let attrs = &device.attributes;
    let missing = |what: &str| {
        HypervisorError::Validation(format!("interface '{}' has no {}", device.name, what))
    };

    let kind = attribute(attrs, "type").ok_or_else(|| missing("connection type"))?;
    let source = attribute(attrs, "source").ok_or_else(|| missing("source"))?;
    let model = attribute(attrs, "model").ok_or_else(|| missing("model"))?;

    Ok(InterfaceSpec {
        kind: kind.parse()?,
        source,
        model: model.parse()?,
        mac,
        name: device.name,
    })
}

fn disk_spec(device: RawDevice) -> Result<DiskSpec> {
    let attrs = &device.attributes;
    let missing = |what: &str| {
        HypervisorError::Validation(format!("disk '{}' has no {}", device.name, what))
    };

    let size = attribute(attrs, "size").ok_or_else(|| missing("size"))?;
    let size_mb: u64 = size.trim().parse().map_err(|_| {
        HypervisorError::Validation(format!("disk '{}' has invalid size '{}'", device.name, size))
    })?;
    if size_mb == 0 {
        return Err(HypervisorError::Validation(format!(
            "disk '{}' must have a size greater than zero",
            device.name
        )));
    }

    let format = attribute(attrs, "format").ok_or_else(|| missing("format"))?;
    let model = attribute(attrs, "model").ok_or_else(|| missing("model"))?;
    let pool = attribute(attrs, "pool").ok_or_else(|| missing("pool"))?;

    Ok(DiskSpec {
        size_mb,
        format: format.parse()?,
        model: model.parse()?,
        pool,
        image: attribute(attrs, "image"),
        name: device.name,
    })
}

/// Truthy scalar attribute as a string.
fn attribute(attrs: &Mapping, key: &str) -> Option<String> {
    attrs
        .get(key)
        .filter(|v| !is_falsy(v))
        .and_then(scalar_string)
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
