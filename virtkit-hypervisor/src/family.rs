//! Hypervisor families and their per-family strategy table.
//!
//! Everything that differs between hypervisor families lives here and is
//! selected once: domain type, disk naming, controller and address
//! requirements, template-image support and the overlay defaults that the
//! profile resolver applies to incomplete device definitions.
//!
//! ```rust
//! use virtkit_hypervisor::HypervisorFamily;
//!
//! let profile = HypervisorFamily::Esxi.profile();
//! assert_eq!(profile.disk_prefix, "sd");
//! assert_eq!(profile.scsi_controller, Some("lsilogic"));
//! ```

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::HypervisorError;
use crate::profile::ProfileSettings;

/// Hypervisor family a document is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorFamily {
    /// KVM-accelerated QEMU
    #[default]
    Kvm,
    /// Plain (emulated) QEMU
    Qemu,
    /// VMware ESXi
    #[serde(alias = "vmware")]
    Esxi,
}

impl HypervisorFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kvm => "kvm",
            Self::Qemu => "qemu",
            Self::Esxi => "esxi",
        }
    }

    /// Strategy table entry for this family.
    pub fn profile(self) -> &'static FamilyProfile {
        match self {
            Self::Kvm => &KVM_PROFILE,
            Self::Qemu => &QEMU_PROFILE,
            Self::Esxi => &ESXI_PROFILE,
        }
    }

    pub fn all() -> [HypervisorFamily; 3] {
        [Self::Kvm, Self::Qemu, Self::Esxi]
    }
}

impl fmt::Display for HypervisorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HypervisorFamily {
    type Err = HypervisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kvm" => Ok(Self::Kvm),
            "qemu" => Ok(Self::Qemu),
            "esxi" | "vmware" => Ok(Self::Esxi),
            other => Err(HypervisorError::Validation(format!(
                "unsupported hypervisor family '{}'",
                other
            ))),
        }
    }
}

/// Per-family rendering and defaulting strategy.
#[derive(Debug)]
pub struct FamilyProfile {
    pub family: HypervisorFamily,
    /// Value of the domain `type` attribute
    pub domain_type: &'static str,
    /// Target device prefix ("vd" → vda, vdb, ...)
    pub disk_prefix: &'static str,
    /// Model of the explicit SCSI controller, when the family needs one
    pub scsi_controller: Option<&'static str>,
    /// Every disk carries an explicit drive address
    pub drive_address: bool,
    /// Every disk carries a qemu driver element
    pub qemu_driver: bool,
    /// A template image can be copied in as the system disk
    pub template_images: bool,
    /// Interface defaults: type, source, model
    pub nic_defaults: [(&'static str, &'static str); 3],
    /// Default disk format
    pub disk_format: &'static str,
    /// Default disk bus model
    pub disk_model: &'static str,
}

static KVM_PROFILE: FamilyProfile = FamilyProfile {
    family: HypervisorFamily::Kvm,
    domain_type: "kvm",
    disk_prefix: "vd",
    scsi_controller: None,
    drive_address: false,
    qemu_driver: true,
    template_images: true,
    nic_defaults: [("type", "bridge"), ("source", "br0"), ("model", "virtio")],
    disk_format: "qcow2",
    disk_model: "virtio",
};

static QEMU_PROFILE: FamilyProfile = FamilyProfile {
    family: HypervisorFamily::Qemu,
    domain_type: "qemu",
    disk_prefix: "vd",
    scsi_controller: None,
    drive_address: false,
    qemu_driver: true,
    template_images: true,
    nic_defaults: [("type", "bridge"), ("source", "br0"), ("model", "virtio")],
    disk_format: "qcow2",
    disk_model: "virtio",
};

static ESXI_PROFILE: FamilyProfile = FamilyProfile {
    family: HypervisorFamily::Esxi,
    domain_type: "vmware",
    disk_prefix: "sd",
    scsi_controller: Some("lsilogic"),
    drive_address: true,
    qemu_driver: false,
    template_images: false,
    nic_defaults: [("type", "bridge"), ("source", "DEFAULT"), ("model", "e1000")],
    disk_format: "vmdk",
    disk_model: "scsi",
};

impl FamilyProfile {
    /// Storage pool location for disks of this family.
    pub fn disk_pool(&self, settings: &ProfileSettings) -> String {
        match self.family {
            HypervisorFamily::Esxi => format!("[{}] ", settings.datastore),
            HypervisorFamily::Kvm | HypervisorFamily::Qemu => settings.images.clone(),
        }
    }

    /// Overlay applied to every interface of a nic profile.
    pub fn nic_overlay(&self) -> HypervisorOverlay {
        let mut overlay = HypervisorOverlay::default();
        for (key, value) in self.nic_defaults {
            overlay.set(key, Value::String(value.to_string()));
        }
        overlay
    }

    /// Overlay applied to every disk of a disk profile.
    pub fn disk_overlay(&self, settings: &ProfileSettings) -> HypervisorOverlay {
        let mut overlay = HypervisorOverlay::default();
        overlay.set("format", Value::String(self.disk_format.to_string()));
        overlay.set("model", Value::String(self.disk_model.to_string()));
        overlay.set("pool", Value::String(self.disk_pool(settings)));
        overlay
    }
}

/// Per-family default attribute values.
///
/// Applied only to attributes that are missing or falsy; attributes the
/// caller set explicitly are never replaced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HypervisorOverlay {
    defaults: Vec<(String, Value)>,
}

impl HypervisorOverlay {
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.defaults.retain(|(k, _)| *k != key);
        self.defaults.push((key, value));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.defaults.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Fill missing or falsy attributes from the overlay.
    pub fn apply(&self, attributes: &mut Mapping) {
        for (key, value) in &self.defaults {
            let unset = attributes.get(key.as_str()).map_or(true, is_falsy);
            if unset {
                attributes.insert(Value::String(key.clone()), value.clone());
            }
        }
    }
}

/// YAML truthiness: null, false, 0, "" and empty collections are falsy.
pub(crate) fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f == 0.0),
        Value::String(s) => s.is_empty(),
        Value::Sequence(s) => s.is_empty(),
        Value::Mapping(m) => m.is_empty(),
        Value::Tagged(t) => is_falsy(&t.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_string() {
        assert_eq!("kvm".parse::<HypervisorFamily>().unwrap(), HypervisorFamily::Kvm);
        assert_eq!("QEMU".parse::<HypervisorFamily>().unwrap(), HypervisorFamily::Qemu);
        assert_eq!("vmware".parse::<HypervisorFamily>().unwrap(), HypervisorFamily::Esxi);
        assert!(matches!(
            "xen".parse::<HypervisorFamily>(),
            Err(HypervisorError::Validation(_))
        ));
    }

    #[test]
    fn test_strategy_table() {
        let kvm = HypervisorFamily::Kvm.profile();
        assert_eq!(kvm.domain_type, "kvm");
        assert_eq!(kvm.disk_prefix, "vd");
        assert!(kvm.scsi_controller.is_none());
        assert!(kvm.template_images);

        let qemu = HypervisorFamily::Qemu.profile();
        assert_eq!(qemu.domain_type, "qemu");
        assert_eq!(qemu.disk_prefix, "vd");

        let esxi = HypervisorFamily::Esxi.profile();
        assert_eq!(esxi.domain_type, "vmware");
        assert!(esxi.drive_address);
        assert!(!esxi.template_images);
    }

    #[test]
    fn test_overlay_only_fills_unset() {
        let overlay = HypervisorFamily::Kvm.profile().nic_overlay();
        let mut attrs: Mapping = serde_yaml::from_str("model: e1000\nsource: ''\n").unwrap();
        overlay.apply(&mut attrs);

        assert_eq!(attrs.get("model").and_then(Value::as_str), Some("e1000"));
        assert_eq!(attrs.get("source").and_then(Value::as_str), Some("br0"));
        assert_eq!(attrs.get("type").and_then(Value::as_str), Some("bridge"));
    }

    #[test]
    fn test_esxi_disk_pool_uses_datastore() {
        let settings = ProfileSettings {
            datastore: "datastore1".to_string(),
            ..Default::default()
        };
        let overlay = HypervisorFamily::Esxi.profile().disk_overlay(&settings);
        assert_eq!(overlay.get("pool").and_then(Value::as_str), Some("[datastore1] "));
        assert_eq!(overlay.get("format").and_then(Value::as_str), Some("vmdk"));
    }
}
