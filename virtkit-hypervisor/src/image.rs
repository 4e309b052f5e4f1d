//! Disk image inspection using qemu-img.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::family::HypervisorFamily;

/// Metadata of a disk image file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub format: String,
    /// Virtual size in bytes
    pub virtual_size: u64,
    /// Allocated size on disk in bytes
    pub actual_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backing_file: Option<String>,
}

/// A disk of a domain with its image metadata when it could be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskDetails {
    /// Backing source (file, block device or `protocol:name`)
    pub file: String,
    #[serde(flatten)]
    pub image: Option<ImageInfo>,
}

/// Reads image metadata from a backing file.
pub trait ImageInspector: Send + Sync {
    fn inspect(&self, path: &Path) -> Result<ImageInfo>;
}

/// Inspector backed by `qemu-img info --output=json`.
#[derive(Debug, Clone)]
pub struct QemuImgInspector {
    qemu_img_path: String,
}

impl QemuImgInspector {
    pub fn new() -> Self {
        Self {
            qemu_img_path: "qemu-img".to_string(),
        }
    }

    /// Set the qemu-img binary path.
    pub fn with_qemu_img(mut self, path: impl Into<String>) -> Self {
        self.qemu_img_path = path.into();
        self
    }
}

impl Default for QemuImgInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageInspector for QemuImgInspector {
    #[instrument(skip(self), fields(path = %path.display()))]
    fn inspect(&self, path: &Path) -> Result<ImageInfo> {
        debug!("Getting image info");

        let output = Command::new(&self.qemu_img_path)
            .arg("info")
            .arg("--output=json")
            .arg(path)
            .output()
            .map_err(|e| HypervisorError::Internal(format!("Failed to execute qemu-img: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HypervisorError::OperationFailed(format!(
                "qemu-img info failed: {}",
                stderr.trim()
            )));
        }

        parse_qemu_img_json(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse the JSON document printed by `qemu-img info --output=json`.
pub fn parse_qemu_img_json(json: &str) -> Result<ImageInfo> {
    let info: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| HypervisorError::Internal(format!("Failed to parse qemu-img output: {}", e)))?;

    let format = info["format"]
        .as_str()
        .ok_or_else(|| HypervisorError::Internal("qemu-img output has no format".to_string()))?;

    Ok(ImageInfo {
        format: format.to_string(),
        virtual_size: info["virtual-size"].as_u64().unwrap_or(0),
        actual_size: info["actual-size"].as_u64().unwrap_or(0),
        backing_file: info["full-backing-filename"]
            .as_str()
            .or_else(|| info["backing-filename"].as_str())
            .map(str::to_string),
    })
}

/// Attach image metadata to parsed disks.
///
/// Only local files of kvm/qemu domains are inspected. A failed inspection
/// leaves the image fields absent.
pub fn inspect_disks(
    family: HypervisorFamily,
    disks: BTreeMap<String, String>,
    inspector: &dyn ImageInspector,
) -> BTreeMap<String, DiskDetails> {
    let inspectable = matches!(family, HypervisorFamily::Kvm | HypervisorFamily::Qemu);

    disks
        .into_iter()
        .map(|(dev, file)| {
            let image = if inspectable && file.starts_with('/') {
                match inspector.inspect(Path::new(&file)) {
                    Ok(info) => Some(info),
                    Err(e) => {
                        warn!(device = %dev, file = %file, error = %e, "Image inspection failed");
                        None
                    }
                }
            } else {
                None
            };
            (dev, DiskDetails { file, image })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedInspector;

    impl ImageInspector for FixedInspector {
        fn inspect(&self, path: &Path) -> Result<ImageInfo> {
            if path.ends_with("broken.qcow2") {
                return Err(HypervisorError::OperationFailed("corrupt image".to_string()));
            }
            Ok(ImageInfo {
                format: "qcow2".to_string(),
                virtual_size: 1 << 30,
                actual_size: 1 << 20,
                backing_file: None,
            })
        }
    }

    #[test]
    fn test_parse_qemu_img_json() {
        let json = r#"{
            "virtual-size": 8589934592,
            "filename": "/srv/images/web01/system.qcow2",
            "cluster-size": 65536,
            "format": "qcow2",
            "actual-size": 200704,
            "backing-filename": "base.qcow2",
            "full-backing-filename": "/srv/images/base.qcow2",
            "dirty-flag": false
        }"#;

        let info = parse_qemu_img_json(json).unwrap();
        assert_eq!(info.format, "qcow2");
        assert_eq!(info.virtual_size, 8589934592);
        assert_eq!(info.actual_size, 200704);
        assert_eq!(info.backing_file.as_deref(), Some("/srv/images/base.qcow2"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_qemu_img_json("not json").is_err());
        assert!(parse_qemu_img_json("{}").is_err());
    }

    #[test]
    fn test_inspection_failure_omits_fields() {
        let mut disks = BTreeMap::new();
        disks.insert("vda".to_string(), "/img/vm/system.qcow2".to_string());
        disks.insert("vdb".to_string(), "/img/vm/broken.qcow2".to_string());
        disks.insert("vdc".to_string(), "rbd:pool/vm-logs".to_string());

        let details = inspect_disks(HypervisorFamily::Kvm, disks, &FixedInspector);
        assert!(details["vda"].image.is_some());
        assert!(details["vdb"].image.is_none());
        assert!(details["vdc"].image.is_none());
        assert_eq!(details["vdb"].file, "/img/vm/broken.qcow2");
    }

    #[test]
    fn test_esxi_disks_not_inspected() {
        let mut disks = BTreeMap::new();
        disks.insert("sda".to_string(), "/vmfs/vm/system.vmdk".to_string());

        let details = inspect_disks(HypervisorFamily::Esxi, disks, &FixedInspector);
        assert!(details["sda"].image.is_none());
    }

    #[test]
    fn test_details_serialize_flat() {
        let details = DiskDetails {
            file: "/img/a.qcow2".to_string(),
            image: Some(ImageInfo {
                format: "qcow2".to_string(),
                virtual_size: 1,
                actual_size: 1,
                backing_file: None,
            }),
        };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["file"], "/img/a.qcow2");
        assert_eq!(json["format"], "qcow2");
    }
}
