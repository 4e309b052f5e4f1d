//! Storage volume definition document builder.

use super::Element;
use crate::error::{HypervisorError, Result};
use crate::image::ImageInfo;
use crate::types::DiskSpec;

/// Builder for libvirt storage volume XML.
///
/// Without image metadata the volume takes the format and size of the
/// resolved disk. With it, the format is the image's and the capacity is
/// large enough to hold the image's virtual size.
pub struct VolumeDocumentBuilder<'a> {
    vm_name: &'a str,
    disk: &'a DiskSpec,
    image: Option<&'a ImageInfo>,
}

impl<'a> VolumeDocumentBuilder<'a> {
    pub fn new(vm_name: &'a str, disk: &'a DiskSpec) -> Self {
        Self {
            vm_name,
            disk,
            image: None,
        }
    }

    /// Describe a volume that will receive the given source image.
    pub fn with_image(mut self, image: &'a ImageInfo) -> Self {
        self.image = Some(image);
        self
    }

    /// Volume name, `<vm>/<disk>.<format>`.
    pub fn volume_name(&self) -> String {
        format!("{}/{}", self.vm_name, self.disk.file_name())
    }

    pub fn build(&self) -> Result<String> {
        self.build_document()?.to_xml_string()
    }

    pub fn build_document(&self) -> Result<Element> {
        let disk = self.disk;
        if disk.size_mb == 0 {
            return Err(HypervisorError::Validation(format!(
                "volume for disk '{}' must have a size greater than zero",
                disk.name
            )));
        }
        let profile_kib = disk.size_mb.checked_mul(1024).ok_or_else(|| {
            HypervisorError::Validation(format!("disk size {} MB is out of range", disk.size_mb))
        })?;

        let (format, capacity_kib) = match self.image {
            Some(image) => (
                image.format.as_str(),
                profile_kib.max(image.virtual_size.div_ceil(1024)),
            ),
            None => (disk.format.as_str(), profile_kib),
        };

        Ok(Element::new("volume")
            .child(Element::new("name").text(self.volume_name()))
            .child(Element::new("key").text(format!("{}/{}", self.vm_name, disk.name)))
            .child(Element::new("source"))
            .child(Element::new("capacity").attr("unit", "KiB").text(capacity_kib))
            .child(Element::new("allocation").attr("unit", "KiB").text(0))
            .child(
                Element::new("target")
                    .child(Element::new("path").text(disk.source_path(self.vm_name)))
                    .child(Element::new("format").attr("type", format))
                    .child(
                        Element::new("permissions")
                            .child(Element::new("mode").text("00"))
                            .child(Element::new("owner").text(0))
                            .child(Element::new("group").text(0)),
                    ),
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DiskBus, DiskFormat};

    fn system_disk() -> DiskSpec {
        DiskSpec {
            name: "system".to_string(),
            size_mb: 8192,
            format: DiskFormat::Qcow2,
            model: DiskBus::Virtio,
            pool: "/srv/images".to_string(),
            image: None,
        }
    }

    #[test]
    fn test_volume_document() {
        let disk = system_disk();
        let doc = VolumeDocumentBuilder::new("web01", &disk).build_document().unwrap();

        assert_eq!(doc.find("name").unwrap().text_content(), "web01/system.qcow2");
        assert_eq!(doc.find("key").unwrap().text_content(), "web01/system");
        assert_eq!(doc.find("capacity").unwrap().text_content(), "8388608");
        assert_eq!(doc.find("allocation").unwrap().text_content(), "0");

        let target = doc.find("target").unwrap();
        assert_eq!(
            target.find("path").unwrap().text_content(),
            "/srv/images/web01/system.qcow2"
        );
        assert_eq!(target.find("format").unwrap().get_attr("type"), Some("qcow2"));
        let perms = target.find("permissions").unwrap();
        assert_eq!(perms.find("mode").unwrap().text_content(), "00");
    }

    #[test]
    fn test_image_metadata_sets_format_and_capacity() {
        let disk = system_disk();
        let image = ImageInfo {
            format: "raw".to_string(),
            virtual_size: 20 * 1024 * 1024 * 1024 + 1,
            actual_size: 4096,
            backing_file: None,
        };
        let doc = VolumeDocumentBuilder::new("web01", &disk)
            .with_image(&image)
            .build_document()
            .unwrap();

        let target = doc.find("target").unwrap();
        assert_eq!(target.find("format").unwrap().get_attr("type"), Some("raw"));
        assert_eq!(doc.find("capacity").unwrap().text_content(), "20971521");

        // A small image never shrinks the requested size.
        let small = ImageInfo { virtual_size: 1024 * 1024, ..image };
        let doc = VolumeDocumentBuilder::new("web01", &disk)
            .with_image(&small)
            .build_document()
            .unwrap();
        assert_eq!(doc.find("capacity").unwrap().text_content(), "8388608");
    }
}
