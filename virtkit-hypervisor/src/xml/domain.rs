//! Domain definition document builder.

use tracing::debug;

use super::{Element, SerialTemplateRegistry};
use crate::error::{HypervisorError, Result};
use crate::family::FamilyProfile;
use crate::types::*;

/// Disks are lettered a..z; more than this is rejected.
pub const MAX_DISKS: usize = 26;

/// Builder for libvirt domain XML.
pub struct DomainDocumentBuilder<'a> {
    request: &'a DomainRequest,
    profile: &'static FamilyProfile,
    serial: &'a SerialTemplateRegistry,
}

impl<'a> DomainDocumentBuilder<'a> {
    pub fn new(request: &'a DomainRequest, serial: &'a SerialTemplateRegistry) -> Self {
        Self {
            request,
            profile: request.family.profile(),
            serial,
        }
    }

    /// Build and serialize the domain document.
    pub fn build(&self) -> Result<String> {
        self.build_document()?.to_xml_string()
    }

    /// Build the document tree. Fails before producing anything when the
    /// request is incomplete or carries more than [`MAX_DISKS`] disks.
    pub fn build_document(&self) -> Result<Element> {
        let memory_kib = self.validate()?;
        let request = self.request;

        let domain = Element::new("domain")
            .attr("type", self.profile.domain_type)
            .child(Element::new("name").text(&request.name))
            .child(Element::new("vcpu").text(request.vcpus))
            .child(Element::new("memory").attr("unit", "KiB").text(memory_kib))
            .child(self.build_os())
            .child(self.build_devices())
            .child(Element::new("features").child(Element::new("acpi")));

        debug!(
            vm = %request.name,
            family = %request.family,
            disks = request.disks.len(),
            interfaces = request.interfaces.len(),
            "Built domain document"
        );

        Ok(domain)
    }

    fn validate(&self) -> Result<u64> {
        let request = self.request;
        if request.name.trim().is_empty() {
            return Err(HypervisorError::Validation("VM name must not be empty".to_string()));
        }
        if request.vcpus == 0 {
            return Err(HypervisorError::Validation(format!(
                "VM {} must have at least one vCPU",
                request.name
            )));
        }
        if request.memory_mb == 0 {
            return Err(HypervisorError::Validation(format!(
                "VM {} must have memory greater than zero",
                request.name
            )));
        }
        if request.disks.len() > MAX_DISKS {
            return Err(HypervisorError::Validation(format!(
                "VM {} has {} disks, at most {} are supported",
                request.name,
                request.disks.len(),
                MAX_DISKS
            )));
        }
        request.memory_mb.checked_mul(1024).ok_or_else(|| {
            HypervisorError::Validation(format!("memory size {} MB is out of range", request.memory_mb))
        })
    }

    fn build_os(&self) -> Element {
        let boot = self
            .request
            .boot_devices
            .as_deref()
            .unwrap_or(&[BootDevice::Hd]);

        Element::new("os")
            .child(Element::new("type").text("hvm"))
            .children(
                boot.iter()
                    .map(|dev| Element::new("boot").attr("dev", dev.as_str())),
            )
    }

    fn build_devices(&self) -> Element {
        let mut devices = Element::new("devices");

        for (index, disk) in self.request.disks.iter().enumerate() {
            devices.push(self.build_disk(index, disk));
        }

        if let Some(model) = self.profile.scsi_controller {
            devices.push(
                Element::new("controller")
                    .attr("type", "scsi")
                    .attr("index", 0)
                    .attr("model", model),
            );
        }

        for nic in &self.request.interfaces {
            devices.push(build_interface(nic));
        }

        devices.push(
            Element::new("graphics")
                .attr("type", "vnc")
                .attr("listen", "0.0.0.0")
                .attr("autoport", "yes"),
        );

        if let Some(serial) = &self.request.serial {
            devices = devices.children(self.serial.render(serial));
        }

        devices
    }

    fn build_disk(&self, index: usize, disk: &DiskSpec) -> Element {
        let dev = format!("{}{}", self.profile.disk_prefix, disk_letter(index));

        let mut element = Element::new("disk")
            .attr("type", "file")
            .attr("device", "disk")
            .child(Element::new("source").attr("file", disk.source_path(&self.request.name)))
            .child(
                Element::new("target")
                    .attr("dev", dev)
                    .attr("bus", disk.model.as_str()),
            );

        if self.profile.drive_address {
            element.push(
                Element::new("address")
                    .attr("type", "drive")
                    .attr("controller", 0)
                    .attr("bus", 0)
                    .attr("target", 0)
                    .attr("unit", index),
            );
        }

        if self.profile.qemu_driver {
            element.push(
                Element::new("driver")
                    .attr("name", "qemu")
                    .attr("type", disk.format.as_str())
                    .attr("cache", "none")
                    .attr("io", "native"),
            );
        }

        element
    }
}

fn build_interface(nic: &InterfaceSpec) -> Element {
    let kind = nic.kind.as_str();
    Element::new("interface")
        .attr("type", kind)
        .child(Element::new("source").attr(kind, &nic.source))
        .child(Element::new("mac").attr("address", nic.mac))
        .child(Element::new("model").attr("type", nic.model.as_str()))
}

/// Letter for the disk at `index`; callers bound `index` by [`MAX_DISKS`].
fn disk_letter(index: usize) -> char {
    (b'a' + index as u8) as char
}
