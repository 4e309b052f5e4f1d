//! Read side: structured state parsed from a domain descriptor.
//!
//! Everything here is a pure function of the document text. Nothing is
//! cached; callers re-parse whenever they fetch a fresh descriptor.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::xml::Element;

/// Attribute map captured verbatim from an element.
pub type AttributeMap = BTreeMap<String, String>;

/// One interface of a domain, keyed by MAC in [`DomainDescriptor`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InterfaceDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Host-side device name (e.g. "vnet0")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<AttributeMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<AttributeMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<AttributeMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtualport: Option<AttributeMap>,
}

/// Parsed domain descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DomainDescriptor {
    pub name: String,
    /// Target device → backing source
    pub disks: BTreeMap<String, String>,
    /// MAC → interface
    pub interfaces: BTreeMap<String, InterfaceDescriptor>,
    pub graphics: BTreeMap<String, String>,
}

impl DomainDescriptor {
    pub fn parse(xml: &str) -> Result<Self> {
        let doc = Element::parse(xml)?;
        Ok(Self {
            name: doc.find("name").map(Element::text_content).unwrap_or_default(),
            disks: disks_of(&doc),
            interfaces: interfaces_of(&doc),
            graphics: graphics_of(&doc),
        })
    }
}

pub fn parse_interfaces(xml: &str) -> Result<BTreeMap<String, InterfaceDescriptor>> {
    Ok(interfaces_of(&Element::parse(xml)?))
}

pub fn parse_disks(xml: &str) -> Result<BTreeMap<String, String>> {
    Ok(disks_of(&Element::parse(xml)?))
}

/// Disks backed by a local file (`<source file=...>`), keyed by target
/// device. Block devices and network sources are left out.
pub fn parse_file_disks(xml: &str) -> Result<BTreeMap<String, String>> {
    let doc = Element::parse(xml)?;
    let mut disks = BTreeMap::new();

    for disk in doc.descendants("disk") {
        if disk.get_attr("type").map_or(false, |kind| kind != "file") {
            continue;
        }
        let file = disk
            .descendants("source")
            .first()
            .and_then(|source| source.get_attr("file"));
        let dev = disk
            .descendants("target")
            .first()
            .and_then(|target| target.get_attr("dev"));
        if let (Some(file), Some(dev)) = (file, dev) {
            if !file.is_empty() {
                disks.insert(dev.to_string(), file.to_string());
            }
        }
    }
    Ok(disks)
}

pub fn parse_graphics(xml: &str) -> Result<BTreeMap<String, String>> {
    Ok(graphics_of(&Element::parse(xml)?))
}

/// Every interface MAC address, in document order.
pub fn parse_macs(xml: &str) -> Result<Vec<String>> {
    let doc = Element::parse(xml)?;
    Ok(doc
        .descendants("interface")
        .into_iter()
        .flat_map(|iface| iface.descendants("mac"))
        .filter_map(|mac| mac.get_attr("address"))
        .map(str::to_string)
        .collect())
}

fn interfaces_of(doc: &Element) -> BTreeMap<String, InterfaceDescriptor> {
    let mut interfaces = BTreeMap::new();

    for devices in doc.descendants("devices") {
        for iface in devices.descendants("interface") {
            if let Some(nic) = interface_of(iface) {
                interfaces.insert(nic.mac.clone(), nic);
            }
        }
    }
    interfaces
}

/// `None` for interfaces without a MAC.
fn interface_of(iface: &Element) -> Option<InterfaceDescriptor> {
    let mut nic = InterfaceDescriptor {
        kind: iface.get_attr("type").unwrap_or_default().to_string(),
        ..Default::default()
    };
    let mut mac = None;

    for node in iface.all_descendants() {
        match node.name.as_str() {
            "mac" => mac = node.get_attr("address").map(str::to_string),
            "model" => nic.model = node.get_attr("type").map(str::to_string),
            "target" => nic.target = node.get_attr("dev").map(str::to_string),
            "driver" => nic.driver = Some(attribute_map(node)),
            "source" => nic.source = Some(attribute_map(node)),
            "address" => nic.address = Some(attribute_map(node)),
            "virtualport" => {
                let mut port = attribute_map(node);
                port.entry("type".to_string()).or_default();
                nic.virtualport = Some(port);
            }
            _ => {}
        }
    }

    nic.mac = mac.filter(|m| !m.is_empty())?;
    Some(nic)
}

fn disks_of(doc: &Element) -> BTreeMap<String, String> {
    let mut disks = BTreeMap::new();

    for disk in doc.descendants("disk") {
        let (Some(source), Some(target)) = (
            disk.descendants("source").first().copied(),
            disk.descendants("target").first().copied(),
        ) else {
            continue;
        };
        let Some(dev) = target.get_attr("dev") else {
            continue;
        };

        let backing = if let Some(file) = source.get_attr("file") {
            file.to_string()
        } else if let Some(block) = source.get_attr("dev") {
            block.to_string()
        } else if let (Some(protocol), Some(name)) =
            (source.get_attr("protocol"), source.get_attr("name"))
        {
            format!("{}:{}", protocol, name)
        } else {
            String::new()
        };

        if !backing.is_empty() {
            disks.insert(dev.to_string(), backing);
        }
    }
    disks
}

fn graphics_of(doc: &Element) -> BTreeMap<String, String> {
    let mut graphics: BTreeMap<String, String> = [
        ("autoport", "None"),
        ("keymap", "None"),
        ("listen", "None"),
        ("port", "None"),
        ("type", "vnc"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    for element in doc.descendants("graphics") {
        graphics.extend(attribute_map(element));
    }
    graphics
}

fn attribute_map(element: &Element) -> AttributeMap {
    element.attributes.iter().cloned().collect()
}
