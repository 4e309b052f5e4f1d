//! Typed XML document tree for libvirt domain and volume definitions.
//!
//! Documents are assembled as an [`Element`] tree and serialized once with
//! the quick-xml indented writer. The same tree type is produced when a
//! descriptor returned by the control plane is parsed back.

mod domain;
mod serial;
mod volume;

pub use domain::{DomainDocumentBuilder, MAX_DISKS};
pub use serial::{SerialTemplate, SerialTemplateRegistry};
pub use volume::VolumeDocumentBuilder;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{HypervisorError, Result};

/// A node in the document tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element with ordered attributes and children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add (or replace) an attribute.
    pub fn attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        let key = key.into();
        let value = value.to_string();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = value,
            None => self.attributes.push((key, value)),
        }
        self
    }

    /// Append a child element.
    pub fn child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    /// Append several child elements.
    pub fn children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.children
            .extend(children.into_iter().map(Node::Element));
        self
    }

    /// Append a text node.
    pub fn text(mut self, text: impl ToString) -> Self {
        self.children.push(Node::Text(text.to_string()));
        self
    }

    pub fn push(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.get_attr(key).is_some()
    }

    /// Child elements in document order.
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First direct child element with the given name.
    pub fn find(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    /// All descendant elements with the given name, in document order.
    ///
    /// The element itself is not included.
    pub fn descendants(&self, name: &str) -> Vec<&Element> {
        let mut found = Vec::new();
        self.collect_descendants(Some(name), &mut found);
        found
    }

    /// Every descendant element regardless of name, in document order.
    pub fn all_descendants(&self) -> Vec<&Element> {
        let mut found = Vec::new();
        self.collect_descendants(None, &mut found);
        found
    }

    fn collect_descendants<'a>(&'a self, name: Option<&str>, found: &mut Vec<&'a Element>) {
        for child in self.elements() {
            if name.map_or(true, |n| child.name == n) {
                found.push(child);
            }
            child.collect_descendants(name, found);
        }
    }

    /// Concatenated text of this element and all its descendants.
    pub fn text_content(&self) -> String {
        let mut text = String::new();
        for node in &self.children {
            match node {
                Node::Text(t) => text.push_str(t),
                Node::Element(e) => text.push_str(&e.text_content()),
            }
        }
        text
    }

    /// Serialize the tree as an indented document.
    pub fn to_xml_string(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        self.write(&mut writer)?;
        String::from_utf8(writer.into_inner())
            .map_err(|e| HypervisorError::XmlError(e.to_string()))
    }

    fn write(&self, writer: &mut Writer<Vec<u8>>) -> Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        if self.children.is_empty() {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }

        writer.write_event(Event::Start(start))?;
        for node in &self.children {
            match node {
                Node::Element(e) => e.write(writer)?,
                Node::Text(t) => writer.write_event(Event::Text(BytesText::new(t)))?,
            }
        }
        writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))?;
        Ok(())
    }

    /// Parse a document into a tree. Whitespace-only text is dropped.
    pub fn parse(xml: &str) -> Result<Element> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => stack.push(element_from_start(&e)?),
                Event::Empty(e) => {
                    let element = element_from_start(&e)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| {
                        HypervisorError::XmlError("unexpected closing tag".to_string())
                    })?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(e) => {
                    let text = e.unescape()?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(text.into_owned()));
                    }
                }
                Event::CData(e) => {
                    let text = String::from_utf8_lossy(&e.into_inner()).into_owned();
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(text));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(HypervisorError::XmlError(format!(
                "unclosed element <{}>",
                open.name
            )));
        }
        root.ok_or_else(|| HypervisorError::XmlError("document has no root element".to_string()))
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr.map_err(|e| HypervisorError::XmlError(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None if root.is_none() => *root = Some(element),
        None => {
            return Err(HypervisorError::XmlError(
                "document has more than one root element".to_string(),
            ))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_and_parse() {
        let doc = Element::new("volume")
            .child(Element::new("name").text("web01/system.qcow2"))
            .child(Element::new("capacity").attr("unit", "KiB").text(1024))
            .child(Element::new("source"));

        let xml = doc.to_xml_string().unwrap();
        assert!(xml.contains("<capacity unit=\"KiB\">1024</capacity>"));
        assert!(xml.contains("<source/>"));

        let parsed = Element::parse(&xml).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn test_text_and_attributes_are_escaped() {
        let doc = Element::new("name").attr("note", "a<b & \"c\"").text("x & y");
        let xml = doc.to_xml_string().unwrap();
        assert!(!xml.contains("x & y"));

        let parsed = Element::parse(&xml).unwrap();
        assert_eq!(parsed.get_attr("note"), Some("a<b & \"c\""));
        assert_eq!(parsed.text_content(), "x & y");
    }

    #[test]
    fn test_descendants_in_document_order() {
        let xml = "<domain><devices><disk><target dev='vda'/></disk>\
                   <disk><target dev='vdb'/></disk></devices></domain>";
        let doc = Element::parse(xml).unwrap();

        let devs: Vec<_> = doc
            .descendants("target")
            .iter()
            .filter_map(|t| t.get_attr("dev"))
            .collect();
        assert_eq!(devs, ["vda", "vdb"]);
        assert!(doc.descendants("domain").is_empty());
        assert!(doc.find("devices").is_some());
        assert!(doc.find("disk").is_none());
    }

    #[test]
    fn test_attr_replaces_existing() {
        let e = Element::new("graphics").attr("port", -1).attr("port", 5900);
        assert_eq!(e.attributes.len(), 1);
        assert_eq!(e.get_attr("port"), Some("5900"));
    }

    #[test]
    fn test_malformed_documents_rejected() {
        assert!(Element::parse("").is_err());
        assert!(Element::parse("<a><b></a>").is_err());
        assert!(Element::parse("<a/><b/>").is_err());
    }
}
