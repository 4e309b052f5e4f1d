//! Serial/console templates looked up by transport kind.

use std::collections::HashMap;
use std::fmt;
use tracing::error;

use super::Element;
use crate::types::SerialOptions;

/// Renders the `<serial>` (and optional `<console>`) elements for one kind.
pub type SerialTemplate = fn(&SerialOptions) -> Vec<Element>;

/// Explicit registry of serial templates.
///
/// Built once at startup and handed to the domain builder.
#[derive(Clone)]
pub struct SerialTemplateRegistry {
    templates: HashMap<String, SerialTemplate>,
}

impl SerialTemplateRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: impl Into<String>, template: SerialTemplate) {
        self.templates.insert(kind.into(), template);
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<_> = self.templates.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Render the serial section; unknown kinds yield nothing.
    pub fn render(&self, options: &SerialOptions) -> Vec<Element> {
        match self.templates.get(&options.kind) {
            Some(template) => template(options),
            None => {
                error!(kind = %options.kind, "No serial template registered for transport");
                Vec::new()
            }
        }
    }
}

impl Default for SerialTemplateRegistry {
    /// Registry with the `pty` and `tcp` (telnet) templates.
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("pty", pty_template);
        registry.register("tcp", tcp_template);
        registry
    }
}

impl fmt::Debug for SerialTemplateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTemplateRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

fn pty_template(options: &SerialOptions) -> Vec<Element> {
    let mut elements = vec![Element::new("serial")
        .attr("type", "pty")
        .child(Element::new("target").attr("port", 0))];

    if options.console {
        elements.push(
            Element::new("console")
                .attr("type", "pty")
                .child(Element::new("target").attr("type", "serial").attr("port", 0)),
        );
    }
    elements
}

fn tcp_template(options: &SerialOptions) -> Vec<Element> {
    let port = options.telnet_port.unwrap_or(23023);
    let source = || {
        Element::new("source")
            .attr("mode", "bind")
            .attr("host", "0.0.0.0")
            .attr("service", port)
    };

    let mut elements = vec![Element::new("serial")
        .attr("type", "tcp")
        .child(source())
        .child(Element::new("protocol").attr("type", "telnet"))
        .child(Element::new("target").attr("port", 0))];

    if options.console {
        elements.push(
            Element::new("console")
                .attr("type", "tcp")
                .child(source())
                .child(Element::new("protocol").attr("type", "telnet"))
                .child(Element::new("target").attr("type", "serial").attr("port", 0)),
        );
    }
    elements
}
