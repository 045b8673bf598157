//! Path-addressed streaming XML reader (spec §4.B). Namespace prefixes
//! used in the document are renormalised to a caller-supplied table so
//! handler code can path-match against stable prefixes regardless of
//! what prefix a given device chose (e.g. always `scan:` for the eSCL
//! schema, never whatever alias the device's XML happened to use).

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::Reader as QxReader;

use crate::error::{Result, ScanError};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Kind {
    Start,
    Text,
    End,
}

#[derive(Clone, Debug)]
struct Node {
    kind: Kind,
    path: String,
    depth: usize,
    value: String,
}

/// A namespace-aware, path-addressed cursor over a parsed XML document.
pub struct PathReader {
    nodes: Vec<Node>,
    pos: usize,
}

impl PathReader {
    /// Parses `xml`, renormalising namespace prefixes per `ns_table`
    /// (a map from namespace URI to the stable prefix handler code
    /// should see, e.g. `("http://schemas.hp.com/imaging/escl/2011/05/03", "scan")`).
    pub fn begin(xml: &[u8], ns_table: &[(&str, &str)]) -> Result<Self> {
        let uri_to_prefix: HashMap<&str, &str> = ns_table.iter().copied().collect();

        let mut reader = QxReader::from_reader(xml);
        reader.config_mut().trim_text(true);

        let mut nodes = Vec::new();
        let mut stack: Vec<String> = Vec::new();
        let mut scopes: Vec<HashMap<String, String>> = vec![HashMap::new()];
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader
                .read_event_into(&mut buf)
                .map_err(|e| ScanError::Protocol(format!("xml parse error: {e}")))?
            {
                Event::Eof => break,
                Event::Start(e) => {
                    let scope = push_scope(&scopes, &e)?;
                    let stable = resolve_name(&e, &uri_to_prefix, &scope)?;
                    scopes.push(scope);
                    stack.push(stable);
                    nodes.push(Node {
                        kind: Kind::Start,
                        path: stack.join("/"),
                        depth: stack.len(),
                        value: String::new(),
                    });
                }
                Event::Empty(e) => {
                    let scope = push_scope(&scopes, &e)?;
                    let stable = resolve_name(&e, &uri_to_prefix, &scope)?;
                    stack.push(stable);
                    nodes.push(Node {
                        kind: Kind::Start,
                        path: stack.join("/"),
                        depth: stack.len(),
                        value: String::new(),
                    });
                    nodes.push(Node {
                        kind: Kind::End,
                        path: stack.join("/"),
                        depth: stack.len(),
                        value: String::new(),
                    });
                    stack.pop();
                }
                Event::End(_) => {
                    let path = stack.join("/");
                    let depth = stack.len();
                    nodes.push(Node {
                        kind: Kind::End,
                        path,
                        depth,
                        value: String::new(),
                    });
                    stack.pop();
                    scopes.pop();
                }
                Event::Text(t) => {
                    let text = t
                        .unescape()
                        .map(|c| c.into_owned())
                        .unwrap_or_default();
                    if !text.trim().is_empty() {
                        nodes.push(Node {
                            kind: Kind::Text,
                            path: stack.join("/"),
                            depth: stack.len(),
                            value: text.trim().to_string(),
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(Self { nodes, pos: 0 })
    }

    /// Advances to the next node (start, text or end); returns `false`
    /// at end of document.
    pub fn next(&mut self) -> bool {
        if self.pos >= self.nodes.len() {
            return false;
        }
        self.pos += 1;
        true
    }

    fn current(&self) -> Option<&Node> {
        if self.pos == 0 {
            None
        } else {
            self.nodes.get(self.pos - 1)
        }
    }

    pub fn node_path(&self) -> &str {
        self.current().map(|n| n.path.as_str()).unwrap_or("")
    }

    pub fn node_value(&self) -> &str {
        self.current().map(|n| n.value.as_str()).unwrap_or("")
    }

    pub fn node_value_uint(&self) -> Option<u64> {
        self.node_value().trim().parse().ok()
    }

    pub fn depth(&self) -> usize {
        self.current().map(|n| n.depth).unwrap_or(0)
    }

    /// Advances until the current node's depth is at or above `level`,
    /// skipping over any deeper subtree (used to jump to the next
    /// sibling without walking its children one at a time).
    pub fn deep_next(&mut self, level: usize) -> bool {
        while self.next() {
            if self.depth() <= level {
                return true;
            }
        }
        false
    }

    /// Finds the first text value whose path ends with `suffix`,
    /// scanning forward from the current position. A thin convenience
    /// built on `next`/`node_path`/`node_value` that every handler uses
    /// to pull a single scalar field out of a capability document.
    pub fn find_text(&mut self, suffix: &str) -> Option<String> {
        let start = self.pos;
        while self.next() {
            if self.node_path().ends_with(suffix) && !self.node_value().is_empty() {
                return Some(self.node_value().to_string());
            }
        }
        self.pos = start;
        None
    }

    pub fn reset(&mut self) {
        self.pos = 0;
    }
}

fn push_scope(
    scopes: &[HashMap<String, String>],
    start: &quick_xml::events::BytesStart,
) -> Result<HashMap<String, String>> {
    let mut scope = scopes.last().cloned().unwrap_or_default();
    for attr in start.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        if key == "xmlns" {
            scope.insert(String::new(), String::from_utf8_lossy(&attr.value).to_string());
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.insert(prefix.to_string(), String::from_utf8_lossy(&attr.value).to_string());
        }
    }
    Ok(scope)
}

fn resolve_name(
    start: &quick_xml::events::BytesStart,
    uri_to_prefix: &HashMap<&str, &str>,
    scope: &HashMap<String, String>,
) -> Result<String> {
    let raw = String::from_utf8_lossy(start.name().as_ref()).to_string();
    let (prefix, local) = match raw.split_once(':') {
        Some((p, l)) => (p.to_string(), l.to_string()),
        None => (String::new(), raw.clone()),
    };
    let uri = scope.get(&prefix).cloned();
    let stable_prefix = uri
        .as_deref()
        .and_then(|u| uri_to_prefix.get(u).copied())
        .unwrap_or(prefix.as_str());
    if stable_prefix.is_empty() {
        Ok(local)
    } else {
        Ok(format!("{stable_prefix}:{local}"))
    }
}
