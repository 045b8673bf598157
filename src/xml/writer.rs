//! Nested XML writer (spec §4.B): an `enter`/`leave` stack discipline on
//! top of `quick_xml::Writer`, so handler code never has to balance tags
//! by hand.

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer as QxWriter;

use crate::error::{Result, ScanError};

pub struct NestedWriter {
    inner: QxWriter<Vec<u8>>,
    stack: Vec<String>,
}

impl NestedWriter {
    /// Opens `root` as the document element, declaring the given
    /// `xmlns:prefix="uri"` pairs on it.
    pub fn begin(root: &str, ns_table: &[(&str, &str)]) -> Result<Self> {
        let mut inner = QxWriter::new(Vec::new());
        inner
            .write_event(Event::Decl(quick_xml::events::BytesDecl::new(
                "1.0", Some("UTF-8"), None,
            )))
            .map_err(|e| ScanError::Protocol(format!("xml write error: {e}")))?;

        let mut start = BytesStart::new(root);
        for (uri, prefix) in ns_table {
            start.push_attribute((format!("xmlns:{prefix}").as_str(), *uri));
        }
        inner
            .write_event(Event::Start(start))
            .map_err(|e| ScanError::Protocol(format!("xml write error: {e}")))?;

        Ok(Self {
            inner,
            stack: vec![root.to_string()],
        })
    }

    /// Opens a new child element `name`, nesting under the current one.
    pub fn enter(&mut self, name: &str) -> Result<&mut Self> {
        self.inner
            .write_event(Event::Start(BytesStart::new(name)))
            .map_err(|e| ScanError::Protocol(format!("xml write error: {e}")))?;
        self.stack.push(name.to_string());
        Ok(self)
    }

    /// Closes the innermost open element.
    pub fn leave(&mut self) -> Result<&mut Self> {
        let name = self
            .stack
            .pop()
            .ok_or_else(|| ScanError::Protocol("xml writer: leave() with nothing open".into()))?;
        self.inner
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(|e| ScanError::Protocol(format!("xml write error: {e}")))?;
        Ok(self)
    }

    /// Writes a complete `<name>text</name>` leaf element.
    pub fn add_text(&mut self, name: &str, text: &str) -> Result<&mut Self> {
        self.inner
            .write_event(Event::Start(BytesStart::new(name)))
            .map_err(|e| ScanError::Protocol(format!("xml write error: {e}")))?;
        self.inner
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(|e| ScanError::Protocol(format!("xml write error: {e}")))?;
        self.inner
            .write_event(Event::End(BytesEnd::new(name)))
            .map_err(|e| ScanError::Protocol(format!("xml write error: {e}")))?;
        Ok(self)
    }

    pub fn add_uint(&mut self, name: &str, n: u64) -> Result<&mut Self> {
        self.add_text(name, &n.to_string())
    }

    /// Closes every still-open element (including the root) and returns
    /// the serialized document.
    pub fn finish_compact(mut self) -> Result<Vec<u8>> {
        while !self.stack.is_empty() {
            self.leave()?;
        }
        Ok(self.inner.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_nested_document_and_closes_all_tags() {
        let ns = [("http://schemas.hp.com/imaging/escl/2011/05/03", "scan")];
        let mut w = NestedWriter::begin("scan:ScanSettings", &ns).unwrap();
        w.enter("scan:ScanRegions").unwrap();
        w.enter("scan:ScanRegion").unwrap();
        w.add_uint("scan:Height", 3300).unwrap();
        w.add_uint("scan:Width", 2550).unwrap();
        w.leave().unwrap(); // ScanRegion
        w.leave().unwrap(); // ScanRegions
        w.add_text("scan:ColorMode", "RGB24").unwrap();
        let bytes = w.finish_compact().unwrap();
        let xml = String::from_utf8(bytes).unwrap();

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<scan:ScanSettings xmlns:scan="));
        assert!(xml.contains("<scan:Height>3300</scan:Height>"));
        assert!(xml.contains("<scan:ColorMode>RGB24</scan:ColorMode>"));
        assert!(xml.trim_end().ends_with("</scan:ScanSettings>"));
    }

    #[test]
    fn leave_without_open_element_errors() {
        let mut w = NestedWriter::begin("root", &[]).unwrap();
        w.leave().unwrap(); // closes root
        assert!(w.leave().is_err());
    }
}
