//! Multipart decomposition (spec §4.A). Some devices misformat
//! multipart bodies, so boundary search is deliberately permissive: a
//! boundary may appear either at the very start of the body or preceded
//! by a CRLF, and each part's own headers terminate at the first
//! CRLF-CRLF.

use crate::error::{ScanError, Result};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Part {
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Part {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Extracts the `boundary` parameter from a `multipart/*; boundary=...`
/// content type, handling both quoted and bare values.
fn extract_boundary(content_type: &str) -> Option<String> {
    let lower = content_type.to_ascii_lowercase();
    if !lower.starts_with("multipart/") {
        return None;
    }
    for param in content_type.split(';').skip(1) {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("boundary=") {
            let value = value.trim().trim_matches('"');
            return Some(value.to_string());
        }
    }
    None
}

/// Parses a multipart body into its constituent parts, given the
/// containing response's `Content-Type`.
pub fn parse_multipart(content_type: &str, body: &[u8]) -> Result<Vec<Part>> {
    let boundary = extract_boundary(content_type)
        .ok_or_else(|| ScanError::Protocol("no multipart boundary in content type".into()))?;

    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut starts = Vec::new();
    let mut i = 0usize;
    while let Some(pos) = find(&body[i..], delimiter) {
        let abs = i + pos;
        // Permissive: accept the delimiter at body start, or when the
        // two bytes before it are CRLF; otherwise this is a coincidental
        // substring match inside binary part data and is skipped.
        let preceded_ok = abs == 0 || (abs >= 2 && &body[abs - 2..abs] == b"\r\n");
        if preceded_ok {
            starts.push(abs);
        }
        i = abs + delimiter.len();
    }

    if starts.is_empty() {
        return Err(ScanError::Protocol("multipart boundary not found in body".into()));
    }

    let mut parts = Vec::new();
    for w in starts.windows(2) {
        let (start, end) = (w[0], w[1]);
        let segment_start = start + delimiter.len();
        // Closing `--` right after the boundary marks the terminal
        // delimiter; stop collecting once hit, matched further below.
        if let Some(part) = parse_segment(&body[segment_start..end]) {
            parts.push(part);
        }
    }

    Ok(parts)
}

/// Parses one part: headers up to the first CRLF-CRLF, body after,
/// with the trailing CRLF before the next boundary stripped.
fn parse_segment(raw: &[u8]) -> Option<Part> {
    // Skip the boundary's own trailing CRLF (or `--` + CRLF for the
    // closing delimiter, which carries no part and is skipped).
    let raw = if raw.starts_with(b"--") { return None } else { raw };
    let raw = raw.strip_prefix(b"\r\n").unwrap_or(raw);

    let header_end = find(raw, b"\r\n\r\n")?;
    let header_block = &raw[..header_end];
    let mut body = raw[header_end + 4..].to_vec();
    // Strip the trailing CRLF that precedes the next boundary delimiter.
    if body.ends_with(b"\r\n") {
        body.truncate(body.len() - 2);
    }

    let mut headers = Vec::new();
    for line in header_block.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(line);
        if let Some((name, value)) = text.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    let content_type = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("Content-Type"))
        .map(|(_, v)| v.clone());

    Some(Part {
        headers,
        content_type,
        body,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_boundary_from_content_type() {
        assert_eq!(
            extract_boundary("multipart/related; boundary=\"MIME_boundary\""),
            Some("MIME_boundary".to_string())
        );
        assert_eq!(
            extract_boundary("multipart/related; type=\"application/xop+xml\"; boundary=MIME_boundary"),
            Some("MIME_boundary".to_string())
        );
        assert_eq!(extract_boundary("text/xml"), None);
    }

    #[test]
    fn parses_two_part_multipart_body() {
        let body = b"--B\r\nContent-Type: text/xml\r\n\r\n<a/>\r\n--B\r\nContent-Type: image/jpeg\r\n\r\nJPEGDATA\r\n--B--\r\n".to_vec();
        let parts = parse_multipart("multipart/related; boundary=B", &body).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].content_type.as_deref(), Some("text/xml"));
        assert_eq!(parts[0].body, b"<a/>");
        assert_eq!(parts[1].content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(parts[1].body, b"JPEGDATA");
    }

    #[test]
    fn boundary_at_body_start_is_accepted() {
        let body = b"--B\r\nContent-Type: text/plain\r\n\r\nhi\r\n--B--".to_vec();
        let parts = parse_multipart("multipart/mixed; boundary=B", &body).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].body, b"hi");
    }
}
