//! `Query` and `HttpClient` — the async HTTP transport described in
//! spec §4.A. A `Query` is logically owned by its submitter for its
//! lifetime (spec §9 "Ownership of HTTP queries"); here that is modeled
//! as a spawned task plus an `AbortHandle` rather than a function-pointer
//! callback, since cancellation in async Rust is cooperative abort, not
//! a suppressed callback.

use std::sync::Mutex;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::{debug, warn};

use crate::error::{ScanError, ScanStatus};

use super::multipart::{Part, parse_multipart};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl From<Method> for reqwest::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// A single HTTP request/response pair. Request fields are set at
/// construction; response fields are filled in by [`HttpClient::submit`].
#[derive(Debug)]
pub struct Query {
    pub method: Method,
    pub uri: String,
    pub request_headers: HeaderMap,
    pub request_body: Option<Bytes>,

    status: Option<u16>,
    response_headers: HeaderMap,
    response_body: Bytes,
    response_content_type: Option<String>,
    transport_err: Option<String>,
    mp_parts: Option<Vec<Part>>,
}

impl Query {
    /// Builds a request. Sets `Host` from the URI and `Connection: close`
    /// unconditionally — a known device firmware family retains jobs in
    /// "Processing" for ~10s under keep-alive, so every request is sent
    /// on its own connection (spec §4.A).
    pub fn new(
        uri: impl Into<String>,
        method: Method,
        body: Option<Bytes>,
        content_type: Option<&str>,
    ) -> Self {
        let uri = uri.into();
        let mut headers = HeaderMap::new();
        headers.insert("Connection", HeaderValue::from_static("close"));
        if let Ok(parsed) = uri.parse::<reqwest::Url>() {
            if let Some(host) = parsed.host_str() {
                let port = parsed
                    .port()
                    .map(|p| format!("{host}:{p}"))
                    .unwrap_or_else(|| host.to_string());
                if let Ok(v) = HeaderValue::from_str(&port) {
                    headers.insert("Host", v);
                }
            }
        }
        if let Some(ct) = content_type {
            if let Ok(v) = HeaderValue::from_str(ct) {
                headers.insert(reqwest::header::CONTENT_TYPE, v);
            }
        }
        Query {
            method,
            uri,
            request_headers: headers,
            request_body: body,
            status: None,
            response_headers: HeaderMap::new(),
            response_body: Bytes::new(),
            response_content_type: None,
            transport_err: None,
            mp_parts: None,
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl AsRef<str>) -> Self {
        if let Ok(v) = HeaderValue::from_str(value.as_ref()) {
            self.request_headers.insert(name, v);
        }
        self
    }

    /// Set on any non-2xx status OR transport failure. Code that must
    /// distinguish "device said no" from "device unreachable" should use
    /// [`Query::transport_error`] instead.
    pub fn error(&self) -> bool {
        self.transport_err.is_some()
            || !self
                .status
                .map(|s| (200..300).contains(&s))
                .unwrap_or(false)
    }

    /// Set only on transport failure (connection refused, timeout, DNS).
    pub fn transport_error(&self) -> bool {
        self.transport_err.is_some()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn response_body(&self) -> &[u8] {
        &self.response_body
    }

    pub fn response_content_type(&self) -> Option<&str> {
        self.response_content_type.as_deref()
    }

    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Lazily decomposes a multipart response body, caching the result.
    pub fn mp_parts(&mut self) -> crate::error::Result<&[Part]> {
        if self.mp_parts.is_none() {
            let ct = self
                .response_content_type
                .clone()
                .ok_or_else(|| ScanError::Protocol("no content type for multipart".into()))?;
            self.mp_parts = Some(parse_multipart(&ct, &self.response_body)?);
        }
        Ok(self.mp_parts.as_deref().unwrap_or(&[]))
    }

    pub fn get_mp_response_count(&mut self) -> crate::error::Result<usize> {
        Ok(self.mp_parts()?.len())
    }

    pub fn get_mp_response_data(&mut self, index: usize) -> crate::error::Result<&[u8]> {
        self.mp_parts()?
            .get(index)
            .map(|p| p.body.as_slice())
            .ok_or_else(|| ScanError::Protocol(format!("no multipart part {index}")))
    }
}

/// Owns the pending-query list; dropping the client cancels all
/// outstanding queries (spec §5 "Shared resources").
pub struct HttpClient {
    client: reqwest::Client,
    tasks: Mutex<Vec<tokio::task::AbortHandle>>,
}

impl HttpClient {
    pub fn new() -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(ScanError::from)?;
        Ok(Self {
            client,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Issues the request behind `query` and awaits the full response.
    /// At most one query is ever in flight per job (spec §5); callers
    /// enforce that, not the client.
    pub async fn submit(&self, mut query: Query) -> crate::error::Result<Query> {
        debug!(uri = %query.uri, method = ?query.method, "submitting http query");
        let req = self
            .client
            .request(query.method.into(), &query.uri)
            .headers(query.request_headers.clone());
        let req = if let Some(body) = query.request_body.clone() {
            req.body(body)
        } else {
            req
        };

        let handle = tokio::spawn(async move { req.send().await });
        let abort = handle.abort_handle();
        self.tasks.lock().unwrap().push(abort);

        match handle.await {
            Ok(Ok(resp)) => {
                query.status = Some(resp.status().as_u16());
                query.response_headers = resp.headers().clone();
                query.response_content_type = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                match resp.bytes().await {
                    Ok(bytes) => query.response_body = bytes,
                    Err(e) => query.transport_err = Some(e.to_string()),
                }
            }
            Ok(Err(e)) => {
                warn!(uri = %query.uri, error = %e, "transport error");
                query.transport_err = Some(e.to_string());
            }
            Err(join_err) => {
                if join_err.is_cancelled() {
                    return Err(ScanError::device(ScanStatus::Cancelled));
                }
                query.transport_err = Some(join_err.to_string());
            }
        }
        Ok(query)
    }
}

impl Drop for HttpClient {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_header_includes_port() {
        let q = Query::new("http://192.0.2.1:8080/eSCL/ScannerCapabilities", Method::Get, None, None);
        assert_eq!(
            q.request_headers.get("Host").unwrap().to_str().unwrap(),
            "192.0.2.1:8080"
        );
        assert_eq!(
            q.request_headers.get("Connection").unwrap().to_str().unwrap(),
            "close"
        );
    }

    #[test]
    fn error_distinguishes_device_vs_transport() {
        let mut q = Query::new("http://192.0.2.1/", Method::Get, None, None);
        q.status = Some(404);
        assert!(q.error());
        assert!(!q.transport_error());

        q.transport_err = Some("connection refused".into());
        assert!(q.error());
        assert!(q.transport_error());
    }
}
