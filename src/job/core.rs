//! The single-event-loop aggregator (spec §5): owns the device
//! registry and hands out job handles. All registry mutation is
//! serialized behind one `tokio::sync::Mutex`, matching the spec's
//! "single event-loop task" model, while still exposing an async API
//! so callers aren't forced onto a particular executor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::discovery::{Override, Registry};
use crate::error::{Result, ScanError, ScanStatus};
use crate::http::HttpClient;
use crate::model::{Device, ScanParams};
use crate::proto::Handler;
use crate::raster::{self, DecodeParams, Decoder};

use super::Job;

/// Handle to one running job. Mirrors the host API's `read`/`cancel`
/// contract (spec §6) without any adaptor glue: `read_line` pulls one
/// decoded row at a time, decoding each page's bytes as they arrive
/// off the wire, and `cancel` is safe to call from anywhere including
/// signal context.
pub struct JobHandle {
    id: u64,
    device_name: String,
    cancel: Arc<AtomicBool>,
    pages: mpsc::Receiver<Vec<u8>>,
    current: Option<Box<dyn Decoder>>,
    task: JoinHandle<ScanStatus>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Decode parameters of the page currently being read
    /// (`pixels_per_line`, `lines`, `depth`, `format`, `bytes_per_line`
    /// from §6's host API contract), once a page has started decoding.
    pub fn current_params(&self) -> Option<DecodeParams> {
        self.current.as_ref().map(|d| d.params())
    }

    /// Fills `buf` (sized to `current_params().bytes_per_line`) with
    /// the next decoded row. `Ok(false)` means the whole job is out of
    /// pages (the job may still be running its final CHECK/CLEANUP;
    /// call `join` to learn the terminal status).
    pub async fn read_line(&mut self, buf: &mut [u8]) -> Result<bool> {
        loop {
            if let Some(decoder) = &mut self.current {
                match decoder.read_line(buf) {
                    Ok(()) => return Ok(true),
                    Err(ScanError::Eof) => self.current = None,
                    Err(e) => return Err(e),
                }
            }
            match self.pages.recv().await {
                Some(bytes) => self.current = Some(raster::open(&bytes)?),
                None => return Ok(false),
            }
        }
    }

    /// Request cancellation. Idempotent, and safe to call from signal
    /// context (spec §5) since it only flips a flag consumed at the
    /// job's next step.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Wait for the job to reach its terminal status.
    pub async fn join(self) -> ScanStatus {
        self.task.await.unwrap_or(ScanStatus::IoError)
    }
}

/// Owns the registry and issues job handles against it. One `Core` is
/// meant to be shared (typically behind an `Arc`) by every caller of
/// the library; its registry handle is the same `Arc<Mutex<Registry>>`
/// the `discovery::dnssd`/`discovery::wsd` background tasks take, so
/// devices they find show up here without any extra plumbing.
pub struct Core {
    registry: Arc<Mutex<Registry>>,
    http: Arc<HttpClient>,
    next_job_id: AtomicU64,
}

impl Core {
    pub fn new() -> Result<Self> {
        Ok(Self {
            registry: Arc::new(Mutex::new(Registry::new())),
            http: Arc::new(HttpClient::new()?),
            next_job_id: AtomicU64::new(1),
        })
    }

    /// The shared handle to hand to `discovery::dnssd::run` /
    /// `discovery::wsd::run`.
    pub fn registry_handle(&self) -> Arc<Mutex<Registry>> {
        self.registry.clone()
    }

    /// §6 "enumerate devices".
    pub async fn devices(&self) -> Vec<Device> {
        let registry = self.registry.lock().await;
        registry.names().filter_map(|n| registry.get(n).cloned()).collect()
    }

    /// §6 "open(name) -> handle". Here a `Device` snapshot stands in
    /// for the opaque handle; it carries everything a protocol handler
    /// needs.
    pub async fn open(&self, name: &str) -> Result<Device> {
        self.registry
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ScanError::Invalid(format!("no such device: {name}")))
    }

    /// Exempts `name` from discovery, or pre-populates its endpoints
    /// (spec §4.D "Static overrides").
    pub async fn set_override(&self, name: &str, over: Override) {
        self.registry.lock().await.set_override(name, over);
    }

    /// §6 "start -> schedules a job". Spawns the job's drive loop and
    /// returns immediately with a handle; the caller pulls rows via
    /// `JobHandle::read_line` as pages arrive and get decoded.
    pub fn start(&self, device: Device, params: ScanParams, mut handler: Handler) -> JobHandle {
        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let device_name = device.name.clone();
        let mut job = Job::new(device, params);
        let cancel = job.cancel_handle();
        let (tx, rx) = mpsc::channel(4);
        let http = self.http.clone();

        info!(job_id = id, device = %device_name, "job started");
        let task = tokio::spawn(async move { job.drive(&http, &mut handler, &tx).await });

        JobHandle {
            id,
            device_name,
            cancel,
            pages: rx,
            current: None,
            task,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, Protocol};

    #[tokio::test]
    async fn open_resolves_a_statically_overridden_device() {
        let core = Core::new().expect("client builds without a runtime-specific TLS backend issue");
        core.set_override(
            "Manual",
            Override::Endpoints(vec![Endpoint::new(Protocol::Escl, "http://192.0.2.9/eSCL/")]),
        )
        .await;

        let device = core.open("Manual").await.expect("override registers the device");
        assert_eq!(device.endpoints.len(), 1);
    }

    #[tokio::test]
    async fn open_rejects_an_unknown_name() {
        let core = Core::new().unwrap();
        assert!(core.open("NoSuchScanner").await.is_err());
    }
}
