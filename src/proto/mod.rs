//! Protocol handlers (spec §4.F): eSCL and WSD each expose the same
//! small operation table the job state machine drives. Per §9's design
//! note ("the operation table is small and stable, so a variant with
//! inlined dispatch is acceptable") this is a tagged enum rather than a
//! boxed trait object, which keeps every operation a plain `async fn`.

pub mod escl;
pub mod quirks;
pub mod wsd;

use crate::error::{Result, ScanStatus};
use crate::http::HttpClient;
use crate::model::{Device, DeviceCapabilities, ScanParams};

/// Outcome of a `load` step: either one decoded page, or "no more
/// pages" (platen: job done; ADF: end of feed, handled by `CHECK`).
pub enum LoadOutcome {
    Page(Vec<u8>),
    Done,
}

/// Outcome of a `check` step (spec §4.F.2 "Check"): either a retry
/// after a delay (only `Calibrating`/`LampWarming`), or a terminal
/// status for the job.
pub enum CheckOutcome {
    RetryAfter(std::time::Duration),
    Status(ScanStatus),
}

/// The two concrete handlers, dispatched by a `match` rather than
/// dynamic dispatch.
pub enum Handler {
    Escl(escl::EsclHandler),
    Wsd(wsd::WsdHandler),
}

impl Handler {
    pub async fn devcaps(&mut self, http: &HttpClient, device: &Device) -> Result<DeviceCapabilities> {
        match self {
            Handler::Escl(h) => h.devcaps(http, device).await,
            Handler::Wsd(h) => h.devcaps(http, device).await,
        }
    }

    /// `None` when the protocol has no precheck operation (eSCL).
    pub async fn precheck(&mut self, http: &HttpClient, device: &Device) -> Result<()> {
        match self {
            Handler::Escl(h) => h.precheck(http, device).await,
            Handler::Wsd(h) => h.precheck(http, device).await,
        }
    }

    pub async fn scan(
        &mut self,
        http: &HttpClient,
        device: &Device,
        params: &ScanParams,
    ) -> Result<String> {
        match self {
            Handler::Escl(h) => h.scan(http, device, params).await,
            Handler::Wsd(h) => h.scan(http, device, params).await,
        }
    }

    pub async fn load(
        &mut self,
        http: &HttpClient,
        device: &Device,
        location: &str,
    ) -> Result<LoadOutcome> {
        match self {
            Handler::Escl(h) => h.load(http, device, location).await,
            Handler::Wsd(h) => h.load(http, device, location).await,
        }
    }

    pub async fn check(
        &mut self,
        http: &HttpClient,
        device: &Device,
        location: &str,
        retry_count: u32,
    ) -> Result<CheckOutcome> {
        match self {
            Handler::Escl(h) => h.check(http, device, location, retry_count).await,
            Handler::Wsd(h) => h.check(http, device, location, retry_count).await,
        }
    }

    /// `None` when the protocol defines no cleanup operation.
    pub async fn cleanup(&mut self, http: &HttpClient, device: &Device, location: &str) -> Result<()> {
        match self {
            Handler::Escl(h) => h.cleanup(http, device, location).await,
            Handler::Wsd(h) => h.cleanup(http, device, location).await,
        }
    }

    pub async fn cancel(&mut self, http: &HttpClient, device: &Device, location: &str) -> Result<()> {
        match self {
            Handler::Escl(h) => h.cancel(http, device, location).await,
            Handler::Wsd(h) => h.cancel(http, device, location).await,
        }
    }
}
