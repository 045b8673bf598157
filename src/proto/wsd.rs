//! WSD/WS-Scan handler (spec §4.F.2). Every request is a SOAP 1.2
//! envelope with a fresh `MessageID`, an anonymous `ReplyTo`, and an
//! `Action` naming the operation; a SOAP fault can arrive with HTTP 200,
//! so every response is checked for the addressing-fault substring
//! before anything else is parsed.

use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{Result, ScanError, ScanStatus};
use crate::http::{HttpClient, Method, Query};
use crate::model::{
    ColorMode, ColorModes, Device, DeviceCapabilities, DocumentFormats, ImageFormat, Protocol,
    Resolutions, ScanParams, ScanSource, SourceCaps, WindowRange,
};
use crate::xml::{NestedWriter, PathReader};

use super::quirks::QuirkTable;
use super::{CheckOutcome, LoadOutcome};

const NS_S: &str = "http://www.w3.org/2003/05/soap-envelope";
const NS_A: &str = "http://www.w3.org/2005/08/addressing";
const NS_WSCN: &str = "http://schemas.microsoft.com/windows/2006/08/wdp/scan";
const NS_TABLE: &[(&str, &str)] = &[(NS_S, "s"), (NS_A, "a"), (NS_WSCN, "scan")];

const ACTION_BASE: &str = "http://schemas.microsoft.com/windows/2006/08/wdp/scan";

const FAULT_MARKER: &str = "schemas.xmlsoap.org/ws/2004/08/addressing/fault";
const KNOWN_FAULTS: &[&str] = &[
    "ClientErrorNoImagesAvailable",
    "ClientErrorJobIdNotFound",
    "ServerErrorNotAcceptingJobs",
];

#[derive(Default)]
pub struct WsdHandler {
    /// Fault code captured by a failing `scan`/`load`, consulted by the
    /// next `check` alongside a fresh `ScannerStatus` query (spec §4.F.2
    /// "Check").
    last_fault: Option<String>,
    /// Whether the in-flight job is reading from the ADF — needed to
    /// apply the Canon MF410 busy/idle remap, which only fires on ADF.
    last_is_adf: bool,
}

impl WsdHandler {
    fn base(device: &Device) -> Result<&str> {
        device
            .endpoint_for(Protocol::Wsd)
            .map(|e| e.uri.as_str())
            .ok_or_else(|| ScanError::Invalid("device has no WSD endpoint".into()))
    }

    pub async fn devcaps(&mut self, http: &HttpClient, device: &Device) -> Result<DeviceCapabilities> {
        let base = Self::base(device)?;
        let body = build_get_elements(base, "ScannerConfiguration")?;
        let q = post_soap(http, base, "GetScannerElements", body).await?;
        if let Some(fault) = detect_fault(q.response_body(), q.response_content_type()) {
            return Err(ScanError::Protocol(format!("GetScannerElements fault: {fault}")));
        }
        if q.error() {
            return Err(ScanError::HttpStatus {
                status: q.status().unwrap_or(0),
            });
        }
        let quirks = QuirkTable.resolve(&device.name);
        parse_capabilities(q.response_body(), quirks)
    }

    pub async fn precheck(&mut self, http: &HttpClient, device: &Device) -> Result<()> {
        let base = Self::base(device)?;
        let body = build_get_elements(base, "ScannerStatus")?;
        let q = post_soap(http, base, "GetScannerElements", body).await?;
        if let Some(fault) = detect_fault(q.response_body(), q.response_content_type()) {
            return Err(ScanError::Protocol(format!("GetScannerElements fault: {fault}")));
        }
        match interpret_scanner_status(q.response_body(), false) {
            CheckOutcome::Status(ScanStatus::Good) => Ok(()),
            CheckOutcome::Status(status) => Err(ScanError::device(status)),
            CheckOutcome::RetryAfter(_) => Ok(()),
        }
    }

    pub async fn scan(
        &mut self,
        http: &HttpClient,
        device: &Device,
        params: &ScanParams,
    ) -> Result<String> {
        self.last_fault = None;
        self.last_is_adf = matches!(params.source, ScanSource::AdfSimplex | ScanSource::AdfDuplex);

        let base = Self::base(device)?;
        let quirks = QuirkTable.resolve(&device.name);
        let body = build_create_scan_job(base, params, quirks)?;
        let q = post_soap(http, base, "CreateScanJob", body).await?;
        if let Some(fault) = detect_fault(q.response_body(), q.response_content_type()) {
            self.last_fault = Some(fault.clone());
            return Err(ScanError::Protocol(format!("CreateScanJob fault: {fault}")));
        }
        if q.error() {
            return Err(ScanError::HttpStatus {
                status: q.status().unwrap_or(0),
            });
        }

        let mut r = PathReader::begin(q.response_body(), NS_TABLE)?;
        let job_id = r
            .find_text("scan:JobId")
            .ok_or_else(|| ScanError::Protocol("CreateScanJob response missing JobId".into()))?;
        r.reset();
        let job_token = r
            .find_text("scan:JobToken")
            .ok_or_else(|| ScanError::Protocol("CreateScanJob response missing JobToken".into()))?;

        Ok(format!("{job_id}:{job_token}"))
    }

    pub async fn load(&mut self, http: &HttpClient, device: &Device, location: &str) -> Result<LoadOutcome> {
        let (job_id, job_token) = split_location(location)?;
        let base = Self::base(device)?;
        let body = build_retrieve_image(base, job_id, job_token)?;
        let q = post_soap(http, base, "RetrieveImage", body).await?;

        if let Some(fault) = detect_fault(q.response_body(), q.response_content_type()) {
            self.last_fault = Some(fault.clone());
            return Err(ScanError::Protocol(format!("RetrieveImage fault: {fault}")));
        }
        if q.error() {
            return Err(ScanError::HttpStatus {
                status: q.status().unwrap_or(0),
            });
        }

        let mut q = q;
        let count = q.get_mp_response_count()?;
        if count < 2 {
            return Err(ScanError::Protocol(
                "RetrieveImage multipart response missing image part".into(),
            ));
        }
        self.last_fault = None;
        Ok(LoadOutcome::Page(q.get_mp_response_data(1)?.to_vec()))
    }

    pub async fn check(
        &mut self,
        http: &HttpClient,
        device: &Device,
        _location: &str,
        _retry_count: u32,
    ) -> Result<CheckOutcome> {
        if let Some(fault) = self.last_fault.take() {
            if fault == "ClientErrorNoImagesAvailable" || fault == "ClientErrorJobIdNotFound" {
                return Ok(CheckOutcome::Status(ScanStatus::NoDocs));
            }
        }

        let base = Self::base(device)?;
        let body = build_get_elements(base, "ScannerStatus")?;
        let q = post_soap(http, base, "GetScannerElements", body).await?;
        if let Some(fault) = detect_fault(q.response_body(), q.response_content_type()) {
            return Ok(CheckOutcome::Status(
                if fault == "ClientErrorNoImagesAvailable" || fault == "ClientErrorJobIdNotFound" {
                    ScanStatus::NoDocs
                } else {
                    ScanStatus::IoError
                },
            ));
        }
        if q.error() {
            return Ok(CheckOutcome::Status(ScanStatus::IoError));
        }

        let quirks = QuirkTable.resolve(&device.name);
        let mut outcome = interpret_scanner_status(q.response_body(), self.last_is_adf);
        if quirks.remap_busy_idle_to_no_docs {
            if let CheckOutcome::Status(ScanStatus::DeviceBusy) = outcome {
                if self.last_is_adf && is_state_idle(q.response_body()) {
                    outcome = CheckOutcome::Status(ScanStatus::NoDocs);
                }
            }
        }
        Ok(outcome)
    }

    /// WSD defines no separate cleanup operation; the job resource is
    /// released by the device once `RetrieveImage` exhausts its pages or
    /// `CancelJob` runs.
    pub async fn cleanup(&mut self, _http: &HttpClient, _device: &Device, _location: &str) -> Result<()> {
        Ok(())
    }

    pub async fn cancel(&mut self, http: &HttpClient, device: &Device, location: &str) -> Result<()> {
        let (job_id, _token) = split_location(location)?;
        let base = Self::base(device)?;
        let body = build_cancel_job(base, job_id)?;
        let q = post_soap(http, base, "CancelJob", body).await?;
        if let Some(fault) = detect_fault(q.response_body(), q.response_content_type()) {
            // A job already gone is not a cancellation failure.
            if fault != "ClientErrorJobIdNotFound" {
                return Err(ScanError::Protocol(format!("CancelJob fault: {fault}")));
            }
            return Ok(());
        }
        if q.error() {
            return Err(ScanError::HttpStatus {
                status: q.status().unwrap_or(0),
            });
        }
        Ok(())
    }
}

fn split_location(location: &str) -> Result<(&str, &str)> {
    location
        .split_once(':')
        .ok_or_else(|| ScanError::Invalid(format!("malformed wsd job location {location:?}")))
}

/// `To` carries the endpoint without its IPv6 zone suffix (spec §4.F.2:
/// "`To = base-URI-without-zone`").
fn strip_zone(uri: &str) -> String {
    match uri.find("%25") {
        Some(pos) => {
            let close = uri[pos..].find(']').map(|i| pos + i).unwrap_or(uri.len());
            format!("{}{}", &uri[..pos], &uri[close..])
        }
        None => uri.to_string(),
    }
}

fn open_envelope(base_uri: &str, action: &str) -> Result<NestedWriter> {
    let mut w = NestedWriter::begin("s:Envelope", NS_TABLE)?;
    w.enter("s:Header")?;
    w.add_text("a:Action", &format!("{ACTION_BASE}/{action}"))?;
    w.add_text("a:MessageID", &format!("urn:uuid:{}", Uuid::new_v4()))?;
    w.enter("a:ReplyTo")?;
    w.add_text("a:Address", "http://www.w3.org/2005/08/addressing/anonymous")?;
    w.leave()?;
    w.add_text("a:To", &strip_zone(base_uri))?;
    w.leave()?; // s:Header
    w.enter("s:Body")?;
    Ok(w)
}

async fn post_soap(http: &HttpClient, base: &str, action: &str, body: Vec<u8>) -> Result<Query> {
    let q = Query::new(
        base.to_string(),
        Method::Post,
        Some(Bytes::from(body)),
        Some("application/soap+xml"),
    )
    .with_header("Cache-Control", "no-cache")
    .with_header("Pragma", "no-cache")
    .with_header("User-Agent", "WSDAPI");
    http.submit(q).await
}

/// Detects a SOAP fault per spec §4.F.2: the addressing-fault substring
/// in a non-multipart body, even under HTTP 200. Returns the matched
/// known fault code, or a generic marker if the body faulted on a code
/// this handler doesn't recognize by name.
fn detect_fault(body: &[u8], content_type: Option<&str>) -> Option<String> {
    if content_type
        .map(|c| c.to_ascii_lowercase().starts_with("multipart/"))
        .unwrap_or(false)
    {
        return None;
    }
    let text = String::from_utf8_lossy(body);
    if !text.contains(FAULT_MARKER) {
        return None;
    }
    Some(
        KNOWN_FAULTS
            .iter()
            .find(|code| text.contains(**code))
            .map(|c| c.to_string())
            .unwrap_or_else(|| "UnknownFault".to_string()),
    )
}

fn build_get_elements(base: &str, element_name: &str) -> Result<Vec<u8>> {
    let mut w = open_envelope(base, "GetScannerElements")?;
    w.enter("scan:GetScannerElementsRequest")?;
    w.enter("scan:RequestedElements")?;
    w.add_text("scan:Name", &format!("scan:{element_name}"))?;
    w.leave()?; // RequestedElements
    w.leave()?; // GetScannerElementsRequest
    w.finish_compact()
}

fn build_create_scan_job(
    base: &str,
    params: &ScanParams,
    quirks: super::quirks::DeviceQuirks,
) -> Result<Vec<u8>> {
    let mut w = open_envelope(base, "CreateScanJob")?;
    w.enter("scan:CreateScanJobRequest")?;
    w.enter("scan:ScanTicket")?;
    w.enter("scan:DocumentParameters")?;
    w.add_text("scan:Format", wsd_format_alias(params.format))?;

    let images_to_transfer = quirks.images_to_transfer_override.unwrap_or(match params.source {
        ScanSource::Platen => 1,
        ScanSource::AdfSimplex | ScanSource::AdfDuplex => 0,
    });
    w.add_uint("scan:ImagesToTransfer", images_to_transfer as u64)?;

    w.enter("scan:InputSize")?;
    w.add_text("scan:DocumentSizeAutoDetect", "false")?;
    w.enter("scan:InputMediaSize")?;
    w.add_uint("scan:Width", params.width as u64)?;
    w.add_uint("scan:Height", params.height as u64)?;
    w.leave()?; // InputMediaSize
    w.leave()?; // InputSize

    w.add_text(
        "scan:InputSource",
        match params.source {
            ScanSource::Platen => "Platen",
            ScanSource::AdfSimplex | ScanSource::AdfDuplex => "ADF",
        },
    )?;

    w.enter("scan:MediaSides")?;
    write_media_side(&mut w, "scan:MediaFront", params)?;
    if matches!(params.source, ScanSource::AdfDuplex) {
        write_media_side(&mut w, "scan:MediaBack", params)?;
    }
    w.leave()?; // MediaSides

    w.leave()?; // DocumentParameters
    w.leave()?; // ScanTicket
    w.leave()?; // CreateScanJobRequest
    w.finish_compact()
}

fn write_media_side(w: &mut NestedWriter, name: &str, params: &ScanParams) -> Result<()> {
    w.enter(name)?;
    w.enter("scan:ScanRegion")?;
    w.add_uint("scan:ScanRegionXOffset", params.x_off as u64)?;
    w.add_uint("scan:ScanRegionYOffset", params.y_off as u64)?;
    w.add_uint("scan:ScanRegionWidth", params.width as u64)?;
    w.add_uint("scan:ScanRegionHeight", params.height as u64)?;
    w.leave()?; // ScanRegion
    w.add_text("scan:ColorProcessing", color_mode_str(params.color_mode))?;
    w.enter("scan:Resolution")?;
    w.add_uint("scan:Width", params.x_res as u64)?;
    w.add_uint("scan:Height", params.y_res as u64)?;
    w.leave()?; // Resolution
    w.leave()?; // name
    Ok(())
}

fn build_retrieve_image(base: &str, job_id: &str, job_token: &str) -> Result<Vec<u8>> {
    let mut w = open_envelope(base, "RetrieveImage")?;
    w.enter("scan:RetrieveImageRequest")?;
    w.add_text("scan:JobId", job_id)?;
    w.add_text("scan:JobToken", job_token)?;
    w.add_text("scan:DocumentDescription", "")?;
    w.leave()?; // RetrieveImageRequest
    w.finish_compact()
}

fn build_cancel_job(base: &str, job_id: &str) -> Result<Vec<u8>> {
    let mut w = open_envelope(base, "CancelJob")?;
    w.enter("scan:CancelJobRequest")?;
    w.add_text("scan:JobId", job_id)?;
    w.leave()?; // CancelJobRequest
    w.finish_compact()
}

fn color_mode_str(mode: ColorMode) -> &'static str {
    match mode {
        ColorMode::BlackAndWhite1 => "BlackAndWhite1",
        ColorMode::Grayscale => "Grayscale8",
        ColorMode::Color => "RGB24",
    }
}

/// One alias per format is enough for request construction (unlike
/// capability parsing, which must recognize every alias a device might
/// advertise).
fn wsd_format_alias(fmt: ImageFormat) -> &'static str {
    match fmt {
        ImageFormat::Jpeg => "jfif",
        ImageFormat::Pdf => "pdf-a",
        ImageFormat::Png => "png",
        ImageFormat::Tiff => "tiff-single-g4",
        ImageFormat::Bmp => "dib",
    }
}

/// Maps one of the format aliases a `FormatsSupported` list may contain
/// (spec §4.F.2 "Capabilities") to the shared format bitset. Unknown
/// aliases contribute nothing.
fn format_from_wsd_alias(alias: &str) -> DocumentFormats {
    let lower = alias.to_ascii_lowercase();
    if lower.contains("jfif") || lower.contains("exif") {
        DocumentFormats::JPEG
    } else if lower.contains("pdf-a") {
        DocumentFormats::PDF
    } else if lower.contains("png") {
        DocumentFormats::PNG
    } else if lower.contains("tiff-single-g4") || lower.contains("g3mh") {
        DocumentFormats::TIFF
    } else if lower.contains("tiff-single-jpeg-tn2") || lower.contains("tiff-single-uncompressed") {
        // Last-resort fallbacks (spec §4.F.2): still TIFF, just a worse
        // encoding than the G4/G3MH aliases above.
        DocumentFormats::TIFF
    } else if lower.contains("dib") {
        DocumentFormats::BMP
    } else {
        DocumentFormats::empty()
    }
}

/// Walks one of `/scan:Platen`, `/scan:ADF/scan:ADFFront` or
/// `/scan:ADF/scan:ADFBack` out of a `ScannerConfiguration` document,
/// collecting color modes, formats, resolutions and min/max page size.
fn parse_wsd_source(xml: &[u8], marker: &str) -> Result<Option<SourceCaps>> {
    let mut r = PathReader::begin(xml, NS_TABLE)?;
    let mut color_modes = ColorModes::empty();
    let mut formats = DocumentFormats::empty();
    let mut resolutions = std::collections::BTreeSet::new();
    let (mut min_w, mut max_w, mut min_h, mut max_h) = (0u32, 0u32, 0u32, 0u32);
    let mut found = false;

    while r.next() {
        let path = r.node_path().to_string();
        if !path.contains(marker) {
            continue;
        }
        found = true;
        let value = r.node_value();
        if path.contains("MinimumSize") && path.ends_with("scan:Width") {
            min_w = min_w.max(value.parse().unwrap_or(0));
        } else if path.contains("MinimumSize") && path.ends_with("scan:Height") {
            min_h = min_h.max(value.parse().unwrap_or(0));
        } else if path.contains("MaximumSize") && path.ends_with("scan:Width") {
            max_w = max_w.max(value.parse().unwrap_or(0));
        } else if path.contains("MaximumSize") && path.ends_with("scan:Height") {
            max_h = max_h.max(value.parse().unwrap_or(0));
        } else if path.ends_with("scan:ColorEntry") {
            color_modes |= match value {
                "BlackAndWhite1" => ColorModes::BW1,
                "Grayscale8" | "Grayscale16" => ColorModes::GRAYSCALE,
                "RGB24" | "RGB48" => ColorModes::COLOR,
                _ => ColorModes::empty(),
            };
        } else if path.ends_with("scan:FormatValue") {
            formats |= format_from_wsd_alias(value);
        } else if path.contains("OpticalResolution") && path.ends_with("scan:Width") {
            if let Ok(v) = value.parse() {
                resolutions.insert(v);
            }
        }
    }

    if !found {
        return Ok(None);
    }
    if max_w == 0 || max_h == 0 {
        return Err(ScanError::Protocol(format!("{marker}: no usable window bounds")));
    }

    // Width/height swap quirk (spec §4.F.2): some devices report page
    // sizes with width and height transposed.
    if max_w > max_h {
        std::mem::swap(&mut min_w, &mut min_h);
        std::mem::swap(&mut max_w, &mut max_h);
    }

    if color_modes.is_empty() {
        color_modes = ColorModes::GRAYSCALE;
    }
    if formats.is_empty() {
        return Err(ScanError::Unsupported(format!(
            "{marker}: no format this handler can request"
        )));
    }
    let resolutions = if resolutions.is_empty() {
        Resolutions::Discrete(std::collections::BTreeSet::from([300]))
    } else {
        Resolutions::Discrete(resolutions)
    };

    Ok(Some(SourceCaps {
        color_modes,
        formats,
        intents: vec![crate::model::ScanIntent::Document],
        resolutions,
        window: WindowRange {
            min_w,
            max_w,
            min_h,
            max_h,
        },
    }))
}

fn parse_capabilities(xml: &[u8], quirks: super::quirks::DeviceQuirks) -> Result<DeviceCapabilities> {
    let platen = parse_wsd_source(xml, "scan:Platen")?;
    let adf_front = parse_wsd_source(xml, "scan:ADF/scan:ADFFront")?;
    let adf_back = parse_wsd_source(xml, "scan:ADF/scan:ADFBack")?;

    let mut r = PathReader::begin(xml, NS_TABLE)?;
    let supports_duplex = r.find_text("scan:ADFSupportsDuplex").as_deref() == Some("true");

    let adf_simplex = adf_front.clone();
    let adf_duplex = match (adf_back, adf_front, supports_duplex) {
        (Some(back), _, _) => Some(back),
        (None, Some(front), true) => Some(front.inherit_from()),
        _ => None,
    };

    let mut caps = DeviceCapabilities {
        protocol_name: "WSD".to_string(),
        unit_um: 1000,
        platen,
        adf_simplex,
        adf_duplex,
    };

    if quirks.force_software_clip {
        for source in [&mut caps.platen, &mut caps.adf_simplex, &mut caps.adf_duplex]
            .into_iter()
            .flatten()
        {
            source.window.force_full_page();
        }
    }

    caps.validate()?;
    Ok(caps)
}

fn is_state_idle(xml: &[u8]) -> bool {
    let Ok(mut r) = PathReader::begin(xml, NS_TABLE) else {
        return false;
    };
    r.find_text("scan:ScannerState").as_deref() == Some("Idle")
}

/// Maps a `ScannerStatus` document's state and reason list into the
/// shared taxonomy (spec §4.F.2 "Check"). `is_adf` is only consulted by
/// the caller for the Canon MF410 remap, kept separate from this pure
/// mapping.
fn interpret_scanner_status(xml: &[u8], _is_adf: bool) -> CheckOutcome {
    let text = String::from_utf8_lossy(xml);
    if text.contains("LampWarming") || text.contains("Calibrating") {
        return CheckOutcome::RetryAfter(Duration::from_millis(1000));
    }
    if text.contains("CoverOpen") || text.contains("InterlockOpen") {
        return CheckOutcome::Status(ScanStatus::CoverOpen);
    }
    if text.contains("MediaJam") || text.contains("MultipleFeedError") {
        return CheckOutcome::Status(ScanStatus::Jammed);
    }
    if text.contains("InternalStorageFull") {
        return CheckOutcome::Status(ScanStatus::NoMem);
    }
    if text.contains("LampError") {
        return CheckOutcome::Status(ScanStatus::IoError);
    }
    if text.contains("ServerErrorNotAcceptingJobs") {
        return CheckOutcome::Status(ScanStatus::DeviceBusy);
    }
    match is_state_idle(xml) {
        true => CheckOutcome::Status(ScanStatus::Good),
        false => CheckOutcome::Status(ScanStatus::IoError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::quirks::DeviceQuirks;

    const CAPS_XML: &str = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://www.w3.org/2005/08/addressing" xmlns:scan="http://schemas.microsoft.com/windows/2006/08/wdp/scan">
  <s:Body>
    <scan:ScannerConfiguration>
      <scan:Platen>
        <scan:PlatenMinimumSize><scan:Width>16</scan:Width><scan:Height>16</scan:Height></scan:PlatenMinimumSize>
        <scan:PlatenMaximumSize><scan:Width>2550</scan:Width><scan:Height>3300</scan:Height></scan:PlatenMaximumSize>
        <scan:PlatenOpticalResolution><scan:Width>300</scan:Width><scan:Height>300</scan:Height></scan:PlatenOpticalResolution>
        <scan:PlatenColor>
          <scan:ColorEntry>RGB24</scan:ColorEntry>
          <scan:ColorEntry>Grayscale8</scan:ColorEntry>
        </scan:PlatenColor>
        <scan:FormatsSupported>
          <scan:FormatValue>jfif</scan:FormatValue>
          <scan:FormatValue>dib</scan:FormatValue>
        </scan:FormatsSupported>
      </scan:Platen>
      <scan:ADF>
        <scan:ADFFront>
          <scan:ADFMinimumSize><scan:Width>16</scan:Width><scan:Height>16</scan:Height></scan:ADFMinimumSize>
          <scan:ADFMaximumSize><scan:Width>2550</scan:Width><scan:Height>3300</scan:Height></scan:ADFMaximumSize>
          <scan:ADFOpticalResolution><scan:Width>300</scan:Width><scan:Height>300</scan:Height></scan:ADFOpticalResolution>
          <scan:ADFColor>
            <scan:ColorEntry>RGB24</scan:ColorEntry>
          </scan:ADFColor>
          <scan:FormatsSupported>
            <scan:FormatValue>jfif</scan:FormatValue>
          </scan:FormatsSupported>
        </scan:ADFFront>
        <scan:ADFSupportsDuplex>true</scan:ADFSupportsDuplex>
      </scan:ADF>
    </scan:ScannerConfiguration>
  </s:Body>
</s:Envelope>"#;

    #[test]
    fn parses_platen_and_adf_with_duplex_inheritance() {
        let caps = parse_capabilities(CAPS_XML.as_bytes(), DeviceQuirks::none()).unwrap();
        assert!(caps.platen.is_some());
        assert!(caps.adf_simplex.is_some());
        assert!(
            caps.adf_duplex.is_some(),
            "duplex slot should inherit from the front side"
        );
    }

    #[test]
    fn software_clip_quirk_forces_min_equals_max() {
        let mut quirks = DeviceQuirks::none();
        quirks.force_software_clip = true;
        let caps = parse_capabilities(CAPS_XML.as_bytes(), quirks).unwrap();
        let platen = caps.platen.unwrap();
        assert_eq!(platen.window.min_w, platen.window.max_w);
        assert_eq!(platen.window.min_h, platen.window.max_h);
    }

    #[test]
    fn detects_fault_substring_on_non_multipart_body() {
        let body = format!(
            "<s:Envelope><s:Body><s:Fault><s:Code><s:Value>http://{FAULT_MARKER}</s:Value></s:Code><s:Reason>ClientErrorNoImagesAvailable</s:Reason></s:Fault></s:Body></s:Envelope>"
        );
        let fault = detect_fault(body.as_bytes(), Some("application/soap+xml"));
        assert_eq!(fault.as_deref(), Some("ClientErrorNoImagesAvailable"));
    }

    #[test]
    fn multipart_content_type_never_counts_as_fault() {
        let body = format!("boundary text mentioning {FAULT_MARKER} incidentally");
        let fault = detect_fault(body.as_bytes(), Some("multipart/related; boundary=X"));
        assert!(fault.is_none());
    }

    #[test]
    fn lamp_warming_yields_retry() {
        let xml = b"<scan:ScannerStatus><scan:ScannerStateReasons><scan:ScannerStateReason>LampWarming</scan:ScannerStateReason></scan:ScannerStateReasons></scan:ScannerStatus>";
        match interpret_scanner_status(xml, false) {
            CheckOutcome::RetryAfter(d) => assert_eq!(d, Duration::from_millis(1000)),
            _ => panic!("expected retry"),
        }
    }

    #[test]
    fn width_height_swap_quirk_normalizes_portrait_orientation() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://www.w3.org/2005/08/addressing" xmlns:scan="http://schemas.microsoft.com/windows/2006/08/wdp/scan">
<s:Body><scan:ScannerConfiguration><scan:Platen>
<scan:PlatenMinimumSize><scan:Width>16</scan:Width><scan:Height>16</scan:Height></scan:PlatenMinimumSize>
<scan:PlatenMaximumSize><scan:Width>3300</scan:Width><scan:Height>2550</scan:Height></scan:PlatenMaximumSize>
<scan:PlatenColor><scan:ColorEntry>RGB24</scan:ColorEntry></scan:PlatenColor>
<scan:FormatsSupported><scan:FormatValue>jfif</scan:FormatValue></scan:FormatsSupported>
</scan:Platen></scan:ScannerConfiguration></s:Body></s:Envelope>"#;
        let caps = parse_wsd_source(xml.as_bytes(), "scan:Platen").unwrap().unwrap();
        assert_eq!(caps.window.max_w, 2550);
        assert_eq!(caps.window.max_h, 3300);
    }

    #[test]
    fn job_location_round_trips_id_and_token() {
        let (id, token) = split_location("17:T").unwrap();
        assert_eq!(id, "17");
        assert_eq!(token, "T");
    }

    #[test]
    fn create_scan_job_body_carries_ricoh_override() {
        let params = ScanParams {
            source: ScanSource::AdfSimplex,
            color_mode: ColorMode::Color,
            intent: crate::model::ScanIntent::Document,
            format: ImageFormat::Jpeg,
            x_res: 300,
            y_res: 300,
            x_off: 0,
            y_off: 0,
            width: 2550,
            height: 3300,
        };
        let quirks = QuirkTable.resolve("RICOH Aficio MP 201");
        let body = String::from_utf8(
            build_create_scan_job("http://192.0.2.5:5358/WSDScanner", &params, quirks).unwrap(),
        )
        .unwrap();
        assert!(body.contains("<scan:ImagesToTransfer>100</scan:ImagesToTransfer>"));
    }
}
