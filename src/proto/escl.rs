//! eSCL/AirScan handler (spec §4.F.1). eSCL's operation table is the
//! thin one: capabilities, a single POST to start a job, repeated GETs
//! for pages, and a status document for `CHECK`. There is no precheck
//! or cleanup operation, and both are no-ops here so the state machine
//! can call every handler method uniformly.

use std::time::Duration;

use bytes::Bytes;

use crate::error::{Result, ScanError, ScanStatus};
use crate::http::{HttpClient, Method, Query};
use crate::model::{
    ColorMode, ColorModes, Device, DeviceCapabilities, DocumentFormats, Protocol, Resolutions,
    ScanParams, SourceCaps, WindowRange,
};
use crate::xml::{NestedWriter, PathReader};

use super::{CheckOutcome, LoadOutcome};

const NS_SCAN: &str = "http://schemas.hp.com/imaging/escl/2011/05/03";
const NS_PWG: &str = "http://www.pwg.org/schemas/2010/12/sm";
const NS_TABLE: &[(&str, &str)] = &[(NS_SCAN, "scan"), (NS_PWG, "pwg")];

#[derive(Default)]
pub struct EsclHandler;

impl EsclHandler {
    fn base(device: &Device) -> Result<&str> {
        device
            .endpoint_for(Protocol::Escl)
            .map(|e| e.uri.as_str())
            .ok_or_else(|| ScanError::Invalid("device has no eSCL endpoint".into()))
    }

    pub async fn devcaps(&mut self, http: &HttpClient, device: &Device) -> Result<DeviceCapabilities> {
        let base = Self::base(device)?;
        let uri = format!("{}ScannerCapabilities", base.trim_end_matches('/').to_string() + "/");
        let q = http.submit(Query::new(uri, Method::Get, None, None)).await?;
        if q.error() {
            return Err(ScanError::HttpStatus {
                status: q.status().unwrap_or(0),
            });
        }
        parse_capabilities(q.response_body())
    }

    /// eSCL defines no precheck step.
    pub async fn precheck(&mut self, _http: &HttpClient, _device: &Device) -> Result<()> {
        Ok(())
    }

    pub async fn scan(
        &mut self,
        http: &HttpClient,
        device: &Device,
        params: &ScanParams,
    ) -> Result<String> {
        let base = Self::base(device)?;
        let body = build_scan_settings(params)?;
        let uri = format!("{}ScanJobs", base.trim_end_matches('/').to_string() + "/");
        let q = http
            .submit(Query::new(
                uri,
                Method::Post,
                Some(Bytes::from(body)),
                Some("text/xml"),
            ))
            .await?;
        if q.error() {
            return Err(map_scan_job_error(q.status()));
        }
        let location = q
            .response_header("Location")
            .ok_or_else(|| ScanError::Protocol("ScanJobs response carried no Location".into()))?
            .to_string();
        Ok(absolutize(base, &location))
    }

    pub async fn load(&mut self, http: &HttpClient, _device: &Device, location: &str) -> Result<LoadOutcome> {
        let uri = format!("{}/NextDocument", location.trim_end_matches('/'));
        let q = http.submit(Query::new(uri, Method::Get, None, None)).await?;
        match q.status() {
            Some(404) => Ok(LoadOutcome::Done),
            Some(200) => Ok(LoadOutcome::Page(q.response_body().to_vec())),
            _ => Err(ScanError::HttpStatus {
                status: q.status().unwrap_or(0),
            }),
        }
    }

    pub async fn check(
        &mut self,
        http: &HttpClient,
        device: &Device,
        _location: &str,
        _retry_count: u32,
    ) -> Result<CheckOutcome> {
        // `ScannerStatus` is a device-wide resource, not scoped to the
        // current job, so it is always reachable from the device's base
        // endpoint even when no job ever got far enough to have a
        // `location` (a failed `DEVCAPS`/`PRECHECK`/`SCAN` still routes
        // through `CHECK`, per spec §4.G).
        let base = Self::base(device)?;
        let uri = format!("{}ScannerStatus", base.trim_end_matches('/').to_string() + "/");
        let q = http.submit(Query::new(uri, Method::Get, None, None)).await?;
        if q.error() {
            return Ok(CheckOutcome::Status(ScanStatus::IoError));
        }
        Ok(parse_scanner_status(q.response_body()))
    }

    /// eSCL defines no cleanup step distinct from the job resource itself
    /// expiring on the device.
    pub async fn cleanup(&mut self, _http: &HttpClient, _device: &Device, _location: &str) -> Result<()> {
        Ok(())
    }

    pub async fn cancel(&mut self, http: &HttpClient, _device: &Device, location: &str) -> Result<()> {
        let q = http
            .submit(Query::new(location.to_string(), Method::Delete, None, None))
            .await?;
        if q.error() && q.status() != Some(404) {
            return Err(ScanError::HttpStatus {
                status: q.status().unwrap_or(0),
            });
        }
        Ok(())
    }
}

/// Resolves a `Location` response header against the request base,
/// since devices are split roughly evenly between returning an absolute
/// URL and a path relative to the scanner root.
fn absolutize(base: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        location.to_string()
    } else {
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            location.trim_start_matches('/')
        )
    }
}

fn map_scan_job_error(status: Option<u16>) -> ScanError {
    match status {
        Some(503) => ScanError::device(ScanStatus::DeviceBusy),
        Some(s) => ScanError::HttpStatus { status: s },
        None => ScanError::HttpStatus { status: 0 },
    }
}

/// Maps an eSCL `ScannerStatus` document's `<pwg:State>` and, for the
/// ADF, `<scan:AdfState>` into the shared status taxonomy.
fn parse_scanner_status(xml: &[u8]) -> CheckOutcome {
    let Ok(mut r) = PathReader::begin(xml, NS_TABLE) else {
        return CheckOutcome::Status(ScanStatus::IoError);
    };
    let adf_state = r.find_text("scan:AdfState");
    if let Some(state) = adf_state.as_deref() {
        match state {
            "ScannerAdfLoaded" | "ScannerAdfProcessing" => {}
            "ScannerAdfJam" => return CheckOutcome::Status(ScanStatus::Jammed),
            "ScannerAdfDoorOpen" => return CheckOutcome::Status(ScanStatus::CoverOpen),
            "ScannerAdfEmpty" => return CheckOutcome::Status(ScanStatus::NoDocs),
            _ => {}
        }
    }
    r.reset();
    match r.find_text("pwg:State").as_deref() {
        Some("Idle") => CheckOutcome::Status(ScanStatus::Good),
        Some("Processing") => CheckOutcome::RetryAfter(Duration::from_millis(1000)),
        Some("Stopped") => CheckOutcome::Status(ScanStatus::IoError),
        _ => CheckOutcome::Status(ScanStatus::IoError),
    }
}

fn build_scan_settings(params: &ScanParams) -> Result<Vec<u8>> {
    let mut w = NestedWriter::begin("scan:ScanSettings", NS_TABLE)?;
    w.add_text("pwg:Version", "2.0")?;
    w.enter("pwg:ScanRegions")?;
    w.enter("pwg:ScanRegion")?;
    w.add_uint("pwg:Height", params.height as u64)?;
    w.add_uint("pwg:Width", params.width as u64)?;
    w.add_uint("pwg:XOffset", params.x_off as u64)?;
    w.add_uint("pwg:YOffset", params.y_off as u64)?;
    w.leave()?; // ScanRegion
    w.leave()?; // ScanRegions
    w.add_text("pwg:InputSource", input_source(params))?;
    w.add_text("scan:ColorMode", color_mode_str(params.color_mode))?;
    w.add_uint("scan:XResolution", params.x_res as u64)?;
    w.add_uint("scan:YResolution", params.y_res as u64)?;
    w.add_text("pwg:DocumentFormat", params.format.mime())?;
    w.add_text("scan:Intent", intent_str(params.intent))?;
    if matches!(params.source, crate::model::ScanSource::AdfDuplex) {
        w.add_text("scan:Duplex", "true")?;
    }
    w.finish_compact()
}

fn input_source(params: &ScanParams) -> &'static str {
    match params.source {
        crate::model::ScanSource::Platen => "Platen",
        crate::model::ScanSource::AdfSimplex | crate::model::ScanSource::AdfDuplex => "Feeder",
    }
}

fn color_mode_str(mode: ColorMode) -> &'static str {
    match mode {
        ColorMode::BlackAndWhite1 => "BlackAndWhite1",
        ColorMode::Grayscale => "Grayscale8",
        ColorMode::Color => "RGB24",
    }
}

fn intent_str(intent: crate::model::ScanIntent) -> &'static str {
    match intent {
        crate::model::ScanIntent::Document => "Document",
        crate::model::ScanIntent::Photo => "Photo",
        crate::model::ScanIntent::Halftone => "Halftone",
        crate::model::ScanIntent::TextAndGraphic => "TextAndGraphic",
    }
}

/// Walks a `ScannerCapabilities` document section by section, one pass
/// per source, collecting color modes, formats, resolutions and window
/// bounds from whichever `SettingProfile`s it finds under that source.
fn parse_source(xml: &[u8], path_marker: &str) -> Result<Option<SourceCaps>> {
    let mut r = PathReader::begin(xml, NS_TABLE)?;
    let mut color_modes = ColorModes::empty();
    let mut formats = DocumentFormats::empty();
    let mut resolutions = std::collections::BTreeSet::new();
    let (mut min_w, mut max_w, mut min_h, mut max_h) = (0u32, 0u32, 0u32, 0u32);
    let mut found = false;

    while r.next() {
        let path = r.node_path().to_string();
        if !path.contains(path_marker) {
            continue;
        }
        found = true;
        let value = r.node_value();
        if path.ends_with("scan:ColorMode") {
            color_modes |= match value {
                "BlackAndWhite1" => ColorModes::BW1,
                "Grayscale8" | "Grayscale16" => ColorModes::GRAYSCALE,
                "RGB24" | "RGB48" => ColorModes::COLOR,
                _ => ColorModes::empty(),
            };
        } else if path.ends_with("pwg:DocumentFormat") || path.ends_with("scan:DocumentFormatExt") {
            formats |= format_from_mime(value);
        } else if path.ends_with("scan:MinWidth") {
            min_w = min_w.max(value.parse().unwrap_or(0));
        } else if path.ends_with("scan:MaxWidth") {
            max_w = max_w.max(value.parse().unwrap_or(0));
        } else if path.ends_with("scan:MinHeight") {
            min_h = min_h.max(value.parse().unwrap_or(0));
        } else if path.ends_with("scan:MaxHeight") {
            max_h = max_h.max(value.parse().unwrap_or(0));
        } else if path.ends_with("scan:XResolution") {
            if let Ok(v) = value.parse() {
                resolutions.insert(v);
            }
        }
    }

    if !found {
        return Ok(None);
    }
    if max_w == 0 || max_h == 0 {
        return Err(ScanError::Protocol(format!(
            "{path_marker}: no usable window bounds"
        )));
    }
    if color_modes.is_empty() {
        color_modes = ColorModes::GRAYSCALE;
    }
    if formats.is_empty() {
        formats = DocumentFormats::JPEG;
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

fn format_from_mime(mime: &str) -> DocumentFormats {
    let lower = mime.to_ascii_lowercase();
    if lower.contains("jpeg") || lower.contains("jpg") {
        DocumentFormats::JPEG
    } else if lower.contains("pdf") {
        DocumentFormats::PDF
    } else if lower.contains("png") {
        DocumentFormats::PNG
    } else if lower.contains("tiff") {
        DocumentFormats::TIFF
    } else if lower.contains("bmp") {
        DocumentFormats::BMP
    } else {
        DocumentFormats::empty()
    }
}

fn parse_capabilities(xml: &[u8]) -> Result<DeviceCapabilities> {
    let platen = parse_source(xml, "scan:Platen")?;
    let adf_simplex = parse_source(xml, "scan:AdfSimplexInputCaps")?;
    let mut adf_duplex = parse_source(xml, "scan:AdfDuplexInputCaps")?;

    if adf_duplex.is_none() {
        let mut r = PathReader::begin(xml, NS_TABLE)?;
        let duplex_advertised = r.find_text("scan:Duplex").as_deref() == Some("true");
        if duplex_advertised {
            adf_duplex = adf_simplex.as_ref().map(SourceCaps::inherit_from);
        }
    }

    let caps = DeviceCapabilities {
        protocol_name: "eSCL".to_string(),
        unit_um: 1000,
        platen,
        adf_simplex,
        adf_duplex,
    };
    caps.validate()?;
    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<scan:ScannerCapabilities xmlns:scan="http://schemas.hp.com/imaging/escl/2011/05/03" xmlns:pwg="http://www.pwg.org/schemas/2010/12/sm">
  <pwg:Version>2.0</pwg:Version>
  <scan:Platen>
    <scan:PlatenInputCaps>
      <scan:MinWidth>16</scan:MinWidth>
      <scan:MaxWidth>2550</scan:MaxWidth>
      <scan:MinHeight>16</scan:MinHeight>
      <scan:MaxHeight>3300</scan:MaxHeight>
      <scan:SettingProfiles>
        <scan:SettingProfile>
          <scan:ColorModes>
            <scan:ColorMode>RGB24</scan:ColorMode>
            <scan:ColorMode>Grayscale8</scan:ColorMode>
          </scan:ColorModes>
          <scan:DocumentFormats>
            <pwg:DocumentFormat>image/jpeg</pwg:DocumentFormat>
            <scan:DocumentFormatExt>application/pdf</scan:DocumentFormatExt>
          </scan:DocumentFormats>
          <scan:SupportedResolutions>
            <scan:DiscreteResolutions>
              <scan:DiscreteResolution>
                <scan:XResolution>300</scan:XResolution>
                <scan:YResolution>300</scan:YResolution>
              </scan:DiscreteResolution>
              <scan:DiscreteResolution>
                <scan:XResolution>600</scan:XResolution>
                <scan:YResolution>600</scan:YResolution>
              </scan:DiscreteResolution>
            </scan:SupportedResolutions>
          </scan:SupportedResolutions>
        </scan:SettingProfile>
      </scan:SettingProfiles>
    </scan:PlatenInputCaps>
  </scan:Platen>
</scan:ScannerCapabilities>"#;

    #[test]
    fn parses_platen_caps_with_color_and_formats() {
        let caps = parse_capabilities(CAPS_XML.as_bytes()).unwrap();
        let platen = caps.platen.expect("platen present");
        assert!(platen.color_modes.contains(ColorModes::COLOR));
        assert!(platen.color_modes.contains(ColorModes::GRAYSCALE));
        assert!(platen.formats.contains(DocumentFormats::JPEG));
        assert!(platen.formats.contains(DocumentFormats::PDF));
        assert_eq!(platen.window.max_w, 2550);
        assert_eq!(platen.window.max_h, 3300);
        assert!(caps.adf_simplex.is_none());
    }

    #[test]
    fn missing_source_yields_none_not_error() {
        let caps = parse_capabilities(CAPS_XML.as_bytes()).unwrap();
        assert!(caps.adf_duplex.is_none());
    }

    #[test]
    fn scan_settings_round_trips_region_and_mode() {
        let params = ScanParams {
            source: crate::model::ScanSource::Platen,
            color_mode: ColorMode::Color,
            intent: crate::model::ScanIntent::Document,
            format: crate::model::ImageFormat::Jpeg,
            x_res: 300,
            y_res: 300,
            x_off: 0,
            y_off: 0,
            width: 2550,
            height: 3300,
        };
        let xml = String::from_utf8(build_scan_settings(&params).unwrap()).unwrap();
        assert!(xml.contains("<scan:ColorMode>RGB24</scan:ColorMode>"));
        assert!(xml.contains("<pwg:Width>2550</pwg:Width>"));
        assert!(xml.contains("<pwg:InputSource>Platen</pwg:InputSource>"));
    }

    #[test]
    fn absolutize_preserves_absolute_location() {
        assert_eq!(
            absolutize("http://192.0.2.1/eSCL/", "http://192.0.2.1/eSCL/ScanJobs/abc"),
            "http://192.0.2.1/eSCL/ScanJobs/abc"
        );
        assert_eq!(
            absolutize("http://192.0.2.1/eSCL/", "ScanJobs/abc"),
            "http://192.0.2.1/eSCL/ScanJobs/abc"
        );
    }

    #[test]
    fn scanner_status_processing_yields_retry() {
        let xml = br#"<scan:ScannerStatus xmlns:scan="http://schemas.hp.com/imaging/escl/2011/05/03" xmlns:pwg="http://www.pwg.org/schemas/2010/12/sm"><pwg:State>Processing</pwg:State></scan:ScannerStatus>"#;
        match parse_scanner_status(xml) {
            CheckOutcome::RetryAfter(d) => assert_eq!(d, Duration::from_millis(1000)),
            CheckOutcome::Status(_) => panic!("expected retry"),
        }
    }

    #[test]
    fn scanner_status_adf_jam_wins_over_idle() {
        let xml = br#"<scan:ScannerStatus xmlns:scan="http://schemas.hp.com/imaging/escl/2011/05/03" xmlns:pwg="http://www.pwg.org/schemas/2010/12/sm"><pwg:State>Idle</pwg:State><scan:AdfState>ScannerAdfJam</scan:AdfState></scan:ScannerStatus>"#;
        match parse_scanner_status(xml) {
            CheckOutcome::Status(ScanStatus::Jammed) => {}
            _ => panic!("expected jammed"),
        }
    }
}
