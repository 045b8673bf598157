//! Shared data model (spec §3): endpoints, device records, capabilities
//! and per-job scan parameters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Tiny bitflags-like macro, used instead of pulling in the `bitflags`
/// crate for two small sets — kept local because these are purely
/// internal capability bitsets, not an FFI-facing flags type.
macro_rules! bitflags_like {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
        pub struct $name(u32);

        impl $name {
            $(pub const $variant: Self = Self($value);)+

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn is_empty(&self) -> bool {
                self.0 == 0
            }

            pub const fn contains(&self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                *self = self.union(rhs);
            }
        }
    };
}

/// Wire protocol spoken by an [`Endpoint`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Escl,
    Wsd,
}

/// A contact point for one scanner: `(protocol, base URI, is_ipv6,
/// is_link_local)`. A link-local IPv6 endpoint additionally carries the
/// interface index it was discovered on (the "zone").
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub uri: String,
    pub is_ipv6: bool,
    pub is_link_local: bool,
    pub zone: Option<u32>,
}

impl Endpoint {
    pub fn new(protocol: Protocol, uri: impl Into<String>) -> Self {
        Self {
            protocol,
            uri: uri.into(),
            is_ipv6: false,
            is_link_local: false,
            zone: None,
        }
    }

    /// Ranking key per spec §3: normal addresses before link-local,
    /// IPv6 before IPv4 when otherwise equal. `sort_by_key` with this
    /// tuple gives a stable, idempotent, total order.
    fn rank_key(&self) -> (u8, u8, &str) {
        let link_local_rank = if self.is_link_local { 1 } else { 0 };
        // IPv6 preferred over IPv4: invert is_ipv6 so "0" sorts first.
        let family_rank = if self.is_ipv6 { 0 } else { 1 };
        (link_local_rank, family_rank, self.uri.as_str())
    }

    /// Sorts and deduplicates a list of endpoints as the registry does
    /// once all pending resolvers for a device complete (spec §4.D).
    /// Equal URI and equal `(protocol, is_ipv6, is_link_local)` merge.
    pub fn sort_and_dedup(endpoints: &mut Vec<Endpoint>) {
        endpoints.sort_by(|a, b| a.rank_key().cmp(&b.rank_key()));
        endpoints.dedup_by(|a, b| {
            a.uri == b.uri
                && a.protocol == b.protocol
                && a.is_ipv6 == b.is_ipv6
                && a.is_link_local == b.is_link_local
        });
    }
}

/// A discovered scanner. Created the first time any discovery source
/// reports it; its endpoint list accumulates until all pending resolvers
/// complete, at which point it is reported exactly once (spec §4.D).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    pub id: String,
    pub endpoints: Vec<Endpoint>,
    pub reported: bool,
    pub initial_scan: bool,
}

impl Device {
    pub fn new(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            endpoints: Vec::new(),
            reported: false,
            initial_scan: true,
        }
    }

    pub fn best_endpoint(&self) -> Option<&Endpoint> {
        self.endpoints.first()
    }

    /// The best-ranked endpoint speaking `protocol`, if any (a device
    /// record may carry endpoints for both protocols when the same
    /// physical scanner was reported by more than one discovery source).
    pub fn endpoint_for(&self, protocol: Protocol) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.protocol == protocol)
    }
}

/// Document source a capability set or scan job refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ScanSource {
    Platen,
    AdfSimplex,
    AdfDuplex,
}

bitflags_like! {
    /// Supported color modes for a source (spec §3: bitset over
    /// {BW1, Grayscale, Color}).
    ColorModes {
        BW1 = 0b001,
        GRAYSCALE = 0b010,
        COLOR = 0b100,
    }
}

bitflags_like! {
    /// Supported document formats for a source.
    DocumentFormats {
        JPEG = 0b00001,
        PDF = 0b00010,
        PNG = 0b00100,
        TIFF = 0b01000,
        BMP = 0b10000,
    }
}

/// A `(min, max, step)` range, or a sorted set of discrete resolutions
/// (the intersection of the device's advertised X and Y resolution
/// sets, per spec §3).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Resolutions {
    Discrete(BTreeSet<u32>),
    Range { min: u32, max: u32, step: u32 },
}

impl Resolutions {
    pub fn contains(&self, dpi: u32) -> bool {
        match self {
            Resolutions::Discrete(set) => set.contains(&dpi),
            Resolutions::Range { min, max, step } => {
                dpi >= *min && dpi <= *max && (*step == 0 || (dpi - min) % step == 0)
            }
        }
    }

    pub fn closest(&self, dpi: u32) -> u32 {
        match self {
            Resolutions::Discrete(set) => *set
                .iter()
                .min_by_key(|&&r| (r as i64 - dpi as i64).abs())
                .unwrap_or(&dpi),
            Resolutions::Range { min, max, step } => {
                let clamped = dpi.clamp(*min, *max);
                if *step <= 1 {
                    clamped
                } else {
                    let steps = (clamped - min + step / 2) / step;
                    (*min + steps * step).min(*max)
                }
            }
        }
    }
}

/// Scan window bounds in pixels, plus their derived millimetre values
/// (unit = 1000µm, spec §3).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WindowRange {
    pub min_w: u32,
    pub max_w: u32,
    pub min_h: u32,
    pub max_h: u32,
}

impl WindowRange {
    /// Derived millimetre bounds at the given resolution (pixels / dpi *
    /// 25.4, in thousandths of a millimetre per the device unit).
    pub fn mm_at(&self, dpi: u32) -> (u32, u32, u32, u32) {
        let to_mm_thousandths = |px: u32| -> u32 {
            if dpi == 0 {
                0
            } else {
                ((px as f64 / dpi as f64) * 25.4 * 1000.0).round() as u32
            }
        };
        (
            to_mm_thousandths(self.min_w),
            to_mm_thousandths(self.max_w),
            to_mm_thousandths(self.min_h),
            to_mm_thousandths(self.max_h),
        )
    }

    /// Forces `min == max` on both axes — the WSD "software clipping"
    /// quirk (spec §4.F.2): some devices accept a scan region but ignore
    /// it when rendering, so the host framework must clip client-side.
    pub fn force_full_page(&mut self) {
        self.min_w = self.max_w;
        self.min_h = self.max_h;
    }
}

/// Scan intent hint (spec glossary).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ScanIntent {
    Document,
    Photo,
    Halftone,
    TextAndGraphic,
}

/// Per-source capability advertisement (spec §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceCaps {
    pub color_modes: ColorModes,
    pub formats: DocumentFormats,
    pub intents: Vec<ScanIntent>,
    pub resolutions: Resolutions,
    pub window: WindowRange,
}

impl SourceCaps {
    /// Validates the §3 invariants for a single source.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.window.min_w > self.window.max_w || self.window.min_h > self.window.max_h {
            return Err(crate::error::ScanError::Invalid(
                "window min exceeds max".into(),
            ));
        }
        if self.color_modes.is_empty() {
            return Err(crate::error::ScanError::Invalid(
                "source advertises no color modes".into(),
            ));
        }
        match &self.resolutions {
            Resolutions::Discrete(set) if set.is_empty() => {
                return Err(crate::error::ScanError::Invalid(
                    "source advertises no resolutions".into(),
                ))
            }
            _ => {}
        }
        Ok(())
    }

    /// ADF-duplex inherits from ADF-simplex when the device advertises
    /// duplex support but never supplied a distinct back-side
    /// configuration (spec §3, §4.F.1 ADF inheritance rule).
    pub fn inherit_from(&self) -> Self {
        self.clone()
    }
}

/// Full capability set for a device (spec §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub protocol_name: String,
    /// Always 1000 (µm per unit), carried explicitly per spec §3.
    pub unit_um: u32,
    pub platen: Option<SourceCaps>,
    pub adf_simplex: Option<SourceCaps>,
    pub adf_duplex: Option<SourceCaps>,
}

impl DeviceCapabilities {
    /// At least one source must be present (spec §3 invariant).
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.platen.is_none() && self.adf_simplex.is_none() && self.adf_duplex.is_none() {
            return Err(crate::error::ScanError::Invalid(
                "device advertises no scan sources".into(),
            ));
        }
        for caps in [&self.platen, &self.adf_simplex, &self.adf_duplex]
            .into_iter()
            .flatten()
        {
            caps.validate()?;
        }
        Ok(())
    }

    pub fn source(&self, source: ScanSource) -> Option<&SourceCaps> {
        match source {
            ScanSource::Platen => self.platen.as_ref(),
            ScanSource::AdfSimplex => self.adf_simplex.as_ref(),
            ScanSource::AdfDuplex => self.adf_duplex.as_ref(),
        }
    }
}

/// Color mode selected for a single scan job (a single value, not a
/// bitset — the bitset lives in capabilities).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ColorMode {
    BlackAndWhite1,
    Grayscale,
    Color,
}

/// Image format selected for a single scan job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    Jpeg,
    Pdf,
    Png,
    Tiff,
    Bmp,
}

impl ImageFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Pdf => "application/pdf",
            ImageFormat::Png => "image/png",
            ImageFormat::Tiff => "image/tiff",
            ImageFormat::Bmp => "image/bmp",
        }
    }
}

/// Scan parameters produced by the adaptor from caller-set options and
/// consumed verbatim by the protocol handler (spec §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanParams {
    pub source: ScanSource,
    pub color_mode: ColorMode,
    pub intent: ScanIntent,
    pub format: ImageFormat,
    pub x_res: u32,
    pub y_res: u32,
    pub x_off: u32,
    pub y_off: u32,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(proto: Protocol, uri: &str, ipv6: bool, ll: bool) -> Endpoint {
        Endpoint {
            protocol: proto,
            uri: uri.to_string(),
            is_ipv6: ipv6,
            is_link_local: ll,
            zone: None,
        }
    }

    #[test]
    fn endpoint_sort_is_stable_and_idempotent() {
        let mut list = vec![
            ep(Protocol::Escl, "http://192.0.2.1:80/eSCL/", false, false),
            ep(
                Protocol::Escl,
                "http://[fe80::1%25eth0]:80/eSCL/",
                true,
                true,
            ),
            ep(Protocol::Escl, "http://[2001:db8::1]:80/eSCL/", true, false),
        ];
        Endpoint::sort_and_dedup(&mut list);
        let once = list.clone();
        Endpoint::sort_and_dedup(&mut list);
        assert_eq!(once, list, "sort must be idempotent");
        // IPv6 routable before IPv4 before link-local.
        assert_eq!(list[0].uri, "http://[2001:db8::1]:80/eSCL/");
        assert_eq!(list[1].uri, "http://192.0.2.1:80/eSCL/");
        assert!(list[2].is_link_local);
    }

    #[test]
    fn endpoint_dedup_merges_identical_entries() {
        let mut list = vec![
            ep(Protocol::Escl, "http://192.0.2.1:80/eSCL/", false, false),
            ep(Protocol::Escl, "http://192.0.2.1:80/eSCL/", false, false),
            ep(
                Protocol::Escl,
                "http://[fe80::1%25eth0]:80/eSCL/",
                true,
                true,
            ),
        ];
        Endpoint::sort_and_dedup(&mut list);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn window_invariant_rejects_inverted_bounds() {
        let caps = SourceCaps {
            color_modes: ColorModes::COLOR,
            formats: DocumentFormats::JPEG,
            intents: vec![ScanIntent::Document],
            resolutions: Resolutions::Discrete(BTreeSet::from([300])),
            window: WindowRange {
                min_w: 100,
                max_w: 50,
                min_h: 0,
                max_h: 100,
            },
        };
        assert!(caps.validate().is_err());
    }

    #[test]
    fn force_full_page_clips_to_max() {
        let mut w = WindowRange {
            min_w: 0,
            max_w: 2550,
            min_h: 0,
            max_h: 3300,
        };
        w.force_full_page();
        assert_eq!(w.min_w, w.max_w);
        assert_eq!(w.min_h, w.max_h);
    }
}
