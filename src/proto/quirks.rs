//! Device-model quirk table (spec §9 "Open questions"): model-name
//! overrides that would otherwise be hardcoded deep inside the WSD
//! handler. Resolved by substring match against the device's
//! discovery name, the way the spec's open question recommends.

/// Per-device-model overrides to the otherwise-uniform WSD handling.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeviceQuirks {
    /// Overrides `ImagesToTransfer` in `CreateScanJob` regardless of
    /// source (Ricoh Aficio MP 201 quirk, spec §4.F.2).
    pub images_to_transfer_override: Option<u32>,
    /// Remaps `ServerErrorNotAcceptingJobs` + ADF + scanner state
    /// `Idle` to `NO_DOCS` instead of `DEVICE_BUSY` (Canon MF410 quirk,
    /// spec §4.F.2 "Check").
    pub remap_busy_idle_to_no_docs: bool,
    /// Forces `min == max` on the scan window regardless of what the
    /// device's capabilities advertise (spec §4.F.2 "Software
    /// clipping"). The spec resolves the two historical C code paths
    /// in favour of always-on; see DESIGN.md.
    pub force_software_clip: bool,
}

impl DeviceQuirks {
    pub const fn none() -> Self {
        Self {
            images_to_transfer_override: None,
            remap_busy_idle_to_no_docs: false,
            force_software_clip: true,
        }
    }
}

/// One row of the table: a case-insensitive substring to match against
/// the device's discovery name or model string, and the quirks that
/// apply when it matches.
struct Rule {
    needle: &'static str,
    quirks: DeviceQuirks,
}

const RULES: &[Rule] = &[
    Rule {
        needle: "aficio mp 201",
        quirks: DeviceQuirks {
            images_to_transfer_override: Some(100),
            remap_busy_idle_to_no_docs: false,
            force_software_clip: true,
        },
    },
    Rule {
        needle: "mf410",
        quirks: DeviceQuirks {
            images_to_transfer_override: None,
            remap_busy_idle_to_no_docs: true,
            force_software_clip: true,
        },
    },
];

/// Looks up quirks for a device by (case-insensitive) model or
/// discovery name. Devices matching no rule get the defaults —
/// software clipping on, no other overrides.
#[derive(Clone, Copy, Debug, Default)]
pub struct QuirkTable;

impl QuirkTable {
    pub fn resolve(&self, device_name: &str) -> DeviceQuirks {
        let lower = device_name.to_ascii_lowercase();
        for rule in RULES {
            if lower.contains(rule.needle) {
                return rule.quirks;
            }
        }
        DeviceQuirks::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ricoh_mp201_gets_images_to_transfer_override() {
        let q = QuirkTable.resolve("RICOH Aficio MP 201");
        assert_eq!(q.images_to_transfer_override, Some(100));
    }

    #[test]
    fn canon_mf410_gets_busy_idle_remap() {
        let q = QuirkTable.resolve("Canon MF410 Series");
        assert!(q.remap_busy_idle_to_no_docs);
    }

    #[test]
    fn unknown_device_gets_defaults() {
        let q = QuirkTable.resolve("Generic Scanner 9000");
        assert_eq!(q.images_to_transfer_override, None);
        assert!(!q.remap_busy_idle_to_no_docs);
        assert!(q.force_software_clip);
    }
}
