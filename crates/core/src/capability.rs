//! One-shot host hardware check that gates inference for the whole run.
//!
//! Display adapters are identified by their PCI vendor id, read from
//! `/sys/class/drm/card*/device/vendor` on Linux. Other platforms report no
//! identifiers, so inference stays off there unless the check is forced
//! through configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CapabilityConfig;

pub const DRM_CLASS_DIR: &str = "/sys/class/drm";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareIdentifier {
    /// Normalized `0x`-prefixed lowercase PCI vendor id.
    pub vendor_id: String,
    pub device_id: Option<String>,
    pub source: PathBuf,
}

/// Source of hardware identifiers. Swappable so tests never touch real hardware.
pub trait HardwareProbe {
    fn identifiers(&self) -> Vec<HardwareIdentifier>;
}

/// Reads DRM card entries under a sysfs class directory.
pub struct SysfsProbe {
    root: PathBuf,
}

impl SysfsProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self::new(DRM_CLASS_DIR)
    }
}

impl HardwareProbe for SysfsProbe {
    fn identifiers(&self) -> Vec<HardwareIdentifier> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(error) => {
                debug!(root = %self.root.display(), error = %error, "No DRM class directory");
                return Vec::new();
            }
        };

        let mut found = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            // `card0`, not connector entries such as `card0-HDMI-A-1`.
            let is_card = name
                .strip_prefix("card")
                .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()));
            if !is_card {
                continue;
            }

            let device_dir = entry.path().join("device");
            let Some(vendor_id) = read_id(&device_dir.join("vendor")) else {
                continue;
            };
            found.push(HardwareIdentifier {
                vendor_id,
                device_id: read_id(&device_dir.join("device")),
                source: device_dir,
            });
        }
        found
    }
}

fn read_id(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let normalized = normalize_pci_id(&raw);
    (!normalized.is_empty()).then_some(normalized)
}

/// `"0x8086\n"`, `"8086"` and `"0X8086"` all become `"0x8086"`.
pub fn normalize_pci_id(raw: &str) -> String {
    let trimmed = raw.trim().to_ascii_lowercase();
    let digits = trimmed.strip_prefix("0x").unwrap_or(&trimmed);
    if digits.is_empty() {
        return String::new();
    }
    format!("0x{digits}")
}

/// True when any identifier's vendor is on the allow-list.
pub fn is_compatible(identifiers: &[HardwareIdentifier], allowed_vendor_ids: &[String]) -> bool {
    identifiers.iter().any(|id| {
        allowed_vendor_ids
            .iter()
            .any(|allowed| normalize_pci_id(allowed) == id.vendor_id)
    })
}

/// Result of the startup capability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityReport {
    pub compatible: bool,
    pub forced: bool,
    pub identifiers: Vec<HardwareIdentifier>,
}

/// Compute the capability flag once. `force` in the config wins over the probe.
pub fn probe(hardware: &dyn HardwareProbe, config: &CapabilityConfig) -> CapabilityReport {
    let identifiers = hardware.identifiers();
    let detected = is_compatible(&identifiers, &config.allowed_vendor_ids);

    let report = match config.force {
        Some(forced) => {
            if forced != detected {
                warn!(
                    detected,
                    forced,
                    "Hardware capability overridden by configuration"
                );
            }
            CapabilityReport {
                compatible: forced,
                forced: true,
                identifiers,
            }
        }
        None => CapabilityReport {
            compatible: detected,
            forced: false,
            identifiers,
        },
    };

    info!(
        compatible = report.compatible,
        forced = report.forced,
        adapters = report.identifiers.len(),
        "Hardware capability computed"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<&'static str>);

    impl HardwareProbe for Fixed {
        fn identifiers(&self) -> Vec<HardwareIdentifier> {
            self.0
                .iter()
                .map(|vendor| HardwareIdentifier {
                    vendor_id: normalize_pci_id(vendor),
                    device_id: None,
                    source: PathBuf::from("fixed"),
                })
                .collect()
        }
    }

    fn write_card(root: &Path, card: &str, vendor: &str, device: &str) {
        let dir = root.join(card).join("device");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), vendor).unwrap();
        fs::write(dir.join("device"), device).unwrap();
    }

    #[test]
    fn test_normalize_pci_id() {
        assert_eq!(normalize_pci_id("0x8086\n"), "0x8086");
        assert_eq!(normalize_pci_id("8086"), "0x8086");
        assert_eq!(normalize_pci_id("0X10DE"), "0x10de");
        assert_eq!(normalize_pci_id("  "), "");
        assert_eq!(normalize_pci_id("0x"), "");
    }

    #[test]
    fn test_sysfs_probe_reads_cards_only() {
        let temp = tempfile::tempdir().unwrap();
        write_card(temp.path(), "card0", "0x8086\n", "0x9a49\n");
        write_card(temp.path(), "card0-HDMI-A-1", "0x1234\n", "0x0001\n");
        write_card(temp.path(), "renderD128", "0x10de\n", "0x2204\n");

        let ids = SysfsProbe::new(temp.path()).identifiers();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].vendor_id, "0x8086");
        assert_eq!(ids[0].device_id.as_deref(), Some("0x9a49"));
    }

    #[test]
    fn test_sysfs_probe_without_directory_is_empty() {
        let temp = tempfile::tempdir().unwrap();
        let ids = SysfsProbe::new(temp.path().join("missing")).identifiers();
        assert!(ids.is_empty());
    }

    #[test]
    fn test_compatible_vendor_enables_capability() {
        let config = CapabilityConfig::default();
        let report = probe(&Fixed(vec!["0x1af4", "0x8086"]), &config);
        assert!(report.compatible);
        assert!(!report.forced);
    }

    #[test]
    fn test_no_match_disables_capability() {
        let config = CapabilityConfig {
            allowed_vendor_ids: vec!["8086".into()],
            force: None,
        };
        assert!(!probe(&Fixed(vec!["0x1af4"]), &config).compatible);
        assert!(!probe(&Fixed(vec![]), &config).compatible);
    }

    #[test]
    fn test_force_overrides_probe() {
        let forced_off = CapabilityConfig {
            force: Some(false),
            ..CapabilityConfig::default()
        };
        let report = probe(&Fixed(vec!["0x8086"]), &forced_off);
        assert!(!report.compatible);
        assert!(report.forced);

        let forced_on = CapabilityConfig {
            force: Some(true),
            ..CapabilityConfig::default()
        };
        assert!(probe(&Fixed(vec![]), &forced_on).compatible);
    }
}
