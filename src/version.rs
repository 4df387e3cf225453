// ============================================
// wupolicy - version.rs
// ============================================
// Works out which Windows this is ("Windows 10" / "Windows 11") and which
// feature release it runs ("22H2", "23H2", ...).
//
// Detection never fails. Every probe that errors or returns garbage is
// logged and skipped, and in the worst case we end up with the fallback
// release label from the config (24H2 by default).
//
// Order of attempts for the release label:
// 1. Structured query (PowerShell Get-ComputerInfo -> OsDisplayVersion)
// 2. Text dump of the CurrentVersion registry key, searched for "NNHN"
// 3. Fallback label
// ============================================

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::OperationError;

/// First build number that ships as Windows 11
pub const WINDOWS_11_FIRST_BUILD: u32 = 22000;

/// Both Windows 10 and Windows 11 report kernel major version 10
const NT_MAJOR_VERSION_10: u32 = 10;

// ============================================
// DATA STRUCTURES
// ============================================

/// Which Windows product line the host belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MajorProduct {
    Unknown,
    Windows10,
    Windows11,
}

impl MajorProduct {
    pub fn display_name(&self) -> &'static str {
        match self {
            MajorProduct::Unknown => "Unknown",
            MajorProduct::Windows10 => "Windows 10",
            MajorProduct::Windows11 => "Windows 11",
        }
    }
}

/// Result of one detection run. Computed fresh every invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub major_product: MajorProduct,
    /// Feature release label, always of the form NNHN
    pub release_label: String,
}

/// Kernel version as the OS reports it, e.g. 10.0.22631
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

/// The host queries detection depends on.
///
/// The real implementation lives in host.rs and runs Windows commands;
/// tests script the answers.
pub trait VersionProbe {
    /// Major/minor/build of the running OS
    fn os_version(&self) -> Result<OsVersion, OperationError>;

    /// Release label from a structured host-info query (may be anything,
    /// the caller validates it)
    fn structured_release(&self) -> Result<String, OperationError>;

    /// Free-form text report about the system, searched for a release label
    fn system_report(&self) -> Result<String, OperationError>;
}

// ============================================
// PURE HELPERS
// ============================================

fn label_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d{2}H\d").expect("release label pattern is valid"))
}

/// True if `value` is exactly a release label like "23H2" (whitespace around
/// it is ignored).
pub fn is_release_label(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.len() == 4
        && label_regex()
            .find(trimmed)
            .is_some_and(|m| m.start() == 0 && m.end() == trimmed.len())
}

/// Find the first release label anywhere inside `text`.
///
/// Examples:
///   extract_release_label("DisplayVersion    REG_SZ    23H2") => Some("23H2")
///   extract_release_label("Version 2009")                      => None
pub fn extract_release_label(text: &str) -> Option<String> {
    label_regex().find(text).map(|m| m.as_str().to_string())
}

/// Map kernel major version + build number to a product line.
pub fn classify_product(major: u32, build: u32) -> MajorProduct {
    if major != NT_MAJOR_VERSION_10 {
        return MajorProduct::Unknown;
    }
    if build >= WINDOWS_11_FIRST_BUILD {
        MajorProduct::Windows11
    } else {
        MajorProduct::Windows10
    }
}

// ============================================
// DETECTION
// ============================================

/// Detect the product line and release label of the running host.
///
/// Never returns an error: failed probes are logged and the next one is
/// tried, ending at `fallback_label`.
pub fn detect(probe: &dyn VersionProbe, fallback_label: &str) -> VersionInfo {
    info!("Detecting Windows version...");

    let major_product = match probe.os_version() {
        Ok(v) => {
            debug!("OS reports version {}.{}.{}", v.major, v.minor, v.build);
            classify_product(v.major, v.build)
        }
        Err(e) => {
            warn!("Could not read OS version: {}", e);
            MajorProduct::Unknown
        }
    };

    let release_label = detect_release_label(probe).unwrap_or_else(|| {
        warn!(
            "No release label found by any probe, using fallback {}",
            fallback_label
        );
        fallback_label.to_string()
    });

    info!(
        "Detected {} {}",
        major_product.display_name(),
        release_label
    );

    VersionInfo {
        major_product,
        release_label,
    }
}

fn detect_release_label(probe: &dyn VersionProbe) -> Option<String> {
    match probe.structured_release() {
        Ok(value) if is_release_label(&value) => return Some(value.trim().to_string()),
        Ok(value) => debug!("Structured query returned {:?}, not a release label", value),
        Err(e) => warn!("Structured version query failed: {}", e),
    }

    match probe.system_report() {
        Ok(text) => {
            let found = extract_release_label(&text);
            if found.is_none() {
                debug!("System report contained no release label");
            }
            found
        }
        Err(e) => {
            warn!("System report query failed: {}", e);
            None
        }
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Probe with canned answers. `None` means the probe errors.
    pub(crate) struct ScriptedProbe {
        pub version: Option<OsVersion>,
        pub structured: Option<String>,
        pub report: Option<String>,
    }

    impl ScriptedProbe {
        pub(crate) fn windows(build: u32, structured: Option<&str>, report: Option<&str>) -> Self {
            ScriptedProbe {
                version: Some(OsVersion {
                    major: 10,
                    minor: 0,
                    build,
                }),
                structured: structured.map(str::to_string),
                report: report.map(str::to_string),
            }
        }
    }

    fn fail(probe: &'static str) -> OperationError {
        OperationError::Probe {
            probe,
            reason: "unavailable".to_string(),
        }
    }

    impl VersionProbe for ScriptedProbe {
        fn os_version(&self) -> Result<OsVersion, OperationError> {
            self.version.ok_or_else(|| fail("os_version"))
        }

        fn structured_release(&self) -> Result<String, OperationError> {
            self.structured.clone().ok_or_else(|| fail("structured"))
        }

        fn system_report(&self) -> Result<String, OperationError> {
            self.report.clone().ok_or_else(|| fail("report"))
        }
    }

    #[test]
    fn test_classify_product_boundary() {
        assert_eq!(classify_product(10, 21999), MajorProduct::Windows10);
        assert_eq!(classify_product(10, 22000), MajorProduct::Windows11);
        assert_eq!(classify_product(10, 26100), MajorProduct::Windows11);
        assert_eq!(classify_product(6, 22000), MajorProduct::Unknown);
        assert_eq!(classify_product(11, 22000), MajorProduct::Unknown);
    }

    #[test]
    fn test_is_release_label() {
        assert!(is_release_label("23H2"));
        assert!(is_release_label(" 22H2\r\n"));
        assert!(!is_release_label("2009"));
        assert!(!is_release_label("23h2"));
        assert!(!is_release_label("123H2"));
        assert!(!is_release_label("23H2x"));
        assert!(!is_release_label(""));
    }

    #[test]
    fn test_extract_release_label() {
        assert_eq!(
            extract_release_label("    DisplayVersion    REG_SZ    23H2\r\n"),
            Some("23H2".to_string())
        );
        assert_eq!(extract_release_label("ReleaseId    REG_SZ    2009"), None);
        assert_eq!(extract_release_label(""), None);
    }

    #[test]
    fn test_structured_probe_wins() {
        let probe = ScriptedProbe::windows(22631, Some("23H2"), Some("DisplayVersion 22H2"));
        let info = detect(&probe, "24H2");
        assert_eq!(info.major_product, MajorProduct::Windows11);
        assert_eq!(info.release_label, "23H2");
    }

    #[test]
    fn test_falls_back_to_text_report() {
        let report = "HKEY_LOCAL_MACHINE\\...\\CurrentVersion\n    DisplayVersion    REG_SZ    23H2\n    EditionID    REG_SZ    Professional";
        let probe = ScriptedProbe::windows(22631, Some(""), Some(report));
        assert_eq!(detect(&probe, "24H2").release_label, "23H2");

        let probe = ScriptedProbe::windows(22631, None, Some(report));
        assert_eq!(detect(&probe, "24H2").release_label, "23H2");
    }

    #[test]
    fn test_default_floor_when_everything_fails() {
        let probe = ScriptedProbe::windows(19045, Some("garbage"), Some("no label here"));
        let info = detect(&probe, "24H2");
        assert_eq!(info.major_product, MajorProduct::Windows10);
        assert_eq!(info.release_label, "24H2");

        let probe = ScriptedProbe {
            version: None,
            structured: None,
            report: None,
        };
        let info = detect(&probe, "24H2");
        assert_eq!(info.major_product, MajorProduct::Unknown);
        assert_eq!(info.release_label, "24H2");
    }
}
