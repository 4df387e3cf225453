// ============================================
// wupolicy - policy.rs
// ============================================
// Writes the Windows Update policy values that pin this machine to its
// current feature release and defer quality updates.
//
// Registry values written (all under POLICY_NAMESPACE):
// - ProductVersion                  REG_SZ     "Windows 10" / "Windows 11"
// - TargetReleaseVersion            REG_DWORD  1
// - TargetReleaseVersionInfo        REG_SZ     "22H2", "23H2", ...
// - DeferQualityUpdates             REG_DWORD  1
// - DeferQualityUpdatesPeriodInDays REG_DWORD  4
//
// Each value is written on its own. One failed write does not stop the
// others, and the policy refresh runs afterwards no matter what.
// ============================================

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::OperationError;
use crate::report::{BatchReport, StepResult};
use crate::version::{MajorProduct, VersionInfo};

// ============================================
// CONSTANTS
// ============================================

/// Where Windows Update reads its machine policy from
pub const POLICY_NAMESPACE: &str = r"HKLM\SOFTWARE\Policies\Microsoft\Windows\WindowsUpdate";

pub const KEY_PRODUCT_VERSION: &str = "ProductVersion";
pub const KEY_TARGET_RELEASE: &str = "TargetReleaseVersion";
pub const KEY_TARGET_RELEASE_INFO: &str = "TargetReleaseVersionInfo";
pub const KEY_DEFER_QUALITY: &str = "DeferQualityUpdates";
pub const KEY_DEFER_QUALITY_DAYS: &str = "DeferQualityUpdatesPeriodInDays";

/// Quality updates are held back this many days
pub const QUALITY_DEFERRAL_DAYS: u32 = 4;

/// ProductVersion written when the product line could not be classified.
/// Matches the default release label, which is a Windows 11 release.
const UNKNOWN_PRODUCT_FALLBACK: &str = "Windows 11";

// ============================================
// DATA STRUCTURES
// ============================================

/// Registry value types we can read and write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueKind {
    Dword,
    Qword,
    String,
    ExpandString,
}

impl ValueKind {
    /// Name as used by reg.exe (/t argument and query output)
    pub fn reg_type(&self) -> &'static str {
        match self {
            ValueKind::Dword => "REG_DWORD",
            ValueKind::Qword => "REG_QWORD",
            ValueKind::String => "REG_SZ",
            ValueKind::ExpandString => "REG_EXPAND_SZ",
        }
    }

    pub fn from_reg_type(reg_type: &str) -> Option<ValueKind> {
        [
            ValueKind::Dword,
            ValueKind::Qword,
            ValueKind::String,
            ValueKind::ExpandString,
        ]
        .into_iter()
        .find(|k| k.reg_type() == reg_type)
    }
}

/// A typed policy value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PolicyValue {
    Dword(u32),
    Qword(u64),
    String(String),
    ExpandString(String),
    /// Found in the store with a type we don't handle (REG_BINARY,
    /// REG_MULTI_SZ, ...). Never written.
    Unsupported { reg_type: String, data: String },
}

impl PolicyValue {
    /// `None` for `Unsupported`
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            PolicyValue::Dword(_) => Some(ValueKind::Dword),
            PolicyValue::Qword(_) => Some(ValueKind::Qword),
            PolicyValue::String(_) => Some(ValueKind::String),
            PolicyValue::ExpandString(_) => Some(ValueKind::ExpandString),
            PolicyValue::Unsupported { .. } => None,
        }
    }

    pub fn reg_type(&self) -> &str {
        match self {
            PolicyValue::Unsupported { reg_type, .. } => reg_type,
            other => other.kind().map_or("", |k| k.reg_type()),
        }
    }

    /// Text form as passed to `reg add /d`
    pub fn data(&self) -> String {
        match self {
            PolicyValue::Dword(n) => n.to_string(),
            PolicyValue::Qword(n) => n.to_string(),
            PolicyValue::String(s) | PolicyValue::ExpandString(s) => s.clone(),
            PolicyValue::Unsupported { data, .. } => data.clone(),
        }
    }

    /// The string content of REG_SZ / REG_EXPAND_SZ values
    pub fn as_text(&self) -> Option<&str> {
        match self {
            PolicyValue::String(s) | PolicyValue::ExpandString(s) => Some(s),
            _ => None,
        }
    }

    /// Convert into `kind`, so an existing value keeps its registry type.
    pub fn coerce_to(&self, kind: ValueKind) -> Result<PolicyValue, String> {
        let text = self.data();
        let not_numeric =
            |_| format!("existing value is {}, cannot store {:?} in it", kind.reg_type(), text);
        match kind {
            ValueKind::String => Ok(PolicyValue::String(text.clone())),
            ValueKind::ExpandString => Ok(PolicyValue::ExpandString(text.clone())),
            ValueKind::Dword => text.trim().parse().map(PolicyValue::Dword).map_err(not_numeric),
            ValueKind::Qword => text.trim().parse().map(PolicyValue::Qword).map_err(not_numeric),
        }
    }
}

/// The five policy values derived from a detection result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySettings {
    pub product_version: String,
    pub target_release_version_info: String,
}

impl PolicySettings {
    pub fn from_version(info: &VersionInfo) -> Self {
        let product_version = match info.major_product {
            MajorProduct::Unknown => UNKNOWN_PRODUCT_FALLBACK.to_string(),
            known => known.display_name().to_string(),
        };
        PolicySettings {
            product_version,
            target_release_version_info: info.release_label.clone(),
        }
    }

    /// All five values in write order
    pub fn entries(&self) -> Vec<(&'static str, PolicyValue)> {
        vec![
            (
                KEY_PRODUCT_VERSION,
                PolicyValue::String(self.product_version.clone()),
            ),
            (KEY_TARGET_RELEASE, PolicyValue::Dword(1)),
            (
                KEY_TARGET_RELEASE_INFO,
                PolicyValue::String(self.target_release_version_info.clone()),
            ),
            (KEY_DEFER_QUALITY, PolicyValue::Dword(1)),
            (
                KEY_DEFER_QUALITY_DAYS,
                PolicyValue::Dword(QUALITY_DEFERRAL_DAYS),
            ),
        ]
    }
}

/// How the tool was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// A person ran it: always write
    Interactive,
    /// The scheduled task ran it: skip everything if already reconciled
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Reconciled,
    NotReconciled,
}

// ============================================
// CAPABILITIES
// ============================================

/// Persistent key/value store holding machine policy (the registry on a real
/// host).
pub trait PolicyStore {
    fn exists(&self, namespace: &str) -> Result<bool, OperationError>;

    fn create_namespace(&mut self, namespace: &str) -> Result<(), OperationError>;

    /// `Ok(None)` when the value (or the whole namespace) is absent
    fn get_value(&self, namespace: &str, key: &str) -> Result<Option<PolicyValue>, OperationError>;

    fn set_value(
        &mut self,
        namespace: &str,
        key: &str,
        value: &PolicyValue,
    ) -> Result<(), OperationError>;
}

/// Makes the host apply freshly written policy right away.
pub trait PolicyRefresh {
    /// Returns a short description of what happened
    fn refresh(&self) -> Result<String, OperationError>;
}

// ============================================
// RECONCILIATION
// ============================================

/// Compare the two detection-derived values with what the store holds.
///
/// Read errors count as "not reconciled".
pub fn current_state(store: &dyn PolicyStore, settings: &PolicySettings) -> ReconcileState {
    let matches = |key: &str, expected: &str| match store.get_value(POLICY_NAMESPACE, key) {
        Ok(Some(value)) => value.as_text() == Some(expected),
        Ok(None) => false,
        Err(e) => {
            warn!("Could not read {}: {}", key, e);
            false
        }
    };

    if matches(KEY_PRODUCT_VERSION, &settings.product_version)
        && matches(
            KEY_TARGET_RELEASE_INFO,
            &settings.target_release_version_info,
        )
    {
        ReconcileState::Reconciled
    } else {
        ReconcileState::NotReconciled
    }
}

/// Bring the policy store in line with `info`.
///
/// In scheduled mode nothing is written (and nothing refreshed) when the
/// store already matches. Otherwise all five values are written and the
/// refresh always runs.
pub fn reconcile(
    store: &mut dyn PolicyStore,
    refresher: &dyn PolicyRefresh,
    info: &VersionInfo,
    mode: RunMode,
) -> BatchReport {
    let settings = PolicySettings::from_version(info);
    let mut report = BatchReport::default();

    if mode == RunMode::Scheduled
        && current_state(&*store, &settings) == ReconcileState::Reconciled
    {
        info!(
            "Policy already set to {} {}, nothing to do",
            settings.product_version, settings.target_release_version_info
        );
        report.already_reconciled = true;
        return report;
    }

    info!(
        "Applying update policy: {} {}",
        settings.product_version, settings.target_release_version_info
    );

    report.extend(ensure_namespace(store));

    for (key, value) in settings.entries() {
        let outcome = write_key(store, key, &value);
        report.extend([StepResult::from_outcome(format!("set:{}", key), outcome)]);
    }

    report.extend([StepResult::from_outcome("refresh", refresher.refresh())]);

    info!("Policy application complete. {}", report.summary());
    report
}

/// Create the policy namespace if it is missing.
///
/// Returns no step when it already exists.
fn ensure_namespace(store: &mut dyn PolicyStore) -> Option<StepResult> {
    match store.exists(POLICY_NAMESPACE) {
        Ok(true) => None,
        Ok(false) => {
            let outcome = store
                .create_namespace(POLICY_NAMESPACE)
                .map(|_| format!("created {}", POLICY_NAMESPACE));
            Some(StepResult::from_outcome("namespace", outcome))
        }
        Err(e) => Some(StepResult::failed("namespace", &e)),
    }
}

/// Write a single value, creating it or overwriting it in its existing type.
fn write_key(
    store: &mut dyn PolicyStore,
    key: &str,
    target: &PolicyValue,
) -> Result<String, OperationError> {
    let existing = store.get_value(POLICY_NAMESPACE, key)?;

    let (value, verb) = match existing {
        None => (target.clone(), "created"),
        Some(current) => match current.kind() {
            Some(kind) => {
                let value = target
                    .coerce_to(kind)
                    .map_err(|reason| OperationError::store(key, reason))?;
                if Some(kind) != target.kind() {
                    debug!("{} exists as {}, keeping that type", key, kind.reg_type());
                }
                (value, "updated")
            }
            None => {
                warn!(
                    "{} exists as {}, replacing it with {}",
                    key,
                    current.reg_type(),
                    target.reg_type()
                );
                (target.clone(), "replaced")
            }
        },
    };

    store.set_value(POLICY_NAMESPACE, key, &value)?;
    Ok(format!("{} {} = {}", verb, value.reg_type(), value.data()))
}

// ============================================
// TESTS
// ============================================
