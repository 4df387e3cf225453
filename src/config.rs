// ============================================
// wupolicy - config.rs
// ============================================
// Optional settings file (wupolicy.toml).
//
// Every field has a default, so running without a file (the normal case)
// behaves exactly like the built-in constants. The file is looked for next
// to the EXE unless --config points somewhere else. Installing writes the
// settings in effect next to the installed copy.
//
// Example:
//
//   [detection]
//   fallback_release = "24H2"
//
//   [task]
//   name = "WUPolicyReconcile"
//   install_dir = 'C:\ProgramData\WUPolicy'
//   interval_days = 365
//   start_time = "03:00"
//
//   [run]
//   on_error = "continue"     # or "escalate"
// ============================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::report::ErrorPolicy;
use crate::version::is_release_label;

/// Name of the config file looked up next to the EXE
pub const CONFIG_FILE_NAME: &str = "wupolicy.toml";

// ============================================
// DATA STRUCTURES
// ============================================

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub detection: DetectionConfig,
    pub task: TaskConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DetectionConfig {
    /// Release label used when no probe finds one
    pub fallback_release: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        DetectionConfig {
            fallback_release: "24H2".to_string(),
        }
    }
}

/// Where the EXE gets installed and how the scheduled task looks
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TaskConfig {
    pub name: String,
    pub install_dir: PathBuf,
    pub interval_days: u32,
    /// Time of day the task fires, "HH:MM" (24h)
    pub start_time: String,
    pub description: String,
}

impl Default for TaskConfig {
    fn default() -> Self {
        TaskConfig {
            name: "WUPolicyReconcile".to_string(),
            install_dir: PathBuf::from(r"C:\ProgramData\WUPolicy"),
            interval_days: 365,
            start_time: "03:00".to_string(),
            description: "Re-applies the Windows Update target release and quality update deferral policy."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub on_error: ErrorPolicy,
}

// ============================================
// LOADING
// ============================================

impl Config {
    /// Load the config.
    ///
    /// - `explicit` given: that file must exist and parse
    /// - otherwise: wupolicy.toml next to the EXE if present, else defaults
    pub fn load(explicit: Option<&Path>) -> Result<Config> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let candidate = get_app_directory().join(CONFIG_FILE_NAME);
                if !candidate.exists() {
                    debug!("No {} found, using defaults", candidate.display());
                    return Ok(Config::default());
                }
                candidate
            }
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Config::from_toml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !is_release_label(&self.detection.fallback_release) {
            bail!(
                "detection.fallback_release must look like 24H2, got {:?}",
                self.detection.fallback_release
            );
        }
        if self.task.name.trim().is_empty() {
            bail!("task.name must not be empty");
        }
        if self.task.interval_days == 0 {
            bail!("task.interval_days must be at least 1");
        }
        if !is_valid_time_of_day(&self.task.start_time) {
            bail!(
                "task.start_time must be HH:MM (24h), got {:?}",
                self.task.start_time
            );
        }
        Ok(())
    }
}

/// "HH:MM" with 00 <= HH <= 23 and 00 <= MM <= 59
fn is_valid_time_of_day(value: &str) -> bool {
    let Some((hours, minutes)) = value.split_once(':') else {
        return false;
    };
    let two_digits = |s: &str| s.len() == 2 && s.bytes().all(|b| b.is_ascii_digit());
    if !two_digits(hours) || !two_digits(minutes) {
        return false;
    }
    matches!((hours.parse::<u32>(), minutes.parse::<u32>()), (Ok(h), Ok(m)) if h < 24 && m < 60)
}

/// Get the directory where the EXE is located.
///
/// Falls back to the current directory if the EXE path can't be resolved.
pub fn get_app_directory() -> PathBuf {
    if let Ok(exe_path) = std::env::current_exe() {
        let resolved = exe_path.canonicalize().unwrap_or(exe_path);
        if let Some(parent) = resolved.parent() {
            // Strip \\?\ prefix that canonicalize adds on Windows
            let parent_str = parent.to_string_lossy();
            if let Some(stripped) = parent_str.strip_prefix(r"\\?\") {
                return PathBuf::from(stripped);
            }
            return parent.to_path_buf();
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

// ============================================
// TESTS
// ============================================
