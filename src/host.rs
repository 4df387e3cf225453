// ============================================
// wupolicy - host.rs
// ============================================
// The real Windows side of things. Everything here runs a system command:
//
//   reg.exe         - read/write the policy values, dump CurrentVersion
//   cmd /c ver      - OS major/minor/build when the registry has none
//   powershell      - Get-ComputerInfo, Register-ScheduledTask
//   gpupdate /force - make the new policy take effect immediately
//   schtasks /Query - does our task already exist?
//
// The output parsers are plain functions so they can be tested with
// captured output on any OS.
// ============================================

use std::process::{Command, Output};
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::OperationError;
use crate::policy::{PolicyRefresh, PolicyStore, PolicyValue, ValueKind};
use crate::task::{TaskScheduler, TaskSpec};
use crate::version::{OsVersion, VersionProbe};

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Keeps console windows from flashing up when run from the scheduler
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Registry key holding DisplayVersion, ReleaseId, CurrentBuild, ...
const CURRENT_VERSION_KEY: &str = r"HKLM\SOFTWARE\Microsoft\Windows NT\CurrentVersion";

/// What reg.exe prints when a key or value does not exist
const REG_NOT_FOUND: &str = "unable to find";

// ============================================
// COMMAND HELPERS
// ============================================

fn describe(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a command and return its output, whatever the exit status.
fn run(program: &str, args: &[&str]) -> Result<Output, OperationError> {
    trace!("Running: {}", describe(program, args));

    let mut command = Command::new(program);
    command.args(args);
    #[cfg(windows)]
    command.creation_flags(CREATE_NO_WINDOW);

    command.output().map_err(|source| OperationError::Spawn {
        command: describe(program, args),
        source,
    })
}

/// Run a command and turn a non-zero exit into an error.
fn run_checked(program: &str, args: &[&str]) -> Result<String, OperationError> {
    let output = run(program, args)?;
    if !output.status.success() {
        return Err(command_failed(program, args, &output));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn command_failed(program: &str, args: &[&str], output: &Output) -> OperationError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    OperationError::CommandFailed {
        command: describe(program, args),
        status: output.status.to_string(),
        // Some tools (gpupdate, schtasks) report errors on stdout
        stderr: if stderr.is_empty() { stdout } else { stderr },
    }
}

fn powershell(script: &str) -> Result<String, OperationError> {
    run_checked(
        "powershell",
        &[
            "-NoProfile",
            "-NonInteractive",
            "-ExecutionPolicy",
            "Bypass",
            "-Command",
            script,
        ],
    )
}

/// Quote a string as a PowerShell single-quoted literal
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

// ============================================
// POLICY STORE (reg.exe)
// ============================================

/// Policy store backed by the live registry through reg.exe
#[derive(Debug, Default)]
pub struct RegistryStore;

impl PolicyStore for RegistryStore {
    fn exists(&self, namespace: &str) -> Result<bool, OperationError> {
        let output = run("reg", &["query", namespace])?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains(REG_NOT_FOUND) {
            return Ok(false);
        }
        Err(command_failed("reg", &["query", namespace], &output))
    }

    fn create_namespace(&mut self, namespace: &str) -> Result<(), OperationError> {
        run_checked("reg", &["add", namespace, "/f"])
            .map(|_| ())
            .map_err(|e| OperationError::store(namespace, e))
    }

    fn get_value(&self, namespace: &str, key: &str) -> Result<Option<PolicyValue>, OperationError> {
        let args = ["query", namespace, "/v", key];
        let output = run("reg", &args)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains(REG_NOT_FOUND) {
                return Ok(None);
            }
            return Err(OperationError::store(key, command_failed("reg", &args, &output)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_reg_query_value(&stdout, key).map_err(|reason| OperationError::store(key, reason))
    }

    fn set_value(
        &mut self,
        namespace: &str,
        key: &str,
        value: &PolicyValue,
    ) -> Result<(), OperationError> {
        let Some(kind) = value.kind() else {
            return Err(OperationError::store(
                key,
                format!("cannot write a {} value", value.reg_type()),
            ));
        };
        let data = value.data();
        let args = [
            "add",
            namespace,
            "/v",
            key,
            "/t",
            kind.reg_type(),
            "/d",
            data.as_str(),
            "/f",
        ];
        run_checked("reg", &args)
            .map(|_| ())
            .map_err(|e| OperationError::store(key, e))
    }
}

/// Pull one value out of `reg query <key> /v <name>` output.
///
/// The interesting line looks like:
///   "    ProductVersion    REG_SZ    Windows 11"
///   "    TargetReleaseVersion    REG_DWORD    0x1"
pub fn parse_reg_query_value(output: &str, name: &str) -> Result<Option<PolicyValue>, String> {
    for line in output.lines() {
        let Some(rest) = line.trim().strip_prefix(name) else {
            continue;
        };
        // Guard against a longer name sharing the prefix
        if !rest.starts_with(char::is_whitespace) {
            continue;
        }

        let rest = rest.trim_start();
        let (reg_type, data) = match rest.split_once(char::is_whitespace) {
            Some((t, d)) => (t, d.trim()),
            None => (rest, ""),
        };

        let Some(kind) = ValueKind::from_reg_type(reg_type) else {
            return Ok(Some(PolicyValue::Unsupported {
                reg_type: reg_type.to_string(),
                data: data.to_string(),
            }));
        };
        let unreadable = || format!("unreadable {} data {:?}", reg_type, data);
        let value = match kind {
            ValueKind::String => PolicyValue::String(data.to_string()),
            ValueKind::ExpandString => PolicyValue::ExpandString(data.to_string()),
            ValueKind::Dword => parse_number(data)
                .and_then(|n| u32::try_from(n).ok())
                .map(PolicyValue::Dword)
                .ok_or_else(unreadable)?,
            ValueKind::Qword => parse_number(data)
                .map(PolicyValue::Qword)
                .ok_or_else(unreadable)?,
        };
        return Ok(Some(value));
    }
    Ok(None)
}

/// reg.exe prints DWORD/QWORD data as hex ("0x1e")
fn parse_number(data: &str) -> Option<u64> {
    match data.strip_prefix("0x").or_else(|| data.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => data.parse().ok(),
    }
}

// ============================================
// VERSION PROBES
// ============================================

/// Version probes that query the live system
#[derive(Debug, Default)]
pub struct WindowsProbe;

/// The part of `Get-ComputerInfo | ConvertTo-Json` we read
#[derive(Debug, Deserialize)]
struct ComputerInfo {
    #[serde(rename = "OsDisplayVersion")]
    os_display_version: Option<String>,
}

impl VersionProbe for WindowsProbe {
    /// CurrentVersion registry values first, since `ver` output is localized
    fn os_version(&self) -> Result<OsVersion, OperationError> {
        match run_checked("reg", &["query", CURRENT_VERSION_KEY]) {
            Ok(dump) => {
                if let Some(version) = parse_current_version_dump(&dump) {
                    return Ok(version);
                }
                debug!("CurrentVersion has no version numbers, trying ver");
            }
            Err(e) => debug!("CurrentVersion query failed ({}), trying ver", e),
        }

        let stdout = run_checked("cmd", &["/c", "ver"])?;
        parse_ver_output(&stdout).ok_or_else(|| OperationError::Probe {
            probe: "ver",
            reason: format!("unrecognised output {:?}", stdout.trim()),
        })
    }

    fn structured_release(&self) -> Result<String, OperationError> {
        let stdout = powershell(
            "Get-ComputerInfo -Property OsDisplayVersion | ConvertTo-Json -Compress",
        )?;
        debug!("Get-ComputerInfo returned {}", stdout.trim());
        parse_computer_info_json(&stdout).map_err(|reason| OperationError::Probe {
            probe: "Get-ComputerInfo",
            reason,
        })
    }

    fn system_report(&self) -> Result<String, OperationError> {
        run_checked("reg", &["query", CURRENT_VERSION_KEY])
    }
}

/// Read major/minor/build from a `reg query` dump of CurrentVersion:
///   "    CurrentMajorVersionNumber    REG_DWORD    0xa"
///   "    CurrentMinorVersionNumber    REG_DWORD    0x0"
///   "    CurrentBuildNumber    REG_SZ    19045"
pub fn parse_current_version_dump(output: &str) -> Option<OsVersion> {
    let number = |name: &str| -> Option<u32> {
        match parse_reg_query_value(output, name).ok()?? {
            PolicyValue::Dword(n) => Some(n),
            value => value.as_text()?.trim().parse().ok(),
        }
    };
    Some(OsVersion {
        major: number("CurrentMajorVersionNumber")?,
        minor: number("CurrentMinorVersionNumber")?,
        build: number("CurrentBuildNumber")?,
    })
}

/// Read major/minor/build from `ver` output. The word before the number is
/// localized ("Version", "version", "Versión"), so only the dotted number
/// is matched: "Microsoft Windows [Version 10.0.22631.4317]".
pub fn parse_ver_output(output: &str) -> Option<OsVersion> {
    static DOTTED: OnceLock<Regex> = OnceLock::new();
    let re = DOTTED.get_or_init(|| {
        Regex::new(r"(\d+)\.(\d+)\.(\d+)").expect("version pattern is valid")
    });

    let caps = re.captures(output)?;
    let part = |i: usize| caps[i].parse::<u32>().ok();
    Some(OsVersion {
        major: part(1)?,
        minor: part(2)?,
        build: part(3)?,
    })
}

/// Read OsDisplayVersion from `Get-ComputerInfo ... | ConvertTo-Json` output.
pub fn parse_computer_info_json(output: &str) -> Result<String, String> {
    let info: ComputerInfo =
        serde_json::from_str(output.trim()).map_err(|e| format!("bad JSON: {}", e))?;
    info.os_display_version
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| "OsDisplayVersion is empty".to_string())
}

// ============================================
// POLICY REFRESH
// ============================================

/// Runs `gpupdate /force`
#[derive(Debug, Default)]
pub struct GpUpdate;

impl PolicyRefresh for GpUpdate {
    fn refresh(&self) -> Result<String, OperationError> {
        run_checked("gpupdate", &["/force"])
            .map(|_| "gpupdate /force completed".to_string())
            .map_err(|e| OperationError::Refresh(e.to_string()))
    }
}

// ============================================
// TASK SCHEDULER
// ============================================

/// Scheduled tasks via schtasks (query) and PowerShell (register)
#[derive(Debug, Default)]
pub struct WindowsScheduler;

impl TaskScheduler for WindowsScheduler {
    fn find_task(&self, name: &str) -> Result<bool, OperationError> {
        let output = run("schtasks", &["/Query", "/TN", name])
            .map_err(|e| OperationError::schedule(name, e))?;
        Ok(output.status.success())
    }

    fn register_task(&mut self, spec: &TaskSpec) -> Result<(), OperationError> {
        powershell(&render_register_script(spec))
            .map(|_| ())
            .map_err(|e| OperationError::schedule(&spec.name, e))
    }
}

/// PowerShell that registers `spec` with the Task Scheduler.
pub fn render_register_script(spec: &TaskSpec) -> String {
    let program = spec.action.program.display().to_string();
    [
        format!(
            "$action = New-ScheduledTaskAction -Execute {} -Argument {}",
            ps_quote(&program),
            ps_quote(&spec.action.arguments)
        ),
        format!(
            "$trigger = New-ScheduledTaskTrigger -Daily -DaysInterval {} -At {}",
            spec.trigger.interval_days,
            ps_quote(&spec.trigger.start_time)
        ),
        format!(
            "$principal = New-ScheduledTaskPrincipal -UserId {} -LogonType ServiceAccount -RunLevel Highest",
            ps_quote(spec.principal.user_id())
        ),
        format!(
            "Register-ScheduledTask -TaskName {} -Description {} -Action $action -Trigger $trigger -Principal $principal -ErrorAction Stop | Out-Null",
            ps_quote(&spec.name),
            ps_quote(&spec.description)
        ),
    ]
    .join("\n")
}

// ============================================
// ELEVATION
// ============================================

/// True when running with administrator rights
#[cfg(windows)]
pub fn is_elevated() -> bool {
    // SAFETY: IsUserAnAdmin takes no arguments and only reads the process token
    unsafe { winapi::um::shlobj::IsUserAnAdmin() != 0 }
}

#[cfg(not(windows))]
pub fn is_elevated() -> bool {
    false
}

// ============================================
// TESTS
// ============================================
