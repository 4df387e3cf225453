// ============================================
// wupolicy - task.rs
// ============================================
// Makes sure the policy keeps getting re-applied without anyone logging in.
//
// Three separate steps:
// 1. ensure_artifact_at    - copy the running EXE to the install folder
//                            (always, so the installed copy stays current)
// 2. ensure_config_at      - write the settings in effect next to the copy,
//                            so the scheduled run uses the same task name,
//                            install folder and fallback release
// 3. ensure_scheduled_entry - register the scheduled task, but only if no
//                            task with that name exists yet
//
// An existing task is never modified. If the install path or the schedule
// changes in a later version, the old task keeps its old settings.
// ============================================

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::{Config, TaskConfig, CONFIG_FILE_NAME};
use crate::error::OperationError;
use crate::report::StepResult;

/// File name of the installed copy inside the install folder
pub const INSTALLED_EXE_NAME: &str = "wupolicy.exe";

/// Argument the scheduled task passes to select unattended mode
pub const SCHEDULED_FLAG: &str = "--scheduled";

// ============================================
// TASK DEFINITION
// ============================================

/// Account the task runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Principal {
    /// LocalSystem with highest run level
    System,
}

impl Principal {
    pub fn user_id(&self) -> &'static str {
        match self {
            Principal::System => "SYSTEM",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAction {
    pub program: PathBuf,
    pub arguments: String,
}

/// Fires every `interval_days` days at `start_time` (HH:MM)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTrigger {
    pub interval_days: u32,
    pub start_time: String,
}

/// Everything needed to register the scheduled task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: String,
    pub action: TaskAction,
    pub trigger: TaskTrigger,
    pub principal: Principal,
    pub description: String,
}

impl TaskSpec {
    /// Task that runs the installed copy at `artifact` in scheduled mode.
    pub fn for_artifact(config: &TaskConfig, artifact: &Path) -> Self {
        TaskSpec {
            name: config.name.clone(),
            action: TaskAction {
                program: artifact.to_path_buf(),
                arguments: SCHEDULED_FLAG.to_string(),
            },
            trigger: TaskTrigger {
                interval_days: config.interval_days,
                start_time: config.start_time.clone(),
            },
            principal: Principal::System,
            description: config.description.clone(),
        }
    }
}

/// The host's task scheduler
pub trait TaskScheduler {
    fn find_task(&self, name: &str) -> Result<bool, OperationError>;

    fn register_task(&mut self, spec: &TaskSpec) -> Result<(), OperationError>;
}

// ============================================
// STEPS
// ============================================

/// Full path of the installed copy
pub fn artifact_path(config: &TaskConfig) -> PathBuf {
    config.install_dir.join(INSTALLED_EXE_NAME)
}

/// Copy `source` to `dest`, creating the parent folder and overwriting any
/// previous copy.
///
/// When `source` already is `dest` (the scheduled task running the installed
/// copy) nothing is copied.
pub fn ensure_artifact_at(source: &Path, dest: &Path) -> Result<String, OperationError> {
    let copy_error = |reason: String| OperationError::Copy {
        path: dest.display().to_string(),
        reason,
    };

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| copy_error(format!("cannot create {}: {}", parent.display(), e)))?;
    }

    if is_same_file(source, dest) {
        debug!("{} is the running executable, not copying", dest.display());
        return Ok(format!("{} is already the running copy", dest.display()));
    }

    let bytes = fs::copy(source, dest).map_err(|e| copy_error(e.to_string()))?;
    Ok(format!("copied {} bytes to {}", bytes, dest.display()))
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Write `config` as TOML to `dest`, replacing any previous file.
pub fn ensure_config_at(config: &Config, dest: &Path) -> Result<String, OperationError> {
    let copy_error = |reason: String| OperationError::Copy {
        path: dest.display().to_string(),
        reason,
    };

    let content = toml::to_string_pretty(config).map_err(|e| copy_error(e.to_string()))?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| copy_error(format!("cannot create {}: {}", parent.display(), e)))?;
    }
    fs::write(dest, content).map_err(|e| copy_error(e.to_string()))?;
    Ok(format!("wrote settings to {}", dest.display()))
}

/// Register `spec` unless a task with the same name already exists.
pub fn ensure_scheduled_entry(
    scheduler: &mut dyn TaskScheduler,
    spec: &TaskSpec,
) -> Result<String, OperationError> {
    if scheduler.find_task(&spec.name)? {
        return Ok(format!("task '{}' already registered, left unchanged", spec.name));
    }

    scheduler.register_task(spec)?;
    Ok(format!(
        "registered task '{}' (every {} days at {} as {})",
        spec.name,
        spec.trigger.interval_days,
        spec.trigger.start_time,
        spec.principal.user_id()
    ))
}

/// Install the running executable, its settings and its scheduled task.
///
/// `running_exe` is `None` when the executable path can't be resolved; the
/// copy is then reported as failed. No step prevents the others.
pub fn install(
    scheduler: &mut dyn TaskScheduler,
    running_exe: Option<&Path>,
    config: &Config,
) -> Vec<StepResult> {
    let artifact = artifact_path(&config.task);
    info!("Installing scheduled re-run from {}", artifact.display());

    let copied = match running_exe {
        Some(exe) => StepResult::from_outcome("copy", ensure_artifact_at(exe, &artifact)),
        None => StepResult::failed(
            "copy",
            &OperationError::Copy {
                path: artifact.display().to_string(),
                reason: "cannot locate the running executable".to_string(),
            },
        ),
    };

    let settings = StepResult::from_outcome(
        "config",
        ensure_config_at(config, &config.task.install_dir.join(CONFIG_FILE_NAME)),
    );

    let spec = TaskSpec::for_artifact(&config.task, &artifact);
    let scheduled = StepResult::from_outcome("schedule", ensure_scheduled_entry(scheduler, &spec));

    vec![copied, settings, scheduled]
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{DetectionConfig, RunConfig};
    use crate::report::ErrorPolicy;
    use std::collections::HashMap;

    #[derive(Default)]
    pub(crate) struct FakeScheduler {
        pub tasks: HashMap<String, TaskSpec>,
        pub registrations: usize,
        pub fail_register: bool,
    }

    impl TaskScheduler for FakeScheduler {
        fn find_task(&self, name: &str) -> Result<bool, OperationError> {
            Ok(self.tasks.contains_key(name))
        }

        fn register_task(&mut self, spec: &TaskSpec) -> Result<(), OperationError> {
            if self.fail_register {
                return Err(OperationError::schedule(&spec.name, "access denied"));
            }
            self.registrations += 1;
            self.tasks.insert(spec.name.clone(), spec.clone());
            Ok(())
        }
    }

    fn config_in(dir: &Path) -> Config {
        Config {
            task: TaskConfig {
                install_dir: dir.join("WUPolicy"),
                ..TaskConfig::default()
            },
            ..Config::default()
        }
    }

    fn fake_exe(dir: &Path, contents: &str) -> PathBuf {
        let path = dir.join("source.exe");
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_install_twice_registers_once() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let mut scheduler = FakeScheduler::default();

        let exe = fake_exe(tmp.path(), "v1");
        let first = install(&mut scheduler, Some(&exe), &config);
        assert!(first.iter().all(|s| s.success), "{:?}", first);

        // A newer build run interactively still refreshes the installed copy
        let exe = fake_exe(tmp.path(), "v2");
        let second = install(&mut scheduler, Some(&exe), &config);
        assert!(second.iter().all(|s| s.success), "{:?}", second);
        assert!(second[2].message.contains("left unchanged"));

        assert_eq!(scheduler.registrations, 1);
        assert_eq!(scheduler.tasks.len(), 1);
        assert_eq!(fs::read_to_string(artifact_path(&config.task)).unwrap(), "v2");
    }

    #[test]
    fn test_installed_copy_inherits_custom_settings() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            detection: DetectionConfig {
                fallback_release: "23H2".to_string(),
            },
            task: TaskConfig {
                name: "PinRelease".to_string(),
                install_dir: tmp.path().join("Custom Dir"),
                start_time: "22:15".to_string(),
                ..TaskConfig::default()
            },
            run: RunConfig {
                on_error: ErrorPolicy::Escalate,
            },
        };
        let mut scheduler = FakeScheduler::default();

        let steps = install(&mut scheduler, Some(&fake_exe(tmp.path(), "x")), &config);
        assert!(steps.iter().all(|s| s.success), "{:?}", steps);

        // What the installed copy finds next to itself on its scheduled run
        let written = config.task.install_dir.join(CONFIG_FILE_NAME);
        let loaded = Config::load(Some(&written)).unwrap();
        assert_eq!(loaded, config);

        let installed_exe = artifact_path(&loaded.task);
        let rerun = install(&mut scheduler, Some(&installed_exe), &loaded);
        assert!(rerun.iter().all(|s| s.success), "{:?}", rerun);
        assert_eq!(scheduler.registrations, 1);
        assert_eq!(scheduler.tasks.keys().collect::<Vec<_>>(), vec!["PinRelease"]);
    }

    #[test]
    fn test_registered_task_runs_installed_copy_unattended() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let mut scheduler = FakeScheduler::default();

        install(&mut scheduler, Some(&fake_exe(tmp.path(), "x")), &config);

        let spec = &scheduler.tasks[&config.task.name];
        assert_eq!(spec.action.program, artifact_path(&config.task));
        assert_eq!(spec.action.arguments, "--scheduled");
        assert_eq!(spec.trigger.interval_days, 365);
        assert_eq!(spec.principal, Principal::System);
    }

    #[test]
    fn test_copy_failure_still_attempts_registration() {
        let tmp = tempfile::tempdir().unwrap();
        // install_dir sits below a regular file, so it can't be created
        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, "").unwrap();
        let config = Config {
            task: TaskConfig {
                install_dir: blocker.join("WUPolicy"),
                ..TaskConfig::default()
            },
            ..Config::default()
        };
        let mut scheduler = FakeScheduler::default();

        let steps = install(&mut scheduler, Some(&fake_exe(tmp.path(), "x")), &config);

        assert!(!steps[0].success);
        assert!(!steps[1].success);
        assert!(steps[2].success);
        assert_eq!(scheduler.registrations, 1);
    }

    #[test]
    fn test_unknown_running_exe_still_registers() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let mut scheduler = FakeScheduler::default();

        let steps = install(&mut scheduler, None, &config);

        assert_eq!(steps[0].step, "copy");
        assert!(!steps[0].success);
        assert!(steps[2].success);
        assert_eq!(scheduler.registrations, 1);
    }

    #[test]
    fn test_registration_failure_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let mut scheduler = FakeScheduler {
            fail_register: true,
            ..FakeScheduler::default()
        };

        let steps = install(&mut scheduler, Some(&fake_exe(tmp.path(), "x")), &config);

        assert!(steps[0].success);
        assert!(!steps[2].success);
        assert!(steps[2].message.contains("access denied"));
    }

    #[test]
    fn test_running_installed_copy_skips_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("wupolicy.exe");
        fs::write(&dest, "installed").unwrap();

        let message = ensure_artifact_at(&dest, &dest).unwrap();

        assert!(message.contains("already the running copy"));
        assert_eq!(fs::read_to_string(&dest).unwrap(), "installed");
    }
}
