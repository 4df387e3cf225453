// ============================================
// wupolicy - main.rs
// ============================================
// Entry point.
//
// The program flow is:
// 1. Parse flags, set up logging, load the optional config file
// 2. Detect the Windows product line and feature release
// 3. Write the Windows Update policy values (or, when run by the scheduled
//    task, stop here if they already match)
// 4. Copy this EXE and its settings to the install folder and make sure
//    the yearly scheduled task exists
// 5. Print a summary (or JSON) and exit
//
// A scheduled run that finds the policy already in place prints nothing.
//
// No step is fatal. Failures are logged and collected in the report; the
// exit status only reflects them when the config says on_error = "escalate".
// ============================================

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod error;
mod host;
mod policy;
mod report;
mod task;
mod version;

use cli::Cli;
use config::Config;
use policy::{PolicyRefresh, PolicyStore, RunMode};
use report::BatchReport;
use task::TaskScheduler;
use version::VersionInfo;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    if show_banner(&cli) {
        println!("============================================");
        println!("wupolicy v{}", env!("CARGO_PKG_VERSION"));
        println!("============================================");
    }

    let config = Config::load(cli.config.as_deref())?;

    // ============================================
    // DETECT
    // ============================================
    let detected = version::detect(&host::WindowsProbe, &config.detection.fallback_release);

    if cli.detect_only {
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&detected)?);
        } else {
            println!(
                "{} {}",
                detected.major_product.display_name(),
                detected.release_label
            );
        }
        return Ok(());
    }

    // ============================================
    // RECONCILE POLICY
    // ============================================
    if !host::is_elevated() {
        warn!("Not running as administrator, policy writes will probably fail");
    }

    let running_exe = current_exe();
    let report = reconcile_and_install(
        &mut host::RegistryStore,
        &host::GpUpdate,
        &mut host::WindowsScheduler,
        &detected,
        cli.run_mode(),
        &config,
        running_exe.as_deref(),
    );

    print_report(&report, cli.json)?;

    if report.should_fail(config.run.on_error) {
        bail!("{} step(s) failed", report.failures().count());
    }
    Ok(())
}

/// Console logging. -v raises the level, RUST_LOG wins over both.
///
/// With --json the log goes to stderr so stdout stays parseable.
fn init_logging(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level(cli.verbose, cli.scheduled)));

    let writer = if cli.json {
        BoxMakeWriter::new(std::io::stderr)
    } else {
        BoxMakeWriter::new(std::io::stdout)
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .init();
}

/// Scheduled runs only log problems unless -v is given
fn log_level(verbose: u8, scheduled: bool) -> &'static str {
    match (verbose, scheduled) {
        (0, true) => "warn",
        (0, false) => "info",
        (1, _) => "debug",
        _ => "trace",
    }
}

fn show_banner(cli: &Cli) -> bool {
    !cli.json && !cli.scheduled
}

fn current_exe() -> Option<PathBuf> {
    match std::env::current_exe() {
        Ok(exe) => Some(exe),
        Err(e) => {
            warn!("Cannot locate the running executable: {}", e);
            None
        }
    }
}

/// Write the policy, then install the scheduled re-run unless the gate found
/// nothing to do.
fn reconcile_and_install(
    store: &mut dyn PolicyStore,
    refresher: &dyn PolicyRefresh,
    scheduler: &mut dyn TaskScheduler,
    detected: &VersionInfo,
    mode: RunMode,
    config: &Config,
    running_exe: Option<&Path>,
) -> BatchReport {
    let mut report = policy::reconcile(store, refresher, detected, mode);

    if !report.already_reconciled {
        report.extend(task::install(scheduler, running_exe, config));
    }
    report
}

fn print_report(report: &BatchReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    if report.already_reconciled {
        debug!("{}", report.summary());
        return Ok(());
    }

    info!("{}", report.summary());
    for failed in report.failures() {
        println!("  FAILED {}: {}", failed.step, failed.message);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::tests::{CountingRefresh, MemoryStore};
    use crate::policy::{PolicyValue, KEY_PRODUCT_VERSION, KEY_TARGET_RELEASE_INFO};
    use crate::task::tests::FakeScheduler;
    use crate::version::MajorProduct;

    fn win10_22h2() -> VersionInfo {
        VersionInfo {
            major_product: MajorProduct::Windows10,
            release_label: "22H2".to_string(),
        }
    }

    fn config_in(dir: &Path) -> Config {
        let mut config = Config::default();
        config.task.install_dir = dir.join("WUPolicy");
        config
    }

    #[test]
    fn test_log_level_from_verbosity() {
        assert_eq!(log_level(0, false), "info");
        assert_eq!(log_level(1, false), "debug");
        assert_eq!(log_level(2, false), "trace");
        assert_eq!(log_level(9, false), "trace");
        assert_eq!(log_level(0, true), "warn");
        assert_eq!(log_level(1, true), "debug");
    }

    #[test]
    fn test_banner_only_for_interactive_text_output() {
        assert!(show_banner(&Cli::parse_from(["wupolicy"])));
        assert!(!show_banner(&Cli::parse_from(["wupolicy", "--json"])));
        assert!(!show_banner(&Cli::parse_from(["wupolicy", "--scheduled"])));
    }

    #[test]
    fn test_reconciled_scheduled_run_touches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let exe = tmp.path().join("source.exe");
        std::fs::write(&exe, "x").unwrap();

        let mut store = MemoryStore::with_values(&[
            (KEY_PRODUCT_VERSION, PolicyValue::String("Windows 10".into())),
            (KEY_TARGET_RELEASE_INFO, PolicyValue::String("22H2".into())),
        ]);
        let refresh = CountingRefresh::default();
        let mut scheduler = FakeScheduler::default();

        let report = reconcile_and_install(
            &mut store,
            &refresh,
            &mut scheduler,
            &win10_22h2(),
            RunMode::Scheduled,
            &config,
            Some(&exe),
        );

        assert!(report.already_reconciled);
        assert!(report.steps.is_empty());
        assert_eq!(store.writes, 0);
        assert_eq!(refresh.calls.get(), 0);
        assert_eq!(scheduler.registrations, 0);
        assert!(!config.task.install_dir.exists());
    }

    #[test]
    fn test_interactive_run_writes_and_installs() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_in(tmp.path());
        let exe = tmp.path().join("source.exe");
        std::fs::write(&exe, "x").unwrap();

        let mut store = MemoryStore::default();
        let refresh = CountingRefresh::default();
        let mut scheduler = FakeScheduler::default();

        let report = reconcile_and_install(
            &mut store,
            &refresh,
            &mut scheduler,
            &win10_22h2(),
            RunMode::Interactive,
            &config,
            Some(&exe),
        );

        assert!(!report.has_failures(), "{:?}", report.steps);
        assert_eq!(store.writes, 5);
        assert_eq!(scheduler.registrations, 1);
        assert!(task::artifact_path(&config.task).exists());
        assert!(config.task.install_dir.join(crate::config::CONFIG_FILE_NAME).exists());
    }
}
