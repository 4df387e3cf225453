// ============================================
// wupolicy - cli.rs
// ============================================
// Command-line flags. Running with no flags is the normal interactive use;
// the scheduled task adds --scheduled.
// ============================================

use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::policy::RunMode;

#[derive(Parser, Debug)]
#[command(
    name = "wupolicy",
    version,
    about = "Pin Windows Update to the installed feature release and defer quality updates"
)]
pub struct Cli {
    /// Unattended run from the scheduled task: exit without changes when the
    /// policy already matches this system
    #[arg(long, alias = "Scheduled")]
    pub scheduled: bool,

    /// Config file (default: wupolicy.toml next to the EXE, if present)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print the result as JSON instead of a summary
    #[arg(long)]
    pub json: bool,

    /// Only detect and print the Windows version, change nothing
    #[arg(long)]
    pub detect_only: bool,

    /// More log output (-v debug, -vv trace). RUST_LOG overrides this.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn run_mode(&self) -> RunMode {
        if self.scheduled {
            RunMode::Scheduled
        } else {
            RunMode::Interactive
        }
    }
}
