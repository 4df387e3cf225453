// ============================================
// wupolicy - error.rs
// ============================================
// Every step of a run (probe, key write, refresh, copy, task registration)
// returns a Result with this error type. The caller turns each one into a
// StepResult line in the batch report and moves on to the next step.
// ============================================

use thiserror::Error;

/// Failure of a single sub-step.
#[derive(Debug, Error)]
pub enum OperationError {
    /// A version probe could not produce a usable answer
    #[error("probe '{probe}' failed: {reason}")]
    Probe { probe: &'static str, reason: String },

    /// Reading or writing one policy value failed
    #[error("policy store error on '{key}': {reason}")]
    Store { key: String, reason: String },

    /// gpupdate (or whatever refresh mechanism) did not succeed
    #[error("policy refresh failed: {0}")]
    Refresh(String),

    /// Copying the executable to the install location failed
    #[error("copy to {path} failed: {reason}")]
    Copy { path: String, reason: String },

    /// Querying or registering the scheduled task failed
    #[error("scheduler error for task '{task}': {reason}")]
    Schedule { task: String, reason: String },

    /// An external command ran but reported failure
    #[error("'{command}' exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    /// An external command could not be started at all
    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl OperationError {
    pub fn store(key: impl Into<String>, reason: impl ToString) -> Self {
        OperationError::Store {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn schedule(task: impl Into<String>, reason: impl ToString) -> Self {
        OperationError::Schedule {
            task: task.into(),
            reason: reason.to_string(),
        }
    }
}
