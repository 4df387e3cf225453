// ============================================
// wupolicy - report.rs
// ============================================
// Results of the individual steps of a run.
//
// Nothing in a run is fatal: every step records a StepResult and the run
// carries on. At the end main() looks at the BatchReport and the configured
// ErrorPolicy to decide the exit status.
// ============================================

use serde::Serialize;
use tracing::{info, warn};

use crate::error::OperationError;

/// Result of one step (one key write, the refresh, the copy, ...)
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StepResult {
    /// Short identifier, e.g. "set:ProductVersion" or "schedule"
    pub step: String,
    pub success: bool,
    pub message: String,
}

impl StepResult {
    pub fn ok(step: impl Into<String>, message: impl Into<String>) -> Self {
        let result = StepResult {
            step: step.into(),
            success: true,
            message: message.into(),
        };
        info!("  [ok] {}: {}", result.step, result.message);
        result
    }

    pub fn failed(step: impl Into<String>, error: &OperationError) -> Self {
        let result = StepResult {
            step: step.into(),
            success: false,
            message: error.to_string(),
        };
        warn!("  [failed] {}: {}", result.step, result.message);
        result
    }

    /// Record the outcome of a fallible step, whichever way it went.
    pub fn from_outcome(
        step: impl Into<String>,
        outcome: Result<String, OperationError>,
    ) -> Self {
        match outcome {
            Ok(message) => StepResult::ok(step, message),
            Err(e) => StepResult::failed(step, &e),
        }
    }
}

/// What to do once every step has run and some of them failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Log and exit successfully anyway
    #[default]
    Continue,
    /// Still run everything, but exit with a failure status
    Escalate,
}

/// All step results of one invocation, in execution order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    /// True when the scheduled-mode gate found nothing to do
    pub already_reconciled: bool,
    pub steps: Vec<StepResult>,
}

impl BatchReport {
    pub fn extend(&mut self, steps: impl IntoIterator<Item = StepResult>) {
        self.steps.extend(steps);
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| !s.success)
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    /// Whether the process should report failure under the given policy.
    pub fn should_fail(&self, policy: ErrorPolicy) -> bool {
        policy == ErrorPolicy::Escalate && self.has_failures()
    }

    /// One-line human summary, e.g. "7 of 8 steps succeeded".
    pub fn summary(&self) -> String {
        if self.already_reconciled {
            return "Policy already matches this system, nothing to do".to_string();
        }
        let succeeded = self.steps.iter().filter(|s| s.success).count();
        format!("{} of {} steps succeeded", succeeded, self.steps.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing() -> StepResult {
        StepResult::failed("refresh", &OperationError::Refresh("no gpupdate".into()))
    }

    #[test]
    fn test_summary_counts_successes() {
        let mut report = BatchReport::default();
        report.extend([StepResult::ok("set:A", "written"), failing()]);
        assert_eq!(report.summary(), "1 of 2 steps succeeded");
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn test_error_policy_decides_exit() {
        let mut report = BatchReport::default();
        report.extend([failing()]);
        assert!(!report.should_fail(ErrorPolicy::Continue));
        assert!(report.should_fail(ErrorPolicy::Escalate));

        let clean = BatchReport::default();
        assert!(!clean.should_fail(ErrorPolicy::Escalate));
    }

    #[test]
    fn test_already_reconciled_summary() {
        let report = BatchReport {
            already_reconciled: true,
            steps: Vec::new(),
        };
        assert!(report.summary().contains("nothing to do"));
    }

    #[test]
    fn test_report_serializes_to_json() {
        let mut report = BatchReport::default();
        report.extend([StepResult::ok("refresh", "gpupdate completed")]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["steps"][0]["step"], "refresh");
        assert_eq!(json["already_reconciled"], false);
    }
}
