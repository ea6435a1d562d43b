// Raw backend outcome -> ExecutionResult
use super::CapturedLogs;
use crate::runtime::RuntimeKind;
use scriptbox_common::types::ExecutionResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Exited(i64),
    /// Timed out after this many seconds; the sandbox has been terminated.
    TimedOut(u64),
    Vanished(String),
    /// Infrastructure error while launching or waiting.
    Errored(String),
}

#[derive(Debug, Clone)]
pub struct RawOutcome {
    pub termination: Termination,
    pub logs: CapturedLogs,
}

pub fn normalize(kind: RuntimeKind, raw: RawOutcome) -> ExecutionResult {
    let CapturedLogs {
        stdout,
        stderr,
        combined,
    } = raw.logs;
    match raw.termination {
        Termination::Exited(code) => {
            let mut stderr = stderr.unwrap_or_default();
            let mut logs = combined;
            if let Some(note) = signal_note(code) {
                stderr.push_str(note);
                logs.push_str(note);
            }
            ExecutionResult::exited(code, stdout.unwrap_or_default(), stderr, logs)
        }
        // A combined-only log is the only partial output there is
        Termination::TimedOut(secs) => {
            let partial = stdout.unwrap_or_else(|| combined.clone());
            ExecutionResult::timed_out(secs, partial, &combined)
        }
        Termination::Vanished(message) => with_partial_logs(ExecutionResult::failed(message), &combined),
        Termination::Errored(message) => with_partial_logs(
            ExecutionResult::failed(format!("{} execution error: {}", kind.label(), message)),
            &combined,
        ),
    }
}

fn with_partial_logs(mut result: ExecutionResult, combined: &str) -> ExecutionResult {
    if !combined.trim().is_empty() {
        result.logs = format!("{}\n{}", combined.trim_end(), result.logs);
    }
    result
}

/// Annotations for exit codes that mean the kernel killed the process.
fn signal_note(code: i64) -> Option<&'static str> {
    match code {
        137 => Some("\n[Sandbox killed: likely out of memory]"),
        139 => Some("\n[Sandbox killed: segmentation fault]"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptbox_common::types::{ExecutionStatus, NO_EXIT_CODE};

    fn split_logs(stdout: &str, stderr: &str) -> CapturedLogs {
        CapturedLogs {
            stdout: Some(stdout.to_string()),
            stderr: Some(stderr.to_string()),
            combined: format!("{}{}", stdout, stderr),
        }
    }

    #[test]
    fn test_exit_zero_is_success() {
        let result = normalize(
            RuntimeKind::Docker,
            RawOutcome {
                termination: Termination::Exited(0),
                logs: split_logs("ok\n", ""),
            },
        );
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.logs, "ok\n");
    }

    #[test]
    fn test_combined_only_synthesizes_empty_streams() {
        let result = normalize(
            RuntimeKind::Kubernetes,
            RawOutcome {
                termination: Termination::Exited(1),
                logs: CapturedLogs::combined_only("Traceback\nKeyError: 0\n".to_string()),
            },
        );
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.stdout, "");
        assert_eq!(result.stderr, "");
        assert_eq!(result.error_text(), "Traceback\nKeyError: 0\n");
    }

    #[test]
    fn test_timeout_keeps_partial_output() {
        let result = normalize(
            RuntimeKind::Docker,
            RawOutcome {
                termination: Termination::TimedOut(60),
                logs: split_logs("step 1\n", ""),
            },
        );
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.exit_code, NO_EXIT_CODE);
        assert_eq!(result.stdout, "step 1\n");
        assert!(result.logs.starts_with("step 1\n"));
        assert!(result.stderr.contains("exceeded the 60 second timeout"));
    }

    #[test]
    fn test_timeout_with_combined_log_keeps_it_as_output() {
        let result = normalize(
            RuntimeKind::Kubernetes,
            RawOutcome {
                termination: Termination::TimedOut(5),
                logs: CapturedLogs::combined_only("step 1 done\n".to_string()),
            },
        );
        assert_eq!(result.stdout, "step 1 done\n");
        assert!(result.logs.starts_with("step 1 done\n"));
    }

    #[test]
    fn test_vanished_and_errored() {
        let vanished = normalize(
            RuntimeKind::Kubernetes,
            RawOutcome {
                termination: Termination::Vanished("Pod not found".to_string()),
                logs: CapturedLogs::default(),
            },
        );
        assert_eq!(vanished.status, ExecutionStatus::Failed);
        assert_eq!(vanished.exit_code, NO_EXIT_CODE);
        assert_eq!(vanished.stderr, "Pod not found");

        let errored = normalize(
            RuntimeKind::Kubernetes,
            RawOutcome {
                termination: Termination::Errored("forbidden".to_string()),
                logs: CapturedLogs::default(),
            },
        );
        assert_eq!(errored.stderr, "Kubernetes execution error: forbidden");
    }

    #[test]
    fn test_oom_exit_is_annotated() {
        let result = normalize(
            RuntimeKind::Docker,
            RawOutcome {
                termination: Termination::Exited(137),
                logs: split_logs("", ""),
            },
        );
        assert_eq!(result.exit_code, 137);
        assert!(result.stderr.contains("out of memory"));
    }
}
