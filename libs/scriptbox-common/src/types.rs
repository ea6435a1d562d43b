use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Exit code reported when no sandboxed process produced one.
pub const NO_EXIT_CODE: i64 = -1;

/// One request to execute a user script, as pushed onto the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: Uuid,
    pub code: String,
    /// Host path of an image to copy into the job's input directory.
    #[serde(default)]
    pub input_image: Option<PathBuf>,
    /// Wall-clock budget in seconds; the worker default applies when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Handed to the script verbatim as `request.json`.
    #[serde(default)]
    pub request_context: serde_json::Value,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub previous_attempt_id: Option<String>,
    #[serde(default)]
    pub user_prompt: Option<String>,
    #[serde(default)]
    pub ai_model: Option<String>,
}

impl JobRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            input_image: None,
            timeout_secs: None,
            request_context: serde_json::Value::Object(Default::default()),
            session_id: None,
            previous_attempt_id: None,
            user_prompt: None,
            ai_model: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Timeout,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        };
        write!(f, "{}", s)
    }
}

/// Backend-agnostic outcome of one sandboxed run.
///
/// `status == Success` holds exactly when `exit_code == 0`, and a timeout
/// always carries `exit_code == -1`. Use the constructors to keep it that way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exit_code: i64,
    pub logs: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ExecutionResult {
    /// Result of a process that ran to completion.
    pub fn exited(exit_code: i64, stdout: String, stderr: String, logs: String) -> Self {
        let status = if exit_code == 0 {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };
        Self {
            status,
            exit_code,
            logs,
            stdout,
            stderr,
        }
    }

    /// Failure where no exit code exists (launch error, vanished sandbox, host error).
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            status: ExecutionStatus::Failed,
            exit_code: NO_EXIT_CODE,
            logs: message.clone(),
            stdout: String::new(),
            stderr: message,
        }
    }

    pub fn timed_out(timeout_secs: u64, partial_stdout: String, partial_logs: &str) -> Self {
        let message = timeout_message(timeout_secs);
        let logs = if partial_logs.trim().is_empty() {
            message.clone()
        } else {
            format!("{}\n{}", partial_logs.trim_end(), message)
        };
        Self {
            status: ExecutionStatus::Timeout,
            exit_code: NO_EXIT_CODE,
            logs,
            stdout: partial_stdout,
            stderr: message,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Best error text for classification: stderr, or combined logs when the
    /// backend could not separate streams.
    pub fn error_text(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.logs
        } else {
            &self.stderr
        }
    }
}

pub fn timeout_message(timeout_secs: u64) -> String {
    format!(
        "Script execution exceeded the {} second timeout limit",
        timeout_secs
    )
}

/// What the worker stores for the caller once a job is finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub runtime: String,
    pub result: ExecutionResult,
    pub log_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub error_category: Option<String>,
    #[serde(default)]
    pub output_files: Vec<String>,
    pub execution_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_decides_status() {
        let ok = ExecutionResult::exited(0, "hi".into(), String::new(), "hi".into());
        assert_eq!(ok.status, ExecutionStatus::Success);

        let bad = ExecutionResult::exited(2, String::new(), "boom".into(), "boom".into());
        assert_eq!(bad.status, ExecutionStatus::Failed);
        assert_eq!(bad.exit_code, 2);
    }

    #[test]
    fn test_timeout_carries_sentinel_and_message() {
        let result = ExecutionResult::timed_out(2, "partial".into(), "partial\n");
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.exit_code, NO_EXIT_CODE);
        assert!(result.stderr.contains("exceeded the 2 second timeout"));
        assert!(result.logs.starts_with("partial\n"));
        assert!(result.logs.ends_with("timeout limit"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ExecutionStatus::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
    }

    #[test]
    fn test_job_request_defaults() {
        let id = Uuid::new_v4();
        let raw = format!(r#"{{"id":"{}","code":"print(1)"}}"#, id);
        let job: JobRequest = serde_json::from_str(&raw).unwrap();
        assert_eq!(job.id, id);
        assert!(job.timeout_secs.is_none());
        assert!(job.input_image.is_none());
        assert!(job.request_context.is_null());
    }

    #[test]
    fn test_error_text_falls_back_to_logs() {
        let result = ExecutionResult::exited(1, String::new(), String::new(), "Traceback".into());
        assert_eq!(result.error_text(), "Traceback");
    }
}
