/// Sandbox Backends - Isolated Execution of One Script
///
/// **Core Responsibility:**
/// Run a staged job in a single-use sandbox (container or pod), bounded by a
/// wall-clock timeout, and hand back a backend-agnostic [`ExecutionResult`].
///
/// **Boundary:**
/// - Backends know HOW to launch, wait, read logs and tear down
/// - Backends do NOT classify failures or persist anything
/// - [`run_in_sandbox`] owns the timeout and the cleanup guarantees
///
/// **Cleanup guarantee:**
/// Once launched, a sandbox is released on every path. The normal path
/// releases explicitly; if the driving future is dropped first, the
/// [`ReleaseGuard`] spawns the release instead.

pub mod docker;
pub mod kubernetes;
pub mod normalize;

use crate::runtime::RuntimeKind;
use crate::workspace::JobWorkspace;
use anyhow::Result;
use async_trait::async_trait;
use normalize::{normalize, RawOutcome, Termination};
use scriptbox_common::types::ExecutionResult;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Everything a backend needs to run one job.
#[derive(Debug, Clone)]
pub struct SandboxJob {
    pub job_id: Uuid,
    /// Directory name under the outputs root / shared volume.
    pub job_dir_name: String,
    pub script_path: PathBuf,
    pub request_path: PathBuf,
    pub input_dir: PathBuf,
    pub result_dir: PathBuf,
    /// Script and request content, for backends that cannot bind host files.
    pub code: String,
    pub request_json: String,
}

impl SandboxJob {
    pub fn new(job_id: Uuid, workspace: &JobWorkspace, code: String, request_json: String) -> Self {
        Self {
            job_id,
            job_dir_name: workspace.job_dir_name().to_string(),
            script_path: workspace.script_path(),
            request_path: workspace.request_path(),
            input_dir: workspace.input_dir().to_path_buf(),
            result_dir: workspace.result_dir().to_path_buf(),
            code,
            request_json,
        }
    }
}

/// Names of the resources a launched sandbox owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub name: String,
    /// Auxiliary object holding the script (Kubernetes ConfigMap).
    pub config_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i64),
    /// The sandbox disappeared before reporting an exit code.
    Vanished(String),
}

/// Output captured from a finished (or killed) sandbox. `stdout`/`stderr`
/// are `None` when the backend only exposes a combined stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedLogs {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub combined: String,
}

impl CapturedLogs {
    pub fn combined_only(text: String) -> Self {
        Self {
            stdout: None,
            stderr: None,
            combined: text,
        }
    }
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Create and start the sandbox. On error nothing is left behind.
    async fn launch(&self, job: &SandboxJob) -> Result<SandboxHandle>;

    /// Block until the sandbox finishes. The caller bounds this with a timeout.
    async fn wait(&self, handle: &SandboxHandle) -> Result<WaitOutcome>;

    /// Best effort; failures are reported inside the returned text.
    async fn fetch_logs(&self, handle: &SandboxHandle) -> CapturedLogs;

    /// Stop a running sandbox immediately. Best effort.
    async fn terminate(&self, handle: &SandboxHandle);

    /// Delete everything the sandbox owns. Best effort, idempotent.
    async fn release(&self, handle: &SandboxHandle);
}

/// Releases a sandbox from `Drop` unless disarmed.
struct ReleaseGuard {
    backend: Arc<dyn SandboxBackend>,
    handle: Option<SandboxHandle>,
}

impl ReleaseGuard {
    fn new(backend: Arc<dyn SandboxBackend>, handle: SandboxHandle) -> Self {
        Self {
            backend,
            handle: Some(handle),
        }
    }

    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let backend = Arc::clone(&self.backend);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    warn!(sandbox = %handle.name, "Job abandoned, releasing sandbox");
                    backend.release(&handle).await;
                });
            }
            Err(_) => warn!(sandbox = %handle.name, "No runtime to release abandoned sandbox"),
        }
    }
}

/// Execute `job` on `backend` within `timeout`.
///
/// Never fails: launch errors, timeouts and vanished sandboxes all become
/// data in the returned [`ExecutionResult`].
pub async fn run_in_sandbox(
    backend: Arc<dyn SandboxBackend>,
    job: &SandboxJob,
    timeout: Duration,
) -> ExecutionResult {
    let kind = backend.kind();

    let handle = match backend.launch(job).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(job_id = %job.job_id, runtime = %kind, error = %format!("{:#}", e), "Sandbox launch failed");
            return normalize(
                kind,
                RawOutcome {
                    termination: Termination::Errored(format!("{:#}", e)),
                    logs: CapturedLogs::default(),
                },
            );
        }
    };
    debug!(job_id = %job.job_id, sandbox = %handle.name, "Sandbox launched");

    // Armed immediately so a dropped future still reclaims the sandbox
    let mut guard = ReleaseGuard::new(Arc::clone(&backend), handle.clone());

    let (termination, logs) = match tokio::time::timeout(timeout, backend.wait(&handle)).await {
        Ok(waited) => {
            let termination = match waited {
                Ok(WaitOutcome::Exited(code)) => Termination::Exited(code),
                Ok(WaitOutcome::Vanished(message)) => Termination::Vanished(message),
                Err(e) => Termination::Errored(format!("{:#}", e)),
            };
            (termination, backend.fetch_logs(&handle).await)
        }
        Err(_) => {
            warn!(job_id = %job.job_id, sandbox = %handle.name, timeout_secs = timeout.as_secs(), "Execution timed out, terminating sandbox");
            // Terminating may delete the sandbox and its log, so read it first
            let logs = backend.fetch_logs(&handle).await;
            backend.terminate(&handle).await;
            (Termination::TimedOut(timeout_secs(timeout)), logs)
        }
    };

    backend.release(&handle).await;
    guard.disarm();

    normalize(kind, RawOutcome { termination, logs })
}

/// Whole seconds for user-facing messages; sub-second budgets round up.
fn timeout_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs();
    if timeout.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// `{prefix}-{job_id}` reduced to a DNS-1123 label (lowercase alphanumerics
/// and `-`, at most 63 chars, alphanumeric at both ends).
pub fn sandbox_name(prefix: &str, job_id: &str) -> String {
    let raw = format!("{}-{}", prefix, job_id).to_lowercase();
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    name.truncate(63);
    name.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptbox_common::types::{ExecutionStatus, NO_EXIT_CODE};
    use std::sync::Mutex;

    /// In-memory backend that plays back a scripted outcome and records calls.
    struct ScriptedBackend {
        launch_error: Option<String>,
        outcome: Option<WaitOutcome>,
        wait_for: Duration,
        logs: CapturedLogs,
        /// Log reads after `terminate` fail the way a deleted pod's do.
        logs_die_with_sandbox: bool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl ScriptedBackend {
        fn exiting(code: i64, stdout: &str, stderr: &str) -> Self {
            Self {
                launch_error: None,
                outcome: Some(WaitOutcome::Exited(code)),
                wait_for: Duration::ZERO,
                logs: CapturedLogs {
                    stdout: Some(stdout.to_string()),
                    stderr: Some(stderr.to_string()),
                    combined: format!("{}{}", stdout, stderr),
                },
                logs_die_with_sandbox: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl SandboxBackend for ScriptedBackend {
        fn kind(&self) -> RuntimeKind {
            RuntimeKind::Docker
        }

        async fn launch(&self, job: &SandboxJob) -> Result<SandboxHandle> {
            self.record("launch");
            if let Some(msg) = &self.launch_error {
                anyhow::bail!("{}", msg);
            }
            Ok(SandboxHandle {
                name: sandbox_name("runner", &job.job_id.to_string()),
                config_name: None,
            })
        }

        async fn wait(&self, _handle: &SandboxHandle) -> Result<WaitOutcome> {
            self.record("wait");
            tokio::time::sleep(self.wait_for).await;
            self.outcome
                .clone()
                .ok_or_else(|| anyhow::anyhow!("wait stream closed"))
        }

        async fn fetch_logs(&self, handle: &SandboxHandle) -> CapturedLogs {
            self.record("fetch_logs");
            if self.logs_die_with_sandbox && self.calls().contains(&"terminate") {
                return CapturedLogs::combined_only(format!(
                    "Error retrieving logs: pods \"{}\" not found",
                    handle.name
                ));
            }
            self.logs.clone()
        }

        async fn terminate(&self, _handle: &SandboxHandle) {
            self.record("terminate");
        }

        async fn release(&self, _handle: &SandboxHandle) {
            self.record("release");
        }
    }

    fn job() -> SandboxJob {
        SandboxJob {
            job_id: Uuid::new_v4(),
            job_dir_name: "job".to_string(),
            script_path: PathBuf::from("/tmp/job/code/main.py"),
            request_path: PathBuf::from("/tmp/job/code/request.json"),
            input_dir: PathBuf::from("/tmp/job/input"),
            result_dir: PathBuf::from("/tmp/job/result"),
            code: "print('hi')".to_string(),
            request_json: "{}".to_string(),
        }
    }

    #[tokio::test]
    async fn test_success_path_releases() {
        let backend = Arc::new(ScriptedBackend::exiting(0, "hello\n", ""));
        let result = run_in_sandbox(backend.clone(), &job(), Duration::from_secs(5)).await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(backend.calls(), vec!["launch", "wait", "fetch_logs", "release"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let backend = Arc::new(ScriptedBackend::exiting(1, "", "Traceback\nValueError: x\n"));
        let result = run_in_sandbox(backend, &job(), Duration::from_secs(5)).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("ValueError"));
    }

    #[tokio::test]
    async fn test_timeout_terminates_and_releases() {
        let mut scripted = ScriptedBackend::exiting(0, "partial\n", "");
        scripted.wait_for = Duration::from_secs(30);
        let backend = Arc::new(scripted);

        let result = run_in_sandbox(backend.clone(), &job(), Duration::from_millis(100)).await;

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.exit_code, NO_EXIT_CODE);
        assert!(result.stderr.contains("exceeded the 1 second timeout"));
        assert_eq!(result.stdout, "partial\n");
        assert_eq!(
            backend.calls(),
            vec!["launch", "wait", "fetch_logs", "terminate", "release"]
        );
    }

    #[tokio::test]
    async fn test_timeout_keeps_output_of_deleted_sandbox() {
        let mut scripted = ScriptedBackend::exiting(0, "", "");
        scripted.logs = CapturedLogs::combined_only("step 1 done\n".to_string());
        scripted.logs_die_with_sandbox = true;
        scripted.wait_for = Duration::from_secs(30);
        let backend = Arc::new(scripted);

        let result = run_in_sandbox(backend.clone(), &job(), Duration::from_millis(100)).await;

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.stdout, "step 1 done\n");
        assert!(result.logs.contains("step 1 done"));
        assert!(!result.logs.contains("not found"));
        assert!(backend.calls().contains(&"terminate"));
    }

    #[tokio::test]
    async fn test_launch_failure_is_data() {
        let mut scripted = ScriptedBackend::exiting(0, "", "");
        scripted.launch_error = Some("image not found".to_string());
        let backend = Arc::new(scripted);

        let result = run_in_sandbox(backend.clone(), &job(), Duration::from_secs(5)).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.exit_code, NO_EXIT_CODE);
        assert_eq!(result.stderr, "Docker execution error: image not found");
        assert_eq!(backend.calls(), vec!["launch"]);
    }

    #[tokio::test]
    async fn test_wait_error_still_releases() {
        let mut scripted = ScriptedBackend::exiting(0, "", "");
        scripted.outcome = None;
        let backend = Arc::new(scripted);

        let result = run_in_sandbox(backend.clone(), &job(), Duration::from_secs(5)).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.stderr.contains("wait stream closed"));
        assert!(backend.calls().contains(&"release"));
    }

    #[tokio::test]
    async fn test_dropped_future_releases_via_guard() {
        let mut scripted = ScriptedBackend::exiting(0, "", "");
        scripted.wait_for = Duration::from_secs(30);
        let backend = Arc::new(scripted);
        let sandbox_job = job();

        let fut = run_in_sandbox(backend.clone(), &sandbox_job, Duration::from_secs(60));
        // Abandon the job mid-wait
        let _ = tokio::time::timeout(Duration::from_millis(50), fut).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(backend.calls().contains(&"release"));
    }

    #[test]
    fn test_sandbox_name_is_dns_safe() {
        let id = "3F2A_B1.C9";
        assert_eq!(sandbox_name("runner", id), "runner-3f2a-b1-c9");

        let long = "x".repeat(100);
        let name = sandbox_name("job-code", &long);
        assert!(name.len() <= 63);
        assert!(name.starts_with("job-code-"));

        let uuid = Uuid::new_v4().to_string();
        assert_eq!(sandbox_name("runner", &uuid), format!("runner-{}", uuid));
    }
}
