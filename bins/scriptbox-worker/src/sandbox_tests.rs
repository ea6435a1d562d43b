/// Integration tests against a real Docker daemon
///
/// These tests verify the full job path on the Docker backend:
/// 1. A clean script succeeds and its outputs are listed
/// 2. A missing import fails and is classified
/// 3. A runaway script is killed at the timeout and its container removed
/// 4. Concurrent jobs stay isolated
///
/// The runner image must execute `/code/main.py` as its default command.
/// Override it with `SCRIPTBOX_TEST_IMAGE`.

#[cfg(test)]
mod docker_tests {
    use crate::config::WorkerConfig;
    use crate::pipeline::{process_job, JobContext};
    use crate::runtime::Runtime;
    use crate::sandbox::docker::{DockerBackend, CONTAINER_PREFIX};
    use crate::sandbox::sandbox_name;
    use crate::workspace::WorkspaceManager;
    use scriptbox_common::execution_log::ExecutionLogStore;
    use scriptbox_common::types::{ExecutionStatus, JobRequest, JobResponse};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn docker_context(root: &TempDir) -> Arc<JobContext> {
        let config = WorkerConfig {
            runner_image: std::env::var("SCRIPTBOX_TEST_IMAGE")
                .unwrap_or_else(|_| "py-exec:latest".to_string()),
            outputs_dir: root.path().join("outputs"),
            logs_dir: root.path().join("logs"),
            ..Default::default()
        };
        let backend = DockerBackend::connect(&config)
            .await
            .expect("Docker daemon must be reachable");

        let workspaces = WorkspaceManager::new(&config.outputs_dir);
        workspaces.ensure_root().expect("Failed to create outputs root");

        Arc::new(JobContext {
            runtime: Runtime::with_backend(Arc::new(backend)),
            workspaces,
            logs: Arc::new(ExecutionLogStore::open(&config.logs_dir).expect("Failed to open logs")),
            default_timeout: Duration::from_secs(60),
        })
    }

    async fn run(ctx: &Arc<JobContext>, code: &str, timeout_secs: Option<u64>) -> JobResponse {
        let mut job = JobRequest::new(code);
        job.timeout_secs = timeout_secs;
        process_job(Arc::clone(ctx), job).await
    }

    /// Test: script writes a file and prints
    #[tokio::test]
    #[ignore] // Requires Docker and the runner image
    async fn test_docker_success_with_output() {
        let root = TempDir::new().unwrap();
        let ctx = docker_context(&root).await;

        let response = run(
            &ctx,
            r#"
with open('/output/result.txt', 'w') as f:
    f.write('done')
print('hello from sandbox')
"#,
            None,
        )
        .await;

        assert_eq!(response.result.status, ExecutionStatus::Success, "{:?}", response.result);
        assert_eq!(response.result.exit_code, 0);
        assert!(response.result.stdout.contains("hello from sandbox"));
        assert_eq!(response.output_files, vec!["result.txt".to_string()]);
        assert!(response.log_id.is_some());
    }

    /// Test: missing module becomes an import_error failure
    #[tokio::test]
    #[ignore] // Requires Docker and the runner image
    async fn test_docker_import_error() {
        let root = TempDir::new().unwrap();
        let ctx = docker_context(&root).await;

        let response = run(&ctx, "import definitely_not_a_module\n", None).await;

        assert_eq!(response.result.status, ExecutionStatus::Failed);
        assert_ne!(response.result.exit_code, 0);
        assert!(response.result.error_text().contains("ModuleNotFoundError"));
        assert_eq!(response.error_category.as_deref(), Some("import_error"));
    }

    /// Test: infinite loop is killed and reported as a timeout
    #[tokio::test]
    #[ignore] // Requires Docker and the runner image
    async fn test_docker_timeout() {
        let root = TempDir::new().unwrap();
        let ctx = docker_context(&root).await;

        let mut job = JobRequest::new("print('start', flush=True)\nwhile True:\n    pass\n");
        job.timeout_secs = Some(2);
        let container = sandbox_name(CONTAINER_PREFIX, &job.id.to_string());

        let started = std::time::Instant::now();
        let response = process_job(Arc::clone(&ctx), job).await;

        assert_eq!(response.result.status, ExecutionStatus::Timeout);
        assert_eq!(response.result.exit_code, -1);
        assert!(response.result.stderr.contains("2 second timeout"));
        assert!(started.elapsed() < Duration::from_secs(30), "timeout must not hang");
        assert_eq!(response.error_category.as_deref(), Some("timeout"));
        assert!(response.result.stdout.contains("start"), "partial output kept");

        let docker = bollard::Docker::connect_with_local_defaults().unwrap();
        match docker.inspect_container(&container, None).await {
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {}
            other => panic!("container {} still present: {:?}", container, other),
        }
    }

    /// Test: concurrent jobs each see only their own workspace
    #[tokio::test]
    #[ignore] // Requires Docker and the runner image
    async fn test_docker_concurrent_jobs_isolated() {
        let root = TempDir::new().unwrap();
        let ctx = docker_context(&root).await;

        let mut handles = Vec::new();
        for n in 0..3 {
            let ctx = Arc::clone(&ctx);
            handles.push(tokio::spawn(async move {
                let code = format!(
                    "import os\nopen('/output/job_{n}.txt', 'w').write('{n}')\nprint(sorted(os.listdir('/output')))\n"
                );
                run(&ctx, &code, None).await
            }));
        }

        for (n, handle) in handles.into_iter().enumerate() {
            let response = handle.await.unwrap();
            assert_eq!(response.result.status, ExecutionStatus::Success, "{:?}", response.result);
            assert_eq!(response.output_files, vec![format!("job_{}.txt", n)]);
        }
    }
}
