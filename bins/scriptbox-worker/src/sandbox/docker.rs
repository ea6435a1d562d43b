/// Docker backend: one single-use container per job.
///
/// **Mounts:**
/// - `code/main.py` -> `/code/main.py` (ro)
/// - `code/request.json` -> `/code/request.json` (ro)
/// - `input/` -> `/input` (ro)
/// - `result/` -> `/output` (rw)
///
/// **Isolation:**
/// Network disabled, memory and CPU capped from config. The image's own
/// entry point runs the script.

use super::{sandbox_name, CapturedLogs, SandboxBackend, SandboxHandle, SandboxJob, WaitOutcome};
use crate::config::WorkerConfig;
use crate::runtime::RuntimeKind;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::path::Path;
use tracing::{debug, info, warn};

pub const CONTAINER_PREFIX: &str = "runner";

/// Rewrites bind sources when the worker itself runs in a container whose
/// project directory is a bind mount of `host_root` on the Docker host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    container_root: String,
    host_root: Option<String>,
}

impl PathMapping {
    pub fn new(container_root: impl Into<String>, host_root: Option<String>) -> Self {
        Self {
            container_root: container_root.into(),
            host_root,
        }
    }

    /// Only active when a host root is configured and we can see the
    /// container-side root, i.e. we really are inside the container.
    pub fn from_config(config: &WorkerConfig) -> Self {
        let host_root = config
            .host_project_dir
            .clone()
            .filter(|_| Path::new(&config.container_project_dir).exists());
        Self::new(config.container_project_dir.clone(), host_root)
    }

    pub fn bind_source(&self, path: &Path) -> String {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        };
        translate_host_path(
            &absolute.to_string_lossy(),
            &self.container_root,
            self.host_root.as_deref(),
        )
    }
}

pub fn translate_host_path(path: &str, container_root: &str, host_root: Option<&str>) -> String {
    let Some(host_root) = host_root else {
        return path.to_string();
    };
    let root = container_root.trim_end_matches('/');
    let translated = match path.strip_prefix(root) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            format!("{}{}", host_root.trim_end_matches(['/', '\\']), rest)
        }
        _ => path.to_string(),
    };
    translated.replace('\\', "/")
}

pub struct DockerBackend {
    docker: Docker,
    image: String,
    memory_bytes: i64,
    nano_cpus: i64,
    paths: PathMapping,
}

impl DockerBackend {
    /// Connect to the local daemon and make sure it answers.
    pub async fn connect(config: &WorkerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;
        docker
            .ping()
            .await
            .context("Docker daemon did not respond to ping")?;

        Ok(Self {
            docker,
            image: config.runner_image.clone(),
            memory_bytes: config.memory_limit_bytes(),
            nano_cpus: config.nano_cpus(),
            paths: PathMapping::from_config(config),
        })
    }

    /// Pull the runner image if it is not cached locally.
    async fn ensure_image(&self) -> Result<()> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            debug!(image = %self.image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %self.image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.with_context(|| format!("Failed to pull image {}", self.image))?;
        }
        info!(image = %self.image, "Image pulled");
        Ok(())
    }

    fn container_config(&self, job: &SandboxJob) -> Config<String> {
        let binds = vec![
            format!("{}:/code/main.py:ro", self.paths.bind_source(&job.script_path)),
            format!("{}:/code/request.json:ro", self.paths.bind_source(&job.request_path)),
            format!("{}:/input:ro", self.paths.bind_source(&job.input_dir)),
            format!("{}:/output", self.paths.bind_source(&job.result_dir)),
        ];

        Config {
            image: Some(self.image.clone()),
            env: Some(vec![
                format!("JOB_ID={}", job.job_id),
                "MPLCONFIGDIR=/output/.toolconfig".to_string(),
            ]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                binds: Some(binds),
                memory: Some(self.memory_bytes),
                nano_cpus: Some(self.nano_cpus),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn remove(&self, name: &str) -> std::result::Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(name, Some(options)).await
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    async fn launch(&self, job: &SandboxJob) -> Result<SandboxHandle> {
        self.ensure_image().await?;

        let name = sandbox_name(CONTAINER_PREFIX, &job.job_id.to_string());
        // A previous worker may have died mid-job with the same id
        if self.remove(&name).await.is_ok() {
            warn!(container = %name, "Removed leftover container");
        }

        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        self.docker
            .create_container(Some(options), self.container_config(job))
            .await
            .context("Failed to create container")?;

        if let Err(e) = self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(cleanup) = self.remove(&name).await {
                warn!(container = %name, error = %cleanup, "Failed to remove container after start failure");
            }
            return Err(anyhow!(e).context("Failed to start container"));
        }

        Ok(SandboxHandle {
            name,
            config_name: None,
        })
    }

    async fn wait(&self, handle: &SandboxHandle) -> Result<WaitOutcome> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&handle.name, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(WaitOutcome::Exited(response.status_code)),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => {
                Ok(WaitOutcome::Exited(code))
            }
            Some(Err(DockerError::DockerResponseServerError {
                status_code: 404,
                message,
            })) => Ok(WaitOutcome::Vanished(format!("Container not found: {}", message))),
            Some(Err(e)) => Err(anyhow!(e).context("Failed to wait for container")),
            None => Err(anyhow!("No wait response from container")),
        }
    }

    async fn fetch_logs(&self, handle: &SandboxHandle) -> CapturedLogs {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        });

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut stream = self.docker.logs(&handle.name, options);
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(container = %handle.name, error = %e, "Error reading container logs");
                    stderr.push_str(&format!("\nError retrieving logs: {}", e));
                    break;
                }
            }
        }

        CapturedLogs {
            combined: format!("{}{}", stdout, stderr),
            stdout: Some(stdout),
            stderr: Some(stderr),
        }
    }

    async fn terminate(&self, handle: &SandboxHandle) {
        if let Err(e) = self
            .docker
            .kill_container(&handle.name, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container = %handle.name, error = %e, "Failed to kill timed-out container");
        }
    }

    async fn release(&self, handle: &SandboxHandle) {
        match self.remove(&handle.name).await {
            Ok(()) => debug!(container = %handle.name, "Container removed"),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => warn!(container = %handle.name, error = %e, "Failed to remove container"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_host_root_keeps_path() {
        assert_eq!(
            translate_host_path("/app/outputs/1/result", "/app", None),
            "/app/outputs/1/result"
        );
    }

    #[test]
    fn test_container_root_rewritten() {
        assert_eq!(
            translate_host_path("/app/outputs/1/result", "/app", Some("/home/me/project")),
            "/home/me/project/outputs/1/result"
        );
        assert_eq!(
            translate_host_path("/app", "/app/", Some("/srv/p/")),
            "/srv/p"
        );
    }

    #[test]
    fn test_only_prefix_component_matches() {
        assert_eq!(
            translate_host_path("/application/x", "/app", Some("/srv")),
            "/application/x"
        );
    }

    #[test]
    fn test_windows_host_root_uses_forward_slashes() {
        assert_eq!(
            translate_host_path("/app/outputs/1/input", "/app", Some("C:\\Users\\me\\proj")),
            "C:/Users/me/proj/outputs/1/input"
        );
    }

    #[test]
    fn test_mapping_inactive_without_container_root() {
        let mapping = PathMapping::new("/definitely/not/here", None);
        assert_eq!(mapping.bind_source(Path::new("/tmp/x")), "/tmp/x");

        let config = WorkerConfig {
            host_project_dir: Some("/srv".to_string()),
            container_project_dir: "/definitely/not/here".to_string(),
            ..Default::default()
        };
        assert_eq!(PathMapping::from_config(&config).host_root, None);
    }

    #[test]
    fn test_relative_bind_source_is_absolute() {
        let mapping = PathMapping::new("/app", None);
        let source = mapping.bind_source(Path::new("outputs/1/result"));
        assert!(Path::new(&source).is_absolute());
        assert!(source.ends_with("outputs/1/result"));
    }
}
