// Runtime selection: which sandbox backend this process uses, decided once
use crate::config::WorkerConfig;
use crate::sandbox::docker::DockerBackend;
use crate::sandbox::kubernetes::KubernetesBackend;
use crate::sandbox::SandboxBackend;
use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    Docker,
    Kubernetes,
}

impl RuntimeKind {
    /// Explicit override first, then in-cluster detection, then Docker.
    pub fn detect(explicit: Option<&str>, service_host: Option<&str>) -> Self {
        match explicit.map(|v| v.trim().to_lowercase()).as_deref() {
            Some("docker") => return RuntimeKind::Docker,
            Some("kubernetes") => return RuntimeKind::Kubernetes,
            Some(other) => warn!(value = %other, "Ignoring unknown EXECUTION_RUNTIME"),
            None => {}
        }

        if service_host.map(|h| !h.trim().is_empty()).unwrap_or(false) {
            return RuntimeKind::Kubernetes;
        }
        RuntimeKind::Docker
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Kubernetes => "kubernetes",
        }
    }

    /// Human label used in error messages.
    pub fn label(&self) -> &'static str {
        match self {
            RuntimeKind::Docker => "Docker",
            RuntimeKind::Kubernetes => "Kubernetes",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The backend chosen at startup. Immutable for the life of the process.
#[derive(Clone)]
pub struct Runtime {
    kind: RuntimeKind,
    backend: Arc<dyn SandboxBackend>,
}

impl Runtime {
    /// Pick and connect the backend. A Kubernetes client that cannot be built
    /// degrades to Docker permanently; Docker being unreachable is fatal.
    pub async fn initialize(config: &WorkerConfig) -> Result<Self> {
        let requested = RuntimeKind::detect(
            config.execution_runtime.as_deref(),
            config.kubernetes_service_host.as_deref(),
        );
        info!(runtime = %requested, "Detected execution runtime");

        if requested == RuntimeKind::Kubernetes {
            match KubernetesBackend::connect(config).await {
                Ok(backend) => {
                    info!(namespace = %config.kubernetes_namespace, "Kubernetes runtime initialized");
                    return Ok(Self::with_backend(Arc::new(backend)));
                }
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Kubernetes client unavailable, falling back to Docker");
                }
            }
        }

        let backend = DockerBackend::connect(config)
            .await
            .context("Docker runtime is not available")?;
        info!(image = %config.runner_image, "Docker runtime initialized");
        Ok(Self::with_backend(Arc::new(backend)))
    }

    pub fn with_backend(backend: Arc<dyn SandboxBackend>) -> Self {
        Self {
            kind: backend.kind(),
            backend,
        }
    }

    pub fn kind(&self) -> RuntimeKind {
        self.kind
    }

    pub fn backend(&self) -> Arc<dyn SandboxBackend> {
        Arc::clone(&self.backend)
    }
}
