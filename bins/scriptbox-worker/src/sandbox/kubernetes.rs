/// Kubernetes backend: one ConfigMap plus one Pod per job.
///
/// The script and request travel as ConfigMap content (mounted read-only at
/// `/code`), while inputs and results live on a shared PVC mounted at
/// `/outputs`, so the worker and the pod see the same job directory.
///
/// Both objects are deleted after every run, whatever the outcome.

use super::{sandbox_name, CapturedLogs, SandboxBackend, SandboxHandle, SandboxJob, WaitOutcome};
use crate::config::WorkerConfig;
use crate::runtime::RuntimeKind;
use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, DeleteParams, LogParams, PostParams};
use kube::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

pub const POD_PREFIX: &str = "runner";
pub const CONFIG_MAP_PREFIX: &str = "job-code";
pub const CONTAINER_NAME: &str = "runner";
pub const APP_LABEL: &str = "scriptbox-runner";
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Pod settings that do not vary per job.
#[derive(Debug, Clone, PartialEq)]
pub struct PodTemplate {
    pub image: String,
    pub command: Vec<String>,
    pub outputs_pvc: String,
    pub service_account: Option<String>,
}

impl PodTemplate {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            image: config.runner_image.clone(),
            command: config.runner_command.clone(),
            outputs_pvc: config.outputs_pvc.clone(),
            service_account: config.kubernetes_service_account.clone(),
        }
    }
}

pub fn config_map_manifest(name: &str, job: &SandboxJob) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": name,
            "labels": { "app": APP_LABEL, "job-id": job.job_id.to_string() }
        },
        "data": {
            "main.py": job.code,
            "request.json": job.request_json
        }
    })
}

pub fn pod_manifest(
    name: &str,
    config_map: &str,
    job: &SandboxJob,
    template: &PodTemplate,
) -> serde_json::Value {
    let work_dir = format!("/outputs/{}", job.job_dir_name);
    let mut spec = json!({
        "restartPolicy": "Never",
        "containers": [{
            "name": CONTAINER_NAME,
            "image": template.image,
            "command": template.command,
            "workingDir": work_dir,
            "env": [
                { "name": "JOB_ID", "value": job.job_id.to_string() },
                { "name": "MPLCONFIGDIR", "value": format!("{}/result/.toolconfig", work_dir) }
            ],
            "volumeMounts": [
                { "name": "code", "mountPath": "/code", "readOnly": true },
                { "name": "outputs", "mountPath": "/outputs" }
            ],
            "resources": {
                "requests": { "memory": "256Mi", "cpu": "100m" },
                "limits": { "memory": "1Gi", "cpu": "500m" }
            }
        }],
        "volumes": [
            {
                "name": "code",
                "configMap": {
                    "name": config_map,
                    "items": [
                        { "key": "main.py", "path": "main.py" },
                        { "key": "request.json", "path": "request.json" }
                    ]
                }
            },
            {
                "name": "outputs",
                "persistentVolumeClaim": { "claimName": template.outputs_pvc }
            }
        ]
    });
    if let Some(account) = &template.service_account {
        spec["serviceAccountName"] = json!(account);
    }

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "labels": { "app": APP_LABEL, "job-id": job.job_id.to_string() }
        },
        "spec": spec
    })
}

/// Exit code for a pod in phase `Failed`. Never 0: a failed pod whose
/// container reports 0 (or nothing) counts as 1.
pub fn failed_exit_code(pod: &Pod) -> i64 {
    let code = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        .and_then(|cs| cs.state.as_ref())
        .and_then(|state| state.terminated.as_ref())
        .map(|t| t.exit_code as i64)
        .unwrap_or(1);
    if code == 0 {
        1
    } else {
        code
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Terminal outcome for a pod's phase; `None` while it is still running.
pub fn pod_outcome(pod: &Pod) -> Option<WaitOutcome> {
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Succeeded") => Some(WaitOutcome::Exited(0)),
        Some("Failed") => Some(WaitOutcome::Exited(failed_exit_code(pod))),
        _ => None,
    }
}

/// One status poll. A pod deleted from under the worker is an outcome, not
/// an error.
fn poll_outcome(name: &str, read: kube::Result<Pod>) -> Result<Option<WaitOutcome>> {
    match read {
        Ok(pod) => Ok(pod_outcome(&pod)),
        Err(e) if is_not_found(&e) => Ok(Some(WaitOutcome::Vanished(format!("Pod not found: {}", name)))),
        Err(e) => Err(e).context("Failed to read Pod status"),
    }
}

fn captured_logs(name: &str, read: kube::Result<String>) -> CapturedLogs {
    match read {
        Ok(text) => CapturedLogs::combined_only(text),
        Err(e) => {
            warn!(pod = %name, error = %e, "Failed to read pod logs");
            CapturedLogs::combined_only(format!("Error retrieving logs: {}", e))
        }
    }
}

pub struct KubernetesBackend {
    pods: Api<Pod>,
    config_maps: Api<ConfigMap>,
    template: PodTemplate,
}

impl KubernetesBackend {
    /// Build a client from in-cluster config or kubeconfig.
    pub async fn connect(config: &WorkerConfig) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to initialize Kubernetes client")?;
        let namespace = config.kubernetes_namespace.as_str();
        Ok(Self {
            pods: Api::namespaced(client.clone(), namespace),
            config_maps: Api::namespaced(client, namespace),
            template: PodTemplate::from_config(config),
        })
    }

    async fn delete_config_map(&self, name: &str) {
        match self.config_maps.delete(name, &DeleteParams::default()).await {
            Ok(_) => debug!(config_map = %name, "ConfigMap deleted"),
            Err(e) if is_not_found(&e) => {}
            Err(e) => warn!(config_map = %name, error = %e, "Failed to delete ConfigMap"),
        }
    }
}

#[async_trait]
impl SandboxBackend for KubernetesBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Kubernetes
    }

    async fn launch(&self, job: &SandboxJob) -> Result<SandboxHandle> {
        let job_id = job.job_id.to_string();
        let config_map_name = sandbox_name(CONFIG_MAP_PREFIX, &job_id);
        let pod_name = sandbox_name(POD_PREFIX, &job_id);

        let config_map: ConfigMap = serde_json::from_value(config_map_manifest(&config_map_name, job))
            .context("Invalid ConfigMap manifest")?;
        self.config_maps
            .create(&PostParams::default(), &config_map)
            .await
            .context("Failed to create ConfigMap")?;

        let pod: Pod = match serde_json::from_value(pod_manifest(
            &pod_name,
            &config_map_name,
            job,
            &self.template,
        )) {
            Ok(pod) => pod,
            Err(e) => {
                self.delete_config_map(&config_map_name).await;
                return Err(e).context("Invalid Pod manifest");
            }
        };
        if let Err(e) = self.pods.create(&PostParams::default(), &pod).await {
            self.delete_config_map(&config_map_name).await;
            return Err(e).context("Failed to create Pod");
        }

        Ok(SandboxHandle {
            name: pod_name,
            config_name: Some(config_map_name),
        })
    }

    async fn wait(&self, handle: &SandboxHandle) -> Result<WaitOutcome> {
        loop {
            if let Some(outcome) = poll_outcome(&handle.name, self.pods.get(&handle.name).await)? {
                return Ok(outcome);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn fetch_logs(&self, handle: &SandboxHandle) -> CapturedLogs {
        let params = LogParams {
            container: Some(CONTAINER_NAME.to_string()),
            ..Default::default()
        };
        captured_logs(&handle.name, self.pods.logs(&handle.name, &params).await)
    }

    async fn terminate(&self, handle: &SandboxHandle) {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match self.pods.delete(&handle.name, &params).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => warn!(pod = %handle.name, error = %e, "Failed to delete timed-out Pod"),
        }
    }

    async fn release(&self, handle: &SandboxHandle) {
        match self.pods.delete(&handle.name, &DeleteParams::default()).await {
            Ok(_) => debug!(pod = %handle.name, "Pod deleted"),
            Err(e) if is_not_found(&e) => {}
            Err(e) => warn!(pod = %handle.name, error = %e, "Failed to delete Pod"),
        }
        if let Some(config_map) = &handle.config_name {
            self.delete_config_map(config_map).await;
        }
    }
}
