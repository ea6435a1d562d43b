// Worker configuration: defaults <- optional JSON file <- environment
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/worker.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Explicit runtime override (`docker` or `kubernetes`).
    pub execution_runtime: Option<String>,
    /// Set from the environment only; its presence means we run inside a cluster.
    #[serde(skip)]
    pub kubernetes_service_host: Option<String>,

    pub runner_image: String,
    pub script_timeout_secs: u64,
    pub kubernetes_namespace: String,
    pub outputs_pvc: String,
    pub kubernetes_service_account: Option<String>,
    /// Pod entry point. Docker runs the image's own CMD.
    pub runner_command: Vec<String>,

    pub outputs_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub host_project_dir: Option<String>,
    pub container_project_dir: String,

    pub cleanup_interval_secs: u64,
    pub output_retention_minutes: u64,
    pub max_concurrent_jobs: usize,

    pub redis_url: String,
    pub metrics_addr: String,

    pub sandbox_memory_mb: u64,
    pub sandbox_cpu_limit: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            execution_runtime: None,
            kubernetes_service_host: None,
            runner_image: "py-exec:latest".to_string(),
            script_timeout_secs: 600,
            kubernetes_namespace: "scriptbox".to_string(),
            outputs_pvc: "scriptbox-outputs".to_string(),
            kubernetes_service_account: None,
            runner_command: vec![
                "python".to_string(),
                "-u".to_string(),
                "/work/job_runner.py".to_string(),
            ],
            outputs_dir: PathBuf::from("outputs"),
            logs_dir: PathBuf::from("logs"),
            host_project_dir: None,
            container_project_dir: "/app".to_string(),
            cleanup_interval_secs: 300,
            output_retention_minutes: 30,
            max_concurrent_jobs: 8,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            metrics_addr: "0.0.0.0:9100".to_string(),
            sandbox_memory_mb: 1024,
            sandbox_cpu_limit: 0.5,
        }
    }
}

impl WorkerConfig {
    /// Load from `SCRIPTBOX_CONFIG` (or `config/worker.json` when present),
    /// then apply process environment overrides.
    pub fn load_default() -> Result<Self> {
        let explicit = std::env::var("SCRIPTBOX_CONFIG").ok();
        let mut config = match &explicit {
            Some(path) => Self::from_file(Path::new(path))?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Worker config file not found: {}", path.display());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply overrides from a key lookup. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("EXECUTION_RUNTIME") {
            self.execution_runtime = Some(v);
        }
        self.kubernetes_service_host = get("KUBERNETES_SERVICE_HOST");

        if let Some(v) = get("RUNNER_IMAGE") {
            self.runner_image = v;
        }
        if let Some(v) = get("SCRIPT_TIMEOUT") {
            self.script_timeout_secs = parse_number("SCRIPT_TIMEOUT", &v)?;
        }
        if let Some(v) = get("KUBERNETES_NAMESPACE") {
            self.kubernetes_namespace = v;
        }
        if let Some(v) = get("OUTPUTS_PVC") {
            self.outputs_pvc = v;
        }
        if let Some(v) = get("KUBERNETES_SERVICE_ACCOUNT") {
            self.kubernetes_service_account = Some(v);
        }
        if let Some(v) = get("RUNNER_COMMAND") {
            self.runner_command = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = get("OUTPUTS_DIR") {
            self.outputs_dir = PathBuf::from(v);
        }
        if let Some(v) = get("LOGS_DIR") {
            self.logs_dir = PathBuf::from(v);
        }
        if let Some(v) = get("HOST_PROJECT_DIR") {
            self.host_project_dir = Some(v);
        }
        if let Some(v) = get("CONTAINER_PROJECT_DIR") {
            self.container_project_dir = v;
        }
        if let Some(v) = get("CLEANUP_INTERVAL_SECS") {
            self.cleanup_interval_secs = parse_number("CLEANUP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("OUTPUT_RETENTION_MINUTES") {
            self.output_retention_minutes = parse_number("OUTPUT_RETENTION_MINUTES", &v)?;
        }
        if let Some(v) = get("MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = parse_number("MAX_CONCURRENT_JOBS", &v)?;
        }
        if let Some(v) = get("REDIS_URL") {
            self.redis_url = v;
        }
        if let Some(v) = get("METRICS_ADDR") {
            self.metrics_addr = v;
        }
        if let Some(v) = get("SANDBOX_MEMORY_MB") {
            self.sandbox_memory_mb = parse_number("SANDBOX_MEMORY_MB", &v)?;
        }
        if let Some(v) = get("SANDBOX_CPU_LIMIT") {
            self.sandbox_cpu_limit = parse_number("SANDBOX_CPU_LIMIT", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.script_timeout_secs == 0 {
            bail!("SCRIPT_TIMEOUT must be greater than zero");
        }
        if self.max_concurrent_jobs == 0 {
            bail!("MAX_CONCURRENT_JOBS must be greater than zero");
        }
        if self.runner_command.is_empty() {
            bail!("RUNNER_COMMAND must not be empty");
        }
        if self.sandbox_cpu_limit <= 0.0 {
            bail!("SANDBOX_CPU_LIMIT must be positive");
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn output_retention(&self) -> Duration {
        Duration::from_secs(self.output_retention_minutes * 60)
    }

    pub fn memory_limit_bytes(&self) -> i64 {
        (self.sandbox_memory_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.sandbox_cpu_limit * 1_000_000_000.0) as i64
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", key, value, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.runner_image, "py-exec:latest");
        assert_eq!(config.script_timeout_secs, 600);
        assert_eq!(config.output_retention(), Duration::from_secs(30 * 60));
        assert_eq!(config.nano_cpus(), 500_000_000);
        assert_eq!(config.memory_limit_bytes(), 1024 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = WorkerConfig::default();
        config
            .apply_env(lookup(&[
                ("EXECUTION_RUNTIME", "kubernetes"),
                ("SCRIPT_TIMEOUT", "60"),
                ("RUNNER_COMMAND", "python /run.py"),
                ("KUBERNETES_SERVICE_HOST", ""),
                ("MAX_CONCURRENT_JOBS", "2"),
            ]))
            .unwrap();

        assert_eq!(config.execution_runtime.as_deref(), Some("kubernetes"));
        assert_eq!(config.script_timeout_secs, 60);
        assert_eq!(config.runner_command, vec!["python", "/run.py"]);
        assert!(config.kubernetes_service_host.is_none(), "empty values are ignored");
        assert_eq!(config.max_concurrent_jobs, 2);
    }

    #[test]
    fn test_bad_number_is_an_error() {
        let mut config = WorkerConfig::default();
        let err = config
            .apply_env(lookup(&[("SCRIPT_TIMEOUT", "ten")]))
            .unwrap_err();
        assert!(err.to_string().contains("SCRIPT_TIMEOUT"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("worker.json");
        fs::write(&path, r#"{"runner_image": "custom:1", "output_retention_minutes": 5}"#).unwrap();

        let config = WorkerConfig::from_file(&path).unwrap();
        assert_eq!(config.runner_image, "custom:1");
        assert_eq!(config.output_retention_minutes, 5);
        assert_eq!(config.script_timeout_secs, 600);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = WorkerConfig {
            script_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
