//! Persistent record of every sandboxed execution attempt.
//!
//! **Layout (under the logs root):**
//! - `failures/YYYY-MM-DD/{log_id}.json`
//! - `successes/YYYY-MM-DD/{log_id}.json`
//! - `sessions/{session_id}.json`
//! - `resolutions/{failure_log_id}.json`
//! - `analysis/latest_analysis.json` (written by the analyzer)
//!
//! **Immutability:**
//! Log records are written once. The only after-the-fact fact about a
//! failure, "a later success fixed it", lives in `resolutions/` and is
//! created at most once per failure. It is written before the fixing
//! success becomes visible, so no reader ever sees the success without the
//! link.

use crate::classify::{self, ErrorCategory};
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Failed,
    Success,
}

/// One immutable attempt record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub log_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Local>,
    pub status: AttemptStatus,

    pub code: String,
    pub code_hash: String,

    #[serde(default)]
    pub user_prompt: Option<String>,
    #[serde(default)]
    pub ai_model: Option<String>,
    #[serde(default)]
    pub image_filename: Option<String>,

    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error_category: Option<ErrorCategory>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub return_code: Option<i64>,

    #[serde(default)]
    pub output_files: Option<Vec<String>>,
    #[serde(default)]
    pub execution_time_seconds: Option<f64>,

    #[serde(default)]
    pub previous_attempt_id: Option<String>,
    /// Materialized from `resolutions/` on read; never written by `log_*`.
    #[serde(default)]
    pub fixed_by: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

/// Append-only "this failure was fixed by that success" fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub failure_log_id: String,
    pub fixed_by: String,
    pub resolved_at: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAttempt {
    pub log_id: String,
    pub timestamp: DateTime<Local>,
    pub status: AttemptStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
    pub attempts: Vec<SessionAttempt>,
    pub status: SessionStatus,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Local>>,
}

/// Input for [`ExecutionLogStore::log_failure`].
#[derive(Debug, Clone, Default)]
pub struct FailureRecord {
    pub code: String,
    pub error_message: String,
    pub stderr: String,
    pub return_code: i64,
    pub session_id: Option<String>,
    pub previous_attempt_id: Option<String>,
    /// Overrides classification when the caller already knows the bucket.
    pub error_category: Option<ErrorCategory>,
    pub stdout: Option<String>,
    pub user_prompt: Option<String>,
    pub ai_model: Option<String>,
    pub image_filename: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Input for [`ExecutionLogStore::log_success`].
#[derive(Debug, Clone, Default)]
pub struct SuccessRecord {
    pub code: String,
    pub output_files: Vec<String>,
    pub session_id: Option<String>,
    pub previous_attempt_id: Option<String>,
    pub stdout: Option<String>,
    pub execution_time_seconds: Option<f64>,
    pub user_prompt: Option<String>,
    pub ai_model: Option<String>,
    pub image_filename: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Ids assigned to a newly logged attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedAttempt {
    pub log_id: String,
    pub session_id: String,
}

pub struct ExecutionLogStore {
    root: PathBuf,
    failures_dir: PathBuf,
    successes_dir: PathBuf,
    sessions_dir: PathBuf,
    resolutions_dir: PathBuf,
    analysis_dir: PathBuf,
    /// Serializes session read-modify-write and resolution creation.
    write_lock: Mutex<()>,
}

impl ExecutionLogStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let store = Self {
            failures_dir: root.join("failures"),
            successes_dir: root.join("successes"),
            sessions_dir: root.join("sessions"),
            resolutions_dir: root.join("resolutions"),
            analysis_dir: root.join("analysis"),
            root,
            write_lock: Mutex::new(()),
        };
        store.ensure_layout()?;
        Ok(store)
    }

    fn ensure_layout(&self) -> Result<()> {
        for dir in [
            &self.failures_dir,
            &self.successes_dir,
            &self.sessions_dir,
            &self.resolutions_dir,
            &self.analysis_dir,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn analysis_dir(&self) -> &Path {
        &self.analysis_dir
    }

    pub fn log_failure(&self, record: FailureRecord) -> Result<LoggedAttempt> {
        let log_id = Uuid::new_v4().to_string();
        let session_id = self.resolve_session(&log_id, &record.session_id, &record.previous_attempt_id);

        let error_category = record
            .error_category
            .unwrap_or_else(|| classify::classify_error(&record.error_message, &record.stderr));
        let tags = record.tags.unwrap_or_else(|| {
            classify::extract_tags(&record.code, &record.error_message, &record.stderr)
        });

        let entry = ExecutionLog {
            log_id: log_id.clone(),
            session_id: session_id.clone(),
            timestamp: Local::now(),
            status: AttemptStatus::Failed,
            code_hash: classify::code_hash(&record.code),
            code: record.code,
            user_prompt: record.user_prompt,
            ai_model: record.ai_model,
            image_filename: record.image_filename,
            error_type: classify::extract_error_type(&record.stderr),
            error_message: Some(record.error_message),
            error_category: Some(error_category),
            stderr: Some(record.stderr),
            stdout: record.stdout,
            return_code: Some(record.return_code),
            output_files: None,
            execution_time_seconds: None,
            previous_attempt_id: record.previous_attempt_id,
            fixed_by: None,
            tags,
        };

        let path = self.dated_dir(&self.failures_dir, &entry.timestamp)?.join(format!("{}.json", log_id));
        write_json_atomic(&path, &entry)?;
        self.append_to_session(&session_id, &log_id, AttemptStatus::Failed)?;

        debug!(log_id = %log_id, session_id = %session_id, category = %error_category, "Logged failed execution");
        Ok(LoggedAttempt { log_id, session_id })
    }

    pub fn log_success(&self, record: SuccessRecord) -> Result<LoggedAttempt> {
        let log_id = Uuid::new_v4().to_string();
        let session_id = self.resolve_session(&log_id, &record.session_id, &record.previous_attempt_id);
        let tags = record
            .tags
            .unwrap_or_else(|| classify::extract_tags(&record.code, "", ""));

        // Link first: the success must never be visible without it.
        let mut linked = None;
        if let Some(failure_id) = &record.previous_attempt_id {
            linked = self.resolve_failure(failure_id, &log_id)?;
        }

        let entry = ExecutionLog {
            log_id: log_id.clone(),
            session_id: session_id.clone(),
            timestamp: Local::now(),
            status: AttemptStatus::Success,
            code_hash: classify::code_hash(&record.code),
            code: record.code,
            user_prompt: record.user_prompt,
            ai_model: record.ai_model,
            image_filename: record.image_filename,
            error_message: None,
            error_type: None,
            error_category: None,
            stderr: None,
            stdout: record.stdout,
            return_code: Some(0),
            output_files: Some(record.output_files),
            execution_time_seconds: record.execution_time_seconds,
            previous_attempt_id: record.previous_attempt_id,
            fixed_by: None,
            tags,
        };

        let written = self
            .dated_dir(&self.successes_dir, &entry.timestamp)
            .and_then(|dir| write_json_atomic(&dir.join(format!("{}.json", log_id)), &entry));
        if let Err(e) = written {
            // Roll back the link so the failure is not reported as fixed by a ghost
            if let Some(resolution_path) = linked {
                if let Err(rollback) = fs::remove_file(&resolution_path) {
                    warn!(
                        path = %resolution_path.display(),
                        error = %rollback,
                        "Failed to roll back resolution of unwritten success"
                    );
                }
            }
            return Err(e);
        }
        self.append_to_session(&session_id, &log_id, AttemptStatus::Success)?;

        debug!(log_id = %log_id, session_id = %session_id, "Logged successful execution");
        Ok(LoggedAttempt { log_id, session_id })
    }

    /// Session for a new attempt: explicit id, else the previous attempt's
    /// session, else a fresh session named after the new log.
    fn resolve_session(
        &self,
        log_id: &str,
        session_id: &Option<String>,
        previous_attempt_id: &Option<String>,
    ) -> String {
        if let Some(id) = session_id.as_ref().filter(|s| !s.is_empty()) {
            if is_safe_id(id) {
                return id.clone();
            }
            warn!(session_id = %id, "Ignoring session id with unsafe characters");
        }
        if let Some(previous) = previous_attempt_id {
            match self.get_log(previous) {
                Ok(Some(log)) => return log.session_id,
                Ok(None) => warn!(previous_attempt_id = %previous, "Previous attempt not found, starting new session"),
                Err(e) => warn!(previous_attempt_id = %previous, error = %e, "Failed to read previous attempt"),
            }
        }
        log_id.to_string()
    }

    /// Record that `failure_id` was fixed by `success_id`. Returns the path of
    /// the resolution written, or `None` when there was nothing to link.
    fn resolve_failure(&self, failure_id: &str, success_id: &str) -> Result<Option<PathBuf>> {
        if self.find_log_path(&self.failures_dir, failure_id)?.is_none() {
            debug!(failure_log_id = %failure_id, "Previous attempt is not a failure, nothing to resolve");
            return Ok(None);
        }

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.resolutions_dir.join(format!("{}.json", failure_id));
        let resolution = Resolution {
            failure_log_id: failure_id.to_string(),
            fixed_by: success_id.to_string(),
            resolved_at: Local::now(),
        };

        match write_json_create_new(&path, &resolution) {
            Ok(true) => Ok(Some(path)),
            Ok(false) => {
                warn!(failure_log_id = %failure_id, "Failure already resolved, keeping first fix");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn append_to_session(&self, session_id: &str, log_id: &str, status: AttemptStatus) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = Local::now();

        let mut session = self.get_session(session_id)?.unwrap_or_else(|| SessionRecord {
            session_id: session_id.to_string(),
            created_at: now,
            updated_at: now,
            attempts: Vec::new(),
            status: SessionStatus::InProgress,
            resolved_at: None,
        });

        session.attempts.push(SessionAttempt {
            log_id: log_id.to_string(),
            timestamp: now,
            status,
        });
        if status == AttemptStatus::Success {
            session.status = SessionStatus::Resolved;
            session.resolved_at = Some(now);
        }
        session.updated_at = now;

        write_json_atomic(&self.session_path(session_id), &session)
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.json", session_id))
    }

    fn dated_dir(&self, base: &Path, timestamp: &DateTime<Local>) -> Result<PathBuf> {
        let dir = base.join(timestamp.format("%Y-%m-%d").to_string());
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    fn find_log_path(&self, base: &Path, log_id: &str) -> Result<Option<PathBuf>> {
        if !is_safe_id(log_id) {
            return Ok(None);
        }
        for date_dir in sorted_subdirs(base)? {
            let candidate = date_dir.join(format!("{}.json", log_id));
            if candidate.is_file() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    fn resolution_for(&self, log_id: &str) -> Result<Option<Resolution>> {
        let path = self.resolutions_dir.join(format!("{}.json", log_id));
        read_json_opt(&path)
    }

    /// Materialize `fixed_by` from the resolution table.
    fn hydrate(&self, mut log: ExecutionLog) -> Result<ExecutionLog> {
        if log.status == AttemptStatus::Failed {
            log.fixed_by = self.resolution_for(&log.log_id)?.map(|r| r.fixed_by);
        }
        Ok(log)
    }

    /// Look a log up by id in both failures and successes.
    pub fn get_log(&self, log_id: &str) -> Result<Option<ExecutionLog>> {
        for base in [&self.failures_dir, &self.successes_dir] {
            if let Some(path) = self.find_log_path(base, log_id)? {
                let log: Option<ExecutionLog> = read_json_opt(&path)?;
                return log.map(|l| self.hydrate(l)).transpose();
            }
        }
        Ok(None)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        if !is_safe_id(session_id) {
            return Ok(None);
        }
        read_json_opt(&self.session_path(session_id))
    }

    /// Every failure, unordered. Unreadable files are skipped with a warning.
    pub fn all_failures(&self) -> Result<Vec<ExecutionLog>> {
        self.load_all(&self.failures_dir)?
            .into_iter()
            .map(|log| self.hydrate(log))
            .collect()
    }

    pub fn all_successes(&self) -> Result<Vec<ExecutionLog>> {
        self.load_all(&self.successes_dir)
    }

    pub fn recent_failures(&self, limit: usize) -> Result<Vec<ExecutionLog>> {
        let mut logs = self.all_failures()?;
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        logs.truncate(limit);
        Ok(logs)
    }

    pub fn recent_successes(&self, limit: usize) -> Result<Vec<ExecutionLog>> {
        let mut logs = self.all_successes()?;
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        logs.truncate(limit);
        Ok(logs)
    }

    pub fn unfixed_failures(&self) -> Result<Vec<ExecutionLog>> {
        let mut logs: Vec<_> = self
            .all_failures()?
            .into_iter()
            .filter(|log| log.fixed_by.is_none())
            .collect();
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(logs)
    }

    fn load_all(&self, base: &Path) -> Result<Vec<ExecutionLog>> {
        let mut logs = Vec::new();
        for date_dir in sorted_subdirs(base)? {
            let entries = fs::read_dir(&date_dir)
                .with_context(|| format!("Failed to list {}", date_dir.display()))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_json_opt::<ExecutionLog>(&path) {
                    Ok(Some(log)) => logs.push(log),
                    Ok(None) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "Could not load log file"),
                }
            }
        }
        Ok(logs)
    }

    /// Bulk administrative purge. Returns the number of attempt records removed.
    pub fn purge(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let removed = self.load_all(&self.failures_dir)?.len() + self.load_all(&self.successes_dir)?.len();

        for dir in [
            &self.failures_dir,
            &self.successes_dir,
            &self.sessions_dir,
            &self.resolutions_dir,
            &self.analysis_dir,
        ] {
            if dir.exists() {
                fs::remove_dir_all(dir)
                    .with_context(|| format!("Failed to purge {}", dir.display()))?;
            }
        }
        self.ensure_layout()?;
        Ok(removed)
    }
}

/// Ids become file names; refuse anything that could escape the directory.
fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn sorted_subdirs(base: &Path) -> Result<Vec<PathBuf>> {
    if !base.exists() {
        return Ok(Vec::new());
    }
    let mut dirs: Vec<PathBuf> = fs::read_dir(base)
        .with_context(|| format!("Failed to list {}", base.display()))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn read_json_opt<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    let value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Write via a temp file in the same directory and rename over the target.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = serialize_to_temp(path, value)?;
    tmp.persist(path)
        .with_context(|| format!("Failed to persist {}", path.display()))?;
    Ok(())
}

/// Like [`write_json_atomic`] but never replaces an existing file.
/// Returns `false` when the target already exists.
fn write_json_create_new<T: Serialize>(path: &Path, value: &T) -> Result<bool> {
    let tmp = serialize_to_temp(path, value)?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error).with_context(|| format!("Failed to persist {}", path.display())),
    }
}

fn serialize_to_temp<T: Serialize>(path: &Path, value: &T) -> Result<tempfile::NamedTempFile> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    let json = serde_json::to_vec_pretty(value).context("Failed to serialize log record")?;
    tmp.write_all(&json)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn failure(code: &str, stderr: &str) -> FailureRecord {
        FailureRecord {
            code: code.to_string(),
            error_message: "Script exited with code 1".to_string(),
            stderr: stderr.to_string(),
            return_code: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_failure_is_classified_and_persisted() {
        let dir = TempDir::new().unwrap();
        let store = ExecutionLogStore::open(dir.path()).unwrap();

        let log_id = store
            .log_failure(failure("import torch", "ModuleNotFoundError: No module named 'torch'"))
            .unwrap()
            .log_id;

        let log = store.get_log(&log_id).unwrap().expect("log exists");
        assert_eq!(log.status, AttemptStatus::Failed);
        assert_eq!(log.session_id, log_id);
        assert_eq!(log.error_category, Some(ErrorCategory::ImportError));
        assert_eq!(log.error_type.as_deref(), Some("ModuleNotFoundError"));
        assert_eq!(log.code_hash, classify::code_hash("import torch"));
        assert!(log.fixed_by.is_none());

        let today = log.timestamp.format("%Y-%m-%d").to_string();
        assert!(dir
            .path()
            .join("failures")
            .join(today)
            .join(format!("{}.json", log_id))
            .is_file());
    }

    #[test]
    fn test_explicit_category_wins() {
        let dir = TempDir::new().unwrap();
        let store = ExecutionLogStore::open(dir.path()).unwrap();
        let mut record = failure("while True: pass", "");
        record.error_category = Some(ErrorCategory::Timeout);

        let log_id = store.log_failure(record).unwrap().log_id;
        let log = store.get_log(&log_id).unwrap().unwrap();
        assert_eq!(log.error_category, Some(ErrorCategory::Timeout));
    }

    #[test]
    fn test_success_resolves_previous_failure() {
        let dir = TempDir::new().unwrap();
        let store = ExecutionLogStore::open(dir.path()).unwrap();

        let failure_id = store
            .log_failure(failure("import cv3", "ModuleNotFoundError: No module named 'cv3'"))
            .unwrap()
            .log_id;
        let success = store
            .log_success(SuccessRecord {
                code: "import cv2".to_string(),
                output_files: vec!["result.png".to_string()],
                previous_attempt_id: Some(failure_id.clone()),
                ..Default::default()
            })
            .unwrap();

        let success_id = success.log_id.clone();
        assert_eq!(success.session_id, failure_id, "success joins the failure's session");

        let fixed = store.get_log(&failure_id).unwrap().unwrap();
        assert_eq!(fixed.fixed_by.as_deref(), Some(success_id.as_str()));
        let success_log = store.get_log(&success_id).unwrap().unwrap();
        assert_eq!(success_log.session_id, failure_id);

        let session = store.get_session(&failure_id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Resolved);
        let ids: Vec<_> = session.attempts.iter().map(|a| a.log_id.as_str()).collect();
        assert_eq!(ids, vec![failure_id.as_str(), success_id.as_str()]);
        assert_eq!(session.attempts[0].status, AttemptStatus::Failed);
        assert_eq!(session.attempts[1].status, AttemptStatus::Success);
        assert!(session.resolved_at.is_some());

        assert!(store.unfixed_failures().unwrap().is_empty());
    }

    #[test]
    fn test_unwritten_success_does_not_resolve_failure() {
        let dir = TempDir::new().unwrap();
        let store = ExecutionLogStore::open(dir.path()).unwrap();
        let failure_id = store.log_failure(failure("x", "NameError: x")).unwrap().log_id;

        // A plain file where today's successes directory should go
        let today = Local::now().format("%Y-%m-%d").to_string();
        fs::create_dir_all(dir.path().join("successes")).unwrap();
        fs::write(dir.path().join("successes").join(today), b"").unwrap();

        let result = store.log_success(SuccessRecord {
            code: "x = 1".to_string(),
            previous_attempt_id: Some(failure_id.clone()),
            ..Default::default()
        });

        assert!(result.is_err());
        assert!(!dir
            .path()
            .join("resolutions")
            .join(format!("{}.json", failure_id))
            .exists());
        assert!(store.get_log(&failure_id).unwrap().unwrap().fixed_by.is_none());
    }

    #[test]
    fn test_fixed_by_is_set_once() {
        let dir = TempDir::new().unwrap();
        let store = ExecutionLogStore::open(dir.path()).unwrap();
        let failure_id = store.log_failure(failure("x", "NameError: x")).unwrap().log_id;

        let first = store
            .log_success(SuccessRecord {
                code: "y = 1".to_string(),
                previous_attempt_id: Some(failure_id.clone()),
                ..Default::default()
            })
            .unwrap();
        store
            .log_success(SuccessRecord {
                code: "y = 2".to_string(),
                previous_attempt_id: Some(failure_id.clone()),
                ..Default::default()
            })
            .unwrap();

        let log = store.get_log(&failure_id).unwrap().unwrap();
        assert_eq!(log.fixed_by.as_deref(), Some(first.log_id.as_str()));
    }

    #[test]
    fn test_retry_chain_stays_in_session() {
        let dir = TempDir::new().unwrap();
        let store = ExecutionLogStore::open(dir.path()).unwrap();

        let first = store.log_failure(failure("a", "KeyError: 0")).unwrap().log_id;
        let mut second_record = failure("b", "TypeError: nope");
        second_record.previous_attempt_id = Some(first.clone());
        let second = store.log_failure(second_record).unwrap();
        assert_eq!(second.session_id, first);
        let second = second.log_id;

        let session = store.get_session(&first).unwrap().unwrap();
        assert_eq!(session.attempts.len(), 2);
        assert_eq!(session.status, SessionStatus::InProgress);
        assert_eq!(store.get_log(&second).unwrap().unwrap().session_id, first);
        assert_eq!(store.unfixed_failures().unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_ids_and_purge() {
        let dir = TempDir::new().unwrap();
        let store = ExecutionLogStore::open(dir.path()).unwrap();
        assert!(store.get_log("missing").unwrap().is_none());
        assert!(store.get_log("../etc/passwd").unwrap().is_none());
        assert!(store.get_session("nope").unwrap().is_none());

        store.log_failure(failure("a", "ValueError: v")).unwrap();
        store
            .log_success(SuccessRecord {
                code: "b".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(store.recent_successes(10).unwrap().len(), 1);

        assert_eq!(store.purge().unwrap(), 2);
        assert!(store.all_failures().unwrap().is_empty());
        assert!(store.all_successes().unwrap().is_empty());
        assert!(dir.path().join("sessions").is_dir());
    }
}
