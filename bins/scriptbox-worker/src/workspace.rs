/// Job Workspace Manager
///
/// **Layout per job:**
/// `{outputs_root}/{job_id}/{code,input,result,result/.toolconfig}` plus an
/// `.active` marker holding the unix time the job started.
///
/// **Marker contract:**
/// The marker exists from right after directory creation until the job's
/// result is computed. It is owned by [`ActiveMarker`], so it is removed on
/// every exit path including early returns and panics. The cleanup sweep
/// never deletes a directory with a fresh marker.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use uuid::Uuid;

pub const ACTIVE_MARKER: &str = ".active";
pub const TOOLCONFIG_DIR: &str = ".toolconfig";

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create outputs root {}", self.root.display()))
    }

    /// Create the directory tree for `job_id`.
    pub fn create(&self, job_id: &Uuid) -> Result<JobWorkspace> {
        let job_dir_name = job_id.to_string();
        let dir = self.root.join(&job_dir_name);
        let workspace = JobWorkspace {
            code_dir: dir.join("code"),
            input_dir: dir.join("input"),
            result_dir: dir.join("result"),
            job_dir_name,
            dir,
        };

        for sub in [
            &workspace.code_dir,
            &workspace.input_dir,
            &workspace.toolconfig_dir(),
        ] {
            fs::create_dir_all(sub)
                .with_context(|| format!("Failed to create {}", sub.display()))?;
        }
        open_permissions(&workspace.toolconfig_dir());

        Ok(workspace)
    }
}

/// The sandbox may run as a different uid than the worker.
#[cfg(unix)]
fn open_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o777)) {
        warn!(path = %path.display(), error = %e, "Could not open tool config directory permissions");
    }
}

#[cfg(not(unix))]
fn open_permissions(_path: &Path) {}

#[derive(Debug, Clone)]
pub struct JobWorkspace {
    dir: PathBuf,
    job_dir_name: String,
    code_dir: PathBuf,
    input_dir: PathBuf,
    result_dir: PathBuf,
}

impl JobWorkspace {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory name relative to the outputs root (used on the shared volume).
    pub fn job_dir_name(&self) -> &str {
        &self.job_dir_name
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }

    pub fn toolconfig_dir(&self) -> PathBuf {
        self.result_dir.join(TOOLCONFIG_DIR)
    }

    pub fn script_path(&self) -> PathBuf {
        self.code_dir.join("main.py")
    }

    pub fn request_path(&self) -> PathBuf {
        self.code_dir.join("request.json")
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(ACTIVE_MARKER)
    }

    /// Write the active marker. Dropping the returned guard removes it.
    pub fn mark_active(&self) -> Result<ActiveMarker> {
        let path = self.marker_path();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        fs::write(&path, now.to_string())
            .with_context(|| format!("Failed to write marker {}", path.display()))?;
        Ok(ActiveMarker { path })
    }

    pub fn write_script(&self, code: &str) -> Result<()> {
        let path = self.script_path();
        fs::write(&path, code).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn write_request(&self, request_json: &str) -> Result<()> {
        let path = self.request_path();
        fs::write(&path, request_json)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Copy the job's input image to `input/image{ext}`.
    pub fn stage_input_image(&self, source: &Path) -> Result<PathBuf> {
        let target = self
            .input_dir
            .join(format!("image{}", normalize_image_extension(source)));
        fs::copy(source, &target).with_context(|| {
            format!(
                "Failed to copy input image {} to {}",
                source.display(),
                target.display()
            )
        })?;
        Ok(target)
    }

    /// Regular files the script left directly in `result/`, sorted by name.
    pub fn output_files(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.result_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.result_dir.display(), error = %e, "Could not list result directory");
                return Vec::new();
            }
        };
        let mut files: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        files.sort();
        files
    }

    /// Remove the whole workspace now instead of waiting for the sweep.
    pub fn teardown(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.dir.display())),
        }
    }
}

/// Owns the `.active` marker file; removes it on drop.
#[derive(Debug)]
pub struct ActiveMarker {
    path: PathBuf,
}

impl ActiveMarker {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ActiveMarker {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed active marker"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove active marker"),
        }
    }
}

/// `.jpeg/.jpg -> .jpg`, `.tif/.tiff -> .tif`, none -> `.png`, else lower-cased.
pub fn normalize_image_extension(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        None | Some("") => ".png".to_string(),
        Some("jpg") | Some("jpeg") => ".jpg".to_string(),
        Some("tif") | Some("tiff") => ".tif".to_string(),
        Some(other) => format!(".{}", other),
    }
}
