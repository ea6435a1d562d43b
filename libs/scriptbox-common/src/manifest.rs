//! Which third-party packages the sandbox image ships.
//!
//! Read from the image's `requirements.txt` and memoized for a fixed TTL so
//! hot paths (analysis, CLI) do not re-read the file on every call.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Version recorded for requirement lines without a pin.
pub const UNPINNED: &str = "installed";

/// Import name -> pip package, for modules whose names differ.
const MODULE_PACKAGES: &[(&str, &str)] = &[
    ("cv2", "opencv-python-headless"),
    ("skimage", "scikit-image"),
    ("PIL", "pillow"),
    ("yaml", "PyYAML"),
    ("fpdf", "fpdf2"),
    ("sklearn", "scikit-learn"),
];

struct Cached {
    loaded_at: Instant,
    packages: BTreeMap<String, String>,
}

pub struct PackageManifest {
    path: PathBuf,
    ttl: Duration,
    cache: Mutex<Option<Cached>>,
}

impl PackageManifest {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Package name -> pinned version. An unreadable or empty manifest yields
    /// an empty map and is not cached, so the next call retries.
    pub fn packages(&self) -> BTreeMap<String, String> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = cache.as_ref() {
            if cached.loaded_at.elapsed() < self.ttl {
                return cached.packages.clone();
            }
        }

        match read_requirements(&self.path) {
            Ok(packages) if !packages.is_empty() => {
                *cache = Some(Cached {
                    loaded_at: Instant::now(),
                    packages: packages.clone(),
                });
                packages
            }
            Ok(_) => BTreeMap::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not read sandbox requirements");
                BTreeMap::new()
            }
        }
    }

    pub fn invalidate(&self) {
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Whether an import of `module` would resolve inside the sandbox.
    pub fn provides_module(&self, module: &str) -> bool {
        let top = module.split('.').next().unwrap_or(module);
        let wanted = package_for_module(top).to_lowercase();
        self.packages().keys().any(|name| name.to_lowercase() == wanted)
    }
}

/// Best-guess pip package for an import name.
pub fn package_for_module(module: &str) -> &str {
    MODULE_PACKAGES
        .iter()
        .find(|(m, _)| *m == module)
        .map(|(_, pkg)| *pkg)
        .unwrap_or(module)
}

pub fn read_requirements(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(parse_requirements(&content))
}

/// `name==version` lines; bare names are recorded as [`UNPINNED`].
/// Comments, blank lines and pip options are ignored.
pub fn parse_requirements(content: &str) -> BTreeMap<String, String> {
    let mut packages = BTreeMap::new();
    for raw in content.lines() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() || line.starts_with('-') {
            continue;
        }
        match line.split_once("==") {
            Some((name, version)) => {
                packages.insert(name.trim().to_string(), version.trim().to_string());
            }
            None => {
                let name: String = line
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
                    .collect();
                if !name.is_empty() {
                    packages.insert(name, UNPINNED.to_string());
                }
            }
        }
    }
    packages
}
