//! Failure taxonomy for sandboxed script runs.
//!
//! Everything here is a pure function of the submitted code and the error
//! text, so the same inputs always land in the same bucket.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

lazy_static! {
    static ref EXCEPTION_RE: Regex =
        Regex::new(r"([A-Za-z_][A-Za-z0-9_]*(?:Error|Exception)):").expect("invalid exception regex");
    static ref KEY_ERROR_LINE_RE: Regex =
        Regex::new(r"^\w+(?:Error|Exception):").expect("invalid key error regex");
    static ref MISSING_MODULE_RE: Regex =
        Regex::new(r#"No module named ['"]([A-Za-z0-9_.]+)['"]"#).expect("invalid module regex");
    static ref IMPORT_RE: Regex =
        Regex::new(r"(?m)^\s*(?:import|from)\s+([A-Za-z0-9_.]+)").expect("invalid import regex");
}

/// Libraries worth tagging when a script imports them.
pub const TRACKED_LIBRARIES: &[&str] = &[
    "numpy",
    "scipy",
    "matplotlib",
    "PIL",
    "skimage",
    "cv2",
    "pandas",
    "imageio",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ImportError,
    AttributeError,
    DataAccessError,
    TypeError,
    ValueError,
    FileNotFound,
    PermissionError,
    Timeout,
    MemoryError,
    SyntaxError,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ImportError => "import_error",
            ErrorCategory::AttributeError => "attribute_error",
            ErrorCategory::DataAccessError => "data_access_error",
            ErrorCategory::TypeError => "type_error",
            ErrorCategory::ValueError => "value_error",
            ErrorCategory::FileNotFound => "file_not_found",
            ErrorCategory::PermissionError => "permission_error",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::MemoryError => "memory_error",
            ErrorCategory::SyntaxError => "syntax_error",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered first-match rules over the lower-cased error text.
const RULES: &[(&[&str], ErrorCategory)] = &[
    (&["import", "modulenotfounderror", "no module named"], ErrorCategory::ImportError),
    (&["attributeerror"], ErrorCategory::AttributeError),
    (&["keyerror", "indexerror"], ErrorCategory::DataAccessError),
    (&["typeerror"], ErrorCategory::TypeError),
    (&["valueerror"], ErrorCategory::ValueError),
    (&["filenotfounderror", "no such file"], ErrorCategory::FileNotFound),
    (&["permission", "access"], ErrorCategory::PermissionError),
    (&["timeout"], ErrorCategory::Timeout),
    (&["memory"], ErrorCategory::MemoryError),
    (&["syntax"], ErrorCategory::SyntaxError),
];

pub fn classify_error(error_message: &str, stderr: &str) -> ErrorCategory {
    let text = format!("{} {}", error_message, stderr).to_lowercase();

    RULES
        .iter()
        .find(|(markers, _)| markers.iter().any(|m| text.contains(m)))
        .map(|(_, category)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Exception class name from a traceback. Lines are scanned bottom-up so the
/// innermost frame's exception wins over "During handling..." chains.
pub fn extract_error_type(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .rev()
        .find_map(|line| EXCEPTION_RE.captures(line))
        .map(|caps| caps[1].to_string())
}

/// The line used to group identical failures: last exception line of the
/// traceback, else the error message, capped at 200 chars.
pub fn extract_key_error(error_message: &str, stderr: &str) -> String {
    let from_stderr = stderr
        .trim()
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| KEY_ERROR_LINE_RE.is_match(line));

    let key = match from_stderr {
        Some(line) => line,
        None if !error_message.trim().is_empty() => error_message.trim(),
        None => "Unknown error",
    };
    truncate_chars(key, 200)
}

/// Module names reported by `No module named 'x'`.
pub fn missing_modules(text: &str) -> Vec<String> {
    MISSING_MODULE_RE
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Top-level modules imported by a script, in source order.
pub fn imported_modules(code: &str) -> Vec<String> {
    let mut modules: Vec<String> = Vec::new();
    for caps in IMPORT_RE.captures_iter(code) {
        let name = caps[1].to_string();
        if !modules.contains(&name) {
            modules.push(name);
        }
    }
    modules
}

pub fn extract_tags(code: &str, error_message: &str, stderr: &str) -> Vec<String> {
    let mut tags = Vec::new();

    for lib in TRACKED_LIBRARIES {
        if code.contains(&format!("import {}", lib)) || code.contains(&format!("from {}", lib)) {
            tags.push(format!("lib:{}", lib));
        }
    }

    if !error_message.is_empty() || !stderr.is_empty() {
        let text = format!("{} {}", error_message, stderr).to_lowercase();
        if text.contains("import") {
            tags.push("error:import".to_string());
        }
        if text.contains("matplotlib") {
            tags.push("error:matplotlib".to_string());
        }
        if text.contains("stdin") || text.contains("json") {
            tags.push("error:input_parsing".to_string());
        }
    }

    tags
}

/// Whitespace-insensitive fingerprint of a script for duplicate detection.
pub fn code_hash(code: &str) -> String {
    let normalized = code
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(16);
    digest
}

const TRACEBACK_HEADER: &str = "Traceback (most recent call last):";

/// The failure-describing part of a log whose stdout and stderr are mixed:
/// from the last traceback header to the end, else the last exception line,
/// else the last non-empty line. Runner chatter and echoed source before the
/// traceback never reach the classifier.
pub fn failure_excerpt(log: &str) -> &str {
    if let Some(pos) = log.rfind(TRACEBACK_HEADER) {
        return log[pos..].trim_end();
    }
    let mut lines = log.lines().rev().map(str::trim);
    if let Some(line) = lines.clone().find(|line| KEY_ERROR_LINE_RE.is_match(line)) {
        return line;
    }
    lines.find(|line| !line.is_empty()).unwrap_or("")
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
