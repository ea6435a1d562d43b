//! Derived statistics over the execution log store.
//!
//! Nothing here mutates the logs; the only write is the snapshot under
//! `analysis/latest_analysis.json`.

use crate::classify::{self, truncate_chars, ErrorCategory, TRACKED_LIBRARIES};
use crate::execution_log::{write_json_atomic, ExecutionLog, ExecutionLogStore};
use crate::manifest::{package_for_module, PackageManifest};
use anyhow::Result;
use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::info;

pub const ANALYSIS_FILE: &str = "latest_analysis.json";

const TOP_PATTERNS: usize = 10;
const TOP_COMMON_ERRORS: usize = 15;
const PATTERN_EXAMPLES: usize = 3;
const COMMON_ERROR_EXAMPLES: usize = 2;
const LIBRARY_EXAMPLES: usize = 3;
const RECENT_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub generated_at: DateTime<Local>,
    pub summary: Summary,
    pub error_patterns: Vec<ErrorPattern>,
    pub common_errors: Vec<CommonError>,
    pub fix_strategies: Vec<FixStrategy>,
    pub library_issues: Vec<LibraryIssue>,
    pub missing_modules: Vec<MissingModule>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_failures: usize,
    pub total_successes: usize,
    pub unfixed_failures: usize,
    pub fixed_failures: usize,
    pub overall_success_rate: f64,
    pub recent_success_rate_7d: f64,
    pub recent_attempts_7d: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternExample {
    pub log_id: String,
    pub error_message: String,
    pub timestamp: DateTime<Local>,
    pub fixed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub category: ErrorCategory,
    pub count: usize,
    pub examples: Vec<PatternExample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorExample {
    pub log_id: String,
    pub session_id: String,
    pub fixed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonError {
    pub error: String,
    pub count: usize,
    pub fixed_count: usize,
    pub fix_rate: f64,
    pub examples: Vec<ErrorExample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixStrategy {
    pub error_category: ErrorCategory,
    pub fix_count: usize,
    /// Most frequent import changes as `(change, occurrences)`, `+mod` added, `-mod` removed.
    pub common_changes: Vec<(String, usize)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryExample {
    pub log_id: String,
    pub error: String,
    pub fixed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryIssue {
    pub library: String,
    pub count: usize,
    pub errors: Vec<LibraryExample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingModule {
    pub module: String,
    pub count: usize,
    pub suggested_package: String,
    /// Whether the current sandbox manifest now provides it.
    pub available: bool,
}

/// Import differences between a failed script and the success that fixed it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeChanges {
    pub added_imports: Vec<String>,
    pub removed_imports: Vec<String>,
    pub summary: Vec<String>,
}

pub struct LogAnalyzer<'a> {
    store: &'a ExecutionLogStore,
    manifest: Option<&'a PackageManifest>,
}

impl<'a> LogAnalyzer<'a> {
    pub fn new(store: &'a ExecutionLogStore) -> Self {
        Self {
            store,
            manifest: None,
        }
    }

    pub fn with_manifest(mut self, manifest: &'a PackageManifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Full analysis, persisted to `analysis/latest_analysis.json`.
    pub fn analyze_all(&self) -> Result<Analysis> {
        let analysis = self.analyze_at(Local::now())?;
        let path = self.snapshot_path();
        write_json_atomic(&path, &analysis)?;
        info!(
            path = %path.display(),
            failures = analysis.summary.total_failures,
            successes = analysis.summary.total_successes,
            "Wrote log analysis"
        );
        Ok(analysis)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.store.analysis_dir().join(ANALYSIS_FILE)
    }

    /// Compute the analysis as of `now` without writing it.
    pub fn analyze_at(&self, now: DateTime<Local>) -> Result<Analysis> {
        let mut failures = self.store.all_failures()?;
        let successes = self.store.all_successes()?;
        // Oldest first so examples are stable across runs
        failures.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let error_patterns = error_patterns(&failures);
        let library_issues = library_issues(&failures);
        let missing_modules = self.missing_modules(&failures);
        let recommendations = recommendations(&error_patterns, &library_issues, &missing_modules);

        Ok(Analysis {
            generated_at: now,
            summary: summarize(&failures, &successes, now),
            common_errors: common_errors(&failures),
            fix_strategies: self.fix_strategies(&failures, &successes),
            error_patterns,
            library_issues,
            missing_modules,
            recommendations,
        })
    }

    fn fix_strategies(&self, failures: &[ExecutionLog], successes: &[ExecutionLog]) -> Vec<FixStrategy> {
        let by_id: HashMap<&str, &ExecutionLog> =
            successes.iter().map(|s| (s.log_id.as_str(), s)).collect();

        let mut grouped: BTreeMap<ErrorCategory, (usize, Vec<String>)> = BTreeMap::new();
        for failure in failures {
            let Some(success) = failure
                .fixed_by
                .as_deref()
                .and_then(|id| by_id.get(id))
            else {
                continue;
            };

            let changes = code_changes(&failure.code, &success.code);
            let entry = grouped
                .entry(failure.error_category.unwrap_or(ErrorCategory::Unknown))
                .or_default();
            entry.0 += 1;
            entry
                .1
                .extend(changes.added_imports.iter().map(|m| format!("+{}", m)));
            entry
                .1
                .extend(changes.removed_imports.iter().map(|m| format!("-{}", m)));
        }

        grouped
            .into_iter()
            .filter(|(_, (_, changes))| !changes.is_empty())
            .map(|(category, (fix_count, changes))| FixStrategy {
                error_category: category,
                fix_count,
                common_changes: most_common(changes, 5),
            })
            .collect()
    }

    fn missing_modules(&self, failures: &[ExecutionLog]) -> Vec<MissingModule> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for failure in failures {
            let text = format!(
                "{} {}",
                failure.error_message.as_deref().unwrap_or(""),
                failure.stderr.as_deref().unwrap_or("")
            );
            let mut seen: Vec<String> = Vec::new();
            for module in classify::missing_modules(&text) {
                // The message usually repeats stderr; count each failure once
                if seen.contains(&module) {
                    continue;
                }
                seen.push(module.clone());
                match counts.iter_mut().find(|(m, _)| *m == module) {
                    Some((_, n)) => *n += 1,
                    None => counts.push((module, 1)),
                }
            }
        }
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.to_lowercase().cmp(&b.0.to_lowercase())));

        counts
            .into_iter()
            .map(|(module, count)| MissingModule {
                suggested_package: package_for_module(&module).to_string(),
                available: self
                    .manifest
                    .map(|m| m.provides_module(&module))
                    .unwrap_or(false),
                module,
                count,
            })
            .collect()
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

fn summarize(failures: &[ExecutionLog], successes: &[ExecutionLog], now: DateTime<Local>) -> Summary {
    let cutoff = now - Duration::days(RECENT_WINDOW_DAYS);
    let unfixed = failures.iter().filter(|f| f.fixed_by.is_none()).count();
    let recent_failures = failures.iter().filter(|f| f.timestamp >= cutoff).count();
    let recent_successes = successes.iter().filter(|s| s.timestamp >= cutoff).count();
    let recent_total = recent_failures + recent_successes;

    Summary {
        total_failures: failures.len(),
        total_successes: successes.len(),
        unfixed_failures: unfixed,
        fixed_failures: failures.len() - unfixed,
        overall_success_rate: percent(successes.len(), failures.len() + successes.len()),
        recent_success_rate_7d: percent(recent_successes, recent_total),
        recent_attempts_7d: recent_total,
    }
}

fn error_patterns(failures: &[ExecutionLog]) -> Vec<ErrorPattern> {
    let mut grouped: BTreeMap<ErrorCategory, ErrorPattern> = BTreeMap::new();
    for failure in failures {
        let category = failure.error_category.unwrap_or(ErrorCategory::Unknown);
        let pattern = grouped.entry(category).or_insert_with(|| ErrorPattern {
            category,
            count: 0,
            examples: Vec::new(),
        });
        pattern.count += 1;
        if pattern.examples.len() < PATTERN_EXAMPLES {
            pattern.examples.push(PatternExample {
                log_id: failure.log_id.clone(),
                error_message: truncate_chars(failure.error_message.as_deref().unwrap_or(""), 200),
                timestamp: failure.timestamp,
                fixed: failure.fixed_by.is_some(),
            });
        }
    }

    let mut patterns: Vec<_> = grouped.into_values().collect();
    // Stable sort keeps category order for ties
    patterns.sort_by(|a, b| b.count.cmp(&a.count));
    patterns.truncate(TOP_PATTERNS);
    patterns
}

fn common_errors(failures: &[ExecutionLog]) -> Vec<CommonError> {
    let mut errors: Vec<CommonError> = Vec::new();
    for failure in failures {
        let key = classify::extract_key_error(
            failure.error_message.as_deref().unwrap_or(""),
            failure.stderr.as_deref().unwrap_or(""),
        );
        let idx = match errors.iter().position(|e| e.error == key) {
            Some(idx) => idx,
            None => {
                errors.push(CommonError {
                    error: key,
                    count: 0,
                    fixed_count: 0,
                    fix_rate: 0.0,
                    examples: Vec::new(),
                });
                errors.len() - 1
            }
        };

        let entry = &mut errors[idx];
        entry.count += 1;
        if failure.fixed_by.is_some() {
            entry.fixed_count += 1;
        }
        if entry.examples.len() < COMMON_ERROR_EXAMPLES {
            entry.examples.push(ErrorExample {
                log_id: failure.log_id.clone(),
                session_id: failure.session_id.clone(),
                fixed: failure.fixed_by.is_some(),
            });
        }
    }

    for entry in &mut errors {
        entry.fix_rate = percent(entry.fixed_count, entry.count);
    }
    errors.sort_by(|a, b| b.count.cmp(&a.count));
    errors.truncate(TOP_COMMON_ERRORS);
    errors
}

fn library_issues(failures: &[ExecutionLog]) -> Vec<LibraryIssue> {
    let mut issues: Vec<LibraryIssue> = TRACKED_LIBRARIES
        .iter()
        .map(|lib| LibraryIssue {
            library: lib.to_string(),
            count: 0,
            errors: Vec::new(),
        })
        .collect();

    for failure in failures {
        let message = failure.error_message.as_deref().unwrap_or("");
        let stderr = failure.stderr.as_deref().unwrap_or("");
        for issue in issues.iter_mut() {
            let lib = issue.library.as_str();
            if !(failure.code.contains(lib) || stderr.contains(lib) || message.contains(lib)) {
                continue;
            }
            issue.count += 1;
            if issue.errors.len() < LIBRARY_EXAMPLES {
                issue.errors.push(LibraryExample {
                    log_id: failure.log_id.clone(),
                    error: truncate_chars(&classify::extract_key_error(message, stderr), 150),
                    fixed: failure.fixed_by.is_some(),
                });
            }
        }
    }

    issues.retain(|issue| issue.count > 0);
    issues.sort_by(|a, b| b.count.cmp(&a.count));
    issues
}

fn recommendations(
    patterns: &[ErrorPattern],
    libraries: &[LibraryIssue],
    missing: &[MissingModule],
) -> Vec<String> {
    let mut out = Vec::new();

    for pattern in patterns.iter().take(3) {
        let line = match pattern.category {
            ErrorCategory::ImportError => format!(
                "HIGH PRIORITY: {} import errors. Make sure generated scripts only import packages the sandbox ships.",
                pattern.count
            ),
            ErrorCategory::AttributeError => format!(
                "MEDIUM PRIORITY: {} attribute errors. Review the helper API examples given to script authors.",
                pattern.count
            ),
            ErrorCategory::DataAccessError => format!(
                "MEDIUM PRIORITY: {} data access errors. Check key types used to index request data.",
                pattern.count
            ),
            ErrorCategory::Timeout => format!(
                "MEDIUM PRIORITY: {} timeouts. Look for unbounded loops or oversized inputs.",
                pattern.count
            ),
            _ => continue,
        };
        out.push(line);
    }

    if let Some(top) = libraries.first() {
        out.push(format!(
            "LIBRARY ISSUE: {} appears in {} failures. Add targeted usage examples.",
            top.library, top.count
        ));
    }

    for module in missing.iter().filter(|m| !m.available).take(3) {
        out.push(format!(
            "MISSING MODULE: {} failed to import {} times. Consider adding `{}` to the sandbox image.",
            module.module, module.count, module.suggested_package
        ));
    }

    out
}

pub fn code_changes(old_code: &str, new_code: &str) -> CodeChanges {
    let old_imports = classify::imported_modules(old_code);
    let new_imports = classify::imported_modules(new_code);

    let added_imports: Vec<String> = new_imports
        .iter()
        .filter(|m| !old_imports.contains(m))
        .cloned()
        .collect();
    let removed_imports: Vec<String> = old_imports
        .iter()
        .filter(|m| !new_imports.contains(m))
        .cloned()
        .collect();

    let mut summary = Vec::new();
    if !added_imports.is_empty() {
        summary.push(format!("Added imports: {}", added_imports.join(", ")));
    }
    if !removed_imports.is_empty() {
        summary.push(format!("Removed imports: {}", removed_imports.join(", ")));
    }
    if new_code.contains("def ") && !old_code.contains("def ") {
        summary.push("Added function definitions".to_string());
    }
    if new_code.len() * 2 > old_code.len() * 3 {
        summary.push("Significant code expansion".to_string());
    } else if new_code.len() * 2 < old_code.len() {
        summary.push("Significant code reduction".to_string());
    }

    CodeChanges {
        added_imports,
        removed_imports,
        summary,
    }
}

/// Occurrence counts, highest first, ties in first-seen order.
fn most_common(items: Vec<String>, limit: usize) -> Vec<(String, usize)> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for item in items {
        match counts.iter_mut().find(|(k, _)| *k == item) {
            Some((_, n)) => *n += 1,
            None => counts.push((item, 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.truncate(limit);
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution_log::{FailureRecord, SuccessRecord};
    use std::fs;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    fn log_failure(store: &ExecutionLogStore, code: &str, stderr: &str) -> String {
        store
            .log_failure(FailureRecord {
                code: code.to_string(),
                error_message: "Script exited with code 1".to_string(),
                stderr: stderr.to_string(),
                return_code: 1,
                ..Default::default()
            })
            .unwrap()
            .log_id
    }

    #[test]
    fn test_summary_and_patterns() {
        let dir = TempDir::new().unwrap();
        let store = ExecutionLogStore::open(dir.path()).unwrap();

        let fixed = log_failure(&store, "import cv3", "ModuleNotFoundError: No module named 'cv3'");
        log_failure(&store, "import torch", "ModuleNotFoundError: No module named 'torch'");
        log_failure(&store, "import numpy as np\nnp.foo()", "AttributeError: module 'numpy' has no attribute 'foo'");
        store
            .log_success(SuccessRecord {
                code: "import cv2".to_string(),
                previous_attempt_id: Some(fixed),
                ..Default::default()
            })
            .unwrap();

        let analysis = LogAnalyzer::new(&store).analyze_at(Local::now()).unwrap();
        let summary = &analysis.summary;
        assert_eq!(summary.total_failures, 3);
        assert_eq!(summary.total_successes, 1);
        assert_eq!(summary.fixed_failures, 1);
        assert_eq!(summary.unfixed_failures, 2);
        assert_eq!(summary.recent_attempts_7d, 4);
        assert!((summary.overall_success_rate - 25.0).abs() < 1e-9);

        assert_eq!(analysis.error_patterns[0].category, ErrorCategory::ImportError);
        assert_eq!(analysis.error_patterns[0].count, 2);

        let torch = analysis
            .missing_modules
            .iter()
            .find(|m| m.module == "torch")
            .expect("torch reported missing");
        assert_eq!(torch.count, 1);
        assert!(!torch.available);

        assert_eq!(analysis.fix_strategies.len(), 1);
        let strategy = &analysis.fix_strategies[0];
        assert_eq!(strategy.error_category, ErrorCategory::ImportError);
        assert!(strategy.common_changes.contains(&("+cv2".to_string(), 1)));
        assert!(strategy.common_changes.contains(&("-cv3".to_string(), 1)));

        assert!(analysis.library_issues.iter().any(|l| l.library == "numpy"));
        assert!(analysis.recommendations[0].starts_with("HIGH PRIORITY: 2 import errors"));
    }

    #[test]
    fn test_recent_window_excludes_old_attempts() {
        let dir = TempDir::new().unwrap();
        let store = ExecutionLogStore::open(dir.path()).unwrap();
        log_failure(&store, "x", "NameError: x");

        let later = Local::now() + Duration::days(8);
        let analysis = LogAnalyzer::new(&store).analyze_at(later).unwrap();
        assert_eq!(analysis.summary.total_failures, 1);
        assert_eq!(analysis.summary.recent_attempts_7d, 0);
        assert_eq!(analysis.summary.recent_success_rate_7d, 0.0);
    }

    #[test]
    fn test_common_errors_group_by_key_line() {
        let dir = TempDir::new().unwrap();
        let store = ExecutionLogStore::open(dir.path()).unwrap();
        for _ in 0..3 {
            log_failure(&store, "d['0']", "Traceback:\nKeyError: 0");
        }
        log_failure(&store, "y", "ValueError: bad");

        let analysis = LogAnalyzer::new(&store).analyze_at(Local::now()).unwrap();
        assert_eq!(analysis.common_errors[0].error, "KeyError: 0");
        assert_eq!(analysis.common_errors[0].count, 3);
        assert_eq!(analysis.common_errors[0].examples.len(), 2);
        assert_eq!(analysis.common_errors[0].fix_rate, 0.0);
    }

    #[test]
    fn test_missing_module_checked_against_manifest() {
        let dir = TempDir::new().unwrap();
        let store = ExecutionLogStore::open(dir.path().join("logs")).unwrap();
        log_failure(&store, "import cv2", "ModuleNotFoundError: No module named 'cv2'");

        let requirements = dir.path().join("requirements.txt");
        fs::write(&requirements, "opencv-python-headless==4.9.0\n").unwrap();
        let manifest = PackageManifest::new(&requirements, StdDuration::from_secs(60));

        let analysis = LogAnalyzer::new(&store)
            .with_manifest(&manifest)
            .analyze_all()
            .unwrap();
        let cv2 = &analysis.missing_modules[0];
        assert_eq!(cv2.suggested_package, "opencv-python-headless");
        assert!(cv2.available);
        assert!(!analysis
            .recommendations
            .iter()
            .any(|r| r.starts_with("MISSING MODULE")));

        let snapshot = dir.path().join("logs").join("analysis").join(ANALYSIS_FILE);
        assert!(snapshot.is_file());
    }

    #[test]
    fn test_code_changes() {
        let changes = code_changes("import cv3\nprint(1)\n", "import cv2\n\ndef main():\n    pass\n");
        assert_eq!(changes.added_imports, vec!["cv2".to_string()]);
        assert_eq!(changes.removed_imports, vec!["cv3".to_string()]);
        assert!(changes.summary.contains(&"Added function definitions".to_string()));
        assert!(changes.summary.contains(&"Significant code expansion".to_string()));
    }
}
