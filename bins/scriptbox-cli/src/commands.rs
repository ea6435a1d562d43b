// CLI commands for submitting scripts and inspecting execution logs
use anyhow::{bail, Context, Result};
use scriptbox_common::analysis::{Analysis, LogAnalyzer};
use scriptbox_common::execution_log::{ExecutionLog, ExecutionLogStore};
use scriptbox_common::manifest::{self, PackageManifest};
use scriptbox_common::redis;
use scriptbox_common::types::{ExecutionStatus, JobRequest, JobResponse};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Where the runner image's requirements live in a source checkout.
pub const DEFAULT_REQUIREMENTS: &str = "docker/requirements.txt";

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct SubmitOptions {
    pub image: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub session_id: Option<String>,
    pub previous_attempt_id: Option<String>,
    pub wait_secs: u64,
}

/// Build the queue payload for a script file.
pub fn build_job(file: &Path, options: &SubmitOptions) -> Result<JobRequest> {
    let code = fs::read_to_string(file)
        .with_context(|| format!("Failed to read script {}", file.display()))?;
    if code.trim().is_empty() {
        bail!("Script {} is empty", file.display());
    }

    let mut job = JobRequest::new(code);
    job.timeout_secs = options.timeout_secs;
    job.session_id = options.session_id.clone();
    job.previous_attempt_id = options.previous_attempt_id.clone();
    if let Some(image) = &options.image {
        // The worker copies from this path, so it must be absolute
        let image = fs::canonicalize(image)
            .with_context(|| format!("Input image {} not found", image.display()))?;
        job.input_image = Some(image);
    }
    Ok(job)
}

/// Queue a script and wait for the worker's response
pub async fn submit(redis_url: &str, file: &Path, options: SubmitOptions) -> Result<()> {
    let job = build_job(file, &options)?;
    let job_id = job.id;

    let client = ::redis::Client::open(redis_url)
        .with_context(|| format!("Invalid Redis URL {}", redis_url))?;
    let mut conn = ::redis::aio::ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    redis::push_job(&mut conn, &job)
        .await
        .context("Failed to queue job")?;
    println!("🚀 Submitted job {}", job_id);
    println!("⏳ Waiting for result...");

    let deadline = Instant::now() + Duration::from_secs(options.wait_secs);
    loop {
        if let Some(response) = redis::get_result(&mut conn, &job_id)
            .await
            .context("Failed to read job result")?
        {
            print_response(&response);
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!(
                "No result for job {} after {} seconds; it may still be queued",
                job_id,
                options.wait_secs
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn print_response(response: &JobResponse) {
    let result = &response.result;
    let icon = match result.status {
        ExecutionStatus::Success => "✅",
        ExecutionStatus::Failed => "❌",
        ExecutionStatus::Timeout => "⏱️ ",
    };
    println!(
        "\n{} {} (exit code {}) on {} in {} ms",
        icon, result.status, result.exit_code, response.runtime, response.execution_time_ms
    );
    if let Some(category) = &response.error_category {
        println!("🏷️  Category: {}", category);
    }
    if let Some(log_id) = &response.log_id {
        println!("📝 Log: {}", log_id);
    }
    if let Some(session_id) = &response.session_id {
        println!("🔗 Session: {}", session_id);
    }
    if !response.output_files.is_empty() {
        println!("📂 Outputs: {}", response.output_files.join(", "));
    }
    if !result.stdout.is_empty() {
        println!("\n--- stdout ---\n{}", result.stdout.trim_end());
    }
    let errors = result.error_text();
    if !result.is_success() && !errors.is_empty() {
        println!("\n--- stderr ---\n{}", errors.trim_end());
    }
}

fn open_store(logs_dir: &Path) -> Result<ExecutionLogStore> {
    ExecutionLogStore::open(logs_dir)
        .with_context(|| format!("Failed to open execution logs at {}", logs_dir.display()))
}

fn analyze(store: &ExecutionLogStore, requirements: &Path) -> Result<Analysis> {
    let manifest = PackageManifest::new(requirements, Duration::from_secs(60));
    LogAnalyzer::new(store)
        .with_manifest(&manifest)
        .analyze_at(chrono::Local::now())
}

/// Print the success/failure summary
pub fn summary(logs_dir: &Path, requirements: &Path) -> Result<()> {
    let store = open_store(logs_dir)?;
    let analysis = analyze(&store, requirements)?;
    let s = &analysis.summary;

    println!("📊 Execution Summary\n");
    println!("{:<28} {}", "Total failures:", s.total_failures);
    println!("{:<28} {}", "Total successes:", s.total_successes);
    println!("{:<28} {}", "Fixed failures:", s.fixed_failures);
    println!("{:<28} {}", "Unfixed failures:", s.unfixed_failures);
    println!("{:<28} {:.1}%", "Overall success rate:", s.overall_success_rate);
    println!(
        "{:<28} {:.1}% ({} attempts)",
        "Success rate (last 7 days):", s.recent_success_rate_7d, s.recent_attempts_7d
    );

    if !analysis.recommendations.is_empty() {
        println!("\n💡 Recommendations:");
        for rec in &analysis.recommendations {
            println!("  - {}", rec);
        }
    }
    Ok(())
}

/// Show error patterns and the most common errors
pub fn errors(logs_dir: &Path, limit: usize, requirements: &Path) -> Result<()> {
    let store = open_store(logs_dir)?;
    let analysis = analyze(&store, requirements)?;

    if analysis.error_patterns.is_empty() {
        println!("No failures logged.");
        return Ok(());
    }

    println!("📋 Error Categories:\n");
    println!("{:<24} {:>6}", "CATEGORY", "COUNT");
    println!("{}", "─".repeat(31));
    for pattern in &analysis.error_patterns {
        println!("{:<24} {:>6}", pattern.category.as_str(), pattern.count);
    }

    println!("\n🔥 Most Common Errors:\n");
    for err in analysis.common_errors.iter().take(limit) {
        println!(
            "  [{}x, {:.0}% fixed] {}",
            err.count,
            err.fix_rate,
            preview(&err.error, 100)
        );
    }

    if !analysis.missing_modules.is_empty() {
        println!("\n📦 Missing Modules:\n");
        for module in &analysis.missing_modules {
            let state = if module.available { "now installed" } else { "not installed" };
            println!(
                "  {:<20} {:>4}x  pip: {:<28} {}",
                module.module, module.count, module.suggested_package, state
            );
        }
    }
    Ok(())
}

/// List failures that were never fixed
pub fn unfixed(logs_dir: &Path, limit: usize) -> Result<()> {
    let store = open_store(logs_dir)?;
    let failures = store.unfixed_failures()?;

    if failures.is_empty() {
        println!("✅ No unfixed failures.");
        return Ok(());
    }

    println!("❌ Unfixed Failures ({} total):\n", failures.len());
    for log in failures.iter().take(limit) {
        print_failure_line(log);
    }
    if failures.len() > limit {
        println!("\n  ... {} more", failures.len() - limit);
    }
    Ok(())
}

fn print_failure_line(log: &ExecutionLog) {
    let category = log
        .error_category
        .map(|c| c.as_str())
        .unwrap_or("unknown");
    println!(
        "  {}  {:<20} {}",
        log.timestamp.format("%Y-%m-%d %H:%M:%S"),
        category,
        log.log_id
    );
    if let Some(message) = &log.error_message {
        println!("      {}", preview(message, 100));
    }
}

/// Show one retry session and its attempts
pub fn session(logs_dir: &Path, session_id: &str) -> Result<()> {
    let store = open_store(logs_dir)?;
    let Some(record) = store.get_session(session_id)? else {
        bail!("Session '{}' not found", session_id);
    };

    println!("🔗 Session {}", record.session_id);
    println!("   Status:  {:?}", record.status);
    println!("   Created: {}", record.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(resolved_at) = record.resolved_at {
        println!("   Resolved: {}", resolved_at.format("%Y-%m-%d %H:%M:%S"));
    }

    println!("\n   Attempts:");
    for (idx, attempt) in record.attempts.iter().enumerate() {
        let detail = store
            .get_log(&attempt.log_id)?
            .and_then(|log| log.error_message)
            .map(|m| preview(&m, 80))
            .unwrap_or_default();
        println!(
            "   {}. {} {:?} {} {}",
            idx + 1,
            attempt.timestamp.format("%H:%M:%S"),
            attempt.status,
            attempt.log_id,
            detail
        );
    }
    Ok(())
}

/// Run the full analysis and write it as JSON
pub fn export(logs_dir: &Path, output: Option<&Path>, requirements: &Path) -> Result<()> {
    let store = open_store(logs_dir)?;
    let manifest = PackageManifest::new(requirements, Duration::from_secs(60));
    let analyzer = LogAnalyzer::new(&store).with_manifest(&manifest);
    let analysis = analyzer.analyze_all()?;

    let path = match output {
        Some(path) => {
            let json = serde_json::to_string_pretty(&analysis)?;
            fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
            path.to_path_buf()
        }
        None => analyzer.snapshot_path(),
    };
    println!("✅ Analysis written to {}", path.display());
    Ok(())
}

/// List packages installed in the sandbox image
pub fn packages(requirements: &Path) -> Result<()> {
    let packages = manifest::read_requirements(requirements)?;
    if packages.is_empty() {
        println!("No packages listed in {}", requirements.display());
        return Ok(());
    }

    println!("📦 Sandbox Packages ({}):\n", requirements.display());
    println!("{:<32} {}", "PACKAGE", "VERSION");
    println!("{}", "─".repeat(44));
    for (name, version) in &packages {
        println!("{:<32} {}", name, version);
    }
    println!("\n✅ Total: {} package(s)", packages.len());
    Ok(())
}

/// Delete all execution logs
pub fn purge(logs_dir: &Path, yes: bool) -> Result<()> {
    if !yes {
        print!(
            "⚠️  This will delete every failure, success, session and analysis under {}\n",
            logs_dir.display()
        );
        print!("\nContinue? (y/N): ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("❌ Aborted");
            return Ok(());
        }
    }

    let store = open_store(logs_dir)?;
    let removed = store.purge()?;
    println!("🗑️  Purged {} execution log(s)", removed);
    Ok(())
}

/// First line of `text`, cut to `max` characters.
fn preview(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() <= max {
        return line.to_string();
    }
    let cut: String = line.chars().take(max).collect();
    format!("{}...", cut)
}
