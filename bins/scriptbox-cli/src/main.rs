mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "scriptbox-cli")]
#[command(about = "Scriptbox CLI - Submit scripts and inspect execution logs", long_about = None)]
struct Cli {
    /// Execution log directory
    #[arg(long, env = "LOGS_DIR", default_value = "logs", global = true)]
    logs_dir: PathBuf,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379", global = true)]
    redis_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a script for execution and wait for its result
    Submit {
        /// Python script to run
        file: PathBuf,

        /// Input image copied to /input
        #[arg(short, long)]
        image: Option<PathBuf>,

        /// Timeout in seconds (worker default when omitted)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Session to attach this attempt to
        #[arg(short, long)]
        session: Option<String>,

        /// Log id of the attempt this one retries
        #[arg(short, long)]
        previous: Option<String>,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "900")]
        wait: u64,
    },

    /// Print the success/failure summary
    Summary {
        /// requirements.txt used to check whether missing modules are now installed
        #[arg(short, long, default_value = commands::DEFAULT_REQUIREMENTS)]
        requirements: PathBuf,
    },

    /// Show error patterns and the most common errors
    Errors {
        /// Number of common errors to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// requirements.txt used to check whether missing modules are now installed
        #[arg(short, long, default_value = commands::DEFAULT_REQUIREMENTS)]
        requirements: PathBuf,
    },

    /// List failures that were never fixed
    Unfixed {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one retry session and its attempts
    Session {
        /// Session id
        id: String,
    },

    /// Run the full analysis and write it as JSON
    Export {
        /// Output file (defaults to the analysis snapshot in the log directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// requirements.txt used to check whether missing modules are now installed
        #[arg(short, long, default_value = commands::DEFAULT_REQUIREMENTS)]
        requirements: PathBuf,
    },

    /// List packages installed in the sandbox image
    Packages {
        /// requirements.txt of the runner image
        #[arg(short, long, default_value = commands::DEFAULT_REQUIREMENTS)]
        requirements: PathBuf,
    },

    /// Delete all execution logs
    Purge {
        /// Skip confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            file,
            image,
            timeout,
            session,
            previous,
            wait,
        } => {
            let options = commands::SubmitOptions {
                image,
                timeout_secs: timeout,
                session_id: session,
                previous_attempt_id: previous,
                wait_secs: wait,
            };
            commands::submit(&cli.redis_url, &file, options).await?;
        }
        Commands::Summary { requirements } => commands::summary(&cli.logs_dir, &requirements)?,
        Commands::Errors { limit, requirements } => {
            commands::errors(&cli.logs_dir, limit, &requirements)?
        }
        Commands::Unfixed { limit } => commands::unfixed(&cli.logs_dir, limit)?,
        Commands::Session { id } => commands::session(&cli.logs_dir, &id)?,
        Commands::Export {
            output,
            requirements,
        } => commands::export(&cli.logs_dir, output.as_deref(), &requirements)?,
        Commands::Packages { requirements } => commands::packages(&requirements)?,
        Commands::Purge { yes } => commands::purge(&cli.logs_dir, yes)?,
    }

    Ok(())
}
