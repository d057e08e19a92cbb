// ABOUTME: Entry point of the cmdb-exec command line tool
// ABOUTME: Parses arguments, loads .env, installs logging and dispatches subcommands

use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

mod commands;
mod scripts;

use commands::RunArgs;

#[derive(Parser)]
#[command(name = "cmdb-exec")]
#[command(about = "Run CMDB automation scripts in isolated sandboxes")]
#[command(version)]
struct Cli {
    /// Sandbox runtime to use (docker or process); overrides CMDB_EXECUTOR_RUNTIME
    #[arg(long, global = true)]
    runtime: Option<String>,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file and stream its output until it finishes
    Run {
        /// Path to the script
        script: PathBuf,

        /// Script parameter as KEY=VALUE (repeatable)
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Language when it cannot be inferred from the file extension
        #[arg(long)]
        language: Option<String>,

        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Memory limit in MB
        #[arg(long)]
        memory_mb: Option<u64>,

        /// CPU limit in cores
        #[arg(long)]
        cpu_cores: Option<f64>,

        /// Disk limit in MB
        #[arg(long)]
        disk_mb: Option<u64>,

        /// Allow network access inside the sandbox
        #[arg(long)]
        network: bool,

        /// Retry budget recorded on the execution
        #[arg(long)]
        max_retries: Option<u32>,

        /// Identity recorded as the executor
        #[arg(long, default_value = "cli")]
        executor: String,
    },
    /// Show one execution
    Status {
        execution_id: String,
    },
    /// Print the captured output of an execution
    Logs {
        execution_id: String,

        /// Only stdout
        #[arg(long, conflicts_with = "stderr")]
        stdout: bool,

        /// Only stderr
        #[arg(long)]
        stderr: bool,
    },
    /// List recent executions
    List {
        /// Maximum number of rows
        #[arg(long, default_value = "20")]
        limit: i64,

        /// Only executions in this status
        #[arg(long)]
        status: Option<String>,

        /// Only executions that have not finished
        #[arg(long, conflicts_with = "status")]
        active: bool,
    },
    /// Retry a failed, timed out or killed execution and wait for it
    Retry {
        execution_id: String,

        /// Why the retry was requested
        #[arg(long)]
        reason: Option<String>,
    },
    /// Mark unfinished executions of dead processes as KILLED and remove stray sandboxes.
    /// Only run this while no other cmdb-exec process is executing scripts.
    Reconcile,
    /// Show outcome metrics for the last hour and evaluate alerts
    Metrics,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();
    init_logging();

    let cli = Cli::parse();
    match handle_command(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            process::exit(1);
        }
    }
}

async fn handle_command(cli: Cli) -> anyhow::Result<i32> {
    let ctx = commands::Context::new(cli.runtime.as_deref(), cli.json)?;

    match cli.command {
        Commands::Run {
            script,
            params,
            language,
            timeout,
            memory_mb,
            cpu_cores,
            disk_mb,
            network,
            max_retries,
            executor,
        } => {
            commands::run(
                &ctx,
                RunArgs {
                    script,
                    params,
                    language,
                    timeout,
                    memory_mb,
                    cpu_cores,
                    disk_mb,
                    network,
                    max_retries,
                    executor,
                },
            )
            .await
        }
        Commands::Status { execution_id } => commands::status(&ctx, &execution_id).await,
        Commands::Logs {
            execution_id,
            stdout,
            stderr,
        } => commands::logs(&ctx, &execution_id, stdout, stderr).await,
        Commands::List {
            limit,
            status,
            active,
        } => commands::list(&ctx, limit, status.as_deref(), active).await,
        Commands::Retry {
            execution_id,
            reason,
        } => commands::retry(&ctx, &execution_id, reason).await,
        Commands::Reconcile => commands::reconcile(&ctx).await,
        Commands::Metrics => commands::metrics(&ctx).await,
    }
}
