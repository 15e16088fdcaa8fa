//! Runforge CLI - manage scheduled jobs, inference backends and environments
//! through a running Runforge server.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use commands::{backends, config, envs, extensions, health, jobs, scheduler};
use output::OutputFormat;

const DEFAULT_API_URL: &str = "http://localhost:8089";

/// Runforge - job scheduler and inference backend manager
#[derive(Parser)]
#[command(
    name = "runforge",
    version,
    about = "Runforge - job scheduler and inference backend manager",
    long_about = "CLI for managing Runforge scheduled jobs, llama.cpp backends, Python environments and extensions.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format [default: table, or `output` from the CLI config]
    #[arg(short, long, global = true)]
    output: Option<OutputFormat>,

    /// API server URL
    #[arg(long, global = true, env = "RUNFORGE_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scheduled jobs
    #[command(subcommand)]
    Jobs(jobs::JobCommands),

    /// Inference backends
    #[command(subcommand)]
    Backends(backends::BackendCommands),

    /// Python environments
    #[command(subcommand)]
    Envs(envs::EnvCommands),

    /// Extension catalog
    #[command(subcommand)]
    Extensions(extensions::ExtensionCommands),

    /// Scheduler state
    #[command(subcommand)]
    Scheduler(scheduler::SchedulerCommands),

    /// Check server health
    Health(health::HealthArgs),

    /// CLI configuration
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let format = cli
        .output
        .or_else(|| config::load_value("output").and_then(|v| OutputFormat::from_str(&v, true).ok()))
        .unwrap_or_default();

    let api_url = cli
        .api_url
        .clone()
        .or_else(|| config::load_value("api-url"))
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let client = client::ApiClient::new(&api_url)?;

    let result = match cli.command {
        Commands::Jobs(cmd) => jobs::execute(cmd, &client, format).await,
        Commands::Backends(cmd) => backends::execute(cmd, &client, format).await,
        Commands::Envs(cmd) => envs::execute(cmd, &client, format).await,
        Commands::Extensions(cmd) => extensions::execute(cmd, &client, format).await,
        Commands::Scheduler(cmd) => scheduler::execute(cmd, &client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
