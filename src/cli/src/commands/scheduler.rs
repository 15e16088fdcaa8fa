//! Scheduler commands.

use anyhow::Result;
use clap::Subcommand;
use serde_json::Value;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum SchedulerCommands {
    /// Trigger engine availability and job counts
    Status,

    /// Reconnect the trigger engine and re-register every active job
    Reinit,
}

fn print_status(status: &Value) {
    let available = status["available"].as_bool().unwrap_or(false);
    output::print_header("Scheduler");
    output::print_detail("Engine", status["engine"].as_str().unwrap_or("?"));
    output::print_detail("Available", &available.to_string());
    output::print_detail("Running", &status["running"].as_bool().unwrap_or(false).to_string());
    output::print_detail("Jobs", &status["job_count"].to_string());
    output::print_detail("Scheduled", &status["scheduled_count"].to_string());
    if !available {
        output::print_warning(&format!(
            "Registry-only mode: {}",
            status["reason"].as_str().unwrap_or("trigger engine unavailable")
        ));
    }
}

pub async fn execute(cmd: SchedulerCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status: Value = match cmd {
        SchedulerCommands::Status => client.get("/api/scheduler/status").await?,
        SchedulerCommands::Reinit => client.post("/api/scheduler/reinitialize", &Value::Null).await?,
    };
    match format {
        OutputFormat::Table => print_status(&status),
        _ => output::print_item(&status, format)?,
    }
    Ok(())
}
