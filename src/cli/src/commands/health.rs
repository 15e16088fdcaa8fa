//! Health check command.

use anyhow::Result;
use clap::Args;
use serde_json::Value;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include database and scheduler details
    #[arg(short, long)]
    detailed: bool,
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let body = client.get_raw("/api/health").await?;
    let health = body.get("data").cloned().unwrap_or(Value::Null);

    if !format.is_table() {
        return output::print_item(&health, format);
    }

    let status = health["status"].as_str().unwrap_or("unknown");
    output::print_header("System Health");
    output::print_detail("Status", &output::colored_status(status));
    output::print_detail("API URL", client.base_url());
    if let Some(version) = health["version"].as_str() {
        output::print_detail("Version", version);
    }

    if args.detailed {
        let db = &health["database"];
        output::print_header("Database");
        output::print_detail("Healthy", &db["healthy"].to_string());
        output::print_detail("Latency (ms)", &db["latency_ms"].to_string());
        output::print_detail("Pool size", &db["pool_size"].to_string());

        let scheduler = &health["scheduler"];
        output::print_header("Scheduler");
        output::print_detail("Available", &scheduler["available"].to_string());
        output::print_detail("Scheduled jobs", &scheduler["scheduled_count"].to_string());
    }

    if status == "healthy" {
        output::print_success("All systems operational");
    } else {
        output::print_error(&format!(
            "System status: {} ({})",
            status,
            body["error"].as_str().unwrap_or("no detail")
        ));
    }
    Ok(())
}
