//! Backend commands.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tabled::Tabled;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, or_dash, OutputFormat};

#[derive(Subcommand)]
pub enum BackendCommands {
    /// Backends available for this platform
    List,

    /// Installed backends
    Installed,

    /// Download and install a backend
    Install {
        /// Backend id (cpu, cuda, vulkan, hip, sycl, metal, opencl-adreno)
        id: String,

        /// Return after queueing instead of following progress
        #[arg(long)]
        no_wait: bool,
    },

    /// Remove an installed backend
    Uninstall { id: String },

    /// Compare installed versions with the latest release
    Updates,
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
struct BackendInfo {
    id: String,
    name: String,
    description: String,
    installed: bool,
    #[serde(default)]
    installed_version: Option<String>,
    size_mb: u32,
    requires_gpu: bool,
}

#[derive(Tabled)]
struct BackendRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Size (MB)")]
    size_mb: u32,
    #[tabled(rename = "GPU")]
    requires_gpu: bool,
    #[tabled(rename = "Installed")]
    installed: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct InstalledBackend {
    backend_id: String,
    version: String,
    #[serde(default)]
    cuda_version: Option<String>,
    asset_name: String,
    path: String,
    installed_date: DateTime<Utc>,
}

#[derive(Tabled)]
struct InstalledRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "CUDA")]
    cuda: String,
    #[tabled(rename = "Installed")]
    installed_date: String,
    #[tabled(rename = "Path")]
    path: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TaskAccepted {
    pub task_id: Uuid,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub status: String,
    pub progress: u8,
    pub message: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Poll a background task until it finishes, drawing its progress.
pub async fn follow_task(client: &ApiClient, task_id: Uuid, label: &str) -> Result<TaskRecord> {
    let pb = output::progress_bar(label)?;
    loop {
        let record: TaskRecord = client.get(&format!("/api/tasks/{}", task_id)).await?;
        pb.set_position(u64::from(record.progress));
        pb.set_message(format!("{}: {}", label, record.message));
        match record.status.as_str() {
            "completed" => {
                pb.finish_with_message(format!("{}: done", label));
                return Ok(record);
            }
            "failed" => {
                pb.abandon_with_message(format!("{}: failed", label));
                return Ok(record);
            }
            _ => tokio::time::sleep(Duration::from_millis(500)).await,
        }
    }
}

pub async fn execute(cmd: BackendCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        BackendCommands::List => {
            let backends: std::collections::BTreeMap<String, BackendInfo> = client.get("/api/backends").await?;
            let rows: Vec<BackendRow> = backends
                .values()
                .map(|b| BackendRow {
                    id: b.id.clone(),
                    name: b.name.clone(),
                    size_mb: b.size_mb,
                    requires_gpu: b.requires_gpu,
                    installed: if b.installed {
                        or_dash(b.installed_version.as_deref())
                    } else {
                        "no".to_string()
                    },
                })
                .collect();
            output::print_list(&rows, &backends, format)?;
        }

        BackendCommands::Installed => {
            let installed: Vec<InstalledBackend> = client.get("/api/backends/installed").await?;
            let rows: Vec<InstalledRow> = installed
                .iter()
                .map(|b| InstalledRow {
                    id: b.backend_id.clone(),
                    version: b.version.clone(),
                    cuda: or_dash(b.cuda_version.as_deref()),
                    installed_date: b.installed_date.format("%Y-%m-%d %H:%M").to_string(),
                    path: b.path.clone(),
                })
                .collect();
            output::print_list(&rows, &installed, format)?;
        }

        BackendCommands::Install { id, no_wait } => {
            let accepted: TaskAccepted = client
                .post(&format!("/api/backends/{}/install", id), &Value::Null)
                .await?;
            if no_wait {
                return if format.is_table() {
                    output::print_success(&format!("Install of {} queued as task {}", id, accepted.task_id));
                    Ok(())
                } else {
                    output::print_item(&accepted, format)
                };
            }

            let record = follow_task(client, accepted.task_id, &id).await?;
            if !format.is_table() {
                return output::print_item(&record, format);
            }
            match (record.status.as_str(), &record.result) {
                ("completed", Some(result)) => {
                    output::print_success(&format!(
                        "{} {} installed",
                        id,
                        result.get("version").and_then(Value::as_str).unwrap_or("?")
                    ));
                    if let Some(path) = result.get("path").and_then(Value::as_str) {
                        output::print_detail("Path", path);
                    }
                }
                _ => anyhow::bail!(
                    "Install of {} failed: {}",
                    id,
                    record.error.as_deref().unwrap_or("unknown error")
                ),
            }
        }

        BackendCommands::Uninstall { id } => {
            let outcome: Value = client
                .post(&format!("/api/backends/{}/uninstall", id), &Value::Null)
                .await?;
            if !format.is_table() {
                return output::print_item(&outcome, format);
            }
            match outcome.get("status").and_then(Value::as_str) {
                Some("removed") => output::print_success(&format!("Removed {}", id)),
                _ => output::print_info(&format!("{} is not installed", id)),
            }
        }

        BackendCommands::Updates => {
            let report: Value = client.get("/api/backends/updates").await?;
            if !format.is_table() {
                return output::print_item(&report, format);
            }
            let latest = report["latest_version"].as_str().unwrap_or("?");
            let updates = report["updates_available"].as_array().cloned().unwrap_or_default();
            if updates.is_empty() {
                output::print_success(&format!("All installed backends are at {}", latest));
            }
            for update in updates {
                output::print_warning(&format!(
                    "{}: {} -> {}",
                    update["id"].as_str().unwrap_or("?"),
                    update["current_version"].as_str().unwrap_or("?"),
                    latest
                ));
            }
        }
    }

    Ok(())
}
