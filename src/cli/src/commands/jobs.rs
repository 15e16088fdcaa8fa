//! Scheduled job commands.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, or_dash, OutputFormat};

#[derive(Subcommand)]
pub enum JobCommands {
    /// List jobs
    List {
        /// Only active (true) or paused (false) jobs
        #[arg(long)]
        active: Option<bool>,

        /// Filter by schedule type (manual, once, interval, cron)
        #[arg(long)]
        schedule_type: Option<String>,

        /// Filter by module
        #[arg(long)]
        module: Option<String>,
    },

    /// Show one job
    Get { id: i64 },

    /// Create a job from a JSON or YAML definition
    Create {
        #[arg(short, long)]
        file: String,
    },

    /// Apply a partial JSON or YAML update to a job
    Update {
        id: i64,
        #[arg(short, long)]
        file: String,
    },

    /// Delete a job
    Delete {
        id: i64,
        /// Keep the execution history
        #[arg(long)]
        keep_history: bool,
    },

    /// Run a job now
    Run { id: i64 },

    /// Ask a running job to stop
    Stop { id: i64 },

    /// Scheduling and run state of a job
    Status { id: i64 },

    /// Execution history of a job
    Executions {
        id: i64,
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
struct JobInfo {
    id: i64,
    name: String,
    schedule_type: String,
    #[serde(default)]
    schedule_config: Value,
    is_active: bool,
    is_running: bool,
    #[serde(default)]
    last_status: Option<String>,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    last_run_at: Option<String>,
    #[serde(default)]
    next_run_at: Option<String>,
    #[serde(default)]
    run_count: i64,
    #[serde(default)]
    success_count: i64,
    #[serde(default)]
    failure_count: i64,
}

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Schedule")]
    schedule: String,
    #[tabled(rename = "Active")]
    active: bool,
    #[tabled(rename = "Last status")]
    last_status: String,
    #[tabled(rename = "Next run")]
    next_run: String,
    #[tabled(rename = "Runs (ok/failed)")]
    runs: String,
}

impl From<&JobInfo> for JobRow {
    fn from(job: &JobInfo) -> Self {
        let last_status = if job.is_running {
            "running".to_string()
        } else {
            or_dash(job.last_status.as_deref())
        };
        Self {
            id: job.id,
            name: job.name.clone(),
            schedule: job.schedule_type.clone(),
            active: job.is_active,
            last_status: output::colored_status(&last_status),
            next_run: or_dash(job.next_run_at.as_deref()),
            runs: format!("{} ({}/{})", job.run_count, job.success_count, job.failure_count),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct ExecutionInfo {
    id: i64,
    status: String,
    trigger: String,
    #[serde(default)]
    attempt: u32,
    started_at: DateTime<Utc>,
    #[serde(default)]
    duration_seconds: Option<f64>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Tabled)]
struct ExecutionRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Trigger")]
    trigger: String,
    #[tabled(rename = "Attempt")]
    attempt: u32,
    #[tabled(rename = "Started")]
    started_at: String,
    #[tabled(rename = "Duration (s)")]
    duration: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// Job definitions are YAML; JSON parses as YAML too.
fn read_definition(path: &str) -> Result<Value> {
    let content = std::fs::read_to_string(Path::new(path)).with_context(|| format!("Failed to read {}", path))?;
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path))
}

pub async fn execute(cmd: JobCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        JobCommands::List {
            active,
            schedule_type,
            module,
        } => {
            let mut query = Vec::new();
            if let Some(active) = active {
                query.push(format!("is_active={}", active));
            }
            if let Some(t) = schedule_type {
                query.push(format!("schedule_type={}", t));
            }
            if let Some(m) = module {
                query.push(format!("module={}", m));
            }
            let path = if query.is_empty() {
                "/api/jobs".to_string()
            } else {
                format!("/api/jobs?{}", query.join("&"))
            };

            let jobs: Vec<JobInfo> = client.get(&path).await?;
            let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
            output::print_list(&rows, &jobs, format)?;
        }

        JobCommands::Get { id } => {
            let job: Value = client.get(&format!("/api/jobs/{}", id)).await?;
            output::print_item(&job, format)?;
        }

        JobCommands::Create { file } => {
            let definition = read_definition(&file)?;
            let job: JobInfo = client.post("/api/jobs", &definition).await?;
            if format.is_table() {
                output::print_success(&format!("Created job {} ({})", job.id, job.name));
                output::print_detail("Schedule", &job.schedule_type);
                output::print_detail("Next run", &or_dash(job.next_run_at.as_deref()));
            } else {
                output::print_item(&job, format)?;
            }
        }

        JobCommands::Update { id, file } => {
            let update = read_definition(&file)?;
            let job: JobInfo = client.put(&format!("/api/jobs/{}", id), &update).await?;
            if format.is_table() {
                output::print_success(&format!("Updated job {} ({})", job.id, job.name));
            } else {
                output::print_item(&job, format)?;
            }
        }

        JobCommands::Delete { id, keep_history } => {
            let path = format!("/api/jobs/{}?keep_history={}", id, keep_history);
            let _: Value = client.delete(&path).await?;
            output::print_success(&format!("Deleted job {}", id));
        }

        JobCommands::Run { id } => {
            let started: Value = client.post(&format!("/api/jobs/{}/run", id), &Value::Null).await?;
            if format.is_table() {
                output::print_success(&format!(
                    "Job {} started (execution {})",
                    id,
                    started.get("execution_id").unwrap_or(&Value::Null)
                ));
            } else {
                output::print_item(&started, format)?;
            }
        }

        JobCommands::Stop { id } => {
            let report: Value = client.post(&format!("/api/jobs/{}/stop", id), &Value::Null).await?;
            if !format.is_table() {
                return output::print_item(&report, format);
            }
            match report.get("outcome").and_then(Value::as_str) {
                Some("stopped") => output::print_success(&format!(
                    "Stop requested for execution {}",
                    report.get("execution_id").unwrap_or(&Value::Null)
                )),
                _ => output::print_info(&format!("Job {} is not running", id)),
            }
        }

        JobCommands::Status { id } => {
            let status: Value = client.get(&format!("/api/jobs/{}/status", id)).await?;
            if !format.is_table() {
                return output::print_item(&status, format);
            }
            let job: JobInfo = serde_json::from_value(status["job"].clone())?;
            output::print_header(&format!("Job {} ({})", job.id, job.name));
            output::print_detail("State", &output::colored_status(status["state"].as_str().unwrap_or("?")));
            output::print_detail("Schedule", &format!("{} {}", job.schedule_type, job.schedule_config));
            output::print_detail("Next run", &or_dash(status["next_run_time"].as_str()));
            output::print_detail("Pending retry", &or_dash(status["pending_retry_at"].as_str()));
            output::print_detail("Last run", &or_dash(job.last_run_at.as_deref()));
            output::print_detail("Last status", &or_dash(job.last_status.as_deref()));
            if let Some(err) = &job.last_error {
                output::print_detail("Last error", err);
            }
        }

        JobCommands::Executions { id, limit } => {
            let executions: Vec<ExecutionInfo> = client
                .get(&format!("/api/jobs/{}/executions?limit={}", id, limit))
                .await?;
            let rows: Vec<ExecutionRow> = executions
                .iter()
                .map(|e| ExecutionRow {
                    id: e.id,
                    status: output::colored_status(&e.status),
                    trigger: e.trigger.clone(),
                    attempt: e.attempt,
                    started_at: e.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    duration: e.duration_seconds.map(|d| format!("{:.2}", d)).unwrap_or_else(|| "-".into()),
                    error: or_dash(e.error_message.as_deref()),
                })
                .collect();
            output::print_list(&rows, &executions, format)?;
        }
    }

    Ok(())
}
