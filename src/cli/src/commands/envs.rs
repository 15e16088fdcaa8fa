//! Environment commands.

use anyhow::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tabled::Tabled;

use super::backends::{follow_task, TaskAccepted};
use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum EnvCommands {
    /// List environments
    List,

    /// Create an environment
    Create { name: String },

    /// Delete an environment
    Delete { name: String },

    /// Packages installed in an environment
    Packages { name: String },

    /// Install packages into an environment
    Install {
        name: String,

        /// Package specs, e.g. `requests` or `numpy>=1.26`
        #[arg(required = true)]
        packages: Vec<String>,
    },
}

#[derive(Debug, Deserialize, Serialize)]
struct EnvironmentInfo {
    name: String,
    path: String,
    package_count: usize,
    size_bytes: u64,
}

#[derive(Tabled)]
struct EnvironmentRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Packages")]
    packages: usize,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Path")]
    path: String,
}

#[derive(Debug, Deserialize, Serialize, Tabled)]
struct PackageRow {
    #[tabled(rename = "Package")]
    name: String,
    #[tabled(rename = "Version")]
    version: String,
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}

pub async fn execute(cmd: EnvCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        EnvCommands::List => {
            let envs: Vec<EnvironmentInfo> = client.get("/api/environments").await?;
            let rows: Vec<EnvironmentRow> = envs
                .iter()
                .map(|e| EnvironmentRow {
                    name: e.name.clone(),
                    packages: e.package_count,
                    size: human_size(e.size_bytes),
                    path: e.path.clone(),
                })
                .collect();
            output::print_list(&rows, &envs, format)?;
        }

        EnvCommands::Create { name } => {
            let env: EnvironmentInfo = client.post("/api/environments", &json!({ "name": name })).await?;
            if format.is_table() {
                output::print_success(&format!("Created environment {}", env.name));
                output::print_detail("Path", &env.path);
            } else {
                output::print_item(&env, format)?;
            }
        }

        EnvCommands::Delete { name } => {
            let _: Value = client.delete(&format!("/api/environments/{}", name)).await?;
            output::print_success(&format!("Deleted environment {}", name));
        }

        EnvCommands::Packages { name } => {
            let packages: Vec<PackageRow> = client.get(&format!("/api/environments/{}/packages", name)).await?;
            output::print_list(&packages, &packages, format)?;
        }

        EnvCommands::Install { name, packages } => {
            let accepted: TaskAccepted = client
                .post(
                    &format!("/api/environments/{}/packages", name),
                    &json!({ "packages": packages }),
                )
                .await?;
            let record = follow_task(client, accepted.task_id, &name).await?;
            if !format.is_table() {
                return output::print_item(&record, format);
            }

            let Some(report) = record.result else {
                anyhow::bail!("Install failed: {}", record.error.as_deref().unwrap_or("unknown error"));
            };
            for pkg in report["installed"].as_array().into_iter().flatten() {
                output::print_success(pkg.as_str().unwrap_or("?"));
            }
            if let Some(errors) = report["errors"].as_object() {
                for (pkg, err) in errors {
                    output::print_error(&format!("{}: {}", pkg, err.as_str().unwrap_or("?")));
                }
            }
        }
    }

    Ok(())
}
