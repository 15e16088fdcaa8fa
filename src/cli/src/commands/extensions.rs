//! Extension catalog commands.

use anyhow::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tabled::Tabled;

use super::backends::{follow_task, TaskAccepted};
use crate::client::ApiClient;
use crate::output::{self, or_dash, OutputFormat};

#[derive(Subcommand)]
pub enum ExtensionCommands {
    /// List catalog entries
    List {
        /// engine or package_set
        #[arg(long = "type")]
        kind: Option<String>,

        #[arg(long)]
        installed: Option<bool>,

        #[arg(long)]
        compatible: Option<bool>,
    },

    /// Re-detect toolkits
    Refresh,

    /// Install an extension into an existing environment
    Install {
        id: String,

        /// Target environment
        #[arg(long = "env")]
        venv_name: String,

        /// Model the runtime is installed for
        #[arg(long)]
        model_id: Option<String>,
    },
}

#[derive(Debug, Deserialize, Serialize)]
struct ExtensionInfo {
    id: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    compatible: bool,
    #[serde(default)]
    compatibility_message: Option<String>,
    installed_environments: Vec<String>,
}

#[derive(Tabled)]
struct ExtensionRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    kind: String,
    #[tabled(rename = "Compatible")]
    compatible: String,
    #[tabled(rename = "Installed in")]
    installed_in: String,
}

pub async fn execute(cmd: ExtensionCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        ExtensionCommands::List {
            kind,
            installed,
            compatible,
        } => {
            let mut query = Vec::new();
            if let Some(k) = kind {
                query.push(format!("type={}", k));
            }
            if let Some(i) = installed {
                query.push(format!("installed={}", i));
            }
            if let Some(c) = compatible {
                query.push(format!("compatible={}", c));
            }
            let path = if query.is_empty() {
                "/api/extensions".to_string()
            } else {
                format!("/api/extensions?{}", query.join("&"))
            };

            let extensions: Vec<ExtensionInfo> = client.get(&path).await?;
            let rows: Vec<ExtensionRow> = extensions
                .iter()
                .map(|e| ExtensionRow {
                    id: e.id.clone(),
                    name: e.name.clone(),
                    kind: e.kind.clone(),
                    compatible: if e.compatible {
                        "yes".to_string()
                    } else {
                        format!("no ({})", or_dash(e.compatibility_message.as_deref()))
                    },
                    installed_in: if e.installed_environments.is_empty() {
                        "-".to_string()
                    } else {
                        e.installed_environments.join(", ")
                    },
                })
                .collect();
            output::print_list(&rows, &extensions, format)?;
        }

        ExtensionCommands::Refresh => {
            let toolkits: serde_json::Map<String, Value> = client.post("/api/extensions/refresh", &Value::Null).await?;
            if !format.is_table() {
                return output::print_item(&toolkits, format);
            }
            output::print_header("Toolkits");
            for (backend, status) in &toolkits {
                let available = status["available"].as_bool().unwrap_or(false);
                let message = status["message"].as_str().unwrap_or("");
                let mark = if available { "available" } else { "missing" };
                output::print_detail(backend, &format!("{} - {}", mark, message));
            }
        }

        ExtensionCommands::Install {
            id,
            venv_name,
            model_id,
        } => {
            let accepted: TaskAccepted = client
                .post(
                    &format!("/api/extensions/{}/install", id),
                    &json!({ "venv_name": venv_name, "model_id": model_id }),
                )
                .await?;
            let record = follow_task(client, accepted.task_id, &id).await?;
            if !format.is_table() {
                return output::print_item(&record, format);
            }

            let Some(result) = record.result else {
                anyhow::bail!("Install failed: {}", record.error.as_deref().unwrap_or("unknown error"));
            };
            // Runtime outcomes carry a status; package reports carry success.
            match result["status"].as_str() {
                Some("verified") => output::print_success(&format!("{} verified in {}", id, venv_name)),
                Some("no_gpu_support") => {
                    output::print_warning(result["warning"].as_str().unwrap_or("Installed without GPU support"))
                }
                Some("toolkit_missing") => {
                    output::print_error(result["message"].as_str().unwrap_or("Required toolkit is missing"));
                    if let Some(url) = result["install_url"].as_str() {
                        output::print_detail("Install from", url);
                    }
                }
                _ if result["success"].as_bool() == Some(true) => {
                    output::print_success(&format!("{} installed into {}", id, venv_name))
                }
                _ => output::print_item(&result, format)?,
            }
        }
    }

    Ok(())
}
