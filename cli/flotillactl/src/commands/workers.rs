//! Worker commands.

use anyhow::Result;
use clap::Args;
use flotilla_reconcile::WorkerSpec;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_info, print_output, print_single, print_success, OutputFormat};
use crate::settings::build_config;

use super::CommandContext;

#[derive(Debug, Args)]
pub struct AddArgs {
    /// Worker id.
    id: String,

    /// Worker class (a built-in or a plugin name).
    #[arg(long = "class")]
    worker_class: String,

    /// Setting in format KEY=VALUE. VALUE is parsed as JSON when possible.
    /// Can be specified multiple times.
    #[arg(long = "set")]
    sets: Vec<String>,

    /// Settings as a JSON object. `--set` entries are applied on top.
    #[arg(long)]
    config: Option<String>,
}

#[derive(Debug, Args)]
pub struct UpdateArgs {
    /// Worker id.
    id: String,

    /// Setting in format KEY=VALUE. Can be specified multiple times.
    #[arg(long = "set")]
    sets: Vec<String>,

    /// Settings as a JSON object. `--set` entries are applied on top.
    #[arg(long)]
    config: Option<String>,
}

#[derive(Debug, Args)]
pub struct RemoveArgs {
    /// Worker id.
    id: String,
}

#[derive(Debug, Args)]
pub struct GetArgs {
    /// Worker id.
    id: String,
}

/// Table row for a worker entry.
#[derive(Debug, Serialize, Tabled)]
struct WorkerRow {
    #[tabled(rename = "ID")]
    id: String,

    #[tabled(rename = "Class")]
    worker_class: String,

    #[tabled(rename = "Settings")]
    settings: String,
}

impl From<&WorkerSpec> for WorkerRow {
    fn from(spec: &WorkerSpec) -> Self {
        Self {
            id: spec.id.clone(),
            worker_class: spec.worker_class.clone(),
            settings: serde_json::Value::Object(spec.settings.clone()).to_string(),
        }
    }
}

/// Add a worker to the desired configuration.
pub async fn add(ctx: CommandContext, args: AddArgs) -> Result<()> {
    let config = build_config(args.config.as_deref(), &args.sets)?;
    let spec = ctx
        .client()?
        .add_worker(&args.id, config, &args.worker_class)
        .await?;

    match ctx.format {
        OutputFormat::Json => print_single(&spec, ctx.format),
        OutputFormat::Table => print_success(&format!(
            "Added worker '{}' ({})",
            spec.id, spec.worker_class
        )),
    }
    Ok(())
}

/// Replace a worker's settings.
pub async fn update(ctx: CommandContext, args: UpdateArgs) -> Result<()> {
    let config = build_config(args.config.as_deref(), &args.sets)?;
    let spec = ctx.client()?.update_worker(&args.id, config).await?;

    match ctx.format {
        OutputFormat::Json => print_single(&spec, ctx.format),
        OutputFormat::Table => print_success(&format!("Updated worker '{}'", spec.id)),
    }
    Ok(())
}

/// Remove a worker. Removing an absent worker is not an error.
pub async fn remove(ctx: CommandContext, args: RemoveArgs) -> Result<()> {
    let removed = ctx.client()?.remove_worker(&args.id).await?;

    match ctx.format {
        OutputFormat::Json => print_single(
            &serde_json::json!({ "id": args.id, "removed": removed }),
            ctx.format,
        ),
        OutputFormat::Table if removed => {
            print_success(&format!("Removed worker '{}'", args.id))
        }
        OutputFormat::Table => print_info(&format!(
            "Worker '{}' is not configured; nothing changed",
            args.id
        )),
    }
    Ok(())
}

/// List every configured worker.
pub async fn list(ctx: CommandContext) -> Result<()> {
    let workers = ctx.client()?.list_workers().await?;

    match ctx.format {
        OutputFormat::Table => {
            let rows: Vec<WorkerRow> = workers.iter().map(WorkerRow::from).collect();
            print_output(&rows, ctx.format);
        }
        OutputFormat::Json => print_single(&workers, ctx.format),
    }
    Ok(())
}

/// Show one worker.
pub async fn get(ctx: CommandContext, args: GetArgs) -> Result<()> {
    let spec = ctx.client()?.get_worker(&args.id).await?;
    print_single(&spec, ctx.format);
    Ok(())
}
