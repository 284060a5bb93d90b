use std::time::Duration;

use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use strata::{MigrationHandle, MigrationState, MigrationStatus, TargetConfig, TieredMemory};

use crate::commands::parse_id;
use crate::error::CliResult;
use crate::output::{OutputFormat, format_timestamp, print_json, truncate_string};

#[derive(Parser)]
pub struct MigrateCommand {
    #[clap(subcommand)]
    pub command: MigrateSubcommand,
}

#[derive(Subcommand)]
pub enum MigrateSubcommand {
    #[clap(about = "Migrate the active deployment to a new one and wait for it to finish")]
    Start(StartArgs),

    #[clap(about = "Show a migration's checkpoint")]
    Status(MigrationIdArgs),

    #[clap(about = "Resume an interrupted or cancelled migration")]
    Resume(MigrationIdArgs),

    #[clap(about = "Roll back a migration that has not reached FINALIZING")]
    Rollback(MigrationIdArgs),

    #[clap(about = "List every known migration")]
    List,
}

#[derive(Parser)]
pub struct StartArgs {
    #[clap(help = "Name of the deployment to create")]
    pub target: String,

    #[clap(long, help = "IVF partitions for the target's ANN index")]
    pub partitions: Option<usize>,

    #[clap(long, help = "PQ sub-vectors for the target's ANN index")]
    pub sub_vectors: Option<usize>,

    #[clap(long, help = "Partitions searched per query on the target")]
    pub nprobes: Option<usize>,

    #[clap(long, help = "Connection pool size for the target")]
    pub pool_size: Option<usize>,
}

#[derive(Parser)]
pub struct MigrationIdArgs {
    #[clap(help = "Migration ID (UUID format)")]
    pub id: String,
}

impl MigrateCommand {
    pub async fn execute(&self, memory: &TieredMemory, format: OutputFormat) -> CliResult<()> {
        match &self.command {
            MigrateSubcommand::Start(args) => Self::start(memory, args, format).await,
            MigrateSubcommand::Status(args) => Self::status(memory, args, format).await,
            MigrateSubcommand::Resume(args) => Self::resume(memory, args, format).await,
            MigrateSubcommand::Rollback(args) => Self::rollback(memory, args, format).await,
            MigrateSubcommand::List => Self::list(memory, format).await,
        }
    }

    async fn start(memory: &TieredMemory, args: &StartArgs, format: OutputFormat) -> CliResult<()> {
        let target = TargetConfig {
            deployment: args.target.clone(),
            ann_partitions: args.partitions,
            ann_sub_vectors: args.sub_vectors,
            nprobes: args.nprobes,
            connection_pool_size: args.pool_size,
        };

        let handle = memory.start_migration(target).await?;
        let status = follow(&handle, format).await?;
        report(&status, format)
    }

    async fn resume(
        memory: &TieredMemory,
        args: &MigrationIdArgs,
        format: OutputFormat,
    ) -> CliResult<()> {
        let id = parse_id(&args.id)?;
        let handle = memory.resume_migration(id).await?;
        let status = follow(&handle, format).await?;
        report(&status, format)
    }

    async fn status(
        memory: &TieredMemory,
        args: &MigrationIdArgs,
        format: OutputFormat,
    ) -> CliResult<()> {
        let id = parse_id(&args.id)?;
        let status = memory.migrations().load(id).await?;

        match format {
            OutputFormat::Json => print_json(&status)?,
            OutputFormat::Table => println!("{}", status_table(&status)),
        }
        Ok(())
    }

    async fn rollback(
        memory: &TieredMemory,
        args: &MigrationIdArgs,
        format: OutputFormat,
    ) -> CliResult<()> {
        let id = parse_id(&args.id)?;
        memory.migrations().rollback_checkpoint(id).await?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "id": args.id,
                    "state": MigrationState::RolledBack,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!(
                    "Migration {} rolled back; {} remains active.",
                    args.id,
                    memory.active_deployment()
                );
            }
        }
        Ok(())
    }

    async fn list(memory: &TieredMemory, format: OutputFormat) -> CliResult<()> {
        let migrations = memory.migrations().list().await?;

        match format {
            OutputFormat::Json => print_json(&migrations)?,
            OutputFormat::Table => {
                if migrations.is_empty() {
                    println!("No migrations found.");
                    return Ok(());
                }

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["ID", "State", "Source", "Target", "Replicated", "Started"]);

                for status in &migrations {
                    table.add_row([
                        truncate_string(&status.id.to_string(), 8),
                        status.state.to_string(),
                        status.source.clone(),
                        status.target.deployment.clone(),
                        status.replicated.to_string(),
                        format_timestamp(&status.started_at),
                    ]);
                }

                println!("{table}");
                println!("\nTotal: {} migrations", migrations.len());
            }
        }
        Ok(())
    }
}

/// Show progress until the migration task stops. Ctrl-C cancels it
/// cooperatively so it can be resumed later.
async fn follow(handle: &MigrationHandle, format: OutputFormat) -> CliResult<MigrationStatus> {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .map_err(|e| format!("Progress bar error: {e}"))?;
    spinner.set_style(style);
    if format == OutputFormat::Json {
        spinner.set_draw_target(ProgressDrawTarget::hidden());
    }
    spinner.enable_steady_tick(Duration::from_millis(120));

    let mut updates = handle.subscribe();
    loop {
        let status = updates.borrow_and_update().clone();
        spinner.set_message(progress_line(&status));
        if !status.running {
            break;
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                spinner.set_message("Cancelling after the current batch...");
                handle.cancel();
            }
        }
    }

    let status = handle.wait().await;
    spinner.finish_with_message(progress_line(&status));
    Ok(status)
}

fn progress_line(status: &MigrationStatus) -> String {
    format!(
        "{} {} -> {}: {} replicated, {} reconciled",
        status.state,
        status.source,
        status.target.deployment,
        status.replicated,
        status.reconciled
    )
}

fn report(status: &MigrationStatus, format: OutputFormat) -> CliResult<()> {
    match format {
        OutputFormat::Json => print_json(status)?,
        OutputFormat::Table => println!("{}", status_table(status)),
    }

    match status.state {
        MigrationState::Done => Ok(()),
        MigrationState::RolledBack => Err(format!(
            "Migration rolled back: {}",
            status.error.as_deref().unwrap_or("no reason recorded")
        )
        .into()),
        state => {
            if format == OutputFormat::Table {
                println!(
                    "\nMigration stopped in {state}; continue with `strata migrate resume {}`.",
                    status.id
                );
            }
            Ok(())
        }
    }
}

fn status_table(status: &MigrationStatus) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(["Property", "Value"]);

    table.add_row(["ID", &status.id.to_string()]);
    table.add_row(["State", status.state.as_str()]);
    table.add_row(["Source", &status.source]);
    table.add_row(["Target", &status.target.deployment]);
    table.add_row(["Replicated", &status.replicated.to_string()]);
    table.add_row(["Reconciled", &status.reconciled.to_string()]);
    table.add_row([
        "Watermark",
        &status
            .watermark
            .map_or_else(|| "-".to_string(), |id| id.to_string()),
    ]);
    if let Some(report) = &status.validation {
        table.add_row([
            "Validation",
            &format!(
                "{} sampled, {} mismatched ({:.2}%), {} vs {} records",
                report.sampled,
                report.mismatches,
                report.mismatch_rate() * 100.0,
                report.source_count,
                report.target_count
            ),
        ]);
    }
    table.add_row(["Started", &status.started_at.to_rfc3339()]);
    table.add_row(["Updated", &status.updated_at.to_rfc3339()]);
    table.add_row(["Error", status.error.as_deref().unwrap_or("-")]);
    table
}
