use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use strata::{MemoryRecord, StrataError, TieredMemory};

use crate::commands::parse_id;
use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct RecordCommand {
    #[clap(subcommand)]
    pub command: RecordSubcommand,
}

#[derive(Subcommand)]
pub enum RecordSubcommand {
    #[clap(about = "Show record details")]
    Show(IdArgs),

    #[clap(about = "Delete a record from both tiers")]
    Delete(IdArgs),

    #[clap(about = "Load a record into the cache tier")]
    Promote(IdArgs),
}

#[derive(Parser)]
pub struct IdArgs {
    #[clap(help = "Record ID (UUID format)")]
    pub id: String,
}

impl RecordCommand {
    pub async fn execute(&self, memory: &TieredMemory, format: OutputFormat) -> CliResult<()> {
        match &self.command {
            RecordSubcommand::Show(args) => Self::show(memory, args, format).await,
            RecordSubcommand::Delete(args) => Self::delete(memory, args, format).await,
            RecordSubcommand::Promote(args) => Self::promote(memory, args, format).await,
        }
    }

    async fn show(memory: &TieredMemory, args: &IdArgs, format: OutputFormat) -> CliResult<()> {
        let id = parse_id(&args.id)?;
        let record = memory
            .get_record(id)
            .await?
            .ok_or_else(|| format!("Record not found: {}", args.id))?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "id": record.id.to_string(),
                    "content": &record.content,
                    "embedding_size": record.embedding.len(),
                    "metadata": &record.metadata,
                    "relationships": &record.relationships,
                    "version": record.version,
                    "created_at": record.created_at.to_rfc3339(),
                    "updated_at": record.updated_at.to_rfc3339(),
                    "last_accessed_at": record.last_accessed_at.to_rfc3339(),
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => println!("{}", record_table(&record)),
        }

        Ok(())
    }

    async fn delete(memory: &TieredMemory, args: &IdArgs, format: OutputFormat) -> CliResult<()> {
        let id = parse_id(&args.id)?;

        let deleted = match memory.delete(id).await {
            Ok(()) => true,
            Err(StrataError::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "id": args.id,
                    "deleted": deleted,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                if deleted {
                    println!("Record {} deleted.", args.id);
                } else {
                    println!("Record {} not found.", args.id);
                }
            }
        }

        Ok(())
    }

    async fn promote(memory: &TieredMemory, args: &IdArgs, format: OutputFormat) -> CliResult<()> {
        let id = parse_id(&args.id)?;
        memory.promote(id).await?;

        match format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "id": args.id,
                    "promoted": true,
                    "ttl_seconds": memory.config().cache.ttl_seconds,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => println!(
                "Record {} cached for {}s.",
                args.id,
                memory.config().cache.ttl_seconds
            ),
        }

        Ok(())
    }
}

fn record_table(record: &MemoryRecord) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(["Property", "Value"]);

    let metadata = if record.metadata.is_empty() {
        "-".to_string()
    } else {
        record
            .metadata
            .iter()
            .map(|(key, value)| format!("{key}={}", value.canonical()))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let relationships = if record.relationships.is_empty() {
        "-".to_string()
    } else {
        record
            .relationships
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };

    table.add_row(["ID", &record.id.to_string()]);
    table.add_row(["Content", &record.content]);
    table.add_row(["Metadata", &metadata]);
    table.add_row(["Relationships", &relationships]);
    table.add_row(["Version", &record.version.to_string()]);
    table.add_row(["Created", &record.created_at.to_rfc3339()]);
    table.add_row(["Updated", &record.updated_at.to_rfc3339()]);
    table.add_row(["Last Accessed", &record.last_accessed_at.to_rfc3339()]);
    table.add_row(["Embedding Size", &record.embedding.len().to_string()]);
    table
}
