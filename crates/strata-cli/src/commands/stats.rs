use clap::Parser;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use strata::TieredMemory;

use crate::error::CliResult;
use crate::output::{OutputFormat, print_json};

#[derive(Parser)]
pub struct StatsCommand {}

impl StatsCommand {
    pub async fn execute(&self, memory: &TieredMemory, format: OutputFormat) -> CliResult<()> {
        let stats = memory.stats().await?;

        match format {
            OutputFormat::Json => print_json(&stats)?,
            OutputFormat::Table => {
                println!("Strata Statistics");
                println!("=================\n");

                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL_CONDENSED)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(["Property", "Value"]);

                table.add_row(["Active deployment", &stats.active_deployment]);
                table.add_row(["Durable records", &stats.durable_records.to_string()]);
                table.add_row([
                    "Cached records",
                    &stats
                        .cache_entries
                        .map_or_else(|| "unavailable".to_string(), |n| n.to_string()),
                ]);
                table.add_row(["Durable errors", &stats.durable_errors.to_string()]);
                table.add_row(["Pending writes", &stats.pending_writes.to_string()]);

                println!("{table}");
            }
        }

        Ok(())
    }
}
