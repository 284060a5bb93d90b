use clap::{Parser, Subcommand};
use strata::TieredMemory;

use crate::error::CliResult;
use crate::output::OutputFormat;

#[derive(Parser)]
pub struct IndexCommand {
    #[clap(subcommand)]
    pub command: IndexSubcommand,
}

#[derive(Subcommand)]
pub enum IndexSubcommand {
    #[clap(about = "Build or rebuild the ANN index on the active deployment")]
    Build,
}

impl IndexCommand {
    pub async fn execute(&self, memory: &TieredMemory, format: OutputFormat) -> CliResult<()> {
        match &self.command {
            IndexSubcommand::Build => {
                let built = memory.build_index().await?;
                let deployment = memory.active_deployment();

                match format {
                    OutputFormat::Json => {
                        let output = serde_json::json!({
                            "deployment": deployment,
                            "built": built,
                        });
                        println!("{}", serde_json::to_string_pretty(&output)?);
                    }
                    OutputFormat::Table => {
                        if built {
                            println!("Built ANN index on {deployment}.");
                        } else {
                            println!(
                                "Skipped index build on {deployment}: not enough records yet. Searches stay exact."
                            );
                        }
                    }
                }
                Ok(())
            }
        }
    }
}
