pub mod index;
pub mod migrate;
pub mod record;
pub mod stats;

pub use index::IndexCommand;
pub use migrate::MigrateCommand;
pub use record::RecordCommand;
pub use stats::StatsCommand;

use uuid::Uuid;

use crate::error::CliResult;

pub(crate) fn parse_id(id: &str) -> CliResult<Uuid> {
    Ok(Uuid::parse_str(id).map_err(|e| format!("Invalid UUID format: {e}"))?)
}
