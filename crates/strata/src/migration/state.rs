//! Migration state machine and the status record published to callers

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::migration::validation::ValidationReport;
use crate::storage::TargetConfig;

/// Phase of a blue/green durable tier migration.
///
/// `Preparing → Replicating → Validating → Cutover → Finalizing → Done`, with
/// `RolledBack` reachable from any phase before `Finalizing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    Preparing,
    Replicating,
    Validating,
    Cutover,
    Finalizing,
    Done,
    RolledBack,
}

impl MigrationState {
    /// Whether the source is still authoritative and may be returned to
    pub fn can_roll_back(self) -> bool {
        matches!(
            self,
            MigrationState::Preparing
                | MigrationState::Replicating
                | MigrationState::Validating
                | MigrationState::Cutover
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationState::Done | MigrationState::RolledBack)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationState::Preparing => "PREPARING",
            MigrationState::Replicating => "REPLICATING",
            MigrationState::Validating => "VALIDATING",
            MigrationState::Cutover => "CUTOVER",
            MigrationState::Finalizing => "FINALIZING",
            MigrationState::Done => "DONE",
            MigrationState::RolledBack => "ROLLED_BACK",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about one migration. Persisted as its checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub id: Uuid,
    pub state: MigrationState,
    /// Deployment being replaced
    pub source: String,
    pub target: TargetConfig,
    /// Last record id copied to the target; replication resumes after it
    pub watermark: Option<Uuid>,
    /// Records copied by paginated replication
    pub replicated: u64,
    /// Records re-copied or removed from journal and resume reconciliation
    pub reconciled: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    pub started_at: DateTime<Utc>,
    /// When the current (or last) process began driving this migration
    pub run_started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether a task in this process is still driving the migration
    #[serde(skip)]
    pub running: bool,
}

impl MigrationStatus {
    pub fn new(source: impl Into<String>, target: TargetConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            state: MigrationState::Preparing,
            source: source.into(),
            target,
            watermark: None,
            replicated: 0,
            reconciled: 0,
            validation: None,
            started_at: now,
            run_started_at: now,
            updated_at: now,
            error: None,
            running: false,
        }
    }

    /// Whether `resume` can pick this migration up again
    pub fn is_resumable(&self) -> bool {
        !self.running && !self.state.is_terminal()
    }
}
