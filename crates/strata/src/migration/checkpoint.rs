//! Persisted migration checkpoints
//!
//! One JSON file per migration under `<data_dir>/migrations/`, replaced
//! atomically on every update so a crash leaves the last complete state.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Result, StrataError};
use crate::migration::state::MigrationStatus;
use crate::storage::deployment::write_atomic;

const MIGRATIONS_DIR: &str = "migrations";

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Checkpoints for the data directory `data_dir`
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join(MIGRATIONS_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub async fn save(&self, status: &MigrationStatus) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let content = serde_json::to_string_pretty(status)?;
        write_atomic(&self.path_for(status.id), content.as_bytes()).await
    }

    pub async fn load(&self, id: Uuid) -> Result<MigrationStatus> {
        let path = self.path_for(id);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StrataError::Migration(format!("no checkpoint for migration {id}"))
            } else {
                StrataError::Io(e)
            }
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Every checkpoint, oldest first
    pub async fn list(&self) -> Result<Vec<MigrationStatus>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut statuses = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<MigrationStatus>(&content) {
                    Ok(status) => statuses.push(status),
                    Err(e) => tracing::warn!("Skipping unreadable checkpoint {}: {}", path.display(), e),
                },
                Err(e) => tracing::warn!("Skipping unreadable checkpoint {}: {}", path.display(), e),
            }
        }

        statuses.sort_by_key(|s| s.started_at);
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::state::MigrationState;
    use crate::storage::TargetConfig;

    #[tokio::test]
    async fn test_save_load_and_list() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(temp_dir.path());

        assert!(store.list().await.unwrap().is_empty());

        let mut status = MigrationStatus::new("primary", TargetConfig::new("next"));
        store.save(&status).await.unwrap();

        status.state = MigrationState::Replicating;
        status.replicated = 42;
        store.save(&status).await.unwrap();

        let loaded = store.load(status.id).await.unwrap();
        assert_eq!(loaded.state, MigrationState::Replicating);
        assert_eq!(loaded.replicated, 42);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_a_migration_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(temp_dir.path());

        let err = store.load(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StrataError::Migration(_)));
    }
}
