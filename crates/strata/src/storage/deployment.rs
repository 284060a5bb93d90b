//! Durable deployments and the active-deployment pointer
//!
//! Each deployment is an independent LanceDB directory under
//! `<data_dir>/deployments/<name>/`. `<data_dir>/ACTIVE` names the one new
//! processes should open; it is replaced atomically on cutover.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{Config, DurableConfig};
use crate::error::{Result, StrataError};
use crate::storage::DurableTier;
use crate::storage::lance::LanceStore;

/// Deployment opened when no ACTIVE pointer exists yet
pub const DEFAULT_DEPLOYMENT: &str = "primary";

const ACTIVE_FILE: &str = "ACTIVE";
const DEPLOYMENTS_DIR: &str = "deployments";
const SETTINGS_FILE: &str = "deployment.json";

/// Where and how to provision a migration target.
///
/// Unset tuning fields inherit the `[durable]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub deployment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ann_partitions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ann_sub_vectors: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nprobes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_pool_size: Option<usize>,
}

impl TargetConfig {
    pub fn new(deployment: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            ..Self::default()
        }
    }

    pub fn with_ann_partitions(mut self, partitions: usize) -> Self {
        self.ann_partitions = Some(partitions);
        self
    }

    pub fn with_connection_pool_size(mut self, size: usize) -> Self {
        self.connection_pool_size = Some(size);
        self
    }

    /// Overlay this target's tuning on a base durable config
    pub fn apply(&self, base: &DurableConfig) -> DurableConfig {
        let mut config = base.clone();
        if let Some(partitions) = self.ann_partitions {
            config.ann_partitions = partitions;
        }
        if let Some(sub_vectors) = self.ann_sub_vectors {
            config.ann_sub_vectors = sub_vectors;
        }
        if let Some(nprobes) = self.nprobes {
            config.nprobes = nprobes;
        }
        if let Some(size) = self.connection_pool_size {
            config.connection_pool_size = size;
        }
        config
    }
}

/// Check a deployment name is a single safe path component
pub fn validate_deployment_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StrataError::Config(format!(
            "invalid deployment name {name:?}: use 1-64 ASCII letters, digits, '-' or '_'"
        )))
    }
}

/// Creates, opens and activates durable deployments
#[async_trait]
pub trait DurableProvisioner: Send + Sync {
    /// Create the target deployment (or reopen it when resuming)
    async fn provision(&self, target: &TargetConfig) -> Result<Arc<dyn DurableTier>>;

    /// Open an existing deployment with the tuning it was provisioned with
    async fn open(&self, deployment: &str) -> Result<Arc<dyn DurableTier>>;

    /// Make `deployment` the one new processes open
    async fn activate(&self, deployment: &str) -> Result<()>;

    /// The recorded active deployment, if any
    async fn active(&self) -> Result<Option<String>>;

    /// Records held by `deployment`, or `None` if it was never provisioned
    async fn existing_records(&self, deployment: &str) -> Result<Option<usize>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ActivePointer {
    deployment: String,
    activated_at: DateTime<Utc>,
}

/// Provisions LanceDB deployments under a data directory
#[derive(Debug, Clone)]
pub struct LanceProvisioner {
    root: PathBuf,
    dimension: usize,
    durable: DurableConfig,
}

impl LanceProvisioner {
    pub fn new(root: impl Into<PathBuf>, dimension: usize, durable: DurableConfig) -> Self {
        Self {
            root: root.into(),
            dimension,
            durable,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.storage.data_dir.clone(),
            config.storage.dimension,
            config.durable.clone(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn deployment_path(&self, deployment: &str) -> PathBuf {
        self.root.join(DEPLOYMENTS_DIR).join(deployment)
    }

    /// Names of every deployment directory on disk
    pub async fn deployments(&self) -> Result<Vec<String>> {
        let dir = self.root.join(DEPLOYMENTS_DIR);
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read_settings(&self, deployment: &str) -> Result<TargetConfig> {
        let path = self.deployment_path(deployment).join(SETTINGS_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(TargetConfig::new(deployment))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn open_store(&self, target: &TargetConfig) -> Result<Arc<dyn DurableTier>> {
        validate_deployment_name(&target.deployment)?;
        let path = self.deployment_path(&target.deployment);
        tokio::fs::create_dir_all(&path).await?;

        let store = LanceStore::open(
            &path,
            &target.deployment,
            self.dimension,
            &target.apply(&self.durable),
        )
        .await?;
        Ok(Arc::new(store))
    }
}

#[async_trait]
impl DurableProvisioner for LanceProvisioner {
    async fn provision(&self, target: &TargetConfig) -> Result<Arc<dyn DurableTier>> {
        let store = self.open_store(target).await?;

        let settings = serde_json::to_string_pretty(target)?;
        write_atomic(
            &self.deployment_path(&target.deployment).join(SETTINGS_FILE),
            settings.as_bytes(),
        )
        .await?;

        info!("Provisioned deployment {}", target.deployment);
        Ok(store)
    }

    async fn open(&self, deployment: &str) -> Result<Arc<dyn DurableTier>> {
        validate_deployment_name(deployment)?;
        let settings = self.read_settings(deployment).await?;
        self.open_store(&settings).await
    }

    async fn activate(&self, deployment: &str) -> Result<()> {
        validate_deployment_name(deployment)?;
        tokio::fs::create_dir_all(&self.root).await?;

        let pointer = ActivePointer {
            deployment: deployment.to_string(),
            activated_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&pointer)?;
        write_atomic(&self.root.join(ACTIVE_FILE), content.as_bytes()).await?;

        info!("Active deployment is now {}", deployment);
        Ok(())
    }

    async fn active(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.root.join(ACTIVE_FILE)).await {
            Ok(content) => {
                let pointer: ActivePointer = serde_json::from_str(&content)?;
                Ok(Some(pointer.deployment))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn existing_records(&self, deployment: &str) -> Result<Option<usize>> {
        validate_deployment_name(deployment)?;
        if !tokio::fs::try_exists(self.deployment_path(deployment)).await? {
            return Ok(None);
        }
        let store = self.open(deployment).await?;
        Ok(Some(store.count().await?))
    }
}

/// Replace `path` with `content` via write-then-rename
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
