//! Blue/green durable tier migration
//!
//! A migration runs as a detached task that replicates the active deployment
//! into a freshly provisioned target, validates it, swaps the manager's
//! [`DurableHandle`] over, and decommissions the source after a soak period.
//! Progress is published on a `watch` channel and checkpointed to disk after
//! every replicated round and state change.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, StrataError};
use crate::migration::checkpoint::CheckpointStore;
use crate::migration::state::{MigrationState, MigrationStatus};
use crate::memory::MemoryRecord;
use crate::migration::validation::validate;
use crate::storage::deployment::validate_deployment_name;
use crate::storage::{DurableHandle, DurableProvisioner, DurableTier, TargetConfig};

#[derive(Debug, Default)]
struct Control {
    cancel: AtomicBool,
    rollback: AtomicBool,
}

/// Caller-side view of a running (or finished) migration
#[derive(Debug, Clone)]
pub struct MigrationHandle {
    id: Uuid,
    status: watch::Receiver<MigrationStatus>,
    control: Arc<Control>,
}

impl MigrationHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Latest published status
    pub fn status(&self) -> MigrationStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> MigrationState {
        self.status.borrow().state
    }

    /// Ask the migration to stop between batches. The checkpoint is kept and
    /// the migration can be resumed later.
    pub fn cancel(&self) {
        self.control.cancel.store(true, Ordering::SeqCst);
    }

    /// Receive every status update
    pub fn subscribe(&self) -> watch::Receiver<MigrationStatus> {
        self.status.clone()
    }

    /// Wait until the driving task has stopped
    pub async fn wait(&self) -> MigrationStatus {
        let mut rx = self.status.clone();
        // A closed channel means the task is gone; its last value is final.
        let _ = rx.wait_for(|s| !s.running).await;
        let status = rx.borrow().clone();
        status
    }

    /// Wait until the migration reaches `state` or stops
    pub async fn wait_for_state(&self, state: MigrationState) -> MigrationStatus {
        let mut rx = self.status.clone();
        let _ = rx.wait_for(|s| s.state == state || !s.running).await;
        let status = rx.borrow().clone();
        status
    }
}

/// Starts, resumes and rolls back migrations of the manager's durable tier
pub struct MigrationOrchestrator {
    durable: Arc<DurableHandle>,
    provisioner: Arc<dyn DurableProvisioner>,
    config: Arc<Config>,
    checkpoints: CheckpointStore,
    running: Arc<AtomicBool>,
}

impl MigrationOrchestrator {
    pub fn new(
        durable: Arc<DurableHandle>,
        provisioner: Arc<dyn DurableProvisioner>,
        config: Arc<Config>,
    ) -> Self {
        let checkpoints = CheckpointStore::new(&config.storage.data_dir);
        Self {
            durable,
            provisioner,
            config,
            checkpoints,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Whether a migration task in this process is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Begin migrating the active deployment to `target`
    pub async fn start(&self, target: TargetConfig) -> Result<MigrationHandle> {
        validate_deployment_name(&target.deployment)?;
        let source = self.durable.active_name();
        if target.deployment == source {
            return Err(StrataError::Migration(format!(
                "target deployment {} is already active",
                target.deployment
            )));
        }

        ensure_unused(self.provisioner.as_ref(), &target.deployment).await?;

        self.claim()?;
        let status = MigrationStatus::new(source, target);
        if let Err(e) = self.checkpoints.save(&status).await {
            self.release();
            return Err(e);
        }

        info!(
            "Starting migration {}: {} -> {}",
            status.id, status.source, status.target.deployment
        );
        Ok(self.spawn(status, false))
    }

    /// Continue an interrupted migration from its checkpoint
    pub async fn resume(&self, id: Uuid) -> Result<MigrationHandle> {
        let mut status = self.checkpoints.load(id).await?;
        if status.state.is_terminal() {
            return Err(StrataError::Migration(format!(
                "migration {id} already finished ({})",
                status.state
            )));
        }

        let active = self.durable.active_name();
        if status.state.can_roll_back() {
            if active == status.target.deployment {
                // Cutover committed but the checkpoint was not updated
                status.state = MigrationState::Finalizing;
            } else if active != status.source {
                return Err(StrataError::Migration(format!(
                    "active deployment is {active}, migration {id} replicates {}",
                    status.source
                )));
            }
        }

        self.claim()?;
        info!("Resuming migration {} from {}", id, status.state);
        Ok(self.spawn(status, true))
    }

    /// Current state of a migration
    pub fn status(&self, handle: &MigrationHandle) -> MigrationState {
        handle.state()
    }

    /// Abandon a migration and keep the source.
    ///
    /// Idempotent once rolled back; refused once the migration has reached
    /// `Finalizing`.
    pub async fn rollback(&self, handle: &MigrationHandle) -> Result<()> {
        let current = handle.status();
        if current.state == MigrationState::RolledBack {
            return Ok(());
        }
        if !current.state.can_roll_back() {
            return Err(StrataError::Rollback(format!(
                "migration {} is {}; the source is no longer authoritative",
                current.id, current.state
            )));
        }
        if !current.running {
            return self.rollback_checkpoint(current.id).await;
        }

        handle.control.rollback.store(true, Ordering::SeqCst);
        let finished = handle.wait().await;
        match finished.state {
            MigrationState::RolledBack => Ok(()),
            state => Err(StrataError::Rollback(format!(
                "migration {} reached {} before the rollback took effect",
                finished.id, state
            ))),
        }
    }

    /// Roll back a migration no task is driving (interrupted or cancelled)
    pub async fn rollback_checkpoint(&self, id: Uuid) -> Result<()> {
        let mut status = self.checkpoints.load(id).await?;
        if status.state == MigrationState::RolledBack {
            return Ok(());
        }
        if !status.state.can_roll_back() {
            return Err(StrataError::Rollback(format!(
                "migration {id} is {}; the source is no longer authoritative",
                status.state
            )));
        }
        if self.durable.active_name() != status.source {
            return Err(StrataError::Rollback(format!(
                "active deployment is {}, not migration source {}",
                self.durable.active_name(),
                status.source
            )));
        }

        self.claim()?;
        let result = async {
            self.provisioner.activate(&status.source).await?;
            match self.provisioner.open(&status.target.deployment).await {
                Ok(target) => {
                    if let Err(e) = target.destroy().await {
                        warn!("Failed to discard target {}: {}", status.target.deployment, e);
                    }
                }
                Err(e) => warn!("Could not open target {} to discard it: {}", status.target.deployment, e),
            }

            status.state = MigrationState::RolledBack;
            status.error = Some("rolled back on request".to_string());
            status.updated_at = Utc::now();
            self.checkpoints.save(&status).await
        }
        .await;
        self.release();

        if result.is_ok() {
            info!("Migration {} rolled back", id);
        }
        result
    }

    pub async fn load(&self, id: Uuid) -> Result<MigrationStatus> {
        self.checkpoints.load(id).await
    }

    pub async fn list(&self) -> Result<Vec<MigrationStatus>> {
        self.checkpoints.list().await
    }

    fn claim(&self) -> Result<()> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| StrataError::Migration("a migration is already running".to_string()))
    }

    fn release(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn spawn(&self, mut status: MigrationStatus, resume: bool) -> MigrationHandle {
        status.running = true;
        status.error = None;
        let id = status.id;

        let (sender, receiver) = watch::channel(status);
        let control = Arc::new(Control::default());

        let run = MigrationRun {
            durable: self.durable.clone(),
            provisioner: self.provisioner.clone(),
            config: self.config.clone(),
            checkpoints: self.checkpoints.clone(),
            status: sender,
            control: control.clone(),
        };
        let running = self.running.clone();
        tokio::spawn(async move { run.execute(resume, running).await });

        MigrationHandle {
            id,
            status: receiver,
            control,
        }
    }
}

#[derive(Default)]
struct Tiers {
    source: Option<Arc<dyn DurableTier>>,
    target: Option<Arc<dyn DurableTier>>,
}

struct MigrationRun {
    durable: Arc<DurableHandle>,
    provisioner: Arc<dyn DurableProvisioner>,
    config: Arc<Config>,
    checkpoints: CheckpointStore,
    status: watch::Sender<MigrationStatus>,
    control: Arc<Control>,
}

impl MigrationRun {
    async fn execute(self, resume: bool, running: Arc<AtomicBool>) {
        let mut tiers = Tiers::default();

        match self.drive(resume, &mut tiers).await {
            Ok(()) => {}
            Err(StrataError::Cancelled) => {
                self.durable.stop_journal();
                let status = self.snapshot();
                info!(
                    "Migration {} cancelled in {} at watermark {:?}",
                    status.id, status.state, status.watermark
                );
                self.update(|s| s.error = Some("cancelled".to_string())).await;
            }
            Err(e) => self.roll_back(&tiers, e).await,
        }

        running.store(false, Ordering::SeqCst);
        self.status.send_modify(|s| s.running = false);
    }

    async fn drive(&self, resume: bool, tiers: &mut Tiers) -> Result<()> {
        let snapshot = self.snapshot();

        if snapshot.state == MigrationState::Finalizing {
            let source = self.provisioner.open(&snapshot.source).await;
            match source {
                Ok(source) => self.finalize(source).await,
                Err(e) => {
                    error!("Cannot reopen source {} to finalize: {}", snapshot.source, e);
                    self.update(|s| s.error = Some(e.to_string())).await;
                }
            }
            return Ok(());
        }

        let source = self.durable.active();
        tiers.source = Some(source.clone());

        // Preparing
        self.check_controls()?;
        if !resume {
            ensure_unused(self.provisioner.as_ref(), &snapshot.target.deployment).await?;
        }
        let target = self.provisioner.provision(&snapshot.target).await?;
        tiers.target = Some(target.clone());

        // Replicating
        self.durable.start_journal();
        let previous_run = snapshot.run_started_at;
        self.transition(MigrationState::Replicating).await;
        self.update(|s| s.run_started_at = Utc::now()).await;

        if resume {
            self.reconcile(&source, &target, previous_run).await?;
        }
        self.replicate(&source, &target).await?;

        match target.build_index().await {
            Ok(true) => info!("Built ANN index on {}", target.name()),
            Ok(false) => debug!("Target {} too small for an ANN index", target.name()),
            Err(e) => warn!("Index build on {} failed, searches stay exact: {}", target.name(), e),
        }

        self.catch_up(source.as_ref(), target.as_ref()).await?;

        // Validating
        self.check_controls()?;
        self.transition(MigrationState::Validating).await;
        let migration = &self.config.migration;
        let report = validate(source.as_ref(), target.as_ref(), migration).await?;
        info!(
            "Validation sampled {} record(s): {} mismatch(es), counts {}/{}",
            report.sampled, report.mismatches, report.source_count, report.target_count
        );
        self.update(|s| s.validation = Some(report.clone())).await;
        report.check(migration.mismatch_tolerance)?;

        // Cutover
        self.check_controls()?;
        self.transition(MigrationState::Cutover).await;

        let this = self;
        let (source_ref, target_ref) = (source.as_ref(), target.as_ref());
        let previous = self
            .durable
            .cutover(target.clone(), migration.cutover_timeout(), move || async move {
                let ids = this.durable.drain_journal();
                let copied = copy_ids(source_ref, target_ref, &ids).await?;
                // No write can land on either tier here
                let (source_count, target_count) =
                    tokio::try_join!(source_ref.count(), target_ref.count())?;
                if source_count != target_count {
                    return Err(StrataError::Migration(format!(
                        "target holds {target_count} records, source holds {source_count}"
                    )));
                }
                this.provisioner.activate(target_ref.name()).await?;
                this.status.send_modify(|s| s.reconciled += copied as u64);
                Ok(())
            })
            .await?;
        self.durable.stop_journal();
        info!("Cutover complete: {} -> {}", previous.name(), target.name());

        // Finalizing
        self.transition(MigrationState::Finalizing).await;
        self.finalize(previous).await;
        Ok(())
    }

    /// Copy records from the watermark onwards, `workers` batches at a time
    async fn replicate(
        &self,
        source: &Arc<dyn DurableTier>,
        target: &Arc<dyn DurableTier>,
    ) -> Result<()> {
        let batch_size = self.config.migration.batch_size;
        let workers = self.config.migration.workers;
        let retry = *self.durable.retry_policy();

        loop {
            self.check_controls()?;

            let watermark = self.snapshot().watermark;
            let page = retry
                .run("scan", || source.scan(watermark, batch_size * workers))
                .await?;
            let Some(last) = page.last().map(|r| r.id) else {
                break;
            };

            let chunks: Vec<Vec<MemoryRecord>> =
                page.chunks(batch_size).map(<[_]>::to_vec).collect();
            futures::stream::iter(chunks)
                .map(|chunk| {
                    let target = target.clone();
                    async move { retry.run("replicate", || target.write_batch(&chunk)).await }
                })
                .buffered(workers)
                .try_collect::<Vec<()>>()
                .await?;

            let copied = page.len() as u64;
            self.update(|s| {
                s.watermark = Some(last);
                s.replicated += copied;
            })
            .await;
            debug!("Replicated {} record(s) up to {}", copied, last);
        }

        Ok(())
    }

    /// Apply changes made while no journal was recording (the previous run
    /// crashed or was cancelled)
    async fn reconcile(
        &self,
        source: &Arc<dyn DurableTier>,
        target: &Arc<dyn DurableTier>,
        previous_run: chrono::DateTime<Utc>,
    ) -> Result<()> {
        // A write stamped just before the run started may have committed after it
        let durable = &self.config.durable;
        let grace = durable.operation_timeout() * durable.max_attempts.max(1);
        let since = previous_run
            - chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::seconds(30));

        let changed = source.modified_since(since).await?;
        target.write_batch(&changed).await?;

        let source_ids: HashSet<Uuid> = source.ids().await?.into_iter().collect();
        let stale: Vec<Uuid> = target
            .ids()
            .await?
            .into_iter()
            .filter(|id| !source_ids.contains(id))
            .collect();
        for id in &stale {
            target.delete(*id).await?;
        }

        info!(
            "Reconciled {} changed and {} removed record(s) since {}",
            changed.len(),
            stale.len(),
            since
        );
        let touched = (changed.len() + stale.len()) as u64;
        self.update(|s| s.reconciled += touched).await;
        Ok(())
    }

    /// Replay ids journaled since replication started
    async fn catch_up(&self, source: &dyn DurableTier, target: &dyn DurableTier) -> Result<()> {
        let ids = self.durable.drain_journal();
        if ids.is_empty() {
            return Ok(());
        }
        let copied = copy_ids(source, target, &ids).await?;
        debug!("Caught up {} journaled record(s)", copied);
        self.update(|s| s.reconciled += copied as u64).await;
        Ok(())
    }

    /// Soak until a window passes with no errors on the new tier, then
    /// decommission the source
    async fn finalize(&self, source: Arc<dyn DurableTier>) {
        let soak = self.config.migration.soak();

        loop {
            self.durable.reset_error_count();
            tokio::time::sleep(soak).await;

            let errors = self.durable.error_count();
            if errors == 0 {
                break;
            }
            warn!(
                "{} error(s) on {} during soak; restarting soak window",
                errors,
                self.durable.active_name()
            );
            self.update(|s| s.error = Some(format!("{errors} error(s) during soak")))
                .await;

            if self.control.cancel.load(Ordering::SeqCst) {
                info!("Soak interrupted; source {} kept until resume", source.name());
                return;
            }
        }

        if let Err(e) = source.destroy().await {
            error!("Failed to decommission source {}: {}", source.name(), e);
            self.update(|s| s.error = Some(format!("decommission failed: {e}")))
                .await;
            return;
        }

        info!("Decommissioned source {}", source.name());
        self.update(|s| {
            s.state = MigrationState::Done;
            s.error = None;
        })
        .await;
    }

    async fn roll_back(&self, tiers: &Tiers, reason: StrataError) {
        let status = self.snapshot();
        warn!("Rolling back migration {}: {}", status.id, reason);

        self.durable.stop_journal();

        if let Some(source) = &tiers.source {
            if self.durable.active_name() != source.name() {
                self.durable.swap(source.clone());
            }
        }
        if let Err(e) = self.provisioner.activate(&status.source).await {
            error!("Failed to re-activate source {}: {}", status.source, e);
        }
        if let Some(target) = &tiers.target {
            if let Err(e) = target.destroy().await {
                warn!("Failed to discard target {}: {}", target.name(), e);
            }
        }

        self.update(|s| {
            s.state = MigrationState::RolledBack;
            s.error = Some(reason.to_string());
        })
        .await;
    }

    fn check_controls(&self) -> Result<()> {
        if self.control.rollback.load(Ordering::SeqCst) {
            return Err(StrataError::Rollback("rollback requested".to_string()));
        }
        if self.control.cancel.load(Ordering::SeqCst) {
            return Err(StrataError::Cancelled);
        }
        Ok(())
    }

    fn snapshot(&self) -> MigrationStatus {
        self.status.borrow().clone()
    }

    async fn transition(&self, state: MigrationState) {
        let status = self.snapshot();
        info!("Migration {}: {} -> {}", status.id, status.state, state);
        self.update(|s| s.state = state).await;
    }

    /// Publish a status change and checkpoint it
    async fn update(&self, change: impl FnOnce(&mut MigrationStatus)) {
        self.status.send_modify(|s| {
            change(s);
            s.updated_at = Utc::now();
        });

        let status = self.snapshot();
        if let Err(e) = self.checkpoints.save(&status).await {
            warn!("Failed to checkpoint migration {}: {}", status.id, e);
        }
    }
}

/// Refuse to migrate into a deployment that already holds records
async fn ensure_unused(provisioner: &dyn DurableProvisioner, deployment: &str) -> Result<()> {
    match provisioner.existing_records(deployment).await? {
        Some(records) if records > 0 => Err(StrataError::Migration(format!(
            "deployment {deployment} already exists with {records} record(s)"
        ))),
        _ => Ok(()),
    }
}

/// Make `target` agree with `source` for each id
async fn copy_ids(source: &dyn DurableTier, target: &dyn DurableTier, ids: &[Uuid]) -> Result<usize> {
    let mut present = Vec::with_capacity(ids.len());
    for id in ids {
        match source.get(*id).await? {
            Some(record) => present.push(record),
            None => {
                target.delete(*id).await?;
            }
        }
    }
    target.write_batch(&present).await?;
    Ok(ids.len())
}
