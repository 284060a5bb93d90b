//! Atomically swappable reference to the active durable tier
//!
//! The manager never holds a durable tier directly; it goes through a
//! [`DurableHandle`]. The migration orchestrator uses the same handle to
//! journal writes during replication and to swap the reference at cutover
//! without losing writes that arrive in the critical section.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, StrataError};
use crate::memory::{MemoryRecord, ScoredRecord};
use crate::storage::filter::MetadataFilter;
use crate::storage::retry::RetryPolicy;
use crate::storage::DurableTier;

/// Default cap on writes parked during a cutover
const DEFAULT_PENDING_LIMIT: usize = 10_000;

/// A mutation parked while the tier reference is being swapped
#[derive(Debug, Clone)]
pub enum PendingOp {
    Write(MemoryRecord),
    Delete(Uuid),
}

impl PendingOp {
    pub fn id(&self) -> Uuid {
        match self {
            PendingOp::Write(record) => record.id,
            PendingOp::Delete(id) => *id,
        }
    }
}

struct PendingWrite {
    op: PendingOp,
    respond: oneshot::Sender<Result<bool>>,
}

/// Shared, swappable durable tier reference
pub struct DurableHandle {
    active: RwLock<Arc<dyn DurableTier>>,
    retry: RetryPolicy,
    /// Mutations hold a read guard for their whole durable call; cutover takes
    /// the write guard to drain them.
    in_flight: tokio::sync::RwLock<()>,
    /// `Some` while a cutover is in progress
    pending: Mutex<Option<Vec<PendingWrite>>>,
    pending_limit: usize,
    pending_wait: Duration,
    /// Ids mutated since replication started; `None` when not journaling
    journal: Mutex<Option<BTreeSet<Uuid>>>,
    /// Failed calls against the current tier since it became active
    errors: AtomicU64,
}

impl DurableHandle {
    pub fn new(tier: Arc<dyn DurableTier>, retry: RetryPolicy) -> Self {
        Self {
            active: RwLock::new(tier),
            retry,
            in_flight: tokio::sync::RwLock::new(()),
            pending: Mutex::new(None),
            pending_limit: DEFAULT_PENDING_LIMIT,
            pending_wait: Duration::from_secs(60),
            journal: Mutex::new(None),
            errors: AtomicU64::new(0),
        }
    }

    /// Bound the cutover buffer's size and how long a parked caller waits
    pub fn with_pending_limits(mut self, limit: usize, wait: Duration) -> Self {
        self.pending_limit = limit.max(1);
        self.pending_wait = wait;
        self
    }

    /// The tier currently serving requests
    pub fn active(&self) -> Arc<dyn DurableTier> {
        self.active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn active_name(&self) -> String {
        self.active().name().to_string()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Failed calls against the current tier since it became active
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_error_count(&self) {
        self.errors.store(0, Ordering::Relaxed);
    }

    /// Writes currently parked behind a cutover
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .map(|pending| pending.as_ref().map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Upsert through the active tier with retries
    pub async fn write(&self, record: &MemoryRecord) -> Result<()> {
        if let Some(parked) = self.park(PendingOp::Write(record.clone()))? {
            return self.wait_parked(parked).await.map(|_| ());
        }

        let _gate = self.in_flight.read().await;
        let tier = self.active();
        let result = self.retry.run("write", || tier.write(record)).await;
        self.note_change(record.id);
        self.observe(&result);
        result
    }

    /// Delete through the active tier. Returns false if the id was absent.
    ///
    /// A failed attempt is only retried after confirming the record is still
    /// there, so a delete that committed before timing out is not repeated.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        if let Some(parked) = self.park(PendingOp::Delete(id))? {
            return self.wait_parked(parked).await;
        }

        let _gate = self.in_flight.read().await;
        let tier = self.active();
        let result = self.delete_checked(&tier, id).await;
        self.note_change(id);
        self.observe(&result);
        result
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        let tier = self.active();
        let result = self.retry.run("get", || tier.get(id)).await;
        self.observe(&result);
        result
    }

    pub async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredRecord>> {
        let tier = self.active();
        let result = self
            .retry
            .run("search", || tier.search(query, top_k, filter))
            .await;
        self.observe(&result);
        result
    }

    pub async fn count(&self) -> Result<usize> {
        let tier = self.active();
        let result = self.retry.run("count", || tier.count()).await;
        self.observe(&result);
        result
    }

    /// Best effort, single attempt
    pub async fn touch(&self, ids: &[Uuid], at: DateTime<Utc>) -> Result<()> {
        let tier = self.active();
        self.retry.once("touch", tier.touch(ids, at)).await
    }

    pub async fn build_index(&self) -> Result<bool> {
        self.active().build_index().await
    }

    async fn delete_checked(&self, tier: &Arc<dyn DurableTier>, id: Uuid) -> Result<bool> {
        if self.retry.run("get", || tier.get(id)).await?.is_none() {
            return Ok(false);
        }

        let mut delay = self.retry.base_delay;
        let mut attempt = 1;
        loop {
            match self.retry.once("delete", tier.delete(id)).await {
                Ok(_) => return Ok(true),
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    match self.retry.once("get", tier.get(id)).await {
                        Ok(None) => {
                            debug!("Delete of {} committed despite error: {}", id, e);
                            return Ok(true);
                        }
                        Ok(Some(_)) => {}
                        Err(check) => {
                            warn!("Could not confirm delete of {}: {}", id, check);
                        }
                    }
                    warn!(
                        "delete failed on attempt {}/{}, retrying in {:?}: {}",
                        attempt, self.retry.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.retry.max_delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn observe<T>(&self, result: &Result<T>) {
        if let Err(e) = result {
            if !matches!(e, StrataError::NotFound(_) | StrataError::InvalidRecord(_)) {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Park `op` if a cutover is running; `None` means proceed directly
    fn park(&self, op: PendingOp) -> Result<Option<oneshot::Receiver<Result<bool>>>> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| StrataError::Storage("cutover buffer lock poisoned".to_string()))?;

        let Some(buffer) = pending.as_mut() else {
            return Ok(None);
        };
        if buffer.len() >= self.pending_limit {
            return Err(StrataError::ResourceExhausted(format!(
                "cutover buffer full ({} pending writes)",
                buffer.len()
            )));
        }

        let (respond, parked) = oneshot::channel();
        debug!("Parking {:?} for {} during cutover", kind(&op), op.id());
        buffer.push(PendingWrite { op, respond });
        Ok(Some(parked))
    }

    async fn wait_parked(&self, parked: oneshot::Receiver<Result<bool>>) -> Result<bool> {
        match tokio::time::timeout(self.pending_wait, parked).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(StrataError::Write(
                "cutover ended without applying the parked write".to_string(),
            )),
            Err(_) => Err(StrataError::timeout(
                "parked write",
                self.pending_wait.as_millis() as u64,
            )),
        }
    }

    // Journal

    pub(crate) fn start_journal(&self) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.get_or_insert_with(BTreeSet::new);
        }
    }

    /// Take the ids recorded so far, leaving journaling on
    pub(crate) fn drain_journal(&self) -> Vec<Uuid> {
        self.journal
            .lock()
            .ok()
            .and_then(|mut journal| journal.as_mut().map(std::mem::take))
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default()
    }

    pub(crate) fn stop_journal(&self) {
        if let Ok(mut journal) = self.journal.lock() {
            *journal = None;
        }
    }

    fn note_change(&self, id: Uuid) {
        if let Ok(mut journal) = self.journal.lock() {
            if let Some(ids) = journal.as_mut() {
                ids.insert(id);
            }
        }
    }

    // Cutover

    /// Swap the active tier without waiting for in-flight writes
    pub(crate) fn swap(&self, tier: Arc<dyn DurableTier>) -> Arc<dyn DurableTier> {
        let mut active = self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = std::mem::replace(&mut *active, tier);
        self.reset_error_count();
        previous
    }

    /// Drain in-flight writes, run `catch_up`, then swap to `target`.
    ///
    /// Writes that arrive meanwhile are parked and applied to whichever tier
    /// is active once the critical section ends. On success returns the
    /// previous tier. If `catch_up` fails or `timeout` elapses, nothing is
    /// swapped and the parked writes go to the current tier.
    pub(crate) async fn cutover<F, Fut>(
        &self,
        target: Arc<dyn DurableTier>,
        timeout: Duration,
        catch_up: F,
    ) -> Result<Arc<dyn DurableTier>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.open_pending()?;

        let critical = tokio::time::timeout(timeout, async {
            let _exclusive = self.in_flight.write().await;
            catch_up().await?;
            Ok::<_, StrataError>(self.swap(target))
        })
        .await;

        let outcome = match critical {
            Ok(Ok(previous)) => Ok(previous),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StrataError::CutoverTimeout(timeout.as_secs())),
        };

        let parked = self.close_pending();
        self.apply_parked(parked).await;
        outcome
    }

    fn open_pending(&self) -> Result<()> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| StrataError::Storage("cutover buffer lock poisoned".to_string()))?;
        if pending.is_some() {
            return Err(StrataError::Migration("a cutover is already running".to_string()));
        }
        *pending = Some(Vec::new());
        Ok(())
    }

    fn close_pending(&self) -> Vec<PendingWrite> {
        self.pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.take())
            .unwrap_or_default()
    }

    async fn apply_parked(&self, parked: Vec<PendingWrite>) {
        if parked.is_empty() {
            return;
        }
        let tier = self.active();
        debug!("Applying {} parked write(s) to {}", parked.len(), tier.name());

        for PendingWrite { op, respond } in parked {
            let result = match &op {
                PendingOp::Write(record) => self
                    .retry
                    .run("write", || tier.write(record))
                    .await
                    .map(|_| true),
                PendingOp::Delete(id) => self.delete_checked(&tier, *id).await,
            };
            self.note_change(op.id());
            self.observe(&result);
            // The caller may have given up waiting; the write still stands.
            let _ = respond.send(result);
        }
    }
}

fn kind(op: &PendingOp) -> &'static str {
    match op {
        PendingOp::Write(_) => "write",
        PendingOp::Delete(_) => "delete",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FaultyDurable, InMemoryDurable, unit_vector};

    fn handle(tier: Arc<dyn DurableTier>) -> Arc<DurableHandle> {
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            attempt_timeout: Duration::from_millis(500),
        };
        Arc::new(DurableHandle::new(tier, retry))
    }

    #[tokio::test]
    async fn test_writes_go_to_active_tier() {
        let source = Arc::new(InMemoryDurable::new("a"));
        let handle = handle(source.clone());

        let record = MemoryRecord::new("x", unit_vector(4, 0));
        handle.write(&record).await.unwrap();

        assert!(source.contains(record.id));
        assert_eq!(handle.active_name(), "a");
    }

    #[tokio::test]
    async fn test_journal_tracks_changes_while_on() {
        let handle = handle(Arc::new(InMemoryDurable::new("a")));

        let before = MemoryRecord::new("before", unit_vector(4, 0));
        handle.write(&before).await.unwrap();

        handle.start_journal();
        let during = MemoryRecord::new("during", unit_vector(4, 1));
        handle.write(&during).await.unwrap();
        handle.delete(before.id).await.unwrap();

        let mut expected = vec![before.id, during.id];
        expected.sort();
        assert_eq!(handle.drain_journal(), expected);
        assert!(handle.drain_journal().is_empty());

        handle.stop_journal();
        handle.write(&MemoryRecord::new("after", unit_vector(4, 2))).await.unwrap();
        assert!(handle.drain_journal().is_empty());
    }

    #[tokio::test]
    async fn test_delete_committed_before_error_is_not_reported_missing() {
        let inner = Arc::new(InMemoryDurable::new("a"));
        let faulty = Arc::new(FaultyDurable::new(inner.clone()));
        let handle = handle(faulty.clone());

        let record = MemoryRecord::new("x", unit_vector(4, 0));
        handle.write(&record).await.unwrap();

        faulty.inject(|f| f.delete_failures_after_commit = 1);
        assert!(handle.delete(record.id).await.unwrap());
        assert!(!inner.contains(record.id));
    }

    #[tokio::test]
    async fn test_delete_absent_returns_false() {
        let handle = handle(Arc::new(InMemoryDurable::new("a")));
        assert!(!handle.delete(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_error_count_resets_on_swap() {
        let faulty = Arc::new(FaultyDurable::new(Arc::new(InMemoryDurable::new("a"))));
        let handle = handle(faulty.clone());

        faulty.inject(|f| f.fail_everything = true);
        assert!(handle.get(Uuid::new_v4()).await.is_err());
        assert!(handle.error_count() > 0);

        handle.swap(Arc::new(InMemoryDurable::new("b")));
        assert_eq!(handle.error_count(), 0);
    }

    mod cutover {
        use super::*;

        #[tokio::test]
        async fn test_cutover_swaps_after_catch_up() {
            let source = Arc::new(InMemoryDurable::new("source"));
            let target = Arc::new(InMemoryDurable::new("target"));
            let handle = handle(source.clone());

            let previous = handle
                .cutover(target.clone(), Duration::from_secs(1), || async { Ok(()) })
                .await
                .unwrap();

            assert_eq!(previous.name(), "source");
            assert_eq!(handle.active_name(), "target");
        }

        #[tokio::test]
        async fn test_writes_during_cutover_land_on_target() {
            let source = Arc::new(InMemoryDurable::new("source"));
            let target = Arc::new(InMemoryDurable::new("target"));
            let handle = handle(source.clone());

            let (release_tx, release_rx) = oneshot::channel::<()>();
            let cutover = {
                let handle = handle.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    handle
                        .cutover(target, Duration::from_secs(5), || async move {
                            let _ = release_rx.await;
                            Ok(())
                        })
                        .await
                        .map(|_| ())
                })
            };

            while handle.pending.lock().unwrap().is_none() {
                tokio::task::yield_now().await;
            }

            let record = MemoryRecord::new("parked", unit_vector(4, 0));
            let writer = {
                let handle = handle.clone();
                let record = record.clone();
                tokio::spawn(async move { handle.write(&record).await })
            };

            while handle.pending_count() == 0 {
                tokio::task::yield_now().await;
            }
            release_tx.send(()).unwrap();

            cutover.await.unwrap().unwrap();
            writer.await.unwrap().unwrap();

            assert!(target.contains(record.id));
            assert!(!source.contains(record.id));
        }

        #[tokio::test]
        async fn test_timeout_keeps_source_and_applies_parked_writes_there() {
            let source = Arc::new(InMemoryDurable::new("source"));
            let target = Arc::new(InMemoryDurable::new("target"));
            let handle = handle(source.clone());

            let cutover = {
                let handle = handle.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    handle
                        .cutover(target, Duration::from_millis(200), || async {
                            tokio::time::sleep(Duration::from_secs(10)).await;
                            Ok(())
                        })
                        .await
                        .map(|_| ())
                })
            };

            while handle.pending.lock().unwrap().is_none() {
                tokio::task::yield_now().await;
            }

            let record = MemoryRecord::new("parked", unit_vector(4, 1));
            let written = handle.write(&record).await;

            let result = cutover.await.unwrap();
            assert!(matches!(result, Err(StrataError::CutoverTimeout(_))));
            assert!(written.is_ok());
            assert_eq!(handle.active_name(), "source");
            assert!(source.contains(record.id));
            assert!(!target.contains(record.id));
        }

        #[tokio::test]
        async fn test_parked_writes_are_bounded() {
            let handle = Arc::new(
                DurableHandle::new(Arc::new(InMemoryDurable::new("a")), RetryPolicy::default())
                    .with_pending_limits(1, Duration::from_millis(50)),
            );
            handle.open_pending().unwrap();

            let first = handle.park(PendingOp::Delete(Uuid::new_v4())).unwrap();
            assert!(first.is_some());

            let second = handle.park(PendingOp::Delete(Uuid::new_v4()));
            assert!(matches!(second, Err(StrataError::ResourceExhausted(_))));

            assert!(matches!(
                handle.open_pending(),
                Err(StrataError::Migration(_))
            ));
        }
    }
}
