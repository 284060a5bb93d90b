//! Coalesced access-time updates
//!
//! Reads report the ids they returned here instead of writing to the
//! durable tier themselves. Ids collected during one interval are stamped
//! with a single `touch` call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use tracing::debug;
use uuid::Uuid;

use crate::storage::DurableHandle;

pub struct AccessRecorder {
    durable: Arc<DurableHandle>,
    pending: DashSet<Uuid>,
    scheduled: AtomicBool,
    interval: Duration,
}

impl AccessRecorder {
    pub fn new(durable: Arc<DurableHandle>, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            durable,
            pending: DashSet::new(),
            scheduled: AtomicBool::new(false),
            interval,
        })
    }

    /// Ids waiting for the next flush
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Queue `ids` for the next flush, scheduling one if none is pending
    pub fn record(self: &Arc<Self>, ids: impl IntoIterator<Item = Uuid>) {
        for id in ids {
            self.pending.insert(id);
        }
        if self.pending.is_empty() || self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.interval).await;
            // Ids queued after this point schedule the next flush
            this.scheduled.store(false, Ordering::SeqCst);
            this.flush().await;
        });
    }

    /// Stamp every queued id now
    pub async fn flush(&self) {
        let ids: Vec<Uuid> = self.pending.iter().map(|id| *id).collect();
        if ids.is_empty() {
            return;
        }
        for id in &ids {
            self.pending.remove(id);
        }

        if let Err(e) = self.durable.touch(&ids, Utc::now()).await {
            debug!("Failed to record access for {} record(s): {}", ids.len(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRecord;
    use crate::storage::{DurableTier, RetryPolicy};
    use crate::testing::{FaultyDurable, InMemoryDurable, unit_vector};

    async fn create_recorder() -> (Arc<AccessRecorder>, Arc<FaultyDurable>, Vec<MemoryRecord>) {
        let inner = Arc::new(InMemoryDurable::new("primary"));
        let tier = Arc::new(FaultyDurable::new(inner));
        let mut records = Vec::new();
        for axis in 0..3 {
            let record = MemoryRecord::new("seen", unit_vector(4, axis));
            tier.write(&record).await.unwrap();
            records.push(record);
        }

        let durable = Arc::new(DurableHandle::new(tier.clone(), RetryPolicy::default()));
        let recorder = AccessRecorder::new(durable, Duration::from_secs(1));
        (recorder, tier, records)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_in_one_interval_share_one_touch() {
        let (recorder, tier, records) = create_recorder().await;
        let before = tier.calls();

        recorder.record([records[0].id]);
        recorder.record([records[1].id, records[0].id]);
        recorder.record([records[2].id]);
        assert_eq!(recorder.pending(), 3);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(tier.calls() - before, 1);
        assert_eq!(recorder.pending(), 0);
        for record in &records {
            let stored = tier.get(record.id).await.unwrap().unwrap();
            assert!(stored.last_accessed_at > record.last_accessed_at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_reads_schedule_another_flush() {
        let (recorder, tier, records) = create_recorder().await;
        let before = tier.calls();

        recorder.record([records[0].id]);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        recorder.record([records[1].id]);
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(tier.calls() - before, 2);
        assert_eq!(recorder.pending(), 0);
    }

    #[tokio::test]
    async fn test_nothing_recorded_means_no_touch() {
        let (recorder, tier, _records) = create_recorder().await;
        let before = tier.calls();

        recorder.record(std::iter::empty());
        recorder.flush().await;

        assert_eq!(tier.calls(), before);
    }
}
