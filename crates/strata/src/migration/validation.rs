//! Sampled equivalence check between source and target deployments

use std::collections::HashSet;

use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::MigrationConfig;
use crate::error::{Result, StrataError};
use crate::memory::ScoredRecord;
use crate::storage::DurableTier;

/// Outcome of a validation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub sampled: usize,
    pub mismatches: usize,
    pub source_count: usize,
    pub target_count: usize,
}

impl ValidationReport {
    pub fn mismatch_rate(&self) -> f64 {
        if self.sampled == 0 {
            0.0
        } else {
            self.mismatches as f64 / self.sampled as f64
        }
    }

    pub fn counts_match(&self) -> bool {
        self.source_count == self.target_count
    }

    /// Fail if the mismatch rate exceeds `tolerance`.
    ///
    /// Counts are not checked here: live writes keep landing on the source
    /// while sampling runs. The orchestrator compares counts again inside
    /// the cutover critical section.
    pub fn check(&self, tolerance: f64) -> Result<()> {
        let rate = self.mismatch_rate();
        if rate > tolerance {
            return Err(StrataError::MigrationValidationFailed {
                mismatch_rate: rate,
                tolerance,
            });
        }
        Ok(())
    }
}

/// Every n-th record is sampled for a given sample rate
pub fn sample_stride(rate: f64) -> usize {
    if rate >= 1.0 || rate.is_nan() || rate <= 0.0 {
        return 1;
    }
    (1.0 / rate).ceil() as usize
}

/// Whether two top-k lists agree.
///
/// Identical id sets always agree. Differing sets still agree when the lists
/// have the same length and their scores match rank by rank within
/// `tolerance`, which is what an ANN index swapping near-tied neighbours
/// produces.
pub fn equivalent(source: &[ScoredRecord], target: &[ScoredRecord], tolerance: f32) -> bool {
    let source_ids: HashSet<Uuid> = source.iter().map(|r| r.record.id).collect();
    let target_ids: HashSet<Uuid> = target.iter().map(|r| r.record.id).collect();
    if source_ids == target_ids {
        return true;
    }

    source.len() == target.len()
        && source
            .iter()
            .zip(target)
            .all(|(a, b)| (a.similarity - b.similarity).abs() <= tolerance)
}

/// Compare `source` and `target` on a sample of the source's own embeddings
pub async fn validate(
    source: &dyn DurableTier,
    target: &dyn DurableTier,
    config: &MigrationConfig,
) -> Result<ValidationReport> {
    let stride = sample_stride(config.validation_sample_rate);
    let top_k = config.validation_top_k.max(1);
    let mut report = ValidationReport::default();

    let mut after = None;
    let mut index = 0usize;
    loop {
        let page = source.scan(after, config.batch_size).await?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.id);

        let mut samples = Vec::new();
        for record in page {
            if index % stride == 0 {
                samples.push(record);
            }
            index += 1;
        }

        let outcomes: Vec<bool> = futures::stream::iter(samples)
            .map(|record| async move {
                let (expected, actual) = tokio::try_join!(
                    source.search(&record.embedding, top_k, None),
                    target.search(&record.embedding, top_k, None)
                )?;
                let matched = equivalent(&expected, &actual, config.similarity_tolerance);
                if !matched {
                    debug!("Validation mismatch for sample {}", record.id);
                }
                Ok::<_, StrataError>(matched)
            })
            .buffer_unordered(config.workers.max(1))
            .try_collect()
            .await?;

        report.sampled += outcomes.len();
        report.mismatches += outcomes.iter().filter(|matched| !**matched).count();
    }

    report.source_count = source.count().await?;
    report.target_count = target.count().await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRecord;
    use crate::testing::{FaultyDurable, InMemoryDurable, deterministic_embedding};
    use std::sync::Arc;

    fn scored(id: Uuid, similarity: f32) -> ScoredRecord {
        ScoredRecord::new(MemoryRecord::with_id(id, "x", vec![1.0]), similarity)
    }

    async fn filled(name: &str, n: u64) -> Arc<InMemoryDurable> {
        let tier = Arc::new(InMemoryDurable::new(name));
        for seed in 0..n {
            tier.write(&MemoryRecord::new("r", deterministic_embedding(seed, 16)))
                .await
                .unwrap();
        }
        tier
    }

    #[test]
    fn test_sample_stride() {
        assert_eq!(sample_stride(0.01), 100);
        assert_eq!(sample_stride(0.3), 4);
        assert_eq!(sample_stride(1.0), 1);
        assert_eq!(sample_stride(0.0), 1);
    }

    #[test]
    fn test_equivalent_same_ids_any_order() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(equivalent(
            &[scored(a, 0.9), scored(b, 0.8)],
            &[scored(b, 0.8), scored(a, 0.9)],
            0.0
        ));
    }

    #[test]
    fn test_equivalent_tolerates_near_ties() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let source = [scored(a, 0.9), scored(b, 0.700)];
        let swapped = [scored(a, 0.9), scored(c, 0.705)];
        let worse = [scored(a, 0.9), scored(c, 0.5)];

        assert!(equivalent(&source, &swapped, 0.01));
        assert!(!equivalent(&source, &worse, 0.01));
        assert!(!equivalent(&source, &swapped[..1], 0.01));
    }

    #[test]
    fn test_report_check() {
        let ok = ValidationReport {
            sampled: 100,
            mismatches: 1,
            source_count: 10,
            target_count: 10,
        };
        assert!(ok.check(0.01).is_ok());

        let bad = ValidationReport { mismatches: 2, ..ok.clone() };
        assert!(matches!(
            bad.check(0.01),
            Err(StrataError::MigrationValidationFailed { .. })
        ));

        let short = ValidationReport { target_count: 9, ..ok };
        assert!(!short.counts_match());
        assert!(short.check(0.01).is_ok());
    }

    #[tokio::test]
    async fn test_identical_copies_validate() {
        let source = filled("source", 40).await;
        let target = Arc::new(InMemoryDurable::new("target"));
        target.write_batch(&source.snapshot()).await.unwrap();

        let config = MigrationConfig {
            validation_sample_rate: 0.25,
            batch_size: 7,
            ..MigrationConfig::default()
        };
        let report = validate(source.as_ref(), target.as_ref(), &config).await.unwrap();

        assert_eq!(report.sampled, 10);
        assert_eq!(report.mismatches, 0);
        assert!(report.check(config.mismatch_tolerance).is_ok());
    }

    #[tokio::test]
    async fn test_broken_target_fails_validation() {
        let source = filled("source", 20).await;
        let inner = Arc::new(InMemoryDurable::new("target"));
        inner.write_batch(&source.snapshot()).await.unwrap();
        let target = FaultyDurable::new(inner);
        target.inject(|f| f.empty_search = true);

        let config = MigrationConfig {
            validation_sample_rate: 1.0,
            ..MigrationConfig::default()
        };
        let report = validate(source.as_ref(), &target, &config).await.unwrap();

        assert_eq!(report.sampled, 20);
        assert_eq!(report.mismatches, 20);
        assert!(report.check(config.mismatch_tolerance).is_err());
    }
}
