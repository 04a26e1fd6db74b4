//! Per-session analysis cache: at most one successful computation per
//! fingerprint. Concurrent requests for the same fingerprint wait on the
//! first; a failed or cancelled computation leaves nothing behind.

use super::types::AnalysisResult;
use crate::error::Result;
use crate::ingest::Fingerprint;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

type Slot = Arc<OnceCell<Arc<AnalysisResult>>>;

#[derive(Debug, Default)]
pub struct AnalysisCache {
    slots: Mutex<HashMap<Fingerprint, Slot>>,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, fingerprint: &Fingerprint) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(fingerprint.clone()).or_default())
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<AnalysisResult>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(fingerprint)?.get().cloned()
    }

    pub async fn get_or_try_init<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        compute: F,
    ) -> Result<Arc<AnalysisResult>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AnalysisResult>>,
    {
        let slot = self.slot(fingerprint);
        let result = slot
            .get_or_try_init(|| async { compute().await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(result))
    }

    /// Drops the cached result so the next request recomputes it.
    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(fingerprint).is_some()
    }

    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|s| s.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Coverage, RowErrorLog};
    use crate::analyser::types::{CorrelationMatrix, DataQuality};
    use crate::error::EdaError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn empty_result(fp: &Fingerprint) -> AnalysisResult {
        AnalysisResult {
            fingerprint: fp.clone(),
            dataset_name: "t".to_owned(),
            row_count: 0,
            rows_aggregated: 0,
            columns: Vec::new(),
            correlations: CorrelationMatrix {
                columns: Vec::new(),
                data: Vec::new(),
            },
            strong_correlations: Vec::new(),
            anomalies: Vec::new(),
            quality: DataQuality::default(),
            coverage: Coverage {
                partitions_total: 0,
                partitions_read: 0,
                rows_total: 0,
                rows_covered: 0,
                rows_aggregated: 0,
                fraction: 1.0,
            },
            row_errors: RowErrorLog::default(),
            partition_errors: Vec::new(),
            insufficient: Vec::new(),
            aggregation_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_computes_once() {
        let cache = AnalysisCache::new();
        let fp = Fingerprint::from("one");
        let runs = AtomicUsize::new(0);

        for _ in 0..3 {
            let result = cache
                .get_or_try_init(&fp, || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(empty_result(&fp))
                })
                .await
                .expect("analysis");
            assert_eq!(result.fingerprint, fp);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_wait_for_one_computation() {
        let cache = Arc::new(AnalysisCache::new());
        let fp = Fingerprint::from("shared");
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let (cache, fp, runs) = (Arc::clone(&cache), fp.clone(), Arc::clone(&runs));
            tasks.spawn(async move {
                cache
                    .get_or_try_init(&fp, || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                        Ok(empty_result(&fp))
                    })
                    .await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            results.push(joined.expect("task").expect("analysis"));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let cache = AnalysisCache::new();
        let fp = Fingerprint::from("two");

        let err = cache
            .get_or_try_init(&fp, || async { Err(EdaError::Cancelled) })
            .await
            .unwrap_err();
        assert!(matches!(err, EdaError::Cancelled));
        assert!(cache.get(&fp).is_none());
        assert!(cache.is_empty());

        let ok = cache
            .get_or_try_init(&fp, || async { Ok(empty_result(&fp)) })
            .await;
        assert!(ok.is_ok());
        assert!(cache.get(&fp).is_some());

        assert!(cache.invalidate(&fp));
        assert!(cache.get(&fp).is_none());
    }
}
