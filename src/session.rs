//! The entry point for callers: load datasets, request analyses, ask
//! questions. A session owns the dataset registry, the analysis cache, the
//! memory store and the router; nothing is global.

use crate::aggregate::{AggregatorOptions, CancelHandle, ProgressFn, StreamingAggregator};
use crate::ai::{LlmCollaborator, collaborator_from_settings};
use crate::analyser::{AnalysisCache, AnalysisResult, analyse, summary};
use crate::config::Settings;
use crate::error::{EdaError, Result};
use crate::ingest::{DataSource, Dataset, Fingerprint, Partitioner};
use crate::memory::{
    AnswerSource, ClearScope, DatasetSummary, MemoryRecord, MemoryStore, RetentionPolicy,
};
use crate::router::{AnalysisProvider, Answer, QueryRouter, QuestionKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

/// Questions listed by [`Session::summary`].
pub const RECENT_QUESTIONS: usize = 5;

const CONCLUSIONS_QUESTION: &str = "Session conclusions";

pub struct Session {
    settings: Settings,
    aggregator: AggregatorOptions,
    datasets: RwLock<HashMap<Fingerprint, Arc<Partitioner>>>,
    cache: AnalysisCache,
    router: QueryRouter,
}

impl Session {
    pub fn new(
        settings: Settings,
        memory: Arc<MemoryStore>,
        collaborator: Arc<dyn LlmCollaborator>,
    ) -> Result<Self> {
        settings.validate()?;
        let router = QueryRouter::new(memory, collaborator, settings.memory.context_window);
        Ok(Self {
            aggregator: AggregatorOptions::from_settings(&settings),
            settings,
            datasets: RwLock::new(HashMap::new()),
            cache: AnalysisCache::new(),
            router,
        })
    }

    /// Opens the persisted memory store and picks the collaborator from settings.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let memory = MemoryStore::open(
            settings.memory_path(),
            RetentionPolicy::from_config(&settings.memory),
        )?;
        let collaborator = collaborator_from_settings(&settings.ai);
        Self::new(settings, Arc::new(memory), collaborator)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        self.router.memory()
    }

    /// Scans and registers a dataset. Reloading a dataset with the same
    /// fingerprint drops its cached analysis; its memory is kept.
    pub async fn load(&self, source: DataSource) -> Result<Arc<Dataset>> {
        let ingest = self.settings.ingest.clone();
        let partitioner = tokio::task::spawn_blocking(move || {
            Partitioner::scan(Arc::new(source), &ingest)
        })
        .await
        .map_err(|e| EdaError::Other(format!("Scan task failed: {e}")))??;

        let dataset = partitioner.dataset();
        let replaced = self
            .datasets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(dataset.fingerprint.clone(), Arc::new(partitioner))
            .is_some();
        if replaced {
            self.cache.invalidate(&dataset.fingerprint);
            tracing::info!(
                fingerprint = %dataset.fingerprint.short(),
                "Reloaded dataset, cached analysis dropped"
            );
        }
        Ok(dataset)
    }

    pub async fn load_path(&self, path: impl AsRef<Path>) -> Result<Arc<Dataset>> {
        self.load(DataSource::from_path(path)?).await
    }

    fn partitioner(&self, fingerprint: &Fingerprint) -> Result<Arc<Partitioner>> {
        self.datasets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| EdaError::DatasetNotFound(fingerprint.to_string()))
    }

    pub fn dataset(&self, fingerprint: &Fingerprint) -> Option<Arc<Dataset>> {
        self.partitioner(fingerprint).ok().map(|p| p.dataset())
    }

    pub fn datasets(&self) -> Vec<Arc<Dataset>> {
        let datasets = self.datasets.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<Arc<Dataset>> = datasets.values().map(|p| p.dataset()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub async fn get_analysis(&self, fingerprint: &Fingerprint) -> Result<Arc<AnalysisResult>> {
        self.get_analysis_with(fingerprint, &CancelHandle::new(), None)
            .await
    }

    /// Computes the analysis at most once per fingerprint. A cancelled or
    /// failed run caches nothing.
    pub async fn get_analysis_with(
        &self,
        fingerprint: &Fingerprint,
        cancel: &CancelHandle,
        progress: Option<ProgressFn>,
    ) -> Result<Arc<AnalysisResult>> {
        let partitioner = self.partitioner(fingerprint)?;
        self.cache
            .get_or_try_init(fingerprint, move || async move {
                let output = StreamingAggregator::new(self.aggregator.clone())
                    .run(partitioner, cancel, progress)
                    .await?;
                Ok(analyse(&output, &self.settings.analysis))
            })
            .await
    }

    pub fn cached_analysis(&self, fingerprint: &Fingerprint) -> Option<Arc<AnalysisResult>> {
        self.cache.get(fingerprint)
    }

    pub async fn submit(&self, question: &str, fingerprint: &Fingerprint) -> Result<Answer> {
        self.router.submit(self, fingerprint, question).await
    }

    /// What has been asked about a dataset, with the latest questions.
    pub fn summary(&self, fingerprint: &Fingerprint) -> DatasetSummary {
        self.memory().summary(fingerprint, RECENT_QUESTIONS)
    }

    /// Conclusions from the questions asked so far and the analysis findings.
    /// Computes the analysis if it is not cached yet.
    pub async fn conclusions(&self, fingerprint: &Fingerprint) -> Result<Vec<String>> {
        let analysis = self.get_analysis(fingerprint).await?;
        let history = self.memory().summary(fingerprint, 0);
        Ok(summary::conclusions(&analysis, &history))
    }

    /// Like [`Session::conclusions`], and also appends them to memory so later
    /// open-ended questions see them in their context.
    pub async fn record_conclusions(&self, fingerprint: &Fingerprint) -> Result<Vec<String>> {
        let conclusions = self.conclusions(fingerprint).await?;
        if !conclusions.is_empty() {
            let record = MemoryRecord::new(
                fingerprint.clone(),
                CONCLUSIONS_QUESTION,
                conclusions.join("\n"),
                QuestionKind::OpenEnded,
                AnswerSource::Conclusions,
            )
            .with_references(vec!["strong_correlations".to_owned(), "anomalies".to_owned()]);
            self.memory().append(record)?;
            tracing::info!(
                fingerprint = %fingerprint.short(),
                "Recorded {} conclusions",
                conclusions.len()
            );
        }
        Ok(conclusions)
    }

    /// Clears memory for one dataset, or all of it.
    pub fn clear(&self, scope: &ClearScope) -> Result<usize> {
        self.memory().clear(scope)
    }
}

#[async_trait]
impl AnalysisProvider for Session {
    async fn analysis(&self, fingerprint: &Fingerprint) -> Result<Arc<AnalysisResult>> {
        self.get_analysis(fingerprint).await
    }
}
