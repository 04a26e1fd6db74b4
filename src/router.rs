//! Question routing.
//!
//! Structured questions are answered from the cached analysis. Open-ended
//! ones go to the LLM collaborator with a compact summary and a window of the
//! conversation so far. Every answer is appended to memory.

pub mod classifier;

pub use classifier::{QuestionKind, classify, mentioned_columns};

use crate::ai::{CannedCollaborator, CollaboratorPrompt, LlmCollaborator};
use crate::analyser::{AnalysisResult, summary};
use crate::error::Result;
use crate::ingest::Fingerprint;
use crate::memory::{AnswerSource, ConversationContext, MemoryRecord, MemoryStore};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Answer {
    pub record_id: Uuid,
    pub fingerprint: Fingerprint,
    pub kind: QuestionKind,
    pub source: AnswerSource,
    pub text: String,
    /// Columns the question named.
    pub columns: Vec<String>,
    /// Fraction of rows behind the analysis the answer used.
    pub coverage: f64,
}

/// Supplies the analysis for a fingerprint, computing it on first use.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn analysis(&self, fingerprint: &Fingerprint) -> Result<Arc<AnalysisResult>>;
}

pub struct QueryRouter {
    memory: Arc<MemoryStore>,
    collaborator: Arc<dyn LlmCollaborator>,
    context_window: usize,
}

fn references(kind: QuestionKind, result: &AnalysisResult, columns: &[String]) -> Vec<String> {
    match kind {
        QuestionKind::Descriptive => {
            if columns.is_empty() {
                vec!["columns".to_owned(), "quality".to_owned()]
            } else {
                columns.iter().map(|c| format!("columns.{c}")).collect()
            }
        }
        QuestionKind::Correlation => {
            let numeric: Vec<&String> = columns
                .iter()
                .filter(|c| result.correlations.columns.contains(c))
                .collect();
            if numeric.len() >= 2 {
                let mut refs = Vec::new();
                for (i, a) in numeric.iter().enumerate() {
                    for b in &numeric[i + 1..] {
                        refs.push(format!("correlations.{a}.{b}"));
                    }
                }
                refs
            } else {
                vec!["strong_correlations".to_owned()]
            }
        }
        QuestionKind::Anomaly => {
            if columns.is_empty() {
                vec!["anomalies".to_owned()]
            } else {
                columns.iter().map(|c| format!("anomalies.{c}")).collect()
            }
        }
        QuestionKind::OpenEnded => vec!["summary".to_owned()],
    }
}

impl QueryRouter {
    pub fn new(
        memory: Arc<MemoryStore>,
        collaborator: Arc<dyn LlmCollaborator>,
        context_window: usize,
    ) -> Self {
        Self {
            memory,
            collaborator,
            context_window,
        }
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn collaborator(&self) -> &Arc<dyn LlmCollaborator> {
        &self.collaborator
    }

    pub async fn submit(
        &self,
        provider: &dyn AnalysisProvider,
        fingerprint: &Fingerprint,
        question: &str,
    ) -> Result<Answer> {
        let kind = classify(question);
        let analysis = provider.analysis(fingerprint).await?;
        let columns = mentioned_columns(question, analysis.columns.iter().map(|c| c.name.as_str()));

        tracing::debug!(
            fingerprint = %fingerprint.short(),
            %kind,
            ?columns,
            "Routing question"
        );

        let (text, source) = match kind {
            QuestionKind::Descriptive => (summary::descriptive(&analysis, &columns), AnswerSource::Engine),
            QuestionKind::Correlation => (summary::correlations(&analysis, &columns), AnswerSource::Engine),
            QuestionKind::Anomaly => (summary::anomalies(&analysis, &columns), AnswerSource::Engine),
            QuestionKind::OpenEnded => self.ask_collaborator(&analysis, fingerprint, question).await,
        };

        let record = MemoryRecord::new(fingerprint.clone(), question, text, kind, source)
            .with_references(references(kind, &analysis, &columns));
        let record = self.memory.append(record)?;

        Ok(Answer {
            record_id: record.id,
            fingerprint: fingerprint.clone(),
            kind,
            source,
            text: record.answer.clone(),
            columns,
            coverage: analysis.coverage.fraction,
        })
    }

    async fn ask_collaborator(
        &self,
        analysis: &AnalysisResult,
        fingerprint: &Fingerprint,
        question: &str,
    ) -> (String, AnswerSource) {
        let context = self.memory.context(fingerprint);
        let window = context.window(self.context_window, question);
        let prompt = CollaboratorPrompt {
            context_summary: summary::compact(analysis),
            conversation_window: ConversationContext::render(&window),
            question: question.to_owned(),
        };

        match self.collaborator.complete(&prompt).await {
            Ok(text) if self.collaborator.is_live() => (text, AnswerSource::Collaborator),
            Ok(text) => (text, AnswerSource::Fallback),
            Err(e) => {
                tracing::warn!(
                    "Collaborator '{}' failed, using canned answer: {e}",
                    self.collaborator.name()
                );
                (CannedCollaborator::answer(&prompt), AnswerSource::Fallback)
            }
        }
    }
}
