use crate::ingest::Fingerprint;
use crate::router::QuestionKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use uuid::Uuid;

/// Older records sharing a keyword with the question that may join the window.
const MAX_RELATED: usize = 3;
/// Answers are clipped to this many characters when rendered into a prompt.
const ANSWER_PREVIEW_CHARS: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    /// Computed from the cached analysis
    Engine,
    /// Returned by the LLM collaborator
    Collaborator,
    /// Canned response used when no collaborator is reachable
    Fallback,
    /// Session conclusions kept for later prompts, not a user question
    Conclusions,
}

impl AnswerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Engine => "engine",
            Self::Collaborator => "collaborator",
            Self::Fallback => "fallback",
            Self::Conclusions => "conclusions",
        }
    }
}

/// One question/answer turn. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    pub question: String,
    pub answer: String,
    pub kind: QuestionKind,
    pub source: AnswerSource,
    /// Analysis fields the answer was built from, e.g. `correlations.price.qty`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

impl MemoryRecord {
    pub fn new(
        fingerprint: Fingerprint,
        question: impl Into<String>,
        answer: impl Into<String>,
        kind: QuestionKind,
        source: AnswerSource,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            fingerprint,
            question: question.into(),
            answer: answer.into(),
            kind,
            source,
            references: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_references(mut self, references: Vec<String>) -> Self {
        self.references = references;
        self
    }
}

fn keywords(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 4)
        .map(str::to_lowercase)
        .collect()
}

/// The records of one dataset in insertion order. Rebuilt per request.
#[derive(Clone, Debug, Default)]
pub struct ConversationContext {
    records: Vec<Arc<MemoryRecord>>,
}

impl ConversationContext {
    pub fn new(records: Vec<Arc<MemoryRecord>>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[Arc<MemoryRecord>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The `n` most recent records.
    pub fn recent(&self, n: usize) -> &[Arc<MemoryRecord>] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }

    /// The `n` most recent records, preceded by up to three older ones that
    /// share a keyword with `question`. Insertion order is kept.
    pub fn window(&self, n: usize, question: &str) -> Vec<Arc<MemoryRecord>> {
        let start = self.records.len().saturating_sub(n);
        let wanted = keywords(question);
        let mut related: Vec<Arc<MemoryRecord>> = self.records[..start]
            .iter()
            .rev()
            .filter(|r| !keywords(&r.question).is_disjoint(&wanted))
            .take(MAX_RELATED)
            .cloned()
            .collect();
        related.reverse();
        related.extend(self.records[start..].iter().cloned());
        related
    }

    /// Renders records as `Q:`/`A:` pairs for a prompt.
    pub fn render(records: &[Arc<MemoryRecord>]) -> String {
        let mut out = String::new();
        for r in records {
            let answer: String = r.answer.chars().take(ANSWER_PREVIEW_CHARS).collect();
            let ellipsis = if r.answer.chars().count() > ANSWER_PREVIEW_CHARS {
                "..."
            } else {
                ""
            };
            let _ = writeln!(out, "Q: {}\nA: {answer}{ellipsis}", r.question);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(question: &str) -> Arc<MemoryRecord> {
        Arc::new(MemoryRecord::new(
            Fingerprint::from("fp"),
            question,
            "answer",
            QuestionKind::OpenEnded,
            AnswerSource::Fallback,
        ))
    }

    #[test]
    fn test_record_roundtrips_as_json_line() {
        let rec = MemoryRecord::new(
            Fingerprint::from("abc"),
            "what is the mean?",
            "42",
            QuestionKind::Descriptive,
            AnswerSource::Engine,
        )
        .with_references(vec!["columns.x.mean".to_owned()]);
        let line = serde_json::to_string(&rec).expect("serialize");
        assert!(!line.contains('\n'));
        assert!(line.contains("\"source\":\"engine\""));
        let back: MemoryRecord = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(back, rec);
    }

    #[test]
    fn test_window_adds_related_older_records() {
        let ctx = ConversationContext::new(vec![
            record("tell me about revenue trends"),
            record("unrelated thing"),
            record("latest one"),
            record("another latest"),
        ]);
        assert_eq!(ctx.recent(2).len(), 2);
        assert_eq!(ctx.recent(10).len(), 4);

        let window = ctx.window(2, "Why did Revenue drop?");
        let questions: Vec<&str> = window.iter().map(|r| r.question.as_str()).collect();
        assert_eq!(
            questions,
            vec!["tell me about revenue trends", "latest one", "another latest"]
        );
    }

    #[test]
    fn test_render_clips_long_answers() {
        let mut rec = MemoryRecord::new(
            Fingerprint::from("fp"),
            "q",
            "x".repeat(500),
            QuestionKind::OpenEnded,
            AnswerSource::Collaborator,
        );
        rec.references.clear();
        let text = ConversationContext::render(&[Arc::new(rec)]);
        assert!(text.starts_with("Q: q\nA: "));
        assert!(text.trim_end().ends_with("..."));
        assert!(text.len() < 300);
    }
}
