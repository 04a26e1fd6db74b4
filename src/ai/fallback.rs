use super::{CollaboratorPrompt, LlmCollaborator};
use crate::error::Result;
use async_trait::async_trait;

/// Deterministic stand-in used when no LLM is configured or reachable.
/// The same prompt always yields the same, non-empty answer.
#[derive(Clone, Copy, Debug, Default)]
pub struct CannedCollaborator;

impl CannedCollaborator {
    pub fn answer(prompt: &CollaboratorPrompt) -> String {
        let mut out = String::from(
            "AI assistance is not available, so this answer is based only on the computed statistics.\n",
        );
        if prompt.context_summary.trim().is_empty() {
            out.push_str("No analysis is available for this dataset yet.\n");
        } else {
            out.push('\n');
            out.push_str(prompt.context_summary.trim_end());
            out.push('\n');
        }
        out.push_str(
            "\nFor precise answers, ask about descriptive statistics (mean, median, distribution), \
             correlations between columns, or outliers.",
        );
        out
    }
}

#[async_trait]
impl LlmCollaborator for CannedCollaborator {
    fn name(&self) -> &'static str {
        "canned"
    }

    fn is_live(&self) -> bool {
        false
    }

    async fn complete(&self, prompt: &CollaboratorPrompt) -> Result<String> {
        Ok(Self::answer(prompt))
    }
}
