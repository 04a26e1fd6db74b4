//! LLM collaborator seam.
//!
//! The router only sees [`LlmCollaborator`]. Configuration decides whether
//! that is the OpenAI client or the deterministic canned implementation.

pub mod client;
pub mod fallback;

use crate::config::{AIConfig, api_key_from_env};
use crate::error::Result;
use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::Arc;

pub use client::OpenAiCollaborator;
pub use fallback::CannedCollaborator;

/// What the collaborator receives for an open-ended question.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollaboratorPrompt {
    pub context_summary: String,
    pub conversation_window: String,
    pub question: String,
}

#[async_trait]
pub trait LlmCollaborator: Send + Sync {
    fn name(&self) -> &'static str;

    /// False for implementations that never call out.
    fn is_live(&self) -> bool;

    /// Returns free text, or [`crate::error::EdaError::ExternalService`].
    async fn complete(&self, prompt: &CollaboratorPrompt) -> Result<String>;
}

/// The OpenAI collaborator when AI is enabled and a key is present, the
/// canned one otherwise.
pub fn collaborator_from_settings(config: &AIConfig) -> Arc<dyn LlmCollaborator> {
    collaborator_with_key(config, api_key_from_env())
}

pub fn collaborator_with_key(
    config: &AIConfig,
    api_key: Option<SecretString>,
) -> Arc<dyn LlmCollaborator> {
    match api_key {
        Some(key) if config.enabled => {
            tracing::info!("Using OpenAI collaborator ({})", config.model);
            Arc::new(OpenAiCollaborator::new(key, config.clone()))
        }
        _ => {
            tracing::info!("No AI credential configured, using canned collaborator");
            Arc::new(CannedCollaborator)
        }
    }
}
