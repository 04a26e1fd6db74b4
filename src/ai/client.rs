//! OpenAI-backed collaborator.

use super::{CollaboratorPrompt, LlmCollaborator};
use crate::config::AIConfig;
use crate::error::{EdaError, Result};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use secrecy::{ExposeSecret as _, SecretString};
use std::time::Duration;

pub struct OpenAiCollaborator {
    client: Client<OpenAIConfig>,
    config: AIConfig,
}

fn external(msg: impl std::fmt::Display) -> EdaError {
    EdaError::ExternalService(msg.to_string())
}

impl OpenAiCollaborator {
    pub fn new(api_key: SecretString, config: AIConfig) -> Self {
        let openai_config = OpenAIConfig::new().with_api_key(api_key.expose_secret());
        let client = Client::with_config(openai_config);
        Self { client, config }
    }

    fn build_request(&self, prompt: &CollaboratorPrompt) -> Result<CreateChatCompletionRequest> {
        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system_prompt())
                .build()
                .map_err(external)?
                .into(),
        ];

        if !prompt.context_summary.is_empty() {
            messages.push(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(format!("Dataset summary:\n{}", prompt.context_summary))
                    .build()
                    .map_err(external)?
                    .into(),
            );
        }
        if !prompt.conversation_window.is_empty() {
            messages.push(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(format!(
                        "Earlier in this conversation:\n{}",
                        prompt.conversation_window
                    ))
                    .build()
                    .map_err(external)?
                    .into(),
            );
        }
        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt.question.as_str())
                .build()
                .map_err(external)?
                .into(),
        );

        CreateChatCompletionRequestArgs::default()
            .model(&self.config.model)
            .messages(messages)
            .temperature(self.config.temperature)
            .max_tokens(self.config.max_tokens)
            .build()
            .map_err(external)
    }
}

#[async_trait]
impl LlmCollaborator for OpenAiCollaborator {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn is_live(&self) -> bool {
        true
    }

    async fn complete(&self, prompt: &CollaboratorPrompt) -> Result<String> {
        let request = self.build_request(prompt)?;
        let timeout = Duration::from_secs(self.config.timeout_secs);

        let response = tokio::time::timeout(timeout, self.client.chat().create(request))
            .await
            .map_err(|_| external(format!("OpenAI request timed out after {timeout:?}")))?
            .map_err(|e| external(format!("OpenAI API error: {e}")))?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| external("No response content received"))
    }
}

fn system_prompt() -> &'static str {
    r"You are a data analysis assistant answering questions about a single tabular dataset.
You are given a statistical summary computed over the whole file and the recent questions
and answers of this conversation.

When answering:
- Be concise and practical
- Ground every claim in the summary; say so when the summary cannot answer the question
- Mention when statistics were computed from partial coverage
- Explain statistical concepts in accessible terms
- Answer in the language of the question"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt() {
        let prompt = system_prompt();
        assert!(prompt.contains("data analysis"));
        assert!(prompt.contains("partial coverage"));
    }

    #[test]
    fn test_request_includes_context_and_window() {
        let collaborator =
            OpenAiCollaborator::new(SecretString::new("sk-test".into()), AIConfig::default());
        let request = collaborator
            .build_request(&CollaboratorPrompt {
                context_summary: "3 columns".to_owned(),
                conversation_window: "Q: hi\nA: hello\n".to_owned(),
                question: "What now?".to_owned(),
            })
            .expect("request");
        assert_eq!(request.messages.len(), 4);
        assert_eq!(request.model, "gpt-4o");

        let bare = collaborator
            .build_request(&CollaboratorPrompt {
                question: "Only this".to_owned(),
                ..CollaboratorPrompt::default()
            })
            .expect("request");
        assert_eq!(bare.messages.len(), 2);
    }
}
