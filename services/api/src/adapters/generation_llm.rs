//! services/api/src/adapters/generation_llm.rs
//!
//! This module contains the adapter for the reply-generating LLM.
//! It implements the `TextGenerationService` port from the `core` crate.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestSystemMessageContent, ChatCompletionRequestUserMessage,
        ChatCompletionRequestUserMessageContent, CreateChatCompletionRequest,
    },
    Client,
};
use async_trait::async_trait;
use research_assistant_core::ports::{
    GeneratedText, PortError, PortResult, Prompt, TextGenerationService,
};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `TextGenerationService` using an OpenAI-compatible LLM.
#[derive(Clone)]
pub struct OpenAiGenerationAdapter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiGenerationAdapter {
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }

    fn build_request(&self, prompt: &Prompt) -> CreateChatCompletionRequest {
        let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(2);
        if !prompt.instructions.is_empty() {
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessage {
                    content: ChatCompletionRequestSystemMessageContent::Text(
                        prompt.instructions.clone(),
                    ),
                    name: None,
                },
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(prompt.query.clone()),
                name: None,
            },
        ));

        CreateChatCompletionRequest {
            model: self.model.clone(),
            messages,
            ..Default::default()
        }
    }
}

//=========================================================================================
// `TextGenerationService` Trait Implementation
//=========================================================================================

#[async_trait]
impl TextGenerationService for OpenAiGenerationAdapter {
    async fn generate(&self, prompt: &Prompt) -> PortResult<GeneratedText> {
        let request = self.build_request(prompt);

        // Map the provider error by hand, which respects the orphan rule.
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e: OpenAIError| PortError::Unexpected(e.to_string()))?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| {
                PortError::Unexpected("Generation LLM response contained no text content.".to_string())
            })?;

        let token_count = response.usage.map(|u| u.total_tokens).unwrap_or(0);

        Ok(GeneratedText {
            text,
            token_count,
            model: response.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_instructions_send_only_the_user_turn() {
        let adapter = OpenAiGenerationAdapter::new(Client::new(), "gpt-4o-mini".to_string());
        let with_system = adapter.build_request(&Prompt {
            instructions: "You are helpful.".into(),
            query: "hi".into(),
        });
        let bare = adapter.build_request(&Prompt {
            instructions: String::new(),
            query: "hi".into(),
        });

        assert_eq!(with_system.messages.len(), 2);
        assert_eq!(bare.messages.len(), 1);
        assert_eq!(bare.model, "gpt-4o-mini");
    }
}
