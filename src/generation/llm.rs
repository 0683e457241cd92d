//! Generator backed by a chat-completions provider.

use async_trait::async_trait;

use super::Generator;
use crate::error::GenerationError;
use crate::llm::{ChatRequest, LlmProvider, Message, DEFAULT_MODEL};

/// Sampling parameters sent with every request.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 500,
            temperature: 0.7,
        }
    }
}

/// Sends the prompt as a single user message and returns the first choice.
pub struct LlmGenerator<P: LlmProvider> {
    provider: P,
    settings: LlmSettings,
}

impl<P: LlmProvider> LlmGenerator<P> {
    pub fn new(provider: P, settings: LlmSettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }
}

#[async_trait]
impl<P: LlmProvider> Generator for LlmGenerator<P> {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let request = ChatRequest::new(&self.settings.model, vec![Message::user(prompt)])
            .with_max_tokens(self.settings.max_tokens)
            .with_temperature(self.settings.temperature);

        let response = self.provider.generate(request).await?;

        match response.first_content().map(str::trim) {
            Some(text) if !text.is_empty() => Ok(text.to_string()),
            _ => Err(GenerationError::EmptyResponse),
        }
    }

    fn name(&self) -> &str {
        &self.settings.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{ChatResponse, Choice, Usage};
    use std::sync::Mutex;

    struct ScriptedProvider {
        content: Option<String>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn answering(content: Option<&str>) -> Self {
            Self {
                content: content.map(str::to_string),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn generate(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
            self.seen.lock().expect("lock").push(request);
            let choices = self
                .content
                .iter()
                .map(|c| Choice {
                    index: 0,
                    message: Message::assistant(c.clone()),
                    finish_reason: Some("stop".to_string()),
                })
                .collect();
            Ok(ChatResponse {
                id: "test".to_string(),
                model: "test".to_string(),
                choices,
                usage: Usage::default(),
            })
        }
    }

    #[tokio::test]
    async fn test_sends_prompt_with_settings() {
        let generator = LlmGenerator::new(
            ScriptedProvider::answering(Some("Paris")),
            LlmSettings::default(),
        );

        let text = generator
            .generate("Capital of France?")
            .await
            .expect("generation should succeed");
        assert_eq!(text, "Paris");

        let seen = generator.provider.seen.lock().expect("lock");
        assert_eq!(seen[0].model, "gpt-3.5-turbo");
        assert_eq!(seen[0].max_tokens, Some(500));
        assert_eq!(seen[0].temperature, Some(0.7));
        assert_eq!(seen[0].messages, vec![Message::user("Capital of France?")]);
    }

    #[tokio::test]
    async fn test_empty_completion_is_an_error() {
        for content in [None, Some("   ")] {
            let generator =
                LlmGenerator::new(ScriptedProvider::answering(content), LlmSettings::default());
            let result = generator.generate("anything").await;
            assert!(matches!(result, Err(GenerationError::EmptyResponse)));
        }
    }

    #[tokio::test]
    async fn test_provider_error_propagates() {
        struct Down;

        #[async_trait]
        impl LlmProvider for Down {
            async fn generate(&self, _request: ChatRequest) -> Result<ChatResponse, LlmError> {
                Err(LlmError::RateLimited("slow down".to_string()))
            }
        }

        let generator = LlmGenerator::new(Down, LlmSettings::default());
        let result = generator.generate("anything").await;
        assert!(matches!(
            result,
            Err(GenerationError::Provider(LlmError::RateLimited(_)))
        ));
    }
}
