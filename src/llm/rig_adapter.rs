//! Bridge from a rig completion model to `TextGenerator`.

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel};

use super::TextGenerator;
use crate::error::LlmError;

const TEMPERATURE: f64 = 0.2;
const MAX_TOKENS: u64 = 1000;

/// A rig completion model plus the system preamble sent with every request.
pub struct RigGenerator<M: CompletionModel> {
    model: M,
    model_name: String,
    preamble: String,
}

impl<M: CompletionModel> RigGenerator<M> {
    pub fn new(model: M, model_name: &str, preamble: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
            preamble: preamble.to_string(),
        }
    }
}

#[async_trait]
impl<M> TextGenerator for RigGenerator<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let response = self
            .model
            .completion_request(prompt.to_string())
            .preamble(self.preamble.clone())
            .temperature(TEMPERATURE)
            .max_tokens(MAX_TOKENS)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: self.model_name.clone(),
                reason: e.to_string(),
            })?;

        let answer: String = response
            .choice
            .iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        let answer = answer.trim();
        if answer.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "no text in completion".to_string(),
            });
        }
        Ok(answer.to_string())
    }
}
