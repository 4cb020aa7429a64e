//! Text generation for free-form coaching questions.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//!
//! The engine only sees the `TextGenerator` trait; `RigGenerator` bridges a
//! rig completion model to it. Construction does no I/O and needs no runtime.

mod rig_adapter;

pub use rig_adapter::RigGenerator;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::error::LlmError;

/// System preamble for question answering.
pub const COACH_PREAMBLE: &str = "You are a friendly fitness coach. Answer workout questions \
     briefly and safely. Recommend seeing a professional for anything medical.";

/// Generates text from a prompt.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Run `complete` with an upper bound on wall time.
pub async fn complete_with_timeout(
    generator: &dyn TextGenerator,
    prompt: &str,
    timeout: Duration,
) -> Result<String, LlmError> {
    match tokio::time::timeout(timeout, generator.complete(prompt)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout {
            provider: generator.model_name().to_string(),
            timeout,
        }),
    }
}

/// Stand-in used when no provider is configured. Every call fails.
pub struct UnconfiguredGenerator;

#[async_trait]
impl TextGenerator for UnconfiguredGenerator {
    fn model_name(&self) -> &str {
        "unconfigured"
    }

    async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
        Err(LlmError::RequestFailed {
            provider: "unconfigured".to_string(),
            reason: "no LLM API key configured".to_string(),
        })
    }
}

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl FromStr for LlmBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" | "open_ai" => Ok(Self::OpenAi),
            other => Err(format!("unknown LLM backend '{other}' (expected anthropic or openai)")),
        }
    }
}

/// Configuration for creating a text generator.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create a text generator from configuration.
pub fn create_generator(config: &LlmConfig) -> Result<Arc<dyn TextGenerator>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => create_anthropic_generator(config),
        LlmBackend::OpenAi => create_openai_generator(config),
    }
}

fn create_anthropic_generator(config: &LlmConfig) -> Result<Arc<dyn TextGenerator>, LlmError> {
    use rig::providers::anthropic;

    let client: rig::client::Client<anthropic::client::AnthropicExt> =
        anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "anthropic".to_string(),
                reason: format!("Failed to create Anthropic client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Anthropic (model: {})", config.model);
    Ok(Arc::new(RigGenerator::new(model, &config.model, COACH_PREAMBLE)))
}

fn create_openai_generator(config: &LlmConfig) -> Result<Arc<dyn TextGenerator>, LlmError> {
    use rig::providers::openai;

    let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
        openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
            LlmError::RequestFailed {
                provider: "openai".to_string(),
                reason: format!("Failed to create OpenAI client: {}", e),
            }
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using OpenAI (model: {})", config.model);
    Ok(Arc::new(RigGenerator::new(model, &config.model, COACH_PREAMBLE)))
}
