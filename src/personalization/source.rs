//! Remote instruction sources.

use std::time::Duration;

use async_trait::async_trait;

use super::Instruction;
use crate::error::InstructionError;

/// Where coach instructions come from.
#[async_trait]
pub trait InstructionSource: Send + Sync {
    async fn fetch(&self, user_id: &str, coach_id: &str) -> Result<Instruction, InstructionError>;
}

/// Source used when no instruction service is configured. Always unavailable.
pub struct UnavailableSource;

#[async_trait]
impl InstructionSource for UnavailableSource {
    async fn fetch(&self, _user_id: &str, _coach_id: &str) -> Result<Instruction, InstructionError> {
        Err(InstructionError::Unavailable(
            "no instruction service configured".to_string(),
        ))
    }
}

/// JSON-over-HTTP instruction service.
///
/// `GET {base_url}/coaches/{coach_id}/users/{user_id}/instruction`
pub struct HttpInstructionSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpInstructionSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, InstructionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InstructionError::Unavailable(format!("client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, user_id: &str, coach_id: &str) -> String {
        format!(
            "{}/coaches/{}/users/{}/instruction",
            self.base_url.trim_end_matches('/'),
            coach_id,
            user_id
        )
    }
}

#[async_trait]
impl InstructionSource for HttpInstructionSource {
    async fn fetch(&self, user_id: &str, coach_id: &str) -> Result<Instruction, InstructionError> {
        let response = self
            .client
            .get(self.url(user_id, coach_id))
            .send()
            .await
            .map_err(|e| InstructionError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(InstructionError::Unavailable(format!(
                "instruction service returned {}",
                response.status()
            )));
        }

        response
            .json::<Instruction>()
            .await
            .map_err(|e| InstructionError::Unavailable(format!("invalid instruction body: {e}")))
    }
}
