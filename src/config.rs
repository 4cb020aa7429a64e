//! Configuration types.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::workflow::catalog::SelectionPolicy;

/// Hard cap on reminders per dispatched task.
pub const MAX_REMINDERS: u32 = 3;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct CoachConfig {
    /// Port for the HTTP surface.
    pub http_port: u16,
    /// Coach used when a request does not name one.
    pub default_coach_id: String,
    /// Base URL of the referral link appended to every outcome.
    pub trailer_url: String,
    /// Reminder offsets from dispatch time, one per reminder (at most `MAX_REMINDERS`).
    pub reminder_offsets: Vec<Duration>,
    /// How dispatch-task picks from the catalog.
    pub task_selection: SelectionPolicy,
    /// How long a fetched coach instruction stays valid.
    pub instruction_ttl: Duration,
    /// Remote personalization service (None = cache/default only).
    pub instruction_service: Option<InstructionServiceConfig>,
    /// Text generation backend (None = question answering falls back).
    pub llm: Option<LlmConfig>,
    /// Upper bound on a single text-generation call.
    pub llm_timeout: Duration,
}

/// Remote instruction service settings.
#[derive(Debug, Clone)]
pub struct InstructionServiceConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            default_coach_id: "coach123".to_string(),
            trailer_url: "https://myagents.ai/signup".to_string(),
            reminder_offsets: vec![
                Duration::from_secs(2 * 3600),
                Duration::from_secs(4 * 3600),
                Duration::from_secs(6 * 3600),
            ],
            task_selection: SelectionPolicy::First,
            instruction_ttl: Duration::from_secs(3600), // 1 hour
            instruction_service: None,
            llm: None,
            llm_timeout: Duration::from_secs(20),
        }
    }
}

impl CoachConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let http_port = parse_env::<u16>("COACH_HTTP_PORT")?.unwrap_or(defaults.http_port);

        let default_coach_id =
            std::env::var("COACH_DEFAULT_COACH_ID").unwrap_or(defaults.default_coach_id);

        let trailer_url = std::env::var("COACH_TRAILER_URL").unwrap_or(defaults.trailer_url);

        let reminder_offsets = match std::env::var("COACH_REMINDER_OFFSETS_MINS") {
            Ok(raw) => parse_offsets(&raw)?,
            Err(_) => defaults.reminder_offsets,
        };

        let task_selection = match std::env::var("COACH_TASK_SELECTION") {
            Ok(raw) => raw.parse::<SelectionPolicy>().map_err(|message| ConfigError::InvalidValue {
                key: "COACH_TASK_SELECTION".to_string(),
                message,
            })?,
            Err(_) => defaults.task_selection,
        };

        let instruction_ttl = parse_env::<u64>("COACH_INSTRUCTION_TTL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.instruction_ttl);

        let instruction_service = match std::env::var("COACH_INSTRUCTION_URL") {
            Ok(base_url) if !base_url.trim().is_empty() => Some(InstructionServiceConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                timeout: parse_env::<u64>("COACH_INSTRUCTION_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(Duration::from_secs(5)),
            }),
            _ => None,
        };

        let llm = llm_from_env()?;

        let llm_timeout = parse_env::<u64>("COACH_LLM_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.llm_timeout);

        Ok(Self {
            http_port,
            default_coach_id,
            trailer_url,
            reminder_offsets,
            task_selection,
            instruction_ttl,
            instruction_service,
            llm,
            llm_timeout,
        })
    }
}

fn llm_from_env() -> Result<Option<LlmConfig>, ConfigError> {
    let backend = match std::env::var("COACH_LLM_BACKEND") {
        Ok(raw) => raw.parse::<LlmBackend>().map_err(|message| ConfigError::InvalidValue {
            key: "COACH_LLM_BACKEND".to_string(),
            message,
        })?,
        Err(_) => LlmBackend::OpenAi,
    };

    let key_var = match backend {
        LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
        LlmBackend::OpenAi => "OPENAI_API_KEY",
    };
    let api_key = match std::env::var("COACH_LLM_API_KEY").or_else(|_| std::env::var(key_var)) {
        Ok(key) if !key.trim().is_empty() => key,
        _ => return Ok(None),
    };

    let model = std::env::var("COACH_LLM_MODEL").unwrap_or_else(|_| match backend {
        LlmBackend::Anthropic => "claude-3-5-haiku-latest".to_string(),
        LlmBackend::OpenAi => "gpt-4o-mini".to_string(),
    });

    Ok(Some(LlmConfig {
        backend,
        api_key: secrecy::SecretString::from(api_key),
        model,
    }))
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

/// Parse a comma-separated list of minute offsets, e.g. `"120,240,360"`.
pub fn parse_offsets(raw: &str) -> Result<Vec<Duration>, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "COACH_REMINDER_OFFSETS_MINS".to_string(),
        message,
    };

    let offsets = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map(|mins| Duration::from_secs(mins * 60))
                .map_err(|e| invalid(format!("'{s}': {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if offsets.is_empty() {
        return Err(invalid("at least one offset is required".to_string()));
    }
    if offsets.len() > MAX_REMINDERS as usize {
        return Err(invalid(format!("at most {MAX_REMINDERS} offsets are allowed")));
    }
    if offsets.windows(2).any(|w| w[0] >= w[1]) {
        return Err(invalid("offsets must be strictly increasing".to_string()));
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_offsets_are_two_four_six_hours() {
        let config = CoachConfig::default();
        let hours: Vec<u64> = config
            .reminder_offsets
            .iter()
            .map(|d| d.as_secs() / 3600)
            .collect();
        assert_eq!(hours, vec![2, 4, 6]);
    }

    #[test]
    fn parse_offsets_valid() {
        let offsets = parse_offsets("30, 60,90").unwrap();
        assert_eq!(offsets.len(), 3);
        assert_eq!(offsets[2], Duration::from_secs(90 * 60));
    }

    #[test]
    fn parse_offsets_rejects_garbage() {
        assert!(parse_offsets("abc").is_err());
        assert!(parse_offsets("").is_err());
        assert!(parse_offsets("10,20,30,40").is_err());
        assert!(parse_offsets("60,30").is_err());
    }
}
