//! Error types for the coaching engine.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Instruction error: {0}")]
    Instruction(#[from] InstructionError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Session persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Text-generation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Personalization-instruction service errors.
#[derive(Debug, thiserror::Error)]
pub enum InstructionError {
    #[error("Instruction service unavailable: {0}")]
    Unavailable(String),
}

/// Timer registration errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid daily time {hour:02}:{minute:02}")]
    InvalidTime { hour: u32, minute: u32 },

    #[error("Invalid schedule expression '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("No upcoming fire time for user {user_id}")]
    NoUpcomingFire { user_id: String },
}

/// Rejected requests. The one error class surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("No exercise sent yet for user {user_id}")]
    NoOutstandingTask { user_id: String },

    #[error("Feedback must not be empty")]
    EmptyFeedback,
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
