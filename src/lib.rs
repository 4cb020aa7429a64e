//! Habit Coach: per-user coaching workflow with escalating reminders.

pub mod api;
pub mod config;
pub mod error;
pub mod llm;
pub mod personalization;
pub mod scheduler;
pub mod session;
pub mod workflow;
