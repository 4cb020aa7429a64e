//! Instruction cache on top of the session store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{Instruction, InstructionSource};
use crate::session::{Session, SessionPatch, SessionStore};

/// Fetches and caches one coach instruction per user.
///
/// `fetch_instruction` never fails: a failed refresh falls back to the last
/// cached instruction, then to the hardcoded default.
pub struct PersonalizationOverlay {
    store: Arc<dyn SessionStore>,
    source: Arc<dyn InstructionSource>,
    ttl: Duration,
    timeout: Duration,
}

impl PersonalizationOverlay {
    pub fn new(
        store: Arc<dyn SessionStore>,
        source: Arc<dyn InstructionSource>,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            source,
            ttl,
            timeout,
        }
    }

    pub async fn fetch_instruction(&self, user_id: &str, coach_id: &str) -> Instruction {
        let session = match self.store.get(user_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(user_id = %user_id, "Session read failed, using default instruction: {}", e);
                return Instruction::default_for(user_id, coach_id);
            }
        };

        let now = Utc::now();
        if let Some(cached) = self.fresh_cached(&session, now) {
            debug!(user_id = %user_id, "Using cached coach instruction");
            return cached;
        }

        let fetched = tokio::time::timeout(self.timeout, self.source.fetch(user_id, coach_id)).await;
        match fetched {
            Ok(Ok(instruction)) => {
                debug!(user_id = %user_id, coach_id = %coach_id, "Fetched coach instruction");
                let patch = SessionPatch::new().instruction(instruction.clone(), now);
                if let Err(e) = self.store.update(user_id, patch).await {
                    warn!(user_id = %user_id, "Failed to cache coach instruction: {}", e);
                }
                instruction
            }
            Ok(Err(e)) => {
                debug!(user_id = %user_id, "Instruction fetch failed: {}", e);
                fallback(session, user_id, coach_id)
            }
            Err(_) => {
                warn!(user_id = %user_id, timeout = ?self.timeout, "Instruction fetch timed out");
                fallback(session, user_id, coach_id)
            }
        }
    }

    /// Store a coach-pushed instruction directly, resetting the cache window.
    pub async fn set_instruction(
        &self,
        user_id: &str,
        instruction: Instruction,
    ) -> Result<(), crate::error::StoreError> {
        self.store
            .update(user_id, SessionPatch::new().instruction(instruction, Utc::now()))
            .await?;
        Ok(())
    }

    fn fresh_cached(&self, session: &Session, now: DateTime<Utc>) -> Option<Instruction> {
        let fetched_at = session.last_instruction_fetched_at?;
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(1));
        if now.signed_duration_since(fetched_at) < ttl {
            session.coach_instruction.clone()
        } else {
            None
        }
    }
}

fn fallback(session: Session, user_id: &str, coach_id: &str) -> Instruction {
    session
        .coach_instruction
        .unwrap_or_else(|| Instruction::default_for(user_id, coach_id))
}
