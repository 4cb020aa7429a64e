//! Session store: per-user state behind an atomic merge contract.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::model::{Session, SessionPatch};
use crate::error::StoreError;

/// Computes a patch from the current session. Runs under the user's lock.
pub type Mutation<'a> = Box<dyn FnOnce(&Session) -> SessionPatch + Send + 'a>;

/// Backend-agnostic session persistence.
///
/// Every method is atomic per user id; different users never block each other.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Snapshot of the session, or the default session for unknown users.
    async fn get(&self, user_id: &str) -> Result<Session, StoreError>;

    /// Atomic read-modify-write. Returns the session after the patch is applied.
    async fn update_with(
        &self,
        user_id: &str,
        mutation: Mutation<'_>,
    ) -> Result<Session, StoreError>;

    /// Remove all state for a user.
    async fn reset(&self, user_id: &str) -> Result<(), StoreError>;

    /// Users with stored state.
    async fn user_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Merge named fields into the session, creating it if absent.
    async fn update(&self, user_id: &str, patch: SessionPatch) -> Result<Session, StoreError> {
        self.update_with(user_id, Box::new(move |_: &Session| patch)).await
    }
}

/// In-process session store.
///
/// The outer map is only locked long enough to find or insert a user's slot;
/// each slot has its own async mutex for read-modify-write.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slot(&self, user_id: &str) -> Result<Arc<Mutex<Session>>, StoreError> {
        if let Some(slot) = self
            .sessions
            .read()
            .map_err(|_| StoreError::Unavailable("session map poisoned".to_string()))?
            .get(user_id)
        {
            return Ok(Arc::clone(slot));
        }

        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StoreError::Unavailable("session map poisoned".to_string()))?;
        let slot = sessions
            .entry(user_id.to_string())
            .or_insert_with(|| {
                debug!(user_id = %user_id, "Creating session");
                Arc::new(Mutex::new(Session::default()))
            });
        Ok(Arc::clone(slot))
    }

    fn existing_slot(&self, user_id: &str) -> Result<Option<Arc<Mutex<Session>>>, StoreError> {
        Ok(self
            .sessions
            .read()
            .map_err(|_| StoreError::Unavailable("session map poisoned".to_string()))?
            .get(user_id)
            .cloned())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, user_id: &str) -> Result<Session, StoreError> {
        match self.existing_slot(user_id)? {
            Some(slot) => Ok(slot.lock().await.clone()),
            None => Ok(Session::default()),
        }
    }

    async fn update_with(
        &self,
        user_id: &str,
        mutation: Mutation<'_>,
    ) -> Result<Session, StoreError> {
        let slot = self.slot(user_id)?;
        let mut session = slot.lock().await;
        let patch = mutation(&*session);
        if !patch.is_empty() {
            session.apply(&patch);
        }
        Ok(session.clone())
    }

    async fn reset(&self, user_id: &str) -> Result<(), StoreError> {
        let removed = self
            .sessions
            .write()
            .map_err(|_| StoreError::Unavailable("session map poisoned".to_string()))?
            .remove(user_id);

        // A holder of the old slot may still be mid-update; wipe it too so the
        // write lands on a default session rather than resurrecting old state.
        if let Some(slot) = removed {
            *slot.lock().await = Session::default();
        }
        debug!(user_id = %user_id, "Session reset");
        Ok(())
    }

    async fn user_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self
            .sessions
            .read()
            .map_err(|_| StoreError::Unavailable("session map poisoned".to_string()))?
            .keys()
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::WorkflowState;

    #[tokio::test]
    async fn unknown_user_gets_default() {
        let store = InMemorySessionStore::new();
        let session = store.get("nobody").await.unwrap();
        assert_eq!(session, Session::default());
        // A read does not create state.
        assert!(store.user_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_returns_a_copy() {
        let store = InMemorySessionStore::new();
        store
            .update("u1", SessionPatch::new().last_task(Some("Do 15 squats".into())))
            .await
            .unwrap();

        let mut copy = store.get("u1").await.unwrap();
        copy.last_task = None;

        let fresh = store.get("u1").await.unwrap();
        assert_eq!(fresh.last_task.as_deref(), Some("Do 15 squats"));
    }

    #[tokio::test]
    async fn feedback_round_trip_keeps_other_fields() {
        let store = InMemorySessionStore::new();
        store
            .update(
                "u1",
                SessionPatch::new()
                    .last_task(Some("Do 10 push-ups".into()))
                    .reminders_sent(2)
                    .scheduled(14, 0),
            )
            .await
            .unwrap();

        store
            .update("u1", SessionPatch::new().feedback(Some("x".into())))
            .await
            .unwrap();

        let session = store.get("u1").await.unwrap();
        assert_eq!(session.feedback.as_deref(), Some("x"));
        assert_eq!(session.last_task.as_deref(), Some("Do 10 push-ups"));
        assert_eq!(session.reminders_sent, 2);
        assert_eq!(session.scheduled_time.as_deref(), Some("14:00"));
        assert_eq!(session.state(), WorkflowState::Completed);
    }

    #[tokio::test]
    async fn reset_returns_to_default() {
        let store = InMemorySessionStore::new();
        store
            .update("u1", SessionPatch::new().last_task(Some("a".into())))
            .await
            .unwrap();
        store.reset("u1").await.unwrap();
        assert_eq!(store.get("u1").await.unwrap(), Session::default());
        assert!(store.user_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = InMemorySessionStore::new();
        store
            .update("u1", SessionPatch::new().last_task(Some("a".into())))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update_with(
                        "u1",
                        Box::new(|s: &Session| {
                            SessionPatch::new().reminders_sent(s.reminders_sent + 1)
                        }),
                    )
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get("u1").await.unwrap().reminders_sent, 3);
    }

    #[tokio::test]
    async fn concurrent_disjoint_fields_both_land() {
        let store = InMemorySessionStore::new();
        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .update("u1", SessionPatch::new().goals(Some("Run 5k".into())))
                    .await
                    .unwrap();
            })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .update("u1", SessionPatch::new().scheduled(7, 30))
                    .await
                    .unwrap();
            })
        };
        a.await.unwrap();
        b.await.unwrap();

        let session = store.get("u1").await.unwrap();
        assert_eq!(session.goals.as_deref(), Some("Run 5k"));
        assert_eq!(session.scheduled_time.as_deref(), Some("07:30"));
    }

    #[tokio::test]
    async fn users_are_independent() {
        let store = InMemorySessionStore::new();
        let slot = store.slot("u1").unwrap();
        let _held = slot.lock().await;

        // u2 is not blocked by u1's lock.
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            store.update("u2", SessionPatch::new().goals(Some("g".into()))),
        )
        .await;
        assert!(result.is_ok());
    }
}
