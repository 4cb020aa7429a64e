//! Session state: the per-user data model and the store that guards it.

pub mod model;
pub mod store;

pub use model::{Session, SessionField, SessionPatch, WorkflowState};
pub use store::{InMemorySessionStore, Mutation, SessionStore};
