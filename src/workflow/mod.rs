//! Session workflow: classify, route, act, finalize.

pub mod actions;
pub mod catalog;
pub mod engine;
pub mod finalize;
pub mod intent;
pub mod policy;
pub mod router;

pub use actions::{ActionOutcome, NodeEffect};
pub use catalog::{SelectionPolicy, TaskCatalog};
pub use engine::{APOLOGY, CoachEngine, OutboundMessage, SessionStatus};
pub use intent::{Intent, classify, keyword_intent};
pub use policy::ReminderPolicy;
pub use router::{ActionKind, Decision, DecisionReason, decide, decide_reminder_tick};
