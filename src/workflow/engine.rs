//! Coach engine: the single entry point for every inbound event.
//!
//! An event (chat text, manual run, timer tick) is classified, routed through
//! the decision table, and handled by one action node. Routing and the
//! state-touching node both run inside the store's per-user read-modify-write,
//! together with the timer changes they imply, so a timer tick racing an API
//! call for the same user always decides on the state it will write to.
//! Question answering and instruction fetches happen outside that lock.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::CoachConfig;
use crate::error::{Error, SchedulerError, WorkflowError};
use crate::llm::TextGenerator;
use crate::personalization::{
    Instruction, InstructionSource, PersonalizationFlags, PersonalizationOverlay,
};
use crate::scheduler::{JobKind, ReminderJob, ReminderScheduler, SchedulerTick};
use crate::session::{Session, SessionPatch, SessionStore, WorkflowState};
use crate::workflow::actions::{NodeEffect, answer_question, check_feedback, run_stateful, schedule_at};
use crate::workflow::catalog::TaskCatalog;
use crate::workflow::finalize::finalize;
use crate::workflow::intent::{Intent, classify, keyword_intent};
use crate::workflow::policy::ReminderPolicy;
use crate::workflow::router::{decide, decide_reminder_tick};

/// Reply when an event could not be handled at all.
pub const APOLOGY: &str = "Sorry, something went wrong on my side. Please try again in a moment.";

/// Instruction fetch bound when no remote service is configured.
const DEFAULT_INSTRUCTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Chat text or a manual run.
    Request,
    Timer(JobKind),
}

/// A message produced by a timer rather than a request.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub user_id: String,
    pub coach_id: String,
    pub kind: JobKind,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Snapshot of a user's coaching state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub user_id: String,
    pub state: WorkflowState,
    pub last_task: Option<String>,
    pub feedback: Option<String>,
    pub reminders_sent: u32,
    pub task_issued_at: Option<DateTime<Utc>>,
    pub scheduled_time: Option<String>,
    pub goals: Option<String>,
    pub coach_prompt: Option<String>,
    pub pending_reminders: Vec<ReminderJob>,
    pub next_daily_fire: Option<DateTime<Utc>>,
}

pub struct CoachEngine {
    config: CoachConfig,
    store: Arc<dyn SessionStore>,
    overlay: PersonalizationOverlay,
    generator: Arc<dyn TextGenerator>,
    scheduler: ReminderScheduler,
    catalog: TaskCatalog,
    outbound_tx: broadcast::Sender<OutboundMessage>,
}

impl CoachEngine {
    /// Build an engine and the tick channel its scheduler feeds.
    ///
    /// Pass the receiver to `start` (or `spawn_tick_dispatcher`) so timer
    /// ticks reach the router.
    pub fn new(
        config: CoachConfig,
        store: Arc<dyn SessionStore>,
        source: Arc<dyn InstructionSource>,
        generator: Arc<dyn TextGenerator>,
    ) -> (Self, mpsc::Receiver<SchedulerTick>) {
        let instruction_timeout = config
            .instruction_service
            .as_ref()
            .map(|service| service.timeout)
            .unwrap_or(DEFAULT_INSTRUCTION_TIMEOUT);
        let overlay = PersonalizationOverlay::new(
            store.clone(),
            source,
            config.instruction_ttl,
            instruction_timeout,
        );
        let (scheduler, ticks) =
            ReminderScheduler::new(ReminderPolicy::new(config.reminder_offsets.clone()));
        let catalog = TaskCatalog::with_policy(config.task_selection);
        let (outbound_tx, _) = broadcast::channel(64);

        let engine = Self {
            config,
            store,
            overlay,
            generator,
            scheduler,
            catalog,
            outbound_tx,
        };
        (engine, ticks)
    }

    /// Wrap the engine in an `Arc` and start consuming timer ticks.
    pub fn start(self, ticks: mpsc::Receiver<SchedulerTick>) -> Arc<Self> {
        let engine = Arc::new(self);
        Self::spawn_tick_dispatcher(&engine, ticks);
        engine
    }

    /// Feed every scheduler tick into `handle_tick`. Ticks are handled
    /// concurrently.
    ///
    /// Holds only a weak reference, so the loop ends once the engine drops.
    pub fn spawn_tick_dispatcher(
        engine: &Arc<Self>,
        mut ticks: mpsc::Receiver<SchedulerTick>,
    ) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(engine);
        tokio::spawn(async move {
            while let Some(tick) = ticks.recv().await {
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    let text = engine.handle_tick(&tick).await;
                    info!(user_id = %tick.user_id, kind = ?tick.kind, "Timer event handled");
                    // No subscribers is fine.
                    let _ = engine.outbound_tx.send(OutboundMessage {
                        user_id: tick.user_id,
                        coach_id: tick.coach_id,
                        kind: tick.kind,
                        text,
                        sent_at: Utc::now(),
                    });
                });
            }
            debug!("Tick dispatcher stopped");
        })
    }

    /// Messages produced by timers.
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.outbound_tx.subscribe()
    }

    pub fn config(&self) -> &CoachConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &ReminderScheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Handle one inbound event and return the finalized reply.
    ///
    /// Never fails: internal errors and panics become an apology message.
    pub async fn handle_event(&self, user_id: &str, coach_id: &str, raw_text: &str) -> String {
        self.handle(user_id, coach_id, raw_text, Origin::Request).await
    }

    /// Handle a timer firing.
    ///
    /// A daily tick behaves like a manual run. A reminder tick only ever
    /// reminds or waits: if the task was answered or cleared in the meantime
    /// it replies without changing anything.
    pub async fn handle_tick(&self, tick: &SchedulerTick) -> String {
        self.handle(&tick.user_id, &tick.coach_id, "", Origin::Timer(tick.kind))
            .await
    }

    async fn handle(&self, user_id: &str, coach_id: &str, raw_text: &str, origin: Origin) -> String {
        let coach_id = self.coach_or_default(coach_id);

        let routed = AssertUnwindSafe(self.route(user_id, coach_id, raw_text, origin))
            .catch_unwind()
            .await;
        let message = match routed {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                error!(user_id = %user_id, error = %e, "Event handling failed");
                APOLOGY.to_string()
            }
            Err(_) => {
                error!(user_id = %user_id, "Event handling panicked");
                APOLOGY.to_string()
            }
        };

        finalize(&message, &self.config.trailer_url, coach_id)
    }

    async fn route(
        &self,
        user_id: &str,
        coach_id: &str,
        raw_text: &str,
        origin: Origin,
    ) -> Result<String, Error> {
        // Questions depend on the text alone and never touch the session.
        if origin == Origin::Request && keyword_intent(raw_text) == Some(Intent::Question) {
            info!(user_id = %user_id, intent = %Intent::Question, "Routing event");
            return Ok(answer_question(self.generator.as_ref(), raw_text, self.config.llm_timeout).await);
        }

        let instruction = self.overlay.fetch_instruction(user_id, coach_id).await;
        let flags = instruction.flags();
        self.commit(user_id, coach_id, origin, &flags, raw_text, Utc::now())
            .await
    }

    /// Decide and run a state-touching node under the user's lock, arming or
    /// cancelling timers before the patch is committed.
    async fn commit(
        &self,
        user_id: &str,
        coach_id: &str,
        origin: Origin,
        flags: &PersonalizationFlags,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<String, Error> {
        let mut produced: Option<Result<String, SchedulerError>> = None;
        let slot = &mut produced;

        self.store
            .update_with(
                user_id,
                Box::new(move |session: &Session| {
                    let decision = match origin {
                        Origin::Timer(JobKind::Reminder(_)) => {
                            decide_reminder_tick(session, flags, now)
                        }
                        Origin::Request | Origin::Timer(JobKind::Daily) => {
                            let intent = classify(text, session, now, self.scheduler.policy());
                            decide(intent, session, flags, now)
                        }
                    };
                    info!(
                        user_id = %user_id,
                        origin = ?origin,
                        action = %decision.action,
                        reason = ?decision.reason,
                        "Routing event"
                    );

                    let Some(outcome) =
                        run_stateful(decision.action, session, flags, &self.catalog, text, now)
                    else {
                        return SessionPatch::new();
                    };
                    match self.apply_effect(user_id, coach_id, &outcome.effect) {
                        Ok(()) => {
                            *slot = Some(Ok(outcome.message));
                            outcome.patch
                        }
                        Err(e) => {
                            *slot = Some(Err(e));
                            SessionPatch::new()
                        }
                    }
                }),
            )
            .await?;

        match produced {
            Some(result) => Ok(result?),
            None => Ok(APOLOGY.to_string()),
        }
    }

    fn apply_effect(
        &self,
        user_id: &str,
        coach_id: &str,
        effect: &NodeEffect,
    ) -> Result<(), SchedulerError> {
        match *effect {
            NodeEffect::None => {}
            NodeEffect::TaskDispatched { issued_at } => {
                self.scheduler.arm_reminders(user_id, coach_id, issued_at);
            }
            NodeEffect::ScheduleSet { hour, minute } => {
                self.scheduler.arm_daily(user_id, coach_id, hour, minute)?;
            }
        }
        Ok(())
    }

    /// Cancel pending reminders once feedback is stored.
    pub fn on_feedback_recorded(&self, user_id: &str) {
        let cancelled = self.scheduler.cancel_reminders(user_id);
        info!(user_id = %user_id, cancelled, "Feedback recorded");
    }

    /// Store feedback for the outstanding task and stop its reminders.
    ///
    /// Rejected when no task has been dispatched. The reminders are cancelled
    /// under the same lock as the write.
    pub async fn record_feedback(
        &self,
        user_id: &str,
        coach_id: &str,
        feedback: &str,
    ) -> Result<String, Error> {
        let feedback = feedback.trim();
        if feedback.is_empty() {
            return Err(WorkflowError::EmptyFeedback.into());
        }

        let mut rejected = false;
        let flag = &mut rejected;
        let session = self
            .store
            .update_with(
                user_id,
                Box::new(move |session: &Session| {
                    if session.last_task.is_none() {
                        *flag = true;
                        return SessionPatch::new();
                    }
                    self.on_feedback_recorded(user_id);
                    SessionPatch::new().feedback(Some(feedback.to_string()))
                }),
            )
            .await?;

        if rejected {
            return Err(WorkflowError::NoOutstandingTask {
                user_id: user_id.to_string(),
            }
            .into());
        }

        let coach_id = self.coach_or_default(coach_id);
        Ok(finalize(
            &check_feedback(&session).message,
            &self.config.trailer_url,
            coach_id,
        ))
    }

    /// Set the daily dispatch time directly.
    ///
    /// The timer is armed first; the session only changes if that worked.
    pub async fn schedule(
        &self,
        user_id: &str,
        coach_id: &str,
        hour: u32,
        minute: u32,
    ) -> Result<String, Error> {
        let coach_id = self.coach_or_default(coach_id);
        let outcome = schedule_at(hour, minute);

        let mut failed: Option<SchedulerError> = None;
        let slot = &mut failed;
        let patch = outcome.patch;
        self.store
            .update_with(
                user_id,
                Box::new(move |_: &Session| {
                    match self.scheduler.arm_daily(user_id, coach_id, hour, minute) {
                        Ok(_) => patch,
                        Err(e) => {
                            *slot = Some(e);
                            SessionPatch::new()
                        }
                    }
                }),
            )
            .await?;

        if let Some(e) = failed {
            return Err(e.into());
        }
        Ok(finalize(&outcome.message, &self.config.trailer_url, coach_id))
    }

    /// Remove the daily dispatch time. Returns whether a timer was armed.
    pub async fn cancel_schedule(&self, user_id: &str) -> Result<bool, Error> {
        self.store
            .update(user_id, SessionPatch::new().unscheduled())
            .await?;
        Ok(self.scheduler.cancel_daily(user_id))
    }

    /// Drop all state and timers for a user.
    pub async fn reset(&self, user_id: &str) -> Result<(), Error> {
        self.scheduler.cancel_all(user_id);
        self.store.reset(user_id).await?;
        info!(user_id = %user_id, "Session reset");
        Ok(())
    }

    pub async fn status(&self, user_id: &str) -> Result<SessionStatus, Error> {
        let session = self.store.get(user_id).await?;
        Ok(SessionStatus {
            user_id: user_id.to_string(),
            state: session.state(),
            last_task: session.last_task,
            feedback: session.feedback,
            reminders_sent: session.reminders_sent,
            task_issued_at: session.task_issued_at,
            scheduled_time: session.scheduled_time,
            goals: session.goals,
            coach_prompt: session.coach_instruction.map(|i| i.prompt),
            pending_reminders: self.scheduler.pending_reminders(user_id),
            next_daily_fire: self.scheduler.daily_job(user_id).map(|job| job.next_fire),
        })
    }

    pub async fn set_goals(&self, user_id: &str, goals: &str) -> Result<(), Error> {
        let goals = Some(goals.trim().to_string()).filter(|g| !g.is_empty());
        self.store
            .update(user_id, SessionPatch::new().goals(goals))
            .await?;
        Ok(())
    }

    /// Cache a coach-pushed instruction. Returns the flags it implies.
    pub async fn set_instruction(
        &self,
        user_id: &str,
        coach_id: &str,
        prompt: &str,
    ) -> Result<PersonalizationFlags, Error> {
        let instruction = Instruction {
            prompt: prompt.to_string(),
            coach_id: self.coach_or_default(coach_id).to_string(),
            user_id: user_id.to_string(),
            issued_at: Utc::now(),
        };
        let flags = instruction.flags();
        self.overlay.set_instruction(user_id, instruction).await?;
        info!(user_id = %user_id, motivation = %flags.motivation_type, "Coach instruction set");
        Ok(flags)
    }

    fn coach_or_default<'a>(&'a self, coach_id: &'a str) -> &'a str {
        if coach_id.trim().is_empty() {
            &self.config.default_coach_id
        } else {
            coach_id
        }
    }
}
