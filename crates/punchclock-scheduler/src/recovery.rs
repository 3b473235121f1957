//! Recovery: pick a run back up after a failure or an ungraceful stop.
//!
//! [`replay`] is a pure reducer over the run's event log: it fills in every
//! actual and planned timestamp the runtime state lost, using the same
//! values the live path logged. The engine methods below then decide where
//! to re-enter the flow and hand over to the regular drive loop.

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::OwnedMutexGuard;

use punchclock_core::error::{PunchError, Result};

use crate::engine::{FlowEngine, RunContext, RunOutcome, phase_message};
use crate::journal::{EventFilter, EventKind, EventLogEntry};
use crate::planner::{PlanRequest, STOP_BREAK_OFFSET};
use crate::state::{Action, Phase, RuntimeState, Stamp, StatePatch};

/// Event that carries the planned time of `action`.
fn scheduled_kind(action: Action) -> EventKind {
    match action {
        Action::Start => EventKind::ScheduledFirst,
        Action::StartBreak => EventKind::ScheduledStartBreak,
        Action::StopBreak => EventKind::ScheduledStopBreak,
        Action::Final => EventKind::ScheduledFinal,
    }
}

/// Parse a logged instant: RFC 3339, or a naive local ISO timestamp.
fn parse_instant(raw: &str) -> Option<Stamp> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(Stamp::at(&dt));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| naive.and_local_timezone(Local).earliest())
        .map(|dt| Stamp::at(&dt))
}

/// Execution time of `action` in `run_id`, from the most recent click record.
pub fn infer_click(events: &[EventLogEntry], run_id: &str, action: Action) -> Stamp {
    events
        .iter()
        .rev()
        .filter(|e| e.event == EventKind::ClickWebhookSent && e.run_id == run_id)
        .filter(|e| e.meta_str("click_name") == Some(action.click_name()))
        .filter(|e| e.meta.get("ok").and_then(|v| v.as_bool()) != Some(false))
        .find_map(|e| {
            e.meta_str("executed_at")
                .and_then(parse_instant)
                .or_else(|| Some(Stamp::at(&e.ts)))
        })
        .unwrap_or_default()
}

/// Planned time of `action` in `run_id`, from the most recent `scheduled_*` record.
pub fn infer_planned(events: &[EventLogEntry], run_id: &str, action: Action) -> Stamp {
    let kind = scheduled_kind(action);
    events
        .iter()
        .rev()
        .filter(|e| e.event == kind && e.run_id == run_id)
        .find_map(|e| e.meta_str("scheduled_at").and_then(parse_instant))
        .unwrap_or_default()
}

/// Fill every `Pending` timestamp of `state` that the log can answer.
/// Decided values are never replaced.
pub fn replay(state: &RuntimeState, events: &[EventLogEntry]) -> RuntimeState {
    let mut out = state.clone();
    if state.run_id.is_empty() {
        return out;
    }
    let mut patch = StatePatch::default();
    for action in Action::ALL {
        if !state.actual(action).is_decided() {
            patch = patch.actual(action, infer_click(events, &state.run_id, action));
        }
        if !state.planned(action).is_decided() {
            patch = patch.planned(action, infer_planned(events, &state.run_id, action));
        }
    }
    patch.apply(&mut out, state.updated_at);
    out
}

/// Answer of `resetSession`.
#[derive(Debug, Clone, Serialize)]
pub struct ResetOutcome {
    pub ok: bool,
    pub reset: bool,
    pub phase: Phase,
    pub previous_phase: Phase,
}

fn order(action: Action) -> usize {
    Action::ALL.iter().position(|a| *a == action).unwrap_or(0)
}

impl FlowEngine {
    /// Retry the action that failed, re-entering the flow at `failed_phase`.
    pub async fn retry_failed_action(&self) -> Result<RunOutcome> {
        let Some(guard) = self.try_acquire() else {
            return Err(PunchError::Concurrency("a run is already active".into()));
        };
        let state = self.store.get();
        if state.phase != Phase::Failed {
            return Err(PunchError::Recovery("There is no failed run to retry".into()));
        }
        let Some(failed_phase) = state.retryable_failure() else {
            return Err(PunchError::Recovery(
                "The failure cannot be retried automatically".into(),
            ));
        };
        if state.anchor().is_decided() && !self.same_day(state.anchor()) {
            return Err(PunchError::Recovery(
                "Persisted state is stale: it belongs to another day".into(),
            ));
        }

        let ctx = self.recovery_context(&state);
        tracing::info!("🔁 Retrying run {} from {failed_phase}", ctx.run_id);
        self.record(
            self.entry(EventKind::RetryRequested, &ctx, Phase::Failed)
                .meta(json!({ "failed_phase": failed_phase, "error": state.error })),
        )?;
        self.resume_locked(&ctx, guard, failed_phase, Some(self.now().with_timezone(&Utc)))
            .await
    }

    /// Continue a run whose persisted phase is still active (e.g. after a restart).
    pub async fn resume_pending_flow(&self) -> Result<RunOutcome> {
        let Some(guard) = self.try_acquire() else {
            return Err(PunchError::Concurrency("a run is already active".into()));
        };
        let state = self.store.get();
        if !state.phase.is_active() {
            return Err(PunchError::Recovery(format!(
                "There is no pending flow to resume (phase {})",
                state.phase
            )));
        }
        let ctx = self.recovery_context(&state);

        let anchor = state.anchor();
        if anchor.is_decided() && !self.same_day(anchor) {
            let err = PunchError::Recovery("Persisted state is stale: it belongs to another day".into());
            return self.fail_with(&ctx, err, false).await;
        }
        if state.phase == Phase::WaitingStart {
            if !state.planned_first_ts.is_decided() {
                let err = PunchError::Recovery("Invalid persisted state: missing planned_first_ts".into());
                return self.fail_with(&ctx, err, false).await;
            }
            if let Err(err) = self.check_start_deadline() {
                return self.fail_with(&ctx, err, false).await;
            }
        }

        tracing::info!("♻️ Resuming run {} from {}", ctx.run_id, state.phase);
        self.resume_locked(&ctx, guard, state.phase, None).await
    }

    fn recovery_context(&self, state: &RuntimeState) -> RunContext {
        RunContext {
            run_id: state.run_id.clone(),
            job: if state.job.is_empty() {
                self.job.clone()
            } else {
                state.job.clone()
            },
            supervision: false,
            recovered: true,
        }
    }

    /// Rebuild lost timestamps, pick the re-entry action and drive from there.
    async fn resume_locked(
        &self,
        ctx: &RunContext,
        guard: OwnedMutexGuard<()>,
        hint: Phase,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<RunOutcome> {
        let state = self.store.get();
        let events = self.journal.query(&EventFilter::for_run(&ctx.run_id))?;
        let replayed = replay(&state, &events);
        let inferred: Vec<&str> = Action::ALL
            .into_iter()
            .filter(|a| !state.actual(*a).is_decided() && replayed.actual(*a).is_decided())
            .map(|a| a.click_name())
            .collect();
        if !inferred.is_empty() {
            tracing::info!(
                "🧩 Run {}: inferred from events: {}",
                ctx.run_id,
                inferred.join(",")
            );
        }

        let Some(action) = resume_point(&replayed, hint)? else {
            // Every click is on record: the run finished before the state caught up.
            let mut patch = StatePatch::transition(Phase::Completed, phase_message(Phase::Completed))
                .run(&ctx.run_id, &ctx.job)
                .ok(Some(true))
                .clear_failure()
                .recovered(true);
            for a in Action::ALL {
                patch = patch.actual(a, replayed.actual(a)).planned(a, replayed.planned(a));
            }
            self.commit(ctx, patch)?;
            self.record(
                self.entry(EventKind::ResumeCompleted, ctx, Phase::Completed)
                    .meta(json!({ "inferred": inferred })),
            )?;
            return Ok(RunOutcome {
                ok: true,
                job: ctx.job.clone(),
                run_id: ctx.run_id.clone(),
                phase: Phase::Completed,
                message: phase_message(Phase::Completed).into(),
                recovered: true,
            });
        };

        let mut patch = self.recovery_patch(&replayed, action)?;
        patch = patch.run(&ctx.run_id, &ctx.job);
        if retry_at.is_some() {
            patch = patch.retry_requested_at(retry_at);
        }
        self.record(
            self.entry(EventKind::ResumeStart, ctx, action.waiting_phase())
                .meta(json!({ "action": action.click_name(), "inferred": inferred })),
        )?;
        self.commit(ctx, patch)?;

        let outcome = self.drive(ctx, action, guard).await?;
        self.record(
            self.entry(EventKind::ResumeCompleted, ctx, outcome.phase)
                .meta(json!({ "ok": outcome.ok })),
        )?;
        Ok(outcome)
    }

    /// State for re-entering at `action`, with every missing plan filled.
    fn recovery_patch(&self, replayed: &RuntimeState, action: Action) -> Result<StatePatch> {
        let phase = action.waiting_phase();
        let mut patch = StatePatch::transition(phase, format!("Recovered: {}", phase_message(phase)))
            .ok(None)
            .clear_failure()
            .recovered(true);
        for a in Action::ALL {
            patch = patch.actual(a, replayed.actual(a));
        }

        if action == Action::Start {
            let first = match replayed.planned_first_ts {
                Stamp::Decided(ts) => ts,
                Stamp::Pending => self.planner.plan_first(&self.now())?,
            };
            return Ok(patch.planned(Action::Start, Stamp::Decided(first)));
        }

        let req = PlanRequest::from_state(replayed)
            .ok_or_else(|| PunchError::Recovery("first click time could not be recovered".into()))?;
        let mut plan = self.planner.plan_clicks(&req);
        if action == Action::StopBreak
            && let Some(actual) = replayed.start_break_ts.secs()
            && !STOP_BREAK_OFFSET.contains(&(plan.planned_stop_break_ts - actual))
        {
            plan.planned_stop_break_ts = self.planner.reanchor_stop_break(
                plan.planned_start_break_ts,
                plan.planned_stop_break_ts,
                actual,
            );
        }
        patch = patch.planned(Action::Start, replayed.planned_first_ts);
        for a in [Action::StartBreak, Action::StopBreak, Action::Final] {
            patch = patch.planned(a, plan.get(a));
        }
        Ok(patch)
    }

    /// Operator escape hatch: return a failed or finished session to `before_start`.
    pub fn reset_session(&self) -> Result<ResetOutcome> {
        let Some(_guard) = self.try_acquire() else {
            return Err(PunchError::InvalidState(
                "Cannot reset the session while a run is in progress".into(),
            ));
        };
        let state = self.store.get();
        let previous = state.phase;
        if previous.is_active() {
            return Err(PunchError::InvalidState(format!(
                "Cannot reset the session while phase {previous} is active"
            )));
        }
        let ctx = RunContext {
            run_id: state.run_id.clone(),
            job: self.job.clone(),
            supervision: false,
            recovered: false,
        };

        if previous == Phase::BeforeStart {
            self.record(
                self.entry(EventKind::ManualSessionResetNoop, &ctx, previous)
                    .meta(json!({ "previous_phase": previous })),
            )?;
            return Ok(ResetOutcome {
                ok: true,
                reset: false,
                phase: previous,
                previous_phase: previous,
            });
        }

        self.record(
            self.entry(EventKind::ManualSessionReset, &ctx, Phase::BeforeStart)
                .meta(json!({
                    "previous_phase": previous,
                    "previous_run_id": state.run_id,
                    "error": state.error,
                })),
        )?;
        let mut patch = StatePatch::transition(Phase::BeforeStart, "Session reset by operator")
            .clear_timeline()
            .ok(None)
            .clear_failure()
            .manual_reset(true)
            .recovered(false)
            .retry_requested_at(None);
        patch.run_id = Some(String::new());
        self.commit(&ctx, patch)?;
        tracing::info!("🧹 Session reset by operator (was {previous})");
        Ok(ResetOutcome {
            ok: true,
            reset: true,
            phase: Phase::BeforeStart,
            previous_phase: previous,
        })
    }
}

/// Where to re-enter: the first action without a recorded execution.
/// `None` means all four actions already happened.
fn resume_point(replayed: &RuntimeState, hint: Phase) -> Result<Option<Action>> {
    let Some(pending) = replayed.next_pending_action() else {
        return Ok(None);
    };
    if let Some(expected) = Action::pending_in(hint)
        && order(pending) < order(expected)
    {
        return Err(PunchError::Recovery(format!(
            "cannot resume from {hint}: time of {pending} could not be recovered"
        )));
    }
    Ok(Some(pending))
}
