//! Flow engine: drives one run through the four daily actions.
//!
//! Each step persists its target before waiting, waits in bounded ticks so
//! shutdown is noticed promptly, delegates the click to the driver and then
//! records the outcome: event log first, runtime state second, webhook last.
//! A failed action stops the run in `failed`; picking it up again is the
//! job of [`crate::recovery`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard, watch};

use punchclock_core::PunchConfig;
use punchclock_core::error::{PunchError, Result};

use crate::clock::{Clock, SystemClock};
use crate::driver::{AutomationDriver, CommandDriver, DryRunDriver, looks_like_sign_in};
use crate::journal::{EventFilter, EventKind, EventLogEntry, Journal};
use crate::notify::{Hook, Notifier, WebhookNotifier, WebhookPayload, redact_url};
use crate::planner::{PlanRequest, Planner};
use crate::recovery::infer_click;
use crate::settings::{Settings, SettingsStore};
use crate::state::{Action, Phase, RuntimeState, Stamp, StatePatch};
use crate::store::StateStore;

/// Who started a run and how.
#[derive(Debug, Clone)]
pub(crate) struct RunContext {
    pub run_id: String,
    pub job: String,
    /// An operator is watching and can finish a sign-in by hand.
    pub supervision: bool,
    /// Resumed from persisted state rather than started fresh.
    pub recovered: bool,
}

/// Result of a run that reached its end.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub ok: bool,
    pub job: String,
    pub run_id: String,
    pub phase: Phase,
    pub message: String,
    pub recovered: bool,
}

impl RunOutcome {
    fn from_state(state: &RuntimeState, ctx: &RunContext) -> Self {
        Self {
            ok: state.ok.unwrap_or(false),
            job: ctx.job.clone(),
            run_id: ctx.run_id.clone(),
            phase: state.phase,
            message: state.message.clone(),
            recovered: ctx.recovered,
        }
    }
}

/// Message stored with each phase transition.
pub(crate) fn phase_message(phase: Phase) -> &'static str {
    match phase {
        Phase::BeforeStart => "Pending start",
        Phase::WaitingStart => "Waiting for first click",
        Phase::WorkingBeforeBreak => "Workday started",
        Phase::OnBreak => "On break",
        Phase::WorkingAfterBreak => "Final segment",
        Phase::Completed => "Workday completed",
        Phase::Failed => "Workday failed",
    }
}

/// Local RFC 3339 rendering of a Unix timestamp.
pub(crate) fn iso(ts: f64) -> String {
    Stamp::from_secs(ts)
        .local()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// The scheduling and recovery engine for one job.
pub struct FlowEngine {
    pub(crate) job: String,
    target_url: String,
    sso_identity: String,
    session_artifact: PathBuf,
    artifacts_dir: PathBuf,
    tick: Duration,
    pub(crate) resume_grace: chrono::Duration,
    pub(crate) store: StateStore,
    pub(crate) journal: Journal,
    pub(crate) settings: SettingsStore,
    pub(crate) planner: Planner,
    pub(crate) clock: Arc<dyn Clock>,
    driver: Arc<dyn AutomationDriver>,
    notifier: Arc<dyn Notifier>,
    run_lock: Arc<Mutex<()>>,
    shutdown: watch::Sender<bool>,
}

impl FlowEngine {
    pub fn new(
        config: &PunchConfig,
        driver: Arc<dyn AutomationDriver>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let data_dir = config.data_dir();
        let window = config.schedule.first_window()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            job: config.job_name.clone(),
            target_url: config.target.url.clone(),
            sso_identity: config.target.sso_email.clone(),
            session_artifact: config.session_artifact(),
            artifacts_dir: data_dir.join("artifacts"),
            tick: Duration::from_secs(config.schedule.tick_secs.max(1)),
            resume_grace: chrono::Duration::seconds(config.schedule.resume_grace_secs as i64),
            store: StateStore::open(&data_dir)?,
            journal: Journal::open(&data_dir, config.schedule.events_retention_days)?,
            settings: SettingsStore::open(&data_dir)?,
            planner: Planner::new(window),
            clock: Arc::new(SystemClock),
            driver,
            notifier,
            run_lock: Arc::new(Mutex::new(())),
            shutdown,
        })
    }

    /// Engine with the driver and notifier described by `config`.
    pub fn from_config(config: &PunchConfig) -> Result<Self> {
        let driver: Arc<dyn AutomationDriver> = if config.driver.dry_run {
            Arc::new(DryRunDriver::new())
        } else if !config.driver.command.trim().is_empty() {
            Arc::new(CommandDriver::new(config.driver.command.trim()))
        } else {
            return Err(PunchError::Config(
                "driver.command is required unless driver.dry_run = true".into(),
            ));
        };
        let notifier = Arc::new(WebhookNotifier::new(config.webhooks.clone()));
        tracing::info!("🔧 Flow engine for '{}' using {} driver", config.job_name, driver.name());
        Self::new(config, driver, notifier)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_planner(mut self, planner: Planner) -> Self {
        self.planner = planner;
        self
    }

    pub fn job_name(&self) -> &str {
        &self.job
    }

    /// Jobs this engine can run.
    pub fn list_jobs(&self) -> Vec<String> {
        vec![self.job.clone()]
    }

    pub fn now(&self) -> DateTime<Local> {
        self.clock.now()
    }

    /// Last durably written runtime state.
    pub fn state(&self) -> RuntimeState {
        self.store.get()
    }

    pub fn settings(&self) -> Settings {
        self.settings.get()
    }

    pub fn update_settings(&self, start: &str, end: &str) -> Result<Settings> {
        self.settings.update(start, end)
    }

    /// Ask every waiting run to stop at its next tick. Persisted state is left as is.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`FlowEngine::shutdown`] has been called.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Whether a run currently holds the run lock.
    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    pub(crate) fn check_job(&self, job_name: &str) -> Result<()> {
        if job_name == self.job {
            Ok(())
        } else {
            Err(PunchError::InvalidState(format!("unknown job '{job_name}'")))
        }
    }

    /// Non-blocking acquisition of the single active-run slot.
    pub(crate) fn try_acquire(&self) -> Option<OwnedMutexGuard<()>> {
        self.run_lock.clone().try_lock_owned().ok()
    }

    /// Whether `stamp` falls on today's local date.
    pub(crate) fn same_day(&self, stamp: Stamp) -> bool {
        stamp
            .local()
            .is_some_and(|dt| dt.date_naive() == self.now().date_naive())
    }

    pub(crate) fn entry(&self, kind: EventKind, ctx: &RunContext, phase: Phase) -> EventLogEntry {
        EventLogEntry::new(kind, self.now())
            .run(&ctx.run_id, &ctx.job)
            .phase(phase)
    }

    pub(crate) fn record(&self, entry: EventLogEntry) -> Result<()> {
        self.journal.append(&entry)
    }

    /// Persist `patch`, logging a `state_transition` first when the phase changes.
    pub(crate) fn commit(&self, ctx: &RunContext, patch: StatePatch) -> Result<RuntimeState> {
        let current = self.store.get();
        if let Some(to) = patch.phase
            && to != current.phase
        {
            self.record(self.entry(EventKind::StateTransition, ctx, to).meta(json!({
                "from": current.phase,
                "to": to,
                "message": patch.message.clone().unwrap_or_default(),
            })))?;
        }
        self.store.set(patch, self.now().with_timezone(&Utc))
    }

    /// Start a fresh run: plan the first click and drive the whole day.
    pub async fn run(
        &self,
        job_name: &str,
        supervision: bool,
        run_id: Option<String>,
    ) -> Result<RunOutcome> {
        self.check_job(job_name)?;
        if self.target_url.trim().is_empty() {
            return Err(PunchError::Config("target.url is not configured".into()));
        }
        let now = self.now();
        let run_id = run_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("manual-{}", now.format("%Y%m%d-%H%M%S")));
        let ctx = RunContext {
            run_id,
            job: self.job.clone(),
            supervision,
            recovered: false,
        };

        let Some(guard) = self.try_acquire() else {
            self.reject(&ctx, "another run is active");
            return Err(PunchError::Concurrency(format!(
                "a run is already active for job '{}'",
                self.job
            )));
        };

        let state = self.store.get();
        if let Some(reason) = self.start_conflict(&state) {
            self.reject(&ctx, &reason);
            return Err(PunchError::InvalidState(reason));
        }
        let today = now.date_naive();
        if self.settings.is_blocked(today) {
            let reason = format!("{today} is blocked by configuration");
            self.reject(&ctx, &reason);
            return Err(PunchError::Planning(reason));
        }

        let first = match self.planner.plan_first(&now) {
            Ok(ts) => ts,
            Err(err) => {
                self.record_planning_failure(&ctx, &err);
                return Err(err);
            }
        };
        tracing::info!(
            "📅 Run {} ({}): first click planned at {}",
            ctx.run_id,
            ctx.job,
            iso(first)
        );

        self.record(
            self.entry(EventKind::ScheduledFirst, &ctx, Phase::WaitingStart)
                .meta(json!({ "scheduled_at": iso(first), "supervision": supervision })),
        )?;
        self.commit(
            &ctx,
            StatePatch::transition(Phase::WaitingStart, phase_message(Phase::WaitingStart))
                .run(&ctx.run_id, &ctx.job)
                .clear_timeline()
                .planned(Action::Start, Stamp::Decided(first))
                .ok(None)
                .clear_failure()
                .manual_reset(false)
                .recovered(false)
                .retry_requested_at(None),
        )?;

        self.drive(&ctx, Action::Start, guard).await
    }

    /// Why a fresh run may not start on top of `state`, if it may not.
    fn start_conflict(&self, state: &RuntimeState) -> Option<String> {
        let anchor = state.anchor();
        let today = self.same_day(anchor);
        match state.phase {
            phase if phase.is_active() && (today || !anchor.is_decided()) => Some(format!(
                "a run is already in progress (phase {phase}, run {})",
                state.run_id
            )),
            Phase::Failed if today && state.retryable_failure().is_some() => Some(
                "the last run failed; retry it or reset the session first".into(),
            ),
            Phase::Completed if today => Some("the workday is already completed for today".into()),
            _ => None,
        }
    }

    fn reject(&self, ctx: &RunContext, reason: &str) {
        tracing::warn!("🚫 Run {} rejected: {reason}", ctx.run_id);
        let phase = self.store.get().phase;
        if let Err(e) = self.record(
            self.entry(EventKind::RunRejected, ctx, phase)
                .meta(json!({ "reason": reason })),
        ) {
            tracing::warn!("⚠️ Could not record rejection: {e}");
        }
    }

    fn record_planning_failure(&self, ctx: &RunContext, err: &PunchError) {
        tracing::error!("❌ Run {} not started: {err}", ctx.run_id);
        if let Err(e) = self.record(
            self.entry(EventKind::PlanningFailed, ctx, Phase::BeforeStart)
                .meta(json!({ "error": err.to_string(), "kind": err.kind() })),
        ) {
            tracing::error!("Failed to record planning failure: {e}");
        }
        if let Err(e) = self.commit(
            ctx,
            StatePatch::transition(Phase::Failed, phase_message(Phase::Failed))
                .run(&ctx.run_id, &ctx.job)
                .clear_timeline()
                .failed(None, err.to_string())
                .manual_reset(false)
                .recovered(false),
        ) {
            tracing::error!("Failed to persist planning failure: {e}");
        }
    }

    /// Execute `from` and every later action while holding the run slot.
    pub(crate) async fn drive(
        &self,
        ctx: &RunContext,
        from: Action,
        _guard: OwnedMutexGuard<()>,
    ) -> Result<RunOutcome> {
        if let Err(e) = self.driver.open_session(&self.session_artifact).await {
            return self.fail(ctx, e).await;
        }

        let mut next = Some(from);
        while let Some(action) = next {
            let check_ui = ctx.recovered && action == from;
            match self.perform(ctx, action, check_ui).await {
                Ok(()) => next = action.next(),
                Err(PunchError::Cancelled(reason)) => {
                    tracing::warn!(
                        "⏹️ Run {} stopped while waiting for {action}: {reason}",
                        ctx.run_id
                    );
                    return Err(PunchError::Cancelled(reason));
                }
                Err(e) => return self.fail(ctx, e).await,
            }
        }

        let state = self.store.get();
        tracing::info!("🏁 Run {} completed", ctx.run_id);
        Ok(RunOutcome::from_state(&state, ctx))
    }

    async fn perform(&self, ctx: &RunContext, action: Action, check_ui: bool) -> Result<()> {
        let state = self.store.get();
        let target = state.planned(action).secs().ok_or_else(|| {
            PunchError::Recovery(format!("no planned time for {action}"))
        })?;
        tracing::info!("⏳ {action} planned at {}", iso(target));
        self.sleep_until(target).await?;

        if action == Action::Start && ctx.recovered {
            self.check_start_deadline()?;
        }

        self.driver.navigate(&self.target_url).await?;
        self.driver.dismiss_interstitials().await?;
        if action == Action::Start {
            self.check_sign_in(ctx).await?;
            if let Err(e) = self.driver.save_session(&self.session_artifact).await {
                tracing::warn!("⚠️ Could not refresh session artifact: {e}");
            }
        }
        if check_ui && let Some(executed) = self.detect_manual_state(ctx, action).await? {
            return self.on_success(ctx, action, target, executed, false).await;
        }
        self.driver.click(action.button(), action.confirms()).await?;

        let executed = self.now();
        self.on_success(ctx, action, target, executed, true).await
    }

    /// On a resumed run, whether the page already shows `action` as done
    /// (someone pressed the control by hand). Returns when it happened:
    /// the logged click time if there is one, otherwise now.
    async fn detect_manual_state(
        &self,
        ctx: &RunContext,
        action: Action,
    ) -> Result<Option<DateTime<Local>>> {
        let Some(control) = action.confirms() else {
            return Ok(None);
        };
        match self.driver.is_visible(control).await {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) => {
                tracing::warn!("⚠️ Could not read page state before {action}: {e}");
                return Ok(None);
            }
        }

        let events = self.journal.query(&EventFilter::for_run(&ctx.run_id))?;
        let logged = infer_click(&events, &ctx.run_id, action).local();
        let executed = logged.unwrap_or_else(|| self.now());
        tracing::warn!(
            "🖐️ Run {}: {control} already shown, {action} was done outside the flow",
            ctx.run_id
        );
        self.record(
            self.entry(EventKind::ManualStateDetected, ctx, action.next_phase())
                .meta(json!({
                    "click_name": action.click_name(),
                    "control": control,
                    "executed_at": executed.to_rfc3339(),
                    "timing_known": logged.is_some(),
                })),
        )?;
        Ok(Some(executed))
    }

    /// A resumed first click may only happen shortly after the window closed.
    pub(crate) fn check_start_deadline(&self) -> Result<()> {
        let now = self.now();
        let (_, end) = self.planner.window_on(&now)?;
        if now > end + self.resume_grace {
            return Err(PunchError::Planning(
                "Start window expired; automatic resume is disabled".into(),
            ));
        }
        Ok(())
    }

    async fn check_sign_in(&self, ctx: &RunContext) -> Result<()> {
        let url = self.driver.current_url().await?;
        if !looks_like_sign_in(&url) {
            return Ok(());
        }
        tracing::warn!("🔐 Authentication screen detected at {}", redact_url(&url));
        if !self.sso_identity.is_empty()
            && let Err(e) = self.driver.prefill_identity(&self.sso_identity).await
        {
            tracing::warn!("⚠️ Could not prefill sign-in identifier: {e}");
        }
        self.snap(ctx, "sso_required").await;
        if ctx.supervision {
            tracing::warn!("🔐 Supervised run: continuing, finish the sign-in in the browser");
            Ok(())
        } else {
            Err(PunchError::Action(
                "An authentication screen was detected. Complete login manually and run again"
                    .into(),
            ))
        }
    }

    async fn on_success(
        &self,
        ctx: &RunContext,
        action: Action,
        scheduled: f64,
        executed: DateTime<Local>,
        clicked: bool,
    ) -> Result<()> {
        let state = self.store.get();
        let executed_stamp = Stamp::at(&executed);
        let executed_secs = executed_stamp.secs().unwrap_or(scheduled);

        let mut meta = json!({
            "click_name": action.click_name(),
            "ok": true,
            "executed_at": executed.to_rfc3339(),
            "scheduled_at": iso(scheduled),
            "recovered": ctx.recovered,
        });
        if !clicked {
            meta["manual_state_detected"] = json!(true);
        }
        if action == Action::StopBreak
            && let Some(start_break) = state.start_break_ts.secs()
        {
            meta["gap_seconds_from_start_break"] = json!((executed_secs - start_break).max(0.0) as i64);
        }
        self.record(
            self.entry(EventKind::ClickWebhookSent, ctx, action.waiting_phase())
                .meta(meta.clone()),
        )?;

        let next_phase = action.next_phase();
        let mut patch = StatePatch::transition(next_phase, phase_message(next_phase))
            .run(&ctx.run_id, &ctx.job)
            .actual(action, executed_stamp);
        let scheduled_next = match action {
            Action::Start => {
                let plan = self.planner.plan_clicks(&PlanRequest {
                    first_click: executed_secs,
                    start_break_actual: Stamp::Pending,
                    planned_start_break: state.planned_start_break_ts,
                    planned_stop_break: state.planned_stop_break_ts,
                    planned_final: state.planned_final_ts,
                });
                for next in [Action::StartBreak, Action::StopBreak, Action::Final] {
                    patch = patch.planned(next, plan.get(next));
                }
                Some((EventKind::ScheduledStartBreak, plan.planned_start_break_ts))
            }
            Action::StartBreak => {
                let stop = match (
                    state.planned_start_break_ts.secs(),
                    state.planned_stop_break_ts.secs(),
                ) {
                    (Some(planned_start), Some(planned_stop)) => {
                        self.planner
                            .reanchor_stop_break(planned_start, planned_stop, executed_secs)
                    }
                    _ => {
                        let req = PlanRequest {
                            first_click: state.first_click_ts.secs().unwrap_or(executed_secs),
                            start_break_actual: executed_stamp,
                            planned_start_break: Stamp::Decided(scheduled),
                            planned_stop_break: Stamp::Pending,
                            planned_final: state.planned_final_ts,
                        };
                        self.planner.plan_clicks(&req).planned_stop_break_ts
                    }
                };
                patch = patch.planned(Action::StopBreak, Stamp::Decided(stop));
                Some((EventKind::ScheduledStopBreak, stop))
            }
            Action::StopBreak => {
                let final_ts = match state.planned_final_ts.secs() {
                    Some(ts) => ts,
                    None => {
                        let req = PlanRequest::from_state(&state).ok_or_else(|| {
                            PunchError::Recovery("first click time is unknown".into())
                        })?;
                        self.planner.plan_clicks(&req).planned_final_ts
                    }
                };
                patch = patch.planned(Action::Final, Stamp::Decided(final_ts));
                Some((EventKind::ScheduledFinal, final_ts))
            }
            Action::Final => {
                patch = patch.ok(Some(true));
                None
            }
        };
        if let Some((kind, at)) = scheduled_next {
            self.record(
                self.entry(kind, ctx, next_phase)
                    .meta(json!({ "scheduled_at": iso(at) })),
            )?;
        }
        self.commit(ctx, patch)?;
        tracing::info!(
            "✅ {action} done at {} (run {})",
            executed.format("%H:%M:%S"),
            ctx.run_id
        );

        let tag = match action {
            Action::Start => "first_click",
            other => other.click_name(),
        };
        if !clicked {
            self.snap(ctx, &format!("manual_{tag}")).await;
            return Ok(());
        }
        self.snap(ctx, tag).await;

        match Hook::for_action(action) {
            Some(hook) => {
                let payload = self.payload(ctx, true, format!("workday_{}", action.click_name()), meta);
                self.send(hook, &payload).await;
            }
            None => self.send_final(ctx, None).await,
        }
        Ok(())
    }

    /// Persist the failure, report it, and hand the error back to the caller.
    pub(crate) async fn fail(&self, ctx: &RunContext, err: PunchError) -> Result<RunOutcome> {
        let retryable = !err.is_permanent();
        self.fail_with(ctx, err, retryable).await
    }

    /// Like [`Self::fail`]; `retryable = false` leaves `failed_phase` empty.
    pub(crate) async fn fail_with(
        &self,
        ctx: &RunContext,
        err: PunchError,
        retryable: bool,
    ) -> Result<RunOutcome> {
        tracing::error!("❌ Run {} failed: {err}", ctx.run_id);
        let state = self.store.get();
        let failed_phase = (retryable && state.phase.is_active()).then_some(state.phase);

        self.snap(ctx, "failed").await;
        if let Err(e) = self.record(self.entry(EventKind::ActionFailed, ctx, state.phase).meta(json!({
            "error": err.to_string(),
            "kind": err.kind(),
            "failed_phase": failed_phase,
        }))) {
            tracing::error!("Failed to record action failure: {e}");
        }
        if let Err(e) = self.commit(
            ctx,
            StatePatch::transition(Phase::Failed, phase_message(Phase::Failed))
                .run(&ctx.run_id, &ctx.job)
                .failed(failed_phase, err.to_string()),
        ) {
            tracing::error!("Failed to persist failed state: {e}");
        }
        self.send_final(ctx, Some(&err)).await;
        Err(err)
    }

    /// Sleep until `target` (Unix seconds) in ticks, stopping early on shutdown.
    pub(crate) async fn sleep_until(&self, target: f64) -> Result<()> {
        let mut cancel = self.shutdown.subscribe();
        loop {
            if *cancel.borrow_and_update() {
                return Err(PunchError::Cancelled("shutdown requested".into()));
            }
            let now = Stamp::at(&self.now()).secs().unwrap_or(target);
            let remaining = target - now;
            if remaining <= 0.0 {
                return Ok(());
            }
            // Whole microseconds, rounded up, so the wait always ends at or after `target`.
            let remaining = Duration::from_micros((remaining * 1_000_000.0).ceil() as u64);
            let step = remaining.min(self.tick);
            tokio::select! {
                _ = self.clock.sleep(step) => {}
                _ = cancel.changed() => {}
            }
        }
    }

    pub(crate) async fn snap(&self, ctx: &RunContext, tag: &str) {
        let tag = if ctx.recovered {
            format!("recovered_{tag}")
        } else {
            tag.to_string()
        };
        let dir = self.artifacts_dir.join(&ctx.job).join(&ctx.run_id);
        match self.driver.snapshot(&tag, &dir).await {
            Ok(Some(path)) => tracing::info!("📸 Snapshot saved: {}", path.display()),
            Ok(None) => tracing::debug!("📸 Snapshot {tag} taken"),
            Err(e) => tracing::warn!("⚠️ Snapshot {tag} failed: {e}"),
        }
    }

    fn payload(&self, ctx: &RunContext, ok: bool, event: String, meta: serde_json::Value) -> WebhookPayload {
        WebhookPayload {
            ok,
            event,
            job: ctx.job.clone(),
            run_id: ctx.run_id.clone(),
            ts: self.now().to_rfc3339(),
            meta,
        }
    }

    async fn send(&self, hook: Hook, payload: &WebhookPayload) -> bool {
        match self.notifier.notify(hook, payload).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("⚠️ Notification {} failed (continuing): {e}", payload.event);
                false
            }
        }
    }

    /// Final-result hook for a finished run (`error` = None on success).
    pub(crate) async fn send_final(&self, ctx: &RunContext, error: Option<&PunchError>) {
        let ok = error.is_none();
        let state = self.store.get();
        let meta = json!({
            "phase": state.phase,
            "message": format!("[{}] {}", ctx.job, if ok { "OK" } else { "ERROR" }),
            "error": error.map(|e| e.to_string()),
            "recovered": ctx.recovered,
        });
        let payload = self.payload(ctx, ok, "workday_final".into(), meta.clone());
        let delivered = self.send(Hook::Final, &payload).await;
        if let Err(e) = self.record(
            self.entry(EventKind::FinalWebhookSent, ctx, state.phase)
                .meta(json!({ "ok": ok, "delivered": delivered, "message": meta["message"] })),
        ) {
            tracing::warn!("⚠️ Could not record final notification: {e}");
        }
    }

    /// Whether the auto-start loop should begin today's run now.
    pub fn auto_start_due(&self) -> bool {
        let now = self.now();
        if self.settings.is_blocked(now.date_naive()) {
            return false;
        }
        let Ok((start, end)) = self.planner.window_on(&now) else {
            return false;
        };
        if now < start || now >= end {
            return false;
        }
        let state = self.store.get();
        if state.phase.is_active() {
            return false;
        }
        if state.phase != Phase::BeforeStart && self.same_day(state.anchor()) {
            return false;
        }
        let reset_today = state.manual_reset
            && state.updated_at.with_timezone(&Local).date_naive() == now.date_naive();
        !reset_today
    }
}

/// Background loop that starts the day's run once the first window opens.
pub async fn spawn_auto_start(engine: Arc<FlowEngine>, check_interval_secs: u64) {
    tracing::info!(
        "⏰ Auto-start loop started (check every {}s)",
        check_interval_secs
    );
    let mut interval = tokio::time::interval(Duration::from_secs(check_interval_secs.max(1)));
    let mut shutdown = engine.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            tracing::info!("⏰ Auto-start loop stopped");
            break;
        }
        if !engine.auto_start_due() {
            continue;
        }

        let run_id = format!("auto-{}", engine.now().format("%Y%m%d-%H%M%S"));
        let job = engine.job.clone();
        let eng = engine.clone();
        tracing::info!("🔔 Auto-start: launching run {run_id}");
        tokio::spawn(async move {
            match eng.run(&job, false, Some(run_id)).await {
                Ok(outcome) => tracing::info!("🏁 Auto run {} finished: {}", outcome.run_id, outcome.message),
                Err(PunchError::Concurrency(e)) => tracing::debug!("Auto run skipped: {e}"),
                Err(e) => tracing::warn!("⚠️ Auto run ended with error: {e}"),
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::planner::{START_BREAK_OFFSET, STOP_BREAK_OFFSET};
    use async_trait::async_trait;
    use chrono::{NaiveTime, TimeZone};
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    /// Driver that records every call and fails the click calls listed in `fail_clicks`.
    #[derive(Default)]
    pub(crate) struct ScriptedDriver {
        pub clicks: StdMutex<Vec<String>>,
        pub snapshots: StdMutex<Vec<String>>,
        pub url: StdMutex<String>,
        pub fail_clicks: StdMutex<Vec<usize>>,
        pub click_calls: StdMutex<usize>,
        /// Controls reported as already shown.
        pub visible: StdMutex<Vec<String>>,
        pub gate: Option<Arc<Notify>>,
    }

    impl ScriptedDriver {
        pub fn new() -> Self {
            Self {
                url: StdMutex::new("https://clock.example.invalid/home".into()),
                ..Self::default()
            }
        }

        pub fn clicks(&self) -> Vec<String> {
            self.clicks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AutomationDriver for ScriptedDriver {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn open_session(&self, _artifact: &Path) -> Result<()> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(())
        }
        async fn navigate(&self, _url: &str) -> Result<()> {
            Ok(())
        }
        async fn dismiss_interstitials(&self) -> Result<()> {
            Ok(())
        }
        async fn prefill_identity(&self, _identifier: &str) -> Result<()> {
            Ok(())
        }
        async fn click(&self, button: &str, _confirm: Option<&str>) -> Result<()> {
            let call = {
                let mut calls = self.click_calls.lock().unwrap();
                *calls += 1;
                *calls - 1
            };
            if self.fail_clicks.lock().unwrap().contains(&call) {
                return Err(PunchError::Action(format!("{button} did not respond")));
            }
            self.clicks.lock().unwrap().push(button.to_string());
            Ok(())
        }
        async fn is_visible(&self, control: &str) -> Result<bool> {
            Ok(self.visible.lock().unwrap().iter().any(|c| c == control))
        }
        async fn snapshot(&self, tag: &str, _dir: &Path) -> Result<Option<PathBuf>> {
            self.snapshots.lock().unwrap().push(tag.to_string());
            Ok(None)
        }
        async fn current_url(&self) -> Result<String> {
            Ok(self.url.lock().unwrap().clone())
        }
        async fn save_session(&self, _artifact: &Path) -> Result<()> {
            Ok(())
        }
    }

    /// Collects every payload; optionally refuses all of them.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub sent: StdMutex<Vec<(Hook, WebhookPayload)>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, hook: Hook, payload: &WebhookPayload) -> Result<()> {
            self.sent.lock().unwrap().push((hook, payload.clone()));
            if self.fail {
                Err(PunchError::Notification("endpoint down".into()))
            } else {
                Ok(())
            }
        }
    }

    pub(crate) struct Harness {
        pub engine: Arc<FlowEngine>,
        pub driver: Arc<ScriptedDriver>,
        pub notifier: Arc<RecordingNotifier>,
        pub clock: Arc<ManualClock>,
        pub dir: PathBuf,
    }

    pub(crate) fn local(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 2, 23, h, m, 0).unwrap()
    }

    pub(crate) fn test_config(dir: &Path) -> PunchConfig {
        let mut config = PunchConfig::default();
        config.data_dir = dir.to_string_lossy().to_string();
        config.target.url = "https://clock.example.invalid/home".into();
        config
    }

    pub(crate) fn harness_with(
        name: &str,
        start: DateTime<Local>,
        driver: ScriptedDriver,
        notifier: RecordingNotifier,
        fresh: bool,
    ) -> Harness {
        let dir = std::env::temp_dir().join(format!("punchclock-test-engine-{name}"));
        if fresh {
            std::fs::remove_dir_all(&dir).ok();
        }
        let driver = Arc::new(driver);
        let notifier = Arc::new(notifier);
        let clock = Arc::new(ManualClock::new(start));
        let window = (
            NaiveTime::from_hms_opt(6, 58, 0).unwrap(),
            NaiveTime::from_hms_opt(8, 31, 0).unwrap(),
        );
        let engine = FlowEngine::new(&test_config(&dir), driver.clone(), notifier.clone())
            .unwrap()
            .with_clock(clock.clone())
            .with_planner(Planner::seeded(window, 42));
        Harness {
            engine: Arc::new(engine),
            driver,
            notifier,
            clock,
            dir,
        }
    }

    pub(crate) fn harness(name: &str, start: DateTime<Local>) -> Harness {
        harness_with(name, start, ScriptedDriver::new(), RecordingNotifier::default(), true)
    }

    fn kinds(engine: &FlowEngine) -> Vec<EventKind> {
        engine
            .journal
            .read_all()
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect()
    }

    #[tokio::test]
    async fn test_full_day_completes() {
        let h = harness("full-day", local(6, 0));
        let outcome = h.engine.run("workday_flow", false, Some("r1".into())).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.phase, Phase::Completed);
        assert_eq!(
            h.driver.clicks(),
            vec!["Icon-play", "Icon-pause", "Icon-play", "Icon-stop"]
        );

        let state = h.engine.state();
        assert_eq!(state.ok, Some(true));
        let first = state.first_click_ts.secs().unwrap();
        let start_break = state.start_break_ts.secs().unwrap();
        let stop_break = state.stop_break_ts.secs().unwrap();
        assert!(first >= Stamp::at(&local(6, 58)).secs().unwrap());
        assert!(first < Stamp::at(&local(8, 31)).secs().unwrap());
        assert!(START_BREAK_OFFSET.contains(&(start_break - first)));
        assert!(STOP_BREAK_OFFSET.contains(&(stop_break - start_break)));
        assert!(state.final_click_ts.is_decided());

        let clicks = h
            .engine
            .journal
            .query(&EventFilter::for_run("r1").kind(EventKind::ClickWebhookSent))
            .unwrap();
        assert_eq!(clicks.len(), 4);
        let hooks: Vec<Hook> = h.notifier.sent.lock().unwrap().iter().map(|(k, _)| *k).collect();
        assert_eq!(hooks, vec![Hook::Start, Hook::StartBreak, Hook::StopBreak, Hook::Final]);
        assert!(h.driver.snapshots.lock().unwrap().contains(&"final_click".to_string()));
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[tokio::test]
    async fn test_start_break_planned_from_first_click() {
        let h = harness("first-click-plan", local(7, 30));
        h.engine.run("workday_flow", false, None).await.unwrap();
        let scheduled = h
            .engine
            .journal
            .query(&EventFilter::all().kind(EventKind::ScheduledStartBreak))
            .unwrap();
        assert_eq!(scheduled.len(), 1);
        let report = h.engine.status();
        let planned = report.planned_start_break_ts.secs().unwrap();
        let offset = planned - report.first_click_ts.secs().unwrap();
        assert!(START_BREAK_OFFSET.contains(&offset));
        assert_eq!(scheduled[0].meta_str("scheduled_at"), Some(iso(planned).as_str()));
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[tokio::test]
    async fn test_late_start_fails_without_click() {
        let h = harness("late", local(8, 35));
        let err = h.engine.run("workday_flow", false, None).await.unwrap_err();
        assert!(matches!(err, PunchError::Planning(_)));
        assert!(err.is_permanent());
        assert!(h.driver.clicks().is_empty());

        let state = h.engine.state();
        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(state.failed_phase, None);
        assert!(!state.planned_first_ts.is_decided());
        assert!(kinds(&h.engine).contains(&EventKind::PlanningFailed));
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected() {
        let gate = Arc::new(Notify::new());
        let driver = ScriptedDriver {
            gate: Some(gate.clone()),
            ..ScriptedDriver::new()
        };
        let h = harness_with("concurrent", local(6, 0), driver, RecordingNotifier::default(), true);

        let first = {
            let engine = h.engine.clone();
            tokio::spawn(async move { engine.run("workday_flow", false, Some("first".into())).await })
        };
        while h.engine.state().phase != Phase::WaitingStart {
            tokio::task::yield_now().await;
        }

        let err = h
            .engine
            .run("workday_flow", false, Some("second".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, PunchError::Concurrency(_)));
        assert_eq!(h.engine.state().run_id, "first");

        gate.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.run_id, "first");

        let rejected = h
            .engine
            .journal
            .query(&EventFilter::for_run("second").kind(EventKind::RunRejected))
            .unwrap();
        assert_eq!(rejected.len(), 1);
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[tokio::test]
    async fn test_click_failure_marks_failed_phase() {
        let driver = ScriptedDriver::new();
        driver.fail_clicks.lock().unwrap().push(1);
        let h = harness_with("click-failure", local(6, 0), driver, RecordingNotifier::default(), true);

        let err = h.engine.run("workday_flow", false, Some("r1".into())).await.unwrap_err();
        assert!(matches!(err, PunchError::Action(_)));
        let state = h.engine.state();
        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(state.failed_phase, Some(Phase::WorkingBeforeBreak));
        assert_eq!(state.ok, Some(false));
        assert!(state.first_click_ts.is_decided());
        assert!(state.planned_start_break_ts.is_decided());
        assert_eq!(h.driver.clicks(), vec!["Icon-play"]);
        assert!(kinds(&h.engine).contains(&EventKind::ActionFailed));

        let finals: Vec<bool> = h
            .notifier
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(hook, _)| *hook == Hook::Final)
            .map(|(_, p)| p.ok)
            .collect();
        assert_eq!(finals, vec![false]);
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[tokio::test]
    async fn test_sign_in_without_supervision_fails() {
        let driver = ScriptedDriver::new();
        *driver.url.lock().unwrap() = "https://login.example.invalid/oauth2".into();
        let h = harness_with("sso", local(6, 0), driver, RecordingNotifier::default(), true);

        let err = h.engine.run("workday_flow", false, None).await.unwrap_err();
        assert!(matches!(err, PunchError::Action(_)));
        assert!(h.driver.clicks().is_empty());
        assert_eq!(h.engine.state().failed_phase, Some(Phase::WaitingStart));
        assert!(h.driver.snapshots.lock().unwrap().contains(&"sso_required".to_string()));
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[tokio::test]
    async fn test_sign_in_with_supervision_proceeds() {
        let driver = ScriptedDriver::new();
        *driver.url.lock().unwrap() = "https://login.example.invalid/oauth2".into();
        let h = harness_with("sso-supervised", local(6, 0), driver, RecordingNotifier::default(), true);

        let outcome = h.engine.run("workday_flow", true, None).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(h.driver.clicks().len(), 4);
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[tokio::test]
    async fn test_notification_failure_is_not_fatal() {
        let notifier = RecordingNotifier {
            fail: true,
            ..RecordingNotifier::default()
        };
        let h = harness_with("notify-down", local(6, 0), ScriptedDriver::new(), notifier, true);
        let outcome = h.engine.run("workday_flow", false, None).await.unwrap();
        assert!(outcome.ok);
        assert_eq!(h.engine.state().phase, Phase::Completed);
        assert_eq!(h.notifier.sent.lock().unwrap().len(), 4);
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[tokio::test]
    async fn test_shutdown_leaves_waiting_state() {
        let h = harness("shutdown", local(6, 0));
        h.engine.shutdown();
        let err = h.engine.run("workday_flow", false, Some("r1".into())).await.unwrap_err();
        assert!(matches!(err, PunchError::Cancelled(_)));
        let state = h.engine.state();
        assert_eq!(state.phase, Phase::WaitingStart);
        assert!(state.planned_first_ts.is_decided());
        assert!(h.driver.clicks().is_empty());
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[tokio::test]
    async fn test_blocked_day_is_refused() {
        let h = harness("blocked", local(6, 0));
        h.engine.update_settings("2026-02-20", "2026-02-27").unwrap();
        let err = h.engine.run("workday_flow", false, None).await.unwrap_err();
        assert!(matches!(err, PunchError::Planning(_)));
        assert_eq!(h.engine.state().phase, Phase::BeforeStart);
        assert!(kinds(&h.engine).contains(&EventKind::RunRejected));
        assert!(!h.engine.auto_start_due());
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[tokio::test]
    async fn test_second_run_same_day_rejected() {
        let h = harness("twice", local(6, 0));
        h.engine.run("workday_flow", false, None).await.unwrap();
        let err = h.engine.run("workday_flow", false, None).await.unwrap_err();
        assert!(matches!(err, PunchError::InvalidState(_)));
        assert_eq!(h.driver.clicks().len(), 4);
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[tokio::test]
    async fn test_unknown_job_rejected() {
        let h = harness("unknown-job", local(6, 0));
        let err = h.engine.run("payroll", false, None).await.unwrap_err();
        assert!(matches!(err, PunchError::InvalidState(_)));
        assert_eq!(h.engine.list_jobs(), vec!["workday_flow".to_string()]);
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[test]
    fn test_auto_start_due_only_inside_window() {
        let h = harness("auto-start", local(6, 30));
        assert!(!h.engine.auto_start_due());
        h.clock.set(local(7, 0));
        assert!(h.engine.auto_start_due());
        h.clock.set(local(8, 31));
        assert!(!h.engine.auto_start_due());
        std::fs::remove_dir_all(&h.dir).ok();
    }
}
