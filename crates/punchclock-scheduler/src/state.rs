//! Runtime state: the data model for the daily flow.
//!
//! `RuntimeState` is the single authoritative snapshot of where the flow
//! stands. It is only ever changed through a [`StatePatch`], which merges
//! into the previous value so partial updates never drop unrelated fields.

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Named state of the daily flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    BeforeStart,
    WaitingStart,
    WorkingBeforeBreak,
    OnBreak,
    WorkingAfterBreak,
    Completed,
    Failed,
}

impl Phase {
    /// Phases in which a run owns the schedule (a worker is or should be driving it).
    pub const ACTIVE: [Phase; 4] = [
        Phase::WaitingStart,
        Phase::WorkingBeforeBreak,
        Phase::OnBreak,
        Phase::WorkingAfterBreak,
    ];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::BeforeStart => "before_start",
            Phase::WaitingStart => "waiting_start",
            Phase::WorkingBeforeBreak => "working_before_break",
            Phase::OnBreak => "on_break",
            Phase::WorkingAfterBreak => "working_after_break",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "before_start" => Ok(Phase::BeforeStart),
            "waiting_start" => Ok(Phase::WaitingStart),
            "working_before_break" => Ok(Phase::WorkingBeforeBreak),
            "on_break" => Ok(Phase::OnBreak),
            "working_after_break" => Ok(Phase::WorkingAfterBreak),
            "completed" => Ok(Phase::Completed),
            "failed" => Ok(Phase::Failed),
            other => Err(format!("unknown phase '{other}'")),
        }
    }
}

/// One of the four physical actions of the day, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    StartBreak,
    StopBreak,
    Final,
}

impl Action {
    pub const ALL: [Action; 4] = [
        Action::Start,
        Action::StartBreak,
        Action::StopBreak,
        Action::Final,
    ];

    /// Name recorded in click events (`meta.click_name`).
    pub fn click_name(&self) -> &'static str {
        match self {
            Action::Start => "start_click",
            Action::StartBreak => "start_break_click",
            Action::StopBreak => "stop_break_click",
            Action::Final => "final_click",
        }
    }

    pub fn from_click_name(name: &str) -> Option<Action> {
        Self::ALL.into_iter().find(|a| a.click_name() == name)
    }

    /// Logical control the driver must press.
    pub fn button(&self) -> &'static str {
        match self {
            Action::Start | Action::StopBreak => "Icon-play",
            Action::StartBreak => "Icon-pause",
            Action::Final => "Icon-stop",
        }
    }

    /// Control expected to appear once the click took effect.
    pub fn confirms(&self) -> Option<&'static str> {
        match self {
            Action::Start => Some("Icon-pause"),
            Action::StartBreak => Some("Icon-play"),
            Action::StopBreak => Some("Icon-stop"),
            Action::Final => None,
        }
    }

    /// Phase in which the flow waits for this action.
    pub fn waiting_phase(&self) -> Phase {
        match self {
            Action::Start => Phase::WaitingStart,
            Action::StartBreak => Phase::WorkingBeforeBreak,
            Action::StopBreak => Phase::OnBreak,
            Action::Final => Phase::WorkingAfterBreak,
        }
    }

    /// Phase entered once this action succeeded.
    pub fn next_phase(&self) -> Phase {
        match self {
            Action::Start => Phase::WorkingBeforeBreak,
            Action::StartBreak => Phase::OnBreak,
            Action::StopBreak => Phase::WorkingAfterBreak,
            Action::Final => Phase::Completed,
        }
    }

    /// The action a run in `phase` is waiting to perform.
    pub fn pending_in(phase: Phase) -> Option<Action> {
        Self::ALL.into_iter().find(|a| a.waiting_phase() == phase)
    }

    pub fn next(&self) -> Option<Action> {
        match self {
            Action::Start => Some(Action::StartBreak),
            Action::StartBreak => Some(Action::StopBreak),
            Action::StopBreak => Some(Action::Final),
            Action::Final => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.click_name())
    }
}

/// A planned or actual instant: either not decided yet, or decided at a
/// Unix timestamp (float seconds).
///
/// Serialized as `null` / number. Non-positive numbers read back as
/// `Pending`, so a legacy zero is never mistaken for a decided instant.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Stamp {
    #[default]
    Pending,
    Decided(f64),
}

impl Stamp {
    pub fn from_secs(secs: f64) -> Self {
        if secs.is_finite() && secs > 0.0 {
            Stamp::Decided(secs)
        } else {
            Stamp::Pending
        }
    }

    pub fn at<Tz: TimeZone>(instant: &DateTime<Tz>) -> Self {
        Self::from_secs(instant.timestamp_micros() as f64 / 1_000_000.0)
    }

    pub fn is_decided(&self) -> bool {
        matches!(self, Stamp::Decided(_))
    }

    pub fn secs(&self) -> Option<f64> {
        match self {
            Stamp::Decided(ts) => Some(*ts),
            Stamp::Pending => None,
        }
    }

    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        self.secs()
            .and_then(|ts| Utc.timestamp_micros((ts * 1_000_000.0).round() as i64).single())
    }

    pub fn local(&self) -> Option<DateTime<Local>> {
        self.datetime().map(|dt| dt.with_timezone(&Local))
    }

    /// Keep `self` if decided, otherwise take `other`.
    pub fn or(self, other: Stamp) -> Stamp {
        if self.is_decided() { self } else { other }
    }
}

impl Serialize for Stamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.secs().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Stamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<f64>::deserialize(deserializer)?;
        Ok(raw.map(Stamp::from_secs).unwrap_or_default())
    }
}

/// Snapshot of where the flow stands. Always the last value durably written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeState {
    pub phase: Phase,
    /// Human-readable description of the last transition.
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub job: String,
    /// `None` while a run is in flight or nothing is known yet.
    #[serde(default)]
    pub ok: Option<bool>,
    /// Phase active when the run failed; `None` means not retryable.
    #[serde(default)]
    pub failed_phase: Option<Phase>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub planned_first_ts: Stamp,
    #[serde(default)]
    pub first_click_ts: Stamp,
    #[serde(default)]
    pub planned_start_break_ts: Stamp,
    #[serde(default)]
    pub start_break_ts: Stamp,
    #[serde(default)]
    pub planned_stop_break_ts: Stamp,
    #[serde(default)]
    pub stop_break_ts: Stamp,
    #[serde(default)]
    pub planned_final_ts: Stamp,
    #[serde(default)]
    pub final_click_ts: Stamp,
    /// Set when an operator forcibly reset the session.
    #[serde(default)]
    pub manual_reset: bool,
    /// Set when the current run was resumed from persisted state.
    #[serde(default)]
    pub recovered: bool,
    #[serde(default)]
    pub retry_requested_at: Option<DateTime<Utc>>,
    #[serde(default = "default_updated_at")]
    pub updated_at: DateTime<Utc>,
}

fn default_updated_at() -> DateTime<Utc> {
    Utc::now()
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            phase: Phase::BeforeStart,
            message: "Pending start".into(),
            run_id: String::new(),
            job: String::new(),
            ok: None,
            failed_phase: None,
            error: None,
            planned_first_ts: Stamp::Pending,
            first_click_ts: Stamp::Pending,
            planned_start_break_ts: Stamp::Pending,
            start_break_ts: Stamp::Pending,
            planned_stop_break_ts: Stamp::Pending,
            stop_break_ts: Stamp::Pending,
            planned_final_ts: Stamp::Pending,
            final_click_ts: Stamp::Pending,
            manual_reset: false,
            recovered: false,
            retry_requested_at: None,
            updated_at: Utc::now(),
        }
    }
}

impl RuntimeState {
    /// Planned target for an action.
    pub fn planned(&self, action: Action) -> Stamp {
        match action {
            Action::Start => self.planned_first_ts,
            Action::StartBreak => self.planned_start_break_ts,
            Action::StopBreak => self.planned_stop_break_ts,
            Action::Final => self.planned_final_ts,
        }
    }

    /// Confirmed execution time of an action.
    pub fn actual(&self, action: Action) -> Stamp {
        match action {
            Action::Start => self.first_click_ts,
            Action::StartBreak => self.start_break_ts,
            Action::StopBreak => self.stop_break_ts,
            Action::Final => self.final_click_ts,
        }
    }

    fn planned_mut(&mut self, action: Action) -> &mut Stamp {
        match action {
            Action::Start => &mut self.planned_first_ts,
            Action::StartBreak => &mut self.planned_start_break_ts,
            Action::StopBreak => &mut self.planned_stop_break_ts,
            Action::Final => &mut self.planned_final_ts,
        }
    }

    fn actual_mut(&mut self, action: Action) -> &mut Stamp {
        match action {
            Action::Start => &mut self.first_click_ts,
            Action::StartBreak => &mut self.start_break_ts,
            Action::StopBreak => &mut self.stop_break_ts,
            Action::Final => &mut self.final_click_ts,
        }
    }

    /// First action (in order) without a confirmed execution time.
    pub fn next_pending_action(&self) -> Option<Action> {
        Action::ALL
            .into_iter()
            .find(|a| !self.actual(*a).is_decided())
    }

    /// Instant that ties the run to a calendar day: first click, else its plan.
    pub fn anchor(&self) -> Stamp {
        self.first_click_ts.or(self.planned_first_ts)
    }

    /// A failure the retry engine may pick up.
    pub fn retryable_failure(&self) -> Option<Phase> {
        match (self.phase, self.failed_phase) {
            (Phase::Failed, Some(phase)) if phase.is_active() => Some(phase),
            _ => None,
        }
    }
}

/// Partial update of a [`RuntimeState`]. Unset fields keep their previous value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub phase: Option<Phase>,
    pub message: Option<String>,
    pub run_id: Option<String>,
    pub job: Option<String>,
    pub ok: Option<Option<bool>>,
    pub failed_phase: Option<Option<Phase>>,
    pub error: Option<Option<String>>,
    pub planned: [Option<Stamp>; 4],
    pub actual: [Option<Stamp>; 4],
    pub manual_reset: Option<bool>,
    pub recovered: Option<bool>,
    pub retry_requested_at: Option<Option<DateTime<Utc>>>,
}

fn slot(action: Action) -> usize {
    match action {
        Action::Start => 0,
        Action::StartBreak => 1,
        Action::StopBreak => 2,
        Action::Final => 3,
    }
}

impl StatePatch {
    /// Patch that moves the flow to `phase`.
    pub fn transition(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase: Some(phase),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn run(mut self, run_id: &str, job: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self.job = Some(job.to_string());
        self
    }

    pub fn ok(mut self, ok: Option<bool>) -> Self {
        self.ok = Some(ok);
        self
    }

    pub fn failed(mut self, failed_phase: Option<Phase>, error: impl Into<String>) -> Self {
        self.failed_phase = Some(failed_phase);
        self.error = Some(Some(error.into()));
        self.ok = Some(Some(false));
        self
    }

    /// Clear failure bookkeeping (used when a run starts or is retried).
    pub fn clear_failure(mut self) -> Self {
        self.failed_phase = Some(None);
        self.error = Some(None);
        self
    }

    pub fn planned(mut self, action: Action, stamp: Stamp) -> Self {
        self.planned[slot(action)] = Some(stamp);
        self
    }

    pub fn actual(mut self, action: Action, stamp: Stamp) -> Self {
        self.actual[slot(action)] = Some(stamp);
        self
    }

    /// Reset every planned and actual timestamp to `Pending`.
    pub fn clear_timeline(mut self) -> Self {
        self.planned = [Some(Stamp::Pending); 4];
        self.actual = [Some(Stamp::Pending); 4];
        self
    }

    pub fn manual_reset(mut self, value: bool) -> Self {
        self.manual_reset = Some(value);
        self
    }

    pub fn recovered(mut self, value: bool) -> Self {
        self.recovered = Some(value);
        self
    }

    pub fn retry_requested_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.retry_requested_at = Some(at);
        self
    }

    /// Merge into `state`, stamping `updated_at`.
    pub fn apply(&self, state: &mut RuntimeState, now: DateTime<Utc>) {
        if let Some(phase) = self.phase {
            state.phase = phase;
        }
        if let Some(message) = &self.message {
            state.message = message.clone();
        }
        if let Some(run_id) = &self.run_id {
            state.run_id = run_id.clone();
        }
        if let Some(job) = &self.job {
            state.job = job.clone();
        }
        if let Some(ok) = self.ok {
            state.ok = ok;
        }
        if let Some(failed_phase) = self.failed_phase {
            state.failed_phase = failed_phase;
        }
        if let Some(error) = &self.error {
            state.error = error.clone();
        }
        for action in Action::ALL {
            if let Some(stamp) = self.planned[slot(action)] {
                *state.planned_mut(action) = stamp;
            }
            if let Some(stamp) = self.actual[slot(action)] {
                *state.actual_mut(action) = stamp;
            }
        }
        if let Some(value) = self.manual_reset {
            state.manual_reset = value;
        }
        if let Some(value) = self.recovered {
            state.recovered = value;
        }
        if let Some(at) = self.retry_requested_at {
            state.retry_requested_at = at;
        }
        state.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_roundtrip_and_activity() {
        for phase in [
            Phase::BeforeStart,
            Phase::WaitingStart,
            Phase::WorkingBeforeBreak,
            Phase::OnBreak,
            Phase::WorkingAfterBreak,
            Phase::Completed,
            Phase::Failed,
        ] {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert!(Phase::OnBreak.is_active());
        assert!(!Phase::Failed.is_active());
        assert!(!Phase::BeforeStart.is_active());
        assert!("lunch".parse::<Phase>().is_err());
    }

    #[test]
    fn test_action_chain() {
        assert_eq!(Action::pending_in(Phase::OnBreak), Some(Action::StopBreak));
        assert_eq!(Action::pending_in(Phase::Completed), None);
        assert_eq!(Action::StartBreak.next_phase(), Phase::OnBreak);
        assert_eq!(Action::Final.next(), None);
        assert_eq!(Action::from_click_name("stop_break_click"), Some(Action::StopBreak));
        assert_eq!(Action::from_click_name("lunch_click"), None);
    }

    #[test]
    fn test_stamp_serde() {
        let json = serde_json::to_string(&Stamp::Decided(1700000000.5)).unwrap();
        assert_eq!(json, "1700000000.5");
        assert_eq!(serde_json::to_string(&Stamp::Pending).unwrap(), "null");

        let legacy_zero: Stamp = serde_json::from_str("0.0").unwrap();
        assert_eq!(legacy_zero, Stamp::Pending);
        let decided: Stamp = serde_json::from_str("1700000000.25").unwrap();
        assert_eq!(decided, Stamp::Decided(1700000000.25));
    }

    #[test]
    fn test_state_without_updated_at_keeps_phase() {
        let state: RuntimeState = serde_json::from_str(
            r#"{"phase":"working_before_break","run_id":"r1","first_click_ts":1700000000.0}"#,
        )
        .unwrap();
        assert_eq!(state.phase, Phase::WorkingBeforeBreak);
        assert_eq!(state.run_id, "r1");
    }

    #[test]
    fn test_state_defaults_when_fields_missing() {
        let state: RuntimeState = serde_json::from_str(
            r#"{"phase":"on_break","updated_at":"2026-02-23T10:00:00Z","start_break_ts":1700000000.0}"#,
        )
        .unwrap();
        assert_eq!(state.phase, Phase::OnBreak);
        assert_eq!(state.start_break_ts, Stamp::Decided(1700000000.0));
        assert_eq!(state.planned_stop_break_ts, Stamp::Pending);
        assert_eq!(state.ok, None);
    }

    #[test]
    fn test_patch_keeps_unrelated_fields() {
        let mut state = RuntimeState::default();
        StatePatch::transition(Phase::WorkingBeforeBreak, "Workday started")
            .run("r1", "workday_flow")
            .actual(Action::Start, Stamp::Decided(1000.0))
            .planned(Action::StartBreak, Stamp::Decided(2000.0))
            .apply(&mut state, Utc::now());

        StatePatch {
            phase: Some(Phase::OnBreak),
            ..StatePatch::default()
        }
        .apply(&mut state, Utc::now());

        assert_eq!(state.phase, Phase::OnBreak);
        assert_eq!(state.run_id, "r1");
        assert_eq!(state.first_click_ts, Stamp::Decided(1000.0));
        assert_eq!(state.planned_start_break_ts, Stamp::Decided(2000.0));
        assert_eq!(state.message, "Workday started");
    }

    #[test]
    fn test_retryable_failure() {
        let mut state = RuntimeState::default();
        StatePatch::transition(Phase::Failed, "Workday failed")
            .failed(Some(Phase::OnBreak), "boom")
            .apply(&mut state, Utc::now());
        assert_eq!(state.retryable_failure(), Some(Phase::OnBreak));
        assert_eq!(state.ok, Some(false));

        StatePatch::default()
            .failed(None, "window closed")
            .apply(&mut state, Utc::now());
        assert_eq!(state.retryable_failure(), None);
    }
}
