//! Read-only views: status report, event listing and daily click history.
//! Everything here is derived from what is on disk, never from in-flight memory.

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;

use punchclock_core::error::Result;

use crate::engine::FlowEngine;
use crate::journal::{EventFilter, EventKind, EventLogEntry};
use crate::state::{Phase, Stamp};

/// Largest page `runtime_events` returns.
pub const MAX_EVENTS: usize = 1000;

/// `getStatus()` answer.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub phase: Phase,
    pub message: String,
    pub run_id: String,
    pub job: String,
    pub ok: Option<bool>,
    pub failed_phase: Option<Phase>,
    pub error: Option<String>,
    pub planned_first_ts: Stamp,
    pub first_click_ts: Stamp,
    pub planned_start_break_ts: Stamp,
    pub start_break_ts: Stamp,
    pub planned_stop_break_ts: Stamp,
    pub stop_break_ts: Stamp,
    pub planned_final_ts: Stamp,
    pub final_click_ts: Stamp,
    pub manual_reset: bool,
    pub recovered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<i64>,
    pub blocked_today: bool,
    pub blocked_start_date: Option<NaiveDate>,
    pub blocked_end_date: Option<NaiveDate>,
    pub updated_at: DateTime<Utc>,
}

/// One executed click, as shown in the daily history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClickRecord {
    pub ts: DateTime<Local>,
    pub run_id: String,
    pub phase: Option<Phase>,
    pub click_name: String,
    pub ok: bool,
    pub executed_at: String,
    pub scheduled_at: String,
    pub recovered: bool,
}

impl ClickRecord {
    fn from_entry(entry: &EventLogEntry) -> Self {
        let text = |key: &str| entry.meta_str(key).unwrap_or_default().to_string();
        Self {
            ts: entry.ts,
            run_id: entry.run_id.clone(),
            phase: entry.phase,
            click_name: text("click_name"),
            ok: entry.meta.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
            executed_at: text("executed_at"),
            scheduled_at: text("scheduled_at"),
            recovered: entry
                .meta
                .get("recovered")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        }
    }
}

/// `3h 12m`, `4m 5s`, `9s`.
pub fn fmt_duration(seconds: i64) -> String {
    let sec = seconds.max(0);
    let (h, rem) = (sec / 3600, sec % 3600);
    let (m, s) = (rem / 60, rem % 60);
    if h > 0 {
        format!("{h}h {m}m")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

fn fmt_clock(stamp: Stamp) -> String {
    stamp
        .local()
        .map(|dt| dt.format("%H:%M:%S").to_string())
        .unwrap_or_default()
}

impl FlowEngine {
    /// Persisted state plus a human message for its phase.
    pub fn status(&self) -> StatusReport {
        let state = self.store.get();
        let settings = self.settings.get();
        let now = self.now();
        let now_secs = Stamp::at(&now).secs().unwrap_or_default();
        let blocked_today = settings.is_blocked(now.date_naive());
        let until = |stamp: Stamp| stamp.secs().map(|ts| (ts - now_secs).max(0.0) as i64);
        let since = |stamp: Stamp| stamp.secs().map(|ts| (now_secs - ts).max(0.0) as i64);

        let mut elapsed_seconds = None;
        let mut remaining_seconds = None;
        let message = match state.phase {
            Phase::WaitingStart => {
                remaining_seconds = until(state.planned_first_ts);
                match remaining_seconds {
                    Some(left) => format!("Waiting to start, {} remaining", fmt_duration(left)),
                    None => "Waiting to start (remaining time unknown)".to_string(),
                }
            }
            Phase::WorkingBeforeBreak => {
                elapsed_seconds = since(state.first_click_ts);
                match elapsed_seconds {
                    Some(run) => format!("Workday started, running for {}", fmt_duration(run)),
                    None => "Workday started".to_string(),
                }
            }
            Phase::OnBreak => {
                remaining_seconds = until(state.planned_stop_break_ts);
                match remaining_seconds {
                    Some(left) => format!("On break, {} remaining", fmt_duration(left)),
                    None => "On break (remaining time unknown)".to_string(),
                }
            }
            Phase::WorkingAfterBreak => {
                remaining_seconds = until(state.planned_final_ts);
                match remaining_seconds {
                    Some(left) => format!("After break, {} remaining", fmt_duration(left)),
                    None => "After break (remaining time unknown)".to_string(),
                }
            }
            Phase::Completed if state.ok == Some(true) => format!(
                "Workday completed successfully. Start {}, break start {}, break end {}, end {}.",
                fmt_clock(state.first_click_ts),
                fmt_clock(state.start_break_ts),
                fmt_clock(state.stop_break_ts),
                fmt_clock(state.final_click_ts),
            ),
            Phase::Completed => state.message.clone(),
            Phase::Failed => format!(
                "Run failed: {}",
                state.error.as_deref().unwrap_or("unknown")
            ),
            Phase::BeforeStart => self.before_start_message(&now, blocked_today, &settings),
        };

        StatusReport {
            phase: state.phase,
            message,
            run_id: state.run_id,
            job: if state.job.is_empty() { self.job.clone() } else { state.job },
            ok: state.ok,
            failed_phase: state.failed_phase,
            error: state.error,
            planned_first_ts: state.planned_first_ts,
            first_click_ts: state.first_click_ts,
            planned_start_break_ts: state.planned_start_break_ts,
            start_break_ts: state.start_break_ts,
            planned_stop_break_ts: state.planned_stop_break_ts,
            stop_break_ts: state.stop_break_ts,
            planned_final_ts: state.planned_final_ts,
            final_click_ts: state.final_click_ts,
            manual_reset: state.manual_reset,
            recovered: state.recovered,
            elapsed_seconds,
            remaining_seconds,
            blocked_today,
            blocked_start_date: settings.blocked_start_date,
            blocked_end_date: settings.blocked_end_date,
            updated_at: state.updated_at,
        }
    }

    fn before_start_message(
        &self,
        now: &DateTime<Local>,
        blocked_today: bool,
        settings: &crate::settings::Settings,
    ) -> String {
        if blocked_today {
            let show = |d: Option<NaiveDate>| d.map(|d| d.to_string()).unwrap_or_default();
            return format!(
                "Day blocked by configuration ({} to {}). Automatic start is disabled.",
                show(settings.blocked_start_date),
                show(settings.blocked_end_date)
            );
        }
        match self.planner.window_on(now) {
            Ok((start, _)) if *now < start => format!(
                "Before start, {} until the start window.",
                fmt_duration((start - *now).num_seconds())
            ),
            Ok((_, end)) if *now < end => "Start window open, waiting for flow start.".to_string(),
            _ => "Outside start window for the first click.".to_string(),
        }
    }

    /// The most recent `limit` events (clamped to 1..=1000), optionally for one local day.
    pub fn runtime_events(&self, limit: usize, day: Option<NaiveDate>) -> Result<Vec<EventLogEntry>> {
        let mut filter = EventFilter::all().limit(limit.clamp(1, MAX_EVENTS));
        filter.day = day;
        self.journal.query(&filter)
    }

    /// Clicks executed on `day`, in order.
    pub fn daily_click_history(&self, day: NaiveDate) -> Result<Vec<ClickRecord>> {
        let filter = EventFilter::all()
            .kind(EventKind::ClickWebhookSent)
            .day(day)
            .limit(MAX_EVENTS);
        Ok(self
            .journal
            .query(&filter)?
            .iter()
            .map(ClickRecord::from_entry)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{harness, local};
    use crate::state::{Action, StatePatch};

    #[test]
    fn test_fmt_duration() {
        assert_eq!(fmt_duration(3 * 3600 + 12 * 60 + 5), "3h 12m");
        assert_eq!(fmt_duration(4 * 60 + 5), "4m 5s");
        assert_eq!(fmt_duration(9), "9s");
        assert_eq!(fmt_duration(-20), "0s");
    }

    #[test]
    fn test_before_start_messages() {
        let h = harness("status-before", local(6, 0));
        let report = h.engine.status();
        assert_eq!(report.phase, Phase::BeforeStart);
        assert_eq!(report.message, "Before start, 58m 0s until the start window.");

        h.clock.set(local(7, 0));
        assert_eq!(h.engine.status().message, "Start window open, waiting for flow start.");
        h.clock.set(local(9, 0));
        assert_eq!(h.engine.status().message, "Outside start window for the first click.");

        h.engine.update_settings("2026-02-23", "2026-02-24").unwrap();
        let report = h.engine.status();
        assert!(report.blocked_today);
        assert!(report.message.starts_with("Day blocked by configuration (2026-02-23 to 2026-02-24)"));
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[test]
    fn test_active_phase_messages() {
        let h = harness("status-active", local(11, 30));
        let on_break = Stamp::at(&local(11, 30)).secs().unwrap();
        h.engine
            .store
            .set(
                StatePatch::transition(Phase::OnBreak, "On break")
                    .planned(Action::StopBreak, Stamp::Decided(on_break + 600.0)),
                Utc::now(),
            )
            .unwrap();
        let report = h.engine.status();
        assert_eq!(report.message, "On break, 10m 0s remaining");
        assert_eq!(report.remaining_seconds, Some(600));

        h.engine
            .store
            .set(StatePatch::default().planned(Action::StopBreak, Stamp::Pending), Utc::now())
            .unwrap();
        let report = h.engine.status();
        assert_eq!(report.message, "On break (remaining time unknown)");
        assert_eq!(report.remaining_seconds, None);

        h.engine
            .store
            .set(
                StatePatch::transition(Phase::WorkingBeforeBreak, "Workday started")
                    .actual(Action::Start, Stamp::at(&local(7, 30))),
                Utc::now(),
            )
            .unwrap();
        let report = h.engine.status();
        assert_eq!(report.message, "Workday started, running for 4h 0m");
        assert_eq!(report.elapsed_seconds, Some(4 * 3600));
        std::fs::remove_dir_all(&h.dir).ok();
    }

    #[tokio::test]
    async fn test_completed_day_views() {
        let h = harness("status-done", local(6, 0));
        h.engine.run("workday_flow", false, Some("r1".into())).await.unwrap();

        let report = h.engine.status();
        assert!(report.message.starts_with("Workday completed successfully. Start "));

        let day = local(6, 0).date_naive();
        let history = h.engine.daily_click_history(day).unwrap();
        let names: Vec<&str> = history.iter().map(|c| c.click_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["start_click", "start_break_click", "stop_break_click", "final_click"]
        );
        assert!(history.iter().all(|c| c.ok && !c.recovered && c.run_id == "r1"));
        assert!(h.engine.daily_click_history(day.pred_opt().unwrap()).unwrap().is_empty());

        let events = h.engine.runtime_events(3, Some(day)).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(h.engine.runtime_events(0, None).unwrap().len(), 1);
        std::fs::remove_dir_all(&h.dir).ok();
    }
}
