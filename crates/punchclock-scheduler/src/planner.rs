//! Timestamp planner: randomized targets inside the daily jitter windows.
//!
//! ```text
//! first        ∈ [max(window_start, now), window_end)       (local wall clock)
//! start_break  ∈ [first + 4h,           first + 4h45m)
//! stop_break   ∈ [start_break + 14m30s, start_break + 15m59s)
//! final        ∈ [first + 7h,           first + 7h45m)
//! ```
//!
//! Values already decided are passed through verbatim; only `Pending`
//! targets are drawn.

use std::ops::Range;
use std::sync::Mutex;

use chrono::{DateTime, Local, NaiveTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use punchclock_core::error::{PunchError, Result};

use crate::state::{Action, RuntimeState, Stamp};

const HOUR: f64 = 3600.0;
const MINUTE: f64 = 60.0;

/// Start-break offset from the first click.
pub const START_BREAK_OFFSET: Range<f64> = (4.0 * HOUR)..(4.0 * HOUR + 45.0 * MINUTE);
/// Stop-break offset from the start-break click.
pub const STOP_BREAK_OFFSET: Range<f64> = (14.0 * MINUTE + 30.0)..(15.0 * MINUTE + 59.0);
/// Final offset from the first click.
pub const FINAL_OFFSET: Range<f64> = (7.0 * HOUR)..(7.0 * HOUR + 45.0 * MINUTE);

/// Inputs for planning the three follow-up actions.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlanRequest {
    /// Actual first-click time. Required.
    pub first_click: f64,
    /// Actual start-break time, when already executed.
    pub start_break_actual: Stamp,
    pub planned_start_break: Stamp,
    pub planned_stop_break: Stamp,
    pub planned_final: Stamp,
}

impl PlanRequest {
    pub fn new(first_click: f64) -> Self {
        Self {
            first_click,
            ..Self::default()
        }
    }

    /// Build a request from persisted state. `None` when no first click is known.
    pub fn from_state(state: &RuntimeState) -> Option<Self> {
        let first_click = state.first_click_ts.secs()?;
        Some(Self {
            first_click,
            start_break_actual: state.start_break_ts,
            planned_start_break: state.planned_start_break_ts,
            planned_stop_break: state.planned_stop_break_ts,
            planned_final: state.planned_final_ts,
        })
    }
}

/// The three follow-up targets of one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedClicks {
    pub planned_start_break_ts: f64,
    pub planned_stop_break_ts: f64,
    pub planned_final_ts: f64,
}

impl PlannedClicks {
    pub fn get(&self, action: Action) -> Stamp {
        match action {
            Action::Start => Stamp::Pending,
            Action::StartBreak => Stamp::Decided(self.planned_start_break_ts),
            Action::StopBreak => Stamp::Decided(self.planned_stop_break_ts),
            Action::Final => Stamp::Decided(self.planned_final_ts),
        }
    }
}

/// Draws targets from a shared random source.
pub struct Planner {
    window_start: NaiveTime,
    window_end: NaiveTime,
    rng: Mutex<StdRng>,
}

impl Planner {
    pub fn new(window: (NaiveTime, NaiveTime)) -> Self {
        Self::with_rng(window, StdRng::from_entropy())
    }

    /// Deterministic planner for tests and replays.
    pub fn seeded(window: (NaiveTime, NaiveTime), seed: u64) -> Self {
        Self::with_rng(window, StdRng::seed_from_u64(seed))
    }

    fn with_rng(window: (NaiveTime, NaiveTime), rng: StdRng) -> Self {
        Self {
            window_start: window.0,
            window_end: window.1,
            rng: Mutex::new(rng),
        }
    }

    pub fn window(&self) -> (NaiveTime, NaiveTime) {
        (self.window_start, self.window_end)
    }

    /// Window bounds on the local calendar day of `now`.
    pub fn window_on(&self, now: &DateTime<Local>) -> Result<(DateTime<Local>, DateTime<Local>)> {
        let day = now.date_naive();
        let resolve = |time: NaiveTime| {
            day.and_time(time)
                .and_local_timezone(Local)
                .earliest()
                .ok_or_else(|| {
                    PunchError::Planning(format!("{time} does not exist on {day} in local time"))
                })
        };
        Ok((resolve(self.window_start)?, resolve(self.window_end)?))
    }

    /// Target for the first action. Fails permanently once the window closed.
    pub fn plan_first(&self, now: &DateTime<Local>) -> Result<f64> {
        let (start, end) = self.window_on(now)?;
        if *now >= end {
            return Err(PunchError::Planning(format!(
                "first window closed at {} (now {})",
                end.format("%H:%M"),
                now.format("%H:%M:%S")
            )));
        }
        let lo = secs(if *now > start { now } else { &start });
        let hi = secs(&end);
        if lo >= hi {
            return Err(PunchError::Planning(format!(
                "first window has no room left before {}",
                end.format("%H:%M")
            )));
        }
        Ok(self.draw(lo..hi))
    }

    /// Targets for start-break, stop-break and final.
    pub fn plan_clicks(&self, req: &PlanRequest) -> PlannedClicks {
        let first = req.first_click;
        let start_break = match req.planned_start_break {
            Stamp::Decided(ts) => ts,
            Stamp::Pending => first + self.draw(START_BREAK_OFFSET),
        };
        let stop_break = match req.planned_stop_break {
            Stamp::Decided(ts) => ts,
            Stamp::Pending => {
                let anchor = req.start_break_actual.secs().unwrap_or(start_break);
                anchor + self.draw(STOP_BREAK_OFFSET)
            }
        };
        let final_ts = match req.planned_final {
            Stamp::Decided(ts) => ts,
            Stamp::Pending => first + self.draw(FINAL_OFFSET),
        };
        PlannedClicks {
            planned_start_break_ts: start_break,
            planned_stop_break_ts: stop_break,
            planned_final_ts: final_ts,
        }
    }

    /// Move a stop-break target drawn against the planned start-break onto the
    /// actual start-break time, keeping the drawn offset.
    pub fn reanchor_stop_break(
        &self,
        planned_start_break: f64,
        planned_stop_break: f64,
        actual_start_break: f64,
    ) -> f64 {
        let offset = planned_stop_break - planned_start_break;
        if STOP_BREAK_OFFSET.contains(&offset) {
            actual_start_break + offset
        } else {
            actual_start_break + self.draw(STOP_BREAK_OFFSET)
        }
    }

    fn draw(&self, range: Range<f64>) -> f64 {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.gen_range(range)
    }
}

fn secs(dt: &DateTime<Local>) -> f64 {
    dt.timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn planner(seed: u64) -> Planner {
        let window = (
            NaiveTime::from_hms_opt(6, 58, 0).unwrap(),
            NaiveTime::from_hms_opt(8, 31, 0).unwrap(),
        );
        Planner::seeded(window, seed)
    }

    fn local(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 2, 23, h, m, 0).unwrap()
    }

    #[test]
    fn test_follow_up_targets_within_windows() {
        let planner = planner(7);
        let first = secs(&local(7, 12));
        for _ in 0..500 {
            let plan = planner.plan_clicks(&PlanRequest::new(first));
            let start_break = plan.planned_start_break_ts - first;
            assert!(START_BREAK_OFFSET.contains(&start_break), "{start_break}");
            let stop_break = plan.planned_stop_break_ts - plan.planned_start_break_ts;
            assert!(STOP_BREAK_OFFSET.contains(&stop_break), "{stop_break}");
            let final_offset = plan.planned_final_ts - first;
            assert!(FINAL_OFFSET.contains(&final_offset), "{final_offset}");
        }
    }

    #[test]
    fn test_explicit_values_are_not_redrawn() {
        let planner = planner(11);
        let first = secs(&local(7, 0));
        let req = PlanRequest {
            first_click: first,
            start_break_actual: Stamp::Pending,
            planned_start_break: Stamp::Decided(first + 15_000.0),
            planned_stop_break: Stamp::Decided(first + 16_000.0),
            planned_final: Stamp::Decided(first + 26_000.0),
        };
        let a = planner.plan_clicks(&req);
        let b = planner.plan_clicks(&req);
        assert_eq!(a, b);
        assert_eq!(a.planned_start_break_ts, first + 15_000.0);
        assert_eq!(a.planned_final_ts, first + 26_000.0);
    }

    #[test]
    fn test_stop_break_anchors_on_actual_start_break() {
        let planner = planner(3);
        let first = secs(&local(7, 0));
        let actual = first + 4.0 * HOUR + 50.0 * MINUTE;
        let req = PlanRequest {
            start_break_actual: Stamp::Decided(actual),
            ..PlanRequest::new(first)
        };
        let plan = planner.plan_clicks(&req);
        assert!(STOP_BREAK_OFFSET.contains(&(plan.planned_stop_break_ts - actual)));
    }

    #[test]
    fn test_reanchor_keeps_offset() {
        let planner = planner(5);
        let moved = planner.reanchor_stop_break(1_000.0, 1_900.0, 1_030.0);
        assert_eq!(moved, 1_930.0);

        let redrawn = planner.reanchor_stop_break(1_000.0, 5_000.0, 1_030.0);
        assert!(STOP_BREAK_OFFSET.contains(&(redrawn - 1_030.0)));
    }

    #[test]
    fn test_first_target_inside_window() {
        let planner = planner(1);
        let before = local(5, 30);
        let (start, end) = planner.window_on(&before).unwrap();
        for _ in 0..200 {
            let ts = planner.plan_first(&before).unwrap();
            assert!(ts >= secs(&start) && ts < secs(&end));
        }

        let during = local(8, 0);
        for _ in 0..200 {
            let ts = planner.plan_first(&during).unwrap();
            assert!(ts >= secs(&during) && ts < secs(&end));
        }
    }

    #[test]
    fn test_first_target_after_cutoff_is_permanent_error() {
        let planner = planner(1);
        let err = planner.plan_first(&local(8, 35)).unwrap_err();
        assert!(matches!(err, PunchError::Planning(_)));
        assert!(err.is_permanent());
        assert!(planner.plan_first(&local(8, 31)).is_err());
    }

    #[test]
    fn test_first_target_with_no_room_left_is_error() {
        let planner = planner(3);
        let end = local(8, 31);
        let last_instant = end - chrono::Duration::nanoseconds(500);
        match planner.plan_first(&last_instant) {
            Ok(ts) => assert!(ts < secs(&end)),
            Err(err) => assert!(matches!(err, PunchError::Planning(_))),
        }

        let seven = NaiveTime::from_hms_opt(7, 0, 0).unwrap();
        let empty = Planner::seeded((seven, seven), 3);
        let err = empty.plan_first(&local(6, 0)).unwrap_err();
        assert!(matches!(err, PunchError::Planning(_)));
    }
}
