//! # punchclock scheduler
//!
//! Single-process scheduler for one daily four-click flow against a web
//! time-clock: start, start break, stop break, end of day.
//!
//! ## Design Principles
//! - File-based state: one JSON document plus an append-only JSONL log
//! - The log is written before the state, so a crash never loses a click
//! - Tokio timers only, zero overhead while waiting
//! - One run at a time, guarded by a non-blocking lock
//!
//! ## Architecture
//! ```text
//! FlowEngine::run
//!   ├── Planner: first click in window, then break / stop / final offsets
//!   ├── sleep_until(target) (Clock, cancellable)
//!   ├── AutomationDriver: open session → navigate → click → confirm
//!   ├── Journal (runtime_events.jsonl) → StateStore (runtime_state.json)
//!   └── Notifier: per-click webhook, final webhook
//!
//! Recovery
//!   ├── replay(state, events) → rebuild lost timestamps
//!   ├── retry_failed_action / resume_pending_flow
//!   └── reset_session
//! ```

pub mod clock;
pub mod driver;
pub mod engine;
pub mod journal;
pub mod notify;
pub mod planner;
pub mod recovery;
pub mod settings;
pub mod state;
pub mod status;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use driver::{AutomationDriver, CommandDriver, DryRunDriver};
pub use engine::{FlowEngine, RunOutcome, spawn_auto_start};
pub use journal::{EventFilter, EventKind, EventLogEntry, Journal};
pub use notify::{Hook, NoopNotifier, Notifier, WebhookNotifier, WebhookPayload};
pub use planner::{PlanRequest, PlannedClicks, Planner};
pub use recovery::ResetOutcome;
pub use settings::{Settings, SettingsStore};
pub use state::{Action, Phase, RuntimeState, Stamp, StatePatch};
pub use status::{ClickRecord, StatusReport};
pub use store::StateStore;
