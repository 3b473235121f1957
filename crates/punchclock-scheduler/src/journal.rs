//! Append-only event log (JSON lines).
//!
//! Every transition and executed action lands here before anything else is
//! updated, so the log can rebuild timestamps the runtime state lost.
//! Entries are never mutated; the only rewrite is the retention prune,
//! which drops whole lines older than the retention window.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};

use punchclock_core::error::Result;

use crate::state::Phase;

const EVENTS_FILE: &str = "runtime_events.jsonl";

/// What an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StateTransition,
    ScheduledFirst,
    ScheduledStartBreak,
    ScheduledStopBreak,
    ScheduledFinal,
    ClickWebhookSent,
    FinalWebhookSent,
    RunRejected,
    PlanningFailed,
    ActionFailed,
    ResumeStart,
    ResumeCompleted,
    RetryRequested,
    ManualSessionReset,
    ManualSessionResetNoop,
    /// The page already showed an action as done when a resumed run got to it.
    ManualStateDetected,
    /// Written by a newer build; kept readable.
    #[serde(other)]
    Unknown,
}

/// One immutable log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub ts: DateTime<Local>,
    pub event: EventKind,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub job: String,
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl EventLogEntry {
    pub fn new(event: EventKind, ts: DateTime<Local>) -> Self {
        Self {
            ts,
            event,
            run_id: String::new(),
            job: String::new(),
            phase: None,
            meta: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn run(mut self, run_id: &str, job: &str) -> Self {
        self.run_id = run_id.to_string();
        self.job = job.to_string();
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }

    /// String field of `meta`, if present.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(|v| v.as_str())
    }
}

/// Selection over the log. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub run_id: Option<String>,
    pub phase: Option<Phase>,
    pub kind: Option<EventKind>,
    /// Local calendar day of `ts`.
    pub day: Option<NaiveDate>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_run(run_id: &str) -> Self {
        Self {
            run_id: Some(run_id.to_string()),
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: EventKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn day(mut self, day: NaiveDate) -> Self {
        self.day = Some(day);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entry: &EventLogEntry) -> bool {
        if let Some(run_id) = &self.run_id
            && &entry.run_id != run_id
        {
            return false;
        }
        if self.phase.is_some() && entry.phase != self.phase {
            return false;
        }
        if let Some(kind) = self.kind
            && entry.event != kind
        {
            return false;
        }
        if let Some(day) = self.day
            && entry.ts.date_naive() != day
        {
            return false;
        }
        true
    }
}

/// File-backed event log.
pub struct Journal {
    path: PathBuf,
    retention_days: u32,
    /// Serializes appends and prunes; remembers the day of the last prune.
    writer: Mutex<Option<NaiveDate>>,
}

impl Journal {
    pub fn open(dir: &Path, retention_days: u32) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(EVENTS_FILE),
            retention_days,
            writer: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it to disk. Errors must abort the caller's action.
    pub fn append(&self, entry: &EventLogEntry) -> Result<()> {
        let mut last_prune = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let today = entry.ts.date_naive();
        if *last_prune != Some(today) {
            match self.prune_locked(entry.ts) {
                Ok(0) => {}
                Ok(dropped) => tracing::info!("🧹 Pruned {dropped} old runtime events"),
                Err(e) => tracing::warn!("⚠️ Event prune failed: {e}"),
            }
            *last_prune = Some(today);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        let mut line = String::new();
        if ends_torn(&mut file)? {
            tracing::warn!("⚠️ Event log ended mid-line; sealing the torn entry");
            line.push('\n');
        }
        line.push_str(&serde_json::to_string(entry)?);
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        tracing::debug!("📝 Event {:?} run={}", entry.event, entry.run_id);
        Ok(())
    }

    /// Matching entries in append (chronological) order.
    pub fn query(&self, filter: &EventFilter) -> Result<Vec<EventLogEntry>> {
        let mut matched: Vec<EventLogEntry> = self
            .read_all()?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect();
        if let Some(limit) = filter.limit
            && matched.len() > limit
        {
            matched.drain(..matched.len() - limit);
        }
        Ok(matched)
    }

    /// Every readable entry. Malformed lines are skipped.
    pub fn read_all(&self) -> Result<Vec<EventLogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("⚠️ Skipping malformed event line: {e}");
                    None
                }
            })
            .collect())
    }

    /// Drop entries older than the retention window. Returns how many were removed.
    pub fn prune(&self, now: DateTime<Local>) -> Result<usize> {
        let _guard = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.prune_locked(now)
    }

    fn prune_locked(&self, now: DateTime<Local>) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let cutoff = now - chrono::Duration::days(i64::from(self.retention_days));
        let content = std::fs::read_to_string(&self.path)?;
        let mut kept = String::with_capacity(content.len());
        let mut dropped = 0;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let stale = serde_json::from_str::<EventLogEntry>(line)
                .map(|e| e.ts < cutoff)
                .unwrap_or(false);
            if stale {
                dropped += 1;
            } else {
                kept.push_str(line);
                kept.push('\n');
            }
        }
        if dropped > 0 {
            let tmp = self.path.with_extension("jsonl.tmp");
            {
                let mut file = std::fs::File::create(&tmp)?;
                file.write_all(kept.as_bytes())?;
                file.sync_all()?;
            }
            std::fs::rename(&tmp, &self.path)?;
        }
        Ok(dropped)
    }
}

/// Whether the file's last byte is something other than a newline,
/// i.e. a previous write was interrupted mid-line.
fn ends_torn(file: &mut std::fs::File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
