//! File-based runtime state store.
//! One JSON document, replaced atomically (tmp file + rename) on every write.
//! Readers are served from an in-memory copy and never see a torn snapshot.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use punchclock_core::error::Result;

use crate::state::{RuntimeState, StatePatch};

const STATE_FILE: &str = "runtime_state.json";

/// Latest-wins store for the single [`RuntimeState`].
pub struct StateStore {
    path: PathBuf,
    current: RwLock<RuntimeState>,
    /// Serializes read-merge-write cycles.
    writer: Mutex<()>,
}

impl StateStore {
    /// Open the store in `dir`, loading the persisted snapshot if there is one.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(STATE_FILE);
        let state = load(&path);
        Ok(Self {
            path,
            current: RwLock::new(state),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the last durably written state.
    pub fn get(&self) -> RuntimeState {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Merge `patch` into the current state and persist it. Returns the new state.
    pub fn set(&self, patch: StatePatch, now: DateTime<Utc>) -> Result<RuntimeState> {
        let _guard = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = self.get();
        patch.apply(&mut next, now);
        write_json_atomic(&self.path, &next)?;
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next.clone();
        tracing::debug!("💾 Runtime state saved: phase={}", next.phase);
        Ok(next)
    }
}

fn load(path: &Path) -> RuntimeState {
    if !path.exists() {
        return RuntimeState::default();
    }
    match std::fs::read_to_string(path) {
        Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
            tracing::warn!("⚠️ Failed to parse {}: {e}", path.display());
            RuntimeState::default()
        }),
        Err(e) => {
            tracing::warn!("⚠️ Failed to read {}: {e}", path.display());
            RuntimeState::default()
        }
    }
}

/// Write `value` as pretty JSON next to `path`, fsync, then rename over it.
pub(crate) fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Action, Phase, Stamp};

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("punchclock-test-store-{name}"));
        std::fs::remove_dir_all(&dir).ok();
        dir
    }

    #[test]
    fn test_missing_file_yields_before_start() {
        let dir = temp_dir("missing");
        let store = StateStore::open(&dir).unwrap();
        assert_eq!(store.get().phase, Phase::BeforeStart);
        assert!(!store.path().exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_phase_only_update_preserves_timestamps() {
        let dir = temp_dir("partial");
        let store = StateStore::open(&dir).unwrap();
        store
            .set(
                StatePatch::transition(Phase::WorkingBeforeBreak, "Workday started")
                    .run("r1", "workday_flow")
                    .actual(Action::Start, Stamp::Decided(1_000.0))
                    .planned(Action::StartBreak, Stamp::Decided(15_400.0))
                    .planned(Action::Final, Stamp::Decided(26_200.0)),
                Utc::now(),
            )
            .unwrap();

        let state = store
            .set(
                StatePatch {
                    phase: Some(Phase::OnBreak),
                    ..StatePatch::default()
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(state.phase, Phase::OnBreak);
        assert_eq!(state.first_click_ts, Stamp::Decided(1_000.0));
        assert_eq!(state.planned_start_break_ts, Stamp::Decided(15_400.0));
        assert_eq!(state.planned_final_ts, Stamp::Decided(26_200.0));
        assert_eq!(state.run_id, "r1");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = temp_dir("reopen");
        {
            let store = StateStore::open(&dir).unwrap();
            store
                .set(
                    StatePatch::transition(Phase::OnBreak, "On break")
                        .actual(Action::StartBreak, Stamp::Decided(2_000.0)),
                    Utc::now(),
                )
                .unwrap();
        }
        let store = StateStore::open(&dir).unwrap();
        let state = store.get();
        assert_eq!(state.phase, Phase::OnBreak);
        assert_eq!(state.start_break_ts, Stamp::Decided(2_000.0));
        assert!(!dir.join("runtime_state.json.tmp").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_corrupt_file_falls_back_to_default() {
        let dir = temp_dir("corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(STATE_FILE), "{ not json").unwrap();
        let store = StateStore::open(&dir).unwrap();
        assert_eq!(store.get().phase, Phase::BeforeStart);
        std::fs::remove_dir_all(&dir).ok();
    }
}
