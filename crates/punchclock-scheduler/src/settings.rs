//! Operator-editable settings: the blocked date range.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use punchclock_core::error::{PunchError, Result};

use crate::store::write_json_atomic;

const SETTINGS_FILE: &str = "settings.json";

/// Inclusive range of local days on which no run may start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub blocked_start_date: Option<NaiveDate>,
    #[serde(default)]
    pub blocked_end_date: Option<NaiveDate>,
}

impl Settings {
    /// Validate raw operator input. Empty strings clear the range.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let start = parse_day(start)?;
        let end = parse_day(end)?;
        let settings = Self {
            blocked_start_date: start,
            blocked_end_date: end,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        match (self.blocked_start_date, self.blocked_end_date) {
            (Some(start), Some(end)) if start > end => Err(PunchError::Settings(
                "Start date cannot be later than end date".into(),
            )),
            (Some(_), None) | (None, Some(_)) => Err(PunchError::Settings(
                "You must provide both dates: start and end".into(),
            )),
            _ => Ok(()),
        }
    }

    pub fn is_blocked(&self, day: NaiveDate) -> bool {
        match (self.blocked_start_date, self.blocked_end_date) {
            (Some(start), Some(end)) => start <= day && day <= end,
            _ => false,
        }
    }
}

fn parse_day(raw: &str) -> Result<Option<NaiveDate>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| PunchError::Settings("Invalid date format. Use YYYY-MM-DD".into()))
}

/// Settings persisted as one JSON file, cached in memory.
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(SETTINGS_FILE);
        let current = load(&path);
        Ok(Self {
            path,
            current: RwLock::new(current),
        })
    }

    pub fn get(&self) -> Settings {
        *self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate, persist, then publish the new range.
    pub fn update(&self, start: &str, end: &str) -> Result<Settings> {
        let settings = Settings::parse(start, end)?;
        let mut current = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        write_json_atomic(&self.path, &settings)?;
        *current = settings;
        tracing::info!(
            "⚙️ Blocked range updated: {:?} to {:?}",
            settings.blocked_start_date,
            settings.blocked_end_date
        );
        Ok(settings)
    }

    pub fn is_blocked(&self, day: NaiveDate) -> bool {
        self.get().is_blocked(day)
    }
}

fn load(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }
    let parsed = std::fs::read_to_string(path)
        .map_err(PunchError::from)
        .and_then(|json| serde_json::from_str::<Settings>(&json).map_err(PunchError::from));
    match parsed {
        Ok(settings) => match settings.validate() {
            Ok(()) => settings,
            Err(e) => {
                tracing::warn!("⚠️ Ignoring invalid settings in {}: {e}", path.display());
                Settings::default()
            }
        },
        Err(e) => {
            tracing::warn!("⚠️ Failed to load settings from {}: {e}", path.display());
            Settings::default()
        }
    }
}
