//! Historical test duration tracking.
//!
//! The shard planner balances shards by estimated duration. Estimates come
//! from a rolling average of each test's past durations, persisted as JSON
//! (by default in `.shardline/durations.json`).
//!
//! # File Structure
//!
//! The file maps test ids to their running average:
//!
//! ```json
//! {
//!   "tests/cart.spec.ts::empty cart": {
//!     "average_ms": 1520.5,
//!     "samples": 7,
//!     "updated_at": "2026-01-01T00:00:00+00:00"
//!   }
//! }
//! ```
//!
//! # Example
//!
//! ```no_run
//! use shardline::history::DurationHistory;
//! use std::path::Path;
//! use std::time::Duration;
//!
//! let path = Path::new(".shardline/durations.json");
//! let mut history = DurationHistory::load(path);
//! history.record_sample("tests/a.spec.ts::works", Duration::from_millis(900));
//! history.save(path).unwrap();
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::record::FinalStatus;
use crate::report::RunReport;

/// Number of most recent samples the rolling average approximates.
pub const HISTORY_WINDOW: u32 = 10;

/// Rolling duration statistics for one test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationEntry {
    /// Rolling average in milliseconds.
    pub average_ms: f64,

    /// Number of samples folded in, capped at [`HISTORY_WINDOW`].
    pub samples: u32,

    /// RFC 3339 timestamp of the last update.
    pub updated_at: String,
}

/// Persisted duration estimates keyed by test id.
#[derive(Debug, Clone, Default)]
pub struct DurationHistory {
    entries: BTreeMap<String, DurationEntry>,
}

impl DurationHistory {
    /// Loads the history from disk.
    ///
    /// A missing or unreadable file yields an empty history; estimates are
    /// an optimization, never a reason to abort a run.
    pub fn load(path: &Path) -> Self {
        tracing::debug!("Loading duration history from: {}", path.display());

        if !path.exists() {
            tracing::debug!("History file does not exist, starting empty");
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(contents) => {
                match serde_json::from_str::<BTreeMap<String, DurationEntry>>(&contents) {
                    Ok(entries) => {
                        tracing::debug!("Loaded {} duration entries", entries.len());
                        Self { entries }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse history file, starting empty: {}", e);
                        Self::default()
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Failed to read history file, starting empty: {}", e);
                Self::default()
            }
        }
    }

    /// Saves the history to disk, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create history directory: {}", parent.display())
            })?;
        }

        let contents =
            serde_json::to_string_pretty(&self.entries).context("Failed to serialize history")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write history file: {}", path.display()))?;

        tracing::debug!("Saved {} duration entries", self.entries.len());
        Ok(())
    }

    /// Returns the entry for a test id.
    pub fn get(&self, id: &str) -> Option<&DurationEntry> {
        self.entries.get(id)
    }

    /// Returns the estimated duration of a test, if it has history.
    pub fn estimate(&self, id: &str) -> Option<Duration> {
        self.entries
            .get(id)
            .map(|e| Duration::from_millis(e.average_ms.round().max(0.0) as u64))
    }

    /// Folds one duration sample into the rolling average.
    pub fn record_sample(&mut self, id: &str, duration: Duration) {
        let sample = duration.as_secs_f64() * 1000.0;
        let now = chrono::Utc::now().to_rfc3339();

        match self.entries.get_mut(id) {
            Some(entry) => {
                let n = (entry.samples + 1).min(HISTORY_WINDOW);
                entry.average_ms += (sample - entry.average_ms) / f64::from(n);
                entry.samples = n;
                entry.updated_at = now;
            }
            None => {
                self.entries.insert(
                    id.to_string(),
                    DurationEntry {
                        average_ms: sample,
                        samples: 1,
                        updated_at: now,
                    },
                );
            }
        }
    }

    /// Records the final attempt duration of every executed test in a report.
    ///
    /// Skipped tests carry no timing information and are ignored.
    pub fn record_report(&mut self, report: &RunReport) {
        let mut recorded = 0;
        for result in &report.results {
            if result.status == FinalStatus::Skipped {
                continue;
            }
            if let Some(attempt) = result.final_attempt() {
                self.record_sample(&result.id, attempt.duration());
                recorded += 1;
            }
        }
        tracing::debug!("Recorded {} duration samples", recorded);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let history = DurationHistory::load(&temp_dir.path().join("durations.json"));
        assert!(history.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("durations.json");

        let mut history = DurationHistory::default();
        history.record_sample("a::t", Duration::from_millis(400));
        history.save(&path).unwrap();

        let loaded = DurationHistory::load(&path);
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.estimate("a::t"), Some(Duration::from_millis(400)));
        assert_eq!(loaded.get("a::t").unwrap().samples, 1);
    }

    #[test]
    fn test_rolling_average() {
        let mut history = DurationHistory::default();
        history.record_sample("a::t", Duration::from_millis(100));
        history.record_sample("a::t", Duration::from_millis(300));
        assert_eq!(history.estimate("a::t"), Some(Duration::from_millis(200)));

        // Once the window is full, new samples keep a fixed weight.
        for _ in 0..50 {
            history.record_sample("a::t", Duration::from_millis(1000));
        }
        let entry = history.get("a::t").unwrap();
        assert_eq!(entry.samples, HISTORY_WINDOW);
        assert!(entry.average_ms > 990.0 && entry.average_ms <= 1000.0);
    }

    #[test]
    fn test_corrupted_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("durations.json");
        fs::write(&path, "{ invalid json }").unwrap();

        let history = DurationHistory::load(&path);
        assert!(history.is_empty());
    }
}
