//! Crash-storm guard.
//!
//! A persisted configuration the stats daemon cannot load makes it crash on
//! every start. When the daemon dies `threshold` times inside the death
//! retention window, one configuration file is deleted and the death count
//! starts over. Which file is removed is not attributable to the crash: the
//! first file in name order goes, and several bad files take several storms
//! to clear.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use companion_core::{CompanionConfig, DeletedConfigRecord, ElapsedMillis};

/// What a death event led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    /// Below threshold; `deaths` recorded inside the window, this one included.
    Recorded { deaths: usize },
    /// Threshold reached. `deleted` names the removed file, if any was removed.
    Mitigated { deleted: Option<String> },
}

#[derive(Debug)]
pub struct CrashStormGuard {
    config_dir: PathBuf,
    threshold: usize,
    death_retention: ElapsedMillis,
    deleted_retention: ElapsedMillis,
    deaths: Vec<ElapsedMillis>,
    deleted: BTreeMap<ElapsedMillis, String>,
}

impl CrashStormGuard {
    pub fn new(
        config_dir: impl Into<PathBuf>,
        threshold: usize,
        death_retention: Duration,
        deleted_retention: Duration,
    ) -> Self {
        Self {
            config_dir: config_dir.into(),
            threshold: threshold.max(1),
            death_retention: millis(death_retention),
            deleted_retention: millis(deleted_retention),
            deaths: Vec::new(),
            deleted: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &CompanionConfig) -> Self {
        Self::new(
            &config.config_dir,
            config.death_threshold,
            config.death_retention,
            config.deleted_retention,
        )
    }

    /// Account for one daemon death at `now`.
    pub fn record_death(&mut self, now: ElapsedMillis) -> GuardOutcome {
        self.prune(now);
        self.deaths.push(now);
        if self.deaths.len() < self.threshold {
            return GuardOutcome::Recorded {
                deaths: self.deaths.len(),
            };
        }

        self.deaths.clear();
        tracing::warn!(
            threshold = self.threshold,
            config_dir = %self.config_dir.display(),
            "stats daemon crash storm; removing one persisted config"
        );
        GuardOutcome::Mitigated {
            deleted: self.delete_one_config(now),
        }
    }

    fn prune(&mut self, now: ElapsedMillis) {
        let death_retention = self.death_retention;
        let deleted_retention = self.deleted_retention;
        self.deaths.retain(|at| now - *at <= death_retention);
        self.deleted.retain(|at, _| now - *at <= deleted_retention);
    }

    fn delete_one_config(&mut self, now: ElapsedMillis) -> Option<String> {
        let candidate = match first_config_file(&self.config_dir) {
            Ok(Some(path)) => path,
            Ok(None) => {
                tracing::info!("no persisted configs to remove");
                return None;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to list persisted configs");
                return None;
            }
        };

        let name = candidate
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match fs::remove_file(&candidate) {
            Ok(()) => {
                tracing::warn!(file = %name, "deleted persisted config");
                self.deleted.insert(now, name.clone());
                Some(name)
            }
            Err(err) => {
                tracing::error!(file = %name, error = %err, "failed to delete persisted config");
                None
            }
        }
    }

    pub fn death_count(&self) -> usize {
        self.deaths.len()
    }

    pub fn deleted(&self) -> Vec<DeletedConfigRecord> {
        self.deleted
            .iter()
            .map(|(timestamp, file_name)| DeletedConfigRecord {
                timestamp: *timestamp,
                file_name: file_name.clone(),
            })
            .collect()
    }

    /// Diagnostic listing; `boot_time` converts elapsed stamps to wall time.
    pub fn dump(&self, boot_time: DateTime<Utc>) -> DumpReport {
        let entries = self
            .deleted
            .iter()
            .map(|(elapsed, file_name)| DumpEntry {
                deleted_at: boot_time + chrono::Duration::milliseconds(*elapsed),
                file_name: file_name.clone(),
            })
            .collect();
        DumpReport { entries }
    }
}

/// First regular file in `dir` by name. A missing directory has none.
fn first_config_file(dir: &Path) -> io::Result<Option<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files.into_iter().next())
}

fn millis(duration: Duration) -> ElapsedMillis {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpEntry {
    pub deleted_at: DateTime<Utc>,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpReport {
    pub entries: Vec<DumpEntry>,
}

impl fmt::Display for DumpReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Number of configuration files deleted: {}",
            self.entries.len()
        )?;
        if !self.entries.is_empty() {
            writeln!(f, "  timestamp, deleted file name")?;
        }
        for entry in &self.entries {
            writeln!(
                f,
                "  {}, {}",
                entry.deleted_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                entry.file_name
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    const HOUR: ElapsedMillis = 60 * 60 * 1000;
    const DAY: ElapsedMillis = 24 * HOUR;

    fn guard(dir: &Path, threshold: usize) -> CrashStormGuard {
        CrashStormGuard::new(
            dir,
            threshold,
            Duration::from_secs(24 * 60 * 60),
            Duration::from_secs(7 * 24 * 60 * 60),
        )
    }

    fn configs(dir: &TempDir, names: &[&str]) {
        for name in names {
            fs::write(dir.path().join(name), b"config").unwrap();
        }
    }

    fn remaining(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn ten_deaths_in_a_day_delete_exactly_one_config() {
        let dir = TempDir::new().unwrap();
        configs(&dir, &["a.cfg", "b.cfg", "c.cfg"]);
        let mut guard = guard(dir.path(), 10);

        for i in 0..9 {
            let outcome = guard.record_death(i * HOUR);
            assert_eq!(outcome, GuardOutcome::Recorded { deaths: i as usize + 1 });
        }
        assert_eq!(remaining(&dir).len(), 3, "nine deaths delete nothing");

        let outcome = guard.record_death(9 * HOUR + 1);
        assert_eq!(
            outcome,
            GuardOutcome::Mitigated {
                deleted: Some("a.cfg".to_string())
            }
        );
        assert_eq!(guard.death_count(), 0);
        assert_eq!(remaining(&dir), vec!["b.cfg", "c.cfg"]);
        assert_eq!(
            guard.deleted(),
            vec![DeletedConfigRecord {
                timestamp: 9 * HOUR + 1,
                file_name: "a.cfg".to_string()
            }]
        );
    }

    #[test]
    fn deaths_older_than_a_day_are_pruned() {
        let dir = TempDir::new().unwrap();
        let mut guard = guard(dir.path(), 10);

        guard.record_death(0);
        let outcome = guard.record_death(25 * HOUR);
        assert_eq!(outcome, GuardOutcome::Recorded { deaths: 1 });
    }

    #[test]
    fn spread_out_deaths_never_mitigate() {
        let dir = TempDir::new().unwrap();
        configs(&dir, &["only.cfg"]);
        let mut guard = guard(dir.path(), 3);

        for i in 0..10 {
            guard.record_death(i * 13 * HOUR);
        }
        assert_eq!(remaining(&dir), vec!["only.cfg"]);
    }

    #[test]
    fn deletion_records_expire_after_a_week() {
        let dir = TempDir::new().unwrap();
        configs(&dir, &["a.cfg"]);
        let mut guard = guard(dir.path(), 2);

        guard.record_death(0);
        guard.record_death(1_000);
        assert_eq!(guard.deleted().len(), 1);

        guard.record_death(1_000 + 8 * DAY);
        assert!(guard.deleted().is_empty());
    }

    #[test]
    fn missing_config_dir_mitigates_without_recording() {
        let dir = TempDir::new().unwrap();
        let mut guard = guard(&dir.path().join("absent"), 1);

        assert_eq!(
            guard.record_death(5),
            GuardOutcome::Mitigated { deleted: None }
        );
        assert!(guard.deleted().is_empty());
        assert_eq!(guard.death_count(), 0);
    }

    #[test]
    fn subdirectories_are_not_candidates() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("0-nested")).unwrap();
        configs(&dir, &["z.cfg"]);
        let mut guard = guard(dir.path(), 1);

        assert_eq!(
            guard.record_death(5),
            GuardOutcome::Mitigated {
                deleted: Some("z.cfg".to_string())
            }
        );
        assert!(dir.path().join("0-nested").is_dir());
    }

    #[test]
    fn dump_lists_wall_clock_deletions() {
        let dir = TempDir::new().unwrap();
        configs(&dir, &["poisoned.cfg"]);
        let mut guard = guard(dir.path(), 1);
        guard.record_death(90_000);

        let boot = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let report = guard.dump(boot);
        assert_eq!(report.entries.len(), 1);
        let text = report.to_string();
        assert!(text.starts_with("Number of configuration files deleted: 1\n"));
        assert!(text.contains("  timestamp, deleted file name\n"));
        assert!(text.contains("2026-03-01T12:01:30.000Z, poisoned.cfg"));
    }

    #[test]
    fn empty_dump_has_only_the_count() {
        let dir = TempDir::new().unwrap();
        let report = guard(dir.path(), 10).dump(Utc::now());
        assert_eq!(report.to_string(), "Number of configuration files deleted: 0\n");
    }
}
