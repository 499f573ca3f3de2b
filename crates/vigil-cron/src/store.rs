//! Durable job storage: a single JSON document, replaced atomically.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{CronJob, Result};

/// On-disk shape: `{ "jobs": [...] }`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct JobsDocument {
    #[serde(default)]
    jobs: Vec<CronJob>,
}

/// Whole-document store for cron jobs.
///
/// Every save writes a sibling temp file and renames it over the
/// previous snapshot, so a crash mid-write leaves the old document
/// intact.
pub struct CronStore {
    path: PathBuf,
}

impl CronStore {
    /// Create a store at `path`, creating parent directories.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Load all jobs; a missing file is an empty store.
    pub fn load(&self) -> Result<Vec<CronJob>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        let doc: JobsDocument = serde_json::from_str(&raw)?;
        Ok(doc.jobs)
    }

    /// Replace the stored document with `jobs`.
    pub fn save(&self, jobs: &[CronJob]) -> Result<()> {
        let doc = JobsDocument {
            jobs: jobs.to_vec(),
        };
        let raw = serde_json::to_string_pretty(&doc)?;
        let tmp = self.tmp_path();
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CronJobState, RunStatus, Schedule};
    use tempfile::TempDir;

    fn sample_job(id: &str, name: &str) -> CronJob {
        CronJob {
            id: id.to_string(),
            name: name.to_string(),
            schedule: Schedule::Every {
                every: "30m".to_string(),
            },
            payload: "check markets".to_string(),
            enabled: true,
            state: CronJobState {
                next_run_at_ms: Some(1_700_000_000_000),
                last_run_at_ms: None,
                last_status: Some(RunStatus::Ok),
                consecutive_errors: 0,
            },
            created_at: 1_699_999_000_000,
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = CronStore::open(dir.path().join("jobs.json")).unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_load_round_trip_preserves_order() {
        let dir = TempDir::new().unwrap();
        let store = CronStore::open(dir.path().join("jobs.json")).unwrap();
        store
            .save(&[sample_job("a", "first"), sample_job("b", "second")])
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "a");
        assert_eq!(loaded[1].id, "b");
        assert_eq!(loaded[0].state.next_run_at_ms, Some(1_700_000_000_000));
        assert_eq!(loaded[0].state.last_status, Some(RunStatus::Ok));
    }

    #[test]
    fn test_save_replaces_previous_document() {
        let dir = TempDir::new().unwrap();
        let store = CronStore::open(dir.path().join("jobs.json")).unwrap();
        store
            .save(&[sample_job("a", "first"), sample_job("b", "second")])
            .unwrap();
        store.save(&[sample_job("b", "second")]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "b");
        // A completed save leaves no temp file behind
        assert!(!dir.path().join("jobs.json.tmp").exists());
    }

    #[test]
    fn test_document_shape_is_jobs_array_with_camel_case() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.json");
        let store = CronStore::open(&path).unwrap();
        store.save(&[sample_job("a", "first")]).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let jobs = raw.get("jobs").and_then(|j| j.as_array()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].get("createdAt").is_some());
        let state = jobs[0].get("state").unwrap();
        assert!(state.get("nextRunAtMs").is_some());
        assert_eq!(state.get("lastStatus").unwrap(), "ok");
    }
}
