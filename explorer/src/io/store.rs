//! Durable exploration records under `.explorer/explorations/`.
//!
//! One JSON file per exploration, written atomically after every recorded
//! attempt and status transition so a crash mid-run still leaves an accurate
//! record on disk.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::types::{Exploration, ExplorationStatus};

/// Lookup for an exploration id that has no record.
#[derive(Debug, Clone)]
pub struct ExplorationNotFoundError {
    pub id: String,
}

impl fmt::Display for ExplorationNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no exploration record for id '{}'", self.id)
    }
}

impl std::error::Error for ExplorationNotFoundError {}

/// Filesystem-backed store of exploration records.
#[derive(Debug, Clone)]
pub struct ExplorationStore {
    dir: PathBuf,
}

impl ExplorationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persist the record, replacing any previous version atomically.
    #[instrument(skip_all, fields(id = %exploration.id, status = exploration.status.as_str()))]
    pub fn save(&self, exploration: &Exploration) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create record dir {}", self.dir.display()))?;
        let mut json =
            serde_json::to_string_pretty(exploration).context("serialize exploration record")?;
        json.push('\n');

        let path = self.record_path(&exploration.id);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &json)
            .with_context(|| format!("write temp record {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("replace record {}", path.display()))?;
        debug!(path = %path.display(), "exploration record saved");
        Ok(())
    }

    /// Load one exploration by id.
    pub fn get(&self, id: &str) -> Result<Exploration> {
        let path = self.record_path(id);
        if !path.exists() {
            return Err(anyhow!(ExplorationNotFoundError { id: id.to_string() }));
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
    }

    /// All explorations, newest first (by creation time, id as tiebreaker).
    pub fn list(&self) -> Result<Vec<Exploration>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut explorations = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("read record dir {}", self.dir.display()))?
        {
            let entry = entry.context("read record dir entry")?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            let exploration: Exploration = serde_json::from_str(&contents)
                .with_context(|| format!("parse {}", path.display()))?;
            explorations.push(exploration);
        }
        explorations.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(explorations)
    }

    /// The exploration currently in `Running` status, if any.
    ///
    /// The engine refuses to start a second exploration while one is running
    /// in the same working tree.
    pub fn running(&self) -> Result<Option<Exploration>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|e| e.status == ExplorationStatus::Running))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exploration(id: &str, created_at: u64) -> Exploration {
        Exploration::new(
            id.to_string(),
            format!("explore/{id}"),
            "main".to_string(),
            Vec::new(),
            10,
            created_at,
        )
    }

    #[test]
    fn save_then_get_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ExplorationStore::new(temp.path().join("explorations"));

        let record = exploration("explore-abc12345", 100);
        store.save(&record).expect("save");
        let loaded = store.get("explore-abc12345").expect("get");
        assert_eq!(loaded, record);
    }

    #[test]
    fn get_unknown_id_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ExplorationStore::new(temp.path().join("explorations"));

        let err = store.get("explore-missing").unwrap_err();
        assert!(err.downcast_ref::<ExplorationNotFoundError>().is_some());
    }

    #[test]
    fn list_is_newest_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ExplorationStore::new(temp.path().join("explorations"));

        store.save(&exploration("explore-aaa11111", 100)).expect("save");
        store.save(&exploration("explore-bbb22222", 300)).expect("save");
        store.save(&exploration("explore-ccc33333", 200)).expect("save");

        let ids: Vec<String> = store.list().expect("list").into_iter().map(|e| e.id).collect();
        assert_eq!(
            ids,
            vec!["explore-bbb22222", "explore-ccc33333", "explore-aaa11111"]
        );
    }

    #[test]
    fn running_finds_only_non_terminal_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ExplorationStore::new(temp.path().join("explorations"));

        let mut done = exploration("explore-done1111", 100);
        done.status = ExplorationStatus::Succeeded;
        store.save(&done).expect("save");
        assert!(store.running().expect("running").is_none());

        let active = exploration("explore-live2222", 200);
        store.save(&active).expect("save");
        let found = store.running().expect("running").expect("some");
        assert_eq!(found.id, "explore-live2222");
    }

    #[test]
    fn save_is_an_upsert() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ExplorationStore::new(temp.path().join("explorations"));

        let mut record = exploration("explore-upd11111", 100);
        store.save(&record).expect("save");
        record.status = ExplorationStatus::Aborted;
        record.error = Some("interrupted".to_string());
        store.save(&record).expect("save again");

        let loaded = store.get("explore-upd11111").expect("get");
        assert_eq!(loaded.status, ExplorationStatus::Aborted);
        assert_eq!(loaded.error.as_deref(), Some("interrupted"));
        assert_eq!(store.list().expect("list").len(), 1);
    }
}
