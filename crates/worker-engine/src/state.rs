use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::run::RunRecord;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateIndex {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    runs: Vec<String>,
}

/// Durable record of the worker's live runs.
///
/// Layout: an aggregate index at `work_dir/state.json` plus one record file
/// per run under `work_dir/state/`. All writes go temp-then-rename on the
/// blocking pool; a record that fails to parse is quarantined rather than
/// taking the worker down.
pub(crate) struct StateStore {
    index_path: PathBuf,
    runs_dir: PathBuf,
    runs: Mutex<BTreeMap<String, RunRecord>>,
}

impl StateStore {
    pub(crate) fn open(work_dir: &Path) -> anyhow::Result<Self> {
        let runs_dir = work_dir.join("state");
        std::fs::create_dir_all(&runs_dir)?;
        Ok(Self {
            index_path: work_dir.join("state.json"),
            runs_dir,
            runs: Mutex::new(BTreeMap::new()),
        })
    }

    /// Load records persisted by a previous process into the store and
    /// return them for resumption. Unparseable records are renamed with a
    /// `.corrupt` suffix and skipped.
    pub(crate) fn load_previous_runs(&self) -> Vec<RunRecord> {
        let mut uuids: Vec<String> = Vec::new();
        if self.index_path.exists() {
            match std::fs::read_to_string(&self.index_path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| Ok(serde_json::from_str::<StateIndex>(&raw)?))
            {
                Ok(index) => uuids = index.runs,
                Err(err) => log::warn!("unreadable state index, starting empty: {err:#}"),
            }
        }

        let mut records = Vec::new();
        let mut runs = self.lock();
        for uuid in uuids {
            let path = self.run_path(&uuid);
            let parsed = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| Ok(serde_json::from_str::<RunRecord>(&raw)?));
            match parsed {
                Ok(record) => {
                    runs.insert(record.uuid.clone(), record.clone());
                    records.push(record);
                }
                Err(err) => {
                    log::warn!("quarantining unreadable run record {uuid}: {err:#}");
                    let quarantine = path.with_extension("json.corrupt");
                    if let Err(err) = std::fs::rename(&path, &quarantine) {
                        log::warn!("failed to quarantine {}: {err}", path.display());
                    }
                }
            }
        }
        records
    }

    pub(crate) fn add_run(&self, record: RunRecord) {
        let mut runs = self.lock();
        runs.insert(record.uuid.clone(), record);
    }

    /// Apply `mutate` to the record, returning the updated copy.
    pub(crate) fn update_run(
        &self,
        uuid: &str,
        mutate: impl FnOnce(&mut RunRecord),
    ) -> Option<RunRecord> {
        let mut runs = self.lock();
        let record = runs.get_mut(uuid)?;
        mutate(record);
        Some(record.clone())
    }

    /// Drop the run from the store; its record file goes away on the next
    /// `save`.
    pub(crate) fn finish_run(&self, uuid: &str) {
        let mut runs = self.lock();
        runs.remove(uuid);
    }

    pub(crate) fn get(&self, uuid: &str) -> Option<RunRecord> {
        self.lock().get(uuid).cloned()
    }

    pub(crate) fn map_runs<T>(&self, f: impl FnMut(&RunRecord) -> T) -> Vec<T> {
        self.lock().values().map(f).collect()
    }

    pub(crate) fn has_runs(&self) -> bool {
        !self.lock().is_empty()
    }

    /// Persist the index and every record atomically, pruning files of
    /// finished runs. Failures are the caller's to log; in-memory state
    /// keeps driving behavior either way.
    pub(crate) async fn save(&self) -> anyhow::Result<()> {
        let (index, records) = {
            let runs = self.lock();
            let index = StateIndex {
                version: 1,
                runs: runs.keys().cloned().collect(),
            };
            (index, runs.values().cloned().collect::<Vec<_>>())
        };

        let index_path = self.index_path.clone();
        let runs_dir = self.runs_dir.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            for record in &records {
                let path = runs_dir.join(format!("{}.json", record.uuid));
                let json = serde_json::to_string_pretty(record)?;
                let tmp = path.with_extension("json.tmp");
                std::fs::write(&tmp, json)?;
                std::fs::rename(tmp, &path)?;
            }

            let json = serde_json::to_string_pretty(&index)?;
            let tmp = index_path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(tmp, &index_path)?;

            // Prune record files for runs no longer live.
            let live: std::collections::HashSet<String> = index.runs.into_iter().collect();
            for entry in std::fs::read_dir(&runs_dir)?.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(uuid) = name.strip_suffix(".json") else {
                    continue;
                };
                if !live.contains(uuid) {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
            Ok(())
        })
        .await
        .map_err(|err| anyhow::anyhow!("state save task failed: {err}"))?
    }

    fn run_path(&self, uuid: &str) -> PathBuf {
        self.runs_dir.join(format!("{uuid}.json"))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, RunRecord>> {
        self.runs.lock().expect("state store lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_record;

    #[tokio::test]
    async fn records_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = StateStore::open(dir.path()).unwrap();
            store.add_run(test_record("0xaaa"));
            store.add_run(test_record("0xbbb"));
            store.save().await.unwrap();
        }

        let store = StateStore::open(dir.path()).unwrap();
        let records = store.load_previous_runs();
        let uuids: Vec<&str> = records.iter().map(|r| r.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["0xaaa", "0xbbb"]);
        assert!(store.has_runs());
    }

    #[tokio::test]
    async fn corrupt_record_is_quarantined_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = StateStore::open(dir.path()).unwrap();
            store.add_run(test_record("0xaaa"));
            store.add_run(test_record("0xbbb"));
            store.save().await.unwrap();
        }
        std::fs::write(dir.path().join("state/0xaaa.json"), b"{not json").unwrap();

        let store = StateStore::open(dir.path()).unwrap();
        let records = store.load_previous_runs();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].uuid, "0xbbb");
        assert!(dir.path().join("state/0xaaa.json.corrupt").exists());
    }

    #[tokio::test]
    async fn finish_run_prunes_record_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.add_run(test_record("0xaaa"));
        store.save().await.unwrap();
        assert!(dir.path().join("state/0xaaa.json").exists());

        store.finish_run("0xaaa");
        store.save().await.unwrap();
        assert!(!dir.path().join("state/0xaaa.json").exists());
        assert!(!store.has_runs());
    }

    #[tokio::test]
    async fn update_run_returns_mutated_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        store.add_run(test_record("0xaaa"));

        let updated = store
            .update_run("0xaaa", |record| {
                record.stdout_offset = 42;
            })
            .unwrap();
        assert_eq!(updated.stdout_offset, 42);
        assert_eq!(store.get("0xaaa").unwrap().stdout_offset, 42);
        assert!(store.update_run("0xmissing", |_| {}).is_none());
    }
}
