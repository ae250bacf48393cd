use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::backend::DependencyKeyDto;
use crate::fsutil;

/// Identity of a cached dependency payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct DependencyKey {
    pub(crate) parent_uuid: String,
    pub(crate) parent_path: String,
}

impl DependencyKey {
    pub(crate) fn new(parent_uuid: &str, parent_path: &str) -> Self {
        Self {
            parent_uuid: parent_uuid.to_string(),
            parent_path: parent_path.to_string(),
        }
    }

    /// Flat on-disk name the key can be reconstructed from:
    /// `<uuid>_<subpath>` with both components escaped.
    fn filename(&self) -> String {
        format!(
            "{}_{}",
            encode_component(&self.parent_uuid),
            encode_component(&self.parent_path)
        )
    }

    fn from_filename(name: &str) -> Option<Self> {
        let (uuid, path) = name.split_once('_')?;
        Some(Self {
            parent_uuid: decode_component(uuid)?,
            parent_path: decode_component(path)?,
        })
    }
}

/// Escape `/`, `_`, and `%` so keys round-trip through flat file names
/// (`_` separates the uuid from the subpath).
fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2f"),
            '_' => out.push_str("%5f"),
            c => out.push(c),
        }
    }
    out
}

fn decode_component(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match (chars.next()?, chars.next()?) {
            ('2', '5') => out.push('%'),
            ('2', 'f') => out.push('/'),
            ('5', 'f') => out.push('_'),
            _ => return None,
        }
    }
    Some(out)
}

/// Broadcast to waiters when a download settles.
#[derive(Debug, Clone)]
pub(crate) enum DownloadStatus {
    InProgress,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Downloading,
    Ready,
}

struct Entry {
    path: PathBuf,
    size_bytes: u64,
    last_used: i64,
    refs: HashSet<String>,
    state: EntryState,
    done_tx: watch::Sender<DownloadStatus>,
    done_rx: watch::Receiver<DownloadStatus>,
}

/// Result of [`DependencyCache::acquire`].
pub(crate) enum Acquired {
    /// This caller is the single downloader for the key.
    MustDownload { path: PathBuf },
    /// Another run is downloading; await the channel.
    Wait {
        path: PathBuf,
        done: watch::Receiver<DownloadStatus>,
    },
    /// Payload already on disk.
    Ready { path: PathBuf },
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    parent_uuid: String,
    parent_path: String,
    size_bytes: u64,
    last_used: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DependencyIndex {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    entries: Vec<IndexEntry>,
}

/// Content-addressed store of bundle payloads shared by runs.
///
/// One mutex guards the entry table; waiters block on per-entry watch
/// channels outside the lock. Entries are pinned while any live run holds a
/// reference and evicted oldest-first once the store exceeds its quota.
pub(crate) struct DependencyCache {
    root: PathBuf,
    index_path: PathBuf,
    quota_bytes: u64,
    entries: Mutex<HashMap<DependencyKey, Entry>>,
}

impl DependencyCache {
    /// Open the cache under `work_dir`, re-registering every payload found
    /// in the dependency directory.
    ///
    /// The directory is the ground truth: keys are reconstructed from file
    /// names, with size from disk and last-used from mtime. The side-car
    /// index only refines those figures for entries it still records, so a
    /// lost or corrupt index does not flush a warm cache.
    pub(crate) fn open(work_dir: &Path, quota_bytes: u64) -> anyhow::Result<Self> {
        let root = work_dir.join("dependencies");
        let index_path = work_dir.join("dependencies.json");
        std::fs::create_dir_all(&root)?;

        let mut recorded: HashMap<DependencyKey, (u64, i64)> = HashMap::new();
        if index_path.exists() {
            match std::fs::read_to_string(&index_path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| Ok(serde_json::from_str::<DependencyIndex>(&raw)?))
            {
                Ok(index) => {
                    for rec in index.entries {
                        recorded.insert(
                            DependencyKey::new(&rec.parent_uuid, &rec.parent_path),
                            (rec.size_bytes, rec.last_used),
                        );
                    }
                }
                Err(err) => {
                    log::warn!("unreadable dependency index, rescanning from disk: {err}")
                }
            }
        }

        let mut entries = HashMap::new();
        for dir_entry in std::fs::read_dir(&root)?.flatten() {
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let path = dir_entry.path();

            // Partial downloads left behind by a crashed process.
            if name.ends_with(".partial.tar.gz") {
                fsutil::remove_path(&path);
                continue;
            }
            let Some(key) = DependencyKey::from_filename(name) else {
                log::warn!("ignoring unrecognized dependency cache entry: {name}");
                continue;
            };

            let (size_bytes, last_used) = match recorded.get(&key) {
                Some(&(size_bytes, last_used)) => (size_bytes, last_used),
                None => {
                    let size_bytes = fsutil::path_size(&path);
                    let mtime = dir_entry
                        .metadata()
                        .ok()
                        .and_then(|meta| meta.modified().ok())
                        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
                        .and_then(|since| i64::try_from(since.as_secs()).ok())
                        .unwrap_or_else(now);
                    (size_bytes, mtime)
                }
            };

            let (done_tx, done_rx) = watch::channel(DownloadStatus::Ready);
            entries.insert(
                key,
                Entry {
                    path,
                    size_bytes,
                    last_used,
                    refs: HashSet::new(),
                    state: EntryState::Ready,
                    done_tx,
                    done_rx,
                },
            );
        }

        Ok(Self {
            root,
            index_path,
            quota_bytes,
            entries: Mutex::new(entries),
        })
    }

    /// Register `run_uuid` as a user of `key` and report what the caller
    /// must do. Exactly one caller per absent key gets
    /// [`Acquired::MustDownload`].
    pub(crate) fn acquire(&self, key: &DependencyKey, run_uuid: &str) -> Acquired {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.refs.insert(run_uuid.to_string());
            entry.last_used = now();
            return match entry.state {
                EntryState::Ready => Acquired::Ready {
                    path: entry.path.clone(),
                },
                EntryState::Downloading => Acquired::Wait {
                    path: entry.path.clone(),
                    done: entry.done_rx.clone(),
                },
            };
        }

        let path = self.root.join(key.filename());
        let (done_tx, done_rx) = watch::channel(DownloadStatus::InProgress);
        entries.insert(
            key.clone(),
            Entry {
                path: path.clone(),
                size_bytes: 0,
                last_used: now(),
                refs: std::iter::once(run_uuid.to_string()).collect(),
                state: EntryState::Downloading,
                done_tx,
                done_rx,
            },
        );
        Acquired::MustDownload { path }
    }

    /// Settle a download started via [`Acquired::MustDownload`].
    ///
    /// On success the entry becomes ready with its on-disk size recorded; on
    /// failure the entry (and any partial payload) is removed. Waiters are
    /// woken either way with the shared outcome.
    pub(crate) async fn finish_download(&self, key: &DependencyKey, result: Result<(), String>) {
        let path = {
            let entries = self.lock();
            match entries.get(key) {
                Some(entry) => entry.path.clone(),
                None => return,
            }
        };

        match result {
            Ok(()) => {
                let size_path = path.clone();
                let size = tokio::task::spawn_blocking(move || fsutil::path_size(&size_path))
                    .await
                    .unwrap_or(0);

                let mut entries = self.lock();
                if let Some(entry) = entries.get_mut(key) {
                    entry.state = EntryState::Ready;
                    entry.size_bytes = size;
                    entry.last_used = now();
                    let _ = entry.done_tx.send(DownloadStatus::Ready);
                }
            }
            Err(message) => {
                let removed = {
                    let mut entries = self.lock();
                    entries.remove(key)
                };
                if let Some(entry) = removed {
                    let _ = entry.done_tx.send(DownloadStatus::Failed(message));
                    tokio::task::spawn_blocking(move || fsutil::remove_path(&entry.path))
                        .await
                        .ok();
                }
            }
        }

        self.persist_index().await;
    }

    /// Unregister `run_uuid` from `key`. Safe to call for keys the run
    /// never acquired.
    pub(crate) fn release(&self, key: &DependencyKey, run_uuid: &str) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.refs.remove(run_uuid);
        }
    }

    /// Re-pin an existing ready entry for a resumed run. Never triggers a
    /// download; a missing entry is ignored (the resumed container already
    /// holds its bind mounts).
    pub(crate) fn readopt(&self, key: &DependencyKey, run_uuid: &str) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.refs.insert(run_uuid.to_string());
        }
    }

    /// On-disk location of a ready entry, if present.
    pub(crate) fn ready_path(&self, key: &DependencyKey) -> Option<PathBuf> {
        let entries = self.lock();
        entries
            .get(key)
            .filter(|entry| entry.state == EntryState::Ready)
            .map(|entry| entry.path.clone())
    }

    /// Ready entries advertised to the bundle service during check-in.
    pub(crate) fn ready_deps(&self) -> Vec<DependencyKeyDto> {
        let entries = self.lock();
        let mut deps: Vec<DependencyKeyDto> = entries
            .iter()
            .filter(|(_, entry)| entry.state == EntryState::Ready)
            .map(|(key, _)| DependencyKeyDto {
                parent_uuid: key.parent_uuid.clone(),
                parent_path: key.parent_path.clone(),
            })
            .collect();
        deps.sort();
        deps
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        let entries = self.lock();
        entries
            .values()
            .filter(|entry| entry.state == EntryState::Ready)
            .map(|entry| entry.size_bytes)
            .sum()
    }

    /// One eviction pass: delete oldest unreferenced ready entries until the
    /// store fits its quota or no eligible entry remains.
    pub(crate) async fn cleanup_step(&self) {
        loop {
            let victim = {
                let mut entries = self.lock();
                let total: u64 = entries
                    .values()
                    .filter(|entry| entry.state == EntryState::Ready)
                    .map(|entry| entry.size_bytes)
                    .sum();
                if total <= self.quota_bytes {
                    break;
                }

                let key = entries
                    .iter()
                    .filter(|(_, entry)| {
                        entry.refs.is_empty() && entry.state == EntryState::Ready
                    })
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(key, _)| key.clone());
                let Some(key) = key else { break };
                entries.remove(&key)
            };

            let Some(entry) = victim else { break };
            log::debug!(
                "evicting dependency {} ({} bytes)",
                entry.path.display(),
                entry.size_bytes
            );
            tokio::task::spawn_blocking(move || fsutil::remove_path(&entry.path))
                .await
                .ok();
        }

        self.persist_index().await;
    }

    /// Background eviction loop; aborted by the worker on drain.
    pub(crate) async fn run_cleanup(&self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            self.cleanup_step().await;
        }
    }

    async fn persist_index(&self) {
        let index = {
            let entries = self.lock();
            DependencyIndex {
                version: 1,
                entries: entries
                    .iter()
                    .filter(|(_, entry)| entry.state == EntryState::Ready)
                    .map(|(key, entry)| IndexEntry {
                        parent_uuid: key.parent_uuid.clone(),
                        parent_path: key.parent_path.clone(),
                        size_bytes: entry.size_bytes,
                        last_used: entry.last_used,
                    })
                    .collect(),
            }
        };

        let path = self.index_path.clone();
        let res = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let json = serde_json::to_string_pretty(&index)?;
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(tmp, path)?;
            Ok(())
        })
        .await;

        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::warn!("failed to persist dependency index: {err:#}"),
            Err(err) => log::warn!("failed to persist dependency index: {err:#}"),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DependencyKey, Entry>> {
        self.entries.lock().expect("dependency cache lock poisoned")
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(quota: u64) -> (tempfile::TempDir, DependencyCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DependencyCache::open(dir.path(), quota).unwrap();
        (dir, cache)
    }

    async fn store_ready(cache: &DependencyCache, key: &DependencyKey, contents: &[u8]) -> PathBuf {
        match cache.acquire(key, "seed-run") {
            Acquired::MustDownload { path } => {
                std::fs::write(&path, contents).unwrap();
                cache.finish_download(key, Ok(())).await;
                cache.release(key, "seed-run");
                path
            }
            _ => panic!("expected MustDownload for fresh key"),
        }
    }

    #[tokio::test]
    async fn single_flight_under_concurrent_acquire() {
        let (_dir, cache) = cache(1 << 20);
        let key = DependencyKey::new("0xp", "data");

        let mut downloads = 0;
        let mut waiters = Vec::new();
        for run in ["r1", "r2", "r3"] {
            match cache.acquire(&key, run) {
                Acquired::MustDownload { path } => {
                    downloads += 1;
                    std::fs::write(&path, b"payload").unwrap();
                }
                Acquired::Wait { done, .. } => waiters.push(done),
                Acquired::Ready { .. } => panic!("entry cannot be ready yet"),
            }
        }
        assert_eq!(downloads, 1);
        assert_eq!(waiters.len(), 2);

        cache.finish_download(&key, Ok(())).await;
        for mut done in waiters {
            let status = done.borrow_and_update().clone();
            assert!(matches!(status, DownloadStatus::Ready), "waiter saw {status:?}");
        }

        // All three runs hold references; entry reports ready.
        assert_eq!(cache.ready_deps().len(), 1);
    }

    #[tokio::test]
    async fn refcount_pins_entries_against_eviction() {
        // Quota of one byte keeps the store permanently over quota.
        let (_dir, cache) = cache(1);
        let key = DependencyKey::new("0xp", "data");
        store_ready(&cache, &key, b"xxxx").await;

        assert!(matches!(cache.acquire(&key, "a"), Acquired::Ready { .. }));
        assert!(matches!(cache.acquire(&key, "b"), Acquired::Ready { .. }));
        cache.release(&key, "a");
        // Releasing a run that never acquired is a no-op.
        cache.release(&key, "never-there");

        // Entry still pinned by "b": eviction must not touch it.
        cache.cleanup_step().await;
        assert_eq!(cache.ready_deps().len(), 1);

        // Last reference dropped: the next pass reclaims it.
        cache.release(&key, "b");
        cache.cleanup_step().await;
        assert!(cache.ready_deps().is_empty());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[tokio::test]
    async fn eviction_respects_quota_and_pins() {
        let (_dir, cache) = cache(100);
        let key_a = DependencyKey::new("0xa", "");
        let key_b = DependencyKey::new("0xb", "");

        store_ready(&cache, &key_a, &[0u8; 60]).await;
        // Age A so it sorts older than B.
        {
            let mut entries = cache.lock();
            entries.get_mut(&key_a).unwrap().last_used -= 10;
        }
        let path_b = store_ready(&cache, &key_b, &[0u8; 50]).await;

        assert_eq!(cache.total_bytes(), 110);
        cache.cleanup_step().await;

        // Oldest unpinned entry (A) evicted; total back under quota.
        assert_eq!(cache.total_bytes(), 50);
        assert!(path_b.exists());
        let remaining = cache.ready_deps();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].parent_uuid, "0xb");

        // Re-acquiring A requires a fresh download.
        assert!(matches!(
            cache.acquire(&key_a, "r"),
            Acquired::MustDownload { .. }
        ));
    }

    #[tokio::test]
    async fn failed_download_propagates_to_waiters_and_removes_entry() {
        let (_dir, cache) = cache(1 << 20);
        let key = DependencyKey::new("0xp", "data");

        let path = match cache.acquire(&key, "r1") {
            Acquired::MustDownload { path } => path,
            _ => panic!("expected MustDownload"),
        };
        std::fs::write(&path, b"partial").unwrap();

        let mut done = match cache.acquire(&key, "r2") {
            Acquired::Wait { done, .. } => done,
            _ => panic!("expected Wait"),
        };

        cache
            .finish_download(&key, Err("Dependency download failed".to_string()))
            .await;

        let status = done.borrow_and_update().clone();
        match status {
            DownloadStatus::Failed(message) => {
                assert_eq!(message, "Dependency download failed")
            }
            other => panic!("waiter saw {other:?}"),
        }
        assert!(!path.exists(), "partial payload must be removed");
        assert!(matches!(
            cache.acquire(&key, "r3"),
            Acquired::MustDownload { .. }
        ));
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = DependencyKey::new("0xp", "a/b");
        {
            let cache = DependencyCache::open(dir.path(), 1 << 20).unwrap();
            store_ready(&cache, &key, b"payload").await;
        }

        let cache = DependencyCache::open(dir.path(), 1 << 20).unwrap();
        let ready = cache.ready_deps();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].parent_uuid, "0xp");
        assert_eq!(ready[0].parent_path, "a/b");
        assert_eq!(cache.total_bytes(), 7);
        assert!(matches!(cache.acquire(&key, "r"), Acquired::Ready { .. }));
    }

    #[test]
    fn filenames_round_trip_keys() {
        let keys = [
            DependencyKey::new("0xp", ""),
            DependencyKey::new("0xp", "a/b_c"),
            DependencyKey::new("0x_p%", "d%2f/e"),
        ];
        for key in keys {
            let name = key.filename();
            assert!(!name.contains('/'), "separator leaked into {name:?}");
            assert_eq!(DependencyKey::from_filename(&name), Some(key));
        }

        assert_eq!(DependencyKey::from_filename("no-separator"), None);
        assert_eq!(DependencyKey::from_filename("0xp_%zz"), None);
    }

    #[tokio::test]
    async fn rescan_recovers_payloads_when_index_is_lost() {
        let dir = tempfile::tempdir().unwrap();
        let key_a = DependencyKey::new("0xp", "a/b");
        let key_b = DependencyKey::new("0xq", "");
        {
            let cache = DependencyCache::open(dir.path(), 1 << 20).unwrap();
            store_ready(&cache, &key_a, b"payload-a").await;
            store_ready(&cache, &key_b, b"payload-bb").await;
        }
        // A crashed download's leftovers and a vanished index.
        std::fs::write(
            dir.path().join("dependencies/junk.partial.tar.gz"),
            b"junk",
        )
        .unwrap();
        std::fs::remove_file(dir.path().join("dependencies.json")).unwrap();

        let cache = DependencyCache::open(dir.path(), 1 << 20).unwrap();
        let ready = cache.ready_deps();
        assert_eq!(ready.len(), 2, "payloads lost with the index: {ready:?}");
        assert_eq!(cache.total_bytes(), 9 + 10);
        assert!(matches!(cache.acquire(&key_a, "r"), Acquired::Ready { .. }));
        assert!(matches!(cache.acquire(&key_b, "r"), Acquired::Ready { .. }));
        assert!(!dir.path().join("dependencies/junk.partial.tar.gz").exists());
    }

    #[tokio::test]
    async fn rescan_survives_corrupt_index() {
        let dir = tempfile::tempdir().unwrap();
        let key = DependencyKey::new("0xp", "data");
        {
            let cache = DependencyCache::open(dir.path(), 1 << 20).unwrap();
            store_ready(&cache, &key, b"payload").await;
        }
        std::fs::write(dir.path().join("dependencies.json"), b"{not json").unwrap();

        let cache = DependencyCache::open(dir.path(), 1 << 20).unwrap();
        assert_eq!(cache.ready_deps().len(), 1);
        assert_eq!(cache.total_bytes(), 7);
        assert!(matches!(cache.acquire(&key, "r"), Acquired::Ready { .. }));
    }
}
