use crate::identity::Identity;
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persisted per-identity metadata.
///
/// The record file may legitimately not exist (job never ran); that is
/// distinct from an empty record with both fields cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Timestamp (ms since epoch) of the most recent successful run; absent
    /// if no success has ever been recorded.
    pub last_success_ms: Option<u64>,
    /// Present only while a run is in flight.
    pub lock: Option<LockEntry>,
}

/// Lock ownership, written at acquisition and cleared at release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    /// Holder process id.
    pub pid: u32,
    /// Run start timestamp (ms since epoch).
    pub started_ms: u64,
    /// The wall-clock ceiling the holder declared for itself (ms); `None`
    /// means unbounded.
    pub timeout_ms: Option<u64>,
}

impl StateRecord {
    /// Record a success, keeping `last_success_ms` monotonically
    /// non-decreasing.
    pub fn mark_success(&mut self, now_ms: u64) {
        self.last_success_ms = Some(self.last_success_ms.unwrap_or(0).max(now_ms));
    }
}

/// Store of per-identity [`StateRecord`]s under a single state directory.
///
/// Every mutation goes through [`StateStore::lock`]: an exclusive advisory
/// flock on a per-identity guard file serializes the read-modify-write
/// against concurrent invocations of the same identity.
pub struct StateStore {
    root: PathBuf,
    readable: bool,
}

impl StateStore {
    /// Open a store rooted at `root` (created if missing). With `readable`
    /// set, writes use a human-readable JSON encoding instead of the opaque
    /// one; reads accept either.
    pub fn open(root: &Path, readable: bool) -> Result<StateStore> {
        fs::create_dir_all(root)
            .with_context(|| format!("create state dir {}", root.display()))?;
        Ok(StateStore { root: root.to_path_buf(), readable })
    }

    fn record_path(&self, id: &Identity) -> PathBuf {
        self.root.join(format!("{}.state", id.as_str()))
    }

    fn guard_path(&self, id: &Identity) -> PathBuf {
        self.root.join(format!("{}.guard", id.as_str()))
    }

    /// Take the identity's exclusive lock, blocking until it is free.
    ///
    /// The critical sections behind this are short (read, decide, write);
    /// the long-lived "a run is in flight" lock is the persisted
    /// [`LockEntry`], not this flock.
    pub fn lock(&self, id: &Identity) -> Result<StoreGuard<'_>> {
        let path = self.guard_path(id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open guard file {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("flock {}", path.display()))?;
        Ok(StoreGuard { store: self, record: self.record_path(id), _guard: file })
    }
}

/// Exclusive access to one identity's record; the flock is released when the
/// guard is dropped.
pub struct StoreGuard<'a> {
    store: &'a StateStore,
    record: PathBuf,
    _guard: File,
}

impl StoreGuard<'_> {
    /// Read the record. A missing file is `Ok(None)`, never an error.
    pub fn read(&self) -> Result<Option<StateRecord>> {
        let bytes = match fs::read(&self.record) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("read {}", self.record.display()))
            }
        };
        decode(&bytes)
            .with_context(|| format!("decode {}", self.record.display()))
            .map(Some)
    }

    /// Durably replace the record: write to a temp file, fsync, rename.
    pub fn write(&self, record: &StateRecord) -> Result<()> {
        let bytes = if self.store.readable {
            let mut v = serde_json::to_vec_pretty(record).context("encode record as json")?;
            v.push(b'\n');
            v
        } else {
            bincode::serialize(record).context("encode record")?
        };
        let tmp = self.record.with_extension("tmp");
        let mut f = File::create(&tmp)
            .with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(&bytes)
            .and_then(|()| f.sync_all())
            .with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &self.record)
            .with_context(|| format!("rename into {}", self.record.display()))?;
        Ok(())
    }
}

// Records written with `-r` start with '{'; opaque ones never do (the first
// byte of a bincode Option tag is 0 or 1).
fn decode(bytes: &[u8]) -> Result<StateRecord> {
    if bytes.first() == Some(&b'{') {
        serde_json::from_slice(bytes).context("json decode")
    } else {
        bincode::deserialize(bytes).context("bincode decode")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> Identity {
        Identity::of_command(&["echo".to_string(), "hi".to_string()])
    }

    #[test]
    fn absent_record_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path(), false).unwrap();
        let guard = store.lock(&id()).unwrap();
        assert_eq!(guard.read().unwrap(), None);
    }

    #[test]
    fn roundtrip_opaque() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path(), false).unwrap();
        let rec = StateRecord {
            last_success_ms: Some(1234),
            lock: Some(LockEntry { pid: 42, started_ms: 1000, timeout_ms: Some(5000) }),
        };
        let guard = store.lock(&id()).unwrap();
        guard.write(&rec).unwrap();
        assert_eq!(guard.read().unwrap(), Some(rec));
    }

    #[test]
    fn readable_and_opaque_interoperate() {
        let dir = tempfile::tempdir().unwrap();
        let rec = StateRecord { last_success_ms: Some(77), lock: None };

        let readable = StateStore::open(dir.path(), true).unwrap();
        readable.lock(&id()).unwrap().write(&rec).unwrap();

        // On-disk form is legible JSON.
        let raw = fs::read(dir.path().join(format!("{}.state", id().as_str()))).unwrap();
        assert_eq!(raw.first(), Some(&b'{'));
        assert!(String::from_utf8(raw).unwrap().contains("last_success_ms"));

        // An opaque-mode store still reads it, and its rewrite is still read
        // back by the readable store.
        let opaque = StateStore::open(dir.path(), false).unwrap();
        assert_eq!(opaque.lock(&id()).unwrap().read().unwrap(), Some(rec.clone()));
        opaque.lock(&id()).unwrap().write(&rec).unwrap();
        assert_eq!(readable.lock(&id()).unwrap().read().unwrap(), Some(rec));
    }

    #[test]
    fn cleared_record_is_distinct_from_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path(), false).unwrap();
        let guard = store.lock(&id()).unwrap();
        guard.write(&StateRecord::default()).unwrap();
        assert_eq!(guard.read().unwrap(), Some(StateRecord::default()));
    }

    #[test]
    fn mark_success_is_monotonic() {
        let mut rec = StateRecord { last_success_ms: Some(500), lock: None };
        rec.mark_success(400);
        assert_eq!(rec.last_success_ms, Some(500));
        rec.mark_success(600);
        assert_eq!(rec.last_success_ms, Some(600));
    }

    #[test]
    fn no_leftover_temp_file_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path(), false).unwrap();
        store.lock(&id()).unwrap().write(&StateRecord::default()).unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
