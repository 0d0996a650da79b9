use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::job::{ExecPrefs, JobDescriptor};

/// Key of the job collection record.
pub const JOBS_KEY: &str = "jobs";
/// Key of the execution preferences record.
pub const EXEC_PREFS_KEY: &str = "exec_prefs";

/// Minimal key/value interface over string keys and byte values.
pub trait Kv: Clone + Send + Sync + 'static {
    /// Get value bytes for `key`, if present.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    /// Set value bytes for `key`, overwriting if it exists.
    fn put(&self, key: &str, val: &[u8]) -> Result<()>;
    /// Delete `key`; returns `true` if a value existed.
    fn delete(&self, key: &str) -> Result<bool>;
}

/// JSON helpers layered on top of any [`Kv`] implementation.
pub trait KvSerde: Kv {
    /// Deserialize type `T` stored at `key`.
    fn get_t<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => {
                let v = serde_json::from_slice::<T>(&bytes)
                    .with_context(|| format!("decode record {key}"))?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }
    /// Serialize `val` as pretty JSON and store at `key`.
    fn put_t<T: Serialize>(&self, key: &str, val: &T) -> Result<()> {
        let buf = serde_json::to_vec_pretty(val).with_context(|| format!("encode record {key}"))?;
        self.put(key, &buf)
    }
}
impl<T: Kv> KvSerde for T {}

/// Filesystem-backed store: one `<key>.json` file per record.
#[derive(Clone)]
pub struct FsKv {
    root: PathBuf,
}

/// Open an FS-backed KV rooted at `dir` (created if missing).
pub fn open_default<P: AsRef<Path>>(dir: P) -> Result<FsKv> {
    let root = dir.as_ref().to_path_buf();
    fs::create_dir_all(&root)
        .with_context(|| format!("create data dir {}", root.display()))?;
    Ok(FsKv { root })
}

impl FsKv {
    /// Directory holding the record files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keep readable names; escape anything that is not portable.
        let mut name = String::with_capacity(key.len() + 5);
        for b in key.bytes() {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
                name.push(b as char);
            } else {
                name.push_str(&format!("%{b:02x}"));
            }
        }
        name.push_str(".json");
        self.root.join(name)
    }
}

impl Kv for FsKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(buf) => Ok(Some(buf)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    fn put(&self, key: &str, val: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        // Write a sibling temp file, then rename over the record.
        let tmp = path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        f.write_all(val).with_context(|| format!("write {}", tmp.display()))?;
        f.sync_all().with_context(|| format!("sync {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("rename onto {}", path.display()))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }
}

/// In-memory store for tests and throwaway hosts.
#[derive(Clone, Default)]
pub struct MemKv {
    map: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl Kv for MemKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn put(&self, key: &str, val: &[u8]) -> Result<()> {
        self.map.lock().insert(key.to_string(), val.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.map.lock().remove(key).is_some())
    }
}

/// Ordered job collection plus execution preferences over a [`Kv`].
#[derive(Clone)]
pub struct JobStore<K: Kv> {
    kv: K,
}

fn persistence(e: anyhow::Error) -> CoreError {
    CoreError::PersistenceFailure(format!("{e:#}"))
}

impl<K: Kv> JobStore<K> {
    /// Wrap a KV backend.
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    /// Underlying backend.
    pub fn kv(&self) -> &K {
        &self.kv
    }

    /// All jobs in insertion order.
    pub fn list(&self) -> CoreResult<Vec<JobDescriptor>> {
        Ok(self.kv.get_t::<Vec<JobDescriptor>>(JOBS_KEY).map_err(persistence)?.unwrap_or_default())
    }

    /// Job with the given id.
    pub fn get(&self, id: &str) -> CoreResult<Option<JobDescriptor>> {
        Ok(self.list()?.into_iter().find(|j| j.id == id))
    }

    /// Replace the job with the same id in place, or append it.
    pub fn upsert(&self, job: &JobDescriptor) -> CoreResult<()> {
        let mut jobs = self.list()?;
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(slot) => *slot = job.clone(),
            None => jobs.push(job.clone()),
        }
        self.kv.put_t(JOBS_KEY, &jobs).map_err(persistence)
    }

    /// Drop the job; returns `false` if it was not stored.
    pub fn remove(&self, id: &str) -> CoreResult<bool> {
        let mut jobs = self.list()?;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        if jobs.len() == before {
            return Ok(false);
        }
        self.kv.put_t(JOBS_KEY, &jobs).map_err(persistence)?;
        Ok(true)
    }

    /// Stored preferences, or defaults.
    pub fn exec_prefs(&self) -> CoreResult<ExecPrefs> {
        Ok(self.kv.get_t::<ExecPrefs>(EXEC_PREFS_KEY).map_err(persistence)?.unwrap_or_default())
    }

    /// Persist preferences.
    pub fn save_exec_prefs(&self, prefs: &ExecPrefs) -> CoreResult<()> {
        self.kv.put_t(EXEC_PREFS_KEY, prefs).map_err(persistence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobTarget, PreferredShell};

    fn job(id: &str, name: &str) -> JobDescriptor {
        let mut j = JobDescriptor::new(name, JobTarget::InlineCommand { command: "echo hi".into() });
        j.id = id.to_string();
        j
    }

    #[test]
    fn fs_round_trip_keeps_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(open_default(dir.path()).unwrap());

        let mut a = job("a", "first").with_schedule("*/5 * * * *");
        a.auto_start = true;
        let mut b = JobDescriptor::new("second", JobTarget::FileScript { path: "/tmp/build.sh".into() });
        b.enabled = false;
        store.upsert(&a).unwrap();
        store.upsert(&b).unwrap();

        let reopened = JobStore::new(open_default(dir.path()).unwrap());
        assert_eq!(reopened.list().unwrap(), vec![a, b]);
        assert!(dir.path().join("jobs.json").exists());
    }

    #[test]
    fn upsert_replaces_in_place() {
        let store = JobStore::new(MemKv::default());
        store.upsert(&job("a", "one")).unwrap();
        store.upsert(&job("b", "two")).unwrap();
        store.upsert(&job("a", "uno")).unwrap();

        let names: Vec<_> = store.list().unwrap().into_iter().map(|j| j.name).collect();
        assert_eq!(names, ["uno", "two"]);
    }

    #[test]
    fn remove_reports_absence() {
        let store = JobStore::new(MemKv::default());
        store.upsert(&job("a", "one")).unwrap();
        assert!(store.remove("a").unwrap());
        assert!(!store.remove("a").unwrap());
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn prefs_default_until_saved() {
        let store = JobStore::new(MemKv::default());
        assert_eq!(store.exec_prefs().unwrap(), ExecPrefs::default());

        let prefs = ExecPrefs { preferred_shell: PreferredShell::Bash, custom_shell_path: None, load_shell_config: false };
        store.save_exec_prefs(&prefs).unwrap();
        assert_eq!(store.exec_prefs().unwrap(), prefs);
    }

    #[test]
    fn corrupt_record_is_a_persistence_failure() {
        let kv = MemKv::default();
        kv.put(JOBS_KEY, b"not json").unwrap();
        let err = JobStore::new(kv).list().unwrap_err();
        assert!(matches!(err, CoreError::PersistenceFailure(_)));
    }

    #[test]
    fn odd_keys_map_to_safe_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_default(dir.path()).unwrap();
        kv.put("a/b c", b"1").unwrap();
        assert!(dir.path().join("a%2fb%20c.json").exists());
        assert_eq!(kv.get("a/b c").unwrap().as_deref(), Some(&b"1"[..]));
        assert!(kv.delete("a/b c").unwrap());
        assert!(!kv.delete("a/b c").unwrap());
    }
}
