use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

use crate::config::SyncConfig;
use crate::engine::StoreError;
use crate::wal::{StorageOp, Wal};

const MAX_PROFILE_NAME_LEN: usize = 128;

/// Profile-scoped key/value storage that survives a reload.
pub trait KvStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

fn used_bytes(entries: &DashMap<String, String>, replacing: &str) -> usize {
    entries
        .iter()
        .filter(|e| e.key() != replacing)
        .map(|e| e.key().len() + e.value().len())
        .sum()
}

fn check_quota(entries: &DashMap<String, String>, key: &str, value: &str, quota: usize) -> Result<(), StoreError> {
    let needed = used_bytes(entries, key) + key.len() + value.len();
    if needed > quota {
        return Err(StoreError::QuotaExceeded { needed, quota });
    }
    Ok(())
}

/// Keep only characters that are safe in a file name.
pub fn sanitize_profile(profile: &str) -> Result<String, StoreError> {
    if profile.len() > MAX_PROFILE_NAME_LEN {
        return Err(StoreError::Io("profile name too long".into()));
    }
    let safe: String = profile
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(StoreError::Io("empty profile name".into()));
    }
    Ok(safe)
}

// ── File-backed storage ──────────────────────────────────────────

/// One append-only log per profile, replayed into memory on open.
pub struct FileStorage {
    entries: DashMap<String, String>,
    wal: Mutex<Wal>,
    quota_bytes: usize,
    compact_threshold: u64,
}

impl FileStorage {
    pub fn open(
        data_dir: &Path,
        profile: &str,
        quota_bytes: usize,
        compact_threshold: u64,
    ) -> Result<Self, StoreError> {
        let safe_name = sanitize_profile(profile)?;
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(format!("{safe_name}.kv"));

        let entries = DashMap::new();
        for op in Wal::replay(&path)? {
            match op {
                StorageOp::Set { key, value } => {
                    entries.insert(key, value);
                }
                StorageOp::Remove { key } => {
                    entries.remove(&key);
                }
            }
        }
        let wal = Wal::open(&path)?;
        tracing::debug!("opened profile storage {} ({} keys)", path.display(), entries.len());

        Ok(Self {
            entries,
            wal: Mutex::new(wal),
            quota_bytes,
            compact_threshold,
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, StoreError> {
        Self::open(
            &config.data_dir,
            &config.profile,
            config.quota_bytes,
            config.compact_threshold,
        )
    }

    pub fn path(&self) -> Result<PathBuf, StoreError> {
        let wal = self.wal.lock().map_err(|_| StoreError::Io("storage lock poisoned".into()))?;
        Ok(wal.path().to_path_buf())
    }

    fn write(&self, op: StorageOp) -> Result<(), StoreError> {
        let mut wal = self.wal.lock().map_err(|_| StoreError::Io("storage lock poisoned".into()))?;
        wal.append(&op)?;
        match op {
            StorageOp::Set { key, value } => {
                self.entries.insert(key, value);
            }
            StorageOp::Remove { key } => {
                self.entries.remove(&key);
            }
        }

        if wal.appends_since_compact() >= self.compact_threshold {
            let live: Vec<StorageOp> = self
                .entries
                .iter()
                .map(|e| StorageOp::Set {
                    key: e.key().clone(),
                    value: e.value().clone(),
                })
                .collect();
            // Entries are already durable in the uncompacted log.
            if let Err(e) = wal.compact(&live) {
                tracing::warn!("storage compaction failed: {e}");
            }
        }
        Ok(())
    }
}

impl KvStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        check_quota(&self.entries, key, value, self.quota_bytes)?;
        self.write(StorageOp::Set {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        if !self.entries.contains_key(key) {
            return Ok(());
        }
        self.write(StorageOp::Remove { key: key.to_string() })
    }
}

// ── In-memory storage ────────────────────────────────────────────

/// Process-local storage. Can emulate a profile with storage turned off.
pub struct MemoryStorage {
    entries: DashMap<String, String>,
    disabled: AtomicBool,
    quota_bytes: usize,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_quota(usize::MAX)
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: DashMap::new(),
            disabled: AtomicBool::new(false),
            quota_bytes,
        }
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    fn ensure_enabled(&self) -> Result<(), StoreError> {
        if self.disabled.load(Ordering::SeqCst) {
            Err(StoreError::Disabled)
        } else {
            Ok(())
        }
    }
}

impl KvStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_enabled()?;
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_enabled()?;
        check_quota(&self.entries, key, value, self.quota_bytes)?;
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_enabled()?;
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("holdsync_test_storage")
            .join(format!("{name}_{}", Ulid::new()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = test_data_dir("reopen");
        {
            let s = FileStorage::open(&dir, "guest", 1 << 20, 1000).unwrap();
            s.set("a", "1").unwrap();
            s.set("b", "2").unwrap();
            s.set("a", "3").unwrap();
            s.remove("b").unwrap();
        }
        let s = FileStorage::open(&dir, "guest", 1 << 20, 1000).unwrap();
        assert_eq!(s.get("a").unwrap().as_deref(), Some("3"));
        assert_eq!(s.get("b").unwrap(), None);
    }

    #[test]
    fn profiles_are_isolated() {
        let dir = test_data_dir("profiles");
        let a = FileStorage::open(&dir, "alice", 1 << 20, 1000).unwrap();
        let b = FileStorage::open(&dir, "bob", 1 << 20, 1000).unwrap();
        a.set("k", "alice").unwrap();
        assert_eq!(b.get("k").unwrap(), None);
    }

    #[test]
    fn profile_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let s = FileStorage::open(&dir, "../evil", 1 << 20, 1000).unwrap();
        assert_eq!(s.path().unwrap(), dir.join("evil.kv"));
        assert!(FileStorage::open(&dir, "../..", 1 << 20, 1000).is_err());
        assert!(sanitize_profile(&"x".repeat(MAX_PROFILE_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn quota_rejects_oversized_write() {
        let dir = test_data_dir("quota");
        let s = FileStorage::open(&dir, "guest", 16, 1000).unwrap();
        s.set("k", "0123456789").unwrap();
        let err = s.set("k2", "0123456789").unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded { .. }));
        // replacing an existing key only counts the new value
        s.set("k", "abcdefghij").unwrap();
        assert_eq!(s.get("k").unwrap().as_deref(), Some("abcdefghij"));
    }

    #[test]
    fn compaction_keeps_live_entries() {
        let dir = test_data_dir("compact");
        {
            let s = FileStorage::open(&dir, "guest", 1 << 20, 5).unwrap();
            for i in 0..12 {
                s.set("k", &i.to_string()).unwrap();
            }
            s.set("other", "x").unwrap();
        }
        let ops = Wal::replay(&dir.join("guest.kv")).unwrap();
        assert!(ops.len() < 13, "log should have been compacted, got {} ops", ops.len());

        let s = FileStorage::open(&dir, "guest", 1 << 20, 5).unwrap();
        assert_eq!(s.get("k").unwrap().as_deref(), Some("11"));
        assert_eq!(s.get("other").unwrap().as_deref(), Some("x"));
    }

    #[test]
    fn memory_storage_can_be_disabled() {
        let s = MemoryStorage::new();
        s.set("k", "v").unwrap();
        s.set_disabled(true);
        assert_eq!(s.get("k"), Err(StoreError::Disabled));
        assert_eq!(s.set("k", "w"), Err(StoreError::Disabled));
        s.set_disabled(false);
        assert_eq!(s.get("k").unwrap().as_deref(), Some("v"));
    }
}
