//! The shared cache of global (tier-3) source values.
//!
//! # File Format (v2)
//!
//! ```json
//! {
//!   "version": 2,
//!   "updatedAt": 1735689600000,
//!   "sources": {
//!     "billing": { "data": {...}, "fetchedAt": 1735689600000, "fetchedBy": 4242 }
//!   }
//! }
//! ```
//!
//! Readers never lock: every write is a same-directory temp file + rename, so
//! a read sees one complete version or another. Deciding *who* refreshes an
//! entry is the single-flight lock's job, not this module's.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StatuslineError};
use crate::storage::{atomic_write, StorageConfig};

pub const GLOBAL_CACHE_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheFile {
    pub version: u32,
    pub updated_at: i64,
    #[serde(default)]
    pub sources: BTreeMap<String, CacheEntry>,
}

impl Default for CacheFile {
    fn default() -> Self {
        Self {
            version: GLOBAL_CACHE_VERSION,
            updated_at: 0,
            sources: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub data: Value,
    /// Epoch ms.
    pub fetched_at: i64,
    pub fetched_by: u32,
}

#[derive(Debug, Clone)]
pub struct GlobalDataCache {
    path: PathBuf,
}

impl GlobalDataCache {
    pub fn new(storage: &StorageConfig) -> Self {
        Self {
            path: storage.global_cache_file(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current on-disk contents. Missing, empty, corrupt and foreign-version
    /// files all read as an empty cache.
    pub fn read(&self) -> CacheFile {
        let content = match fs_err::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheFile::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read global cache");
                return CacheFile::default();
            }
        };
        if content.trim().is_empty() {
            return CacheFile::default();
        }
        match serde_json::from_str::<CacheFile>(&content) {
            Ok(file) if file.version == GLOBAL_CACHE_VERSION => file,
            Ok(file) => {
                tracing::warn!(
                    version = file.version,
                    expected = GLOBAL_CACHE_VERSION,
                    "Ignoring global cache with unsupported version"
                );
                CacheFile::default()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Corrupt global cache; treating as empty");
                CacheFile::default()
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<CacheEntry> {
        self.read().sources.remove(id)
    }

    /// Publishes `entries`, keeping every other source as currently on disk.
    ///
    /// Callers must hold the single-flight lock for each id they write.
    pub fn write_entries(&self, entries: Vec<(String, Value)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        // Re-read so entries published by sibling holders since our first read survive.
        let mut file = self.read();
        let now = crate::now_ms();
        let pid = std::process::id();
        for (id, data) in entries {
            file.sources.insert(
                id,
                CacheEntry {
                    data,
                    fetched_at: now,
                    fetched_by: pid,
                },
            );
        }
        file.version = GLOBAL_CACHE_VERSION;
        file.updated_at = now;

        let content = serde_json::to_vec_pretty(&file)
            .map_err(|e| StatuslineError::json("serialize global cache", e))?;
        atomic_write(&self.path, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn cache(root: &Path) -> GlobalDataCache {
        GlobalDataCache::new(&StorageConfig::with_root(root.to_path_buf()))
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let temp = tempdir().unwrap();
        let file = cache(temp.path()).read();
        assert_eq!(file.version, GLOBAL_CACHE_VERSION);
        assert!(file.sources.is_empty());
    }

    #[test]
    fn test_write_then_get_stamps_entry() {
        let temp = tempdir().unwrap();
        let c = cache(temp.path());
        c.write_entries(vec![("billing".to_string(), json!({"cost": 1.5}))])
            .unwrap();

        let entry = c.get("billing").unwrap();
        assert_eq!(entry.data, json!({"cost": 1.5}));
        assert_eq!(entry.fetched_by, std::process::id());
        assert!(entry.fetched_at > 0);

        let raw = fs_err::read_to_string(c.path()).unwrap();
        assert!(raw.contains("\"fetchedAt\""));
        assert!(raw.contains("\"updatedAt\""));
    }

    #[test]
    fn test_write_keeps_entries_from_siblings() {
        let temp = tempdir().unwrap();
        let mine = cache(temp.path());
        let sibling = cache(temp.path());

        let _snapshot = mine.read();
        sibling
            .write_entries(vec![("quota".to_string(), json!({"left": 3}))])
            .unwrap();
        mine.write_entries(vec![("billing".to_string(), json!({"cost": 2}))])
            .unwrap();

        let file = mine.read();
        assert!(file.sources.contains_key("quota"));
        assert!(file.sources.contains_key("billing"));
    }

    #[test]
    fn test_corrupt_or_foreign_version_reads_empty() {
        let temp = tempdir().unwrap();
        let c = cache(temp.path());
        fs_err::write(c.path(), "{{{").unwrap();
        assert!(c.read().sources.is_empty());

        fs_err::write(
            c.path(),
            r#"{"version":1,"updatedAt":1,"sources":{"billing":{"data":1,"fetchedAt":1,"fetchedBy":1}}}"#,
        )
        .unwrap();
        assert!(c.get("billing").is_none());
    }
}
