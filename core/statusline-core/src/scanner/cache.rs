//! Process-local memo of scan results, keyed by session.
//!
//! Never a substitute for persisted scanner state: it only spares a process
//! that scans the same session twice from re-deriving the result.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use super::ScanResult;

pub struct ResultCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Instant, ScanResult)>>,
}

impl ResultCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Entry for `session_id` if it was inserted less than `ttl` ago.
    pub fn get(&self, session_id: &str) -> Option<ScanResult> {
        // Poisoning only means another scan panicked mid-insert; the map is still usable.
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(session_id)
            .filter(|(inserted, _)| inserted.elapsed() < self.ttl)
            .map(|(_, result)| result.clone())
    }

    pub fn set(&self, session_id: &str, result: ScanResult) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, (inserted, _)| inserted.elapsed() < self.ttl);
        entries.insert(session_id.to_string(), (Instant::now(), result));
    }

    pub fn invalidate(&self, session_id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_inserted_result() {
        let cache = ResultCache::new(Duration::from_secs(10));
        assert!(cache.get("s1").is_none());

        let mut result = ScanResult::default();
        result.health.lines_seen = 3;
        cache.set("s1", result.clone());
        assert_eq!(cache.get("s1"), Some(result));
        assert!(cache.get("s2").is_none());
    }

    #[test]
    fn test_entries_expire_after_ttl() {
        let cache = ResultCache::new(Duration::ZERO);
        cache.set("s1", ScanResult::default());
        assert!(cache.get("s1").is_none());
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let cache = ResultCache::new(Duration::from_secs(10));
        cache.set("s1", ScanResult::default());
        cache.invalidate("s1");
        assert!(cache.get("s1").is_none());
    }
}
