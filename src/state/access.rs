//! Last-access timestamps per commit hash or container name

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// In-memory record of when each key was last used
///
/// A touch always overwrites; records live until the process exits.
#[derive(Debug, Default)]
pub struct AccessTracker {
    times: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl AccessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an access now
    pub fn touch(&self, key: &str) {
        self.touch_at(key, Utc::now());
    }

    /// Record an access at a given time
    pub fn touch_at(&self, key: &str, at: DateTime<Utc>) {
        let mut times = self.times.write().unwrap_or_else(|e| e.into_inner());
        times.insert(key.to_string(), at);
    }

    /// When `key` was last accessed
    pub fn last_access(&self, key: &str) -> Option<DateTime<Utc>> {
        let times = self.times.read().unwrap_or_else(|e| e.into_inner());
        times.get(key).copied()
    }

    /// All records, sorted by key
    pub fn snapshot(&self) -> BTreeMap<String, DateTime<Utc>> {
        let times = self.times.read().unwrap_or_else(|e| e.into_inner());
        times.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}
