//! Run-report counters (queries issued, failures, invalid identifiers...).
//!
//! Counters are a pass-through side effect for observability, never control
//! flow. The handle is cheap to clone and safe to share across tasks.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Clone, Default)]
pub struct Report {
    counters: Arc<RwLock<BTreeMap<String, u64>>>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, counter: &str, value: u64) {
        self.counters.write().insert(counter.to_owned(), value);
    }

    pub fn inc(&self, counter: &str) {
        *self.counters.write().entry(counter.to_owned()).or_insert(0) += 1;
    }

    pub fn get(&self, counter: &str) -> u64 {
        self.counters.read().get(counter).copied().unwrap_or(0)
    }

    /// Snapshot of all counters, for the end-of-run report.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.read().clone()
    }
}

impl std::fmt::Debug for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.counters.read().iter()).finish()
    }
}
