//! Durable record of submitted jobs, kept in the shared key-value store so
//! tracking can resume after a reload.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use cortex_core::defaults::LEDGER_KEY_PREFIX;
use cortex_core::{JobId, KeyValueStore, LedgerEntry, Result};

/// Ledger of in-flight jobs, one store key per job.
#[derive(Clone)]
pub struct JobLedger {
    store: Arc<dyn KeyValueStore>,
}

impl JobLedger {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(job_id: &JobId) -> String {
        format!("{LEDGER_KEY_PREFIX}{job_id}")
    }

    /// Insert or replace the entry for `entry.job_id`.
    pub fn put(&self, entry: &LedgerEntry) -> Result<()> {
        let value = serde_json::to_string(entry)?;
        self.store.set(&Self::key(&entry.job_id), &value)
    }

    pub fn get(&self, job_id: &JobId) -> Option<LedgerEntry> {
        let key = Self::key(job_id);
        self.store.get(&key).and_then(|raw| decode(&key, &raw))
    }

    /// Delete an entry. Returns whether one existed.
    pub fn remove(&self, job_id: &JobId) -> Result<bool> {
        self.store.remove(&Self::key(job_id))
    }

    /// Every readable entry, oldest first.
    pub fn list_all(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self
            .store
            .keys_with_prefix(LEDGER_KEY_PREFIX)
            .into_iter()
            .filter_map(|key| {
                let raw = self.store.get(&key)?;
                decode(&key, &raw)
            })
            .collect();
        entries.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        entries
    }

    /// Entries owned by `user`, oldest first.
    pub fn list_by_user(&self, user: &str) -> Vec<LedgerEntry> {
        self.list_all()
            .into_iter()
            .filter(|e| e.owning_user == user)
            .collect()
    }

    /// The most recent entry for a user's target, if any.
    pub fn find_by_target(&self, user: &str, target: &str) -> Option<LedgerEntry> {
        self.list_by_user(user)
            .into_iter()
            .filter(|e| e.target == target)
            .last()
    }

    /// Remove entries submitted longer than `max_age` before `now`.
    /// Returns the removed entries.
    pub fn prune_expired(&self, max_age: Duration, now: DateTime<Utc>) -> Result<Vec<LedgerEntry>> {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Ok(Vec::new());
        };
        let mut pruned = Vec::new();
        for entry in self.list_all() {
            if now.signed_duration_since(entry.submitted_at) > max_age {
                self.remove(&entry.job_id)?;
                debug!(job_id = %entry.job_id, target = %entry.target, "Pruned expired ledger entry");
                pruned.push(entry);
            }
        }
        Ok(pruned)
    }
}

fn decode(key: &str, raw: &str) -> Option<LedgerEntry> {
    match serde_json::from_str(raw) {
        Ok(entry) => Some(entry),
        Err(e) => {
            debug!(key, error = %e, "Ignoring unreadable ledger entry");
            None
        }
    }
}
