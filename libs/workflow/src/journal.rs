//! Step journal used for replay.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::JournalError;

/// One completed step of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Position of the step within the workflow.
    pub seq: u64,

    /// Step name: the operation name, `signal:{channel}` or
    /// `child:{workflow}`.
    pub step: String,

    /// Recorded result.
    pub payload: Value,
}

/// Durable record of completed workflow steps, keyed by workflow id.
pub trait Journal: Send + Sync {
    /// Load the entry at `seq`, if one was recorded.
    fn load(&self, workflow_id: &str, seq: u64) -> Result<Option<JournalEntry>, JournalError>;

    /// Record a completed step.
    fn record(&self, workflow_id: &str, entry: &JournalEntry) -> Result<(), JournalError>;

    /// Drop every entry for `workflow_id`.
    fn clear(&self, workflow_id: &str) -> Result<(), JournalError>;
}

/// In-memory journal. Replay survives re-submission but not restarts.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    entries: Mutex<HashMap<String, BTreeMap<u64, JournalEntry>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries recorded for `workflow_id`, in sequence order.
    pub fn entries(&self, workflow_id: &str) -> Vec<JournalEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl Journal for MemoryJournal {
    fn load(&self, workflow_id: &str, seq: u64) -> Result<Option<JournalEntry>, JournalError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .and_then(|steps| steps.get(&seq))
            .cloned())
    }

    fn record(&self, workflow_id: &str, entry: &JournalEntry) -> Result<(), JournalError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(workflow_id.to_string())
            .or_default()
            .insert(entry.seq, entry.clone());
        Ok(())
    }

    fn clear(&self, workflow_id: &str) -> Result<(), JournalError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(workflow_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(seq: u64, step: &str) -> JournalEntry {
        JournalEntry {
            seq,
            step: step.to_string(),
            payload: json!({ "seq": seq }),
        }
    }

    #[test]
    fn test_memory_journal_record_and_load() {
        let journal = MemoryJournal::new();
        journal.record("deploy:abc", &entry(1, "propose-ip")).unwrap();
        journal.record("deploy:abc", &entry(0, "get-power-params")).unwrap();

        let loaded = journal.load("deploy:abc", 1).unwrap().unwrap();
        assert_eq!(loaded.step, "propose-ip");
        assert!(journal.load("deploy:abc", 2).unwrap().is_none());
        assert!(journal.load("deploy:other", 1).unwrap().is_none());

        let steps: Vec<_> = journal
            .entries("deploy:abc")
            .into_iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(steps, vec![0, 1]);
    }

    #[test]
    fn test_memory_journal_clear() {
        let journal = MemoryJournal::new();
        journal.record("a", &entry(0, "x")).unwrap();
        journal.record("b", &entry(0, "y")).unwrap();

        journal.clear("a").unwrap();

        assert!(journal.entries("a").is_empty());
        assert_eq!(journal.entries("b").len(), 1);
    }
}
