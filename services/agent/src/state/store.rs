//! SQLite-backed workflow journal.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fleetd_workflow::{Journal, JournalEntry, JournalError};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid state: {0}")]
    Invalid(String),
}

impl From<StateStoreError> for JournalError {
    fn from(e: StateStoreError) -> Self {
        match e {
            StateStoreError::Sqlite(e) => JournalError::Storage(e.to_string()),
            StateStoreError::Invalid(msg) => JournalError::Serialization(msg),
        }
    }
}

/// Journal stored in the `workflow_journal` table.
pub struct SqliteJournal {
    conn: Mutex<Connection>,
}

impl SqliteJournal {
    /// Open or create a journal database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let journal = Self {
            conn: Mutex::new(conn),
        };
        journal.init_schema()?;
        Ok(journal)
    }

    /// Open an in-memory journal (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let journal = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        journal.init_schema()?;
        Ok(journal)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_journal (
                workflow_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                step TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at INTEGER NOT NULL,
                PRIMARY KEY (workflow_id, seq)
            );
            "#,
        )?;

        debug!("Journal schema initialized");
        Ok(())
    }

    fn seq_param(seq: u64) -> Result<i64, StateStoreError> {
        i64::try_from(seq).map_err(|_| StateStoreError::Invalid(format!("sequence {seq} out of range")))
    }

    /// Workflow ids with recorded steps, i.e. executions that have not
    /// reached a terminal state.
    pub fn workflow_ids(&self) -> Result<Vec<String>, StateStoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT DISTINCT workflow_id FROM workflow_journal ORDER BY workflow_id")?;

        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn load_entry(&self, workflow_id: &str, seq: u64) -> Result<Option<JournalEntry>, StateStoreError> {
        let row: Option<(String, String)> = self
            .conn()
            .query_row(
                "SELECT step, payload FROM workflow_journal WHERE workflow_id = ?1 AND seq = ?2",
                params![workflow_id, Self::seq_param(seq)?],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(step, payload)| {
            let payload = serde_json::from_str(&payload)
                .map_err(|e| StateStoreError::Invalid(format!("{workflow_id}#{seq}: {e}")))?;
            Ok(JournalEntry { seq, step, payload })
        })
        .transpose()
    }

    fn record_entry(&self, workflow_id: &str, entry: &JournalEntry) -> Result<(), StateStoreError> {
        let payload = serde_json::to_string(&entry.payload)
            .map_err(|e| StateStoreError::Invalid(e.to_string()))?;
        let now = chrono::Utc::now().timestamp();

        self.conn().execute(
            r#"
            INSERT INTO workflow_journal (workflow_id, seq, step, payload, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(workflow_id, seq) DO UPDATE SET
                step = excluded.step,
                payload = excluded.payload,
                recorded_at = excluded.recorded_at
            "#,
            params![workflow_id, Self::seq_param(entry.seq)?, entry.step, payload, now],
        )?;
        Ok(())
    }
}

impl Journal for SqliteJournal {
    fn load(&self, workflow_id: &str, seq: u64) -> Result<Option<JournalEntry>, JournalError> {
        Ok(self.load_entry(workflow_id, seq)?)
    }

    fn record(&self, workflow_id: &str, entry: &JournalEntry) -> Result<(), JournalError> {
        Ok(self.record_entry(workflow_id, entry)?)
    }

    fn clear(&self, workflow_id: &str) -> Result<(), JournalError> {
        self.conn()
            .execute(
                "DELETE FROM workflow_journal WHERE workflow_id = ?1",
                params![workflow_id],
            )
            .map_err(StateStoreError::from)?;
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
            payload: json!({"seq": seq}),
        }
    }

    #[test]
    fn test_record_load_clear() {
        let journal = SqliteJournal::open_in_memory().unwrap();

        journal.record("deploy:m1", &entry(0, "get-power-params")).unwrap();
        journal.record("deploy:m1", &entry(1, "get-user-info")).unwrap();

        let loaded = journal.load("deploy:m1", 1).unwrap().unwrap();
        assert_eq!(loaded, entry(1, "get-user-info"));
        assert!(journal.load("deploy:m1", 2).unwrap().is_none());
        assert!(journal.load("deploy:m2", 0).unwrap().is_none());

        assert_eq!(journal.workflow_ids().unwrap(), vec!["deploy:m1"]);

        journal.clear("deploy:m1").unwrap();
        assert!(journal.load("deploy:m1", 0).unwrap().is_none());
        assert!(journal.workflow_ids().unwrap().is_empty());
    }

    #[test]
    fn test_record_overwrites_same_seq() {
        let journal = SqliteJournal::open_in_memory().unwrap();

        journal.record("wf", &entry(0, "power-on")).unwrap();
        journal.record("wf", &entry(0, "power-cycle")).unwrap();

        assert_eq!(journal.load("wf", 0).unwrap().unwrap().step, "power-cycle");
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.db");

        {
            let journal = SqliteJournal::open(&path).unwrap();
            journal.record("deploy:m1", &entry(0, "propose-ip")).unwrap();
        }

        let reopened = SqliteJournal::open(&path).unwrap();
        assert_eq!(
            reopened.load("deploy:m1", 0).unwrap(),
            Some(entry(0, "propose-ip"))
        );
    }

    #[test]
    fn test_corrupt_payload_is_serialization_error() {
        let journal = SqliteJournal::open_in_memory().unwrap();
        journal
            .conn()
            .execute(
                "INSERT INTO workflow_journal VALUES ('wf', 0, 'propose-ip', 'not json', 0)",
                [],
            )
            .unwrap();

        let err = journal.load("wf", 0).unwrap_err();
        assert!(matches!(err, JournalError::Serialization(_)));
    }
}
