use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};
use tracing::info;

use crate::error::{ChainError, Result};
use crate::index::ChainLookup;
use crate::table::{drain_records, ChainEntry, MalformedPolicy};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS otpmd5 (
        source INTEGER NOT NULL,
        result INTEGER PRIMARY KEY
    );
    CREATE TABLE IF NOT EXISTS otpmd5_conflicts (
        source INTEGER NOT NULL,
        result INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS otpmd5_conflicts_result ON otpmd5_conflicts (result);
";

const LOOKUP: &str = "
    SELECT source, result FROM otpmd5 WHERE result = ?1
    UNION ALL
    SELECT source, result FROM otpmd5_conflicts WHERE result = ?1
";

/// Rows committed per transaction during an import.
const IMPORT_BATCH: u64 = 100_000;

/// Relational endpoint store for tables that do not fit in memory
///
/// The first seed seen for an endpoint goes to `otpmd5`, keyed by endpoint. Later seeds with the
/// same endpoint go to `otpmd5_conflicts`. Values are stored as the `i64` with the same bits.
pub struct SqliteChainStore {
    conn: Mutex<Connection>,
}

impl SqliteChainStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        SqliteChainStore::with_connection(Connection::open(path.as_ref())?)
    }

    pub fn in_memory() -> Result<Self> {
        SqliteChainStore::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteChainStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panicking reader cannot leave the connection half-written.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, entry: &ChainEntry) -> Result<()> {
        insert_entry(&self.conn(), entry)
    }

    /// Imports a stream of records, committing every `IMPORT_BATCH` rows.
    pub fn import<I>(&self, records: I, policy: MalformedPolicy) -> Result<u64>
    where
        I: IntoIterator<Item = Result<ChainEntry>>,
    {
        let mut conn = self.conn();
        let mut imported = 0u64;
        let mut pending: Vec<ChainEntry> = Vec::new();

        let skipped = drain_records(records, policy, |entry| {
            pending.push(entry);
            if pending.len() as u64 == IMPORT_BATCH {
                imported += commit_batch(&mut conn, &pending)?;
                pending.clear();
            }
            Ok(())
        })?;
        imported += commit_batch(&mut conn, &pending)?;

        info!(imported, skipped, "sql table import complete");
        Ok(imported)
    }

    pub fn len(&self) -> Result<u64> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM otpmd5) + (SELECT COUNT(*) FROM otpmd5_conflicts)",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn conflicts(&self) -> Result<u64> {
        let conn = self.conn();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM otpmd5_conflicts", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn insert_entry(conn: &Connection, entry: &ChainEntry) -> Result<()> {
    let seed = entry.seed as i64;
    let endpoint = entry.endpoint as i64;
    let inserted = conn
        .prepare_cached("INSERT OR IGNORE INTO otpmd5 (source, result) VALUES (?1, ?2)")?
        .execute(params![seed, endpoint])?;
    if inserted == 0 {
        conn.prepare_cached("INSERT INTO otpmd5_conflicts (source, result) VALUES (?1, ?2)")?
            .execute(params![seed, endpoint])?;
    }
    Ok(())
}

fn commit_batch(conn: &mut Connection, entries: &[ChainEntry]) -> Result<u64> {
    if entries.is_empty() {
        return Ok(0);
    }
    let tx = conn.transaction()?;
    for entry in entries {
        insert_entry(&tx, entry)?;
    }
    tx.commit()?;
    Ok(entries.len() as u64)
}

impl ChainLookup for SqliteChainStore {
    fn lookup_into(&self, key: u64, out: &mut Vec<u64>) -> Result<()> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(LOOKUP)?;
        let rows = stmt.query_map(params![key as i64], |row| {
            Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64))
        })?;
        for row in rows {
            let (seed, endpoint) = row?;
            if endpoint != key {
                return Err(ChainError::LookupInconsistency {
                    key,
                    found: endpoint,
                });
            }
            out.push(seed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn duplicate_endpoints_land_in_conflicts() -> Result<()> {
        let store = SqliteChainStore::in_memory()?;
        store.insert(&ChainEntry::new(1, u64::MAX))?;
        store.insert(&ChainEntry::new(2, u64::MAX))?;
        store.insert(&ChainEntry::new(3, 42))?;

        assert_eq!(store.len()?, 3);
        assert_eq!(store.conflicts()?, 1);

        let mut seeds = store.lookup(u64::MAX)?;
        seeds.sort_unstable();
        assert_eq!(seeds, vec![1, 2]);
        assert_eq!(store.lookup(42)?, vec![3]);
        assert!(store.lookup(43)?.is_empty());
        Ok(())
    }

    #[test]
    fn import_persists_across_reopen() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let tmp = tempdir()?;
        let path = tmp.path().join("otpmd5.sqlite");
        let records = vec![
            Ok(ChainEntry::new(10, 0x8000_0000_0000_0001)),
            Err(ChainError::Parse {
                line: 2,
                reason: "junk".into(),
            }),
            Ok(ChainEntry::new(11, 7)),
        ];

        let store = SqliteChainStore::open(&path)?;
        assert_eq!(store.import(records, MalformedPolicy::Skip)?, 2);
        drop(store);

        let reopened = SqliteChainStore::open(&path)?;
        assert_eq!(reopened.lookup(0x8000_0000_0000_0001)?, vec![10]);
        assert_eq!(reopened.lookup(7)?, vec![11]);
        Ok(())
    }
}
