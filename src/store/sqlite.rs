//! SQLite-backed graph store
//!
//! Records are kept as JSON next to the indexed columns the graph queries
//! filter on. Write transactions start `IMMEDIATE` so two writers never
//! interleave inside one insertion or deletion.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Params, Row, TransactionBehavior};
use tracing::{debug, info};

use crate::crypto::{Digest, DIGEST_LEN};
use crate::error::{GripError, Result};
use crate::graph::{ContextFileWrap, WrapFields};
use crate::record::{unix_millis, Account, Context, ContextFile, DeletedContextFile};

use super::{schema, GraphTx, QuarantinedFile, Store};

impl ToSql for Digest {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Blob(self.as_bytes())))
    }
}

impl FromSql for Digest {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let blob = value.as_blob()?;
        Digest::from_slice(blob).map_err(|_| FromSqlError::InvalidBlobSize {
            expected_size: DIGEST_LEN,
            blob_size: blob.len(),
        })
    }
}

/// SQLite database holding the dependency graph and its ledgers
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the graph database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!(path = %path.display(), "Opening graph database");

        let conn = Connection::open(path)?;

        // WAL for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory graph database");
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn run<T, F>(&self, f: F, commit: bool) -> Result<T>
    where
        F: FnOnce(&mut dyn GraphTx) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| GripError::Internal(format!("Lock poisoned: {}", e)))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&mut SqliteTx { conn: &tx })?;
        if commit {
            tx.commit()?;
        } else {
            tx.rollback()?;
        }
        Ok(out)
    }
}

impl Store for SqliteStore {
    fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn GraphTx) -> Result<T>,
    {
        self.run(f, true)
    }

    fn dry_run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn GraphTx) -> Result<T>,
    {
        self.run(f, false)
    }
}

const FILE_COLUMNS: &str = "record, head, leaf, depth, covered, unconstructable";

fn read_file_row(row: &Row<'_>) -> rusqlite::Result<(String, WrapFields)> {
    Ok((
        row.get(0)?,
        WrapFields {
            head: row.get(1)?,
            leaf: row.get(2)?,
            depth: row.get(3)?,
            covered_by_snapshot: row.get(4)?,
            unconstructable: row.get(5)?,
        },
    ))
}

fn read_account_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        account_id: row.get(0)?,
        max_disk_space: row.get::<_, i64>(1)? as u64,
        disk_space_used: row.get::<_, i64>(2)? as u64,
        message: row.get(3)?,
        enabled: row.get(4)?,
    })
}

struct SqliteTx<'a> {
    conn: &'a Connection,
}

impl SqliteTx<'_> {
    fn query_files<P: Params>(&self, sql: &str, params: P) -> Result<Vec<ContextFileWrap>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, read_file_row)?;
        let mut out = Vec::new();
        for row in rows {
            let (record, wrap) = row?;
            out.push(ContextFileWrap {
                file: serde_json::from_str(&record)?,
                wrap,
            });
        }
        Ok(out)
    }

    fn updated(&self, changed: usize, what: impl FnOnce() -> String) -> Result<()> {
        if changed == 0 {
            return Err(GripError::NotFound(what()));
        }
        Ok(())
    }
}

impl GraphTx for SqliteTx<'_> {
    fn context(&self, dig: &Digest) -> Result<Option<Context>> {
        let record: Option<String> = self
            .conn
            .query_row("SELECT record FROM contexts WHERE dig = ?1", [dig], |row| row.get(0))
            .optional()?;
        record
            .map(|r| serde_json::from_str(&r).map_err(GripError::from))
            .transpose()
    }

    fn store_context(&mut self, context: &Context, account_id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO contexts (dig, account_id, record) VALUES (?1, ?2, ?3)",
            params![context.dig(), account_id, serde_json::to_string(context)?],
        )?;
        Ok(())
    }

    fn contexts(&self) -> Result<Vec<Context>> {
        let mut stmt = self.conn.prepare_cached("SELECT record FROM contexts ORDER BY dig")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    fn context_account(&self, context: &Digest) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT account_id FROM contexts WHERE dig = ?1",
                [context],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn context_file(&self, data_dep_dig: &Digest) -> Result<Option<ContextFileWrap>> {
        let sql = format!("SELECT {} FROM context_files WHERE data_dep_dig = ?1", FILE_COLUMNS);
        Ok(self.query_files(&sql, [data_dep_dig])?.pop())
    }

    fn dependents_of(&self, context: &Digest, data_dep_dig: &Digest) -> Result<Vec<ContextFileWrap>> {
        let sql = format!(
            "SELECT {} FROM context_files f
             JOIN context_file_deps d ON d.file = f.data_dep_dig
             WHERE d.dependency = ?1 AND f.context = ?2
             ORDER BY f.data_dep_dig",
            FILE_COLUMNS
        );
        self.query_files(&sql, params![data_dep_dig, context])
    }

    fn context_files(&self, context: &Digest) -> Result<Vec<ContextFileWrap>> {
        let sql = format!(
            "SELECT {} FROM context_files WHERE context = ?1 ORDER BY data_dep_dig",
            FILE_COLUMNS
        );
        self.query_files(&sql, [context])
    }

    fn context_heads(&self, context: &Digest) -> Result<Vec<ContextFileWrap>> {
        let sql = format!(
            "SELECT {} FROM context_files WHERE context = ?1 AND head = 1 ORDER BY data_dep_dig",
            FILE_COLUMNS
        );
        self.query_files(&sql, [context])
    }

    fn context_leaves(
        &self,
        context: &Digest,
        covered: bool,
        index: Option<bool>,
    ) -> Result<Vec<ContextFileWrap>> {
        let sql = format!(
            "SELECT {} FROM context_files
             WHERE context = ?1 AND leaf = 1 AND covered = ?2
               AND (?3 IS NULL OR is_index = ?3)
             ORDER BY data_dep_dig",
            FILE_COLUMNS
        );
        self.query_files(&sql, params![context, covered, index])
    }

    fn covered_snapshots(&self, context: &Digest) -> Result<Vec<ContextFileWrap>> {
        let sql = format!(
            "SELECT {} FROM context_files
             WHERE context = ?1 AND is_snapshot = 1 AND covered = 1
             ORDER BY data_dep_dig",
            FILE_COLUMNS
        );
        self.query_files(&sql, [context])
    }

    fn insert_context_file(&mut self, file: &ContextFile, wrap: &WrapFields) -> Result<()> {
        self.conn.execute(
            "INSERT INTO context_files
                (data_dep_dig, context, dig, content, size, is_index, is_snapshot, record,
                 head, leaf, depth, covered, unconstructable)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                file.data_dep_dig(),
                file.context(),
                file.dig(),
                file.content(),
                file.size() as i64,
                file.is_index(),
                file.is_snapshot(),
                serde_json::to_string(file)?,
                wrap.head,
                wrap.leaf,
                wrap.depth,
                wrap.covered_by_snapshot,
                wrap.unconstructable,
            ],
        )?;

        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO context_file_deps (file, dependency) VALUES (?1, ?2)")?;
        for dep in file.depends_on() {
            stmt.execute(params![file.data_dep_dig(), dep])?;
        }
        Ok(())
    }

    fn update_wrap(&mut self, data_dep_dig: &Digest, wrap: &WrapFields) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE context_files
             SET head = ?2, leaf = ?3, depth = ?4, covered = ?5, unconstructable = ?6
             WHERE data_dep_dig = ?1",
            params![
                data_dep_dig,
                wrap.head,
                wrap.leaf,
                wrap.depth,
                wrap.covered_by_snapshot,
                wrap.unconstructable,
            ],
        )?;
        self.updated(changed, || format!("context file {}", data_dep_dig.short()))
    }

    fn delete_context_file(&mut self, data_dep_dig: &Digest) -> Result<()> {
        self.conn
            .execute("DELETE FROM context_file_deps WHERE file = ?1", [data_dep_dig])?;
        self.conn
            .execute("DELETE FROM context_files WHERE data_dep_dig = ?1", [data_dep_dig])?;
        Ok(())
    }

    fn content_references(&self, content: &Digest) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM context_files WHERE content = ?1",
            [content],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn append_tombstone(&mut self, tombstone: &DeletedContextFile) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO deleted_context_files (data_dep_dig, context, dig, deleted_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                tombstone.data_dep_dig,
                tombstone.context,
                tombstone.dig,
                tombstone.deleted_at as i64,
            ],
        )?;
        Ok(())
    }

    fn tombstone(&self, data_dep_dig: &Digest) -> Result<Option<DeletedContextFile>> {
        Ok(self
            .conn
            .query_row(
                "SELECT context, dig, data_dep_dig, deleted_at FROM deleted_context_files
                 WHERE data_dep_dig = ?1",
                [data_dep_dig],
                read_tombstone_row,
            )
            .optional()?)
    }

    fn tombstones(&self, context: &Digest) -> Result<Vec<DeletedContextFile>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT context, dig, data_dep_dig, deleted_at FROM deleted_context_files
             WHERE context = ?1 ORDER BY data_dep_dig",
        )?;
        let rows = stmt.query_map([context], read_tombstone_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn quarantine(&mut self, file: &ContextFile, reason: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO quarantined_context_files
                (data_dep_dig, context, record, reason, quarantined_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                file.data_dep_dig(),
                file.context(),
                serde_json::to_string(file)?,
                reason,
                unix_millis() as i64,
            ],
        )?;
        Ok(())
    }

    fn quarantined(&self, context: &Digest) -> Result<Vec<QuarantinedFile>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT record, reason, quarantined_at FROM quarantined_context_files
             WHERE context = ?1 ORDER BY data_dep_dig",
        )?;
        let rows = stmt.query_map([context], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (record, reason, at) = row?;
            out.push(QuarantinedFile {
                file: serde_json::from_str(&record)?,
                reason,
                quarantined_at: at as u64,
            });
        }
        Ok(out)
    }

    fn store_account(&mut self, account: &Account) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO accounts
                (account_id, max_disk_space, disk_space_used, message, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                account.account_id,
                account.max_disk_space as i64,
                account.disk_space_used as i64,
                account.message,
                account.enabled,
            ],
        )?;
        Ok(())
    }

    fn account(&self, account_id: &str) -> Result<Option<Account>> {
        Ok(self
            .conn
            .query_row(
                "SELECT account_id, max_disk_space, disk_space_used, message, enabled
                 FROM accounts WHERE account_id = ?1",
                [account_id],
                read_account_row,
            )
            .optional()?)
    }

    fn set_disk_space_used(&mut self, account_id: &str, used: u64) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE accounts SET disk_space_used = ?2 WHERE account_id = ?1",
            params![account_id, used as i64],
        )?;
        if changed == 0 {
            return Err(GripError::UnknownAccount(account_id.to_string()));
        }
        Ok(())
    }

    fn set_account_message(&mut self, account_id: &str, message: &str) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE accounts SET message = ?2 WHERE account_id = ?1",
            params![account_id, message],
        )?;
        if changed == 0 {
            return Err(GripError::UnknownAccount(account_id.to_string()));
        }
        Ok(())
    }
}

fn read_tombstone_row(row: &Row<'_>) -> rusqlite::Result<DeletedContextFile> {
    Ok(DeletedContextFile {
        context: row.get(0)?,
        dig: row.get(1)?,
        data_dep_dig: row.get(2)?,
        deleted_at: row.get::<_, i64>(3)? as u64,
    })
}
