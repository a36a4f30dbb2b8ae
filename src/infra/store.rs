use crate::domain::{
    IndexedMetadata, ListQuery, SCHEMA_VERSION, SessionInfoUpdate, SessionRecord, StoreStats,
};
use crate::util::now_iso;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare store directory: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistent session metadata, one SQLite file per host.
///
/// A single connection serializes all writers; WAL keeps concurrent readers
/// of the database file from blocking on the indexer's batches.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        configure_connection(&conn)?;
        migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        configure_connection(&conn)?;
        migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Total-function read: an unknown id inserts (and returns) a default
    /// row, so callers never handle "absent" on this path.
    pub fn get_or_create(&self, session_id: &str) -> StoreResult<SessionRecord> {
        let conn = self.conn.lock();
        if let Some(record) = select_record(&conn, session_id)? {
            return Ok(record);
        }

        let record = SessionRecord::new_default(session_id);
        insert_record(&conn, &record)?;
        touch_metadata(&conn, &record.updated_at)?;
        Ok(record)
    }

    pub fn get(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        let conn = self.conn.lock();
        select_record(&conn, session_id)
    }

    /// Merge user-preference fields. Indexed fields are left untouched.
    pub fn upsert_user_fields(
        &self,
        session_id: &str,
        update: &SessionInfoUpdate,
    ) -> StoreResult<SessionRecord> {
        let conn = self.conn.lock();
        let existing = select_record(&conn, session_id)?;
        let mut record = existing
            .clone()
            .unwrap_or_else(|| SessionRecord::new_default(session_id));

        if let Some(custom_name) = &update.custom_name {
            record.custom_name = custom_name.clone();
        }
        if let Some(pinned) = update.pinned {
            record.pinned = pinned;
        }
        if let Some(archived) = update.archived {
            record.archived = archived;
        }
        if let Some(continuation) = &update.continuation_session_id {
            record.continuation_session_id = normalize_continuation(Some(continuation.clone()));
        }
        if let Some(head) = &update.initial_commit_head {
            record.initial_commit_head = head.clone();
        }
        if let Some(mode) = &update.permission_mode {
            record.permission_mode = mode.clone();
        }
        record.version = SCHEMA_VERSION;
        record.updated_at = now_iso();

        if existing.is_some() {
            conn.execute(
                "UPDATE sessions SET
                    custom_name = ?2,
                    pinned = ?3,
                    archived = ?4,
                    continuation_session_id = ?5,
                    initial_commit_head = ?6,
                    permission_mode = ?7,
                    version = ?8,
                    updated_at = ?9
                 WHERE session_id = ?1",
                params![
                    record.session_id,
                    record.custom_name,
                    record.pinned,
                    record.archived,
                    record.continuation_session_id,
                    record.initial_commit_head,
                    record.permission_mode,
                    record.version,
                    record.updated_at,
                ],
            )?;
        } else {
            insert_record(&conn, &record)?;
        }
        touch_metadata(&conn, &record.updated_at)?;
        Ok(record)
    }

    /// Transactional bulk upsert from the indexer. Only indexed columns are
    /// named in the conflict update, so a concurrent user rename can never
    /// be clobbered; `last_scanned_at_ms` never regresses.
    pub fn upsert_indexed_batch(&self, batch: &[IndexedMetadata]) -> StoreResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = now_iso();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO sessions (
                    session_id, summary, project_path, file_path, message_count,
                    total_duration_ms, model, last_scanned_at_ms, version,
                    created_at, updated_at
                 ) VALUES (
                    ?1, ?2, ?3, ?4, ?5,
                    ?6, ?7, ?8, ?9,
                    COALESCE(?10, ?12), COALESCE(?11, ?12)
                 )
                 ON CONFLICT(session_id) DO UPDATE SET
                    summary = excluded.summary,
                    project_path = excluded.project_path,
                    file_path = excluded.file_path,
                    message_count = excluded.message_count,
                    total_duration_ms = excluded.total_duration_ms,
                    model = excluded.model,
                    last_scanned_at_ms =
                        MAX(sessions.last_scanned_at_ms, excluded.last_scanned_at_ms),
                    version = excluded.version,
                    created_at = COALESCE(?10, sessions.created_at),
                    updated_at = excluded.updated_at",
            )?;

            for item in batch {
                stmt.execute(params![
                    item.session_id,
                    item.summary,
                    item.project_path.as_ref().map(|p| p.display().to_string()),
                    item.file_path.display().to_string(),
                    item.message_count,
                    item.total_duration_ms,
                    item.model.clone().unwrap_or_else(|| "Unknown".to_string()),
                    item.last_scanned_at_ms,
                    SCHEMA_VERSION,
                    item.first_timestamp,
                    item.last_timestamp,
                    now,
                ])?;
            }
        }
        touch_metadata(&tx, &now)?;
        tx.commit()?;
        Ok(batch.len())
    }

    /// Rows are only ever removed here; the indexer never deletes.
    pub fn delete(&self, session_id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "DELETE FROM sessions WHERE session_id = ?1",
            params![session_id],
        )?;
        if affected > 0 {
            touch_metadata(&conn, &now_iso())?;
        }
        Ok(affected > 0)
    }

    pub fn list(&self, query: &ListQuery) -> StoreResult<(Vec<SessionRecord>, u64)> {
        let conn = self.conn.lock();

        let mut clauses: Vec<&'static str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(project_path) = &query.project_path {
            clauses.push("project_path = ?");
            values.push(SqlValue::Text(project_path.clone()));
        }
        if let Some(archived) = query.archived {
            clauses.push("archived = ?");
            values.push(SqlValue::Integer(i64::from(archived)));
        }
        if let Some(pinned) = query.pinned {
            clauses.push("pinned = ?");
            values.push(SqlValue::Integer(i64::from(pinned)));
        }
        if let Some(has_continuation) = query.has_continuation {
            clauses.push(if has_continuation {
                "continuation_session_id IS NOT NULL"
            } else {
                "continuation_session_id IS NULL"
            });
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let total: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM sessions{where_sql}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let limit = query.limit.map_or(-1i64, i64::from);
        let offset = query.offset.map_or(0i64, i64::from);
        let list_sql = format!(
            "SELECT {RECORD_COLUMNS} FROM sessions{where_sql} \
             ORDER BY {} {} LIMIT ? OFFSET ?",
            query.sort_by.column(),
            query.order.keyword(),
        );
        values.push(SqlValue::Integer(limit));
        values.push(SqlValue::Integer(offset));

        let mut stmt = conn.prepare(&list_sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), record_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok((records, total))
    }

    /// Archive every unarchived row in one transaction; returns how many
    /// rows flipped.
    pub fn archive_all(&self) -> StoreResult<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = now_iso();
        let affected = tx.execute(
            "UPDATE sessions SET archived = 1, updated_at = ?1 WHERE archived = 0",
            params![now],
        )?;
        touch_metadata(&tx, &now)?;
        tx.commit()?;
        Ok(affected as u64)
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let conn = self.conn.lock();
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        let page_count: u64 =
            conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
        let page_size: u64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
        let last_updated = get_metadata(&conn, "lastUpdated")?.unwrap_or_default();
        Ok(StoreStats {
            count,
            byte_size: page_count.saturating_mul(page_size),
            last_updated,
        })
    }

    /// `sessionId → lastScannedAtMs` for every known row, so the full scan
    /// decides skip-or-rescan with one query.
    pub fn scan_watermarks(&self) -> StoreResult<HashMap<String, i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT session_id, last_scanned_at_ms FROM sessions")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (session_id, scanned_at) = row?;
            out.insert(session_id, scanned_at);
        }
        Ok(out)
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )
}

const RECORD_COLUMNS: &str = "session_id, custom_name, pinned, archived, \
     continuation_session_id, initial_commit_head, permission_mode, summary, \
     project_path, file_path, message_count, total_duration_ms, model, \
     last_scanned_at_ms, version, created_at, updated_at";

/// Column set the additive migration keeps in sync; decl must carry a
/// default so `ALTER TABLE ADD COLUMN` succeeds on populated tables.
const REQUIRED_COLUMNS: &[(&str, &str)] = &[
    ("custom_name", "TEXT NOT NULL DEFAULT ''"),
    ("pinned", "INTEGER NOT NULL DEFAULT 0"),
    ("archived", "INTEGER NOT NULL DEFAULT 0"),
    ("continuation_session_id", "TEXT"),
    ("initial_commit_head", "TEXT NOT NULL DEFAULT ''"),
    ("permission_mode", "TEXT NOT NULL DEFAULT 'default'"),
    ("summary", "TEXT"),
    ("project_path", "TEXT"),
    ("file_path", "TEXT"),
    ("message_count", "INTEGER NOT NULL DEFAULT 0"),
    ("total_duration_ms", "INTEGER NOT NULL DEFAULT 0"),
    ("model", "TEXT NOT NULL DEFAULT 'Unknown'"),
    ("last_scanned_at_ms", "INTEGER NOT NULL DEFAULT 0"),
    ("version", "INTEGER NOT NULL DEFAULT 0"),
    ("created_at", "TEXT NOT NULL DEFAULT ''"),
    ("updated_at", "TEXT NOT NULL DEFAULT ''"),
];

/// Forward-only, additive migration: create the current shape if absent,
/// then add any column an older database is missing. Never drops.
fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            custom_name TEXT NOT NULL DEFAULT '',
            pinned INTEGER NOT NULL DEFAULT 0,
            archived INTEGER NOT NULL DEFAULT 0,
            continuation_session_id TEXT,
            initial_commit_head TEXT NOT NULL DEFAULT '',
            permission_mode TEXT NOT NULL DEFAULT 'default',
            summary TEXT,
            project_path TEXT,
            file_path TEXT,
            message_count INTEGER NOT NULL DEFAULT 0,
            total_duration_ms INTEGER NOT NULL DEFAULT 0,
            model TEXT NOT NULL DEFAULT 'Unknown',
            last_scanned_at_ms INTEGER NOT NULL DEFAULT 0,
            version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT '',
            updated_at TEXT NOT NULL DEFAULT ''
         );
         CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
         );",
    )?;

    let mut stmt = conn.prepare("PRAGMA table_info(sessions)")?;
    let existing: HashSet<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<_, _>>()?;
    drop(stmt);

    for (name, decl) in REQUIRED_COLUMNS {
        if !existing.contains(*name) {
            conn.execute_batch(&format!("ALTER TABLE sessions ADD COLUMN {name} {decl}"))?;
        }
    }

    let now = now_iso();
    conn.execute(
        "INSERT OR IGNORE INTO metadata (key, value) VALUES ('createdAt', ?1)",
        params![now],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schemaVersion', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )?;
    touch_metadata(conn, &now)?;
    Ok(())
}

fn touch_metadata(conn: &Connection, now: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('lastUpdated', ?1)",
        params![now],
    )?;
    Ok(())
}

fn get_metadata(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM metadata WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

fn select_record(conn: &Connection, session_id: &str) -> StoreResult<Option<SessionRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {RECORD_COLUMNS} FROM sessions WHERE session_id = ?1"),
            params![session_id],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

fn insert_record(conn: &Connection, record: &SessionRecord) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO sessions ({RECORD_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        ),
        params![
            record.session_id,
            record.custom_name,
            record.pinned,
            record.archived,
            record.continuation_session_id,
            record.initial_commit_head,
            record.permission_mode,
            record.summary,
            record.project_path.as_ref().map(|p| p.display().to_string()),
            record.file_path.as_ref().map(|p| p.display().to_string()),
            record.message_count,
            record.total_duration_ms,
            record.model,
            record.last_scanned_at_ms,
            record.version,
            record.created_at,
            record.updated_at,
        ],
    )?;
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        session_id: row.get(0)?,
        custom_name: row.get(1)?,
        pinned: row.get(2)?,
        archived: row.get(3)?,
        continuation_session_id: normalize_continuation(row.get(4)?),
        initial_commit_head: row.get(5)?,
        permission_mode: row.get(6)?,
        summary: row.get(7)?,
        project_path: row.get::<_, Option<String>>(8)?.map(Into::into),
        file_path: row.get::<_, Option<String>>(9)?.map(Into::into),
        message_count: row.get(10)?,
        total_duration_ms: row.get(11)?,
        model: row.get(12)?,
        last_scanned_at_ms: row.get(13)?,
        version: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

/// The empty string and "no continuation" are the same state; absent wins.
fn normalize_continuation(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
