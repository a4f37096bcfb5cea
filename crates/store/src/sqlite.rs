//! SQLite-backed sandbox repository.
//!
//! One connection behind an async mutex. Auto-commit calls run on the
//! blocking pool; a transaction owns the connection guard and issues
//! `BEGIN IMMEDIATE`, so it holds SQLite's write lock from its first read.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, types::Value, Connection, ErrorCode, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use workspace_sandbox_core::{
    traits::{SandboxRepository, SandboxTransaction},
    types::{
        AuditEvent, AuditFilter, ListFilter, Sandbox, SandboxId, SandboxPage, SandboxStats,
        SandboxStatus,
    },
    Error, Result,
};

use crate::scopes_intersect;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sandboxes (
    id               TEXT PRIMARY KEY,
    scope_path       TEXT NOT NULL,
    reserved_path    TEXT NOT NULL,
    project_root     TEXT NOT NULL,
    reserved_root    TEXT NOT NULL,
    owner            TEXT NOT NULL,
    owner_type       TEXT NOT NULL,
    status           TEXT NOT NULL,
    error_message    TEXT,
    driver           TEXT NOT NULL,
    driver_version   TEXT NOT NULL,
    lower_dir        TEXT,
    upper_dir        TEXT,
    work_dir         TEXT,
    merged_dir       TEXT,
    size_bytes       INTEGER NOT NULL DEFAULT 0,
    file_count       INTEGER NOT NULL DEFAULT 0,
    active_pids      TEXT NOT NULL DEFAULT '[]', -- JSON array
    session_count    INTEGER NOT NULL DEFAULT 0,
    tags             TEXT NOT NULL DEFAULT '[]', -- JSON array
    metadata         TEXT NOT NULL DEFAULT '{}', -- JSON object
    idempotency_key  TEXT,
    version          INTEGER NOT NULL,
    base_commit_hash TEXT,
    created_at       TEXT NOT NULL,
    last_used_at     TEXT,
    stopped_at       TEXT,
    approved_at      TEXT,
    deleted_at       TEXT,
    updated_at       TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_sandboxes_idempotency
    ON sandboxes (idempotency_key)
    WHERE idempotency_key IS NOT NULL AND status <> 'deleted';
CREATE INDEX IF NOT EXISTS idx_sandboxes_reservation ON sandboxes (reserved_root, status);
CREATE INDEX IF NOT EXISTS idx_sandboxes_created ON sandboxes (created_at);
CREATE TABLE IF NOT EXISTS audit_events (
    sequence      INTEGER PRIMARY KEY AUTOINCREMENT,
    sandbox_id    TEXT,
    event_type    TEXT NOT NULL,
    actor         TEXT NOT NULL,
    actor_type    TEXT NOT NULL,
    details       TEXT NOT NULL, -- JSON object
    sandbox_state TEXT,          -- JSON snapshot
    timestamp     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_sandbox ON audit_events (sandbox_id);
";

const SANDBOX_COLUMNS: &str = "id, scope_path, reserved_path, project_root, owner, owner_type, \
     status, error_message, driver, driver_version, lower_dir, upper_dir, work_dir, merged_dir, \
     size_bytes, file_count, active_pids, session_count, tags, metadata, idempotency_key, \
     version, base_commit_hash, created_at, last_used_at, stopped_at, approved_at, deleted_at, \
     updated_at, reserved_root";

const AUDIT_COLUMNS: &str =
    "sequence, sandbox_id, event_type, actor, actor_type, details, sandbox_state, timestamp";

// =============================================================================
// Row Mapping
// =============================================================================

fn sql_error(e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(err, msg) if err.code == ErrorCode::ConstraintViolation => {
            Error::UniqueViolation(msg.clone().unwrap_or_else(|| err.to_string()))
        }
        _ => Error::storage(format!("sqlite: {}", e)),
    }
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

/// Stringly-typed columns are validated on read.
fn parse_text<T: FromStr<Err = Error>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, e))
}

fn parse_json<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        DateTime::parse_from_rfc3339(&r)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

/// Fixed-width UTC timestamps sort lexically in chronological order.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn read_sandbox(row: &Row<'_>) -> rusqlite::Result<Sandbox> {
    Ok(Sandbox {
        id: SandboxId(row.get(0)?),
        scope_path: row.get(1)?,
        reserved_path: row.get(2)?,
        project_root: row.get(3)?,
        owner: row.get(4)?,
        owner_type: parse_text(row, 5)?,
        status: parse_text(row, 6)?,
        error_message: row.get(7)?,
        driver: row.get(8)?,
        driver_version: row.get(9)?,
        lower_dir: row.get(10)?,
        upper_dir: row.get(11)?,
        work_dir: row.get(12)?,
        merged_dir: row.get(13)?,
        size_bytes: row.get::<_, i64>(14)?.max(0) as u64,
        file_count: row.get::<_, i64>(15)?.max(0) as u64,
        active_pids: parse_json(row, 16)?,
        session_count: row.get::<_, i64>(17)?.max(0) as u32,
        tags: parse_json(row, 18)?,
        metadata: parse_json(row, 19)?,
        idempotency_key: row.get(20)?,
        version: row.get::<_, i64>(21)?.max(0) as u64,
        base_commit_hash: row.get(22)?,
        created_at: parse_ts(row, 23)?,
        last_used_at: parse_opt_ts(row, 24)?,
        stopped_at: parse_opt_ts(row, 25)?,
        approved_at: parse_opt_ts(row, 26)?,
        deleted_at: parse_opt_ts(row, 27)?,
        updated_at: parse_ts(row, 28)?,
        reserved_root: row.get(29)?,
    })
}

fn read_audit(row: &Row<'_>) -> rusqlite::Result<AuditEvent> {
    let sandbox_id: Option<String> = row.get(1)?;
    let state: Option<String> = row.get(6)?;
    Ok(AuditEvent {
        sequence: row.get::<_, i64>(0)?.max(0) as u64,
        sandbox_id: sandbox_id.map(SandboxId),
        event_type: parse_text(row, 2)?,
        actor: row.get(3)?,
        actor_type: parse_text(row, 4)?,
        details: parse_json(row, 5)?,
        sandbox_state: state
            .map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(6, e)))
            .transpose()?,
        timestamp: parse_ts(row, 7)?,
    })
}

// =============================================================================
// Statements
// =============================================================================

fn fetch_sandbox(conn: &Connection, id: &SandboxId) -> Result<Option<Sandbox>> {
    conn.query_row(
        &format!("SELECT {SANDBOX_COLUMNS} FROM sandboxes WHERE id = ?1"),
        params![id.as_str()],
        read_sandbox,
    )
    .optional()
    .map_err(sql_error)
}

fn insert_sandbox(conn: &Connection, sandbox: &Sandbox) -> Result<Sandbox> {
    let now = Utc::now();
    let mut stored = sandbox.clone();
    stored.version = 1;
    stored.created_at = now;
    stored.updated_at = now;

    conn.execute(
        &format!(
            "INSERT INTO sandboxes ({SANDBOX_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, \
              ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)"
        ),
        params![
            stored.id.as_str(),
            stored.scope_path,
            stored.reserved_path,
            stored.project_root,
            stored.owner,
            stored.owner_type.as_str(),
            stored.status.as_str(),
            stored.error_message,
            stored.driver,
            stored.driver_version,
            stored.lower_dir,
            stored.upper_dir,
            stored.work_dir,
            stored.merged_dir,
            stored.size_bytes as i64,
            stored.file_count as i64,
            serde_json::to_string(&stored.active_pids)?,
            stored.session_count as i64,
            serde_json::to_string(&stored.tags)?,
            serde_json::to_string(&stored.metadata)?,
            stored.idempotency_key,
            stored.version as i64,
            stored.base_commit_hash,
            ts(&stored.created_at),
            stored.last_used_at.as_ref().map(ts),
            stored.stopped_at.as_ref().map(ts),
            stored.approved_at.as_ref().map(ts),
            stored.deleted_at.as_ref().map(ts),
            ts(&stored.updated_at),
            stored.reserved_root,
        ],
    )
    .map_err(sql_error)?;

    Ok(stored)
}

fn write_mutable(
    conn: &Connection,
    sandbox: &Sandbox,
    expected_version: Option<u64>,
) -> Result<Sandbox> {
    let changed = conn
        .execute(
            "UPDATE sandboxes SET
                status = ?1, error_message = ?2, driver = ?3, driver_version = ?4,
                lower_dir = ?5, upper_dir = ?6, work_dir = ?7, merged_dir = ?8,
                size_bytes = ?9, file_count = ?10, active_pids = ?11, session_count = ?12,
                tags = ?13, metadata = ?14, last_used_at = ?15, stopped_at = ?16,
                approved_at = ?17, deleted_at = ?18, updated_at = ?19,
                version = version + 1
             WHERE id = ?20 AND (?21 IS NULL OR version = ?21)",
            params![
                sandbox.status.as_str(),
                sandbox.error_message,
                sandbox.driver,
                sandbox.driver_version,
                sandbox.lower_dir,
                sandbox.upper_dir,
                sandbox.work_dir,
                sandbox.merged_dir,
                sandbox.size_bytes as i64,
                sandbox.file_count as i64,
                serde_json::to_string(&sandbox.active_pids)?,
                sandbox.session_count as i64,
                serde_json::to_string(&sandbox.tags)?,
                serde_json::to_string(&sandbox.metadata)?,
                sandbox.last_used_at.as_ref().map(ts),
                sandbox.stopped_at.as_ref().map(ts),
                sandbox.approved_at.as_ref().map(ts),
                sandbox.deleted_at.as_ref().map(ts),
                ts(&Utc::now()),
                sandbox.id.as_str(),
                expected_version.map(|v| v as i64),
            ],
        )
        .map_err(sql_error)?;

    if changed == 0 {
        return match fetch_sandbox(conn, &sandbox.id)? {
            None => Err(Error::not_found(format!("sandbox {}", sandbox.id))),
            Some(current) => Err(Error::ConcurrentModification {
                current_version: current.version,
            }),
        };
    }

    fetch_sandbox(conn, &sandbox.id)?
        .ok_or_else(|| Error::internal(format!("sandbox {} vanished after update", sandbox.id)))
}

fn soft_delete(conn: &Connection, id: &SandboxId) -> Result<Sandbox> {
    let current =
        fetch_sandbox(conn, id)?.ok_or_else(|| Error::not_found(format!("sandbox {}", id)))?;
    if current.is_terminal() {
        return Err(Error::AlreadyDeleted {
            id: id.clone(),
            current_version: current.version,
        });
    }
    let mut deleted = current.clone();
    deleted.transition_to(SandboxStatus::Deleted, Utc::now())?;
    write_mutable(conn, &deleted, Some(current.version))
}

fn query_list(conn: &Connection, filter: &ListFilter) -> Result<SandboxPage> {
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Value> = Vec::new();

    if let Some(statuses) = filter.status.as_ref().filter(|s| !s.is_empty()) {
        let marks = vec!["?"; statuses.len()].join(", ");
        clauses.push(format!("status IN ({marks})"));
        args.extend(statuses.iter().map(|s| Value::Text(s.as_str().to_string())));
    }
    if let Some(owner) = &filter.owner {
        clauses.push("owner = ?".into());
        args.push(Value::Text(owner.clone()));
    }
    if let Some(root) = &filter.project_root {
        clauses.push("project_root = ?".into());
        args.push(Value::Text(root.clone()));
    }
    if let Some(scope) = &filter.scope_path {
        clauses.push("scope_path = ?".into());
        args.push(Value::Text(scope.clone()));
    }
    if let Some(from) = &filter.created_from {
        clauses.push("created_at >= ?".into());
        args.push(Value::Text(ts(from)));
    }
    if let Some(to) = &filter.created_to {
        clauses.push("created_at <= ?".into());
        args.push(Value::Text(ts(to)));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let total: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM sandboxes{where_sql}"),
            params_from_iter(args.iter()),
            |r| r.get(0),
        )
        .map_err(sql_error)?;

    let limit = filter.effective_limit();
    let offset = filter.effective_offset();
    args.push(Value::Integer(limit as i64));
    args.push(Value::Integer(offset as i64));

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes{where_sql} \
             ORDER BY created_at DESC, id ASC LIMIT ? OFFSET ?"
        ))
        .map_err(sql_error)?;
    let items = stmt
        .query_map(params_from_iter(args.iter()), read_sandbox)
        .map_err(sql_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_error)?;

    Ok(SandboxPage {
        items,
        total_count: total.max(0) as u64,
        limit,
        offset,
    })
}

fn overlap_candidates(
    conn: &Connection,
    reserved_path: &str,
    reserved_root: &str,
    exclude_id: Option<&SandboxId>,
) -> Result<Vec<Sandbox>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes \
             WHERE reserved_root = ?1 AND status IN ('creating', 'active') \
             ORDER BY created_at ASC, id ASC"
        ))
        .map_err(sql_error)?;
    let holders = stmt
        .query_map(params![reserved_root], read_sandbox)
        .map_err(sql_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_error)?;

    Ok(holders
        .into_iter()
        .filter(|s| {
            exclude_id.map_or(true, |id| &s.id != id)
                && scopes_intersect(&s.reserved_path, reserved_path)
        })
        .collect())
}

fn find_key(conn: &Connection, key: &str) -> Result<Option<Sandbox>> {
    conn.query_row(
        &format!(
            "SELECT {SANDBOX_COLUMNS} FROM sandboxes \
             WHERE idempotency_key = ?1 AND status <> 'deleted'"
        ),
        params![key],
        read_sandbox,
    )
    .optional()
    .map_err(sql_error)
}

fn append_audit(conn: &Connection, event: &AuditEvent) -> Result<AuditEvent> {
    let state = event
        .sandbox_state
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO audit_events (sandbox_id, event_type, actor, actor_type, details, sandbox_state, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.sandbox_id.as_ref().map(|id| id.as_str()),
            event.event_type.as_str(),
            event.actor,
            event.actor_type.as_str(),
            serde_json::to_string(&event.details)?,
            state,
            ts(&event.timestamp),
        ],
    )
    .map_err(sql_error)?;

    let mut stored = event.clone();
    stored.sequence = conn.last_insert_rowid().max(0) as u64;
    Ok(stored)
}

fn query_audit(conn: &Connection, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut args: Vec<Value> = Vec::new();
    if let Some(id) = &filter.sandbox_id {
        clauses.push("sandbox_id = ?");
        args.push(Value::Text(id.0.clone()));
    }
    if let Some(event_type) = filter.event_type {
        clauses.push("event_type = ?");
        args.push(Value::Text(event_type.as_str().to_string()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    // SQLite treats a negative LIMIT as unbounded.
    args.push(Value::Integer(filter.limit.map_or(-1, |l| l as i64)));

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_events{where_sql} ORDER BY sequence ASC LIMIT ?"
        ))
        .map_err(sql_error)?;
    let events = stmt
        .query_map(params_from_iter(args.iter()), read_audit)
        .map_err(sql_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_error)?;
    Ok(events)
}

fn aggregate_stats(conn: &Connection) -> Result<SandboxStats> {
    let mut stmt = conn
        .prepare(
            "SELECT status, COUNT(*), COALESCE(SUM(size_bytes), 0) FROM sandboxes GROUP BY status",
        )
        .map_err(sql_error)?;
    let groups = stmt
        .query_map([], |row| {
            Ok((
                parse_text::<SandboxStatus>(row, 0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .map_err(sql_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sql_error)?;

    let mut stats = SandboxStats::default();
    for (status, count, size) in groups {
        stats.add(status, count.max(0) as u64, size.max(0) as u64);
    }
    Ok(stats.finalize())
}

// =============================================================================
// Repository
// =============================================================================

/// SQLite-backed sandbox repository.
#[derive(Clone)]
pub struct SqliteSandboxRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSandboxRepository {
    /// Open (or create) a database file and initialize the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(sql_error)?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_error)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(sql_error)?;
        conn.execute_batch(SCHEMA).map_err(sql_error)?;
        tracing::debug!("Sandbox schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            discard_open_transaction(&conn)?;
            f(&conn)
        })
        .await
        .map_err(|e| Error::internal(e.to_string()))?
    }
}

#[async_trait]
impl SandboxRepository for SqliteSandboxRepository {
    async fn create(&self, sandbox: &Sandbox) -> Result<Sandbox> {
        let sandbox = sandbox.clone();
        self.with_conn(move |conn| insert_sandbox(conn, &sandbox)).await
    }

    async fn get(&self, id: &SandboxId) -> Result<Option<Sandbox>> {
        let id = id.clone();
        self.with_conn(move |conn| fetch_sandbox(conn, &id)).await
    }

    async fn update(&self, sandbox: &Sandbox) -> Result<Sandbox> {
        let sandbox = sandbox.clone();
        self.with_conn(move |conn| write_mutable(conn, &sandbox, None))
            .await
    }

    async fn update_with_version_check(
        &self,
        sandbox: &Sandbox,
        expected_version: u64,
    ) -> Result<Sandbox> {
        let sandbox = sandbox.clone();
        self.with_conn(move |conn| write_mutable(conn, &sandbox, Some(expected_version)))
            .await
    }

    async fn delete(&self, id: &SandboxId) -> Result<Sandbox> {
        let id = id.clone();
        self.with_conn(move |conn| soft_delete(conn, &id)).await
    }

    async fn list(&self, filter: &ListFilter) -> Result<SandboxPage> {
        let filter = filter.clone();
        self.with_conn(move |conn| query_list(conn, &filter)).await
    }

    async fn check_scope_overlap(
        &self,
        reserved_path: &str,
        reserved_root: &str,
        exclude_id: Option<&SandboxId>,
    ) -> Result<Vec<Sandbox>> {
        let reserved_path = reserved_path.to_string();
        let reserved_root = reserved_root.to_string();
        let exclude_id = exclude_id.cloned();
        self.with_conn(move |conn| {
            overlap_candidates(conn, &reserved_path, &reserved_root, exclude_id.as_ref())
        })
        .await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Sandbox>> {
        let key = key.to_string();
        self.with_conn(move |conn| find_key(conn, &key)).await
    }

    async fn log_audit_event(&self, event: &AuditEvent) -> Result<AuditEvent> {
        let event = event.clone();
        self.with_conn(move |conn| append_audit(conn, &event)).await
    }

    async fn list_audit_events(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        let filter = filter.clone();
        self.with_conn(move |conn| query_audit(conn, &filter)).await
    }

    async fn get_stats(&self) -> Result<SandboxStats> {
        self.with_conn(aggregate_stats).await
    }

    async fn begin_tx(&self) -> Result<Box<dyn SandboxTransaction>> {
        let guard = self.conn.clone().lock_owned().await;
        let conn = tokio::task::spawn_blocking(move || {
            discard_open_transaction(&guard)?;
            guard.execute_batch("BEGIN IMMEDIATE").map_err(sql_error)?;
            Ok::<_, Error>(TxConnection(guard))
        })
        .await
        .map_err(|e| Error::internal(e.to_string()))??;

        Ok(Box::new(SqliteTransaction { conn: Some(conn) }))
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// Roll back a transaction that nobody owns any more.
///
/// Only reachable if a transaction guard was lost without running its
/// `Drop`; auto-commit writes must never join such a transaction.
fn discard_open_transaction(conn: &Connection) -> Result<()> {
    if conn.is_autocommit() {
        return Ok(());
    }
    tracing::warn!("Rolling back a transaction left open on the shared connection");
    conn.execute_batch("ROLLBACK").map_err(sql_error)
}

/// The connection guard held by an open transaction.
///
/// Dropping it while the transaction is still open rolls back before the
/// lock is released, on whichever thread the drop happens. That covers a
/// statement future abandoned while its closure runs on the blocking pool.
struct TxConnection(OwnedMutexGuard<Connection>);

impl std::ops::Deref for TxConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.0
    }
}

impl Drop for TxConnection {
    fn drop(&mut self) {
        if !self.0.is_autocommit() {
            if let Err(e) = self.0.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "Failed to roll back abandoned transaction");
            }
        }
    }
}

/// An open `BEGIN IMMEDIATE` transaction owning the connection.
pub struct SqliteTransaction {
    conn: Option<TxConnection>,
}

impl SqliteTransaction {
    async fn run<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| Error::internal("transaction already finished"))?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&conn);
            (conn, result)
        })
        .await
        .map_err(|e| Error::internal(e.to_string()))?;
        self.conn = Some(conn);
        result
    }

    async fn finish(mut self: Box<Self>, statement: &'static str) -> Result<()> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| Error::internal("transaction already finished"))?;
        // A failed COMMIT leaves the transaction open; dropping `conn` rolls it back.
        tokio::task::spawn_blocking(move || conn.execute_batch(statement).map_err(sql_error))
            .await
            .map_err(|e| Error::internal(e.to_string()))?
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        // The rollback runs on the blocking pool; the lock is held until it is done.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let _ = runtime.spawn_blocking(move || drop(conn));
            }
            Err(_) => drop(conn),
        }
    }
}

#[async_trait]
impl SandboxTransaction for SqliteTransaction {
    async fn check_scope_overlap(
        &mut self,
        reserved_path: &str,
        reserved_root: &str,
        exclude_id: Option<&SandboxId>,
    ) -> Result<Vec<Sandbox>> {
        let reserved_path = reserved_path.to_string();
        let reserved_root = reserved_root.to_string();
        let exclude_id = exclude_id.cloned();
        self.run(move |conn| {
            overlap_candidates(conn, &reserved_path, &reserved_root, exclude_id.as_ref())
        })
        .await
    }

    async fn find_by_idempotency_key(&mut self, key: &str) -> Result<Option<Sandbox>> {
        let key = key.to_string();
        self.run(move |conn| find_key(conn, &key)).await
    }

    async fn create(&mut self, sandbox: &Sandbox) -> Result<Sandbox> {
        let sandbox = sandbox.clone();
        self.run(move |conn| insert_sandbox(conn, &sandbox)).await
    }

    async fn update_with_version_check(
        &mut self,
        sandbox: &Sandbox,
        expected_version: u64,
    ) -> Result<Sandbox> {
        let sandbox = sandbox.clone();
        self.run(move |conn| write_mutable(conn, &sandbox, Some(expected_version)))
            .await
    }

    async fn log_audit_event(&mut self, event: &AuditEvent) -> Result<AuditEvent> {
        let event = event.clone();
        self.run(move |conn| append_audit(conn, &event)).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workspace_sandbox_core::types::CreateRequest;

    fn sandbox(id: &str, scope: &str) -> Sandbox {
        let request = CreateRequest::new("/p", scope, "alice")
            .with_tag("ci")
            .with_metadata("ticket", serde_json::json!(42));
        Sandbox::creating(SandboxId::from(id), &request, scope.into(), "mock", "1", Utc::now())
    }

    #[tokio::test]
    async fn test_row_roundtrip_preserves_fields() {
        let repo = SqliteSandboxRepository::open_in_memory().unwrap();
        let created = repo.create(&sandbox("a", "/p/src")).await.unwrap();
        let loaded = repo.get(&created.id).await.unwrap().unwrap();

        assert_eq!(loaded.tags.len(), 1);
        assert_eq!(loaded.metadata["ticket"], serde_json::json!(42));
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.status, SandboxStatus::Creating);
    }

    #[tokio::test]
    async fn test_invalid_status_rejected_on_read() {
        let repo = SqliteSandboxRepository::open_in_memory().unwrap();
        repo.create(&sandbox("a", "/p/src")).await.unwrap();
        repo.with_conn(|conn| {
            conn.execute("UPDATE sandboxes SET status = 'paused' WHERE id = 'a'", [])
                .map_err(sql_error)
        })
        .await
        .unwrap();

        let err = repo.get(&SandboxId::from("a")).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let repo = SqliteSandboxRepository::open_in_memory().unwrap();
        {
            let mut tx = repo.begin_tx().await.unwrap();
            tx.create(&sandbox("a", "/p/src")).await.unwrap();
        }
        assert!(repo.get(&SandboxId::from("a")).await.unwrap().is_none());

        let mut tx = repo.begin_tx().await.unwrap();
        tx.create(&sandbox("b", "/p/docs")).await.unwrap();
        tx.commit().await.unwrap();
        assert!(repo.get(&SandboxId::from("b")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_abandoned_statement_rolls_back_before_releasing_connection() {
        let repo = SqliteSandboxRepository::open_in_memory().unwrap();
        for i in 0..20 {
            let mut tx = repo.begin_tx().await.unwrap();
            // Polled once, then abandoned while the insert runs on the blocking pool.
            let ghost = sandbox(&format!("ghost-{i}"), "/p/ghost");
            let _ = tokio::time::timeout(std::time::Duration::ZERO, tx.create(&ghost)).await;
            drop(tx);

            let kept = repo
                .create(&sandbox(&format!("kept-{i}"), &format!("/p/kept-{i}")))
                .await
                .unwrap();
            repo.begin_tx().await.unwrap().rollback().await.unwrap();

            assert!(repo.get(&kept.id).await.unwrap().is_some(), "write {i} was lost");
            assert!(repo.get(&ghost.id).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_auto_commit_call_discards_stray_transaction() {
        let repo = SqliteSandboxRepository::open_in_memory().unwrap();
        repo.with_conn(|conn| conn.execute_batch("BEGIN").map_err(sql_error))
            .await
            .unwrap();

        let kept = repo.create(&sandbox("a", "/p/src")).await.unwrap();
        repo.begin_tx().await.unwrap().rollback().await.unwrap();
        assert!(repo.get(&kept.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_overlap_query_uses_reserved_root() {
        let repo = SqliteSandboxRepository::open_in_memory().unwrap();
        let request = CreateRequest::new("/P", "/P/src", "alice");
        let upper = Sandbox::creating(
            SandboxId::from("a"),
            &request,
            "/p/src".into(),
            "mock",
            "1",
            Utc::now(),
        )
        .with_reserved_root("/p");
        repo.create(&upper).await.unwrap();

        let holders = repo.check_scope_overlap("/p/src/lib", "/p", None).await.unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].project_root, "/P");
        assert!(repo
            .check_scope_overlap("/p/src/lib", "/P", None)
            .await
            .unwrap()
            .is_empty());
    }
}
