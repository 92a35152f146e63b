//! SQLite-based store implementation

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, warn};
use vmexpire_api::{Page, Task, VmRecord, VmStatus};
use vmexpire_util::{ProjectId, TaskId, VmId};

use crate::{AuditEvent, QueuedTask, Store, StoreError, StoreResult, TaskQueue};

const VM_COLUMNS: &str = "vm_id, project_id, created_at, expires_at, notified_at, extend_count, \
     extended_days, status, excluded, due_at, version, updated_at";

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            r#"
            -- Tracked VMs
            CREATE TABLE IF NOT EXISTS vm_records (
                vm_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                notified_at TEXT,
                extend_count INTEGER NOT NULL DEFAULT 0,
                extended_days INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                excluded INTEGER NOT NULL DEFAULT 0,
                due_at TEXT,
                version INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            -- Durable task queue
            CREATE TABLE IF NOT EXISTS task_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_json TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL,
                claimed_at TEXT
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_vm_due ON vm_records(due_at);
            CREATE INDEX IF NOT EXISTS idx_vm_project ON vm_records(project_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_task_state ON task_queue(state, id);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }
}

/// Fixed-width RFC 3339 so that string order is time order
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp '{}': {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Column values of one `vm_records` row, before conversion
struct VmRow {
    vm_id: String,
    project_id: String,
    created_at: String,
    expires_at: String,
    notified_at: Option<String>,
    extend_count: i64,
    extended_days: i64,
    status: String,
    excluded: bool,
    due_at: Option<String>,
    version: i64,
    updated_at: String,
}

impl VmRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            vm_id: row.get(0)?,
            project_id: row.get(1)?,
            created_at: row.get(2)?,
            expires_at: row.get(3)?,
            notified_at: row.get(4)?,
            extend_count: row.get(5)?,
            extended_days: row.get(6)?,
            status: row.get(7)?,
            excluded: row.get(8)?,
            due_at: row.get(9)?,
            version: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_record(self) -> StoreResult<VmRecord> {
        let status: VmStatus = self
            .status
            .parse()
            .map_err(|e: vmexpire_api::UnknownStatus| StoreError::Serialization(e.to_string()))?;

        Ok(VmRecord {
            vm_id: VmId::new(self.vm_id),
            project_id: ProjectId::new(self.project_id),
            created_at: parse_ts(&self.created_at)?,
            expires_at: parse_ts(&self.expires_at)?,
            notified_at: parse_opt_ts(self.notified_at)?,
            extend_count: self.extend_count as u32,
            extended_days: self.extended_days as u32,
            status,
            excluded: self.excluded,
            due_at: parse_opt_ts(self.due_at)?,
            version: self.version as u64,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

fn query_vms(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Vec<VmRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, VmRow::from_row)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?.into_record()?);
    }
    Ok(records)
}

impl Store for SqliteStore {
    fn insert_vm(&self, record: &VmRecord) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();

        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO vm_records ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                VM_COLUMNS
            ),
            params![
                record.vm_id.as_str(),
                record.project_id.as_str(),
                ts(record.created_at),
                ts(record.expires_at),
                record.notified_at.map(ts),
                record.extend_count,
                record.extended_days,
                record.status.as_str(),
                record.excluded,
                record.due_at.map(ts),
                record.version as i64,
                ts(record.updated_at),
            ],
        )?;

        if inserted == 0 {
            return Err(StoreError::AlreadyExists(record.vm_id.to_string()));
        }

        debug!(vm_id = %record.vm_id, project_id = %record.project_id, "VM record inserted");
        Ok(())
    }

    fn get_vm(&self, vm_id: &VmId) -> StoreResult<Option<VmRecord>> {
        let conn = self.conn.lock().unwrap();

        let row = conn
            .query_row(
                &format!("SELECT {} FROM vm_records WHERE vm_id = ?", VM_COLUMNS),
                [vm_id.as_str()],
                VmRow::from_row,
            )
            .optional()?;

        row.map(VmRow::into_record).transpose()
    }

    fn list_vms(&self, page: Page) -> StoreResult<Vec<VmRecord>> {
        let conn = self.conn.lock().unwrap();
        let page = page.clamped();

        query_vms(
            &conn,
            &format!(
                "SELECT {} FROM vm_records ORDER BY created_at, vm_id LIMIT ? OFFSET ?",
                VM_COLUMNS
            ),
            params![page.limit, page.offset],
        )
    }

    fn list_vms_by_project(
        &self,
        project_id: &ProjectId,
        page: Page,
    ) -> StoreResult<Vec<VmRecord>> {
        let conn = self.conn.lock().unwrap();
        let page = page.clamped();

        query_vms(
            &conn,
            &format!(
                "SELECT {} FROM vm_records WHERE project_id = ? \
                 ORDER BY created_at, vm_id LIMIT ? OFFSET ?",
                VM_COLUMNS
            ),
            params![project_id.as_str(), page.limit, page.offset],
        )
    }

    fn list_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<VmRecord>> {
        let conn = self.conn.lock().unwrap();

        query_vms(
            &conn,
            &format!(
                "SELECT {} FROM vm_records \
                 WHERE due_at IS NOT NULL AND due_at <= ?1 AND excluded = 0 \
                   AND status IN ('active', 'notified', 'expired') \
                 ORDER BY due_at LIMIT ?2",
                VM_COLUMNS
            ),
            params![ts(now), limit as i64],
        )
    }

    fn list_by_status(&self, status: VmStatus, limit: usize) -> StoreResult<Vec<VmRecord>> {
        let conn = self.conn.lock().unwrap();

        query_vms(
            &conn,
            &format!(
                "SELECT {} FROM vm_records WHERE status = ?1 ORDER BY updated_at LIMIT ?2",
                VM_COLUMNS
            ),
            params![status.as_str(), limit as i64],
        )
    }

    fn update_vm(&self, record: &VmRecord, expected_version: u64) -> StoreResult<VmRecord> {
        let conn = self.conn.lock().unwrap();
        let new_version = expected_version + 1;

        let updated = conn.execute(
            r#"
            UPDATE vm_records SET
                project_id = ?1,
                expires_at = ?2,
                notified_at = ?3,
                extend_count = ?4,
                extended_days = ?5,
                status = ?6,
                excluded = ?7,
                due_at = ?8,
                version = ?9,
                updated_at = ?10
            WHERE vm_id = ?11 AND version = ?12
            "#,
            params![
                record.project_id.as_str(),
                ts(record.expires_at),
                record.notified_at.map(ts),
                record.extend_count,
                record.extended_days,
                record.status.as_str(),
                record.excluded,
                record.due_at.map(ts),
                new_version as i64,
                ts(record.updated_at),
                record.vm_id.as_str(),
                expected_version as i64,
            ],
        )?;

        if updated == 0 {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT version FROM vm_records WHERE vm_id = ?",
                    [record.vm_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            return Err(match exists {
                Some(_) => StoreError::Conflict {
                    id: record.vm_id.to_string(),
                    expected: expected_version,
                },
                None => StoreError::NotFound(record.vm_id.to_string()),
            });
        }

        debug!(
            vm_id = %record.vm_id,
            status = %record.status,
            version = new_version,
            "VM record updated"
        );

        let mut stored = record.clone();
        stored.version = new_version;
        Ok(stored)
    }

    fn delete_vm(&self, vm_id: &VmId) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM vm_records WHERE vm_id = ?", [vm_id.as_str()])?;
        Ok(deleted > 0)
    }

    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
            params![ts(event.timestamp), event_json],
        )?;

        event.id = conn.last_insert_rowid();
        debug!(event_id = event.id, "Audit event appended");

        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let timestamp_str: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp_str, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp_str, event_json) = row?;
            let timestamp = parse_ts(&timestamp_str).unwrap_or_else(|_| vmexpire_util::now());
            let event: crate::AuditEventType = serde_json::from_str(&event_json)?;

            events.push(AuditEvent {
                id,
                timestamp,
                event,
            });
        }

        Ok(events)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}

impl TaskQueue for SqliteStore {
    fn enqueue(&self, task: &Task) -> StoreResult<TaskId> {
        let conn = self.conn.lock().unwrap();
        let task_json = serde_json::to_string(task)?;

        conn.execute(
            "INSERT INTO task_queue (task_json, enqueued_at) VALUES (?, ?)",
            params![task_json, ts(vmexpire_util::now())],
        )?;

        let id = TaskId::new(conn.last_insert_rowid());
        debug!(task_id = %id, task = task.kind(), vm_id = %task.vm_id(), "Task enqueued");
        Ok(id)
    }

    fn claim_next(&self) -> StoreResult<Option<QueuedTask>> {
        let conn = self.conn.lock().unwrap();

        let claimed = conn
            .query_row(
                r#"
                UPDATE task_queue
                SET state = 'claimed', attempts = attempts + 1, claimed_at = ?1
                WHERE id = (
                    SELECT id FROM task_queue WHERE state = 'pending' ORDER BY id LIMIT 1
                )
                RETURNING id, task_json, attempts, enqueued_at
                "#,
                [ts(vmexpire_util::now())],
                |row| {
                    let id: i64 = row.get(0)?;
                    let task_json: String = row.get(1)?;
                    let attempts: i64 = row.get(2)?;
                    let enqueued_at: String = row.get(3)?;
                    Ok((id, task_json, attempts, enqueued_at))
                },
            )
            .optional()?;

        let Some((id, task_json, attempts, enqueued_at)) = claimed else {
            return Ok(None);
        };

        Ok(Some(QueuedTask {
            id: TaskId::new(id),
            task: serde_json::from_str(&task_json)?,
            attempts: attempts as u32,
            enqueued_at: parse_ts(&enqueued_at)?,
        }))
    }

    fn ack(&self, id: TaskId) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM task_queue WHERE id = ?", [id.get()])?;
        Ok(())
    }

    fn release(&self, id: TaskId) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE task_queue SET state = 'pending', claimed_at = NULL WHERE id = ?",
            [id.get()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("task {}", id)));
        }
        Ok(())
    }

    fn requeue_claimed(&self) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE task_queue SET state = 'pending', claimed_at = NULL WHERE state = 'claimed'",
            [],
        )?;
        if count > 0 {
            warn!(count, "Requeued tasks left claimed by a previous run");
        }
        Ok(count)
    }

    fn list_pending(&self) -> StoreResult<Vec<QueuedTask>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT id, task_json, attempts, enqueued_at FROM task_queue \
             WHERE state = 'pending' ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let task_json: String = row.get(1)?;
            let attempts: i64 = row.get(2)?;
            let enqueued_at: String = row.get(3)?;
            Ok((id, task_json, attempts, enqueued_at))
        })?;

        let mut tasks = Vec::new();
        for row in rows {
            let (id, task_json, attempts, enqueued_at) = row?;
            tasks.push(QueuedTask {
                id: TaskId::new(id),
                task: serde_json::from_str(&task_json)?,
                attempts: attempts as u32,
                enqueued_at: parse_ts(&enqueued_at)?,
            });
        }
        Ok(tasks)
    }

    fn pending_count(&self) -> StoreResult<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM task_queue WHERE state = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
