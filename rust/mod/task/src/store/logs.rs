use std::sync::Arc;

use autopilot_core::{now_rfc3339, ServiceError};
use autopilot_sql::{Row, SQLStore, Value};

use super::storage_err;
use crate::model::{TaskLog, TaskStatus, UnitId};

/// The rolling log keeps at most this many trailing characters.
pub const MAX_LOG_CHARS: i64 = 64 * 1024;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS task_logs (
    id             TEXT PRIMARY KEY,
    task_id        TEXT NOT NULL,
    item_id        TEXT NOT NULL,
    status         TEXT NOT NULL,
    log            TEXT NOT NULL DEFAULT '',
    error_code     INTEGER,
    error_message  TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    UNIQUE (task_id, item_id)
);
CREATE INDEX IF NOT EXISTS idx_task_log_status ON task_logs(task_id, status);
";

const COLUMNS: &str =
    "id, task_id, item_id, status, log, error_code, error_message, created_at, updated_at";

/// Per-unit execution records: one row per (task, account item).
pub struct TaskLogStore {
    db: Arc<dyn SQLStore>,
}

impl TaskLogStore {
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        db.exec_batch(SCHEMA)
            .map_err(|e| ServiceError::Storage(format!("task log schema init: {e}")))?;
        Ok(Self { db })
    }

    /// Create a PENDING row for the unit unless one already exists.
    pub fn ensure(&self, unit: &UnitId) -> Result<(), ServiceError> {
        let now = now_rfc3339();
        self.db
            .exec(
                "INSERT OR IGNORE INTO task_logs \
                 (id, task_id, item_id, status, log, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, '', ?5, ?5)",
                &[
                    autopilot_core::new_id().into(),
                    unit.task_id.clone().into(),
                    unit.item_id.clone().into(),
                    TaskStatus::Pending.as_str().into(),
                    now.into(),
                ],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn get(&self, unit: &UnitId) -> Result<Option<TaskLog>, ServiceError> {
        let rows = self
            .db
            .query(
                &format!("SELECT {COLUMNS} FROM task_logs WHERE task_id = ?1 AND item_id = ?2"),
                &[unit.task_id.clone().into(), unit.item_id.clone().into()],
            )
            .map_err(storage_err)?;
        rows.first().map(row_to_log).transpose()
    }

    /// All rows of a task, in creation order.
    pub fn list(&self, task_id: &str) -> Result<Vec<TaskLog>, ServiceError> {
        let rows = self
            .db
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM task_logs WHERE task_id = ?1 \
                     ORDER BY created_at ASC, rowid ASC"
                ),
                &[task_id.into()],
            )
            .map_err(storage_err)?;
        rows.iter().map(row_to_log).collect()
    }

    /// Item ids of a task whose row is in `status`.
    pub fn items_with_status(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<Vec<String>, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT item_id FROM task_logs WHERE task_id = ?1 AND status = ?2 \
                 ORDER BY created_at ASC, rowid ASC",
                &[task_id.into(), status.as_str().into()],
            )
            .map_err(storage_err)?;
        Ok(rows.iter().filter_map(|r| r.get_string("item_id")).collect())
    }

    // -----------------------------------------------------------------------
    // Lifecycle writes
    // -----------------------------------------------------------------------

    /// Append a line without touching the status.
    pub fn append(&self, unit: &UnitId, line: &str) -> Result<(), ServiceError> {
        self.write(unit, None, line, ErrorFields::Keep)
    }

    /// RUNNING; clears errors left by a previous run of the same item.
    pub fn mark_running(&self, unit: &UnitId, line: &str) -> Result<(), ServiceError> {
        self.write(unit, Some(TaskStatus::Running), line, ErrorFields::Clear)
    }

    pub fn mark_completed(&self, unit: &UnitId, line: &str) -> Result<(), ServiceError> {
        self.write(unit, Some(TaskStatus::Completed), line, ErrorFields::Keep)
    }

    pub fn mark_failed(
        &self,
        unit: &UnitId,
        code: i64,
        message: &str,
        line: &str,
    ) -> Result<(), ServiceError> {
        self.write(
            unit,
            Some(TaskStatus::Failed),
            line,
            ErrorFields::Set(code, message),
        )
    }

    /// Move every RUNNING row of a task to STOPPED with the given error.
    /// Returns the number of rows changed.
    pub fn stop_running(
        &self,
        task_id: &str,
        code: i64,
        message: &str,
        line: &str,
    ) -> Result<u64, ServiceError> {
        self.db
            .exec(
                "UPDATE task_logs SET status = ?1, error_code = ?2, error_message = ?3, \
                 log = substr(log || ?4, -?5), updated_at = ?6 \
                 WHERE task_id = ?7 AND status = ?8",
                &[
                    TaskStatus::Stopped.as_str().into(),
                    code.into(),
                    message.into(),
                    format_line(line).into(),
                    MAX_LOG_CHARS.into(),
                    now_rfc3339().into(),
                    task_id.into(),
                    TaskStatus::Running.as_str().into(),
                ],
            )
            .map_err(storage_err)
    }

    fn write(
        &self,
        unit: &UnitId,
        status: Option<TaskStatus>,
        line: &str,
        errors: ErrorFields<'_>,
    ) -> Result<(), ServiceError> {
        let mut params: Vec<Value> = vec![
            unit.task_id.clone().into(),
            unit.item_id.clone().into(),
            format_line(line).into(),
            MAX_LOG_CHARS.into(),
            now_rfc3339().into(),
        ];
        let mut sets = vec![
            "log = substr(log || ?3, -?4)".to_string(),
            "updated_at = ?5".to_string(),
        ];
        let mut bind = |sets: &mut Vec<String>, column: &str, value: Value| {
            params.push(value);
            sets.push(format!("{column} = ?{}", params.len()));
        };

        if let Some(status) = status {
            bind(&mut sets, "status", status.as_str().into());
        }
        match errors {
            ErrorFields::Keep => {}
            ErrorFields::Clear => {
                sets.push("error_code = NULL".to_string());
                sets.push("error_message = NULL".to_string());
            }
            ErrorFields::Set(code, message) => {
                bind(&mut sets, "error_code", code.into());
                bind(&mut sets, "error_message", message.into());
            }
        }

        let sql = format!(
            "UPDATE task_logs SET {} WHERE task_id = ?1 AND item_id = ?2",
            sets.join(", ")
        );
        let affected = self.db.exec(&sql, &params).map_err(storage_err)?;
        if affected == 0 {
            return Err(ServiceError::NotFound(format!("task log {unit}")));
        }
        Ok(())
    }
}

enum ErrorFields<'a> {
    Keep,
    Clear,
    Set(i64, &'a str),
}

fn format_line(text: &str) -> String {
    format!("[{}] {}\n", now_rfc3339(), text)
}

fn row_to_log(row: &Row) -> Result<TaskLog, ServiceError> {
    let text = |name: &str| {
        row.get_string(name)
            .ok_or_else(|| ServiceError::Storage(format!("task log: missing {name}")))
    };
    let status = text("status")?;
    Ok(TaskLog {
        id: text("id")?,
        task_id: text("task_id")?,
        item_id: text("item_id")?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| ServiceError::Storage(format!("task log: bad status {status}")))?,
        log: row.get_string("log").unwrap_or_default(),
        error_code: row.get_i64("error_code"),
        error_message: row.get_string("error_message"),
        created_at: text("created_at")?,
        updated_at: text("updated_at")?,
    })
}
