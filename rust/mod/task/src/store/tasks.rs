use std::sync::Arc;

use autopilot_core::ServiceError;
use autopilot_sql::{Row, SQLStore, Value};

use super::{json_err, storage_err};
use crate::model::{Task, TaskListQuery, TaskStatus};

/// SQL schema for the tasks table. The full record lives in `data`; the
/// other columns are copies used for filtering and compare-and-swap.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id          TEXT PRIMARY KEY,
    data        TEXT NOT NULL,
    status      TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    machine_id  TEXT,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_task_user ON tasks(user_id);
CREATE INDEX IF NOT EXISTS idx_task_machine ON tasks(machine_id, status);
";

/// Persistent storage for task records.
pub struct TaskStore {
    db: Arc<dyn SQLStore>,
}

impl TaskStore {
    /// Create a new TaskStore and initialise the schema.
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        db.exec_batch(SCHEMA)
            .map_err(|e| ServiceError::Storage(format!("task schema init: {e}")))?;
        Ok(Self { db })
    }

    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    /// Insert a new task.
    pub fn create(&self, task: &Task) -> Result<(), ServiceError> {
        let data = serde_json::to_string(task).map_err(|e| ServiceError::Internal(e.to_string()))?;

        self.db
            .exec(
                "INSERT INTO tasks (id, data, status, user_id, machine_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                &[
                    task.id.clone().into(),
                    data.into(),
                    task.status.as_str().into(),
                    task.user_id.clone().into(),
                    task.machine_id.clone().into(),
                    task.created_at.clone().into(),
                ],
            )
            .map_err(storage_err)?;

        Ok(())
    }

    /// Get a task by ID.
    pub fn get(&self, id: &str) -> Result<Task, ServiceError> {
        let rows = self
            .db
            .query("SELECT data FROM tasks WHERE id = ?1", &[id.into()])
            .map_err(storage_err)?;

        let row = rows
            .first()
            .ok_or_else(|| ServiceError::NotFound(format!("task {id}")))?;

        row_to_task(row)
    }

    /// Move a task to a new state if its current status is one of `from`.
    ///
    /// `apply` mutates a copy of the stored record; the write only lands if
    /// the status column still holds the value that was read (CAS). Returns
    /// `None` when the task was not in an allowed state or another writer
    /// got there first.
    pub fn transition(
        &self,
        id: &str,
        from: &[TaskStatus],
        apply: impl FnOnce(&mut Task),
    ) -> Result<Option<Task>, ServiceError> {
        let current = self.get(id)?;
        if !from.contains(&current.status) {
            return Ok(None);
        }

        let mut next = current.clone();
        apply(&mut next);
        let data = serde_json::to_string(&next).map_err(|e| ServiceError::Internal(e.to_string()))?;

        let affected = self
            .db
            .exec(
                "UPDATE tasks SET data = ?1, status = ?2, machine_id = ?3 \
                 WHERE id = ?4 AND status = ?5",
                &[
                    data.into(),
                    next.status.as_str().into(),
                    next.machine_id.clone().into(),
                    id.into(),
                    current.status.as_str().into(),
                ],
            )
            .map_err(storage_err)?;

        Ok((affected > 0).then_some(next))
    }

    // -----------------------------------------------------------------------
    // List / Query
    // -----------------------------------------------------------------------

    /// List tasks with optional filters, newest first.
    pub fn list(&self, query: &TaskListQuery) -> Result<Vec<Task>, ServiceError> {
        let mut where_clauses: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        if let Some(ref u) = query.user_id {
            params.push(u.clone().into());
            where_clauses.push(format!("user_id = ?{}", params.len()));
        }
        if let Some(s) = query.status {
            params.push(s.as_str().into());
            where_clauses.push(format!("status = ?{}", params.len()));
        }
        if let Some(ref m) = query.machine_id {
            params.push(m.clone().into());
            where_clauses.push(format!("machine_id = ?{}", params.len()));
        }

        let where_sql = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        params.push((query.limit.unwrap_or(100) as i64).into());
        let sql = format!(
            "SELECT data FROM tasks {where_sql} ORDER BY created_at DESC LIMIT ?{}",
            params.len()
        );

        let rows = self.db.query(&sql, &params).map_err(storage_err)?;
        rows.iter().map(row_to_task).collect()
    }

    /// RUNNING tasks owned by the given host (crash recovery).
    pub fn running_on(&self, machine_id: &str) -> Result<Vec<Task>, ServiceError> {
        self.list(&TaskListQuery {
            status: Some(TaskStatus::Running),
            machine_id: Some(machine_id.to_string()),
            limit: Some(i64::MAX as usize),
            ..Default::default()
        })
    }
}

/// Deserialize a Task from a row's `data` JSON column.
fn row_to_task(row: &Row) -> Result<Task, ServiceError> {
    let json = row
        .get_str("data")
        .ok_or_else(|| ServiceError::Storage("missing data column".into()))?;
    serde_json::from_str(json).map_err(json_err)
}
