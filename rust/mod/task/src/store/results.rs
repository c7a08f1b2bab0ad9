use std::sync::Arc;

use autopilot_core::{merge_patch, new_id, now_rfc3339, ServiceError};
use autopilot_sql::{Row, SQLStore};

use super::{json_err, storage_err};
use crate::model::TaskResult;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS task_results (
    id          TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL,
    item_id     TEXT NOT NULL,
    data        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_result_key ON task_results(project_id, item_id, created_at);
";

/// Cross-run progress documents, one per (project, account item).
///
/// Should several rows exist for the same key, the most recently created
/// one is authoritative. Updates are a read-merge-write with no version
/// check: last writer wins.
pub struct TaskResultStore {
    db: Arc<dyn SQLStore>,
}

impl TaskResultStore {
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        db.exec_batch(SCHEMA)
            .map_err(|e| ServiceError::Storage(format!("task result schema init: {e}")))?;
        Ok(Self { db })
    }

    /// The latest document for the key, if any.
    pub fn latest(
        &self,
        project_id: &str,
        item_id: &str,
    ) -> Result<Option<TaskResult>, ServiceError> {
        let rows = self
            .db
            .query(
                "SELECT id, project_id, item_id, data, created_at, updated_at \
                 FROM task_results WHERE project_id = ?1 AND item_id = ?2 \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                &[project_id.into(), item_id.into()],
            )
            .map_err(storage_err)?;
        rows.first().map(row_to_result).transpose()
    }

    /// Deep-merge `patch` into the latest document (creating it if absent)
    /// and return the merged document.
    pub fn merge(
        &self,
        project_id: &str,
        item_id: &str,
        patch: &serde_json::Value,
    ) -> Result<serde_json::Value, ServiceError> {
        let now = now_rfc3339();

        match self.latest(project_id, item_id)? {
            Some(existing) => {
                let mut data = existing.data;
                merge_patch(&mut data, patch);
                let text = serde_json::to_string(&data)
                    .map_err(|e| ServiceError::Internal(e.to_string()))?;
                self.db
                    .exec(
                        "UPDATE task_results SET data = ?1, updated_at = ?2 WHERE id = ?3",
                        &[text.into(), now.into(), existing.id.into()],
                    )
                    .map_err(storage_err)?;
                Ok(data)
            }
            None => {
                let mut data = serde_json::Value::Object(serde_json::Map::new());
                merge_patch(&mut data, patch);
                let text = serde_json::to_string(&data)
                    .map_err(|e| ServiceError::Internal(e.to_string()))?;
                self.db
                    .exec(
                        "INSERT INTO task_results \
                         (id, project_id, item_id, data, created_at, updated_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                        &[
                            new_id().into(),
                            project_id.into(),
                            item_id.into(),
                            text.into(),
                            now.into(),
                        ],
                    )
                    .map_err(storage_err)?;
                Ok(data)
            }
        }
    }
}

fn row_to_result(row: &Row) -> Result<TaskResult, ServiceError> {
    let text = |name: &str| {
        row.get_string(name)
            .ok_or_else(|| ServiceError::Storage(format!("task result: missing {name}")))
    };
    Ok(TaskResult {
        id: text("id")?,
        project_id: text("project_id")?,
        item_id: text("item_id")?,
        data: serde_json::from_str(&text("data")?).map_err(json_err)?,
        created_at: text("created_at")?,
        updated_at: text("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopilot_sql::SqliteStore;
    use serde_json::json;

    fn test_store() -> TaskResultStore {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        TaskResultStore::new(db).unwrap()
    }

    #[test]
    fn merge_creates_then_deep_merges() {
        let store = test_store();
        assert!(store.latest("p1", "i1").unwrap().is_none());

        store.merge("p1", "i1", &json!({"a": {"y": true}})).unwrap();
        let merged = store.merge("p1", "i1", &json!({"a": {"x": true}})).unwrap();
        assert_eq!(merged, json!({"a": {"x": true, "y": true}}));

        let stored = store.latest("p1", "i1").unwrap().unwrap();
        assert_eq!(stored.data, json!({"a": {"x": true, "y": true}}));
    }

    #[test]
    fn documents_are_scoped_by_project_and_item() {
        let store = test_store();
        store.merge("p1", "i1", &json!({"n": 1})).unwrap();
        store.merge("p2", "i1", &json!({"n": 2})).unwrap();
        store.merge("p1", "i2", &json!({"n": 3})).unwrap();

        assert_eq!(store.latest("p1", "i1").unwrap().unwrap().data["n"], 1);
        assert_eq!(store.latest("p2", "i1").unwrap().unwrap().data["n"], 2);
        assert_eq!(store.latest("p1", "i2").unwrap().unwrap().data["n"], 3);
    }

    #[test]
    fn latest_row_by_creation_wins() {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        let store = TaskResultStore::new(db.clone()).unwrap();
        for (id, created, data) in [
            ("old", "2026-01-01T00:00:00.000000Z", r#"{"v":"old"}"#),
            ("new", "2026-02-01T00:00:00.000000Z", r#"{"v":"new"}"#),
        ] {
            db.exec(
                "INSERT INTO task_results (id, project_id, item_id, data, created_at, updated_at) \
                 VALUES (?1, 'p', 'i', ?2, ?3, ?3)",
                &[id.into(), data.into(), created.into()],
            )
            .unwrap();
        }

        assert_eq!(store.latest("p", "i").unwrap().unwrap().id, "new");
        store.merge("p", "i", &json!({"w": 1})).unwrap();
        let rows = db
            .query("SELECT data FROM task_results WHERE id = 'old'", &[])
            .unwrap();
        assert_eq!(rows[0].get_str("data"), Some(r#"{"v":"old"}"#));
        assert_eq!(
            store.latest("p", "i").unwrap().unwrap().data,
            json!({"v": "new", "w": 1})
        );
    }
}
