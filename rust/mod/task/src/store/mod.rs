//! SQLite-backed persistence for tasks, unit logs, result documents and
//! account groups.
//!
//! Each store owns its tables and creates them on construction. All stores
//! share one `SQLStore` handle.

mod accounts;
mod logs;
mod results;
mod tasks;

pub use accounts::AccountStore;
pub use logs::{TaskLogStore, MAX_LOG_CHARS};
pub use results::TaskResultStore;
pub use tasks::TaskStore;

use std::sync::Arc;

use autopilot_core::ServiceError;
use autopilot_sql::{SQLError, SQLStore};

/// All engine stores over one database handle.
#[derive(Clone)]
pub struct Stores {
    pub tasks: Arc<TaskStore>,
    pub logs: Arc<TaskLogStore>,
    pub results: Arc<TaskResultStore>,
    pub accounts: Arc<AccountStore>,
}

impl Stores {
    pub fn open(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        Ok(Self {
            tasks: Arc::new(TaskStore::new(Arc::clone(&db))?),
            logs: Arc::new(TaskLogStore::new(Arc::clone(&db))?),
            results: Arc::new(TaskResultStore::new(Arc::clone(&db))?),
            accounts: Arc::new(AccountStore::new(db)?),
        })
    }
}

pub(crate) fn storage_err(e: SQLError) -> ServiceError {
    match e {
        SQLError::Constraint(msg) => ServiceError::Conflict(msg),
        other => ServiceError::Storage(other.to_string()),
    }
}

pub(crate) fn json_err(e: serde_json::Error) -> ServiceError {
    ServiceError::Storage(format!("bad stored json: {e}"))
}
