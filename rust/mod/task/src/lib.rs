pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod queue;
pub mod runlock;
pub mod script;
pub mod secrets;
pub mod session;
pub mod store;
pub mod worker;

use std::sync::Arc;

use tracing::{info, warn};

use autopilot_core::{EngineConfig, ServiceError};
use autopilot_sql::SQLStore;

pub use engine::{ReclaimReport, StartOutcome, TaskEngine};
pub use error::{code, ErrorDomain, ScriptError};
pub use script::{ResultHandle, Script, ScriptContext, ScriptRegistry};
pub use secrets::{AesGcmCipher, PlaintextCipher, SecretCipher};
pub use session::{BrowserSession, DirSessionProvider, SessionProvider, SessionSpec};

use store::Stores;
use worker::Worker;

/// The task module: account-pool automation engine.
///
/// Wires stores, secret cipher, worker and engine from one configuration.
/// When `reclaim_on_boot` is set, construction also cleans up after a crash
/// of this host before anything new can start. Runs still live in another
/// process on this host hold their run lock and are left alone.
pub struct TaskModule {
    engine: Arc<TaskEngine>,
}

impl TaskModule {
    pub fn new(
        db: Arc<dyn SQLStore>,
        config: &EngineConfig,
        registry: ScriptRegistry,
        sessions: Arc<dyn SessionProvider>,
    ) -> Result<Self, ServiceError> {
        let stores = Stores::open(db)?;

        let cipher: Arc<dyn SecretCipher> = match config.secret_key.as_deref() {
            Some(key) => Arc::new(
                AesGcmCipher::from_base64_key(key)
                    .map_err(|e| ServiceError::Config(format!("secret-key: {e}")))?,
            ),
            None => {
                warn!("no secret-key configured, account secrets are read as plaintext");
                Arc::new(PlaintextCipher)
            }
        };

        let worker = Worker::new(
            Arc::new(registry),
            sessions,
            Arc::clone(&stores.results),
            config.resolve_work_dir(),
        );
        let engine = TaskEngine::new(
            stores,
            cipher,
            Arc::new(worker),
            config.resolve_machine_id(),
        )
        .with_headless_override(config.headless)
        .with_run_locks(config.resolve_run_dir());
        let engine = Arc::new(engine);

        if config.reclaim_on_boot {
            let report = engine.reclaim_interrupted()?;
            if !report.tasks.is_empty() {
                info!(
                    tasks = report.tasks.len(),
                    logs = report.logs,
                    "reclaimed tasks interrupted by the last shutdown"
                );
            }
        }

        info!(machine = %engine.machine_id(), "task module ready");
        Ok(Self { engine })
    }

    /// Get a reference to the TaskEngine.
    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }
}
