use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{code, ScriptError};
use crate::model::TaskUnit;
use crate::script::{ResultHandle, ScriptContext, ScriptRegistry};
use crate::session::{SessionGuard, SessionProvider, SessionSpec};
use crate::store::TaskResultStore;

/// Progress callback: `(scripts completed, scripts total)`.
pub type ProgressFn<'a> = dyn Fn(usize, usize) + Send + Sync + 'a;

/// Executes one unit end to end. The queue only knows this trait.
#[async_trait]
pub trait UnitRunner: Send + Sync {
    async fn run(&self, unit: &TaskUnit, progress: &ProgressFn<'_>) -> Result<(), ScriptError>;
}

/// Default runner: one browser session per unit, scripts in order.
pub struct Worker {
    registry: Arc<ScriptRegistry>,
    sessions: Arc<dyn SessionProvider>,
    results: Arc<TaskResultStore>,
    base_dir: PathBuf,
}

impl Worker {
    pub fn new(
        registry: Arc<ScriptRegistry>,
        sessions: Arc<dyn SessionProvider>,
        results: Arc<TaskResultStore>,
        base_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            sessions,
            results,
            base_dir,
        }
    }

    /// Private browser profile directory of an account item.
    pub fn session_dir(&self, item_id: &str) -> PathBuf {
        self.base_dir.join("sessions").join(item_id)
    }

    async fn run_scripts(
        &self,
        unit: &TaskUnit,
        ctx: &ScriptContext,
        progress: &ProgressFn<'_>,
    ) -> Result<(), ScriptError> {
        let total = unit.scripts.len();
        for (i, path) in unit.scripts.iter().enumerate() {
            let script = self.registry.resolve(path).ok_or_else(|| {
                ScriptError::new(code::SCRIPT_NOT_FOUND, format!("script not found: {path}"))
            })?;
            debug!(unit = %unit.id, script = %path, "running script {}/{total}", i + 1);
            script.execute(ctx).await?;
            progress(i + 1, total);
        }
        Ok(())
    }
}

#[async_trait]
impl UnitRunner for Worker {
    async fn run(&self, unit: &TaskUnit, progress: &ProgressFn<'_>) -> Result<(), ScriptError> {
        let spec = SessionSpec {
            unit: unit.id.clone(),
            user_data_dir: self.session_dir(&unit.id.item_id),
            headless: unit.config.headless,
            proxy: unit.account.proxy.clone(),
            fingerprint: unit.account.fingerprint.clone(),
        };
        let guard = SessionGuard::new(self.sessions.open(spec).await?);
        info!(unit = %unit.id, session = guard.session().id(), "session opened");

        let ctx = ScriptContext {
            session: Arc::clone(guard.session()),
            account: Arc::clone(&unit.account),
            task_id: unit.id.task_id.clone(),
            project_id: unit.project_id.clone(),
            item_id: unit.id.item_id.clone(),
            user_id: unit.user_id.clone(),
            base_dir: self.base_dir.clone(),
            config: Arc::clone(&unit.config),
            results: ResultHandle::new(
                Arc::clone(&self.results),
                &unit.project_id,
                &unit.id.item_id,
            ),
        };

        let outcome = self.run_scripts(unit, &ctx, progress).await;
        drop(ctx);
        guard.close().await;
        outcome
    }
}
