//! Script contract, registry and the built-in scripts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use autopilot_core::now_rfc3339;

use crate::error::ScriptError;
use crate::model::{AccountDetail, TaskConfig};
use crate::session::BrowserSession;
use crate::store::TaskResultStore;

/// One step of a unit's pipeline.
///
/// Scripts run strictly in the order the task lists them, all inside the
/// same browser session. Returning `Err` aborts the remaining scripts of
/// the unit.
#[async_trait]
pub trait Script: Send + Sync {
    async fn execute(&self, ctx: &ScriptContext) -> Result<Value, ScriptError>;
}

/// Everything a script can see while it runs.
pub struct ScriptContext {
    pub session: Arc<dyn BrowserSession>,
    /// Decrypted resource bundle of the account item.
    pub account: Arc<AccountDetail>,
    pub task_id: String,
    pub project_id: String,
    pub item_id: String,
    pub user_id: String,
    /// Engine working directory; sessions live under `sessions/` here.
    pub base_dir: PathBuf,
    pub config: Arc<TaskConfig>,
    /// This item's cross-run progress document.
    pub results: ResultHandle,
}

// ---------------------------------------------------------------------------
// ResultHandle
// ---------------------------------------------------------------------------

/// Scoped access to the (project, item) result document.
#[derive(Clone)]
pub struct ResultHandle {
    store: Arc<TaskResultStore>,
    project_id: String,
    item_id: String,
}

impl ResultHandle {
    pub fn new(store: Arc<TaskResultStore>, project_id: &str, item_id: &str) -> Self {
        Self {
            store,
            project_id: project_id.to_string(),
            item_id: item_id.to_string(),
        }
    }

    /// Current document, `{}` when nothing was recorded yet.
    pub fn latest(&self) -> Result<Value, ScriptError> {
        Ok(self
            .store
            .latest(&self.project_id, &self.item_id)?
            .map(|r| r.data)
            .unwrap_or_else(|| json!({})))
    }

    /// Deep-merge `patch` into the document and return the result.
    pub fn merge(&self, patch: Value) -> Result<Value, ScriptError> {
        Ok(self.store.merge(&self.project_id, &self.item_id, &patch)?)
    }

    pub fn is_step_done(&self, step: &str) -> Result<bool, ScriptError> {
        let doc = self.latest()?;
        Ok(doc["steps"][step].as_bool().unwrap_or(false))
    }

    pub fn mark_step_done(&self, step: &str) -> Result<(), ScriptError> {
        self.merge(json!({ "steps": { step: true } }))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptRegistry
// ---------------------------------------------------------------------------

pub type ScriptFactory = Arc<dyn Fn() -> Box<dyn Script> + Send + Sync>;

/// Compile-time table of scripts, keyed by normalized path.
///
/// Paths are matched after normalization: surrounding whitespace trimmed,
/// backslashes turned into slashes, leading `./` and `/` dropped and the
/// file extension removed. `"./daily/checkin.js"` and `"daily/checkin"`
/// name the same script.
#[derive(Default)]
pub struct ScriptRegistry {
    factories: HashMap<String, ScriptFactory>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `builtin/noop` and `builtin/touch-profile`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("builtin/noop", || Box::new(NoopScript));
        registry.register("builtin/touch-profile", || Box::new(TouchProfileScript));
        registry
    }

    /// Register a factory. A later registration for the same path wins.
    pub fn register<F>(&mut self, path: &str, factory: F)
    where
        F: Fn() -> Box<dyn Script> + Send + Sync + 'static,
    {
        let key = normalize_path(path);
        debug!(path = %key, "script registered");
        self.factories.insert(key, Arc::new(factory));
    }

    /// Fresh instance of the script at `path`, if registered.
    pub fn resolve(&self, path: &str) -> Option<Box<dyn Script>> {
        self.factories.get(&normalize_path(path)).map(|f| f())
    }

}

pub fn normalize_path(path: &str) -> String {
    let mut p = path.trim().replace('\\', "/");
    loop {
        if let Some(rest) = p.strip_prefix("./") {
            p = rest.to_string();
        } else if let Some(rest) = p.strip_prefix('/') {
            p = rest.to_string();
        } else {
            break;
        }
    }
    let name_start = p.rfind('/').map(|i| i + 1).unwrap_or(0);
    if let Some(dot) = p[name_start..].rfind('.') {
        if dot > 0 {
            p.truncate(name_start + dot);
        }
    }
    p
}

// ---------------------------------------------------------------------------
// Resumable
// ---------------------------------------------------------------------------

/// Runs `inner` only if `step` is not yet marked done in the item's result
/// document, and marks it done after a successful run. Lets a re-run of a
/// failed task pick up where the previous one stopped.
pub struct Resumable<S> {
    step: String,
    inner: S,
}

impl<S: Script> Resumable<S> {
    pub fn new(step: impl Into<String>, inner: S) -> Self {
        Self {
            step: step.into(),
            inner,
        }
    }
}

#[async_trait]
impl<S: Script> Script for Resumable<S> {
    async fn execute(&self, ctx: &ScriptContext) -> Result<Value, ScriptError> {
        if ctx.results.is_step_done(&self.step)? {
            debug!(item = %ctx.item_id, step = %self.step, "step already done, skipping");
            return Ok(json!({ "skipped": true, "step": self.step }));
        }
        let value = self.inner.execute(ctx).await?;
        ctx.results.mark_step_done(&self.step)?;
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

pub struct NoopScript;

#[async_trait]
impl Script for NoopScript {
    async fn execute(&self, _ctx: &ScriptContext) -> Result<Value, ScriptError> {
        Ok(Value::Null)
    }
}

/// Stamps the item's result document with the time and task of this run.
pub struct TouchProfileScript;

#[async_trait]
impl Script for TouchProfileScript {
    async fn execute(&self, ctx: &ScriptContext) -> Result<Value, ScriptError> {
        ctx.results.merge(json!({
            "lastRunAt": now_rfc3339(),
            "lastTaskId": ctx.task_id,
        }))
    }
}
