use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use autopilot_core::{new_id, now_rfc3339, ServiceError};

use crate::error::code;
use crate::lifecycle::LifecycleReducer;
use crate::model::{
    AccountDetail, AccountGroupItem, EmailAccount, Fingerprint, NewTask, Proxy, ResourceKind,
    SocialAccount, Task, TaskConfig, TaskListQuery, TaskLog, TaskResult, TaskStatus, TaskUnit,
    UnitId, Wallet,
};
use crate::queue::{QueueEvent, TaskQueue};
use crate::runlock::{RunLock, RunLocks};
use crate::secrets::SecretCipher;
use crate::store::Stores;
use crate::worker::UnitRunner;

/// States a task can be (re)started from.
const STARTABLE: &[TaskStatus] = &[
    TaskStatus::Pending,
    TaskStatus::Completed,
    TaskStatus::Stopped,
    TaskStatus::Failed,
];

/// What a call to [`TaskEngine::start_task`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    /// A queue was built and is running `units` units.
    Started { units: usize },
    /// The task already had a live run; nothing changed.
    AlreadyRunning,
    /// No eligible account items; the task is now stopped.
    NothingToRun,
}

/// Result of crash recovery.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimReport {
    /// Tasks moved from running to stopped.
    pub tasks: Vec<String>,
    /// Unit logs moved from running to stopped.
    pub logs: u64,
}

/// A task running in this process. The run lock, when configured, is
/// released together with the queue.
struct LiveRun {
    queue: Arc<TaskQueue>,
    _lock: Option<RunLock>,
}

type QueueMap = HashMap<String, LiveRun>;

fn lock(queues: &Mutex<QueueMap>) -> MutexGuard<'_, QueueMap> {
    queues.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// TaskEngine
// ---------------------------------------------------------------------------

/// The task orchestrator.
///
/// It expands a task and its account groups into units, builds one queue
/// per running task and feeds the queue's events to the lifecycle
/// reducer. It also owns cancellation and recovery after a crash of this
/// host.
///
/// Task status is written only here and in the reducer.
pub struct TaskEngine {
    stores: Stores,
    cipher: Arc<dyn SecretCipher>,
    runner: Arc<dyn UnitRunner>,
    reducer: Arc<LifecycleReducer>,
    machine_id: String,
    /// Host-wide headless setting; beats the task's, loses to a start's.
    headless_override: Option<bool>,
    /// Live queues of this process, by task id.
    queues: Arc<Mutex<QueueMap>>,
    /// Per-task locks that tell other processes on this host a run is live.
    run_locks: Option<RunLocks>,
    /// Notify waiters when any task settles (used by `wait_settled`).
    notify: Arc<Notify>,
}

impl TaskEngine {
    pub fn new(
        stores: Stores,
        cipher: Arc<dyn SecretCipher>,
        runner: Arc<dyn UnitRunner>,
        machine_id: impl Into<String>,
    ) -> Self {
        let reducer = Arc::new(LifecycleReducer::new(
            Arc::clone(&stores.tasks),
            Arc::clone(&stores.logs),
        ));
        Self {
            stores,
            cipher,
            runner,
            reducer,
            machine_id: machine_id.into(),
            headless_override: None,
            queues: Arc::new(Mutex::new(HashMap::new())),
            run_locks: None,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn with_headless_override(mut self, headless: Option<bool>) -> Self {
        self.headless_override = headless;
        self
    }

    /// Hold a lock file per running task under `dir`, and let reclaim skip
    /// tasks whose lock another process still holds.
    pub fn with_run_locks(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.run_locks = Some(RunLocks::new(dir));
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Whether this process holds a live queue for the task.
    pub fn is_running_here(&self, task_id: &str) -> bool {
        lock(&self.queues).contains_key(task_id)
    }

    // =======================================================================
    // Creation
    // =======================================================================

    /// Create a task and a pending log row for every eligible account item.
    ///
    /// A task whose groups hold no items is still recorded, but as
    /// `failed`, so the caller can see why nothing will run.
    pub fn create_task(&self, req: NewTask) -> Result<Task, ServiceError> {
        if req.name.trim().is_empty() {
            return Err(ServiceError::Validation("task name is required".into()));
        }
        if req.thread_count == 0 {
            return Err(ServiceError::Validation(
                "thread count must be at least 1".into(),
            ));
        }
        if req.scripts.is_empty() {
            return Err(ServiceError::Validation(
                "at least one script is required".into(),
            ));
        }
        if req.account_group_ids.is_empty() {
            return Err(ServiceError::Validation(
                "at least one account group is required".into(),
            ));
        }

        let items = self.group_items(&req.user_id, &req.account_group_ids, None)?;
        let now = now_rfc3339();
        let mut task = Task {
            id: new_id(),
            name: req.name,
            user_id: req.user_id,
            project_id: req.project_id,
            thread_count: req.thread_count,
            account_group_ids: req.account_group_ids,
            scripts: req.scripts,
            headless: req.headless,
            params: req.params,
            status: TaskStatus::Pending,
            machine_id: None,
            error: None,
            created_at: now.clone(),
            started_at: None,
            ended_at: None,
        };

        if items.is_empty() {
            task.status = TaskStatus::Failed;
            task.error = Some("no eligible account items".into());
            task.ended_at = Some(now);
            self.stores.tasks.create(&task)?;
            warn!(task = %task.id, "task created without eligible account items");
            self.notify.notify_waiters();
            return Ok(task);
        }

        self.stores.tasks.create(&task)?;
        for item in &items {
            self.stores.logs.ensure(&UnitId::new(&task.id, &item.id))?;
        }
        info!(task = %task.id, items = items.len(), "task created");
        Ok(task)
    }

    // =======================================================================
    // Start / stop
    // =======================================================================

    /// Start (or re-run) a task on this host.
    ///
    /// `item_filter` narrows the run to the listed account items, e.g. the
    /// output of [`failed_items`](Self::failed_items). `headless` overrides
    /// the task's own setting for this run only.
    pub async fn start_task(
        &self,
        task_id: &str,
        user_id: &str,
        item_filter: Option<&[String]>,
        headless: Option<bool>,
    ) -> Result<StartOutcome, ServiceError> {
        let task = self.stores.tasks.get(task_id)?;
        check_owner(&task, user_id)?;
        if task.status == TaskStatus::Running || self.is_running_here(task_id) {
            debug!(task = %task_id, "start ignored: already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        let units = match self.build_units(&task, item_filter, headless) {
            Ok(units) => units,
            Err(e) => {
                warn!(task = %task_id, "start failed: {e}");
                self.force_stop(task_id, STARTABLE, &format!("start failed: {e}"));
                return Err(e);
            }
        };

        if units.is_empty() {
            let stopped = self.stores.tasks.transition(task_id, STARTABLE, |t| {
                t.status = TaskStatus::Stopped;
                t.error = Some("no eligible account items".into());
                t.ended_at = Some(now_rfc3339());
            })?;
            self.notify.notify_waiters();
            return Ok(match stopped {
                Some(_) => {
                    info!(task = %task_id, "nothing to run, task stopped");
                    StartOutcome::NothingToRun
                }
                None => StartOutcome::AlreadyRunning,
            });
        }

        let run_lock = match &self.run_locks {
            Some(locks) => match locks.try_acquire(task_id)? {
                Some(held) => Some(held),
                None => {
                    debug!(task = %task_id, "start ignored: run lock held by another process");
                    return Ok(StartOutcome::AlreadyRunning);
                }
            },
            None => None,
        };

        // Status flips to running together with the queue coming into
        // existence, before any unit can report.
        let (queue, events) = TaskQueue::new(
            task_id,
            task.thread_count as usize,
            Arc::clone(&self.runner),
        );
        let machine_id = self.machine_id.clone();
        let started = self.stores.tasks.transition(task_id, STARTABLE, |t| {
            t.status = TaskStatus::Running;
            t.machine_id = Some(machine_id);
            t.started_at = Some(now_rfc3339());
            t.ended_at = None;
            t.error = None;
        });
        match started {
            Ok(Some(_)) => {}
            Ok(None) => {
                queue.destroy();
                return Ok(StartOutcome::AlreadyRunning);
            }
            Err(e) => {
                queue.destroy();
                self.force_stop(task_id, STARTABLE, &format!("start failed: {e}"));
                return Err(e);
            }
        }

        lock(&self.queues).insert(
            task_id.to_string(),
            LiveRun {
                queue: Arc::clone(&queue),
                _lock: run_lock,
            },
        );
        self.spawn_consumer(task_id.to_string(), Arc::clone(&queue), events);

        let count = units.len();
        if let Err(e) = queue.add_bulk(units) {
            queue.destroy();
            lock(&self.queues).remove(task_id);
            self.force_stop(task_id, &[TaskStatus::Running], &format!("start failed: {e}"));
            return Err(e);
        }

        info!(
            task = %task_id,
            units = count,
            machine = %self.machine_id,
            "task started"
        );
        self.notify.notify_waiters();
        Ok(StartOutcome::Started { units: count })
    }

    /// Stop a running task immediately.
    ///
    /// The queue is destroyed: queued units never start and in-flight ones
    /// are abandoned without a completion or failure record. Their log
    /// rows stay `running` until the next reclaim.
    pub fn stop_task(&self, task_id: &str, user_id: &str) -> Result<Task, ServiceError> {
        let task = self.stores.tasks.get(task_id)?;
        check_owner(&task, user_id)?;
        if task.status != TaskStatus::Running {
            return Err(ServiceError::Validation(format!(
                "task {task_id} is not running (status: {})",
                task.status
            )));
        }

        let live = lock(&self.queues).remove(task_id);
        if let Some(live) = live {
            live.queue.destroy();
        }

        let stopped = self
            .stores
            .tasks
            .transition(task_id, &[TaskStatus::Running], |t| {
                t.status = TaskStatus::Stopped;
                t.error = Some("stopped by user".into());
                t.ended_at = Some(now_rfc3339());
            })?;
        self.notify.notify_waiters();

        let task = stopped.ok_or_else(|| {
            ServiceError::Validation(format!("task {task_id} is not running"))
        })?;
        info!(task = %task_id, "task stopped");
        Ok(task)
    }

    // =======================================================================
    // Crash recovery
    // =======================================================================

    /// Stop every task this host left running, along with their running
    /// unit logs. Tasks of other hosts are left alone, and so are tasks
    /// with a live queue in this process or, with run locks configured, in
    /// another process on this host.
    pub fn reclaim_interrupted(&self) -> Result<ReclaimReport, ServiceError> {
        let mut report = ReclaimReport::default();

        for task in self.stores.tasks.running_on(&self.machine_id)? {
            if self.is_running_here(&task.id) {
                continue;
            }
            // Held for the rest of the iteration so no one restarts the
            // task while it is being stopped.
            let _held = match &self.run_locks {
                Some(locks) => match locks.try_acquire(&task.id)? {
                    Some(held) => Some(held),
                    None => {
                        debug!(task = %task.id, "reclaim skipped: run is live in another process");
                        continue;
                    }
                },
                None => None,
            };
            let stopped = self
                .stores
                .tasks
                .transition(&task.id, &[TaskStatus::Running], |t| {
                    t.status = TaskStatus::Stopped;
                    t.error = Some("interrupted: host restarted".into());
                    t.ended_at = Some(now_rfc3339());
                })?;
            if stopped.is_none() {
                continue;
            }
            let logs = self.stores.logs.stop_running(
                &task.id,
                code::INTERRUPTED,
                "interrupted by host restart",
                "interrupted",
            )?;
            warn!(task = %task.id, logs, "reclaimed interrupted task");
            report.logs += logs;
            report.tasks.push(task.id);
        }

        if !report.tasks.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(report)
    }

    // =======================================================================
    // Query
    // =======================================================================

    pub fn get_task(&self, task_id: &str) -> Result<Task, ServiceError> {
        self.stores.tasks.get(task_id)
    }

    pub fn list_tasks(&self, query: &TaskListQuery) -> Result<Vec<Task>, ServiceError> {
        self.stores.tasks.list(query)
    }

    pub fn task_logs(&self, task_id: &str) -> Result<Vec<TaskLog>, ServiceError> {
        self.stores.logs.list(task_id)
    }

    /// Items whose last run of this task failed; feed back into
    /// `start_task` to retry just those.
    pub fn failed_items(&self, task_id: &str) -> Result<Vec<String>, ServiceError> {
        self.stores.logs.items_with_status(task_id, TaskStatus::Failed)
    }

    pub fn task_result(
        &self,
        project_id: &str,
        item_id: &str,
    ) -> Result<Option<TaskResult>, ServiceError> {
        self.stores.results.latest(project_id, item_id)
    }

    /// Long-poll: wait up to `timeout` for the task to leave `running`,
    /// then return its current state.
    pub async fn wait_settled(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Task, ServiceError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let task = self.stores.tasks.get(task_id)?;
            if task.status != TaskStatus::Running {
                return Ok(task);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.stores.tasks.get(task_id);
            }
        }
    }

    // =======================================================================
    // Internals
    // =======================================================================

    /// Items of the given groups, deduplicated and optionally filtered.
    /// Every group must exist and belong to `owner`.
    fn group_items(
        &self,
        owner: &str,
        group_ids: &[String],
        filter: Option<&[String]>,
    ) -> Result<Vec<AccountGroupItem>, ServiceError> {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        for group_id in group_ids {
            let group = self.stores.accounts.get_group(group_id)?;
            if group.user_id != owner {
                return Err(ServiceError::PermissionDenied(format!(
                    "account group {group_id} belongs to another user"
                )));
            }
            for item in self.stores.accounts.items_in_group(group_id)? {
                if filter.is_some_and(|f| !f.contains(&item.id)) {
                    continue;
                }
                if seen.insert(item.id.clone()) {
                    items.push(item);
                }
            }
        }
        Ok(items)
    }

    /// One unit per item that resolves cleanly. Group lookups are fatal;
    /// a broken item is logged and skipped.
    fn build_units(
        &self,
        task: &Task,
        item_filter: Option<&[String]>,
        headless: Option<bool>,
    ) -> Result<Vec<TaskUnit>, ServiceError> {
        let items = self.group_items(&task.user_id, &task.account_group_ids, item_filter)?;
        let config = Arc::new(TaskConfig {
            thread_count: task.thread_count,
            headless: headless
                .or(self.headless_override)
                .unwrap_or(task.headless),
            params: task.params.clone(),
        });
        let scripts = Arc::new(task.scripts.clone());

        let mut units = Vec::with_capacity(items.len());
        for item in items {
            match self.resolve_account(&task.user_id, &item) {
                Ok(account) => units.push(TaskUnit {
                    id: UnitId::new(&task.id, &item.id),
                    user_id: task.user_id.clone(),
                    project_id: task.project_id.clone(),
                    account: Arc::new(account),
                    scripts: Arc::clone(&scripts),
                    config: Arc::clone(&config),
                }),
                Err(e) => warn!(task = %task.id, item = %item.id, "skipping account item: {e}"),
            }
        }
        Ok(units)
    }

    /// Load an item's linked resources and decrypt their secrets. Every
    /// resource must belong to `owner`.
    fn resolve_account(
        &self,
        owner: &str,
        item: &AccountGroupItem,
    ) -> Result<AccountDetail, ServiceError> {
        let accounts = &self.stores.accounts;
        let mut detail = AccountDetail {
            item_id: item.id.clone(),
            group_id: item.group_id.clone(),
            ..Default::default()
        };

        if let Some(id) = &item.social_id {
            let mut social: SocialAccount =
                accounts.get_resource(ResourceKind::Social, id, owner)?;
            social.password = self.decrypt(&social.password)?;
            detail.social = Some(social);
        }
        if let Some(id) = &item.email_id {
            let mut email: EmailAccount = accounts.get_resource(ResourceKind::Email, id, owner)?;
            email.password = self.decrypt(&email.password)?;
            detail.email = Some(email);
        }
        if let Some(id) = &item.wallet_id {
            let mut wallet: Wallet = accounts.get_resource(ResourceKind::Wallet, id, owner)?;
            wallet.private_key = self.decrypt(&wallet.private_key)?;
            detail.wallet = Some(wallet);
        }
        if let Some(id) = &item.proxy_id {
            let proxy: Proxy = accounts.get_resource(ResourceKind::Proxy, id, owner)?;
            detail.proxy = Some(proxy);
        }
        if let Some(id) = &item.fingerprint_id {
            let fingerprint: Fingerprint =
                accounts.get_resource(ResourceKind::Fingerprint, id, owner)?;
            detail.fingerprint = Some(fingerprint);
        }
        Ok(detail)
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, ServiceError> {
        self.cipher
            .decrypt(ciphertext)
            .map_err(|e| ServiceError::Internal(format!("decrypt secret: {e}")))
    }

    /// Best-effort move to `stopped` after a failed start.
    fn force_stop(&self, task_id: &str, from: &[TaskStatus], reason: &str) {
        let result = self.stores.tasks.transition(task_id, from, |t| {
            t.status = TaskStatus::Stopped;
            t.error = Some(reason.to_string());
            t.ended_at = Some(now_rfc3339());
        });
        match result {
            Ok(_) => self.notify.notify_waiters(),
            Err(e) => warn!(task = %task_id, "force stop failed: {e}"),
        }
    }

    /// Feed one queue's events to the reducer until it drains or is
    /// destroyed.
    fn spawn_consumer(
        &self,
        task_id: String,
        queue: Arc<TaskQueue>,
        mut events: mpsc::UnboundedReceiver<QueueEvent>,
    ) {
        let reducer = Arc::clone(&self.reducer);
        let queues = Arc::clone(&self.queues);
        let notify = Arc::clone(&self.notify);
        let cancel = queue.cancel_token();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                reducer.apply(&event);

                if matches!(event, QueueEvent::Drained { .. }) {
                    {
                        let mut map = lock(&queues);
                        if map
                            .get(&task_id)
                            .is_some_and(|live| Arc::ptr_eq(&live.queue, &queue))
                        {
                            map.remove(&task_id);
                        }
                    }
                    notify.notify_waiters();
                    break;
                }
            }
            debug!(task = %task_id, "lifecycle consumer finished");
        });
    }
}

fn check_owner(task: &Task, user_id: &str) -> Result<(), ServiceError> {
    if task.user_id != user_id {
        return Err(ServiceError::PermissionDenied(format!(
            "task {} belongs to another user",
            task.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScriptError;
    use crate::model::AccountGroup;
    use crate::script::{Script, ScriptContext, ScriptRegistry};
    use crate::secrets::{AesGcmCipher, PlaintextCipher};
    use crate::session::{BrowserSession, SessionProvider, SessionSpec};
    use crate::worker::Worker;
    use async_trait::async_trait;
    use autopilot_sql::{SQLStore, SqliteStore};
    use serde_json::{json, Value};
    use std::any::Any;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    // --- fakes ---

    /// Counts sessions that are open at the same time.
    #[derive(Default)]
    struct GaugeProvider {
        open: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        opened: AtomicUsize,
    }

    struct GaugeSession {
        open: Arc<AtomicUsize>,
        dir: PathBuf,
    }

    #[async_trait]
    impl BrowserSession for GaugeSession {
        fn id(&self) -> &str {
            "gauge"
        }
        fn user_data_dir(&self) -> &Path {
            &self.dir
        }
        async fn close(&self) -> Result<(), ScriptError> {
            self.open.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[async_trait]
    impl SessionProvider for GaugeProvider {
        async fn open(&self, spec: SessionSpec) -> Result<Arc<dyn BrowserSession>, ScriptError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            Ok(Arc::new(GaugeSession {
                open: Arc::clone(&self.open),
                dir: spec.user_data_dir,
            }))
        }
    }

    struct Sleep(u64);

    #[async_trait]
    impl Script for Sleep {
        async fn execute(&self, _ctx: &ScriptContext) -> Result<Value, ScriptError> {
            tokio::time::sleep(Duration::from_millis(self.0)).await;
            Ok(Value::Null)
        }
    }

    /// Records `"<item>:<name>"` for every run.
    struct Trace {
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Script for Trace {
        async fn execute(&self, ctx: &ScriptContext) -> Result<Value, ScriptError> {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}", ctx.item_id, self.name));
            Ok(Value::Null)
        }
    }

    /// Fails for item `i2` only.
    struct FailOnI2;

    #[async_trait]
    impl Script for FailOnI2 {
        async fn execute(&self, ctx: &ScriptContext) -> Result<Value, ScriptError> {
            if ctx.item_id == "i2" {
                return Err(ScriptError::social_auth("captcha"));
            }
            Ok(Value::Null)
        }
    }

    struct CaptureKey(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Script for CaptureKey {
        async fn execute(&self, ctx: &ScriptContext) -> Result<Value, ScriptError> {
            let key = ctx
                .account
                .wallet
                .as_ref()
                .map(|w| w.private_key.clone())
                .unwrap_or_default();
            self.0.lock().unwrap().push(key);
            Ok(Value::Null)
        }
    }

    // --- harness ---

    struct Harness {
        engine: Arc<TaskEngine>,
        db: Arc<dyn SQLStore>,
        cipher: Arc<dyn SecretCipher>,
        provider: Arc<GaugeProvider>,
        seen: Arc<Mutex<Vec<String>>>,
        dir: tempfile::TempDir,
    }

    fn harness_with(cipher: Arc<dyn SecretCipher>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db: Arc<dyn SQLStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let stores = Stores::open(Arc::clone(&db)).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut registry = ScriptRegistry::with_builtins();
        registry.register("test/sleep", || Box::new(Sleep(30)));
        registry.register("test/hang", || Box::new(Sleep(60_000)));
        registry.register("test/fail-i2", || Box::new(FailOnI2));
        for name in ["one", "two"] {
            let seen = Arc::clone(&seen);
            registry.register(&format!("test/{name}"), move || {
                Box::new(Trace {
                    name,
                    seen: Arc::clone(&seen),
                })
            });
        }
        {
            let seen = Arc::clone(&seen);
            registry.register("test/capture-key", move || {
                Box::new(CaptureKey(Arc::clone(&seen)))
            });
        }

        let provider = Arc::new(GaugeProvider::default());
        let worker = Worker::new(
            Arc::new(registry),
            Arc::clone(&provider) as Arc<dyn SessionProvider>,
            Arc::clone(&stores.results),
            dir.path().to_path_buf(),
        );
        let engine = Arc::new(TaskEngine::new(
            stores,
            Arc::clone(&cipher),
            Arc::new(worker),
            "host-a",
        )
        .with_run_locks(dir.path().join("run")));
        Harness {
            engine,
            db,
            cipher,
            provider,
            seen,
            dir,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(PlaintextCipher))
    }

    impl Harness {
        /// Group `g1` owned by `u1` holding items `i1..=n`, each with a wallet.
        fn seed(&self, n: usize) {
            let accounts = &self.engine.stores().accounts;
            accounts
                .create_group(&AccountGroup {
                    id: "g1".into(),
                    name: "farm".into(),
                    user_id: "u1".into(),
                    created_at: now_rfc3339(),
                })
                .unwrap();
            for i in 1..=n {
                let wallet = Wallet {
                    id: format!("w{i}"),
                    address: format!("0x{i:040}"),
                    private_key: self.cipher.encrypt(&format!("pk-{i}")).unwrap(),
                };
                accounts
                    .put_resource(ResourceKind::Wallet, &wallet.id, "u1", &wallet)
                    .unwrap();
                accounts
                    .create_item(&AccountGroupItem {
                        id: format!("i{i}"),
                        group_id: "g1".into(),
                        wallet_id: Some(wallet.id.clone()),
                        ..Default::default()
                    })
                    .unwrap();
            }
        }

        fn new_task(&self, scripts: &[&str], threads: u32) -> Task {
            self.engine
                .create_task(NewTask {
                    name: "daily".into(),
                    user_id: "u1".into(),
                    project_id: "p1".into(),
                    thread_count: threads,
                    account_group_ids: vec!["g1".into()],
                    scripts: scripts.iter().map(|s| s.to_string()).collect(),
                    headless: true,
                    params: json!({"round": 1}),
                })
                .unwrap()
        }

        async fn run(&self, task_id: &str, filter: Option<&[String]>) -> (StartOutcome, Task) {
            let outcome = self
                .engine
                .start_task(task_id, "u1", filter, None)
                .await
                .unwrap();
            let task = self
                .engine
                .wait_settled(task_id, Duration::from_secs(10))
                .await
                .unwrap();
            (outcome, task)
        }

        fn seen(&self) -> Vec<String> {
            let mut seen = self.seen.lock().unwrap().clone();
            seen.sort();
            seen
        }
    }

    async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    // --- creation ---

    #[tokio::test]
    async fn create_makes_pending_logs() {
        let h = harness();
        h.seed(2);
        let task = h.new_task(&["builtin/noop"], 1);
        assert_eq!(task.status, TaskStatus::Pending);

        let logs = h.engine.task_logs(&task.id).unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|l| l.status == TaskStatus::Pending));
    }

    #[tokio::test]
    async fn create_without_items_fails_the_task() {
        let h = harness();
        h.seed(0);
        let task = h.new_task(&["builtin/noop"], 1);
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());
        assert_eq!(h.engine.get_task(&task.id).unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn create_validates_input_and_group_owner() {
        let h = harness();
        h.seed(1);
        let mut req = NewTask {
            name: "daily".into(),
            user_id: "u2".into(),
            project_id: "p1".into(),
            thread_count: 1,
            account_group_ids: vec!["g1".into()],
            scripts: vec!["builtin/noop".into()],
            headless: true,
            params: Value::Null,
        };
        assert!(matches!(
            h.engine.create_task(req.clone()),
            Err(ServiceError::PermissionDenied(_))
        ));
        req.user_id = "u1".into();
        req.thread_count = 0;
        assert!(matches!(
            h.engine.create_task(req),
            Err(ServiceError::Validation(_))
        ));
    }

    // --- running ---

    #[tokio::test]
    async fn run_to_completion() {
        let h = harness();
        h.seed(3);
        let task = h.new_task(&["builtin/touch-profile", "test/one"], 2);

        let (outcome, done) = h.run(&task.id, None).await;
        assert_eq!(outcome, StartOutcome::Started { units: 3 });
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.machine_id.as_deref(), Some("host-a"));
        assert!(done.started_at.is_some() && done.ended_at.is_some());

        let logs = h.engine.task_logs(&task.id).unwrap();
        assert_eq!(logs.len(), 3);
        assert!(logs.iter().all(|l| l.status == TaskStatus::Completed));
        assert!(logs[0].log.contains("progress 2/2"));

        assert_eq!(h.seen(), vec!["i1:one", "i2:one", "i3:one"]);
        let result = h.engine.task_result("p1", "i1").unwrap().unwrap();
        assert_eq!(result.data["lastTaskId"], task.id.as_str());

        assert_eq!(h.provider.opened.load(Ordering::SeqCst), 3);
        assert_eq!(h.provider.open.load(Ordering::SeqCst), 0);
        assert!(!h.engine.is_running_here(&task.id));
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_thread_count() {
        let h = harness();
        h.seed(6);
        let task = h.new_task(&["test/sleep"], 2);

        let (_, done) = h.run(&task.id, None).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(h.provider.opened.load(Ordering::SeqCst), 6);
        assert!(h.provider.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn failing_script_aborts_the_rest_of_its_unit() {
        let h = harness();
        h.seed(2);
        let task = h.new_task(&["test/one", "test/fail-i2", "test/two"], 2);

        let (_, done) = h.run(&task.id, None).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(h.seen(), vec!["i1:one", "i1:two", "i2:one"]);

        let logs = h.engine.task_logs(&task.id).unwrap();
        let failed = logs.iter().find(|l| l.item_id == "i2").unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_code, Some(code::SOCIAL_AUTH));
        assert_eq!(failed.error_message.as_deref(), Some("captcha"));
        assert_eq!(h.engine.failed_items(&task.id).unwrap(), vec!["i2".to_string()]);
    }

    #[tokio::test]
    async fn rerun_can_target_failed_items() {
        let h = harness();
        h.seed(2);
        let task = h.new_task(&["test/one", "test/fail-i2"], 1);
        h.run(&task.id, None).await;

        h.seen.lock().unwrap().clear();
        let failed = h.engine.failed_items(&task.id).unwrap();
        let (outcome, done) = h.run(&task.id, Some(&failed)).await;
        assert_eq!(outcome, StartOutcome::Started { units: 1 });
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(h.seen(), vec!["i2:one"]);
    }

    #[tokio::test]
    async fn zero_units_stops_the_task() {
        let h = harness();
        h.seed(1);
        let task = h.new_task(&["builtin/noop"], 1);

        let filter = vec!["nope".to_string()];
        let outcome = h
            .engine
            .start_task(&task.id, "u1", Some(&filter), None)
            .await
            .unwrap();
        assert_eq!(outcome, StartOutcome::NothingToRun);
        assert_eq!(h.engine.get_task(&task.id).unwrap().status, TaskStatus::Stopped);
        assert_eq!(h.provider.opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unresolvable_items_are_skipped() {
        let h = harness();
        h.seed(2);
        h.engine
            .stores()
            .accounts
            .create_item(&AccountGroupItem {
                id: "i3".into(),
                group_id: "g1".into(),
                wallet_id: Some("missing".into()),
                ..Default::default()
            })
            .unwrap();
        let task = h.new_task(&["test/one"], 1);

        let (outcome, done) = h.run(&task.id, None).await;
        assert_eq!(outcome, StartOutcome::Started { units: 2 });
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(h.seen(), vec!["i1:one", "i2:one"]);
    }

    #[tokio::test]
    async fn every_item_unresolvable_stops_the_task() {
        let cipher = AesGcmCipher::from_base64_key(&AesGcmCipher::generate_key()).unwrap();
        let h = harness_with(Arc::new(cipher));
        h.seed(0);
        let accounts = &h.engine.stores().accounts;
        let garbled = Wallet {
            id: "w-bad".into(),
            address: "0xbad".into(),
            private_key: "not ciphertext".into(),
        };
        accounts
            .put_resource(ResourceKind::Wallet, "w-bad", "u1", &garbled)
            .unwrap();
        for (item, wallet) in [("i1", "missing"), ("i2", "w-bad")] {
            accounts
                .create_item(&AccountGroupItem {
                    id: item.into(),
                    group_id: "g1".into(),
                    wallet_id: Some(wallet.into()),
                    ..Default::default()
                })
                .unwrap();
        }
        let task = h.new_task(&["test/one"], 1);
        assert_eq!(task.status, TaskStatus::Pending);

        let outcome = h.engine.start_task(&task.id, "u1", None, None).await.unwrap();
        assert_eq!(outcome, StartOutcome::NothingToRun);
        let stopped = h.engine.get_task(&task.id).unwrap();
        assert_eq!(stopped.status, TaskStatus::Stopped);
        assert!(stopped.machine_id.is_none());
        assert_eq!(h.provider.opened.load(Ordering::SeqCst), 0);
        assert!(h.seen().is_empty());
    }

    #[tokio::test]
    async fn resources_of_other_users_are_never_resolved() {
        let h = harness();
        h.seed(1);
        let accounts = &h.engine.stores().accounts;
        let foreign = Wallet {
            id: "w-foreign".into(),
            address: "0xf00".into(),
            private_key: "foreign-key".into(),
        };
        accounts
            .put_resource(ResourceKind::Wallet, "w-foreign", "u2", &foreign)
            .unwrap();
        accounts
            .create_item(&AccountGroupItem {
                id: "i2".into(),
                group_id: "g1".into(),
                wallet_id: Some("w-foreign".into()),
                ..Default::default()
            })
            .unwrap();
        let task = h.new_task(&["test/capture-key"], 1);

        let (outcome, done) = h.run(&task.id, None).await;
        assert_eq!(outcome, StartOutcome::Started { units: 1 });
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(h.seen(), vec!["pk-1"]);
    }

    #[tokio::test]
    async fn group_lookup_failure_forces_stop() {
        let h = harness();
        h.seed(1);
        let task = h.new_task(&["builtin/noop"], 1);
        h.db
            .exec("DELETE FROM account_groups WHERE id = 'g1'", &[])
            .unwrap();

        let err = h
            .engine
            .start_task(&task.id, "u1", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        let stopped = h.engine.get_task(&task.id).unwrap();
        assert_eq!(stopped.status, TaskStatus::Stopped);
        assert!(stopped.error.unwrap().contains("start failed"));
    }

    #[tokio::test]
    async fn secrets_are_decrypted_for_the_run() {
        let cipher = AesGcmCipher::from_base64_key(&AesGcmCipher::generate_key()).unwrap();
        let h = harness_with(Arc::new(cipher));
        h.seed(1);
        let stored: Wallet = h
            .engine
            .stores()
            .accounts
            .get_resource(ResourceKind::Wallet, "w1", "u1")
            .unwrap();
        assert_ne!(stored.private_key, "pk-1");

        let task = h.new_task(&["test/capture-key"], 1);
        h.run(&task.id, None).await;
        assert_eq!(h.seen(), vec!["pk-1"]);
    }

    // --- start / stop guards ---

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let h = harness();
        h.seed(1);
        let task = h.new_task(&["test/hang"], 1);

        let first = h.engine.start_task(&task.id, "u1", None, None).await.unwrap();
        assert_eq!(first, StartOutcome::Started { units: 1 });
        let second = h.engine.start_task(&task.id, "u1", None, None).await.unwrap();
        assert_eq!(second, StartOutcome::AlreadyRunning);
        assert!(eventually(|| h.provider.opened.load(Ordering::SeqCst) == 1).await);
        assert_eq!(h.provider.opened.load(Ordering::SeqCst), 1);

        h.engine.stop_task(&task.id, "u1").unwrap();
    }

    #[tokio::test]
    async fn stop_abandons_in_flight_units() {
        let h = harness();
        h.seed(2);
        let task = h.new_task(&["test/hang"], 2);
        h.engine.start_task(&task.id, "u1", None, Some(false)).await.unwrap();
        assert!(eventually(|| h.provider.open.load(Ordering::SeqCst) == 2).await);

        let stopped = h.engine.stop_task(&task.id, "u1").unwrap();
        assert_eq!(stopped.status, TaskStatus::Stopped);
        assert!(stopped.ended_at.is_some());
        assert!(!h.engine.is_running_here(&task.id));

        // Sessions of abandoned units are closed from the guard's drop.
        assert!(eventually(|| h.provider.open.load(Ordering::SeqCst) == 0).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.engine.get_task(&task.id).unwrap().status, TaskStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_requires_running_task() {
        let h = harness();
        h.seed(1);
        let task = h.new_task(&["builtin/noop"], 1);

        let err = h.engine.stop_task(&task.id, "u1").unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert_eq!(h.engine.get_task(&task.id).unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn other_users_cannot_start_or_stop() {
        let h = harness();
        h.seed(1);
        let task = h.new_task(&["builtin/noop"], 1);

        let start = h.engine.start_task(&task.id, "u2", None, None).await;
        assert!(matches!(start, Err(ServiceError::PermissionDenied(_))));
        let stop = h.engine.stop_task(&task.id, "u2");
        assert!(matches!(stop, Err(ServiceError::PermissionDenied(_))));
        assert_eq!(h.engine.get_task(&task.id).unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn wait_settled_times_out_while_running() {
        let h = harness();
        h.seed(1);
        let task = h.new_task(&["test/hang"], 1);
        h.engine.start_task(&task.id, "u1", None, None).await.unwrap();

        let still = h
            .engine
            .wait_settled(&task.id, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(still.status, TaskStatus::Running);
        h.engine.stop_task(&task.id, "u1").unwrap();
    }

    // --- crash recovery ---

    #[tokio::test]
    async fn reclaim_stops_only_this_hosts_tasks() {
        let h = harness();
        h.seed(1);
        let mine = h.new_task(&["builtin/noop"], 1);
        let theirs = h.new_task(&["builtin/noop"], 1);
        let tasks = &h.engine.stores().tasks;
        let logs = &h.engine.stores().logs;
        for (task, host) in [(&mine, "host-a"), (&theirs, "host-b")] {
            tasks
                .transition(&task.id, &[TaskStatus::Pending], |t| {
                    t.status = TaskStatus::Running;
                    t.machine_id = Some(host.into());
                })
                .unwrap()
                .unwrap();
            logs.mark_running(&UnitId::new(&task.id, "i1"), "started").unwrap();
        }

        let report = h.engine.reclaim_interrupted().unwrap();
        assert_eq!(report.tasks, vec![mine.id.clone()]);
        assert_eq!(report.logs, 1);

        let reclaimed = h.engine.get_task(&mine.id).unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Stopped);
        let log = &h.engine.task_logs(&mine.id).unwrap()[0];
        assert_eq!(log.status, TaskStatus::Stopped);
        assert_eq!(log.error_code, Some(code::INTERRUPTED));

        assert_eq!(h.engine.get_task(&theirs.id).unwrap().status, TaskStatus::Running);
        assert_eq!(
            h.engine.task_logs(&theirs.id).unwrap()[0].status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn run_lock_held_elsewhere_blocks_start_and_reclaim() {
        let h = harness();
        h.seed(1);
        let task = h.new_task(&["builtin/noop"], 1);
        let elsewhere = RunLocks::new(h.dir.path().join("run"));
        let held = elsewhere.try_acquire(&task.id).unwrap().unwrap();

        let outcome = h.engine.start_task(&task.id, "u1", None, None).await.unwrap();
        assert_eq!(outcome, StartOutcome::AlreadyRunning);
        assert_eq!(h.engine.get_task(&task.id).unwrap().status, TaskStatus::Pending);

        // The other process has it running.
        h.engine
            .stores()
            .tasks
            .transition(&task.id, &[TaskStatus::Pending], |t| {
                t.status = TaskStatus::Running;
                t.machine_id = Some("host-a".into());
            })
            .unwrap()
            .unwrap();
        assert!(h.engine.reclaim_interrupted().unwrap().tasks.is_empty());
        assert_eq!(h.engine.get_task(&task.id).unwrap().status, TaskStatus::Running);

        // It died: the lock is gone and the run is reclaimable.
        drop(held);
        let report = h.engine.reclaim_interrupted().unwrap();
        assert_eq!(report.tasks, vec![task.id.clone()]);
        assert_eq!(h.engine.get_task(&task.id).unwrap().status, TaskStatus::Stopped);
    }

    #[tokio::test]
    async fn reclaim_leaves_live_queues_alone() {
        let h = harness();
        h.seed(1);
        let task = h.new_task(&["test/hang"], 1);
        h.engine.start_task(&task.id, "u1", None, None).await.unwrap();

        let report = h.engine.reclaim_interrupted().unwrap();
        assert!(report.tasks.is_empty());
        assert_eq!(h.engine.get_task(&task.id).unwrap().status, TaskStatus::Running);
        h.engine.stop_task(&task.id, "u1").unwrap();
    }
}
