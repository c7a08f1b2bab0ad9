use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
///
/// ```text
/// PENDING → RUNNING → COMPLETED      (queue drained)
///                   → STOPPED        (stop_task, crash recovery)
///         → STOPPED                  (start found no eligible units)
///         → FAILED                   (creation found no eligible accounts)
/// ```
///
/// Only the engine and the queue's lifecycle reducer write this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A scheduled batch of automated work against a set of account groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,

    // --- ownership ---
    pub user_id: String,
    pub project_id: String,

    // --- definition ---
    /// Maximum number of units executing at once.
    pub thread_count: u32,
    /// Linked account groups; every item in them is a unit candidate.
    #[serde(default)]
    pub account_group_ids: Vec<String>,
    /// Script paths, run in this order inside every unit.
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Free-form input handed to scripts through the context config.
    #[serde(default)]
    pub params: serde_json::Value,

    // --- execution state ---
    pub status: TaskStatus,
    /// Host that is (or was last) running this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    /// Task-level error description (creation failure, forced stop).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    // --- timestamps ---
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
}

fn default_headless() -> bool {
    true
}

/// Input for creating a task.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub name: String,
    pub user_id: String,
    pub project_id: String,
    #[serde(default = "default_thread_count")]
    pub thread_count: u32,
    pub account_group_ids: Vec<String>,
    pub scripts: Vec<String>,
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default)]
    pub params: serde_json::Value,
}

fn default_thread_count() -> u32 {
    1
}

/// Filters for listing tasks.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListQuery {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// A named set of account items owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountGroup {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub created_at: String,
}

/// One "persona": at most one resource of each kind, referenced by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountGroupItem {
    pub id: String,
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub social_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint_id: Option<String>,
}

/// Resource kinds an item can link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Social,
    Email,
    Wallet,
    Proxy,
    Fingerprint,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Social => "social",
            Self::Email => "email",
            Self::Wallet => "wallet",
            Self::Proxy => "proxy",
            Self::Fingerprint => "fingerprint",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// Secret-bearing resources print their secrets as `<redacted>`: once
// resolved they hold plaintext.

const REDACTED: &str = "<redacted>";

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        ""
    } else {
        REDACTED
    }
}

/// A social-network login. `password` is ciphertext at rest and plaintext
/// inside a resolved [`AccountDetail`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocialAccount {
    pub id: String,
    /// Site key, e.g. `"twitter"` or `"discord"`.
    pub platform: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl std::fmt::Debug for SocialAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocialAccount")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("token", &self.token.as_deref().map(redact))
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAccount {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for EmailAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailAccount")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("password", &redact(&self.password))
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub private_key: String,
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("private_key", &redact(&self.private_key))
            .finish()
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proxy {
    pub id: String,
    /// `http`, `https` or `socks5`.
    pub scheme: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("id", &self.id)
            .field("server", &self.server())
            .field("username", &self.username)
            .field("password", &self.password.as_deref().map(redact))
            .finish()
    }
}

impl Proxy {
    /// `scheme://host:port`, without credentials.
    pub fn server(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub id: String,
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<(u32, u32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// The resolved resource bundle of one item, secrets decrypted. Lives only
/// in memory for the duration of a run and is never serialized.
#[derive(Debug, Clone, Default)]
pub struct AccountDetail {
    pub item_id: String,
    pub group_id: String,
    pub social: Option<SocialAccount>,
    pub email: Option<EmailAccount>,
    pub wallet: Option<Wallet>,
    pub proxy: Option<Proxy>,
    pub fingerprint: Option<Fingerprint>,
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

/// Identity of one unit of work: one account item within one task.
///
/// Kept as a pair; the `"<task>-<item>"` display form is for humans and
/// is never parsed back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitId {
    pub task_id: String,
    pub item_id: String,
}

impl UnitId {
    pub fn new(task_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            item_id: item_id.into(),
        }
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.task_id, self.item_id)
    }
}

/// Per-run configuration visible to scripts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    pub thread_count: u32,
    pub headless: bool,
    pub params: serde_json::Value,
}

/// Everything needed to execute one unit. Built at start time, owned by
/// the queue and worker, never persisted.
#[derive(Debug, Clone)]
pub struct TaskUnit {
    pub id: UnitId,
    pub user_id: String,
    pub project_id: String,
    pub account: Arc<AccountDetail>,
    pub scripts: Arc<Vec<String>>,
    pub config: Arc<TaskConfig>,
}

// ---------------------------------------------------------------------------
// TaskLog
// ---------------------------------------------------------------------------

/// Durable per-unit execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLog {
    pub id: String,
    pub task_id: String,
    pub item_id: String,
    /// Same value set as the task status.
    pub status: TaskStatus,
    /// Rolling free-text log, newest lines last.
    #[serde(default)]
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// TaskResult
// ---------------------------------------------------------------------------

/// Cross-run progress document for one account item within a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub id: String,
    pub project_id: String,
    pub item_id: String,
    pub data: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Stopped,
        ] {
            let json = serde_json::to_string(&s).unwrap();
            assert_eq!(json, format!("\"{}\"", s.as_str()));
            assert_eq!(TaskStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TaskStatus::parse("cancelled"), None);
    }

    #[test]
    fn unit_id_display_is_not_identity() {
        let a = UnitId::new("t-1", "2");
        let b = UnitId::new("t", "1-2");
        assert_eq!(a.to_string(), b.to_string());
        assert_ne!(a, b);
    }

    #[test]
    fn new_task_defaults() {
        let json = r#"{
            "name": "daily",
            "userId": "u1",
            "projectId": "p1",
            "accountGroupIds": ["g1"],
            "scripts": ["builtin/noop"]
        }"#;
        let req: NewTask = serde_json::from_str(json).unwrap();
        assert_eq!(req.thread_count, 1);
        assert!(req.headless);
        assert!(req.params.is_null());
    }

    #[test]
    fn task_json_skips_empty_options() {
        let task = Task {
            id: "t1".into(),
            name: "daily".into(),
            user_id: "u1".into(),
            project_id: "p1".into(),
            thread_count: 2,
            account_group_ids: vec!["g1".into()],
            scripts: vec!["builtin/noop".into()],
            headless: true,
            params: serde_json::Value::Null,
            status: TaskStatus::Pending,
            machine_id: None,
            error: None,
            created_at: "2026-01-01T00:00:00.000000Z".into(),
            started_at: None,
            ended_at: None,
        };
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"threadCount\":2"));
        assert!(!json.contains("machineId"));
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.status, TaskStatus::Pending);
    }

    #[test]
    fn proxy_server_string() {
        let proxy = Proxy {
            id: "px".into(),
            scheme: "socks5".into(),
            host: "10.0.0.2".into(),
            port: 1080,
            username: Some("u".into()),
            password: Some("p".into()),
        };
        assert_eq!(proxy.server(), "socks5://10.0.0.2:1080");
        assert!(!format!("{proxy:?}").contains("\"p\""));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let detail = AccountDetail {
            item_id: "i1".into(),
            social: Some(SocialAccount {
                id: "s1".into(),
                platform: "twitter".into(),
                username: "alice".into(),
                password: "hunter2".into(),
                token: Some("tok-secret".into()),
            }),
            email: Some(EmailAccount {
                id: "e1".into(),
                address: "alice@example.com".into(),
                password: "mail-secret".into(),
            }),
            wallet: Some(Wallet {
                id: "w1".into(),
                address: "0xabc".into(),
                private_key: "pk-secret".into(),
            }),
            ..Default::default()
        };
        let unit = TaskUnit {
            id: UnitId::new("t1", "i1"),
            user_id: "u1".into(),
            project_id: "p1".into(),
            account: Arc::new(detail),
            scripts: Arc::new(vec![]),
            config: Arc::new(TaskConfig {
                thread_count: 1,
                headless: true,
                params: serde_json::Value::Null,
            }),
        };

        let out = format!("{unit:?}");
        for secret in ["hunter2", "tok-secret", "mail-secret", "pk-secret"] {
            assert!(!out.contains(secret), "{secret} leaked: {out}");
        }
        assert!(out.contains("alice@example.com"));
        assert!(out.contains("<redacted>"));
    }
}
