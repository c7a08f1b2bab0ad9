//! Browser sessions.
//!
//! The engine never drives a browser itself. A [`SessionProvider`] turns
//! an account's proxy and fingerprint into an isolated, persistent session
//! and the worker owns closing it again.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{code, ScriptError};
use crate::model::{Fingerprint, Proxy, UnitId};

/// What a provider needs to open a session for one unit.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub unit: UnitId,
    /// Private to the account item; never shared between concurrent units.
    pub user_data_dir: PathBuf,
    pub headless: bool,
    pub proxy: Option<Proxy>,
    pub fingerprint: Option<Fingerprint>,
}

/// A live browser session handed to every script of a unit.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    fn id(&self) -> &str;

    fn user_data_dir(&self) -> &Path;

    /// Release the browser. Called exactly once by the worker.
    async fn close(&self) -> Result<(), ScriptError>;

    /// Concrete backend, for scripts that need its full API.
    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open(&self, spec: SessionSpec) -> Result<Arc<dyn BrowserSession>, ScriptError>;
}

// ---------------------------------------------------------------------------
// SessionGuard
// ---------------------------------------------------------------------------

/// Closes the session when the worker is done with it. If the unit future
/// is dropped before that (queue destroyed), a best-effort close is spawned
/// from `Drop`.
pub(crate) struct SessionGuard {
    session: Arc<dyn BrowserSession>,
    closed: AtomicBool,
}

impl SessionGuard {
    pub(crate) fn new(session: Arc<dyn BrowserSession>) -> Self {
        Self {
            session,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn session(&self) -> &Arc<dyn BrowserSession> {
        &self.session
    }

    /// Marked closed only once `close` has returned, so a close that is
    /// cut short still gets the drop-time fallback.
    pub(crate) async fn close(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.session.close().await {
            warn!(session = self.session.id(), "closing browser session failed: {e}");
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let session = Arc::clone(&self.session);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(session = session.id(), "unit abandoned, closing session in background");
                handle.spawn(async move {
                    if let Err(e) = session.close().await {
                        warn!(session = session.id(), "background session close failed: {e}");
                    }
                });
            }
            Err(_) => warn!(session = session.id(), "session leaked: no runtime to close it"),
        }
    }
}

// ---------------------------------------------------------------------------
// DirSessionProvider
// ---------------------------------------------------------------------------

/// Provider that only prepares the per-item profile directory.
///
/// Useful on hosts without a browser backend and as the fallback wiring
/// for scripts that work purely over HTTP using the account resources.
pub struct DirSessionProvider;

pub struct DirSession {
    id: String,
    dir: PathBuf,
}

#[async_trait]
impl BrowserSession for DirSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn user_data_dir(&self) -> &Path {
        &self.dir
    }

    async fn close(&self) -> Result<(), ScriptError> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl SessionProvider for DirSessionProvider {
    async fn open(&self, spec: SessionSpec) -> Result<Arc<dyn BrowserSession>, ScriptError> {
        tokio::fs::create_dir_all(&spec.user_data_dir)
            .await
            .map_err(|e| {
                ScriptError::new(
                    code::SESSION_OPEN,
                    format!("create {}: {e}", spec.user_data_dir.display()),
                )
            })?;
        Ok(Arc::new(DirSession {
            id: spec.unit.to_string(),
            dir: spec.user_data_dir,
        }))
    }
}
