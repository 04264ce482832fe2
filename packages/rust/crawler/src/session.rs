//! The process-wide authenticated session.
//!
//! [`SessionManager`] wraps the one shared [`SourceBrowser`]. It restores the
//! persisted session artifact once, re-authenticates when a probe says the
//! session is gone, and writes the new artifact back to disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use inboxmirror_shared::{Credentials, MirrorError, Result};

use crate::source::{LoginState, SessionArtifact, SourceBrowser};

pub struct SessionManager {
    browser: Arc<dyn SourceBrowser>,
    credentials: Option<Credentials>,
    artifact_path: PathBuf,
    logged_in: AtomicBool,
    restored: AtomicBool,
    /// Serializes `ensure_valid` so concurrent jobs never log in twice.
    guard: Mutex<()>,
}

impl SessionManager {
    /// `credentials` may be `None` when only a persisted session is available;
    /// a dead session then reports `false` instead of logging in.
    pub fn new(
        browser: Arc<dyn SourceBrowser>,
        credentials: Option<Credentials>,
        artifact_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            browser,
            credentials,
            artifact_path: artifact_path.into(),
            logged_in: AtomicBool::new(false),
            restored: AtomicBool::new(false),
            guard: Mutex::new(()),
        }
    }

    /// Result of the last probe or login.
    pub fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Make sure the shared session is authenticated.
    ///
    /// Probes first; on anything but a confirmed login, makes exactly one
    /// login attempt. Returns `Ok(false)` when the source rejects the login,
    /// and `Err` only when the source or the artifact file is unusable.
    #[instrument(skip_all)]
    pub async fn ensure_valid(&self) -> Result<bool> {
        let _guard = self.guard.lock().await;

        // Only a completed restore counts; a failed import is retried next call.
        if !self.restored.load(Ordering::SeqCst) {
            self.restore().await?;
            self.restored.store(true, Ordering::SeqCst);
        }

        match self.browser.probe().await? {
            LoginState::LoggedIn => {
                self.logged_in.store(true, Ordering::SeqCst);
                return Ok(true);
            }
            state => debug!(?state, "session not confirmed, logging in"),
        }
        self.logged_in.store(false, Ordering::SeqCst);

        let Some(credentials) = &self.credentials else {
            warn!("session expired and no credentials configured");
            return Ok(false);
        };

        if !self.browser.login(credentials).await? {
            warn!(username = %credentials.username, "login rejected by source");
            return Ok(false);
        }

        let artifact = self.browser.export_session().await?;
        self.persist(&artifact)?;
        self.logged_in.store(true, Ordering::SeqCst);
        info!(path = %self.artifact_path.display(), "logged in, session saved");
        Ok(true)
    }

    /// Release the browser session and forget login state.
    ///
    /// Does not wait for in-flight `ensure_valid` calls.
    pub async fn close(&self) {
        self.browser.close().await;
        self.logged_in.store(false, Ordering::SeqCst);
        self.restored.store(false, Ordering::SeqCst);
        info!("session closed");
    }

    async fn restore(&self) -> Result<()> {
        let content = match std::fs::read_to_string(&self.artifact_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.artifact_path.display(), "no saved session");
                return Ok(());
            }
            Err(e) => return Err(MirrorError::io(&self.artifact_path, e)),
        };

        match serde_json::from_str::<SessionArtifact>(&content) {
            Ok(artifact) => {
                self.browser.import_session(&artifact).await?;
                debug!(saved_at = %artifact.saved_at, "restored saved session");
            }
            Err(e) => warn!(
                path = %self.artifact_path.display(),
                error = %e,
                "ignoring unreadable session artifact"
            ),
        }
        Ok(())
    }

    fn persist(&self, artifact: &SessionArtifact) -> Result<()> {
        let path = &self.artifact_path;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MirrorError::io(parent, e))?;
        }

        let json = serde_json::to_string_pretty(artifact)
            .map_err(|e| MirrorError::Session(format!("failed to encode session: {e}")))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| MirrorError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| MirrorError::io(path, e))?;
        Ok(())
    }
}
