//! Capabilities the crawl pipeline consumes from the chat source.
//!
//! [`SourceBrowser`] owns the authenticated channel; [`Extractor`] reads the
//! inbox and single conversations through it. Both are object-safe so the composition root can
//! hand out a single shared `Arc<dyn _>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use inboxmirror_shared::{Credentials, RawMessage, RawSnapshot, Result};

/// Outcome of a login probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    /// At least one strong signal says the session is authenticated.
    LoggedIn,
    /// The source sent us to its login surface, or showed a login form.
    LoggedOut,
    /// Nothing conclusive either way.
    Ambiguous,
}

/// A cookie carried by the session artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
}

/// Serializable session state, written to disk after a successful login so
/// later runs can skip it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionArtifact {
    /// Origin the cookies belong to.
    pub origin: String,
    pub cookies: Vec<StoredCookie>,
    pub saved_at: DateTime<Utc>,
}

/// The single authenticated channel to the source.
#[async_trait]
pub trait SourceBrowser: Send + Sync {
    /// Visit a page only reachable while authenticated and classify the result.
    ///
    /// Errors only when the source cannot be reached at all.
    async fn probe(&self) -> Result<LoginState>;

    /// Run the login sequence once. `Ok(false)` means the source rejected it.
    async fn login(&self, credentials: &Credentials) -> Result<bool>;

    /// Snapshot the current session for persistence.
    async fn export_session(&self) -> Result<SessionArtifact>;

    /// Seed the session from a previously exported artifact.
    async fn import_session(&self, artifact: &SessionArtifact) -> Result<()>;

    /// Release the underlying session resource. Never fails.
    async fn close(&self);
}

/// Reads conversations from the source.
///
/// `locator` is either the source's conversation id or a full URL to it.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn snapshot(&self, locator: &str) -> Result<RawSnapshot>;

    /// One snapshot per row of the inbox list, in display order.
    async fn snapshot_inbox(&self) -> Result<Vec<RawSnapshot>>;

    /// Messages in the order the source displays them.
    async fn snapshot_messages(&self, locator: &str) -> Result<Vec<RawMessage>>;
}
