//! Cookie-session HTTP client implementing both source capabilities.
//!
//! One [`HttpSource`] holds at most one live session (client + cookie jar).
//! It is created lazily on first use and dropped by [`SourceBrowser::close`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use reqwest::cookie::{CookieStore, Jar};
use scraper::Html;
use tracing::{debug, info, instrument, warn};
use url::Url;

use inboxmirror_shared::{
    Credentials, MirrorError, RawMessage, RawSnapshot, Result, SourceConfig,
};

use crate::extract::{
    CompiledSelectors, MessageClock, classify_login, external_key_from_url, parse_inbox,
    parse_messages, parse_snapshot,
};
use crate::source::{Extractor, LoginState, SessionArtifact, SourceBrowser, StoredCookie};

/// User-Agent string for source requests.
const USER_AGENT: &str = concat!("inboxmirror/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
struct HttpSession {
    client: Client,
    jar: Arc<Jar>,
}

/// Reference source implementation over plain HTTP and HTML parsing.
pub struct HttpSource {
    config: SourceConfig,
    base_url: Url,
    selectors: CompiledSelectors,
    key_pattern: Regex,
    session: Mutex<Option<HttpSession>>,
}

impl HttpSource {
    pub fn new(config: SourceConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            MirrorError::config(format!("invalid source.base_url '{}': {e}", config.base_url))
        })?;
        let selectors = CompiledSelectors::compile(&config.selectors)?;
        let key_pattern = Regex::new(&config.external_key_pattern).map_err(|e| {
            MirrorError::config(format!("invalid source.external_key_pattern: {e}"))
        })?;

        if !config.headless {
            warn!("source.headless = false has no effect, the HTTP source never opens a window");
        }

        Ok(Self {
            config,
            base_url,
            selectors,
            key_pattern,
            session: Mutex::new(None),
        })
    }

    /// Current session, created on first use.
    fn session(&self) -> Result<HttpSession> {
        let mut slot = self
            .session
            .lock()
            .map_err(|_| MirrorError::Session("session lock poisoned".into()))?;
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }

        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .cookie_provider(Arc::clone(&jar))
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(self.config.timeout())
            .build()
            .map_err(|e| MirrorError::Network(format!("failed to build HTTP client: {e}")))?;

        debug!("opened source session");
        let session = HttpSession { client, jar };
        *slot = Some(session.clone());
        Ok(session)
    }

    fn resolve(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| MirrorError::config(format!("invalid source path '{path}': {e}")))
    }

    /// Map a locator (conversation id or absolute URL) to the page to fetch.
    fn chat_url(&self, locator: &str) -> Result<Url> {
        match Url::parse(locator) {
            Ok(url) if url.has_host() => Ok(url),
            _ => self.resolve(&self.config.chat_path.replace("{key}", locator)),
        }
    }

    /// GET a page, following redirects. Returns the final URL and the body.
    async fn fetch(&self, url: &Url) -> Result<(Url, String)> {
        let session = self.session()?;
        let response = session
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| MirrorError::Network(format!("{url}: {e}")))?;

        let status = response.status();
        let final_url = response.url().clone();
        if !status.is_success() {
            return Err(MirrorError::Network(format!("{url}: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| MirrorError::Network(format!("{url}: body read failed: {e}")))?;
        Ok((final_url, body))
    }

    /// Fetch a conversation page, failing if the source bounced us to login.
    async fn fetch_chat(&self, locator: &str) -> Result<(Url, String)> {
        let url = self.chat_url(locator)?;
        self.fetch_authenticated(&url).await
    }

    async fn fetch_authenticated(&self, url: &Url) -> Result<(Url, String)> {
        let (final_url, body) = self.fetch(url).await?;
        if final_url.path().starts_with(self.config.login_path.as_str()) {
            return Err(MirrorError::Session(format!(
                "{url}: redirected to login, session expired"
            )));
        }
        Ok((final_url, body))
    }
}

#[async_trait]
impl SourceBrowser for HttpSource {
    #[instrument(skip_all)]
    async fn probe(&self) -> Result<LoginState> {
        let url = self.resolve(&self.config.probe_path)?;
        let session = self.session()?;
        let response = session
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| MirrorError::Network(format!("{url}: {e}")))?;
        let final_url = response.url().clone();
        let body = response
            .text()
            .await
            .map_err(|e| MirrorError::Network(format!("{url}: body read failed: {e}")))?;

        let state = {
            let doc = Html::parse_document(&body);
            classify_login(&final_url, &doc, &self.config.login_path, &self.selectors)
        };
        debug!(final_url = %final_url, ?state, "login probe");
        Ok(state)
    }

    #[instrument(skip_all, fields(username = %credentials.username))]
    async fn login(&self, credentials: &Credentials) -> Result<bool> {
        let url = self.resolve(&self.config.login_path)?;

        // Load the form first so any pre-login cookies are set.
        self.fetch(&url).await?;

        let session = self.session()?;
        let response = session
            .client
            .post(url.as_str())
            .form(&[
                (self.config.username_field.as_str(), credentials.username.as_str()),
                (self.config.password_field.as_str(), credentials.password.as_str()),
            ])
            .send()
            .await
            .map_err(|e| MirrorError::Network(format!("{url}: {e}")))?;
        debug!(status = %response.status(), final_url = %response.url(), "login form submitted");

        let state = self.probe().await?;
        info!(?state, "login attempt finished");
        Ok(state == LoginState::LoggedIn)
    }

    async fn export_session(&self) -> Result<SessionArtifact> {
        let session = self.session()?;
        let cookies = session
            .jar
            .cookies(&self.base_url)
            .and_then(|header| header.to_str().ok().map(parse_cookie_header))
            .unwrap_or_default();

        Ok(SessionArtifact {
            origin: self.base_url.origin().ascii_serialization(),
            cookies,
            saved_at: Utc::now(),
        })
    }

    async fn import_session(&self, artifact: &SessionArtifact) -> Result<()> {
        let origin = Url::parse(&artifact.origin)
            .map_err(|e| MirrorError::Session(format!("invalid artifact origin: {e}")))?;
        if origin.origin() != self.base_url.origin() {
            warn!(
                artifact_origin = %artifact.origin,
                "session artifact belongs to a different origin, ignoring"
            );
            return Ok(());
        }

        let session = self.session()?;
        for cookie in &artifact.cookies {
            session
                .jar
                .add_cookie_str(&format!("{}={}; Path=/", cookie.name, cookie.value), &self.base_url);
        }
        debug!(cookies = artifact.cookies.len(), "session artifact imported");
        Ok(())
    }

    async fn close(&self) {
        let dropped = match self.session.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if dropped.is_some() {
            info!("source session closed");
        }
    }
}

#[async_trait]
impl Extractor for HttpSource {
    #[instrument(skip(self))]
    async fn snapshot(&self, locator: &str) -> Result<RawSnapshot> {
        let (final_url, body) = self.fetch_chat(locator).await?;
        let external_key = external_key_from_url(&self.key_pattern, &final_url)
            .unwrap_or_else(|| locator.to_string());

        let doc = Html::parse_document(&body);
        Ok(parse_snapshot(&doc, &self.selectors, external_key))
    }

    #[instrument(skip(self))]
    async fn snapshot_inbox(&self) -> Result<Vec<RawSnapshot>> {
        let url = self.resolve(&self.config.inbox_path)?;
        let (_, body) = self.fetch_authenticated(&url).await?;

        let doc = Html::parse_document(&body);
        let rows = parse_inbox(
            &doc,
            &self.selectors,
            &self.key_pattern,
            &MessageClock::now_local(),
            Utc::now(),
        )?;
        debug!(rows = rows.len(), "inbox extracted");
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn snapshot_messages(&self, locator: &str) -> Result<Vec<RawMessage>> {
        let (_, body) = self.fetch_chat(locator).await?;

        let doc = Html::parse_document(&body);
        let messages = parse_messages(&doc, &self.selectors, &MessageClock::now_local());
        debug!(count = messages.len(), "messages extracted");
        Ok(messages)
    }
}

fn parse_cookie_header(header: &str) -> Vec<StoredCookie> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some(StoredCookie {
                name: name.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}
