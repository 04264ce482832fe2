//! Application configuration for inboxmirror.
//!
//! User config lives at `~/.inboxmirror/inboxmirror.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "inboxmirror.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".inboxmirror";

// ---------------------------------------------------------------------------
// Config structs (matching inboxmirror.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// The chat source being mirrored.
    #[serde(default)]
    pub source: SourceConfig,

    /// Session persistence.
    #[serde(default)]
    pub session: SessionConfig,

    /// Crawl job timing.
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Local database.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Status-poll HTTP server.
    #[serde(default)]
    pub server: ServerConfig,
}

/// `[source]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Origin of the chat site.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Page hosting the login form.
    #[serde(default = "default_login_path")]
    pub login_path: String,

    /// A page only reachable while logged in.
    #[serde(default = "default_probe_path")]
    pub probe_path: String,

    /// Inbox page listing every conversation.
    #[serde(default = "default_inbox_path")]
    pub inbox_path: String,

    /// Conversation page, `{key}` is replaced with the external key.
    #[serde(default = "default_chat_path")]
    pub chat_path: String,

    /// Regex with one capture group pulling the external key out of a chat URL.
    #[serde(default = "default_external_key_pattern")]
    pub external_key_pattern: String,

    /// Form field names posted on login.
    #[serde(default = "default_username_field")]
    pub username_field: String,
    #[serde(default = "default_password_field")]
    pub password_field: String,

    /// Name of the env var holding the login id (never store the value itself).
    #[serde(default = "default_username_env")]
    pub username_env: String,

    /// Name of the env var holding the password.
    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// Run without a visible browser window.
    #[serde(default = "default_true")]
    pub headless: bool,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// CSS selectors used to read the source's pages.
    #[serde(default)]
    pub selectors: SelectorConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            login_path: default_login_path(),
            probe_path: default_probe_path(),
            inbox_path: default_inbox_path(),
            chat_path: default_chat_path(),
            external_key_pattern: default_external_key_pattern(),
            username_field: default_username_field(),
            password_field: default_password_field(),
            username_env: default_username_env(),
            password_env: default_password_env(),
            headless: true,
            timeout_secs: default_timeout_secs(),
            selectors: SelectorConfig::default(),
        }
    }
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_base_url() -> String {
    "https://soomgo.com".into()
}
fn default_login_path() -> String {
    "/login".into()
}
fn default_probe_path() -> String {
    "/pro/chats".into()
}
fn default_inbox_path() -> String {
    "/pro/chats".into()
}
fn default_chat_path() -> String {
    "/pro/chats/{key}?from=chatroom".into()
}
fn default_external_key_pattern() -> String {
    r"/chats/(\d+)".into()
}
fn default_username_field() -> String {
    "email".into()
}
fn default_password_field() -> String {
    "password".into()
}
fn default_username_env() -> String {
    "INBOXMIRROR_USERNAME".into()
}
fn default_password_env() -> String {
    "INBOXMIRROR_PASSWORD".into()
}
fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    30
}

/// `[source.selectors]` section.
///
/// Each entry is a CSS selector list; the first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub title: String,
    pub counterpart: String,
    pub category: String,
    pub location: String,
    pub price: String,
    pub unread_badge: String,
    pub message_item: String,
    pub message_content: String,
    pub message_time: String,
    /// Matches a message item (or its ancestor) sent by the account owner.
    pub outbound: String,
    /// Matches platform-generated notices.
    pub system: String,
    /// Day separators between bubbles; bare clock times belong to the last one seen.
    pub date_divider: String,
    /// One row per conversation on the inbox page.
    pub inbox_item: String,
    pub inbox_name: String,
    /// Service and location line, e.g. `Interior ∙ Seoul Mapo`.
    pub inbox_service: String,
    pub inbox_last_message: String,
    pub inbox_time: String,
    pub inbox_unread: String,
    pub inbox_price: String,
    pub logout_link: String,
    pub account_nav: String,
    pub password_input: String,
    /// Text only rendered for a logged-in user, e.g. a "log out" label.
    pub logout_text: String,
    /// Path prefixes that bounce anonymous users to the login page.
    pub restricted_paths: Vec<String>,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            title: ".chat-room-header h1, .request-title, [class*=\"request-title\"], .chat-room-title".into(),
            counterpart: ".chat-room-header .user-name, .profile-name, [class*=\"user-name\"]".into(),
            category: ".service-type, [class*=\"service-type\"], .category-name".into(),
            location: ".location, [class*=\"location\"], .region".into(),
            price: ".price, [class*=\"price\"], .quote-price, .estimate-price".into(),
            unread_badge: ".unread-count, [class*=\"unread\"]".into(),
            message_item: ".chat-message, .message-item, [class*=\"message-bubble\"], [class*=\"message-wrap\"]".into(),
            message_content: ".message-content, .bubble-content, [class*=\"content\"], .text".into(),
            message_time: ".time, .message-time, [class*=\"time\"]".into(),
            outbound: ".my-message, .is-me, .message-right".into(),
            system: ".system-message, [class*=\"system\"]".into(),
            date_divider: ".date-divider, .chat-date, [class*=\"date-line\"], [class*=\"date-divider\"]".into(),
            inbox_item: ".chat-item, .chat-room-item, [class*=\"chat\"][class*=\"item\"]".into(),
            inbox_name: "[class*=\"user-name\"], .prisma-typography.body2\\:semibold".into(),
            inbox_service: "[class*=\"service-info\"], .prisma-typography.body4\\:regular.primary".into(),
            inbox_last_message: "[class*=\"last-message\"], .prisma-typography.body3\\:regular".into(),
            inbox_time: "[class*=\"time\"], .prisma-typography.body4\\:regular.tertiary".into(),
            inbox_unread: ".unread-count-badge, [class*=\"unread\"], [class*=\"notification-badge\"]".into(),
            inbox_price: "[class*=\"price\"], .prisma-typography.body3\\:semibold.primary".into(),
            logout_link: "a[href*=\"/logout\"]".into(),
            account_nav: ".profile, .avatar, .user-menu, .user-profile".into(),
            password_input: "input[type=\"password\"]".into(),
            logout_text: "로그아웃".into(),
            restricted_paths: vec![
                "/pro/".into(),
                "/requests/".into(),
                "/dashboard".into(),
                "/account".into(),
            ],
        }
    }
}

/// `[session]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Where the session artifact (cookies) is persisted between runs.
    #[serde(default = "default_artifact_path")]
    pub artifact_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            artifact_path: default_artifact_path(),
        }
    }
}

fn default_artifact_path() -> String {
    "~/.inboxmirror/session.json".into()
}

/// `[jobs]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// A running job older than this is reported as done by status reads.
    #[serde(default = "default_status_stale_secs")]
    pub status_stale_secs: u64,

    /// Callers stop waiting on a running job after this long.
    #[serde(default = "default_abandon_after_secs")]
    pub abandon_after_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            status_stale_secs: default_status_stale_secs(),
            abandon_after_secs: default_abandon_after_secs(),
        }
    }
}

impl JobsConfig {
    pub fn status_stale_after(&self) -> Duration {
        Duration::from_secs(self.status_stale_secs)
    }

    pub fn abandon_after(&self) -> Duration {
        Duration::from_secs(self.abandon_after_secs)
    }
}

fn default_status_stale_secs() -> u64 {
    30
}
fn default_abandon_after_secs() -> u64 {
    60
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.inboxmirror/inbox.db".into()
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    3000
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Login pair for the source, resolved from the environment.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Read the source credentials from the env vars named in the config.
pub fn resolve_credentials(config: &SourceConfig) -> Result<Credentials> {
    let read = |var_name: &str| match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(MirrorError::config(format!(
            "source credentials not found. Set the {var_name} environment variable."
        ))),
    };

    Ok(Credentials {
        username: read(&config.username_env)?,
        password: read(&config.password_env)?,
    })
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.inboxmirror/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| MirrorError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.inboxmirror/inboxmirror.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_path(raw: &str) -> Result<PathBuf> {
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| MirrorError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| MirrorError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| MirrorError::config(format!("failed to parse {}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject configs that would make the job tracker or source unusable.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.jobs.status_stale_secs == 0 {
        return Err(MirrorError::config("jobs.status_stale_secs must be positive"));
    }
    if config.jobs.abandon_after_secs < config.jobs.status_stale_secs {
        return Err(MirrorError::config(
            "jobs.abandon_after_secs must not be shorter than jobs.status_stale_secs",
        ));
    }
    if !config.source.chat_path.contains("{key}") {
        return Err(MirrorError::config("source.chat_path must contain {key}"));
    }
    url::Url::parse(&config.source.base_url).map_err(|e| {
        MirrorError::config(format!("invalid source.base_url '{}': {e}", config.source.base_url))
    })?;
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| MirrorError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| MirrorError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| MirrorError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("status_stale_secs"));
        assert!(toml_str.contains("INBOXMIRROR_PASSWORD"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.jobs.status_stale_secs, 30);
        assert_eq!(parsed.jobs.abandon_after_secs, 60);
        assert_eq!(parsed.source.selectors.restricted_paths.len(), 4);
        assert!(parsed.source.headless);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[source]
base_url = "https://chat.example.com"
headless = false

[source.selectors]
title = "h1.room"

[server]
port = 8080
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.source.base_url, "https://chat.example.com");
        assert!(!config.source.headless);
        assert_eq!(config.source.selectors.title, "h1.room");
        assert_eq!(config.source.selectors.logout_link, "a[href*=\"/logout\"]");
        assert!(config.source.selectors.inbox_item.contains(".chat-item"));
        assert_eq!(config.source.inbox_path, "/pro/chats");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.jobs.status_stale_secs, 30);
    }

    #[test]
    fn validation_rejects_inverted_thresholds() {
        let mut config = AppConfig::default();
        config.jobs.abandon_after_secs = 10;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("abandon_after_secs"));
    }

    #[test]
    fn validation_requires_key_placeholder() {
        let mut config = AppConfig::default();
        config.source.chat_path = "/chats/".into();
        assert!(validate_config(&config).is_err());
        assert!(validate_config(&AppConfig::default()).is_ok());
    }

    #[test]
    fn expand_path_handles_home_prefix() {
        let plain = expand_path("/tmp/inbox.db").unwrap();
        assert_eq!(plain, PathBuf::from("/tmp/inbox.db"));

        let expanded = expand_path("~/inbox.db").unwrap();
        assert!(expanded.ends_with("inbox.db"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn missing_credentials_error() {
        let mut source = SourceConfig::default();
        // Use unique env var names to avoid interfering with other tests
        source.username_env = "IM_TEST_NONEXISTENT_USER_12345".into();
        source.password_env = "IM_TEST_NONEXISTENT_PASS_12345".into();
        let err = resolve_credentials(&source).unwrap_err();
        assert!(err.to_string().contains("IM_TEST_NONEXISTENT_USER_12345"));
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials {
            username: "pro@example.com".into(),
            password: "hunter2".into(),
        };
        let printed = format!("{creds:?}");
        assert!(printed.contains("pro@example.com"));
        assert!(!printed.contains("hunter2"));
    }
}
