//! CLI command definitions, routing, and tracing setup.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use inboxmirror_core::{CrawlReport, CrawlRequest, CrawlService, JobTracker, ProgressReporter};
use inboxmirror_crawler::{HttpSource, SessionManager};
use inboxmirror_server::AppState;
use inboxmirror_shared::{
    AppConfig, TargetId, TargetRecord, TargetStatus, expand_path, init_config, load_config,
    resolve_credentials,
};
use inboxmirror_storage::{Storage, TargetFilter};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// inboxmirror: keep a local, deduplicated mirror of a chat inbox.
#[derive(Parser)]
#[command(
    name = "inboxmirror",
    version,
    about = "Mirror a chat inbox into a local database and track its conversations.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the operator HTTP API.
    Serve {
        /// Listen host (overrides config).
        #[arg(long)]
        host: Option<String>,

        /// Listen port (overrides config).
        #[arg(long)]
        port: Option<u16>,
    },

    /// Sync every conversation on the inbox list in the foreground.
    Sync,

    /// Crawl one conversation in the foreground.
    Crawl {
        /// Local target id or the source's conversation id.
        target: String,

        /// Chat URL or id to extract from instead of the stored one.
        #[arg(long)]
        locator: Option<String>,
    },

    /// Session management.
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// List mirrored conversations.
    Targets {
        /// Only this status.
        #[arg(long)]
        status: Option<TargetStatus>,

        /// Leave out these statuses (repeatable).
        #[arg(long = "exclude")]
        exclude: Vec<TargetStatus>,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "20")]
        limit: u32,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Print the stored messages of a conversation.
    Messages {
        target: String,
    },

    /// Change a conversation's workflow status.
    SetStatus {
        target: String,
        status: TargetStatus,
    },

    /// Mark a conversation as read.
    ClearUnread {
        target: String,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum SessionAction {
    /// Restore or establish a session and report whether it is live.
    Check,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "inboxmirror=info",
        1 => "inboxmirror=debug",
        _ => "inboxmirror=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve { host, port } => cmd_serve(host, port).await,
        Command::Sync => cmd_sync().await,
        Command::Crawl { target, locator } => cmd_crawl(target, locator).await,
        Command::Session { action } => match action {
            SessionAction::Check => cmd_session_check().await,
        },
        Command::Targets {
            status,
            exclude,
            page,
            limit,
            json,
        } => {
            let filter = TargetFilter {
                status,
                exclude_status: exclude,
                page: page.max(1),
                limit: limit.clamp(1, 100),
            };
            cmd_targets(&filter, json).await
        }
        Command::Messages { target } => cmd_messages(&target).await,
        Command::SetStatus { target, status } => cmd_set_status(&target, status).await,
        Command::ClearUnread { target } => cmd_clear_unread(&target).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

async fn open_storage(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = expand_path(&config.storage.db_path)?;
    Ok(Arc::new(Storage::open(&path).await?))
}

/// Assemble the crawl service from config: one shared source session, one
/// tracker, one database.
async fn build_service(config: &AppConfig) -> Result<Arc<CrawlService>> {
    let storage = open_storage(config).await?;
    let source = Arc::new(HttpSource::new(config.source.clone())?);

    let credentials = match resolve_credentials(&config.source) {
        Ok(credentials) => Some(credentials),
        Err(e) => {
            warn!(error = %e, "no credentials; relying on the saved session only");
            None
        }
    };
    let session = Arc::new(SessionManager::new(
        source.clone(),
        credentials,
        expand_path(&config.session.artifact_path)?,
    ));
    let tracker = Arc::new(JobTracker::from_config(&config.jobs));

    Ok(Arc::new(CrawlService::new(tracker, session, source, storage)))
}

/// Resolve a target by local id, then by the source's conversation id.
async fn find_target(storage: &Storage, key: &str) -> Result<TargetRecord> {
    if let Ok(id) = key.parse::<TargetId>() {
        if let Some(record) = storage.get_target(&id).await? {
            return Ok(record);
        }
    }
    storage
        .find_by_external_key(key)
        .await?
        .ok_or_else(|| eyre!("no conversation matches '{key}'"))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = load_config()?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let service = build_service(&config).await?;
    let state = Arc::new(AppState::new(Arc::clone(&service)));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutting down");
    };

    let served = inboxmirror_server::serve(&config.server, state, shutdown).await;
    service.session().close().await;
    served?;
    Ok(())
}

async fn cmd_sync() -> Result<()> {
    let config = load_config()?;
    let service = build_service(&config).await?;

    info!("starting inbox sync");
    let reporter = CliProgress::new();

    let result = tokio::select! {
        result = service.sync(&reporter) => result,
        _ = tokio::signal::ctrl_c() => {
            reporter.spinner.finish_and_clear();
            service.session().close().await;
            return Err(eyre!("interrupted"));
        }
    };
    reporter.spinner.finish_and_clear();
    service.session().close().await;
    let report = result?;

    println!();
    println!("  Inbox synced.");
    println!("  Rows:    {}", report.rows);
    println!("  Created: {}", report.created);
    println!("  Updated: {}", report.updated);
    println!("  Unread:  {}", report.unread);
    if report.failed > 0 {
        println!("  Failed:  {} (see log)", report.failed);
    }
    println!("  Time:    {:.1}s", report.elapsed.as_secs_f64());
    println!();

    Ok(())
}

async fn cmd_crawl(target: String, locator: Option<String>) -> Result<()> {
    let config = load_config()?;
    let service = build_service(&config).await?;
    let request = CrawlRequest {
        target_key: target,
        locator,
    };

    info!(target_key = %request.target_key, "starting crawl");
    let reporter = CliProgress::new();

    let result = tokio::select! {
        result = service.crawl(&request, &reporter) => result,
        _ = tokio::signal::ctrl_c() => {
            reporter.spinner.finish_and_clear();
            service.session().close().await;
            return Err(eyre!("interrupted"));
        }
    };
    reporter.spinner.finish_and_clear();
    service.session().close().await;
    let report = result?;

    println!();
    println!("  Conversation mirrored.");
    println!("  Target:   {}", report.target_id);
    println!("  Key:      {}", report.external_key);
    println!("  Outcome:  {}", serde_json::to_string(&report.outcome)?);
    println!("  Unread:   {}", if report.unread_detected { "yes" } else { "no" });
    println!("  Inserted: {} ({} already stored)", report.inserted, report.skipped);
    println!("  Messages: {}", report.message_count);
    println!("  Time:     {:.1}s", report.elapsed.as_secs_f64());
    println!();

    Ok(())
}

async fn cmd_session_check() -> Result<()> {
    let config = load_config()?;
    let service = build_service(&config).await?;
    let session = service.session();

    let live = session.ensure_valid().await;
    session.close().await;

    if live? {
        println!("Session is live (saved at {}).", session.artifact_path().display());
        Ok(())
    } else {
        Err(eyre!(
            "not logged in: set {} and {} or refresh the saved session",
            config.source.username_env,
            config.source.password_env
        ))
    }
}

async fn cmd_targets(filter: &TargetFilter, json: bool) -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open_readonly(&expand_path(&config.storage.db_path)?).await?;
    let page = storage.list_targets(filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&page.items)?);
        return Ok(());
    }

    if page.items.is_empty() {
        println!("No conversations.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<10}  {:<8}  {:>5}  {:>6}  TITLE",
        "ID", "KEY", "STATUS", "MSGS", "UNREAD"
    );
    for record in &page.items {
        println!(
            "{:<36}  {:<10}  {:<8}  {:>5}  {:>6}  {}",
            record.id,
            record.external_key.as_deref().unwrap_or("-"),
            record.status,
            record.message_count,
            if record.has_unread { "*" } else { "" },
            record.metadata.title.as_deref().unwrap_or(""),
        );
    }
    let total_pages = page.total.div_ceil(u64::from(filter.limit)).max(1);
    println!();
    println!("  Page {} of {} ({} total)", filter.page, total_pages, page.total);
    Ok(())
}

async fn cmd_messages(target: &str) -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open_readonly(&expand_path(&config.storage.db_path)?).await?;
    let record = find_target(&storage, target).await?;

    for message in storage.list_messages(&record.id).await? {
        let arrow = match message.direction {
            inboxmirror_shared::Direction::Inbound => "<",
            inboxmirror_shared::Direction::Outbound => ">",
        };
        println!(
            "{} {arrow} {}",
            message.sent_at.format("%Y-%m-%d %H:%M"),
            message.content
        );
    }
    Ok(())
}

async fn cmd_set_status(target: &str, status: TargetStatus) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let record = find_target(&storage, target).await?;

    storage.set_status(&record.id, status).await?;
    info!(target_id = %record.id, from = %record.status, to = %status, "status changed");
    println!("{} is now {status}", record.id);
    Ok(())
}

async fn cmd_clear_unread(target: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let record = find_target(&storage, target).await?;

    storage.clear_unread(&record.id).await?;
    println!("{} marked as read", record.id);
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn done(&self, _report: &CrawlReport) {
        self.spinner.finish_and_clear();
    }
}
