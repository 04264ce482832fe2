//! libSQL storage layer for mirrored conversations.
//!
//! The [`Storage`] struct wraps a local libSQL database holding target records
//! and their append-only message log.
//!
//! **Access rules:**
//! - `serve` and `crawl`: read-write via [`Storage::open`]. Writes from
//!   concurrent jobs are serialized inside the handle.
//! - Read-only CLI commands: [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use inboxmirror_shared::{
    Direction, DisplayMetadata, MessageChannel, MessageKey, MessageRecord, MirrorError,
    RawMessage, Result, TargetId, TargetRecord, TargetStatus,
};
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;

const TARGET_COLUMNS: &str = "id, external_key, title, counterpart, category, location, price, \
     status, has_unread, unread_count, last_message, last_message_at, message_count, \
     created_at, updated_at";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
    conn: Connection,
    readonly: bool,
    /// Held for the duration of every write so transactions never interleave.
    write_lock: Mutex<()>,
}

/// Filter and page selection for [`Storage::list_targets`].
#[derive(Debug, Clone)]
pub struct TargetFilter {
    pub status: Option<TargetStatus>,
    pub exclude_status: Vec<TargetStatus>,
    /// 1-based page number.
    pub page: u32,
    pub limit: u32,
}

impl Default for TargetFilter {
    fn default() -> Self {
        Self {
            status: None,
            exclude_status: Vec::new(),
            page: 1,
            limit: 20,
        }
    }
}

/// One page of targets plus the total number matching the filter.
#[derive(Debug, Clone)]
pub struct TargetPage {
    pub items: Vec<TargetRecord>,
    pub total: u64,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MirrorError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;
        // WAL lets readers on the shared connection run beside a batch
        // transaction on its own connection, seeing only committed rows.
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .await
            .map_err(storage_err)?;
        set_busy_timeout(&conn).await?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(MirrorError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;

        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        MirrorError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(MirrorError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Target operations
    // -----------------------------------------------------------------------

    /// Insert a new target record.
    ///
    /// Fails if another record already carries the same external key.
    pub async fn insert_target(&self, record: &TargetRecord) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO targets ({TARGET_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    record.id.to_string(),
                    record.external_key.as_deref(),
                    record.metadata.title.as_deref(),
                    record.metadata.counterpart.as_deref(),
                    record.metadata.category.as_deref(),
                    record.metadata.location.as_deref(),
                    record.metadata.price.as_deref(),
                    record.status.as_str(),
                    i64::from(record.has_unread),
                    record.unread_count.map(i64::from),
                    record.last_message.as_deref(),
                    record.last_message_at.map(|t| t.to_rfc3339()),
                    record.message_count as i64,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Write a reconciled snapshot onto an existing record and return the
    /// stored row.
    ///
    /// Display fields, the external key, the unread count and the last-message
    /// preview are taken from `record`. Status and the unread marker are
    /// merged against the row as it is now, so an operator change that landed
    /// after `record` was read is kept: `unread` can only set the marker and
    /// only advances `new` to `active`. `message_count` is owned by
    /// [`Storage::commit_messages`] and is not written here.
    pub async fn merge_target(&self, record: &TargetRecord, unread: bool) -> Result<TargetRecord> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn
            .execute(
                "UPDATE targets SET
                   external_key = ?2, title = ?3, counterpart = ?4, category = ?5,
                   location = ?6, price = ?7,
                   status = CASE WHEN status = 'new' AND ?8 THEN 'active' ELSE status END,
                   has_unread = CASE WHEN ?8 THEN 1 ELSE has_unread END,
                   unread_count = ?9, last_message = ?10, last_message_at = ?11,
                   updated_at = ?12
                 WHERE id = ?1",
                params![
                    record.id.to_string(),
                    record.external_key.as_deref(),
                    record.metadata.title.as_deref(),
                    record.metadata.counterpart.as_deref(),
                    record.metadata.category.as_deref(),
                    record.metadata.location.as_deref(),
                    record.metadata.price.as_deref(),
                    i64::from(unread),
                    record.unread_count.map(i64::from),
                    record.last_message.as_deref(),
                    record.last_message_at.map(|t| t.to_rfc3339()),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(storage_err)?;

        if affected == 0 {
            return Err(MirrorError::NotFound(format!("target {}", record.id)));
        }

        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE id = ?1"),
                params![record.id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        match rows.next().await {
            Ok(Some(row)) => row_to_target(&row),
            Ok(None) => Err(MirrorError::NotFound(format!("target {}", record.id))),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Get a target by its local id.
    pub async fn get_target(&self, id: &TargetId) -> Result<Option<TargetRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_target(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Get the target currently carrying `external_key`, if any.
    pub async fn find_by_external_key(&self, external_key: &str) -> Result<Option<TargetRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE external_key = ?1"),
                params![external_key],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_target(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// List targets, most recently updated first.
    pub async fn list_targets(&self, filter: &TargetFilter) -> Result<TargetPage> {
        let status = filter.status.map(|s| s.as_str());
        let excluded = serde_json::to_string(
            &filter
                .exclude_status
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>(),
        )
        .map_err(|e| MirrorError::Storage(e.to_string()))?;
        let limit = filter.limit.max(1);
        let offset = (filter.page.max(1) - 1) as i64 * limit as i64;

        const WHERE: &str = "WHERE (?1 IS NULL OR status = ?1)
               AND status NOT IN (SELECT value FROM json_each(?2))";

        let mut rows = self
            .conn
            .query(
                &format!("SELECT COUNT(*) FROM targets {WHERE}"),
                params![status, excluded.as_str()],
            )
            .await
            .map_err(storage_err)?;
        let total = match rows.next().await {
            Ok(Some(row)) => row.get::<i64>(0).map_err(storage_err)? as u64,
            Ok(None) => 0,
            Err(e) => return Err(storage_err(e)),
        };

        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TARGET_COLUMNS} FROM targets {WHERE}
                     ORDER BY updated_at DESC, id DESC
                     LIMIT ?3 OFFSET ?4"
                ),
                params![status, excluded.as_str(), limit as i64, offset],
            )
            .await
            .map_err(storage_err)?;

        let mut items = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            items.push(row_to_target(&row)?);
        }
        Ok(TargetPage { items, total })
    }

    /// Operator status change. Returns `false` if the target does not exist.
    pub async fn set_status(&self, id: &TargetId, status: TargetStatus) -> Result<bool> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn
            .execute(
                "UPDATE targets SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now.as_str(), id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(affected > 0)
    }

    /// Operator acknowledgement of new content. Returns `false` if the target
    /// does not exist.
    pub async fn clear_unread(&self, id: &TargetId) -> Result<bool> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let affected = self
            .conn
            .execute(
                "UPDATE targets SET has_unread = 0 WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Message operations
    // -----------------------------------------------------------------------

    /// Identity triples of every persisted message for a target.
    pub async fn list_message_keys(&self, target_id: &TargetId) -> Result<Vec<MessageKey>> {
        let mut rows = self
            .conn
            .query(
                "SELECT content, sent_at, direction FROM messages WHERE target_id = ?1",
                params![target_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        let mut keys = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let direction: String = row.get(2).map_err(storage_err)?;
            keys.push(MessageKey {
                content: row.get(0).map_err(storage_err)?,
                sent_at: parse_time(&row.get::<String>(1).map_err(storage_err)?)?,
                direction: direction.parse()?,
            });
        }
        Ok(keys)
    }

    /// All messages for a target, oldest first.
    pub async fn list_messages(&self, target_id: &TargetId) -> Result<Vec<MessageRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, target_id, content, sent_at, direction, channel, created_at
                 FROM messages WHERE target_id = ?1 ORDER BY sent_at ASC, id ASC",
                params![target_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_message(&row)?);
        }
        Ok(results)
    }

    /// Number of persisted message rows for a target.
    pub async fn count_messages(&self, target_id: &TargetId) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM messages WHERE target_id = ?1",
                params![target_id.to_string()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(storage_err)? as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// A fresh connection for one write transaction. Uncommitted rows stay
    /// invisible to the shared read connection.
    async fn batch_connection(&self) -> Result<Connection> {
        let conn = self.db.connect().map_err(storage_err)?;
        set_busy_timeout(&conn).await?;
        Ok(conn)
    }

    /// Insert a batch of messages and refresh the target's `message_count`.
    ///
    /// Runs in one transaction: either every message lands and the count is
    /// updated, or nothing changes. Returns the new message count.
    pub async fn commit_messages(&self, target_id: &TargetId, messages: &[RawMessage]) -> Result<u64> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        let conn = self.batch_connection().await?;
        let tx = conn.transaction().await.map_err(storage_err)?;
        match insert_batch(&tx, target_id, messages).await {
            Ok(total) => {
                tx.commit().await.map_err(storage_err)?;
                Ok(total)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn set_busy_timeout(conn: &Connection) -> Result<()> {
    // PRAGMA busy_timeout reports the new value as a row.
    let mut rows = conn
        .query("PRAGMA busy_timeout = 5000", params![])
        .await
        .map_err(storage_err)?;
    while let Ok(Some(_)) = rows.next().await {}
    Ok(())
}

async fn insert_batch(conn: &Connection, target_id: &TargetId, messages: &[RawMessage]) -> Result<u64> {
    let id = target_id.to_string();
    let now = Utc::now().to_rfc3339();

    for message in messages {
        conn.execute(
            "INSERT INTO messages (target_id, content, sent_at, direction, channel, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.as_str(),
                message.content.as_str(),
                format_sent_at(message.sent_at),
                message.direction.as_str(),
                message.channel.as_str(),
                now.as_str(),
            ],
        )
        .await
        .map_err(storage_err)?;
    }

    let affected = conn
        .execute(
            "UPDATE targets
             SET message_count = (SELECT COUNT(*) FROM messages WHERE target_id = ?1),
                 updated_at = ?2
             WHERE id = ?1",
            params![id.as_str(), now.as_str()],
        )
        .await
        .map_err(storage_err)?;
    if affected == 0 {
        return Err(MirrorError::NotFound(format!("target {target_id}")));
    }

    let mut rows = conn
        .query(
            "SELECT message_count FROM targets WHERE id = ?1",
            params![id.as_str()],
        )
        .await
        .map_err(storage_err)?;
    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(storage_err)? as u64),
        Ok(None) => Err(MirrorError::NotFound(format!("target {target_id}"))),
        Err(e) => Err(storage_err(e)),
    }
}

fn storage_err(e: libsql::Error) -> MirrorError {
    MirrorError::Storage(e.to_string())
}

/// Fixed-width UTC form so equal instants compare equal as text and sort
/// chronologically.
fn format_sent_at(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MirrorError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to a [`TargetRecord`].
fn row_to_target(row: &libsql::Row) -> Result<TargetRecord> {
    let id: String = row.get(0).map_err(storage_err)?;
    let status: String = row.get(7).map_err(storage_err)?;
    Ok(TargetRecord {
        id: id
            .parse()
            .map_err(|e| MirrorError::Storage(format!("invalid target id '{id}': {e}")))?,
        external_key: row.get::<String>(1).ok(),
        metadata: DisplayMetadata {
            title: row.get::<String>(2).ok(),
            counterpart: row.get::<String>(3).ok(),
            category: row.get::<String>(4).ok(),
            location: row.get::<String>(5).ok(),
            price: row.get::<String>(6).ok(),
        },
        status: status.parse::<TargetStatus>()?,
        has_unread: row.get::<i64>(8).map_err(storage_err)? != 0,
        unread_count: row.get::<i64>(9).ok().map(|v| v as u32),
        last_message: row.get::<String>(10).ok(),
        last_message_at: match row.get::<String>(11).ok() {
            Some(s) => Some(parse_time(&s)?),
            None => None,
        },
        message_count: row.get::<i64>(12).map_err(storage_err)? as u64,
        created_at: parse_time(&row.get::<String>(13).map_err(storage_err)?)?,
        updated_at: parse_time(&row.get::<String>(14).map_err(storage_err)?)?,
    })
}

/// Convert a database row to a [`MessageRecord`].
fn row_to_message(row: &libsql::Row) -> Result<MessageRecord> {
    let target_id: String = row.get(1).map_err(storage_err)?;
    let direction: String = row.get(4).map_err(storage_err)?;
    let channel: String = row.get(5).map_err(storage_err)?;
    Ok(MessageRecord {
        id: row.get(0).map_err(storage_err)?,
        target_id: target_id
            .parse()
            .map_err(|e| MirrorError::Storage(format!("invalid target id '{target_id}': {e}")))?,
        content: row.get(2).map_err(storage_err)?,
        sent_at: parse_time(&row.get::<String>(3).map_err(storage_err)?)?,
        direction: direction.parse::<Direction>()?,
        channel: channel.parse::<MessageChannel>()?,
        created_at: parse_time(&row.get::<String>(6).map_err(storage_err)?)?,
    })
}
