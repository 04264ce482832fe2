//! SQL migration definitions for the inboxmirror database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: targets, messages",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Mirrored conversations. `id` is local; `external_key` is the source's id.
CREATE TABLE IF NOT EXISTS targets (
    id              TEXT PRIMARY KEY,
    external_key    TEXT UNIQUE,
    title           TEXT,
    counterpart     TEXT,
    category        TEXT,
    location        TEXT,
    price           TEXT,
    status          TEXT NOT NULL DEFAULT 'new',
    has_unread      INTEGER NOT NULL DEFAULT 0,
    unread_count    INTEGER,
    last_message    TEXT,
    last_message_at TEXT,
    message_count   INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_targets_status ON targets(status);
CREATE INDEX IF NOT EXISTS idx_targets_updated_at ON targets(updated_at);

-- Append-only message log. `sent_at` is RFC 3339 with nanoseconds, UTC.
CREATE TABLE IF NOT EXISTS messages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    target_id  TEXT NOT NULL REFERENCES targets(id) ON DELETE CASCADE,
    content    TEXT NOT NULL,
    sent_at    TEXT NOT NULL,
    direction  TEXT NOT NULL,
    channel    TEXT NOT NULL DEFAULT 'chat',
    created_at TEXT NOT NULL,
    UNIQUE(target_id, content, sent_at, direction)
);

CREATE INDEX IF NOT EXISTS idx_messages_target_sent ON messages(target_id, sent_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
