//! Core domain types for mirrored conversations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MirrorError;

// ---------------------------------------------------------------------------
// TargetId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for local target identifiers (time-sortable).
///
/// Always generated locally. It is never derived from the source's own
/// conversation id, which lives in [`TargetRecord::external_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub Uuid);

impl TargetId {
    /// Generate a new time-sortable target identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TargetId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// TargetStatus
// ---------------------------------------------------------------------------

/// Operator-facing lifecycle of a conversation.
///
/// Reconciliation only ever moves `New` to `Active`. Every other transition
/// belongs to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    #[default]
    New,
    Active,
    Quoted,
    Accepted,
    Rejected,
    Resolved,
    Closed,
}

impl TargetStatus {
    pub const ALL: [TargetStatus; 7] = [
        Self::New,
        Self::Active,
        Self::Quoted,
        Self::Accepted,
        Self::Rejected,
        Self::Resolved,
        Self::Closed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Quoted => "quoted",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TargetStatus {
    type Err = MirrorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| MirrorError::validation(format!("unknown status '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// DisplayMetadata
// ---------------------------------------------------------------------------

/// Human-facing conversation details scraped from the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterpart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
}

impl DisplayMetadata {
    /// Overwrite each field the newer snapshot carries; keep the rest.
    ///
    /// Blank strings count as absent. Returns `true` if anything changed.
    pub fn merge_from(&mut self, newer: &DisplayMetadata) -> bool {
        let mut changed = false;
        for (slot, incoming) in [
            (&mut self.title, &newer.title),
            (&mut self.counterpart, &newer.counterpart),
            (&mut self.category, &newer.category),
            (&mut self.location, &newer.location),
            (&mut self.price, &newer.price),
        ] {
            if let Some(value) = present(incoming) {
                if slot.as_deref() != Some(value) {
                    *slot = Some(value.to_string());
                    changed = true;
                }
            }
        }
        changed
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// TargetRecord
// ---------------------------------------------------------------------------

/// The local representation of one external conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub id: TargetId,
    /// Source-assigned conversation id, unique when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_key: Option<String>,
    #[serde(flatten)]
    pub metadata: DisplayMetadata,
    pub status: TargetStatus,
    pub has_unread: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TargetRecord {
    /// A fresh record in the `New` state with no messages.
    pub fn new(external_key: Option<String>, metadata: DisplayMetadata) -> Self {
        let now = Utc::now();
        Self {
            id: TargetId::new(),
            external_key,
            metadata,
            status: TargetStatus::New,
            has_unread: false,
            unread_count: None,
            last_message: None,
            last_message_at: None,
            message_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Who sent a message, from the mirror owner's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sent by the counterpart.
    Inbound,
    /// Sent by the account owner.
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = MirrorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(MirrorError::parse(format!("unknown direction '{other}'"))),
        }
    }
}

/// Where a message originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageChannel {
    /// Written by one of the two participants.
    #[default]
    Chat,
    /// Notice injected by the platform itself.
    System,
}

impl MessageChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for MessageChannel {
    type Err = MirrorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Self::Chat),
            "system" => Ok(Self::System),
            other => Err(MirrorError::parse(format!("unknown channel '{other}'"))),
        }
    }
}

/// One message as extracted from the source, before persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub direction: Direction,
    #[serde(default)]
    pub channel: MessageChannel,
}

impl RawMessage {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            content: self.content.clone(),
            sent_at: self.sent_at,
            direction: self.direction,
        }
    }
}

/// Identity of a message: exact content, instant, and direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub direction: Direction,
}

/// A persisted message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub target_id: TargetId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub direction: Direction,
    pub channel: MessageChannel,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Snapshots and jobs
// ---------------------------------------------------------------------------

/// One point-in-time extraction of a conversation's header.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub external_key: String,
    #[serde(default)]
    pub metadata: DisplayMetadata,
    /// Unread badge as reported by the source, if it shows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Lifecycle of a crawl job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// Nothing has run for this target in the current process.
    #[default]
    Idle,
    Running,
    Done,
    Failed,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_id_roundtrip() {
        let id = TargetId::new();
        let s = id.to_string();
        let parsed: TargetId = s.parse().expect("parse TargetId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!("Resolved".parse::<TargetStatus>().unwrap(), TargetStatus::Resolved);
        assert_eq!(" new ".parse::<TargetStatus>().unwrap(), TargetStatus::New);
        assert!("pending".parse::<TargetStatus>().is_err());
    }

    #[test]
    fn stored_direction_and_channel_parse() {
        assert_eq!("outbound".parse::<Direction>().unwrap(), Direction::Outbound);
        assert_eq!("system".parse::<MessageChannel>().unwrap(), MessageChannel::System);

        let err = "sideways".parse::<Direction>().unwrap_err();
        assert!(matches!(err, MirrorError::Parse { .. }));
        let err = "email".parse::<MessageChannel>().unwrap_err();
        assert!(matches!(err, MirrorError::Parse { .. }));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TargetStatus::Active).unwrap();
        assert_eq!(json, "\"active\"");
    }

    #[test]
    fn metadata_merge_overwrites_present_fields_only() {
        let mut current = DisplayMetadata {
            title: Some("Old title".into()),
            counterpart: Some("Kim".into()),
            location: Some("Seoul".into()),
            ..Default::default()
        };
        let newer = DisplayMetadata {
            title: Some("New title".into()),
            counterpart: Some("   ".into()),
            price: Some("50,000".into()),
            ..Default::default()
        };

        assert!(current.merge_from(&newer));
        assert_eq!(current.title.as_deref(), Some("New title"));
        assert_eq!(current.counterpart.as_deref(), Some("Kim"));
        assert_eq!(current.location.as_deref(), Some("Seoul"));
        assert_eq!(current.price.as_deref(), Some("50,000"));
    }

    #[test]
    fn metadata_merge_reports_no_change() {
        let mut current = DisplayMetadata {
            title: Some("Same".into()),
            ..Default::default()
        };
        let newer = current.clone();
        assert!(!current.merge_from(&newer));
    }

    #[test]
    fn message_key_ignores_channel() {
        let at = Utc::now();
        let a = RawMessage {
            content: "hi".into(),
            sent_at: at,
            direction: Direction::Inbound,
            channel: MessageChannel::Chat,
        };
        let b = RawMessage {
            channel: MessageChannel::System,
            ..a.clone()
        };
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn record_serializes_flat_metadata() {
        let record = TargetRecord::new(
            Some("42".into()),
            DisplayMetadata {
                title: Some("A".into()),
                ..Default::default()
            },
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["title"], "A");
        assert_eq!(json["external_key"], "42");
        assert_eq!(json["status"], "new");
    }
}
