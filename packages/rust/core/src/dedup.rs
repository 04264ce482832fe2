//! Incremental message commits.
//!
//! The source exposes no stable message id, so a message is identified by
//! its exact `(content, sent_at, direction)` triple. Re-scraping a
//! conversation therefore inserts only the triples not seen before.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use inboxmirror_shared::{MessageKey, RawMessage, Result, TargetId};
use inboxmirror_storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DedupOutcome {
    pub inserted: usize,
    pub skipped: usize,
    /// Persisted rows for the target after the commit.
    pub message_count: u64,
}

/// Keep the messages whose triple is neither persisted nor repeated earlier
/// in `incoming`. Order is preserved.
pub(crate) fn select_new(existing: Vec<MessageKey>, incoming: &[RawMessage]) -> Vec<RawMessage> {
    let mut seen: HashSet<MessageKey> = existing.into_iter().collect();
    incoming
        .iter()
        .filter(|message| seen.insert(message.key()))
        .cloned()
        .collect()
}

pub struct MessageDeduplicator {
    storage: Arc<Storage>,
}

impl MessageDeduplicator {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Commit the genuinely new subset of `incoming` in one transaction and
    /// refresh the target's message count.
    #[instrument(skip_all, fields(target_id = %target_id, incoming = incoming.len()))]
    pub async fn commit(&self, target_id: &TargetId, incoming: &[RawMessage]) -> Result<DedupOutcome> {
        let existing = self.storage.list_message_keys(target_id).await?;
        let fresh = select_new(existing, incoming);

        let message_count = self.storage.commit_messages(target_id, &fresh).await?;
        let outcome = DedupOutcome {
            inserted: fresh.len(),
            skipped: incoming.len() - fresh.len(),
            message_count,
        };
        debug!(
            inserted = outcome.inserted,
            skipped = outcome.skipped,
            message_count,
            "messages committed"
        );
        Ok(outcome)
    }
}
