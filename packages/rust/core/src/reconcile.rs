//! Merging a fresh snapshot into the local target records.
//!
//! Identity resolution runs in a fixed priority order and is reported as an
//! explicit [`ReconcileOutcome`]:
//!
//! 1. a record already carries the snapshot's external key: update it
//! 2. the hinted record has no external key yet: attach the key (backfill)
//! 3. the hinted record carries a *different* key: leave it alone and create
//!    a new record for the snapshot (fork)
//! 4. otherwise: create a new record
//!
//! The local id is never derived from the external key, so a repeated
//! reconciliation of the same key always lands on the record created first.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use inboxmirror_shared::{MirrorError, RawSnapshot, Result, TargetId, TargetRecord, TargetStatus};
use inboxmirror_storage::Storage;

/// Which identity branch a reconciliation took.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Updated,
    Backfilled,
    /// The hinted record belongs to another conversation; a new record was
    /// created instead.
    Forked {
        diverged_from: TargetId,
        previous_external_key: String,
    },
    Created,
}

/// The committed record plus how it got there.
#[derive(Debug, Clone)]
pub struct Reconciled {
    pub record: TargetRecord,
    pub outcome: ReconcileOutcome,
    pub unread_detected: bool,
}

/// Identity decision, before any record is touched.
#[derive(Debug)]
enum Decision {
    Update(TargetRecord),
    Backfill(TargetRecord),
    Fork(TargetRecord),
    Create,
}

fn decide(by_external_key: Option<TargetRecord>, hinted: Option<TargetRecord>) -> Decision {
    if let Some(record) = by_external_key {
        return Decision::Update(record);
    }
    match hinted {
        Some(record) if has_key(&record) => Decision::Fork(record),
        Some(record) => Decision::Backfill(record),
        None => Decision::Create,
    }
}

fn has_key(record: &TargetRecord) -> bool {
    record
        .external_key
        .as_deref()
        .is_some_and(|k| !k.trim().is_empty())
}

/// Fold a snapshot into `record`. Returns whether new unread content was seen.
///
/// New content means the source's unread count went up, or the last message
/// preview differs from the stored one. When detected, the unread marker is
/// set and a `New` record advances to `Active`; no other status is touched.
fn apply_snapshot(record: &mut TargetRecord, snapshot: &RawSnapshot) -> bool {
    record.metadata.merge_from(&snapshot.metadata);

    let count_increased = match (record.unread_count, snapshot.unread_count) {
        (Some(old), Some(new)) => new > old,
        (None, Some(new)) => new > 0,
        (_, None) => false,
    };
    // A lower count is the source's latest word, so it replaces the stored one too.
    if let Some(new) = snapshot.unread_count {
        record.unread_count = Some(new);
    }

    let incoming_message = snapshot
        .last_message
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty());
    let message_changed = match incoming_message {
        Some(message) if record.last_message.as_deref() != Some(message) => {
            record.last_message = Some(message.to_string());
            record.last_message_at = snapshot.last_message_at.or(record.last_message_at);
            true
        }
        _ => false,
    };

    let unread = count_increased || message_changed;
    if unread {
        record.has_unread = true;
        if record.status == TargetStatus::New {
            record.status = TargetStatus::Active;
        }
    }
    record.updated_at = Utc::now();
    unread
}

/// Applies snapshots to storage, one at a time.
pub struct ReconciliationEngine {
    storage: Arc<Storage>,
    /// Held across decide + commit so two snapshots can't both decide "create".
    lock: Mutex<()>,
}

impl ReconciliationEngine {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    /// Merge `snapshot` into the local records and commit the result.
    ///
    /// `hint` names the local record the caller believes this snapshot
    /// belongs to; it only matters when no record carries the external key.
    #[instrument(skip_all, fields(external_key = %snapshot.external_key))]
    pub async fn reconcile(&self, snapshot: &RawSnapshot, hint: Option<&TargetId>) -> Result<Reconciled> {
        let external_key = snapshot.external_key.trim();
        if external_key.is_empty() {
            return Err(MirrorError::validation("snapshot has no external key"));
        }

        let _guard = self.lock.lock().await;

        let by_external_key = self.storage.find_by_external_key(external_key).await?;
        let hinted = match (hint, &by_external_key) {
            (Some(id), None) => self.storage.get_target(id).await?,
            _ => None,
        };

        let (record, outcome, unread_detected) = match decide(by_external_key, hinted) {
            Decision::Update(mut record) => {
                let unread = apply_snapshot(&mut record, snapshot);
                let record = self.storage.merge_target(&record, unread).await?;
                debug!(target_id = %record.id, unread, "updated existing target");
                (record, ReconcileOutcome::Updated, unread)
            }
            Decision::Backfill(mut record) => {
                record.external_key = Some(external_key.to_string());
                let unread = apply_snapshot(&mut record, snapshot);
                let record = self.storage.merge_target(&record, unread).await?;
                info!(target_id = %record.id, "attached external key to existing target");
                (record, ReconcileOutcome::Backfilled, unread)
            }
            Decision::Fork(original) => {
                let previous_external_key = original.external_key.clone().unwrap_or_default();
                let (record, unread) = self.create(external_key, snapshot).await?;
                warn!(
                    diverged_from = %original.id,
                    previous_external_key = %previous_external_key,
                    new_target_id = %record.id,
                    "hinted target belongs to another conversation, forked a new record"
                );
                let outcome = ReconcileOutcome::Forked {
                    diverged_from: original.id,
                    previous_external_key,
                };
                (record, outcome, unread)
            }
            Decision::Create => {
                let (record, unread) = self.create(external_key, snapshot).await?;
                info!(target_id = %record.id, "created target");
                (record, ReconcileOutcome::Created, unread)
            }
        };

        Ok(Reconciled {
            record,
            outcome,
            unread_detected,
        })
    }

    async fn create(&self, external_key: &str, snapshot: &RawSnapshot) -> Result<(TargetRecord, bool)> {
        let mut record = TargetRecord::new(Some(external_key.to_string()), Default::default());
        let unread = apply_snapshot(&mut record, snapshot);
        self.storage.insert_target(&record).await?;
        Ok((record, unread))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inboxmirror_shared::DisplayMetadata;
    use uuid::Uuid;

    async fn test_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("im_reconcile_{}.db", Uuid::now_v7()));
        Arc::new(Storage::open(&tmp).await.expect("open test db"))
    }

    fn make_snapshot(key: &str, title: &str) -> RawSnapshot {
        RawSnapshot {
            external_key: key.into(),
            metadata: DisplayMetadata {
                title: Some(title.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn make_record(key: Option<&str>) -> TargetRecord {
        TargetRecord::new(key.map(String::from), DisplayMetadata::default())
    }

    // -----------------------------------------------------------------------
    // Pure decision and merge
    // -----------------------------------------------------------------------

    #[test]
    fn decide_prefers_external_key_match() {
        let existing = make_record(Some("42"));
        let hinted = make_record(Some("7"));
        assert!(matches!(
            decide(Some(existing), Some(hinted)),
            Decision::Update(_)
        ));
    }

    #[test]
    fn decide_backfills_keyless_hint() {
        assert!(matches!(decide(None, Some(make_record(None))), Decision::Backfill(_)));
        assert!(matches!(
            decide(None, Some(make_record(Some("  ")))),
            Decision::Backfill(_)
        ));
    }

    #[test]
    fn decide_forks_on_divergent_hint() {
        assert!(matches!(decide(None, Some(make_record(Some("A")))), Decision::Fork(_)));
        assert!(matches!(decide(None, None), Decision::Create));
    }

    #[test]
    fn unread_count_increase_advances_new() {
        let mut record = make_record(Some("42"));
        record.unread_count = Some(1);
        let snapshot = RawSnapshot {
            unread_count: Some(2),
            ..make_snapshot("42", "t")
        };
        assert!(apply_snapshot(&mut record, &snapshot));
        assert!(record.has_unread);
        assert_eq!(record.unread_count, Some(2));
        assert_eq!(record.status, TargetStatus::Active);
    }

    #[test]
    fn decreasing_count_is_trusted_without_marking_unread() {
        let mut record = make_record(Some("42"));
        record.unread_count = Some(5);
        let snapshot = RawSnapshot {
            unread_count: Some(1),
            ..make_snapshot("42", "t")
        };
        assert!(!apply_snapshot(&mut record, &snapshot));
        assert_eq!(record.unread_count, Some(1));
        assert!(!record.has_unread);
        assert_eq!(record.status, TargetStatus::New);
    }

    #[test]
    fn absent_count_preserves_stored() {
        let mut record = make_record(Some("42"));
        record.unread_count = Some(3);
        apply_snapshot(&mut record, &make_snapshot("42", "t"));
        assert_eq!(record.unread_count, Some(3));
    }

    #[test]
    fn changed_last_message_is_unread() {
        let mut record = make_record(Some("42"));
        record.last_message = Some("hi".into());
        let same = RawSnapshot {
            last_message: Some("hi".into()),
            ..make_snapshot("42", "t")
        };
        assert!(!apply_snapshot(&mut record, &same));

        let changed = RawSnapshot {
            last_message: Some("bye".into()),
            ..make_snapshot("42", "t")
        };
        assert!(apply_snapshot(&mut record, &changed));
        assert_eq!(record.last_message.as_deref(), Some("bye"));
    }

    #[test]
    fn operator_status_is_never_overridden() {
        for status in [
            TargetStatus::Active,
            TargetStatus::Quoted,
            TargetStatus::Resolved,
            TargetStatus::Closed,
        ] {
            let mut record = make_record(Some("42"));
            record.status = status;
            let snapshot = RawSnapshot {
                unread_count: Some(9),
                last_message: Some("new!".into()),
                ..make_snapshot("42", "t")
            };
            assert!(apply_snapshot(&mut record, &snapshot));
            assert_eq!(record.status, status);
        }
    }

    // -----------------------------------------------------------------------
    // Engine against storage
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn repeated_reconciliation_keeps_first_identity() {
        let storage = test_storage().await;
        let engine = ReconciliationEngine::new(storage.clone());

        let first = engine.reconcile(&make_snapshot("42", "A"), None).await.unwrap();
        assert_eq!(first.outcome, ReconcileOutcome::Created);

        for title in ["B", "C", "D"] {
            let again = engine.reconcile(&make_snapshot("42", title), None).await.unwrap();
            assert_eq!(again.outcome, ReconcileOutcome::Updated);
            assert_eq!(again.record.id, first.record.id);
        }

        // An unrelated hint does not steal the identity either.
        let hinted = make_record(None);
        storage.insert_target(&hinted).await.unwrap();
        let again = engine
            .reconcile(&make_snapshot("42", "E"), Some(&hinted.id))
            .await
            .unwrap();
        assert_eq!(again.record.id, first.record.id);

        let stored = storage.find_by_external_key("42").await.unwrap().unwrap();
        assert_eq!(stored.id, first.record.id);
        assert_eq!(stored.metadata.title.as_deref(), Some("E"));
    }

    #[tokio::test]
    async fn backfill_attaches_key_to_hinted_record() {
        let storage = test_storage().await;
        let engine = ReconciliationEngine::new(storage.clone());

        let mut pending = make_record(None);
        pending.metadata.counterpart = Some("Kim".into());
        storage.insert_target(&pending).await.unwrap();

        let result = engine
            .reconcile(&make_snapshot("42", "Roof leak"), Some(&pending.id))
            .await
            .unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::Backfilled);
        assert_eq!(result.record.id, pending.id);

        let stored = storage.get_target(&pending.id).await.unwrap().unwrap();
        assert_eq!(stored.external_key.as_deref(), Some("42"));
        assert_eq!(stored.metadata.title.as_deref(), Some("Roof leak"));
        assert_eq!(stored.metadata.counterpart.as_deref(), Some("Kim"));
    }

    #[tokio::test]
    async fn divergent_hint_forks_and_leaves_original_untouched() {
        let storage = test_storage().await;
        let engine = ReconciliationEngine::new(storage.clone());

        let original = TargetRecord::new(
            Some("A".into()),
            DisplayMetadata {
                title: Some("Original".into()),
                ..Default::default()
            },
        );
        storage.insert_target(&original).await.unwrap();
        let before = storage.get_target(&original.id).await.unwrap().unwrap();

        let result = engine
            .reconcile(&make_snapshot("B", "Other"), Some(&original.id))
            .await
            .unwrap();
        assert_eq!(
            result.outcome,
            ReconcileOutcome::Forked {
                diverged_from: original.id,
                previous_external_key: "A".into(),
            }
        );
        assert_ne!(result.record.id, original.id);
        assert_eq!(result.record.external_key.as_deref(), Some("B"));

        let after = storage.get_target(&original.id).await.unwrap().unwrap();
        assert_eq!(after, before);
        assert_eq!(
            storage.find_by_external_key("B").await.unwrap().unwrap().id,
            result.record.id
        );
    }

    #[tokio::test]
    async fn missing_hint_creates() {
        let storage = test_storage().await;
        let engine = ReconciliationEngine::new(storage);
        let result = engine
            .reconcile(&make_snapshot("42", "A"), Some(&TargetId::new()))
            .await
            .unwrap();
        assert_eq!(result.outcome, ReconcileOutcome::Created);
        assert_eq!(result.record.status, TargetStatus::New);
    }

    #[tokio::test]
    async fn resolved_record_stays_resolved() {
        let storage = test_storage().await;
        let engine = ReconciliationEngine::new(storage.clone());

        let created = engine.reconcile(&make_snapshot("42", "A"), None).await.unwrap();
        storage
            .set_status(&created.record.id, TargetStatus::Resolved)
            .await
            .unwrap();

        let snapshot = RawSnapshot {
            unread_count: Some(4),
            last_message: Some("are you there?".into()),
            ..make_snapshot("42", "A")
        };
        let result = engine.reconcile(&snapshot, None).await.unwrap();
        assert!(result.unread_detected);

        let stored = storage.get_target(&created.record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TargetStatus::Resolved);
        assert!(stored.has_unread);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolve_survives_reconciliation() {
        let storage = test_storage().await;
        let engine = Arc::new(ReconciliationEngine::new(storage.clone()));

        for round in 0..50 {
            let key = format!("race-{round}");
            let created = engine.reconcile(&make_snapshot(&key, "A"), None).await.unwrap();
            let id = created.record.id;

            let snapshot = RawSnapshot {
                unread_count: Some(1),
                last_message: Some(format!("ping {round}")),
                ..make_snapshot(&key, "A")
            };
            let reconciling = {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move { engine.reconcile(&snapshot, None).await })
            };
            let resolving = {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move { storage.set_status(&id, TargetStatus::Resolved).await })
            };
            let reconciled = reconciling.await.unwrap().unwrap();
            assert!(resolving.await.unwrap().unwrap());
            assert!(reconciled.unread_detected);

            let stored = storage.get_target(&id).await.unwrap().unwrap();
            assert_eq!(stored.status, TargetStatus::Resolved, "round {round}");
            assert!(stored.has_unread);
        }
    }

    #[tokio::test]
    async fn empty_external_key_is_rejected() {
        let storage = test_storage().await;
        let engine = ReconciliationEngine::new(storage);
        let err = engine.reconcile(&make_snapshot(" ", "A"), None).await.unwrap_err();
        assert!(matches!(err, MirrorError::Validation { .. }));
    }

    #[tokio::test]
    async fn concurrent_snapshots_create_one_record() {
        let storage = test_storage().await;
        let engine = Arc::new(ReconciliationEngine::new(storage.clone()));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine
                        .reconcile(&make_snapshot("42", &format!("t{i}")), None)
                        .await
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().record.id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }
}
