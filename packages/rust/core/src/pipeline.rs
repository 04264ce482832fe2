//! Crawl pipeline: session → extract → reconcile → dedup, tracked per target.
//!
//! [`CrawlService::start`] is fire-and-forget: it marks the target running,
//! spawns the pipeline, and returns at once. Pollers follow progress through
//! the [`JobTracker`]. Every failure is caught at the task boundary and
//! becomes a `failed` phase, including a panic inside the pipeline.
//!
//! [`CrawlService::start_sync`] does the same for the inbox list, tracked
//! under [`INBOX_JOB_KEY`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use inboxmirror_crawler::{Extractor, SessionManager};
use inboxmirror_shared::{MirrorError, Result, TargetId};
use inboxmirror_storage::Storage;

use crate::dedup::MessageDeduplicator;
use crate::reconcile::{ReconcileOutcome, ReconciliationEngine};
use crate::tracker::JobTracker;

/// What to crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlRequest {
    /// Job key. A local target id, or the source's conversation id.
    pub target_key: String,
    /// Override for where the extractor should look, e.g. a chat URL for a
    /// record that has no external key yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
}

impl CrawlRequest {
    pub fn new(target_key: impl Into<String>) -> Self {
        Self {
            target_key: target_key.into(),
            locator: None,
        }
    }
}

/// Result of one successful pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlReport {
    pub target_id: TargetId,
    pub external_key: String,
    pub outcome: ReconcileOutcome,
    pub unread_detected: bool,
    pub inserted: usize,
    pub skipped: usize,
    pub message_count: u64,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Job key under which inbox syncs are tracked.
pub const INBOX_JOB_KEY: &str = "inbox";

/// Result of one inbox sync.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Inbox rows that carried a conversation id.
    pub rows: usize,
    pub created: usize,
    pub updated: usize,
    /// Rows where new unread content was detected.
    pub unread: usize,
    /// Rows that could not be reconciled; the rest still commit.
    pub failed: usize,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when the pipeline completes.
    fn done(&self, report: &CrawlReport);
}

/// No-op progress reporter for background jobs and tests.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn done(&self, _report: &CrawlReport) {}
}

/// Completion signal for one started job.
///
/// Independent of other jobs on the same target; dropping it does not cancel
/// the job.
pub struct JobHandle<T = CrawlReport> {
    target_key: String,
    handle: JoinHandle<Result<T>>,
}

impl<T> JobHandle<T> {
    pub fn target_key(&self) -> &str {
        &self.target_key
    }

    pub async fn wait(self) -> Result<T> {
        self.handle
            .await
            .map_err(|e| MirrorError::Job(format!("crawl task for {} ended: {e}", self.target_key)))?
    }
}

pub struct CrawlService {
    tracker: Arc<JobTracker>,
    session: Arc<SessionManager>,
    extractor: Arc<dyn Extractor>,
    storage: Arc<Storage>,
    engine: ReconciliationEngine,
    dedup: MessageDeduplicator,
    /// Per-conversation guard around reconcile + dedup, keyed by external key.
    target_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CrawlService {
    pub fn new(
        tracker: Arc<JobTracker>,
        session: Arc<SessionManager>,
        extractor: Arc<dyn Extractor>,
        storage: Arc<Storage>,
    ) -> Self {
        Self {
            tracker,
            session,
            extractor,
            engine: ReconciliationEngine::new(Arc::clone(&storage)),
            dedup: MessageDeduplicator::new(Arc::clone(&storage)),
            storage,
            target_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Mark the target running and run the pipeline in the background.
    pub fn start(self: &Arc<Self>, request: CrawlRequest) -> JobHandle {
        let service = Arc::clone(self);
        self.spawn_tracked(request.target_key.clone(), async move {
            let result = service.run(&request, &SilentProgress).await;
            service.finish(&request.target_key, &result);
            result
        })
    }

    /// Mark the inbox job running and sync the inbox list in the background.
    pub fn start_sync(self: &Arc<Self>) -> JobHandle<SyncReport> {
        let service = Arc::clone(self);
        self.spawn_tracked(INBOX_JOB_KEY.to_string(), async move {
            let result = service.run_sync(&SilentProgress).await;
            service.finish_sync(&result);
            result
        })
    }

    /// Sync the inbox list in the foreground, still recording the job phase.
    pub async fn sync(&self, progress: &dyn ProgressReporter) -> Result<SyncReport> {
        self.tracker.start(INBOX_JOB_KEY);
        let result = self.run_sync(progress).await;
        self.finish_sync(&result);
        result
    }

    /// Spawn `work` under a supervisor. `work` records its own outcome; if it
    /// panics instead, the supervisor marks the job failed.
    fn spawn_tracked<T, F>(&self, job_key: String, work: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.tracker.start(&job_key);

        let inner = tokio::spawn(work);
        let tracker = Arc::clone(&self.tracker);
        let key = job_key.clone();
        let handle = tokio::spawn(async move {
            match inner.await {
                Ok(result) => result,
                Err(e) => {
                    tracker.complete(&key, false);
                    error!(target_key = %key, error = %e, "job task aborted");
                    Err(MirrorError::Job(format!("job task for {key} aborted: {e}")))
                }
            }
        });

        JobHandle {
            target_key: job_key,
            handle,
        }
    }

    /// Run the pipeline in the foreground, still recording the job phase.
    pub async fn crawl(&self, request: &CrawlRequest, progress: &dyn ProgressReporter) -> Result<CrawlReport> {
        self.tracker.start(&request.target_key);
        let result = self.run(request, progress).await;
        self.finish(&request.target_key, &result);
        if let Ok(report) = &result {
            progress.done(report);
        }
        result
    }

    fn finish(&self, target_key: &str, result: &Result<CrawlReport>) {
        match result {
            Ok(report) => {
                self.tracker.complete(target_key, true);
                info!(
                    target_key,
                    target_id = %report.target_id,
                    inserted = report.inserted,
                    message_count = report.message_count,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "crawl finished"
                );
            }
            Err(e) => {
                self.tracker.complete(target_key, false);
                warn!(target_key, error = %e, "crawl failed");
            }
        }
    }

    fn finish_sync(&self, result: &Result<SyncReport>) {
        match result {
            Ok(report) => {
                self.tracker.complete(INBOX_JOB_KEY, true);
                info!(
                    rows = report.rows,
                    created = report.created,
                    updated = report.updated,
                    unread = report.unread,
                    failed = report.failed,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "inbox sync finished"
                );
            }
            Err(e) => {
                self.tracker.complete(INBOX_JOB_KEY, false);
                warn!(error = %e, "inbox sync failed");
            }
        }
    }

    /// Reconcile every inbox row. A row that fails is logged and counted;
    /// the sync only fails as a whole when the session or the list fails.
    #[instrument(skip_all)]
    async fn run_sync(&self, progress: &dyn ProgressReporter) -> Result<SyncReport> {
        let started = Instant::now();

        progress.phase("Checking session");
        self.require_session().await?;

        progress.phase("Reading inbox");
        let rows = self.extractor.snapshot_inbox().await?;

        progress.phase("Reconciling");
        let mut report = SyncReport {
            rows: rows.len(),
            ..Default::default()
        };
        for snapshot in &rows {
            let reconciled = self
                .with_target_lock(&snapshot.external_key, self.engine.reconcile(snapshot, None))
                .await;
            match reconciled {
                Ok(reconciled) => {
                    if reconciled.outcome == ReconcileOutcome::Created {
                        report.created += 1;
                    } else {
                        report.updated += 1;
                    }
                    if reconciled.unread_detected {
                        report.unread += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(external_key = %snapshot.external_key, error = %e, "inbox row not reconciled");
                }
            }
        }

        report.elapsed = started.elapsed();
        Ok(report)
    }

    async fn require_session(&self) -> Result<()> {
        if self.session.ensure_valid().await? {
            Ok(())
        } else {
            Err(MirrorError::Session(
                "could not authenticate with the source".into(),
            ))
        }
    }

    #[instrument(skip_all, fields(target_key = %request.target_key))]
    async fn run(&self, request: &CrawlRequest, progress: &dyn ProgressReporter) -> Result<CrawlReport> {
        let started = Instant::now();

        progress.phase("Checking session");
        self.require_session().await?;

        let (hint, locator) = self.resolve(request).await?;

        progress.phase("Extracting conversation");
        let mut snapshot = self.extractor.snapshot(&locator).await?;
        let messages = self.extractor.snapshot_messages(&locator).await?;
        if snapshot.last_message.is_none() {
            if let Some(last) = messages.last() {
                snapshot.last_message = Some(last.content.clone());
                snapshot.last_message_at = Some(last.sent_at);
            }
        }

        progress.phase("Reconciling");
        let (reconciled, dedup) = self
            .with_target_lock(&snapshot.external_key, async {
                let reconciled = self.engine.reconcile(&snapshot, hint.as_ref()).await?;
                let dedup = self.dedup.commit(&reconciled.record.id, &messages).await?;
                Ok::<_, MirrorError>((reconciled, dedup))
            })
            .await?;

        Ok(CrawlReport {
            target_id: reconciled.record.id,
            external_key: snapshot.external_key,
            outcome: reconciled.outcome,
            unread_detected: reconciled.unread_detected,
            inserted: dedup.inserted,
            skipped: dedup.skipped,
            message_count: dedup.message_count,
            elapsed: started.elapsed(),
        })
    }

    /// Work out the local record hint and the extractor locator for a request.
    async fn resolve(&self, request: &CrawlRequest) -> Result<(Option<TargetId>, String)> {
        let record = match request.target_key.parse::<TargetId>() {
            Ok(id) => self.storage.get_target(&id).await?,
            Err(_) => None,
        };

        let locator = request
            .locator
            .clone()
            .or_else(|| record.as_ref().and_then(|r| r.external_key.clone()))
            .unwrap_or_else(|| request.target_key.clone());

        Ok((record.map(|r| r.id), locator))
    }

    /// Run `work` holding the per-conversation lock for `external_key`.
    ///
    /// The lock entry is dropped again once no other job holds or waits on it.
    async fn with_target_lock<T>(
        &self,
        external_key: &str,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let lock = {
            let mut locks = self
                .target_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(external_key.to_string()).or_default())
        };

        let result = {
            let _guard = lock.lock().await;
            work.await
        };
        drop(lock);

        let mut locks = self
            .target_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(external_key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(external_key);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use inboxmirror_crawler::{LoginState, SessionArtifact, SourceBrowser};
    use inboxmirror_shared::{
        Credentials, Direction, DisplayMetadata, JobPhase, MessageChannel, RawMessage,
        RawSnapshot, TargetRecord, TargetStatus,
    };
    use uuid::Uuid;

    struct FakeBrowser {
        logged_in: AtomicBool,
    }

    #[async_trait]
    impl SourceBrowser for FakeBrowser {
        async fn probe(&self) -> Result<LoginState> {
            Ok(if self.logged_in.load(Ordering::SeqCst) {
                LoginState::LoggedIn
            } else {
                LoginState::LoggedOut
            })
        }
        async fn login(&self, _credentials: &Credentials) -> Result<bool> {
            Ok(false)
        }
        async fn export_session(&self) -> Result<SessionArtifact> {
            Err(MirrorError::Session("not logged in".into()))
        }
        async fn import_session(&self, _artifact: &SessionArtifact) -> Result<()> {
            Ok(())
        }
        async fn close(&self) {}
    }

    /// Serves whatever conversation is currently scripted.
    struct FakeExtractor {
        snapshot: Mutex<RawSnapshot>,
        messages: Mutex<Vec<RawMessage>>,
        inbox: Mutex<Vec<RawSnapshot>>,
        fail: AtomicBool,
        panic: AtomicBool,
        calls: AtomicUsize,
        locators: Mutex<Vec<String>>,
    }

    impl FakeExtractor {
        fn new(snapshot: RawSnapshot, messages: Vec<RawMessage>) -> Self {
            Self {
                snapshot: Mutex::new(snapshot),
                messages: Mutex::new(messages),
                inbox: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                panic: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                locators: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Extractor for FakeExtractor {
        async fn snapshot(&self, locator: &str) -> Result<RawSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.locators.lock().unwrap().push(locator.to_string());
            if self.panic.load(Ordering::SeqCst) {
                panic!("selector engine crashed");
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(MirrorError::Network("navigation timeout".into()));
            }
            Ok(self.snapshot.lock().unwrap().clone())
        }
        async fn snapshot_inbox(&self) -> Result<Vec<RawSnapshot>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(MirrorError::Network("navigation timeout".into()));
            }
            Ok(self.inbox.lock().unwrap().clone())
        }
        async fn snapshot_messages(&self, _locator: &str) -> Result<Vec<RawMessage>> {
            Ok(self.messages.lock().unwrap().clone())
        }
    }

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, minute, 0).unwrap()
    }

    fn msg(content: &str, at: DateTime<Utc>, direction: Direction) -> RawMessage {
        RawMessage {
            content: content.into(),
            sent_at: at,
            direction,
            channel: MessageChannel::Chat,
        }
    }

    fn snapshot_42() -> RawSnapshot {
        RawSnapshot {
            external_key: "42".into(),
            metadata: DisplayMetadata {
                title: Some("A".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct Harness {
        service: Arc<CrawlService>,
        extractor: Arc<FakeExtractor>,
        storage: Arc<Storage>,
    }

    async fn harness(logged_in: bool, extractor: FakeExtractor) -> Harness {
        let tmp = std::env::temp_dir().join(format!("im_pipeline_{}", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&tmp.join("inbox.db")).await.unwrap());
        let browser = Arc::new(FakeBrowser {
            logged_in: AtomicBool::new(logged_in),
        });
        let session = Arc::new(SessionManager::new(browser, None, tmp.join("session.json")));
        let tracker = Arc::new(JobTracker::new(
            Duration::from_secs(30),
            Duration::from_secs(60),
        ));
        let extractor = Arc::new(extractor);
        let service = Arc::new(CrawlService::new(
            tracker,
            session,
            extractor.clone(),
            storage.clone(),
        ));
        Harness {
            service,
            extractor,
            storage,
        }
    }

    #[tokio::test]
    async fn duplicate_in_first_snapshot_then_incremental_recrawl() {
        let hi = msg("hi", t(1), Direction::Inbound);
        let h = harness(true, FakeExtractor::new(snapshot_42(), vec![hi.clone(), hi.clone()])).await;

        let first = h.service.start(CrawlRequest::new("42")).wait().await.unwrap();
        assert_eq!(first.outcome, ReconcileOutcome::Created);
        assert_eq!(first.inserted, 1);
        assert_eq!(first.message_count, 1);

        let record = h.storage.find_by_external_key("42").await.unwrap().unwrap();
        assert_eq!(record.status, TargetStatus::Active);
        assert!(record.has_unread);
        assert_eq!(record.message_count, 1);
        assert_eq!(h.service.tracker().read("42").phase, JobPhase::Done);

        *h.extractor.messages.lock().unwrap() =
            vec![hi.clone(), hi, msg("bye", t(2), Direction::Outbound)];
        let second = h.service.start(CrawlRequest::new("42")).wait().await.unwrap();
        assert_eq!(second.outcome, ReconcileOutcome::Updated);
        assert_eq!(second.target_id, first.target_id);
        assert_eq!(second.inserted, 1);
        assert_eq!(second.message_count, 2);

        let record = h.storage.get_target(&first.target_id).await.unwrap().unwrap();
        assert_eq!(record.message_count, 2);
        assert_eq!(record.last_message.as_deref(), Some("bye"));
    }

    #[tokio::test]
    async fn extractor_failure_marks_job_failed() {
        let h = harness(true, FakeExtractor::new(snapshot_42(), vec![])).await;
        h.extractor.fail.store(true, Ordering::SeqCst);

        let result = h.service.start(CrawlRequest::new("42")).wait().await;
        assert!(matches!(result, Err(MirrorError::Network(_))));
        assert_eq!(h.service.tracker().read("42").phase, JobPhase::Failed);
        assert!(h.storage.find_by_external_key("42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn panicking_pipeline_marks_job_failed() {
        let h = harness(true, FakeExtractor::new(snapshot_42(), vec![])).await;
        h.extractor.panic.store(true, Ordering::SeqCst);

        let result = h.service.start(CrawlRequest::new("42")).wait().await;
        assert!(matches!(result, Err(MirrorError::Job(_))));
        assert_eq!(h.service.tracker().read("42").phase, JobPhase::Failed);

        // The service keeps working for the next job.
        h.extractor.panic.store(false, Ordering::SeqCst);
        h.service.start(CrawlRequest::new("42")).wait().await.unwrap();
        assert_eq!(h.service.tracker().read("42").phase, JobPhase::Done);
    }

    #[tokio::test]
    async fn dead_session_fails_without_extracting() {
        let h = harness(false, FakeExtractor::new(snapshot_42(), vec![])).await;

        let result = h.service.start(CrawlRequest::new("42")).wait().await;
        assert!(matches!(result, Err(MirrorError::Session(_))));
        assert_eq!(h.service.tracker().read("42").phase, JobPhase::Failed);
        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn start_returns_before_pipeline_finishes() {
        let h = harness(true, FakeExtractor::new(snapshot_42(), vec![])).await;
        let handle = h.service.start(CrawlRequest::new("42"));
        // On the current-thread test runtime the spawned task has not run yet.
        assert_eq!(h.service.tracker().read("42").phase, JobPhase::Running);
        assert_eq!(handle.target_key(), "42");
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn overlapping_jobs_each_get_a_result() {
        let hi = msg("hi", t(1), Direction::Inbound);
        let h = harness(true, FakeExtractor::new(snapshot_42(), vec![hi])).await;

        let a = h.service.start(CrawlRequest::new("42"));
        let b = h.service.start(CrawlRequest::new("42"));
        let (a, b) = (a.wait().await.unwrap(), b.wait().await.unwrap());

        assert_eq!(a.target_id, b.target_id);
        assert_eq!(a.inserted + b.inserted, 1);
        assert_eq!(h.storage.count_messages(&a.target_id).await.unwrap(), 1);
        assert!(h.service.target_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_entries_do_not_accumulate() {
        let h = harness(true, FakeExtractor::new(snapshot_42(), vec![])).await;
        for key in 0..20 {
            *h.extractor.snapshot.lock().unwrap() = RawSnapshot {
                external_key: key.to_string(),
                ..snapshot_42()
            };
            h.service.start(CrawlRequest::new(key.to_string())).wait().await.unwrap();
        }
        assert!(h.service.target_locks.lock().unwrap().is_empty());
    }

    fn inbox_row(key: &str, unread: u32, last: &str) -> RawSnapshot {
        RawSnapshot {
            external_key: key.into(),
            metadata: DisplayMetadata {
                counterpart: Some(format!("client {key}")),
                ..Default::default()
            },
            unread_count: Some(unread),
            last_message: Some(last.into()),
            last_message_at: Some(t(5)),
        }
    }

    #[tokio::test]
    async fn inbox_sync_reconciles_every_row() {
        let h = harness(true, FakeExtractor::new(snapshot_42(), vec![])).await;
        let resolved = TargetRecord::new(Some("43".into()), DisplayMetadata::default());
        h.storage.insert_target(&resolved).await.unwrap();
        h.storage
            .set_status(&resolved.id, TargetStatus::Resolved)
            .await
            .unwrap();

        *h.extractor.inbox.lock().unwrap() = vec![
            inbox_row("42", 0, "see you then"),
            inbox_row("43", 2, "one more question"),
            inbox_row("  ", 1, "broken row"),
        ];
        let report = h.service.start_sync().wait().await.unwrap();
        assert_eq!(report.rows, 3);
        assert_eq!(report.created, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.unread, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(h.service.tracker().read(INBOX_JOB_KEY).phase, JobPhase::Done);

        let created = h.storage.find_by_external_key("42").await.unwrap().unwrap();
        assert_eq!(created.metadata.counterpart.as_deref(), Some("client 42"));
        assert_eq!(created.last_message.as_deref(), Some("see you then"));

        let kept = h.storage.get_target(&resolved.id).await.unwrap().unwrap();
        assert_eq!(kept.status, TargetStatus::Resolved);
        assert!(kept.has_unread);
        assert_eq!(kept.unread_count, Some(2));

        // Nothing changed upstream: the second pass only updates.
        *h.extractor.inbox.lock().unwrap() = vec![
            inbox_row("42", 0, "see you then"),
            inbox_row("43", 2, "one more question"),
        ];
        let again = h.service.start_sync().wait().await.unwrap();
        assert_eq!((again.created, again.updated, again.unread), (0, 2, 0));
        assert!(h.service.target_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn inbox_sync_fails_on_dead_session_or_list_error() {
        let h = harness(false, FakeExtractor::new(snapshot_42(), vec![])).await;
        let result = h.service.sync(&SilentProgress).await;
        assert!(matches!(result, Err(MirrorError::Session(_))));
        assert_eq!(h.service.tracker().read(INBOX_JOB_KEY).phase, JobPhase::Failed);

        let h = harness(true, FakeExtractor::new(snapshot_42(), vec![])).await;
        h.extractor.fail.store(true, Ordering::SeqCst);
        let result = h.service.start_sync().wait().await;
        assert!(matches!(result, Err(MirrorError::Network(_))));
        assert_eq!(h.service.tracker().read(INBOX_JOB_KEY).phase, JobPhase::Failed);
    }

    #[tokio::test]
    async fn local_id_key_uses_stored_external_key() {
        let h = harness(true, FakeExtractor::new(snapshot_42(), vec![])).await;
        let record = TargetRecord::new(Some("42".into()), DisplayMetadata::default());
        h.storage.insert_target(&record).await.unwrap();

        let report = h
            .service
            .start(CrawlRequest::new(record.id.to_string()))
            .wait()
            .await
            .unwrap();
        assert_eq!(report.target_id, record.id);
        assert_eq!(h.extractor.locators.lock().unwrap().as_slice(), ["42"]);
    }

    #[tokio::test]
    async fn explicit_locator_backfills_keyless_record() {
        let h = harness(true, FakeExtractor::new(snapshot_42(), vec![])).await;
        let record = TargetRecord::new(None, DisplayMetadata::default());
        h.storage.insert_target(&record).await.unwrap();

        let request = CrawlRequest {
            target_key: record.id.to_string(),
            locator: Some("https://chat.example.com/pro/chats/42".into()),
        };
        let report = h.service.start(request).wait().await.unwrap();
        assert_eq!(report.outcome, ReconcileOutcome::Backfilled);
        assert_eq!(report.target_id, record.id);
    }

    #[tokio::test]
    async fn foreground_crawl_reports_progress() {
        struct Recorder(Mutex<Vec<String>>);
        impl ProgressReporter for Recorder {
            fn phase(&self, name: &str) {
                self.0.lock().unwrap().push(name.to_string());
            }
            fn done(&self, _report: &CrawlReport) {
                self.0.lock().unwrap().push("done".into());
            }
        }

        let h = harness(true, FakeExtractor::new(snapshot_42(), vec![])).await;
        let recorder = Recorder(Mutex::new(Vec::new()));
        h.service
            .crawl(&CrawlRequest::new("42"), &recorder)
            .await
            .unwrap();

        let phases = recorder.0.lock().unwrap().clone();
        assert_eq!(phases.first().map(String::as_str), Some("Checking session"));
        assert_eq!(phases.last().map(String::as_str), Some("done"));
        assert_eq!(h.service.tracker().read("42").phase, JobPhase::Done);
    }
}
