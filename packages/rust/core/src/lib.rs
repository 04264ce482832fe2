//! Crawl job lifecycle and reconciliation for inboxmirror.
//!
//! This crate ties the source capabilities and storage together:
//! - [`tracker`]: in-memory job phases with read-time staleness
//! - [`reconcile`]: identity resolution and status derivation for snapshots
//! - [`dedup`]: idempotent message commits
//! - [`pipeline`]: background conversation crawls and inbox syncs

pub mod dedup;
pub mod pipeline;
pub mod reconcile;
pub mod tracker;

pub use dedup::{DedupOutcome, MessageDeduplicator};
pub use pipeline::{
    CrawlReport, CrawlRequest, CrawlService, INBOX_JOB_KEY, JobHandle, ProgressReporter,
    SilentProgress, SyncReport,
};
pub use reconcile::{ReconcileOutcome, Reconciled, ReconciliationEngine};
pub use tracker::{JobStatus, JobTracker};
