//! In-memory registry of crawl job phases.
//!
//! One entry per target key ever started in this process. Entries are only
//! overwritten, never removed, and are lost on restart; an unknown key reads
//! as [`JobPhase::Idle`].
//!
//! Staleness is inferred at read time: a `Running` entry older than the
//! threshold is *reported* as `Done`, but the stored phase is left alone so
//! the next real transition still wins.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use inboxmirror_shared::{JobPhase, JobsConfig};

#[derive(Debug, Clone, Copy)]
struct JobEntry {
    phase: JobPhase,
    transitioned_at: DateTime<Utc>,
    since: Instant,
}

/// What a poller sees for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub target_key: String,
    /// Phase after staleness inference.
    pub phase: JobPhase,
    /// Phase actually held by the tracker.
    pub stored_phase: JobPhase,
    /// `None` when nothing has run for this key.
    pub transitioned_at: Option<DateTime<Utc>>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    /// `true` when a running job was inferred finished.
    pub stale: bool,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self.phase, JobPhase::Done | JobPhase::Failed)
    }
}

fn as_millis<S: serde::Serializer>(elapsed: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(elapsed.as_millis() as u64)
}

pub struct JobTracker {
    jobs: Mutex<HashMap<String, JobEntry>>,
    stale_after: Duration,
    abandon_after: Duration,
}

impl JobTracker {
    pub fn new(stale_after: Duration, abandon_after: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            stale_after,
            abandon_after,
        }
    }

    pub fn from_config(config: &JobsConfig) -> Self {
        Self::new(config.status_stale_after(), config.abandon_after())
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn abandon_after(&self) -> Duration {
        self.abandon_after
    }

    /// Mark `target_key` running. Overlapping starts are allowed.
    pub fn start(&self, target_key: &str) {
        self.transition(target_key, JobPhase::Running);
    }

    pub fn complete(&self, target_key: &str, success: bool) {
        let phase = if success {
            JobPhase::Done
        } else {
            JobPhase::Failed
        };
        self.transition(target_key, phase);
    }

    fn transition(&self, target_key: &str, phase: JobPhase) {
        let entry = JobEntry {
            phase,
            transitioned_at: Utc::now(),
            since: Instant::now(),
        };
        let previous = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target_key.to_string(), entry)
            .map(|e| e.phase);
        debug!(target_key, ?previous, %phase, "job transition");
    }

    /// Status as seen by a status poll, using the short staleness threshold.
    pub fn read(&self, target_key: &str) -> JobStatus {
        self.read_with(target_key, self.stale_after)
    }

    /// Status with a caller-chosen staleness threshold. Never mutates.
    pub fn read_with(&self, target_key: &str, threshold: Duration) -> JobStatus {
        let entry = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target_key)
            .copied();

        let Some(entry) = entry else {
            return JobStatus {
                target_key: target_key.to_string(),
                phase: JobPhase::Idle,
                stored_phase: JobPhase::Idle,
                transitioned_at: None,
                elapsed: Duration::ZERO,
                stale: false,
            };
        };

        let elapsed = entry.since.elapsed();
        let stale = entry.phase == JobPhase::Running && elapsed > threshold;
        JobStatus {
            target_key: target_key.to_string(),
            phase: if stale { JobPhase::Done } else { entry.phase },
            stored_phase: entry.phase,
            transitioned_at: Some(entry.transitioned_at),
            elapsed,
            stale,
        }
    }

    /// Whether a caller waiting on this job should give up.
    pub fn is_abandoned(&self, target_key: &str) -> bool {
        self.read_with(target_key, self.abandon_after).stale
    }
}
