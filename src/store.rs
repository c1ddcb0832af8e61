//! Storage contract for job documents.
//!
//! The scheduler core talks to its collection through [`JobStore`], which
//! keeps the engine testable against an in-memory implementation while
//! production uses the MongoDB adapter. Every state transition a store
//! performs must be guarded: the status precondition is re-checked inside
//! the same atomic operation that applies the mutation.

use async_trait::async_trait;
use bson::oid::ObjectId;
use chrono::{DateTime, Utc};

use crate::error::MonqueError;
use crate::job::{Job, JobStatus};

/// Result of an insert that honors unique-key deduplication.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// The document was inserted.
    Created(Job),
    /// An active document with the same unique key already existed; it is
    /// returned unchanged.
    Existing(Job),
}

impl EnqueueOutcome {
    pub fn into_job(self) -> Job {
        match self {
            EnqueueOutcome::Created(job) | EnqueueOutcome::Existing(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueOutcome::Created(_))
    }
}

/// Post-success transition computed by the execution pipeline.
#[derive(Debug, Clone)]
pub struct SuccessOutcome {
    pub now: DateTime<Utc>,
    /// Handler wall time for this occurrence, milliseconds.
    pub duration_ms: i64,
    /// `Some` reschedules a recurring job; `None` completes it.
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Post-failure transition computed by the execution pipeline.
#[derive(Debug, Clone)]
pub struct FailureOutcome {
    pub now: DateTime<Utc>,
    /// The new consecutive-failure count.
    pub fail_count: u32,
    pub reason: String,
    /// `Some` schedules a backed-off retry; `None` fails the job for good.
    pub next_run_at: Option<DateTime<Utc>>,
}

/// A guarded status transition, reporting the status it moved away from.
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub job: Job,
    pub previous_status: JobStatus,
}

/// Filter for listing and bulk management operations.
#[derive(Debug, Clone, Default)]
pub struct JobSelector {
    pub name: Option<String>,
    pub status: Option<JobStatus>,
}

impl JobSelector {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            status: None,
        }
    }

    pub fn status(status: JobStatus) -> Self {
        Self {
            name: None,
            status: Some(status),
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.name.as_deref().map_or(true, |n| n == job.name)
            && self.status.map_or(true, |s| s == job.status)
    }
}

/// Paging direction relative to the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageDirection {
    #[default]
    Forward,
    Backward,
}

/// Options for cursor pagination, keyed by job id.
#[derive(Debug, Clone)]
pub struct JobPageQuery {
    pub selector: JobSelector,
    pub limit: usize,
    /// Opaque cursor from a previous [`JobPage`]; `None` starts at the edge.
    pub cursor: Option<String>,
    pub direction: PageDirection,
}

impl Default for JobPageQuery {
    fn default() -> Self {
        Self {
            selector: JobSelector::default(),
            limit: 50,
            cursor: None,
            direction: PageDirection::Forward,
        }
    }
}

/// One page of jobs in ascending id order.
#[derive(Debug, Default)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Cursor for the next (later) page, when one exists.
    pub next_cursor: Option<String>,
    /// Cursor for the previous (earlier) page, when one exists.
    pub prev_cursor: Option<String>,
}

/// Aggregate queue counts plus the mean successful-run duration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Mean wall time of successful runs among completed jobs, when any
    /// completed job recorded one.
    pub mean_run_duration_ms: Option<f64>,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// Result of a bulk management operation.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    /// Documents actually transitioned (or deleted).
    pub modified: u64,
    /// Per-document state errors for jobs that raced into an incompatible
    /// status.
    pub errors: Vec<(ObjectId, MonqueError)>,
}

/// Encode a page cursor. The cursor is opaque to callers.
pub(crate) fn encode_cursor(id: &ObjectId) -> String {
    id.to_hex()
}

/// Assemble a [`JobPage`] from an ascending-order result set. `has_more`
/// reports whether the query saw a row beyond the page limit in its own
/// direction of travel.
pub(crate) fn page_from(jobs: Vec<Job>, has_more: bool, query: &JobPageQuery) -> JobPage {
    let at_anchor = query.cursor.is_some();
    let (next_exists, prev_exists) = match query.direction {
        // Paging forward: an extra row means a later page exists; any anchor
        // means we came from an earlier one.
        PageDirection::Forward => (has_more, at_anchor),
        PageDirection::Backward => (at_anchor, has_more),
    };
    let next_cursor = (next_exists && !jobs.is_empty())
        .then(|| jobs.last().map(|j| encode_cursor(&j.id)))
        .flatten();
    let prev_cursor = (prev_exists && !jobs.is_empty())
        .then(|| jobs.first().map(|j| encode_cursor(&j.id)))
        .flatten();
    JobPage {
        jobs,
        next_cursor,
        prev_cursor,
    }
}

/// Decode a page cursor, rejecting anything malformed.
pub(crate) fn decode_cursor(cursor: &str) -> Result<ObjectId, MonqueError> {
    ObjectId::parse_str(cursor).map_err(|_| MonqueError::InvalidCursor {
        cursor: cursor.to_string(),
    })
}

/// Storage operations the scheduler core requires.
///
/// Implementations must provide single-document atomicity for every guarded
/// transition; multi-document operations (heartbeat, recovery, bulk
/// management) need no cross-document transaction because each document's
/// transition is independently guarded.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create indexes and any other one-time collection state.
    async fn prepare(&self) -> Result<(), MonqueError>;

    /// Insert a pending job, honoring unique-key deduplication: when an
    /// active document with the same key exists, it is returned unchanged.
    async fn insert(&self, job: Job) -> Result<EnqueueOutcome, MonqueError>;

    async fn find_by_id(&self, id: ObjectId) -> Result<Option<Job>, MonqueError>;

    /// The active (pending or processing) document holding `key`, if any.
    async fn find_active_by_unique_key(&self, key: &str) -> Result<Option<Job>, MonqueError>;

    /// Atomically move the earliest-eligible pending job named `name` into
    /// `processing` under `instance_id`'s ownership. Returns the claimed
    /// document, or `None` when nothing is eligible.
    async fn claim(
        &self,
        name: &str,
        now: DateTime<Utc>,
        instance_id: &str,
        heartbeat_interval_ms: i64,
    ) -> Result<Option<Job>, MonqueError>;

    /// Apply a success transition to a job still owned by `instance_id`.
    /// Returns `None` when ownership was lost (e.g. the job was recovered
    /// as stale in the meantime).
    async fn complete_success(
        &self,
        id: ObjectId,
        instance_id: &str,
        outcome: SuccessOutcome,
    ) -> Result<Option<Job>, MonqueError>;

    /// Apply a failure transition to a job still owned by `instance_id`.
    async fn complete_failure(
        &self,
        id: ObjectId,
        instance_id: &str,
        outcome: FailureOutcome,
    ) -> Result<Option<Job>, MonqueError>;

    /// Refresh `lastHeartbeat` on every processing job owned by
    /// `instance_id`. Returns the number of documents touched.
    async fn heartbeat_owned(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, MonqueError>;

    /// Reset processing jobs whose `lockedAt` predates `cutoff` back to
    /// pending, clearing ownership. `failCount` is left untouched: the job
    /// has not failed, its owner disappeared.
    async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, MonqueError>;

    /// Cancel a pending job (idempotent on already-cancelled ones).
    /// `None` when the job does not exist; [`MonqueError::JobState`] when
    /// its status forbids cancellation.
    async fn cancel_job(
        &self,
        id: ObjectId,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusTransition>, MonqueError>;

    /// Reset a failed or cancelled job to pending, eligible immediately.
    async fn retry_job(
        &self,
        id: ObjectId,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusTransition>, MonqueError>;

    /// Move a pending job's `nextRunAt`.
    async fn reschedule_job(
        &self,
        id: ObjectId,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, MonqueError>;

    /// Remove a job document. Returns `false` when it did not exist.
    async fn delete_job(&self, id: ObjectId) -> Result<bool, MonqueError>;

    /// All jobs matching `selector`, in ascending id order.
    async fn find_jobs(&self, selector: &JobSelector) -> Result<Vec<Job>, MonqueError>;

    /// One page of jobs keyed by id.
    async fn page_jobs(&self, query: &JobPageQuery) -> Result<JobPage, MonqueError>;

    /// Aggregate counts per status, optionally restricted to one job name.
    async fn queue_stats(&self, name: Option<&str>) -> Result<QueueStats, MonqueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::Bson;
    use chrono::Utc;

    #[test]
    fn cursor_round_trips() {
        let id = ObjectId::new();
        let cursor = encode_cursor(&id);
        assert_eq!(decode_cursor(&cursor).unwrap(), id);
    }

    #[test]
    fn malformed_cursor_is_rejected() {
        let err = decode_cursor("definitely-not-an-id").unwrap_err();
        assert!(matches!(err, MonqueError::InvalidCursor { .. }));
    }

    #[test]
    fn selector_matches_on_name_and_status() {
        let now = Utc::now();
        let job = Job::new("send", Bson::Null, now, now);

        assert!(JobSelector::default().matches(&job));
        assert!(JobSelector::name("send").matches(&job));
        assert!(!JobSelector::name("other").matches(&job));
        assert!(JobSelector::status(JobStatus::Pending).matches(&job));
        assert!(!JobSelector::status(JobStatus::Failed).matches(&job));
        assert!(JobSelector::name("send")
            .with_status(JobStatus::Pending)
            .matches(&job));
    }

    #[test]
    fn enqueue_outcome_unwraps_either_way() {
        let now = Utc::now();
        let job = Job::new("send", Bson::Null, now, now);
        let id = job.id;
        assert!(EnqueueOutcome::Created(job.clone()).is_created());
        assert!(!EnqueueOutcome::Existing(job.clone()).is_created());
        assert_eq!(EnqueueOutcome::Existing(job).into_job().id, id);
    }

    #[test]
    fn page_assembly_forward_without_anchor() {
        let now = Utc::now();
        let jobs: Vec<Job> = (0..3)
            .map(|_| Job::new("send", Bson::Null, now, now))
            .collect();
        let last = jobs.last().map(|j| j.id);

        let query = JobPageQuery {
            limit: 3,
            ..Default::default()
        };
        let page = page_from(jobs, true, &query);
        assert_eq!(page.next_cursor, last.map(|id| encode_cursor(&id)));
        assert!(page.prev_cursor.is_none());
    }

    #[test]
    fn page_assembly_backward_flags_prev() {
        let now = Utc::now();
        let jobs: Vec<Job> = (0..2)
            .map(|_| Job::new("send", Bson::Null, now, now))
            .collect();
        let first = jobs.first().map(|j| j.id);

        let query = JobPageQuery {
            limit: 2,
            cursor: Some(encode_cursor(&ObjectId::new())),
            direction: PageDirection::Backward,
            ..Default::default()
        };
        let page = page_from(jobs, true, &query);
        assert_eq!(page.prev_cursor, first.map(|id| encode_cursor(&id)));
        assert!(page.next_cursor.is_some());
    }

    #[test]
    fn empty_page_has_no_cursors() {
        let query = JobPageQuery::default();
        let page = page_from(Vec::new(), false, &query);
        assert!(page.jobs.is_empty());
        assert!(page.next_cursor.is_none());
        assert!(page.prev_cursor.is_none());
    }

    #[test]
    fn stats_total_sums_all_statuses() {
        let stats = QueueStats {
            pending: 1,
            processing: 2,
            completed: 3,
            failed: 4,
            cancelled: 5,
            mean_run_duration_ms: None,
        };
        assert_eq!(stats.total(), 15);
    }
}
