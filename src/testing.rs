//! In-memory test doubles: a [`JobStore`] over a `HashMap` and a manually
//! advanced clock.
//!
//! `MemoryJobStore` mirrors the guarded-transition semantics of the MongoDB
//! adapter under one mutex, which makes every operation trivially atomic.
//! It exists so the engine (dispatch, execution, retries, shutdown,
//! recovery) can be exercised without a running database.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bson::oid::ObjectId;
use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::MonqueError;
use crate::job::{Job, JobStatus};
use crate::store::{
    decode_cursor, page_from, EnqueueOutcome, FailureOutcome, JobPage, JobPageQuery, JobSelector,
    JobStore, PageDirection, QueueStats, StatusTransition, SuccessOutcome,
};

fn bdt(t: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_chrono(t)
}

fn clear_ownership(job: &mut Job) {
    job.locked_at = None;
    job.claimed_by = None;
    job.last_heartbeat = None;
    job.heartbeat_interval = None;
}

/// In-memory job store with the same transition guards as the MongoDB
/// adapter.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<ObjectId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectId, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a document verbatim, bypassing dedup. For seeding test state.
    pub fn insert_raw(&self, job: Job) {
        self.lock().insert(job.id, job);
    }

    /// Snapshot of one document.
    pub fn get(&self, id: ObjectId) -> Option<Job> {
        self.lock().get(&id).cloned()
    }

    /// Snapshot of every document, in ascending id order.
    pub fn all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.lock().values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn prepare(&self) -> Result<(), MonqueError> {
        Ok(())
    }

    async fn insert(&self, job: Job) -> Result<EnqueueOutcome, MonqueError> {
        let mut jobs = self.lock();
        if let Some(key) = &job.unique_key {
            let existing = jobs
                .values()
                .find(|j| j.status.is_active() && j.unique_key.as_deref() == Some(key))
                .cloned();
            if let Some(existing) = existing {
                return Ok(EnqueueOutcome::Existing(existing));
            }
        }
        jobs.insert(job.id, job.clone());
        Ok(EnqueueOutcome::Created(job))
    }

    async fn find_by_id(&self, id: ObjectId) -> Result<Option<Job>, MonqueError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn find_active_by_unique_key(&self, key: &str) -> Result<Option<Job>, MonqueError> {
        Ok(self
            .lock()
            .values()
            .find(|j| j.status.is_active() && j.unique_key.as_deref() == Some(key))
            .cloned())
    }

    async fn claim(
        &self,
        name: &str,
        now: DateTime<Utc>,
        instance_id: &str,
        heartbeat_interval_ms: i64,
    ) -> Result<Option<Job>, MonqueError> {
        let mut jobs = self.lock();
        let now_b = bdt(now);
        let candidate = jobs
            .values()
            .filter(|j| {
                j.name == name
                    && j.status == JobStatus::Pending
                    && j.next_run_at <= now_b
                    && j.claimed_by.is_none()
            })
            .min_by_key(|j| (j.next_run_at, j.id))
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::Processing;
        job.claimed_by = Some(instance_id.to_string());
        job.locked_at = Some(now_b);
        job.last_heartbeat = Some(now_b);
        job.heartbeat_interval = Some(heartbeat_interval_ms);
        job.updated_at = now_b;
        Ok(Some(job.clone()))
    }

    async fn complete_success(
        &self,
        id: ObjectId,
        instance_id: &str,
        outcome: SuccessOutcome,
    ) -> Result<Option<Job>, MonqueError> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Processing || job.claimed_by.as_deref() != Some(instance_id) {
            return Ok(None);
        }

        job.fail_count = 0;
        job.fail_reason = None;
        job.last_run_duration = Some(outcome.duration_ms);
        job.updated_at = bdt(outcome.now);
        match outcome.next_run_at {
            Some(next) => {
                job.status = JobStatus::Pending;
                job.next_run_at = bdt(next);
            }
            None => job.status = JobStatus::Completed,
        }
        clear_ownership(job);
        Ok(Some(job.clone()))
    }

    async fn complete_failure(
        &self,
        id: ObjectId,
        instance_id: &str,
        outcome: FailureOutcome,
    ) -> Result<Option<Job>, MonqueError> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Processing || job.claimed_by.as_deref() != Some(instance_id) {
            return Ok(None);
        }

        job.fail_count = outcome.fail_count;
        job.fail_reason = Some(outcome.reason.clone());
        job.updated_at = bdt(outcome.now);
        match outcome.next_run_at {
            Some(next) => {
                job.status = JobStatus::Pending;
                job.next_run_at = bdt(next);
            }
            None => job.status = JobStatus::Failed,
        }
        clear_ownership(job);
        Ok(Some(job.clone()))
    }

    async fn heartbeat_owned(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, MonqueError> {
        let mut jobs = self.lock();
        let now_b = bdt(now);
        let mut count = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Processing && job.claimed_by.as_deref() == Some(instance_id)
            {
                job.last_heartbeat = Some(now_b);
                job.updated_at = now_b;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, MonqueError> {
        let mut jobs = self.lock();
        let cutoff_b = bdt(cutoff);
        let now_b = bdt(now);
        let mut count = 0;
        for job in jobs.values_mut() {
            let abandoned = job.status == JobStatus::Processing
                && job.locked_at.map(|at| at < cutoff_b).unwrap_or(false);
            if abandoned {
                job.status = JobStatus::Pending;
                job.updated_at = now_b;
                clear_ownership(job);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn cancel_job(
        &self,
        id: ObjectId,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusTransition>, MonqueError> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        match job.status {
            JobStatus::Pending | JobStatus::Cancelled => {
                let previous_status = job.status;
                job.status = JobStatus::Cancelled;
                job.updated_at = bdt(now);
                Ok(Some(StatusTransition {
                    job: job.clone(),
                    previous_status,
                }))
            }
            current_status => Err(MonqueError::JobState {
                job_id: id,
                current_status,
                attempted_action: "cancel",
            }),
        }
    }

    async fn retry_job(
        &self,
        id: ObjectId,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusTransition>, MonqueError> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        match job.status {
            JobStatus::Failed | JobStatus::Cancelled => {
                let previous_status = job.status;
                job.status = JobStatus::Pending;
                job.fail_count = 0;
                job.fail_reason = None;
                job.next_run_at = bdt(now);
                job.updated_at = bdt(now);
                clear_ownership(job);
                Ok(Some(StatusTransition {
                    job: job.clone(),
                    previous_status,
                }))
            }
            current_status => Err(MonqueError::JobState {
                job_id: id,
                current_status,
                attempted_action: "retry",
            }),
        }
    }

    async fn reschedule_job(
        &self,
        id: ObjectId,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, MonqueError> {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        match job.status {
            JobStatus::Pending => {
                job.next_run_at = bdt(run_at);
                job.updated_at = bdt(now);
                Ok(Some(job.clone()))
            }
            current_status => Err(MonqueError::JobState {
                job_id: id,
                current_status,
                attempted_action: "reschedule",
            }),
        }
    }

    async fn delete_job(&self, id: ObjectId) -> Result<bool, MonqueError> {
        Ok(self.lock().remove(&id).is_some())
    }

    async fn find_jobs(&self, selector: &JobSelector) -> Result<Vec<Job>, MonqueError> {
        let mut jobs: Vec<Job> = self
            .lock()
            .values()
            .filter(|j| selector.matches(j))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn page_jobs(&self, query: &JobPageQuery) -> Result<JobPage, MonqueError> {
        let anchor = query.cursor.as_deref().map(decode_cursor).transpose()?;

        let mut matching: Vec<Job> = self
            .lock()
            .values()
            .filter(|j| query.selector.matches(j))
            .filter(|j| match (anchor, query.direction) {
                (None, _) => true,
                (Some(anchor), PageDirection::Forward) => j.id > anchor,
                (Some(anchor), PageDirection::Backward) => j.id < anchor,
            })
            .cloned()
            .collect();

        match query.direction {
            PageDirection::Forward => matching.sort_by_key(|j| j.id),
            PageDirection::Backward => {
                matching.sort_by_key(|j| j.id);
                matching.reverse();
            }
        }

        let has_more = matching.len() > query.limit;
        matching.truncate(query.limit);
        if query.direction == PageDirection::Backward {
            matching.reverse();
        }
        Ok(page_from(matching, has_more, query))
    }

    async fn queue_stats(&self, name: Option<&str>) -> Result<QueueStats, MonqueError> {
        let jobs = self.lock();
        let mut stats = QueueStats::default();
        let mut durations = Vec::new();
        for job in jobs.values() {
            if name.map_or(false, |n| n != job.name) {
                continue;
            }
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => {
                    stats.completed += 1;
                    if let Some(duration) = job.last_run_duration {
                        durations.push(duration as f64);
                    }
                }
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        if !durations.is_empty() {
            stats.mean_run_duration_ms = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        Ok(stats)
    }
}

/// A clock pinned to an instant until told otherwise.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = instant;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += crate::clock::to_chrono(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
