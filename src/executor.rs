//! Execution pipeline: runs a claimed job and writes the outcome.
//!
//! The pipeline owns the whole life of one occurrence: governor bookkeeping,
//! `job:start`/`job:complete`/`job:fail` emission, and the post-run state
//! transition. Handler errors never escape it.

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::config::MonqueConfig;
use crate::error::MonqueError;
use crate::events::{EventBus, MonqueEvent};
use crate::job::Job;
use crate::registry::WorkerRegistry;
use crate::schedule;
use crate::store::{FailureOutcome, JobStore, SuccessOutcome};

/// The state transition owed after a failed attempt.
#[derive(Debug, PartialEq)]
pub(crate) struct FailurePlan {
    pub fail_count: u32,
    pub will_retry: bool,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// After a success, a recurring job advances to its next occurrence and a
/// one-shot job completes.
pub(crate) fn success_next_run(
    job: &Job,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, MonqueError> {
    match &job.repeat_interval {
        Some(expr) => Ok(Some(schedule::next_after(expr, now)?)),
        None => Ok(None),
    }
}

/// After a failure, either schedule a backed-off retry or fail permanently.
pub(crate) fn failure_plan(job: &Job, config: &MonqueConfig, now: DateTime<Utc>) -> FailurePlan {
    let fail_count = job.fail_count + 1;
    let will_retry = fail_count < config.max_retries;
    let next_run_at = will_retry.then(|| {
        let delay = schedule::retry_delay(
            fail_count,
            config.base_retry_interval,
            config.max_backoff_delay,
        );
        now + crate::clock::to_chrono(delay)
    });
    FailurePlan {
        fail_count,
        will_retry,
        next_run_at,
    }
}

pub(crate) struct ExecutionPipeline {
    store: Arc<dyn JobStore>,
    registry: Arc<WorkerRegistry>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    config: Arc<MonqueConfig>,
    instance_id: String,
}

impl ExecutionPipeline {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<WorkerRegistry>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        config: Arc<MonqueConfig>,
        instance_id: String,
    ) -> Self {
        Self {
            store,
            registry,
            events,
            clock,
            config,
            instance_id,
        }
    }

    /// Take ownership of a claimed job and run it in the background. The
    /// dispatch loop never awaits handler completion.
    pub(crate) fn dispatch(self: Arc<Self>, job: Job) {
        if !self.registry.track(&job.name, job.id) {
            // Dispatch is the only caller that tracks, so this means the
            // worker was unregistered between claim and hand-off.
            warn!(job_id = %job.id, name = %job.name, "claimed job has no tracked worker slot");
        }
        tokio::spawn(async move {
            self.run(job).await;
        });
    }

    async fn run(&self, job: Job) {
        let id = job.id;
        let name = job.name.clone();

        self.events.emit(MonqueEvent::JobStart { job: job.clone() });
        let started = Instant::now();
        let result = self.invoke(job.clone()).await;
        let elapsed = started.elapsed();
        let now = self.clock.now();

        match result {
            Ok(()) => match success_next_run(&job, now) {
                Ok(next_run_at) => {
                    let outcome = SuccessOutcome {
                        now,
                        duration_ms: elapsed.as_millis() as i64,
                        next_run_at,
                    };
                    match self.store.complete_success(id, &self.instance_id, outcome).await {
                        Ok(Some(updated)) => {
                            debug!(job_id = %id, name = %name, duration_ms = elapsed.as_millis() as u64, "job succeeded");
                            self.events.emit(MonqueEvent::JobComplete {
                                job: updated,
                                duration: elapsed,
                            });
                        }
                        Ok(None) => {
                            debug!(job_id = %id, "ownership lost before completion write");
                        }
                        Err(err) => self.surface(err, Some(job.clone())),
                    }
                }
                // The recurrence expression stopped parsing: the job cannot
                // be rescheduled, so it fails permanently.
                Err(cron_err) => {
                    self.write_failure(&job, cron_err.to_string(), job.fail_count + 1, false, None, now)
                        .await;
                }
            },
            Err(handler_err) => {
                let plan = failure_plan(&job, &self.config, now);
                warn!(
                    job_id = %id,
                    name = %name,
                    error = %handler_err,
                    will_retry = plan.will_retry,
                    "job failed"
                );
                self.write_failure(
                    &job,
                    handler_err.to_string(),
                    plan.fail_count,
                    plan.will_retry,
                    plan.next_run_at,
                    now,
                )
                .await;
            }
        }

        self.registry.untrack(&name, id);
    }

    /// Run the handler in its own task so a panic is contained and reported
    /// as a failure instead of tearing down the pipeline.
    async fn invoke(&self, job: Job) -> anyhow::Result<()> {
        let Some(handler) = self.registry.handler(&job.name) else {
            return Err(anyhow!("no worker registered for job name {}", job.name));
        };
        match tokio::spawn(handler(job)).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => Err(anyhow!("handler panicked: {join_err}")),
            Err(join_err) => Err(anyhow!("handler task aborted: {join_err}")),
        }
    }

    async fn write_failure(
        &self,
        job: &Job,
        reason: String,
        fail_count: u32,
        will_retry: bool,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let outcome = FailureOutcome {
            now,
            fail_count,
            reason: reason.clone(),
            next_run_at,
        };
        match self
            .store
            .complete_failure(job.id, &self.instance_id, outcome)
            .await
        {
            Ok(updated) => {
                let job = updated.unwrap_or_else(|| job.clone());
                self.events.emit(MonqueEvent::JobFail {
                    job,
                    error: reason,
                    will_retry,
                });
            }
            Err(err) => self.surface(err, Some(job.clone())),
        }
    }

    fn surface(&self, err: MonqueError, job: Option<Job>) {
        error!(error = %err, "job state write failed");
        self.events.emit(MonqueEvent::JobError {
            error: Arc::new(err),
            job,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::Bson;
    use chrono::TimeZone;
    use std::time::Duration;

    fn job_with_failures(fail_count: u32) -> Job {
        let now = Utc::now();
        let mut job = Job::new("send", Bson::Null, now, now);
        job.fail_count = fail_count;
        job
    }

    fn config(max_retries: u32, base_ms: u64, cap_ms: Option<u64>) -> MonqueConfig {
        let mut config = MonqueConfig::default()
            .with_max_retries(max_retries)
            .with_base_retry_interval(Duration::from_millis(base_ms));
        if let Some(cap) = cap_ms {
            config = config.with_max_backoff_delay(Duration::from_millis(cap));
        }
        config
    }

    #[test]
    fn failure_backs_off_exponentially() {
        let now = Utc::now();
        let config = config(10, 100, None);

        let plan = failure_plan(&job_with_failures(0), &config, now);
        assert_eq!(plan.fail_count, 1);
        assert!(plan.will_retry);
        assert_eq!(plan.next_run_at, Some(now + chrono::Duration::milliseconds(200)));

        let plan = failure_plan(&job_with_failures(1), &config, now);
        assert_eq!(plan.fail_count, 2);
        assert_eq!(plan.next_run_at, Some(now + chrono::Duration::milliseconds(400)));
    }

    #[test]
    fn failure_respects_backoff_cap() {
        let now = Utc::now();
        let config = config(10, 1000, Some(1500));
        let plan = failure_plan(&job_with_failures(5), &config, now);
        assert_eq!(plan.next_run_at, Some(now + chrono::Duration::milliseconds(1500)));
    }

    #[test]
    fn final_attempt_fails_permanently() {
        let now = Utc::now();
        let config = config(2, 100, None);
        let plan = failure_plan(&job_with_failures(1), &config, now);
        assert_eq!(plan.fail_count, 2);
        assert!(!plan.will_retry);
        assert!(plan.next_run_at.is_none());
    }

    #[test]
    fn success_completes_one_shot_jobs() {
        let now = Utc::now();
        let job = job_with_failures(0);
        assert_eq!(success_next_run(&job, now).unwrap(), None);
    }

    #[test]
    fn success_advances_recurring_jobs() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 10, 30, 0).unwrap();
        let job = Job::new("hourly", Bson::Null, at, at).with_repeat_interval("0 * * * *");
        let next = success_next_run(&job, at).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap());
        assert!(next > at);
    }

    #[test]
    fn broken_recurrence_is_an_error() {
        let now = Utc::now();
        let job = Job::new("hourly", Bson::Null, now, now).with_repeat_interval("garbage");
        assert!(success_next_run(&job, now).is_err());
    }
}
