//! The `Monque` scheduler facade.
//!
//! One value wires the whole engine together: the store, the worker
//! registry, the event bus, and the background tasks (dispatch loop,
//! heartbeat pump, change-stream subscriber). Multiple instances sharing a
//! collection cooperate through the database alone; nothing here talks to
//! other instances directly.
//!
//! # Example
//!
//! ```ignore
//! let client = mongodb::Client::with_uri_str("mongodb://localhost").await?;
//! let monque = Monque::new(&client.database("app"), MonqueConfig::default());
//!
//! monque.register("send_email", |job| async move {
//!     let email: Email = job.data_as()?;
//!     deliver(email).await
//! }, WorkerOptions::default())?;
//!
//! monque.initialize().await?;
//! monque.start()?;
//!
//! monque.now("send_email", &Email { to: "a@b".into() }).await?;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bson::oid::ObjectId;
use chrono::{DateTime, Utc};
use mongodb::{Collection, Database};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::change_stream::ChangeStreamSubscriber;
use crate::clock::{Clock, SystemClock};
use crate::config::MonqueConfig;
use crate::dispatch::DispatchLoop;
use crate::error::MonqueError;
use crate::events::{EventBus, MonqueEvent};
use crate::executor::ExecutionPipeline;
use crate::heartbeat::HeartbeatPump;
use crate::job::{Job, JobStatus};
use crate::mongo::MongoJobStore;
use crate::recovery;
use crate::registry::{WorkerOptions, WorkerRegistry};
use crate::schedule;
use crate::store::{
    BulkOutcome, JobPage, JobPageQuery, JobSelector, JobStore, QueueStats,
};

/// Options for [`Monque::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Deduplication key: while an active job holds it, further enqueues
    /// return that job unchanged.
    pub unique_key: Option<String>,
    /// Earliest eligible instant; defaults to now.
    pub run_at: Option<DateTime<Utc>>,
}

impl EnqueueOptions {
    pub fn unique_key(key: impl Into<String>) -> Self {
        Self {
            unique_key: Some(key.into()),
            run_at: None,
        }
    }

    pub fn run_at(at: DateTime<Utc>) -> Self {
        Self {
            unique_key: None,
            run_at: Some(at),
        }
    }

    pub fn with_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }
}

/// Options for [`Monque::schedule`].
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub unique_key: Option<String>,
}

impl ScheduleOptions {
    pub fn unique_key(key: impl Into<String>) -> Self {
        Self {
            unique_key: Some(key.into()),
        }
    }
}

/// Handles owned by a running scheduler.
struct RunCtl {
    token: CancellationToken,
    // Held so the wake channel stays open when no subscriber exists.
    _wake_tx: mpsc::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    done_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct Lifecycle {
    ctl: Option<RunCtl>,
    done_rx: Option<watch::Receiver<bool>>,
}

/// A distributed job scheduler instance.
pub struct Monque {
    store: Arc<dyn JobStore>,
    stream_source: Option<Collection<Job>>,
    registry: Arc<WorkerRegistry>,
    events: EventBus,
    config: Arc<MonqueConfig>,
    clock: Arc<dyn Clock>,
    instance_id: String,
    initialized: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

impl Monque {
    /// Scheduler over a MongoDB database, using the collection named in the
    /// configuration.
    pub fn new(db: &Database, config: MonqueConfig) -> Self {
        let collection = db.collection::<Job>(&config.collection_name);
        let store: Arc<dyn JobStore> = Arc::new(MongoJobStore::new(collection.clone()));
        Self::assemble(store, Some(collection), config, Arc::new(SystemClock))
    }

    /// Scheduler over an arbitrary store. Without a MongoDB collection there
    /// is no change stream; dispatch relies on interval polling.
    pub fn with_store(store: Arc<dyn JobStore>, config: MonqueConfig) -> Self {
        Self::assemble(store, None, config, Arc::new(SystemClock))
    }

    /// [`Monque::with_store`] with an injected clock.
    pub fn with_store_and_clock(
        store: Arc<dyn JobStore>,
        config: MonqueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::assemble(store, None, config, clock)
    }

    fn assemble(
        store: Arc<dyn JobStore>,
        stream_source: Option<Collection<Job>>,
        config: MonqueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let instance_id = config
            .scheduler_instance_id
            .clone()
            .unwrap_or_else(|| format!("monque-{}", Uuid::new_v4()));
        Self {
            registry: Arc::new(WorkerRegistry::new(config.default_concurrency)),
            events: EventBus::new(),
            config: Arc::new(config),
            store,
            stream_source,
            clock,
            instance_id,
            initialized: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Stable identifier of this instance; stored in `claimedBy` on every
    /// job it owns.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &MonqueConfig {
        &self.config
    }

    /// Subscribe to lifecycle events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MonqueEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.lock_lifecycle().ctl.is_some()
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Producer API
    // ------------------------------------------------------------------

    /// Insert one pending job. With a unique key the operation dedups: while
    /// an active job holds the key, that job is returned unchanged.
    pub async fn enqueue<T: Serialize>(
        &self,
        name: &str,
        data: &T,
        options: EnqueueOptions,
    ) -> Result<Job, MonqueError> {
        let now = self.clock.now();
        let run_at = options.run_at.unwrap_or(now);
        let job = Job::new(name, bson::to_bson(data)?, run_at, now)
            .with_unique_key(options.unique_key);
        let outcome = self.store.insert(job).await?;
        Ok(outcome.into_job())
    }

    /// Insert a job eligible to run immediately.
    pub async fn now<T: Serialize>(&self, name: &str, data: &T) -> Result<Job, MonqueError> {
        self.enqueue(name, data, EnqueueOptions::default()).await
    }

    /// Insert a recurring job firing per the cron expression.
    pub async fn schedule<T: Serialize>(
        &self,
        expr: &str,
        name: &str,
        data: &T,
        options: ScheduleOptions,
    ) -> Result<Job, MonqueError> {
        let now = self.clock.now();
        let first_run = schedule::next_after(expr, now)?;
        let job = Job::new(name, bson::to_bson(data)?, first_run, now)
            .with_unique_key(options.unique_key)
            .with_repeat_interval(expr);
        let outcome = self.store.insert(job).await?;
        Ok(outcome.into_job())
    }

    /// Register a handler for jobs named `name`.
    pub fn register<F, Fut>(
        &self,
        name: impl Into<String>,
        handler: F,
        options: WorkerOptions,
    ) -> Result<(), MonqueError>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry.register(name, handler, options)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Create indexes and, unless disabled, run the stale-job sweep.
    /// Must be called once before [`Monque::start`].
    pub async fn initialize(&self) -> Result<(), MonqueError> {
        self.store.prepare().await?;
        if self.config.recover_stale_jobs {
            recovery::sweep(&self.store, &self.config, &self.clock, &self.events).await?;
        }
        self.initialized.store(true, Ordering::SeqCst);
        debug!(instance_id = %self.instance_id, "scheduler initialized");
        Ok(())
    }

    /// Launch the dispatch loop, heartbeat pump, and (when a collection is
    /// available) the change-stream subscriber. Idempotent while running.
    pub fn start(&self) -> Result<(), MonqueError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(MonqueError::NotInitialized);
        }

        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.ctl.is_some() {
            return Ok(());
        }

        let token = CancellationToken::new();
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = watch::channel(false);

        let pipeline = Arc::new(ExecutionPipeline::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.events.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.config),
            self.instance_id.clone(),
        ));

        let dispatch = DispatchLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            pipeline,
            self.events.clone(),
            Arc::clone(&self.clock),
            self.config.poll_interval,
            self.config.heartbeat_interval.as_millis() as i64,
            self.instance_id.clone(),
            wake_rx,
            token.child_token(),
        );

        let heartbeat = HeartbeatPump::new(
            Arc::clone(&self.store),
            self.events.clone(),
            Arc::clone(&self.clock),
            self.config.heartbeat_interval,
            self.instance_id.clone(),
            token.child_token(),
        );

        let mut tasks = vec![tokio::spawn(dispatch.run()), tokio::spawn(heartbeat.run())];

        if let Some(collection) = &self.stream_source {
            let subscriber = ChangeStreamSubscriber::new(
                collection.clone(),
                wake_tx.clone(),
                self.events.clone(),
                token.child_token(),
            );
            tasks.push(tokio::spawn(subscriber.run()));
        }

        lifecycle.ctl = Some(RunCtl {
            token,
            _wake_tx: wake_tx,
            tasks,
            done_tx,
        });
        lifecycle.done_rx = Some(done_rx);

        info!(instance_id = %self.instance_id, "scheduler started");
        Ok(())
    }

    /// Stop dispatching, then wait for in-flight handlers to drain or for
    /// the shutdown deadline to expire.
    ///
    /// Idempotent and concurrent-safe: every caller returns when the
    /// shutdown completes, and a scheduler that never started returns
    /// immediately. Running handlers are never cancelled; a deadline expiry
    /// is reported as a `job:error` carrying the in-flight job ids.
    pub async fn stop(&self) {
        let ctl = self.lock_lifecycle().ctl.take();
        match ctl {
            Some(ctl) => self.perform_shutdown(ctl).await,
            None => {
                let done_rx = self.lock_lifecycle().done_rx.clone();
                if let Some(mut done_rx) = done_rx {
                    while !*done_rx.borrow() {
                        if done_rx.changed().await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn perform_shutdown(&self, ctl: RunCtl) {
        debug!(instance_id = %self.instance_id, "stopping scheduler");
        ctl.token.cancel();
        for task in ctl.tasks {
            let _ = task.await;
        }

        let drained =
            tokio::time::timeout(self.config.shutdown_timeout, self.registry.wait_idle()).await;
        if drained.is_err() {
            let pending = self.registry.in_flight_ids();
            warn!(
                count = pending.len(),
                "shutdown deadline expired with jobs still in flight"
            );
            self.events.emit(MonqueEvent::JobError {
                error: Arc::new(MonqueError::ShutdownTimeout { pending }),
                job: None,
            });
        }

        info!(instance_id = %self.instance_id, "scheduler stopped");
        let _ = ctl.done_tx.send(true);
    }

    // ------------------------------------------------------------------
    // Management surface
    // ------------------------------------------------------------------

    pub async fn get_job(&self, id: ObjectId) -> Result<Option<Job>, MonqueError> {
        self.store.find_by_id(id).await
    }

    /// All jobs matching the selector, unpaginated.
    pub async fn jobs(&self, selector: &JobSelector) -> Result<Vec<Job>, MonqueError> {
        self.store.find_jobs(selector).await
    }

    /// Cancel a pending job; idempotent on already-cancelled jobs. `None`
    /// when the job does not exist.
    pub async fn cancel_job(&self, id: ObjectId) -> Result<Option<Job>, MonqueError> {
        match self.store.cancel_job(id, self.clock.now()).await? {
            Some(transition) => {
                if transition.previous_status != JobStatus::Cancelled {
                    self.events.emit(MonqueEvent::JobCancelled {
                        job: transition.job.clone(),
                    });
                }
                Ok(Some(transition.job))
            }
            None => Ok(None),
        }
    }

    /// Reset a failed or cancelled job to pending, eligible immediately,
    /// with its failure bookkeeping cleared.
    pub async fn retry_job(&self, id: ObjectId) -> Result<Option<Job>, MonqueError> {
        match self.store.retry_job(id, self.clock.now()).await? {
            Some(transition) => {
                self.events.emit(MonqueEvent::JobRetried {
                    job: transition.job.clone(),
                    previous_status: transition.previous_status,
                });
                Ok(Some(transition.job))
            }
            None => Ok(None),
        }
    }

    /// Move a pending job's eligible instant.
    pub async fn reschedule_job(
        &self,
        id: ObjectId,
        run_at: DateTime<Utc>,
    ) -> Result<Option<Job>, MonqueError> {
        self.store.reschedule_job(id, run_at, self.clock.now()).await
    }

    /// Delete a job document outright. Returns `false` when absent.
    pub async fn delete_job(&self, id: ObjectId) -> Result<bool, MonqueError> {
        let deleted = self.store.delete_job(id).await?;
        if deleted {
            self.events.emit(MonqueEvent::JobDeleted { job_id: id });
        }
        Ok(deleted)
    }

    /// Cancel every matching job, collecting per-document state errors.
    pub async fn cancel_jobs(&self, selector: &JobSelector) -> Result<BulkOutcome, MonqueError> {
        let mut outcome = BulkOutcome::default();
        for job in self.store.find_jobs(selector).await? {
            match self.cancel_job(job.id).await {
                Ok(Some(_)) => outcome.modified += 1,
                Ok(None) => {}
                Err(err @ MonqueError::JobState { .. }) => outcome.errors.push((job.id, err)),
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }

    /// Retry every matching job, collecting per-document state errors.
    pub async fn retry_jobs(&self, selector: &JobSelector) -> Result<BulkOutcome, MonqueError> {
        let mut outcome = BulkOutcome::default();
        for job in self.store.find_jobs(selector).await? {
            match self.retry_job(job.id).await {
                Ok(Some(_)) => outcome.modified += 1,
                Ok(None) => {}
                Err(err @ MonqueError::JobState { .. }) => outcome.errors.push((job.id, err)),
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }

    /// Delete every matching job.
    pub async fn delete_jobs(&self, selector: &JobSelector) -> Result<BulkOutcome, MonqueError> {
        let mut outcome = BulkOutcome::default();
        for job in self.store.find_jobs(selector).await? {
            if self.delete_job(job.id).await? {
                outcome.modified += 1;
            }
        }
        Ok(outcome)
    }

    /// One page of jobs keyed by id, with opaque forward/backward cursors.
    pub async fn get_jobs_with_cursor(
        &self,
        query: &JobPageQuery,
    ) -> Result<JobPage, MonqueError> {
        self.store.page_jobs(query).await
    }

    /// Aggregate counts per status plus the mean successful-run duration.
    pub async fn get_queue_stats(&self, name: Option<&str>) -> Result<QueueStats, MonqueError> {
        self.store.queue_stats(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryJobStore;

    fn scheduler() -> Monque {
        Monque::with_store(Arc::new(MemoryJobStore::new()), MonqueConfig::default())
    }

    #[test]
    fn instance_id_is_generated_when_unset() {
        let monque = scheduler();
        assert!(monque.instance_id().starts_with("monque-"));
    }

    #[test]
    fn instance_id_honors_configuration() {
        let config = MonqueConfig::default().with_instance_id("node-7");
        let monque = Monque::with_store(Arc::new(MemoryJobStore::new()), config);
        assert_eq!(monque.instance_id(), "node-7");
    }

    #[tokio::test]
    async fn start_requires_initialize() {
        let monque = scheduler();
        let err = monque.start().unwrap_err();
        assert!(matches!(err, MonqueError::NotInitialized));
    }

    #[tokio::test]
    async fn stop_before_start_returns_immediately() {
        let monque = scheduler();
        tokio::time::timeout(std::time::Duration::from_millis(100), monque.stop())
            .await
            .expect("stop on a never-started scheduler must not block");
    }

    #[tokio::test]
    async fn start_is_idempotent_while_running() {
        let monque = scheduler();
        monque.initialize().await.unwrap();
        monque.start().unwrap();
        monque.start().unwrap();
        assert!(monque.is_running());
        monque.stop().await;
        assert!(!monque.is_running());
    }

    #[tokio::test]
    async fn schedule_rejects_invalid_cron() {
        let monque = scheduler();
        let err = monque
            .schedule("nope", "hourly", &(), ScheduleOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MonqueError::InvalidCron { expr } if expr == "nope"));
    }
}
