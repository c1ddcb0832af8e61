//! Worker registry and per-name concurrency governor.
//!
//! The registry maps job names to handlers and bounds how many jobs of each
//! name this process runs at once. All state is process-local; cluster-wide
//! concurrency is a property of the cluster, not of one scheduler.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bson::oid::ObjectId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::error::MonqueError;
use crate::job::Job;

/// Type-erased async job handler.
///
/// Handlers signal failure by returning an error; anything else is treated
/// as success. The error never propagates past the execution pipeline.
pub type JobHandler =
    Arc<dyn Fn(Job) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// Options for registering a worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Maximum concurrent jobs of this name in this process. Falls back to
    /// the scheduler's `default_concurrency`.
    pub concurrency: Option<usize>,
    /// Replace an existing registration instead of failing.
    pub replace: bool,
}

impl WorkerOptions {
    pub fn concurrency(limit: usize) -> Self {
        Self {
            concurrency: Some(limit),
            replace: false,
        }
    }

    pub fn replace(mut self) -> Self {
        self.replace = true;
        self
    }
}

struct WorkerEntry {
    handler: JobHandler,
    concurrency: usize,
    in_flight: HashSet<ObjectId>,
}

/// Registered handlers plus in-flight bookkeeping.
///
/// The slot check and in-flight mutation for one name happen under that
/// name's entry lock, so completions racing the dispatch loop cannot break
/// the concurrency limit.
pub struct WorkerRegistry {
    workers: DashMap<String, WorkerEntry>,
    default_concurrency: usize,
    total_in_flight: AtomicUsize,
    idle: Notify,
}

impl WorkerRegistry {
    pub fn new(default_concurrency: usize) -> Self {
        Self {
            workers: DashMap::new(),
            default_concurrency,
            total_in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Register a handler for `name`.
    ///
    /// Fails with [`MonqueError::WorkerRegistration`] if a handler already
    /// exists and `options.replace` is not set.
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
        let name = name.into();
        let entry = WorkerEntry {
            handler: Arc::new(move |job| Box::pin(handler(job))),
            concurrency: options.concurrency.unwrap_or(self.default_concurrency),
            in_flight: HashSet::new(),
        };

        match self.workers.entry(name) {
            Entry::Occupied(mut occupied) => {
                if !options.replace {
                    return Err(MonqueError::WorkerRegistration {
                        name: occupied.key().clone(),
                    });
                }
                // Keep the in-flight set: replacing a handler must not leak
                // slots held by jobs already running.
                let in_flight = std::mem::take(&mut occupied.get_mut().in_flight);
                occupied.insert(WorkerEntry { in_flight, ..entry });
                Ok(())
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    /// All registered job names.
    pub fn names(&self) -> Vec<String> {
        self.workers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn handler(&self, name: &str) -> Option<JobHandler> {
        self.workers.get(name).map(|e| e.handler.clone())
    }

    /// Free slots for `name`: `concurrency - in_flight`, floor 0.
    pub fn slots(&self, name: &str) -> usize {
        self.workers
            .get(name)
            .map(|e| e.concurrency.saturating_sub(e.in_flight.len()))
            .unwrap_or(0)
    }

    /// Record `id` as in flight for `name` if a slot is free.
    pub fn track(&self, name: &str, id: ObjectId) -> bool {
        let Some(mut entry) = self.workers.get_mut(name) else {
            return false;
        };
        if entry.in_flight.len() >= entry.concurrency || !entry.in_flight.insert(id) {
            return false;
        }
        self.total_in_flight.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Remove `id` from the in-flight set for `name`.
    pub fn untrack(&self, name: &str, id: ObjectId) {
        let removed = self
            .workers
            .get_mut(name)
            .map(|mut e| e.in_flight.remove(&id))
            .unwrap_or(false);
        if removed && self.total_in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Jobs currently in flight in this process, across all names.
    pub fn total_in_flight(&self) -> usize {
        self.total_in_flight.load(Ordering::SeqCst)
    }

    /// Ids of all in-flight jobs.
    pub fn in_flight_ids(&self) -> Vec<ObjectId> {
        self.workers
            .iter()
            .flat_map(|e| e.in_flight.iter().copied().collect::<Vec<_>>())
            .collect()
    }

    /// Wait until the in-flight count reaches zero.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.total_in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(5)
    }

    #[test]
    fn register_then_duplicate_fails() {
        let reg = registry();
        reg.register("send", |_job| async { Ok(()) }, WorkerOptions::default())
            .unwrap();

        let err = reg
            .register("send", |_job| async { Ok(()) }, WorkerOptions::default())
            .unwrap_err();
        assert!(matches!(err, MonqueError::WorkerRegistration { name } if name == "send"));
    }

    #[test]
    fn replace_overrides_existing_handler() {
        let reg = registry();
        reg.register("send", |_job| async { Ok(()) }, WorkerOptions::default())
            .unwrap();
        reg.register(
            "send",
            |_job| async { Ok(()) },
            WorkerOptions::concurrency(2).replace(),
        )
        .unwrap();
        assert_eq!(reg.slots("send"), 2);
    }

    #[test]
    fn slots_honor_concurrency_limit() {
        let reg = registry();
        reg.register("send", |_job| async { Ok(()) }, WorkerOptions::concurrency(2))
            .unwrap();
        assert_eq!(reg.slots("send"), 2);

        let a = ObjectId::new();
        let b = ObjectId::new();
        assert!(reg.track("send", a));
        assert!(reg.track("send", b));
        assert_eq!(reg.slots("send"), 0);
        // Limit reached: no further slot may be taken.
        assert!(!reg.track("send", ObjectId::new()));

        reg.untrack("send", a);
        assert_eq!(reg.slots("send"), 1);
        reg.untrack("send", b);
        assert_eq!(reg.total_in_flight(), 0);
    }

    #[test]
    fn unknown_name_has_no_slots() {
        let reg = registry();
        assert_eq!(reg.slots("nope"), 0);
        assert!(!reg.track("nope", ObjectId::new()));
        assert!(reg.handler("nope").is_none());
    }

    #[test]
    fn default_concurrency_applies_when_unspecified() {
        let reg = WorkerRegistry::new(3);
        reg.register("send", |_job| async { Ok(()) }, WorkerOptions::default())
            .unwrap();
        assert_eq!(reg.slots("send"), 3);
    }

    #[tokio::test]
    async fn wait_idle_resolves_when_last_job_finishes() {
        let reg = Arc::new(registry());
        reg.register("send", |_job| async { Ok(()) }, WorkerOptions::default())
            .unwrap();
        let id = ObjectId::new();
        assert!(reg.track("send", id));

        let waiter = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.wait_idle().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        reg.untrack("send", id);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_idle should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_nothing_runs() {
        let reg = registry();
        tokio::time::timeout(Duration::from_millis(100), reg.wait_idle())
            .await
            .expect("idle registry should not block");
    }
}
