//! Job lifecycle events and the broadcast bus they travel on.
//!
//! Events are facts about the lifecycle, not commands. Emission is
//! fire-and-forget: a slow or absent subscriber never stalls job
//! processing, and lagged receivers simply miss events.

use std::sync::Arc;
use std::time::Duration;

use bson::oid::ObjectId;
use tokio::sync::broadcast;

use crate::error::MonqueError;
use crate::job::{Job, JobStatus};

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 1024;

/// Scheduler lifecycle events.
#[derive(Debug, Clone)]
pub enum MonqueEvent {
    /// A handler is about to run a claimed job.
    JobStart { job: Job },
    /// A handler finished successfully.
    JobComplete { job: Job, duration: Duration },
    /// A handler failed; `will_retry` tells whether another attempt is due.
    JobFail {
        job: Job,
        error: String,
        will_retry: bool,
    },
    /// An internal error outside any single handler: claim failures,
    /// heartbeat failures, state-write failures, shutdown timeout.
    JobError {
        error: Arc<MonqueError>,
        job: Option<Job>,
    },
    /// A job was cancelled by an operator.
    JobCancelled { job: Job },
    /// A failed or cancelled job was reset to pending by an operator.
    JobRetried {
        job: Job,
        previous_status: JobStatus,
    },
    /// A job document was deleted.
    JobDeleted { job_id: ObjectId },
    /// The stale-job sweep reset abandoned jobs back to pending.
    StaleRecovered { count: u64 },
    /// The change-stream subscriber is connected.
    ChangeStreamConnected,
    /// Change streams were abandoned; dispatch relies on polling alone.
    ChangeStreamFallback { reason: String },
    /// The change stream closed.
    ChangeStreamClosed,
    /// The change stream reported an error; a reconnect follows.
    ChangeStreamError { error: String },
}

/// Broadcast fan-out for [`MonqueEvent`].
///
/// Cloning the bus clones the sender; every clone emits into the same
/// channel. Subscribers receive events emitted after they subscribe.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MonqueEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Returns the number of receivers
    /// that got it; zero when nobody is listening.
    pub fn emit(&self, event: MonqueEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MonqueEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::Bson;
    use chrono::Utc;

    fn sample_job() -> Job {
        let now = Utc::now();
        Job::new("test_job", Bson::Null, now, now)
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let delivered = bus.emit(MonqueEvent::JobStart { job: sample_job() });
        assert_eq!(delivered, 1);

        match rx.recv().await.unwrap() {
            MonqueEvent::JobStart { job } => assert_eq!(job.name, "test_job"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_a_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.emit(MonqueEvent::ChangeStreamConnected), 0);
    }

    #[tokio::test]
    async fn clones_share_the_channel() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let clone = bus.clone();
        clone.emit(MonqueEvent::StaleRecovered { count: 3 });

        match rx.recv().await.unwrap() {
            MonqueEvent::StaleRecovered { count } => assert_eq!(count, 3),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
