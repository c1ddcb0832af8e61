//! Dispatch loop: fills worker slots with claimed jobs.
//!
//! Ticks on the poll interval or on a debounced change-stream wake-up,
//! whichever comes first. Each tick claims at most `slots(name)` jobs per
//! registered name and hands them to the execution pipeline without awaiting
//! them. A tick that errors is surfaced as `job:error` and the loop keeps
//! running; correctness never depends on the wake-up channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::clock::Clock;
use crate::events::{EventBus, MonqueEvent};
use crate::executor::ExecutionPipeline;
use crate::registry::WorkerRegistry;
use crate::store::JobStore;

pub(crate) struct DispatchLoop {
    store: Arc<dyn JobStore>,
    registry: Arc<WorkerRegistry>,
    pipeline: Arc<ExecutionPipeline>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    heartbeat_interval_ms: i64,
    instance_id: String,
    wake: mpsc::Receiver<()>,
    shutdown: CancellationToken,
}

impl DispatchLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<WorkerRegistry>,
        pipeline: Arc<ExecutionPipeline>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        heartbeat_interval_ms: i64,
        instance_id: String,
        wake: mpsc::Receiver<()>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            pipeline,
            events,
            clock,
            poll_interval,
            heartbeat_interval_ms,
            instance_id,
            wake,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(instance_id = %self.instance_id, "dispatch loop starting");
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = poll.tick() => {}
                Some(_) = self.wake.recv() => {}
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            self.tick().await;
        }
        debug!(instance_id = %self.instance_id, "dispatch loop stopped");
    }

    async fn tick(&self) {
        for name in self.registry.names() {
            if self.shutdown.is_cancelled() {
                return;
            }

            let slots = self.registry.slots(&name);
            if slots == 0 {
                continue;
            }

            for _ in 0..slots {
                if self.shutdown.is_cancelled() {
                    return;
                }
                let now = self.clock.now();
                match self
                    .store
                    .claim(&name, now, &self.instance_id, self.heartbeat_interval_ms)
                    .await
                {
                    // A claim that raced the stop flag still owns its job;
                    // dispatching it lets the pipeline see it through.
                    Ok(Some(job)) => Arc::clone(&self.pipeline).dispatch(job),
                    Ok(None) => break,
                    Err(err) => {
                        error!(name = %name, error = %err, "claim failed");
                        self.events.emit(MonqueEvent::JobError {
                            error: Arc::new(err),
                            job: None,
                        });
                        break;
                    }
                }
            }
        }
    }
}
