//! Heartbeat pump: one liveness update per tick for every owned job.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::events::{EventBus, MonqueEvent};
use crate::store::JobStore;

pub(crate) struct HeartbeatPump {
    store: Arc<dyn JobStore>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    interval: Duration,
    instance_id: String,
    shutdown: CancellationToken,
}

impl HeartbeatPump {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        interval: Duration,
        instance_id: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            interval,
            instance_id,
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The interval fires immediately on creation; a heartbeat before any
        // job is claimed would be a no-op.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let now = self.clock.now();
                    match self.store.heartbeat_owned(&self.instance_id, now).await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "heartbeat refreshed"),
                        Err(err) => {
                            warn!(error = %err, "heartbeat failed");
                            self.events.emit(MonqueEvent::JobError {
                                error: Arc::new(err),
                                job: None,
                            });
                        }
                    }
                }
            }
        }
    }
}
