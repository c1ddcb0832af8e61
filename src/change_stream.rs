//! Change-stream subscriber feeding the dispatch loop.
//!
//! Watches the job collection for inserts and status changes and schedules a
//! debounced dispatch wake-up. The subscriber is a latency optimization
//! only: on repeated failure it abandons the stream and the scheduler falls
//! back to interval polling, which remains fully correct.

use std::time::Duration;

use bson::doc;
use futures::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::change_stream::ChangeStream;
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::Collection;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{EventBus, MonqueEvent};
use crate::job::{Job, JobStatus};

/// Burst window: at most one wake-up per 100 ms of events.
const DEBOUNCE: Duration = Duration::from_millis(100);
/// Consecutive failures before abandoning change streams entirely.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;
/// Base delay for reconnect backoff: `2^(attempt-1) * base`.
const RECONNECT_BASE: Duration = Duration::from_millis(1000);

enum PumpEnd {
    Shutdown,
    Closed,
    Error(mongodb::error::Error),
}

pub(crate) struct ChangeStreamSubscriber {
    collection: Collection<Job>,
    wake: mpsc::Sender<()>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl ChangeStreamSubscriber {
    pub(crate) fn new(
        collection: Collection<Job>,
        wake: mpsc::Sender<()>,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            collection,
            wake,
            events,
            shutdown,
        }
    }

    fn pipeline() -> Vec<bson::Document> {
        vec![doc! {
            "$match": {
                "$or": [
                    {"operationType": "insert"},
                    {
                        "operationType": "update",
                        "updateDescription.updatedFields.status": {"$exists": true},
                    },
                ],
            }
        }]
    }

    fn options() -> ChangeStreamOptions {
        ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .build()
    }

    pub(crate) async fn run(self) {
        let mut failures: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            match self
                .collection
                .watch(Self::pipeline(), Self::options())
                .await
            {
                Ok(stream) => {
                    failures = 0;
                    debug!("change stream connected");
                    self.events.emit(MonqueEvent::ChangeStreamConnected);

                    match self.pump(stream).await {
                        PumpEnd::Shutdown => {
                            self.events.emit(MonqueEvent::ChangeStreamClosed);
                            return;
                        }
                        PumpEnd::Closed => {
                            debug!("change stream ended");
                            self.events.emit(MonqueEvent::ChangeStreamClosed);
                        }
                        PumpEnd::Error(err) => {
                            warn!(error = %err, "change stream error");
                            self.events.emit(MonqueEvent::ChangeStreamError {
                                error: err.to_string(),
                            });
                        }
                    }
                }
                Err(err) => {
                    debug!(error = %err, "change stream connect failed");
                }
            }

            failures += 1;
            if failures >= MAX_CONSECUTIVE_FAILURES {
                debug!("change streams unavailable, relying on interval polling");
                self.events.emit(MonqueEvent::ChangeStreamFallback {
                    reason: format!("gave up after {failures} consecutive failures"),
                });
                return;
            }

            let delay = RECONNECT_BASE * 2u32.pow(failures - 1);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Drain the stream, coalescing bursts of relevant events into a single
    /// wake-up. The debounce timer restarts on each event, so a burst yields
    /// one wake-up shortly after it quiets down.
    async fn pump(&self, mut stream: ChangeStream<ChangeStreamEvent<Job>>) -> PumpEnd {
        let mut deadline: Option<tokio::time::Instant> = None;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return PumpEnd::Shutdown,
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    deadline = None;
                    // A wake-up already queued is just as good as this one.
                    let _ = self.wake.try_send(());
                }
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        if is_wake_event(&event) {
                            deadline = Some(tokio::time::Instant::now() + DEBOUNCE);
                        }
                    }
                    Some(Err(err)) => return PumpEnd::Error(err),
                    None => return PumpEnd::Closed,
                },
            }
        }
    }
}

/// Inserts always wake dispatch; updates only when the document landed in
/// `pending` (retries, recurrences, recoveries, operator retries).
fn is_wake_event(event: &ChangeStreamEvent<Job>) -> bool {
    match event.operation_type {
        OperationType::Insert => true,
        OperationType::Update => event
            .full_document
            .as_ref()
            .map(|job| job.status == JobStatus::Pending)
            .unwrap_or(false),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_matches_inserts_and_status_updates() {
        let pipeline = ChangeStreamSubscriber::pipeline();
        assert_eq!(pipeline.len(), 1);
        let stages = pipeline[0]
            .get_document("$match")
            .unwrap()
            .get_array("$or")
            .unwrap();
        assert_eq!(stages.len(), 2);
    }

    #[test]
    fn reconnect_delays_double() {
        let first = RECONNECT_BASE * 2u32.pow(0);
        let second = RECONNECT_BASE * 2u32.pow(1);
        assert_eq!(first, Duration::from_millis(1000));
        assert_eq!(second, Duration::from_millis(2000));
    }
}
