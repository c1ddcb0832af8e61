//! Stale-job recovery.
//!
//! A `processing` job whose `lockedAt` is older than the lock timeout lost
//! its owner: the process died, or the partition outlived the lease. The
//! sweep returns such jobs to `pending` without touching `failCount`, since
//! the job was never observed to fail, its owner disappeared. Staleness is
//! decided by the `lockedAt` rule alone, never by `lastHeartbeat`, so a
//! heartbeat hiccup cannot reclassify a live job.

use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::{to_chrono, Clock};
use crate::config::MonqueConfig;
use crate::error::MonqueError;
use crate::events::{EventBus, MonqueEvent};
use crate::store::JobStore;

/// Reset every stale job to `pending`. Returns how many were reset.
pub(crate) async fn sweep(
    store: &Arc<dyn JobStore>,
    config: &MonqueConfig,
    clock: &Arc<dyn Clock>,
    events: &EventBus,
) -> Result<u64, MonqueError> {
    let now = clock.now();
    let cutoff = now - to_chrono(config.lock_timeout);
    let count = store.recover_stale(cutoff, now).await?;

    if count > 0 {
        info!(count, "recovered stale jobs");
        events.emit(MonqueEvent::StaleRecovered { count });
    } else {
        debug!("no stale jobs found");
    }
    Ok(count)
}
