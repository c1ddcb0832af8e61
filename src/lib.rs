//! # Monque
//!
//! A distributed job scheduler that persists all state in one MongoDB
//! collection. Multiple scheduler instances cooperate through the database
//! alone (no broker, no sidecar, no coordinator), and each scheduled
//! execution is performed by exactly one worker, even across process
//! crashes, network partitions, and overlapping polling cycles.
//!
//! ## Architecture
//!
//! ```text
//! Producer.enqueue() / schedule()
//!     │
//!     └─► job document inserted (pending)
//!             │
//!             ▼ change stream (debounced) or poll interval
//!         DispatchLoop
//!             │ atomic claim: pending → processing, stamped with instanceId
//!             ▼
//!         ExecutionPipeline ──► handler
//!             │
//!             ├─ success ─► completed, or pending at the next cron occurrence
//!             └─ failure ─► pending after 2^n backoff, or failed
//!
//! HeartbeatPump ──► lastHeartbeat on every owned job, each interval
//! stale sweep   ──► processing jobs whose lock expired → pending
//! ```
//!
//! ## Guarantees
//!
//! - **Exactly-once claim**: the pending→processing transition is a single
//!   atomic `findAndModify`; two instances can never both win a document.
//! - **Unique-key mutual exclusion**: at most one pending/processing job per
//!   key, enforced by a partial unique index.
//! - **Crash recovery**: jobs whose owner died are returned to `pending` by
//!   any surviving instance's stale sweep.
//! - **Polling is the correctness floor**: change streams only shorten
//!   latency, and the scheduler degrades to polling without them.
//!
//! ## Example
//!
//! ```ignore
//! use monque::{Monque, MonqueConfig, WorkerOptions};
//!
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
//! monque.now("send_email", &email).await?;
//! ```

mod change_stream;
mod dispatch;
mod executor;
mod heartbeat;
mod recovery;

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod mongo;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod testing;


pub use clock::{Clock, SystemClock};
pub use config::MonqueConfig;
pub use error::MonqueError;
pub use events::{EventBus, MonqueEvent};
pub use job::{Job, JobStatus};
pub use mongo::MongoJobStore;
pub use registry::{JobHandler, WorkerOptions, WorkerRegistry};
pub use scheduler::{EnqueueOptions, Monque, ScheduleOptions};
pub use store::{
    BulkOutcome, EnqueueOutcome, JobPage, JobPageQuery, JobSelector, JobStore, PageDirection,
    QueueStats, StatusTransition,
};
