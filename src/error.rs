//! Structured error types for monque.
//!
//! `MonqueError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Handler errors are the one exception: a worker handler
//! returns `anyhow::Result<()>`, and its error never leaves the execution
//! pipeline; it is materialized into a `job:fail` event and a retry/fail
//! state transition instead.

use bson::oid::ObjectId;
use thiserror::Error;

use crate::job::JobStatus;

/// Structured error type for scheduler operations.
#[derive(Debug, Error)]
pub enum MonqueError {
    /// A cron expression failed to parse, or has no upcoming fire time.
    #[error("invalid cron expression: {expr}")]
    InvalidCron {
        /// The offending expression.
        expr: String,
    },

    /// Database transport failure.
    #[error("database error: {0}")]
    Connection(#[from] mongodb::error::Error),

    /// A job payload could not be encoded to BSON.
    #[error("failed to encode job payload: {0}")]
    Serialization(#[from] bson::ser::Error),

    /// A management operation was attempted against a job whose current
    /// status does not permit it.
    #[error("job {job_id} is {current_status}, cannot {attempted_action}")]
    JobState {
        job_id: ObjectId,
        current_status: JobStatus,
        attempted_action: &'static str,
    },

    /// A pagination cursor was malformed.
    #[error("invalid pagination cursor: {cursor}")]
    InvalidCursor { cursor: String },

    /// The stats aggregation exceeded its server-side deadline.
    #[error("queue stats aggregation timed out")]
    AggregationTimeout,

    /// `register` was called twice for the same worker name without the
    /// replace option.
    #[error("a worker is already registered for {name}")]
    WorkerRegistration { name: String },

    /// The graceful-stop deadline expired with handlers still in flight.
    #[error("shutdown deadline expired with {} jobs still in flight", pending.len())]
    ShutdownTimeout {
        /// Ids of the jobs that were still running when the deadline fired.
        pending: Vec<ObjectId>,
    },

    /// `start` was called before `initialize`.
    #[error("scheduler is not initialized; call initialize() first")]
    NotInitialized,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_cron_carries_expression() {
        let err = MonqueError::InvalidCron {
            expr: "not a cron".to_string(),
        };
        assert!(err.to_string().contains("not a cron"));
    }

    #[test]
    fn job_state_display_names_the_action() {
        let id = ObjectId::new();
        let err = MonqueError::JobState {
            job_id: id,
            current_status: JobStatus::Processing,
            attempted_action: "cancel",
        };
        let msg = err.to_string();
        assert!(msg.contains(&id.to_hex()));
        assert!(msg.contains("processing"));
        assert!(msg.contains("cancel"));
    }

    #[test]
    fn shutdown_timeout_counts_pending() {
        let err = MonqueError::ShutdownTimeout {
            pending: vec![ObjectId::new(), ObjectId::new()],
        };
        assert!(err.to_string().contains("2 jobs"));
    }

    #[test]
    fn errors_are_pattern_matchable() {
        let err = MonqueError::WorkerRegistration {
            name: "send_email".to_string(),
        };
        match err {
            MonqueError::WorkerRegistration { name } => assert_eq!(name, "send_email"),
            other => panic!("unexpected variant: {other}"),
        }
    }
}
