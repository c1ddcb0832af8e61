//! Job document model.
//!
//! A job is one document in the shared collection. Field names on the wire
//! are camelCase; ownership fields (`claimedBy`, `lockedAt`, `lastHeartbeat`,
//! `heartbeatInterval`) are present exactly while the job is `processing`.

use anyhow::{anyhow, Result};
use bson::oid::ObjectId;
use bson::{Bson, DateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a job document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses are never picked up by the dispatch loop again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Active statuses participate in unique-key mutual exclusion.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<JobStatus> for Bson {
    fn from(status: JobStatus) -> Self {
        Bson::String(status.as_str().to_string())
    }
}

fn bson_null() -> Bson {
    Bson::Null
}

/// One unit of deferred work.
///
/// The payload in `data` is opaque to the scheduler and preserved
/// byte-for-byte across the lifecycle; typed handlers decode it at the
/// boundary with [`Job::data_as`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Assigned on insert; immutable.
    #[serde(rename = "_id")]
    pub id: ObjectId,
    /// Worker selector; must match a registered handler to be executed.
    pub name: String,
    /// Handler-defined payload.
    #[serde(default = "bson_null")]
    pub data: Bson,
    pub status: JobStatus,
    /// Earliest instant this job is eligible to run.
    pub next_run_at: DateTime,
    /// Instant at which the current owner claimed the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime>,
    /// Stable identifier of the owning scheduler instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    /// Most recent liveness stamp from the owner. Monitoring aid only; the
    /// staleness predicate is `lockedAt + lockTimeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime>,
    /// Interval in milliseconds the owner promises between heartbeats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<i64>,
    /// Consecutive failed attempts since the last success.
    pub fail_count: u32,
    /// Last error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    /// Cron expression; presence makes the job recurring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<String>,
    /// Deduplication handle. At most one pending/processing document exists
    /// per key, enforced by a partial unique index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    /// Wall time of the last successful run, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_duration: Option<i64>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl Job {
    /// Build a new pending job eligible at `next_run_at`.
    pub(crate) fn new(
        name: impl Into<String>,
        data: Bson,
        next_run_at: chrono::DateTime<chrono::Utc>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            id: ObjectId::new(),
            name: name.into(),
            data,
            status: JobStatus::Pending,
            next_run_at: DateTime::from_chrono(next_run_at),
            locked_at: None,
            claimed_by: None,
            last_heartbeat: None,
            heartbeat_interval: None,
            fail_count: 0,
            fail_reason: None,
            repeat_interval: None,
            unique_key: None,
            last_run_duration: None,
            created_at: DateTime::from_chrono(now),
            updated_at: DateTime::from_chrono(now),
        }
    }

    pub(crate) fn with_unique_key(mut self, key: Option<String>) -> Self {
        self.unique_key = key;
        self
    }

    pub(crate) fn with_repeat_interval(mut self, expr: impl Into<String>) -> Self {
        self.repeat_interval = Some(expr.into());
        self
    }

    /// Whether this job re-enters `pending` after each successful run.
    pub fn is_recurring(&self) -> bool {
        self.repeat_interval.is_some()
    }

    /// Decode the opaque payload into a typed value.
    ///
    /// Ill-typed payloads are the handler's responsibility to reject; the
    /// scheduler never interprets `data`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_bson(self.data.clone())
            .map_err(|e| anyhow!("failed to decode payload for job {}: {}", self.id, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use chrono::Utc;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(bson::to_bson(&JobStatus::Pending).unwrap(), Bson::String("pending".into()));
        assert_eq!(Bson::from(JobStatus::Processing), Bson::String("processing".into()));
    }

    #[test]
    fn status_classification() {
        assert!(JobStatus::Pending.is_active());
        assert!(JobStatus::Processing.is_active());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn document_uses_camel_case_wire_names() {
        let now = Utc::now();
        let job = Job::new("send_email", Bson::Null, now, now);
        let doc = bson::to_document(&job).unwrap();
        assert!(doc.contains_key("_id"));
        assert!(doc.contains_key("nextRunAt"));
        assert!(doc.contains_key("failCount"));
        assert!(doc.contains_key("createdAt"));
        assert!(doc.contains_key("updatedAt"));
        // Absent ownership fields are omitted entirely, not stored as null.
        assert!(!doc.contains_key("claimedBy"));
        assert!(!doc.contains_key("lockedAt"));
        assert!(!doc.contains_key("lastHeartbeat"));
    }

    #[test]
    fn new_job_starts_pending_and_unclaimed() {
        let now = Utc::now();
        let job = Job::new("send_email", Bson::Null, now, now);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.fail_count, 0);
        assert!(job.claimed_by.is_none());
        assert!(!job.is_recurring());
    }

    #[test]
    fn data_round_trips_through_bson() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Payload {
            to: String,
            retries: i32,
        }

        let payload = Payload {
            to: "a@b".to_string(),
            retries: 2,
        };
        let now = Utc::now();
        let job = Job::new("send_email", bson::to_bson(&payload).unwrap(), now, now);
        let decoded: Payload = job.data_as().unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn data_decode_rejects_mismatched_shape() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Payload {
            to: String,
        }

        let now = Utc::now();
        let job = Job::new("send_email", Bson::Document(doc! {"other": 1}), now, now);
        assert!(job.data_as::<Payload>().is_err());
    }

    #[test]
    fn document_round_trips() {
        let now = Utc::now();
        let job = Job::new("send_email", Bson::Document(doc! {"to": "a@b"}), now, now)
            .with_unique_key(Some("K".to_string()));
        let doc = bson::to_document(&job).unwrap();
        let back: Job = bson::from_document(doc).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.unique_key.as_deref(), Some("K"));
        assert_eq!(back.status, JobStatus::Pending);
    }
}
