//! MongoDB-backed job store.
//!
//! Every guarded transition is a single `findAndModify`: the status
//! precondition lives in the filter and the mutation in the update, so two
//! racing instances can never both win the same document. Multi-document
//! writes (heartbeat, stale recovery) are plain `updateMany` calls whose
//! per-document filters carry the same guards.

use std::time::Duration;

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    AggregateOptions, FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument,
};
use mongodb::{Collection, IndexModel};
use tracing::debug;

use crate::error::MonqueError;
use crate::job::{Job, JobStatus};
use crate::store::{
    decode_cursor, page_from, EnqueueOutcome, FailureOutcome, JobPage, JobPageQuery, JobSelector,
    JobStore, PageDirection, QueueStats, StatusTransition, SuccessOutcome,
};

/// Server-side deadline for the stats aggregation.
const STATS_MAX_TIME: Duration = Duration::from_secs(10);

/// MongoDB server error code for a duplicate key violation.
const DUPLICATE_KEY: i32 = 11000;
/// MongoDB server error code for `maxTimeMS` expiry.
const MAX_TIME_EXPIRED: i32 = 50;

fn bdt(t: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_chrono(t)
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write)) => write.code == DUPLICATE_KEY,
        ErrorKind::Command(command) => command.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn is_max_time_expired(err: &mongodb::error::Error) -> bool {
    matches!(err.kind.as_ref(), ErrorKind::Command(c) if c.code == MAX_TIME_EXPIRED)
}

fn selector_filter(selector: &JobSelector) -> Document {
    let mut filter = Document::new();
    if let Some(name) = &selector.name {
        filter.insert("name", name.as_str());
    }
    if let Some(status) = selector.status {
        filter.insert("status", status);
    }
    filter
}

/// The fields that mark ownership of a processing job. Cleared together on
/// every transition out of `processing`.
fn clear_ownership() -> Document {
    doc! {
        "lockedAt": "",
        "claimedBy": "",
        "lastHeartbeat": "",
        "heartbeatInterval": "",
    }
}

/// Job store over one MongoDB collection.
#[derive(Clone)]
pub struct MongoJobStore {
    collection: Collection<Job>,
}

impl MongoJobStore {
    pub fn new(collection: Collection<Job>) -> Self {
        Self { collection }
    }

    pub fn collection(&self) -> &Collection<Job> {
        &self.collection
    }

    /// Filter asserting that `instance_id` still owns the document.
    fn owned_filter(id: ObjectId, instance_id: &str) -> Document {
        doc! {
            "_id": id,
            "status": JobStatus::Processing,
            "claimedBy": instance_id,
        }
    }
}

#[async_trait]
impl JobStore for MongoJobStore {
    async fn prepare(&self) -> Result<(), MonqueError> {
        let indexes = vec![
            // Primary dispatch query.
            IndexModel::builder()
                .keys(doc! {"status": 1, "nextRunAt": 1})
                .build(),
            // Atomic-claim query.
            IndexModel::builder()
                .keys(doc! {"status": 1, "nextRunAt": 1, "claimedBy": 1})
                .build(),
            // Heartbeat pump and owner queries.
            IndexModel::builder()
                .keys(doc! {"claimedBy": 1, "status": 1})
                .build(),
            // Stale-recovery sweep.
            IndexModel::builder()
                .keys(doc! {"lockedAt": 1, "lastHeartbeat": 1, "status": 1})
                .build(),
            // Per-name operations.
            IndexModel::builder()
                .keys(doc! {"name": 1, "status": 1})
                .build(),
            // Unique-key mutual exclusion: at most one active document per
            // key, enforced by the server.
            IndexModel::builder()
                .keys(doc! {"uniqueKey": 1})
                .options(
                    IndexOptions::builder()
                        .unique(true)
                        .partial_filter_expression(doc! {
                            "uniqueKey": {"$exists": true},
                            "status": {"$in": ["pending", "processing"]},
                        })
                        .build(),
                )
                .build(),
        ];
        self.collection.create_indexes(indexes, None).await?;
        debug!(collection = %self.collection.name(), "indexes ensured");
        Ok(())
    }

    async fn insert(&self, job: Job) -> Result<EnqueueOutcome, MonqueError> {
        if let Some(key) = job.unique_key.clone() {
            if let Some(existing) = self.find_active_by_unique_key(&key).await? {
                return Ok(EnqueueOutcome::Existing(existing));
            }
            return match self.collection.insert_one(&job, None).await {
                Ok(_) => Ok(EnqueueOutcome::Created(job)),
                // Lost the insert race: the partial unique index rejected
                // us, so an active holder of the key now exists.
                Err(err) if is_duplicate_key(&err) => {
                    match self.find_active_by_unique_key(&key).await? {
                        Some(existing) => Ok(EnqueueOutcome::Existing(existing)),
                        None => Err(MonqueError::Connection(err)),
                    }
                }
                Err(err) => Err(MonqueError::Connection(err)),
            };
        }

        self.collection.insert_one(&job, None).await?;
        Ok(EnqueueOutcome::Created(job))
    }

    async fn find_by_id(&self, id: ObjectId) -> Result<Option<Job>, MonqueError> {
        Ok(self.collection.find_one(doc! {"_id": id}, None).await?)
    }

    async fn find_active_by_unique_key(&self, key: &str) -> Result<Option<Job>, MonqueError> {
        let filter = doc! {
            "uniqueKey": key,
            "status": {"$in": ["pending", "processing"]},
        };
        Ok(self.collection.find_one(filter, None).await?)
    }

    async fn claim(
        &self,
        name: &str,
        now: DateTime<Utc>,
        instance_id: &str,
        heartbeat_interval_ms: i64,
    ) -> Result<Option<Job>, MonqueError> {
        // `claimedBy: null` matches documents where the field is absent as
        // well as explicit nulls.
        let filter = doc! {
            "name": name,
            "status": JobStatus::Pending,
            "nextRunAt": {"$lte": bdt(now)},
            "claimedBy": Bson::Null,
        };
        let update = doc! {
            "$set": {
                "status": JobStatus::Processing,
                "claimedBy": instance_id,
                "lockedAt": bdt(now),
                "lastHeartbeat": bdt(now),
                "heartbeatInterval": heartbeat_interval_ms,
                "updatedAt": bdt(now),
            }
        };
        let options = FindOneAndUpdateOptions::builder()
            .sort(doc! {"nextRunAt": 1, "_id": 1})
            .return_document(ReturnDocument::After)
            .build();
        Ok(self
            .collection
            .find_one_and_update(filter, update, options)
            .await?)
    }

    async fn complete_success(
        &self,
        id: ObjectId,
        instance_id: &str,
        outcome: SuccessOutcome,
    ) -> Result<Option<Job>, MonqueError> {
        let mut set = doc! {
            "failCount": 0,
            "lastRunDuration": outcome.duration_ms,
            "updatedAt": bdt(outcome.now),
        };
        match outcome.next_run_at {
            Some(next) => {
                set.insert("status", JobStatus::Pending);
                set.insert("nextRunAt", bdt(next));
            }
            None => {
                set.insert("status", JobStatus::Completed);
            }
        }
        let mut unset = clear_ownership();
        unset.insert("failReason", "");

        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        Ok(self
            .collection
            .find_one_and_update(
                Self::owned_filter(id, instance_id),
                doc! {"$set": set, "$unset": unset},
                options,
            )
            .await?)
    }

    async fn complete_failure(
        &self,
        id: ObjectId,
        instance_id: &str,
        outcome: FailureOutcome,
    ) -> Result<Option<Job>, MonqueError> {
        let mut set = doc! {
            "failCount": outcome.fail_count as i64,
            "failReason": outcome.reason.as_str(),
            "updatedAt": bdt(outcome.now),
        };
        match outcome.next_run_at {
            Some(next) => {
                set.insert("status", JobStatus::Pending);
                set.insert("nextRunAt", bdt(next));
            }
            None => {
                set.insert("status", JobStatus::Failed);
            }
        }

        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        Ok(self
            .collection
            .find_one_and_update(
                Self::owned_filter(id, instance_id),
                doc! {"$set": set, "$unset": clear_ownership()},
                options,
            )
            .await?)
    }

    async fn heartbeat_owned(
        &self,
        instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, MonqueError> {
        let result = self
            .collection
            .update_many(
                doc! {"claimedBy": instance_id, "status": JobStatus::Processing},
                doc! {"$set": {"lastHeartbeat": bdt(now), "updatedAt": bdt(now)}},
                None,
            )
            .await?;
        Ok(result.modified_count)
    }

    async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, MonqueError> {
        let result = self
            .collection
            .update_many(
                doc! {
                    "status": JobStatus::Processing,
                    "lockedAt": {"$lt": bdt(cutoff)},
                },
                doc! {
                    "$set": {"status": JobStatus::Pending, "updatedAt": bdt(now)},
                    "$unset": clear_ownership(),
                },
                None,
            )
            .await?;
        Ok(result.modified_count)
    }

    async fn cancel_job(
        &self,
        id: ObjectId,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusTransition>, MonqueError> {
        let filter = doc! {
            "_id": id,
            "status": {"$in": [JobStatus::Pending, JobStatus::Cancelled]},
        };
        let update = doc! {
            "$set": {"status": JobStatus::Cancelled, "updatedAt": bdt(now)},
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::Before)
            .build();
        match self
            .collection
            .find_one_and_update(filter, update, options)
            .await?
        {
            Some(previous) => {
                let previous_status = previous.status;
                let mut job = previous;
                job.status = JobStatus::Cancelled;
                job.updated_at = bdt(now);
                Ok(Some(StatusTransition {
                    job,
                    previous_status,
                }))
            }
            None => match self.find_by_id(id).await? {
                None => Ok(None),
                Some(current) => Err(MonqueError::JobState {
                    job_id: id,
                    current_status: current.status,
                    attempted_action: "cancel",
                }),
            },
        }
    }

    async fn retry_job(
        &self,
        id: ObjectId,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusTransition>, MonqueError> {
        let filter = doc! {
            "_id": id,
            "status": {"$in": [JobStatus::Failed, JobStatus::Cancelled]},
        };
        let mut unset = clear_ownership();
        unset.insert("failReason", "");
        let update = doc! {
            "$set": {
                "status": JobStatus::Pending,
                "failCount": 0,
                "nextRunAt": bdt(now),
                "updatedAt": bdt(now),
            },
            "$unset": unset,
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::Before)
            .build();
        match self
            .collection
            .find_one_and_update(filter, update, options)
            .await?
        {
            Some(previous) => {
                let previous_status = previous.status;
                let mut job = previous;
                job.status = JobStatus::Pending;
                job.fail_count = 0;
                job.fail_reason = None;
                job.next_run_at = bdt(now);
                job.locked_at = None;
                job.claimed_by = None;
                job.last_heartbeat = None;
                job.heartbeat_interval = None;
                job.updated_at = bdt(now);
                Ok(Some(StatusTransition {
                    job,
                    previous_status,
                }))
            }
            None => match self.find_by_id(id).await? {
                None => Ok(None),
                Some(current) => Err(MonqueError::JobState {
                    job_id: id,
                    current_status: current.status,
                    attempted_action: "retry",
                }),
            },
        }
    }

    async fn reschedule_job(
        &self,
        id: ObjectId,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, MonqueError> {
        let filter = doc! {"_id": id, "status": JobStatus::Pending};
        let update = doc! {
            "$set": {"nextRunAt": bdt(run_at), "updatedAt": bdt(now)},
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        match self
            .collection
            .find_one_and_update(filter, update, options)
            .await?
        {
            Some(job) => Ok(Some(job)),
            None => match self.find_by_id(id).await? {
                None => Ok(None),
                Some(current) => Err(MonqueError::JobState {
                    job_id: id,
                    current_status: current.status,
                    attempted_action: "reschedule",
                }),
            },
        }
    }

    async fn delete_job(&self, id: ObjectId) -> Result<bool, MonqueError> {
        let result = self.collection.delete_one(doc! {"_id": id}, None).await?;
        Ok(result.deleted_count > 0)
    }

    async fn find_jobs(&self, selector: &JobSelector) -> Result<Vec<Job>, MonqueError> {
        let options = FindOptions::builder().sort(doc! {"_id": 1}).build();
        let cursor = self
            .collection
            .find(selector_filter(selector), options)
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn page_jobs(&self, query: &JobPageQuery) -> Result<JobPage, MonqueError> {
        let mut filter = selector_filter(&query.selector);
        if let Some(cursor) = &query.cursor {
            let anchor = decode_cursor(cursor)?;
            let range = match query.direction {
                PageDirection::Forward => doc! {"$gt": anchor},
                PageDirection::Backward => doc! {"$lt": anchor},
            };
            filter.insert("_id", range);
        }

        let sort = match query.direction {
            PageDirection::Forward => doc! {"_id": 1},
            PageDirection::Backward => doc! {"_id": -1},
        };
        // One extra document tells us whether another page exists.
        let options = FindOptions::builder()
            .sort(sort)
            .limit((query.limit + 1) as i64)
            .build();
        let cursor = self.collection.find(filter, options).await?;
        let mut jobs: Vec<Job> = cursor.try_collect().await?;

        let has_more = jobs.len() > query.limit;
        jobs.truncate(query.limit);
        if query.direction == PageDirection::Backward {
            jobs.reverse();
        }

        Ok(page_from(jobs, has_more, query))
    }

    async fn queue_stats(&self, name: Option<&str>) -> Result<QueueStats, MonqueError> {
        let mut pipeline = Vec::new();
        if let Some(name) = name {
            pipeline.push(doc! {"$match": {"name": name}});
        }
        pipeline.push(doc! {"$group": {
            "_id": "$status",
            "count": {"$sum": 1},
            "avgDuration": {"$avg": "$lastRunDuration"},
        }});

        let options = AggregateOptions::builder().max_time(STATS_MAX_TIME).build();
        let map_err = |err: mongodb::error::Error| {
            if is_max_time_expired(&err) {
                MonqueError::AggregationTimeout
            } else {
                MonqueError::Connection(err)
            }
        };

        let mut cursor = self
            .collection
            .aggregate(pipeline, options)
            .await
            .map_err(map_err)?;

        let mut stats = QueueStats::default();
        while let Some(group) = cursor.try_next().await.map_err(map_err)? {
            let count = group.get("count").map(bson_count).unwrap_or(0);
            match group.get_str("_id") {
                Ok("pending") => stats.pending = count,
                Ok("processing") => stats.processing = count,
                Ok("completed") => {
                    stats.completed = count;
                    stats.mean_run_duration_ms = group.get("avgDuration").and_then(bson_float);
                }
                Ok("failed") => stats.failed = count,
                Ok("cancelled") => stats.cancelled = count,
                _ => {}
            }
        }
        Ok(stats)
    }
}

fn bson_count(value: &Bson) -> u64 {
    match value {
        Bson::Int32(n) => *n as u64,
        Bson::Int64(n) => *n as u64,
        Bson::Double(n) => *n as u64,
        _ => 0,
    }
}

fn bson_float(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(n) => Some(*n),
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        _ => None,
    }
}
