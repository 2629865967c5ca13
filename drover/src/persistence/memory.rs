use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::dead_letter::{DeadLetterFilter, DeadLetterId, DeadLetterJob};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobError, JobFilter, JobId, JobStatus};
use crate::store::{DeadLetterStore, JobStore, QueueSnapshot, StuckRelease};

/// Process-local store for tests and single-process embedding.
///
/// Every operation runs inside one mutex critical section, which gives the
/// claim and lock-owner checks the same atomicity a database's conditional
/// update does.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    jobs: Arc<Mutex<JobTable>>,
    dead_letters: Arc<Mutex<HashMap<DeadLetterId, DeadLetterJob>>>,
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, Job>,
    /// idempotency key -> owning job
    keys: HashMap<String, JobId>,
}

impl JobTable {
    fn locked_by_mut(&mut self, id: JobId, worker_id: &str) -> Option<&mut Job> {
        self.jobs
            .get_mut(&id)
            .filter(|job| job.is_locked_by(worker_id))
    }

    fn release_key(&mut self, job: &mut Job) {
        if let Some(key) = job.idempotency_key.take() {
            if self.keys.get(&key) == Some(&job.id) {
                self.keys.remove(&key);
            }
        }
    }
}

fn clear_lock(job: &mut Job) {
    job.lock_owner = None;
    job.locked_at = None;
    job.last_heartbeat_at = None;
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of job documents, in any state.
    pub fn job_count(&self) -> usize {
        self.jobs.lock().jobs.len()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert(&self, job: Job) -> QueueResult<Job> {
        let mut table = self.jobs.lock();

        if let Some(key) = &job.idempotency_key {
            if table.keys.contains_key(key) {
                return Err(QueueError::Conflict {
                    job_type: job.job_type.clone(),
                    idempotency_key: key.clone(),
                });
            }
            table.keys.insert(key.clone(), job.id);
        }
        table.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find(&self, id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.jobs.lock().jobs.get(&id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        let table = self.jobs.lock();
        let mut jobs: Vec<Job> = table
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.0.cmp(&a.id.0))
        });
        jobs.truncate(filter.effective_limit());
        Ok(jobs)
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let mut table = self.jobs.lock();

        let next = table
            .jobs
            .values()
            .filter(|job| job.is_claimable(now))
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.available_at.cmp(&b.available_at))
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.0.cmp(&b.id.0))
            })
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = table.jobs.get_mut(&id) else {
            return Ok(None);
        };

        job.status = JobStatus::Processing;
        job.lock_owner = Some(worker_id.to_string());
        job.locked_at = Some(now);
        job.last_heartbeat_at = Some(now);
        job.started_at.get_or_insert(now);
        job.attempts += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn heartbeat(
        &self,
        id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let mut table = self.jobs.lock();
        let Some(job) = table.locked_by_mut(id, worker_id) else {
            return Ok(false);
        };
        job.locked_at = Some(now);
        job.last_heartbeat_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn mark_succeeded(
        &self,
        id: JobId,
        worker_id: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let mut table = self.jobs.lock();
        let Some(job) = table.locked_by_mut(id, worker_id) else {
            return Ok(false);
        };
        job.status = JobStatus::Succeeded;
        job.result = Some(result);
        job.error = None;
        job.finished_at = Some(now);
        job.updated_at = now;
        clear_lock(job);
        Ok(true)
    }

    async fn mark_retry(
        &self,
        id: JobId,
        worker_id: &str,
        error: JobError,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let mut table = self.jobs.lock();
        let Some(job) = table.locked_by_mut(id, worker_id) else {
            return Ok(false);
        };
        job.status = JobStatus::Queued;
        job.error = Some(error);
        job.available_at = available_at;
        job.updated_at = now;
        clear_lock(job);
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: JobId,
        worker_id: &str,
        error: JobError,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        let mut table = self.jobs.lock();
        let Some(mut job) = table.locked_by_mut(id, worker_id).map(|job| job.clone()) else {
            return Ok(None);
        };
        job.status = JobStatus::Failed;
        job.error = Some(error);
        job.finished_at = Some(now);
        job.updated_at = now;
        clear_lock(&mut job);
        table.release_key(&mut job);
        table.jobs.insert(id, job.clone());
        Ok(Some(job))
    }

    async fn release_stuck(&self, now: DateTime<Utc>) -> QueueResult<StuckRelease> {
        let mut table = self.jobs.lock();
        let expired: Vec<JobId> = table
            .jobs
            .values()
            .filter(|job| job.lock_expired(now))
            .map(|job| job.id)
            .collect();

        let mut release = StuckRelease::default();
        for id in expired {
            let Some(mut job) = table.jobs.get(&id).cloned() else {
                continue;
            };
            if job.has_attempts_remaining() {
                job.status = JobStatus::Queued;
                release.requeued += 1;
            } else {
                job.status = JobStatus::Failed;
                job.error = Some(JobError::visibility_timeout(job.lock_owner.as_deref()));
                job.finished_at = Some(now);
                table.release_key(&mut job);
            }
            clear_lock(&mut job);
            job.updated_at = now;
            if job.status == JobStatus::Failed {
                release.exhausted.push(job.clone());
            }
            table.jobs.insert(id, job);
        }
        Ok(release)
    }

    async fn snapshot(&self, now: DateTime<Utc>) -> QueueResult<QueueSnapshot> {
        let table = self.jobs.lock();
        let mut snapshot = QueueSnapshot::new(now);
        for job in table.jobs.values() {
            snapshot.entry_mut(&job.job_type).add(job.status, 1);
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryStore {
    async fn insert_dead_letter(&self, record: DeadLetterJob) -> QueueResult<DeadLetterJob> {
        self.dead_letters.lock().insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_dead_letter(&self, id: DeadLetterId) -> QueueResult<Option<DeadLetterJob>> {
        Ok(self.dead_letters.lock().get(&id).cloned())
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> QueueResult<Vec<DeadLetterJob>> {
        let records = self.dead_letters.lock();
        let mut matching: Vec<DeadLetterJob> = records
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.moved_to_dlq_at
                .cmp(&a.moved_to_dlq_at)
                .then_with(|| b.id.0.cmp(&a.id.0))
        });
        Ok(matching
            .into_iter()
            .skip(filter.effective_offset())
            .take(filter.effective_limit())
            .collect())
    }

    async fn increment_retry_count(
        &self,
        id: DeadLetterId,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<DeadLetterJob>> {
        let mut records = self.dead_letters.lock();
        Ok(records.get_mut(&id).map(|record| {
            record.retry_count += 1;
            record.last_retried_at = Some(now);
            record.clone()
        }))
    }

    async fn delete_dead_letter(&self, id: DeadLetterId) -> QueueResult<bool> {
        Ok(self.dead_letters.lock().remove(&id).is_some())
    }

    async fn delete_dead_letters_before(&self, cutoff: DateTime<Utc>) -> QueueResult<u64> {
        let mut records = self.dead_letters.lock();
        let before = records.len();
        records.retain(|_, record| record.moved_to_dlq_at >= cutoff);
        Ok((before - records.len()) as u64)
    }

    async fn count_dead_letters(&self) -> QueueResult<u64> {
        Ok(self.dead_letters.lock().len() as u64)
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("jobs", &self.jobs.lock().jobs.len())
            .field("dead_letters", &self.dead_letters.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobPriority;
    use chrono::Duration;
    use serde_json::json;

    fn job(job_type: &str, now: DateTime<Utc>) -> Job {
        Job {
            visibility_timeout_ms: 1000,
            ..Job::queued(job_type, json!({}), now)
        }
    }

    fn error() -> JobError {
        JobError::new(JobError::HANDLER_ERROR, "failed", "boom")
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_availability() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let low = store
            .insert(Job {
                priority: JobPriority::LOW,
                ..job("x", now - Duration::seconds(10))
            })
            .await
            .unwrap();
        let later = store.insert(job("x", now - Duration::seconds(1))).await.unwrap();
        let earlier = store.insert(job("x", now - Duration::seconds(5))).await.unwrap();
        let high = store
            .insert(Job {
                priority: JobPriority::HIGH,
                ..job("x", now)
            })
            .await
            .unwrap();

        let order: Vec<JobId> = [
            store.claim_next("w", now).await.unwrap().unwrap().id,
            store.claim_next("w", now).await.unwrap().unwrap().id,
            store.claim_next("w", now).await.unwrap().unwrap().id,
            store.claim_next("w", now).await.unwrap().unwrap().id,
        ]
        .into();
        assert_eq!(order, vec![high.id, earlier.id, later.id, low.id]);
        assert!(store.claim_next("w", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_skips_future_jobs() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.insert(job("x", now + Duration::seconds(30))).await.unwrap();

        assert!(store.claim_next("w", now).await.unwrap().is_none());
        assert!(
            store
                .claim_next("w", now + Duration::seconds(31))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_claim_stamps_lock_and_attempts() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.insert(job("x", now)).await.unwrap();

        let claimed = store.claim_next("w1", now).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Processing);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.lock_owner.as_deref(), Some("w1"));
        assert_eq!(claimed.locked_at, Some(now));
        assert_eq!(claimed.started_at, Some(now));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_claims_are_exclusive() {
        let store = InMemoryStore::new();
        store.insert(job("x", Utc::now())).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_next(&format!("w{i}"), Utc::now()).await.unwrap()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn test_lock_owner_guards_updates() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let inserted = store.insert(job("x", now)).await.unwrap();
        store.claim_next("w1", now).await.unwrap().unwrap();

        assert!(!store.heartbeat(inserted.id, "w2", now).await.unwrap());
        assert!(
            !store
                .mark_succeeded(inserted.id, "w2", json!(1), now)
                .await
                .unwrap()
        );
        assert!(store.mark_failed(inserted.id, "w2", error(), now).await.unwrap().is_none());

        assert!(store.heartbeat(inserted.id, "w1", now).await.unwrap());
        assert!(
            store
                .mark_succeeded(inserted.id, "w1", json!(1), now)
                .await
                .unwrap()
        );
        let done = store.find(inserted.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.result, Some(json!(1)));
        assert!(done.lock_owner.is_none());
    }

    #[tokio::test]
    async fn test_retry_requeues_with_delay() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let inserted = store.insert(job("x", now)).await.unwrap();
        store.claim_next("w1", now).await.unwrap().unwrap();

        let later = now + Duration::seconds(5);
        assert!(
            store
                .mark_retry(inserted.id, "w1", error(), later, now)
                .await
                .unwrap()
        );

        let job = store.find(inserted.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.available_at, later);
        assert_eq!(job.error, Some(error()));
        assert!(store.claim_next("w1", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_releases_idempotency_key() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let first = Job {
            idempotency_key: Some("k".into()),
            ..job("x", now)
        };
        store.insert(first.clone()).await.unwrap();

        let duplicate = Job {
            idempotency_key: Some("k".into()),
            ..job("x", now)
        };
        assert!(matches!(
            store.insert(duplicate.clone()).await,
            Err(QueueError::Conflict { .. })
        ));
        assert_eq!(store.job_count(), 1);

        store.claim_next("w1", now).await.unwrap().unwrap();
        let failed = store.mark_failed(first.id, "w1", error(), now).await.unwrap().unwrap();
        assert!(failed.idempotency_key.is_none());

        store.insert(duplicate).await.unwrap();
        assert_eq!(store.job_count(), 2);
    }

    #[tokio::test]
    async fn test_release_stuck_requeues_and_exhausts() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let retryable = store.insert(job("x", now)).await.unwrap();
        let last_chance = store
            .insert(Job {
                max_attempts: 1,
                ..job("y", now)
            })
            .await
            .unwrap();
        store.claim_next("w1", now).await.unwrap().unwrap();
        store.claim_next("w1", now).await.unwrap().unwrap();

        let nothing = store.release_stuck(now).await.unwrap();
        assert!(nothing.is_empty());

        let release = store
            .release_stuck(now + Duration::milliseconds(1500))
            .await
            .unwrap();
        assert_eq!(release.requeued, 1);
        assert_eq!(release.exhausted.len(), 1);
        assert_eq!(release.exhausted[0].id, last_chance.id);

        let requeued = store.find(retryable.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert!(requeued.lock_owner.is_none());

        let failed = store.find(last_chance.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(
            failed.error.map(|e| e.code),
            Some(JobError::VISIBILITY_TIMEOUT.to_string())
        );
    }

    #[tokio::test]
    async fn test_release_stuck_ignores_unrepresentable_deadline() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let held = store
            .insert(Job {
                visibility_timeout_ms: u64::MAX,
                ..job("x", now)
            })
            .await
            .unwrap();
        store.claim_next("w1", now).await.unwrap().unwrap();

        let release = store.release_stuck(now + Duration::days(3650)).await.unwrap();
        assert!(release.is_empty());
        assert_eq!(release.requeued, 0);

        let still_held = store.find(held.id).await.unwrap().unwrap();
        assert_eq!(still_held.status, JobStatus::Processing);
        assert_eq!(still_held.lock_owner.as_deref(), Some("w1"));
    }
}
