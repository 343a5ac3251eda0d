//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::types::{Job, JobId, JobStatus, OperationKind, SyncTarget};

/// A transition applied to a job while its claim is held.
pub type Transition<'a> = &'a (dyn Fn(&mut Job) + Send + Sync);

/// Request to enqueue (or merge into) an active job.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub operation: OperationKind,
    pub target: SyncTarget,
    pub payload: Map<String, Value>,
    pub max_attempts: u32,
}

/// Job store abstraction.
///
/// Every method is atomic with respect to concurrent callers, including
/// callers in other processes for durable implementations.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Merge into the active job for `(operation, target)` or insert a new one.
    async fn enqueue(&self, request: EnqueueRequest, now: DateTime<Utc>)
    -> Result<Job, JobStoreError>;

    /// Claim up to `limit` due jobs for `worker_id`, ordered by
    /// `(next_retry_at, id)`. Rows claimed concurrently are skipped.
    async fn claim_due(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Fetch a job only if it is still running under `worker_id`'s claim.
    async fn get_claimed(&self, job_id: JobId, worker_id: &str)
    -> Result<Option<Job>, JobStoreError>;

    /// Apply `transition` to a job still claimed by `worker_id`.
    ///
    /// Returns `None` when the claim was lost (recovered, or never held).
    async fn update_claimed(
        &self,
        job_id: JobId,
        worker_id: &str,
        transition: Transition<'_>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Reset running jobs whose claim is older than `cutoff` back to pending.
    async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, JobStoreError>;

    /// Get job statistics.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("concurrent enqueue conflict for {0}")]
    Conflict(String),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub failed: usize,
    pub success: usize,
    pub paused: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Success => self.success += count,
            JobStatus::Paused => self.paused += count,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.failed + self.success + self.paused
    }
}

/// In-memory job store for tests/dev.
///
/// A single mutex makes every operation atomic, which gives the same
/// guarantees as the row-locking Postgres store within one process.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Overwrite a row directly. Test setup only.
    pub fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        self.lock()?.insert(job.id, job);
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs: Vec<Job> = self.lock()?.values().cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .lock()
            .map_err(|_| JobStoreError::Storage("job store mutex poisoned".into()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(
        &self,
        request: EnqueueRequest,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.lock()?;
        let key = request.target.key();

        let existing = jobs
            .values_mut()
            .filter(|j| {
                j.operation == request.operation && j.status.is_active() && j.target_key() == key
            })
            .max_by_key(|j| j.id);

        if let Some(job) = existing {
            job.reopen(request.payload, request.max_attempts, now);
            return Ok(job.clone());
        }

        let job = Job::new(
            request.operation,
            &request.target,
            request.payload,
            request.max_attempts,
            now,
        );
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_due(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let mut jobs = self.lock()?;

        let mut due: Vec<(DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.is_due(now))
            .map(|j| (j.next_retry_at, j.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = jobs.get_mut(&id) {
                job.mark_running(worker_id, now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock()?.get(&job_id).cloned())
    }

    async fn get_claimed(
        &self,
        job_id: JobId,
        worker_id: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        Ok(self
            .lock()?
            .get(&job_id)
            .filter(|j| j.is_claimed_by(worker_id))
            .cloned())
    }

    async fn update_claimed(
        &self,
        job_id: JobId,
        worker_id: &str,
        transition: Transition<'_>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.lock()?;
        match jobs.get_mut(&job_id) {
            Some(job) if job.is_claimed_by(worker_id) => {
                transition(job);
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let mut jobs = self.lock()?;

        let mut stale: Vec<(DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .filter_map(|j| j.locked_at.filter(|at| *at <= cutoff).map(|at| (at, j.id)))
            .collect();
        stale.sort();
        stale.truncate(limit);

        let mut recovered = Vec::with_capacity(stale.len());
        for (_, id) in stale {
            if let Some(job) = jobs.get_mut(&id) {
                job.recover(now);
                recovered.push(id);
            }
        }
        Ok(recovered)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.lock()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn enqueue(
        &self,
        request: EnqueueRequest,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        (**self).enqueue(request, now).await
    }

    async fn claim_due(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).claim_due(worker_id, limit, now).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn get_claimed(
        &self,
        job_id: JobId,
        worker_id: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).get_claimed(job_id, worker_id).await
    }

    async fn update_claimed(
        &self,
        job_id: JobId,
        worker_id: &str,
        transition: Transition<'_>,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self).update_claimed(job_id, worker_id, transition).await
    }

    async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, JobStoreError> {
        (**self).recover_stale(cutoff, limit, now).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}
