//! The job service: the only component that reads or writes job rows.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use loyaltysync_core::{Phone, UserId};

use super::store::{EnqueueRequest, JobStats, JobStore, JobStoreError};
use super::types::{
    FlushProfilePayload, Job, JobId, JobStatus, LOCK_BUSY_DELAY, LOCK_BUSY_REASON,
    MIN_TRANSIENT_RETRY_DELAY, MarkDeletedPayload, RetryPolicy, SyncOperation, SyncTarget,
    SyncUserPayload, TRANSIENT_RETRY_DELAY, to_chrono,
};
use crate::clock::{Clock, SystemClock};

/// Queue operations over a [`JobStore`].
///
/// Outcome methods return `Ok(false)` when the caller no longer owns the
/// running claim (for example after stuck-job recovery handed it out again).
#[derive(Debug, Clone)]
pub struct JobService<S> {
    store: S,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore> JobService<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            policy: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Enqueue an operation for `target`, merging into an active job if any.
    ///
    /// Never fails: enqueue is advisory, so storage problems are logged and
    /// reported as `None`.
    pub async fn enqueue(&self, operation: SyncOperation, target: SyncTarget) -> Option<Job> {
        let kind = operation.kind();
        let payload = match operation.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                error!(operation = %kind, target = %target, error = %e, "sync_job_enqueue_failed");
                return None;
            }
        };

        let request = EnqueueRequest {
            operation: kind,
            target,
            payload,
            max_attempts: self.policy.max_attempts.max(1),
        };
        let target_key = request.target.key();

        match self.store.enqueue(request, self.clock.now()).await {
            Ok(job) => {
                debug!(job_id = %job.id, operation = %kind, target = %target_key, "sync_job_enqueued");
                Some(job)
            }
            Err(e) => {
                error!(operation = %kind, target = %target_key, error = %e, "sync_job_enqueue_failed");
                None
            }
        }
    }

    pub async fn enqueue_user_sync(
        &self,
        user_id: UserId,
        phone: Phone,
        create_if_missing: bool,
        source: &str,
    ) -> Option<Job> {
        let operation = SyncOperation::SyncUser(SyncUserPayload {
            create_if_missing,
            source: Some(source.to_string()),
        });
        self.enqueue(operation, SyncTarget::user(user_id).with_phone(phone))
            .await
    }

    pub async fn enqueue_profile_sync(
        &self,
        user_id: UserId,
        phone: Phone,
        source: &str,
    ) -> Option<Job> {
        let operation = SyncOperation::FlushProfile(FlushProfilePayload {
            source: Some(source.to_string()),
        });
        self.enqueue(operation, SyncTarget::user(user_id).with_phone(phone))
            .await
    }

    /// Enqueue the remote "mark deleted" update for a customer.
    pub async fn enqueue_delete_sync(
        &self,
        user_id: Option<UserId>,
        phone: Phone,
        customer_id: Option<&str>,
        full_name: Option<&str>,
        source: &str,
    ) -> Option<Job> {
        let mut remote_payload = Map::new();
        remote_payload.insert("isDeleted".into(), Value::Bool(true));
        remote_payload.insert("name".into(), json!(full_name.unwrap_or_default()));
        remote_payload.insert("phone".into(), json!(phone.as_str()));
        if let Some(id) = customer_id.filter(|id| !id.is_empty()) {
            remote_payload.insert("id".into(), json!(id));
        }

        let operation = SyncOperation::MarkDeleted(MarkDeletedPayload {
            source: Some(source.to_string()),
            remote_payload,
        });
        let target = match user_id {
            Some(id) => SyncTarget::user(id).with_phone(phone),
            None => SyncTarget::phone(phone),
        };
        self.enqueue(operation, target).await
    }

    /// Claim a batch of due jobs for `worker_id`.
    pub async fn claim_due_jobs(
        &self,
        worker_id: &str,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.claim_due(worker_id, limit, self.clock.now()).await
    }

    /// Re-fetch a job, but only while `worker_id` still owns its claim.
    pub async fn get_claimed_job(
        &self,
        job_id: JobId,
        worker_id: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        self.store.get_claimed(job_id, worker_id).await
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.store.get(job_id).await
    }

    pub async fn mark_success(&self, job_id: JobId, worker_id: &str) -> Result<bool, JobStoreError> {
        let now = self.clock.now();
        let updated = self
            .store
            .update_claimed(job_id, worker_id, &|job: &mut Job| job.mark_completed(now))
            .await?;
        Ok(updated.is_some())
    }

    /// Count a failed attempt and schedule a backoff retry, or pause the job
    /// once its attempt budget is exhausted.
    pub async fn mark_retry(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<bool, JobStoreError> {
        let now = self.clock.now();
        let policy = self.policy;
        let updated = self
            .store
            .update_claimed(job_id, worker_id, &|job: &mut Job| {
                job.mark_failed(error, &policy, now)
            })
            .await?;

        match updated {
            Some(job) if job.status == JobStatus::Paused => {
                warn!(
                    job_id = %job.id,
                    operation = %job.operation,
                    target = %job.target_key(),
                    attempts = job.attempt_count,
                    "sync_job_paused"
                );
                Ok(true)
            }
            Some(job) => {
                info!(
                    job_id = %job.id,
                    attempt = job.attempt_count,
                    next_retry_at = %job.next_retry_at,
                    "sync_job_retry_scheduled"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pause immediately: the remote side rejected the request as malformed.
    pub async fn mark_rejected(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<bool, JobStoreError> {
        let now = self.clock.now();
        let updated = self
            .store
            .update_claimed(job_id, worker_id, &|job: &mut Job| job.mark_rejected(error, now))
            .await?;

        if let Some(job) = &updated {
            warn!(
                job_id = %job.id,
                operation = %job.operation,
                target = %job.target_key(),
                "sync_job_paused_rejected"
            );
        }
        Ok(updated.is_some())
    }

    /// Return a job to pending without spending an attempt.
    ///
    /// `delay` defaults to one second and is never shorter than 100ms.
    pub async fn requeue_transient(
        &self,
        job_id: JobId,
        worker_id: &str,
        reason: &str,
        delay: Option<Duration>,
    ) -> Result<bool, JobStoreError> {
        let delay = delay
            .unwrap_or(TRANSIENT_RETRY_DELAY)
            .max(MIN_TRANSIENT_RETRY_DELAY);
        let now = self.clock.now();
        let updated = self
            .store
            .update_claimed(job_id, worker_id, &|job: &mut Job| {
                job.requeue(reason, delay, now)
            })
            .await?;

        if updated.is_some() {
            debug!(job_id = %job_id, reason, retry_in_ms = delay.as_millis() as u64, "sync_job_requeued");
        }
        Ok(updated.is_some())
    }

    /// Requeue after losing the per-target lock race.
    pub async fn requeue_lock_busy(
        &self,
        job_id: JobId,
        worker_id: &str,
    ) -> Result<bool, JobStoreError> {
        self.requeue_transient(job_id, worker_id, LOCK_BUSY_REASON, Some(LOCK_BUSY_DELAY))
            .await
    }

    /// Reset jobs whose running claim is older than `stale_after`.
    ///
    /// Returns the number of recovered jobs.
    pub async fn recover_stuck_jobs(
        &self,
        stale_after: Duration,
        limit: usize,
    ) -> Result<usize, JobStoreError> {
        if limit == 0 {
            return Ok(0);
        }
        let now = self.clock.now();
        let cutoff = now - to_chrono(stale_after);
        let recovered = self.store.recover_stale(cutoff, limit, now).await?;

        if !recovered.is_empty() {
            warn!(count = recovered.len(), "stuck_jobs_recovered");
        }
        Ok(recovered.len())
    }

    pub async fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.store.stats().await
    }
}
