//! Polling worker that drives sync jobs from claim to outcome.
//!
//! One iteration:
//! 1. recover claims left behind by crashed workers
//! 2. claim a batch of due jobs
//! 3. per job: re-fetch under the claim, take the per-target lock, run the
//!    handler, release the lock, record the outcome
//!
//! Nothing a single job does can stop the loop; handler panics are caught
//! at the task boundary and counted as ordinary failures.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::SharedBackend;
use crate::handlers::{FailureClass, HandlerError, HandlerResult, SyncHandlers, SyncReport};
use crate::jobs::{Job, JobId, JobService, JobStore, JobStoreError};
use crate::lock::{DistributedLock, LockOptions};

pub const DEFAULT_LOCK_PREFIX: &str = "loyalty:sync:job";

/// `sync-worker-<8 hex>`.
pub fn generate_worker_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("sync-worker-{}", &id[..8])
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct SyncWorkerConfig {
    /// Claim owner written to `lock_owner`
    pub worker_id: String,
    /// Jobs claimed per iteration
    pub batch_size: usize,
    /// Sleep when a claim comes back empty
    pub poll_interval: Duration,
    /// Per-target lock timing
    pub lock: LockOptions,
    /// Lock names are `<prefix>:<target key>`
    pub lock_prefix: String,
    /// Running claims older than this are recovered
    pub stuck_timeout: Duration,
    pub stuck_recovery_limit: usize,
    /// How often counters are logged
    pub metrics_interval: Duration,
    /// Pause rejected jobs at once instead of backing off
    pub pause_on_rejection: bool,
    /// Longest time one remote call may take, transport retries included
    pub call_budget: Option<Duration>,
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: generate_worker_id(),
            batch_size: 20,
            poll_interval: Duration::from_secs(1),
            lock: LockOptions::default(),
            lock_prefix: DEFAULT_LOCK_PREFIX.to_string(),
            stuck_timeout: Duration::from_secs(120),
            stuck_recovery_limit: 200,
            metrics_interval: Duration::from_secs(60),
            pause_on_rejection: true,
            call_budget: None,
        }
    }
}

impl SyncWorkerConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_lock(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_call_budget(mut self, budget: Duration) -> Self {
        self.call_budget = Some(budget);
        self
    }

    fn lock_name(&self, job: &Job) -> String {
        format!("{}:{}", self.lock_prefix, job.target_key())
    }
}

/// Counters accumulated over the worker's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerMetrics {
    pub iterations: u64,
    pub claimed: u64,
    pub processed: u64,
    pub success: u64,
    pub retried: u64,
    pub rejected: u64,
    pub transient_retried: u64,
    pub lock_busy: u64,
    pub stuck_recovered: u64,
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<WorkerMetrics>>,
}

impl WorkerHandle {
    /// Ask the worker to stop after its current iteration and wait for it.
    ///
    /// Returns the final counters, or `None` if the worker task died.
    pub async fn shutdown(mut self) -> Option<WorkerMetrics> {
        let _ = self.shutdown.send(true);
        match self.join.take() {
            Some(join) => join.await.ok(),
            None => None,
        }
    }
}

/// Sync job worker.
pub struct SyncWorker<S> {
    jobs: JobService<S>,
    handlers: SyncHandlers,
    backend: SharedBackend,
    config: SyncWorkerConfig,
    metrics: WorkerMetrics,
    last_metrics_log: Instant,
}

impl<S> std::fmt::Debug for SyncWorker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncWorker")
            .field("worker_id", &self.config.worker_id)
            .field("backend", &self.backend.kind())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl<S: JobStore + 'static> SyncWorker<S> {
    pub fn new(
        jobs: JobService<S>,
        handlers: SyncHandlers,
        backend: SharedBackend,
        config: SyncWorkerConfig,
    ) -> Self {
        if let Some(budget) = config.call_budget {
            if budget >= config.lock.ttl {
                warn!(
                    worker_id = %config.worker_id,
                    call_budget_ms = budget.as_millis() as u64,
                    lock_ttl_ms = config.lock.ttl.as_millis() as u64,
                    "lock_ttl_below_call_budget"
                );
            }
        }
        if !backend.is_shared() {
            warn!(worker_id = %config.worker_id, "sync_lock_process_local");
        }

        Self {
            jobs,
            handlers,
            backend,
            config,
            metrics: WorkerMetrics::default(),
            last_metrics_log: Instant::now(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn metrics(&self) -> WorkerMetrics {
        self.metrics
    }

    /// Run one iteration. Returns the number of jobs claimed.
    pub async fn run_once(&mut self) -> usize {
        self.metrics.iterations += 1;

        match self
            .jobs
            .recover_stuck_jobs(self.config.stuck_timeout, self.config.stuck_recovery_limit)
            .await
        {
            Ok(recovered) => self.metrics.stuck_recovered += recovered as u64,
            Err(e) => error!(worker_id = %self.config.worker_id, error = %e, "stuck_job_recovery_failed"),
        }

        let batch = match self
            .jobs
            .claim_due_jobs(&self.config.worker_id, self.config.batch_size)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                error!(worker_id = %self.config.worker_id, error = %e, "sync_job_claim_failed");
                return 0;
            }
        };

        let claimed = batch.len();
        self.metrics.claimed += claimed as u64;
        if claimed > 0 {
            debug!(worker_id = %self.config.worker_id, claimed, "sync_jobs_claimed");
        }

        for job in batch {
            self.process_job(job.id).await;
        }
        claimed
    }

    /// Loop until `shutdown` resolves, finishing the current iteration first.
    pub async fn run_until<F>(&mut self, shutdown: F) -> WorkerMetrics
    where
        F: Future<Output = ()>,
    {
        info!(
            worker_id = %self.config.worker_id,
            backend = self.backend.kind(),
            batch_size = self.config.batch_size,
            "sync_worker_started"
        );
        tokio::pin!(shutdown);

        loop {
            let claimed = self.run_once().await;
            self.log_metrics_if_due();

            let pause = if claimed == 0 {
                self.config.poll_interval
            } else {
                Duration::ZERO
            };
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        self.log_metrics();
        info!(worker_id = %self.config.worker_id, "sync_worker_stopped");
        self.metrics
    }

    /// Loop for the lifetime of the process.
    pub async fn run_forever(&mut self) {
        self.run_until(std::future::pending::<()>()).await;
    }

    /// Move the worker onto its own task.
    pub fn spawn(mut self) -> WorkerHandle
    where
        S: Send + Sync,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            self.run_until(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
            })
            .await
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }

    pub fn log_metrics_if_due(&mut self) {
        if self.last_metrics_log.elapsed() >= self.config.metrics_interval {
            self.log_metrics();
        }
    }

    fn log_metrics(&mut self) {
        let m = self.metrics;
        info!(
            worker_id = %self.config.worker_id,
            iterations = m.iterations,
            claimed = m.claimed,
            processed = m.processed,
            success = m.success,
            retried = m.retried,
            rejected = m.rejected,
            transient_retried = m.transient_retried,
            lock_busy = m.lock_busy,
            stuck_recovered = m.stuck_recovered,
            "sync_worker_metrics"
        );
        self.last_metrics_log = Instant::now();
    }

    async fn process_job(&mut self, job_id: JobId) {
        let worker_id = self.config.worker_id.clone();

        let job = match self.jobs.get_claimed_job(job_id, &worker_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, worker_id = %worker_id, "sync_job_claim_lost");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "sync_job_refetch_failed");
                return;
            }
        };

        let mut lock = DistributedLock::new(
            self.backend.clone(),
            self.config.lock_name(&job),
            self.config.lock,
        );
        if !lock.acquire().await {
            self.metrics.lock_busy += 1;
            debug!(job_id = %job_id, target = %job.target_key(), "sync_job_lock_busy");
            let result = self.jobs.requeue_lock_busy(job_id, &worker_id).await;
            self.note_transition(job_id, "requeue_lock_busy", result);
            return;
        }

        let operation = job.operation;
        let outcome = self.run_handler(job).await;
        lock.release().await;
        self.metrics.processed += 1;

        match outcome {
            Ok(report) => {
                self.metrics.success += 1;
                info!(
                    job_id = %job_id,
                    operation = %operation,
                    skipped = report.skipped.unwrap_or(""),
                    created_remote = report.created_remote,
                    card_issued = report.card_issued,
                    "sync_job_succeeded"
                );
                let result = self.jobs.mark_success(job_id, &worker_id).await;
                self.note_transition(job_id, "mark_success", result);
            }
            Err(failure) => self.record_failure(job_id, &worker_id, &failure).await,
        }
    }

    async fn record_failure(&mut self, job_id: JobId, worker_id: &str, failure: &HandlerError) {
        let class = failure.class();
        warn!(job_id = %job_id, class = ?class, error = %failure, "sync_job_failed");

        let message = failure.to_string();
        match class {
            FailureClass::Infrastructure => {
                self.metrics.transient_retried += 1;
                let result = self
                    .jobs
                    .requeue_transient(job_id, worker_id, &message, failure.retry_after())
                    .await;
                self.note_transition(job_id, "requeue_transient", result);
            }
            FailureClass::Rejected if self.config.pause_on_rejection => {
                self.metrics.rejected += 1;
                let result = self.jobs.mark_rejected(job_id, worker_id, &message).await;
                self.note_transition(job_id, "mark_rejected", result);
            }
            FailureClass::Rejected | FailureClass::External => {
                self.metrics.retried += 1;
                let result = self.jobs.mark_retry(job_id, worker_id, &message).await;
                self.note_transition(job_id, "mark_retry", result);
            }
        }
    }

    /// Run the handler on its own task so a panic surfaces as a failure.
    async fn run_handler(&self, job: Job) -> HandlerResult<SyncReport> {
        let handlers = self.handlers.clone();
        let task = tokio::spawn(async move { handlers.execute(&job).await });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(HandlerError::Failed(format!("handler panicked: {e}"))),
            Err(e) => Err(HandlerError::Failed(format!("handler task failed: {e}"))),
        }
    }

    fn note_transition(
        &self,
        job_id: JobId,
        transition: &'static str,
        result: Result<bool, JobStoreError>,
    ) {
        match result {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job_id, transition, worker_id = %self.config.worker_id, "sync_job_claim_lost")
            }
            Err(e) => error!(job_id = %job_id, transition, error = %e, "sync_job_transition_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use loyaltysync_core::{CardIdentity, Customer, Phone, UserId};
    use serde_json::{Map, Value};

    use super::*;
    use crate::clock::ManualClock;
    use crate::customers::InMemoryCustomerStore;
    use crate::external::fake::FakeSyncClient;
    use crate::external::client::LOOKUP_PATH;
    use crate::external::token::TOKEN_PATH;
    use crate::external::transport::testing::ScriptedTransport;
    use crate::external::{
        ApiResponse, CardRef, ClientSettings, FailureStage, LoyaltyClient, Profile, SyncClient,
        SyncClientError, SyncClientResult, TransportError, TransportRetryPolicy,
    };
    use crate::jobs::{InMemoryJobStore, JobStatus, OperationKind, RetryPolicy};

    type Store = Arc<InMemoryJobStore>;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn phone() -> Phone {
        Phone::parse("+998901234567").unwrap()
    }

    fn test_config() -> SyncWorkerConfig {
        SyncWorkerConfig::default()
            .with_worker_id("worker-test")
            .with_poll_interval(Duration::from_millis(10))
            .with_lock(LockOptions {
                ttl: Duration::from_secs(45),
                wait: Duration::from_millis(30),
                retry_interval: Duration::from_millis(5),
            })
    }

    struct Harness {
        worker: SyncWorker<Store>,
        jobs: JobService<Store>,
        store: Store,
        backend: SharedBackend,
        clock: ManualClock,
    }

    impl Harness {
        fn job(&self, id: JobId) -> Job {
            self.store
                .all()
                .unwrap()
                .into_iter()
                .find(|j| j.id == id)
                .unwrap()
        }
    }

    fn harness_with(
        client: Arc<dyn SyncClient>,
        policy: RetryPolicy,
        config: SyncWorkerConfig,
    ) -> Harness {
        let clock = ManualClock::new(t0());
        let store = InMemoryJobStore::arc();
        let jobs = JobService::new(store.clone())
            .with_policy(policy)
            .with_clock(Arc::new(clock.clone()));

        let customers = InMemoryCustomerStore::arc();
        customers
            .insert(Customer::new(UserId::new(42), phone()).with_name("Aziz"))
            .unwrap();

        let backend = SharedBackend::local();
        let handlers = SyncHandlers::new(client, customers.clone());
        let worker = SyncWorker::new(jobs.clone(), handlers, backend.clone(), config);

        Harness {
            worker,
            jobs,
            store,
            backend,
            clock,
        }
    }

    fn harness() -> (Harness, Arc<FakeSyncClient>) {
        let client = Arc::new(FakeSyncClient::new());
        let h = harness_with(client.clone(), RetryPolicy::default(), test_config());
        (h, client)
    }

    async fn enqueue_sync(h: &Harness, create_if_missing: bool) -> JobId {
        h.jobs
            .enqueue_user_sync(UserId::new(42), phone(), create_if_missing, "test")
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn missing_remote_customer_is_created_and_job_succeeds() {
        let (mut h, client) = harness();
        let id = enqueue_sync(&h, true).await;
        assert_eq!(h.job(id).status, JobStatus::Pending);

        assert_eq!(h.worker.run_once().await, 1);

        let job = h.job(id);
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.attempt_count, 1);
        assert!(job.lock_owner.is_none());
        assert!(client.calls().contains(&"create_or_update:+998901234567".to_string()));

        let m = h.worker.metrics();
        assert_eq!((m.claimed, m.processed, m.success), (1, 1, 1));
    }

    #[tokio::test]
    async fn different_operations_get_separate_rows_and_repeats_merge() {
        let (mut h, _client) = harness();
        let sync = enqueue_sync(&h, true).await;
        let flush = h
            .jobs
            .enqueue_profile_sync(UserId::new(42), phone(), "test")
            .await
            .unwrap()
            .id;
        assert_ne!(sync, flush);
        assert_eq!(enqueue_sync(&h, true).await, sync);
        assert_eq!(h.store.all().unwrap().len(), 2);

        assert_eq!(h.worker.run_once().await, 2);
        assert_eq!(h.job(sync).status, JobStatus::Success);
        assert_eq!(h.job(flush).status, JobStatus::Success);
    }

    #[tokio::test]
    async fn ambiguous_create_failure_spends_one_attempt_with_base_backoff() {
        let (mut h, client) = harness();
        client.fail_next(
            "create_or_update",
            TransportError::new(FailureStage::Read, "operation timed out").into(),
        );
        let id = enqueue_sync(&h, true).await;

        h.worker.run_once().await;

        let job = h.job(id);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.next_retry_at, t0() + chrono::Duration::seconds(15));
        assert!(job.last_error.unwrap().contains("timed out"));
        assert_eq!(h.worker.metrics().retried, 1);
    }

    #[tokio::test]
    async fn connect_failures_retried_in_transport_spend_one_attempt() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Ok(ApiResponse::new(200, r#"{"token":"t-1"}"#)),
            Err(TransportError::new(FailureStage::Connect, "connection refused")),
            Err(TransportError::new(FailureStage::Connect, "connection refused")),
            Ok(ApiResponse::new(
                200,
                r#"{
                    "id": "c-1",
                    "name": "Aziz",
                    "walletBalances": [{"id": "w-1", "type": 1, "balance": 1250.5}],
                    "cards": [{"id": "rc-1", "number": "8600000000000001", "track": "001"}]
                }"#,
            )),
        ]));
        let mut settings = ClientSettings::new("http://loyalty.test", "login", "org-1");
        settings.retry = TransportRetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
        };
        let client = LoyaltyClient::new(Arc::clone(&transport), &settings, SharedBackend::local());
        let mut h = harness_with(Arc::new(client), RetryPolicy::default(), test_config());
        let id = enqueue_sync(&h, false).await;

        assert_eq!(h.worker.run_once().await, 1);

        let job = h.job(id);
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.attempt_count, 1);
        assert!(job.last_error.is_none());
        let lookups = vec![LOOKUP_PATH.to_string(); 3];
        assert_eq!(transport.paths()[0], TOKEN_PATH);
        assert_eq!(transport.paths()[1..], lookups[..]);

        let m = h.worker.metrics();
        assert_eq!((m.success, m.retried, m.transient_retried), (1, 0, 0));
    }

    #[tokio::test]
    async fn exhausted_job_pauses_until_enqueued_again() {
        let client = Arc::new(FakeSyncClient::new());
        let policy = RetryPolicy::exponential(3, Duration::from_secs(15), Duration::from_secs(60));
        let mut h = harness_with(client, policy, test_config());
        let id = enqueue_sync(&h, false).await;

        for expected in 1..=3 {
            assert_eq!(h.worker.run_once().await, 1);
            assert_eq!(h.job(id).attempt_count, expected);
            h.clock.advance(Duration::from_secs(120));
        }

        let paused = h.job(id);
        assert_eq!(paused.status, JobStatus::Paused);
        assert_eq!(paused.last_error.as_deref(), Some("remote_customer_not_found"));
        assert_eq!(h.worker.run_once().await, 0);

        assert_eq!(enqueue_sync(&h, false).await, id);
        let reopened = h.job(id);
        assert_eq!(reopened.status, JobStatus::Pending);
        assert_eq!(reopened.attempt_count, 0);
    }

    #[tokio::test]
    async fn busy_target_lock_requeues_without_penalty() {
        let (mut h, client) = harness();
        let id = enqueue_sync(&h, true).await;

        let mut held = DistributedLock::new(
            h.backend.clone(),
            "loyalty:sync:job:user:42",
            LockOptions::default(),
        );
        assert!(held.acquire().await);

        h.worker.run_once().await;
        held.release().await;

        let job = h.job(id);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.last_error.as_deref(), Some("user_lock_busy"));
        assert_eq!(job.next_retry_at, t0() + chrono::Duration::seconds(2));
        assert!(client.calls().is_empty());
        assert_eq!(h.worker.metrics().lock_busy, 1);
        assert_eq!(h.worker.metrics().processed, 0);
    }

    #[tokio::test]
    async fn token_refresh_in_progress_is_requeued_without_penalty() {
        let (mut h, client) = harness();
        client
            .fail_next("lookup", SyncClientError::TokenRefreshInProgress);
        let id = enqueue_sync(&h, true).await;

        h.worker.run_once().await;

        let job = h.job(id);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.next_retry_at, t0() + chrono::Duration::seconds(2));
        assert_eq!(h.worker.metrics().transient_retried, 1);
    }

    #[tokio::test]
    async fn rejection_pauses_or_backs_off_per_config() {
        let rejected = || SyncClientError::Rejected {
            status: 400,
            body: "bad phone".into(),
        };

        let (mut h, client) = harness();
        client.fail_next("create_or_update", rejected());
        let id = enqueue_sync(&h, true).await;
        h.worker.run_once().await;
        assert_eq!(h.job(id).status, JobStatus::Paused);
        assert_eq!(h.worker.metrics().rejected, 1);

        let client = Arc::new(FakeSyncClient::new());
        let config = SyncWorkerConfig {
            pause_on_rejection: false,
            ..test_config()
        };
        let mut h = harness_with(client.clone(), RetryPolicy::default(), config);
        client.fail_next("create_or_update", rejected());
        let id = enqueue_sync(&h, true).await;
        h.worker.run_once().await;
        assert_eq!(h.job(id).status, JobStatus::Failed);
        assert_eq!(h.job(id).attempt_count, 1);
    }

    struct PanickingClient;

    #[async_trait]
    impl SyncClient for PanickingClient {
        async fn lookup(&self, _phone: &Phone) -> SyncClientResult<Option<Profile>> {
            panic!("lookup exploded");
        }

        async fn create_or_update(
            &self,
            _phone: &Phone,
            _fields: Map<String, Value>,
        ) -> SyncClientResult<Profile> {
            unreachable!()
        }

        async fn issue_card(&self, _id: &str, _card: &CardIdentity) -> SyncClientResult<CardRef> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn handler_panic_counts_as_failed_attempt() {
        let mut h = harness_with(Arc::new(PanickingClient), RetryPolicy::default(), test_config());
        let id = enqueue_sync(&h, true).await;

        assert_eq!(h.worker.run_once().await, 1);

        let job = h.job(id);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);
        assert!(job.last_error.unwrap().contains("panicked"));

        // The target lock was released despite the panic.
        let mut lock = DistributedLock::new(
            h.backend.clone(),
            "loyalty:sync:job:user:42",
            LockOptions::default(),
        );
        assert!(lock.acquire().await);
        lock.release().await;
    }

    #[tokio::test]
    async fn stale_claim_is_recovered_and_processed() {
        let (mut h, _client) = harness();
        let target = crate::jobs::SyncTarget::user(UserId::new(42)).with_phone(phone());
        let payload = crate::jobs::SyncOperation::SyncUser(crate::jobs::SyncUserPayload {
            create_if_missing: true,
            source: None,
        })
        .to_payload()
        .unwrap();
        let mut job = Job::new(OperationKind::SyncUser, &target, payload, 8, t0());
        job.mark_running("crashed-worker", t0() - chrono::Duration::minutes(10));
        let id = job.id;
        h.store.insert(job).unwrap();

        assert_eq!(h.worker.run_once().await, 1);

        assert_eq!(h.job(id).status, JobStatus::Success);
        assert_eq!(h.worker.metrics().stuck_recovered, 1);
    }

    #[tokio::test]
    async fn spawned_worker_stops_on_shutdown() {
        let (h, _client) = harness();
        let id = enqueue_sync(&h, true).await;
        let store = h.store.clone();

        let handle = h.worker.spawn();
        for _ in 0..200 {
            let done = store
                .all()
                .unwrap()
                .iter()
                .any(|j| j.id == id && j.status == JobStatus::Success);
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let metrics = handle.shutdown().await.unwrap();
        assert_eq!(metrics.success, 1);
        assert!(metrics.iterations >= 1);
    }

    #[test]
    fn generated_worker_ids_are_short_and_unique() {
        let a = generate_worker_id();
        let b = generate_worker_id();
        assert!(a.starts_with("sync-worker-"));
        assert_eq!(a.len(), "sync-worker-".len() + 8);
        assert_ne!(a, b);
    }
}
