//! Core job types and policies.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use loyaltysync_core::{DomainError, Phone, UserId};

/// Default retry budget for a freshly enqueued job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;
/// First retry delay; doubles on every further attempt.
pub const BASE_BACKOFF: Duration = Duration::from_secs(15);
/// Upper bound for the retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30 * 60);
/// Delay applied when the per-target lock is held by someone else.
pub const LOCK_BUSY_DELAY: Duration = Duration::from_secs(2);
pub const LOCK_BUSY_REASON: &str = "user_lock_busy";
/// Default delay for penalty-free requeues.
pub const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const MIN_TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(100);
/// `last_error` is truncated to this many characters.
pub const MAX_ERROR_CHARS: usize = 2000;
/// `last_error` written by stuck-job recovery.
pub const STUCK_RECOVERY_MARKER: &str = "stuck_job_recovered";

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by exactly one worker
    Running,
    /// Last attempt failed, waiting for `next_retry_at`
    Failed,
    /// Completed; reopened only by a new enqueue
    Success,
    /// Attempt budget exhausted (or rejected); reopened only by a new enqueue
    Paused,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Failed,
        JobStatus::Success,
        JobStatus::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::Success => "success",
            JobStatus::Paused => "paused",
        }
    }

    /// Statuses an enqueue merges into instead of inserting a new row.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Failed | JobStatus::Paused
        )
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Paused)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Closed set of synchronization operations, as stored in the job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    SyncUser,
    FlushProfile,
    MarkDeleted,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::SyncUser => "sync_user",
            OperationKind::FlushProfile => "flush_profile",
            OperationKind::MarkDeleted => "mark_deleted",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync_user" => Ok(OperationKind::SyncUser),
            "flush_profile" => Ok(OperationKind::FlushProfile),
            "mark_deleted" => Ok(OperationKind::MarkDeleted),
            other => Err(DomainError::validation(format!(
                "unknown sync operation: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncUserPayload {
    /// Create the remote customer when the lookup finds nothing.
    #[serde(default)]
    pub create_if_missing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushProfilePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkDeletedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Body sent to the remote create/update endpoint.
    #[serde(default)]
    pub remote_payload: Map<String, Value>,
}

/// A synchronization operation together with its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOperation {
    SyncUser(SyncUserPayload),
    FlushProfile(FlushProfilePayload),
    MarkDeleted(MarkDeletedPayload),
}

impl SyncOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            SyncOperation::SyncUser(_) => OperationKind::SyncUser,
            SyncOperation::FlushProfile(_) => OperationKind::FlushProfile,
            SyncOperation::MarkDeleted(_) => OperationKind::MarkDeleted,
        }
    }

    /// Serialize the payload into the JSON object stored on the row.
    pub fn to_payload(&self) -> Result<Map<String, Value>, serde_json::Error> {
        let value = match self {
            SyncOperation::SyncUser(p) => serde_json::to_value(p)?,
            SyncOperation::FlushProfile(p) => serde_json::to_value(p)?,
            SyncOperation::MarkDeleted(p) => serde_json::to_value(p)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    /// Decode a stored row back into a typed operation.
    pub fn decode(kind: OperationKind, payload: &Value) -> Result<Self, serde_json::Error> {
        let payload = payload.clone();
        Ok(match kind {
            OperationKind::SyncUser => SyncOperation::SyncUser(serde_json::from_value(payload)?),
            OperationKind::FlushProfile => {
                SyncOperation::FlushProfile(serde_json::from_value(payload)?)
            }
            OperationKind::MarkDeleted => {
                SyncOperation::MarkDeleted(serde_json::from_value(payload)?)
            }
        })
    }
}

/// The entity a job synchronizes: a local user, a bare phone, or both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncTarget {
    user_id: Option<UserId>,
    phone: Option<Phone>,
}

impl SyncTarget {
    pub fn new(user_id: Option<UserId>, phone: Option<Phone>) -> Result<Self, DomainError> {
        if user_id.is_none() && phone.is_none() {
            return Err(DomainError::validation(
                "sync target requires user_id or phone",
            ));
        }
        Ok(Self { user_id, phone })
    }

    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            phone: None,
        }
    }

    pub fn phone(phone: Phone) -> Self {
        Self {
            user_id: None,
            phone: Some(phone),
        }
    }

    pub fn with_phone(mut self, phone: Phone) -> Self {
        self.phone = Some(phone);
        self
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn phone_number(&self) -> Option<&Phone> {
        self.phone.as_ref()
    }

    /// Identity used for de-duplication and for the per-target lock.
    ///
    /// A user id wins over the phone: two jobs for the same user collapse
    /// even if they were enqueued with different phones.
    pub fn key(&self) -> String {
        match (&self.user_id, &self.phone) {
            (Some(id), _) => format!("user:{id}"),
            (None, Some(phone)) => format!("phone:{phone}"),
            (None, None) => "unknown".to_string(),
        }
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Exponential retry policy for queue-level retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempt budget given to newly enqueued jobs
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: BASE_BACKOFF,
            max_delay: MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// `min(max_delay, base_delay * 2^(attempt - 1))` for a 1-indexed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32, max_attempts: u32) -> bool {
        attempt < max_attempts
    }
}

/// A synchronization job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: Option<UserId>,
    pub phone: Option<Phone>,
    pub operation: OperationKind,
    pub status: JobStatus,
    /// JSON object with the operation parameters
    pub payload: Value,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job, due immediately.
    pub fn new(
        operation: OperationKind,
        target: &SyncTarget,
        payload: Map<String, Value>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            user_id: target.user_id,
            phone: target.phone.clone(),
            operation,
            status: JobStatus::Pending,
            payload: Value::Object(payload),
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            next_retry_at: now,
            last_attempt_at: None,
            completed_at: None,
            lock_owner: None,
            locked_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn target(&self) -> SyncTarget {
        SyncTarget {
            user_id: self.user_id,
            phone: self.phone.clone(),
        }
    }

    pub fn target_key(&self) -> String {
        self.target().key()
    }

    /// Decode the typed operation carried by this row.
    pub fn decode_operation(&self) -> Result<SyncOperation, serde_json::Error> {
        SyncOperation::decode(self.operation, &self.payload)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable()
            && self.next_retry_at <= now
            && self.attempt_count < self.max_attempts
    }

    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Running && self.lock_owner.as_deref() == Some(worker_id)
    }

    /// Merge a new enqueue into this active row and make it due now.
    pub fn reopen(&mut self, incoming: Map<String, Value>, max_attempts: u32, now: DateTime<Utc>) {
        let mut merged = match std::mem::take(&mut self.payload) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        merged.extend(incoming);
        self.payload = Value::Object(merged);
        self.status = JobStatus::Pending;
        self.attempt_count = 0;
        self.max_attempts = max_attempts.max(1);
        self.next_retry_at = now;
        self.last_attempt_at = None;
        self.completed_at = None;
        self.lock_owner = None;
        self.locked_at = None;
        self.last_error = None;
        self.updated_at = now;
    }

    pub fn mark_running(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.lock_owner = Some(worker_id.to_string());
        self.locked_at = Some(now);
        self.last_attempt_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.attempt_count = (self.attempt_count + 1).min(self.max_attempts);
        self.status = JobStatus::Success;
        self.completed_at = Some(now);
        self.last_error = None;
        self.release_claim(now);
    }

    /// Count a failed attempt: schedule a retry or pause when exhausted.
    pub fn mark_failed(&mut self, error: &str, policy: &RetryPolicy, now: DateTime<Utc>) {
        self.attempt_count = (self.attempt_count + 1).min(self.max_attempts);
        self.last_error = Some(truncate_error(error));

        if policy.should_retry(self.attempt_count, self.max_attempts) {
            let delay = policy.delay_for_attempt(self.attempt_count);
            self.status = JobStatus::Failed;
            self.next_retry_at = now + to_chrono(delay);
        } else {
            self.status = JobStatus::Paused;
        }
        self.release_claim(now);
    }

    /// Count the attempt and pause immediately; retrying cannot help.
    pub fn mark_rejected(&mut self, error: &str, now: DateTime<Utc>) {
        self.attempt_count = (self.attempt_count + 1).min(self.max_attempts);
        self.last_error = Some(truncate_error(error));
        self.status = JobStatus::Paused;
        self.release_claim(now);
    }

    /// Return to pending without touching the attempt count.
    pub fn requeue(&mut self, reason: &str, delay: Duration, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.next_retry_at = now + to_chrono(delay);
        self.last_error = Some(truncate_error(reason));
        self.release_claim(now);
    }

    /// Reset a stale running claim.
    pub fn recover(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.next_retry_at = now;
        self.last_error = Some(STUCK_RECOVERY_MARKER.to_string());
        self.release_claim(now);
    }

    fn release_claim(&mut self, now: DateTime<Utc>) {
        self.lock_owner = None;
        self.locked_at = None;
        self.updated_at = now;
    }
}

/// Truncate an error message to [`MAX_ERROR_CHARS`] characters.
pub fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(MAX_ERROR_CHARS) {
        Some((cut, _)) => error[..cut].to_string(),
        None => error.to_string(),
    }
}

pub(crate) fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(3650))
}
