// libs/appointment-cell/src/services/outbox.rs
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::models::{BillKind, NotificationEvent};
use crate::services::clock::Clock;
use crate::services::collaborators::{BillingGateway, CollaboratorError, NotificationGateway};

const ENTRY_KEY_PREFIX: &str = "appointment_outbox:entry";
const DUE_KEY: &str = "appointment_outbox:due";
const DEDUP_KEY_PREFIX: &str = "appointment_outbox:dedup";
const PARKED_KEY: &str = "appointment_outbox:parked";

/// How long a dedup key blocks repeats of its effect: 7 days.
const DEDUP_RETENTION_SECS: i64 = 604_800;

const INITIAL_BACKOFF_SECS: i64 = 1;
const MAX_BACKOFF_SECS: i64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Redis connection error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis pool error: {0}")]
    Pool(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A call owed to billing or notification after a committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SideEffect {
    Bill { kind: BillKind, percent: u8 },
    Notify { event: NotificationEvent },
}

impl SideEffect {
    fn tag(&self) -> String {
        match self {
            SideEffect::Bill { kind, .. } => format!("bill:{}", kind),
            SideEffect::Notify { event } => format!("notify:{}", event),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub appointment_id: Uuid,
    pub effect: SideEffect,
    /// Sent to the collaborator as the idempotency key and used to drop duplicate enqueues.
    pub dedup_key: String,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub parked: bool,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    /// New entry. The background poller only picks it up one backoff step after `now`,
    /// leaving the first attempt to the request that committed it.
    pub fn new(appointment_id: Uuid, effect: SideEffect, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            appointment_id,
            dedup_key: format!("{}:{}", appointment_id, effect.tag()),
            effect,
            attempts: 0,
            next_attempt_at: now + backoff(0),
            last_error: None,
            parked: false,
            created_at: now,
        }
    }

    /// Distinguish repeatable effects, such as the nth reschedule notification.
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.dedup_key = format!("{}:{}", self.dedup_key, sequence);
        self
    }
}

/// Delay before the retry that follows `attempts` failures.
pub fn backoff(attempts: u32) -> Duration {
    let factor = 1_i64.checked_shl(attempts.min(16)).unwrap_or(i64::MAX);
    Duration::seconds(INITIAL_BACKOFF_SECS.saturating_mul(factor).min(MAX_BACKOFF_SECS))
}

#[async_trait]
pub trait Outbox: Send + Sync {
    /// Store `entry` unless one with the same dedup key was enqueued within the retention window.
    /// Returns whether it was stored.
    async fn enqueue(&self, entry: OutboxEntry) -> Result<bool, OutboxError>;

    /// Unparked entries whose `next_attempt_at` is at or before `now`, oldest first.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError>;

    async fn mark_delivered(&self, entry_id: Uuid) -> Result<(), OutboxError>;

    /// Persist a failed attempt: bumped attempts, new `next_attempt_at`, possibly parked.
    async fn mark_failed(&self, entry: OutboxEntry) -> Result<(), OutboxError>;

    /// Entries still waiting for delivery, parked ones excluded.
    async fn pending_count(&self) -> Result<usize, OutboxError>;
}

// ==============================================================================
// IN-MEMORY OUTBOX
// ==============================================================================

#[derive(Default)]
struct InMemoryOutboxInner {
    entries: HashMap<Uuid, OutboxEntry>,
    /// Dedup key to the time it was first enqueued.
    seen: HashMap<String, DateTime<Utc>>,
}

impl InMemoryOutboxInner {
    /// Forget dedup keys older than the retention window, unless their entry is still pending.
    fn expire_seen(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(DEDUP_RETENTION_SECS);
        let pending: HashSet<&str> = self.entries.values().map(|entry| entry.dedup_key.as_str()).collect();
        self.seen
            .retain(|key, enqueued_at| *enqueued_at > cutoff || pending.contains(key.as_str()));
    }
}

/// Process-local outbox. Pending effects are lost on restart.
#[derive(Default)]
pub struct InMemoryOutbox {
    inner: RwLock<InMemoryOutboxInner>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<OutboxEntry> {
        let mut entries: Vec<OutboxEntry> = self.inner.read().await.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.created_at);
        entries
    }
}

#[async_trait]
impl Outbox for InMemoryOutbox {
    async fn enqueue(&self, entry: OutboxEntry) -> Result<bool, OutboxError> {
        let mut inner = self.inner.write().await;
        inner.expire_seen(entry.created_at);

        if inner.seen.contains_key(&entry.dedup_key) {
            debug!("Side effect {} already enqueued", entry.dedup_key);
            return Ok(false);
        }
        inner.seen.insert(entry.dedup_key.clone(), entry.created_at);
        inner.entries.insert(entry.id, entry);
        Ok(true)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        let inner = self.inner.read().await;
        let mut due: Vec<OutboxEntry> = inner
            .entries
            .values()
            .filter(|entry| !entry.parked && entry.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|entry| entry.next_attempt_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_delivered(&self, entry_id: Uuid) -> Result<(), OutboxError> {
        self.inner.write().await.entries.remove(&entry_id);
        Ok(())
    }

    async fn mark_failed(&self, entry: OutboxEntry) -> Result<(), OutboxError> {
        let mut inner = self.inner.write().await;
        // Already delivered by a concurrent attempt.
        if inner.entries.contains_key(&entry.id) {
            inner.entries.insert(entry.id, entry);
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize, OutboxError> {
        Ok(self.inner.read().await.entries.values().filter(|entry| !entry.parked).count())
    }
}

// ==============================================================================
// REDIS OUTBOX
// ==============================================================================

// KEYS: dedup key, entry hash, due set. ARGV: entry id, entry json, due score, dedup ttl.
const ENQUEUE_SCRIPT: &str = r#"
if not redis.call('SET', KEYS[1], ARGV[1], 'NX', 'EX', ARGV[4]) then
  return 0
end
redis.call('HSET', KEYS[2], 'data', ARGV[2])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return 1
"#;

/// Durable outbox: a hash per entry, a sorted set of entry ids scored by due time,
/// and one expiring key per dedup key.
pub struct RedisOutbox {
    pool: Pool,
}

impl RedisOutbox {
    pub async fn new(redis_url: &str) -> Result<Self, OutboxError> {
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| OutboxError::Pool(format!("Failed to create Redis pool: {}", e)))?;

        let outbox = Self { pool };
        let mut conn = outbox.get_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Redis outbox initialized");

        Ok(outbox)
    }

    async fn get_connection(&self) -> Result<Connection, OutboxError> {
        self.pool
            .get()
            .await
            .map_err(|e| OutboxError::Pool(format!("Failed to get Redis connection: {}", e)))
    }

    fn entry_key(entry_id: Uuid) -> String {
        format!("{}:{}", ENTRY_KEY_PREFIX, entry_id)
    }

    fn dedup_key(dedup_key: &str) -> String {
        format!("{}:{}", DEDUP_KEY_PREFIX, dedup_key)
    }

    async fn store_entry(conn: &mut Connection, entry: &OutboxEntry) -> Result<(), OutboxError> {
        let data = serde_json::to_string(entry)?;
        let _: () = conn.hset(Self::entry_key(entry.id), "data", data).await?;
        Ok(())
    }
}

#[async_trait]
impl Outbox for RedisOutbox {
    async fn enqueue(&self, entry: OutboxEntry) -> Result<bool, OutboxError> {
        let mut conn = self.get_connection().await?;
        let data = serde_json::to_string(&entry)?;

        // One script, so a dedup key is never recorded without its entry.
        let added: i64 = redis::Script::new(ENQUEUE_SCRIPT)
            .key(Self::dedup_key(&entry.dedup_key))
            .key(Self::entry_key(entry.id))
            .key(DUE_KEY)
            .arg(entry.id.to_string())
            .arg(data)
            .arg(entry.next_attempt_at.timestamp_millis())
            .arg(DEDUP_RETENTION_SECS)
            .invoke_async(&mut conn)
            .await?;

        if added == 0 {
            debug!("Side effect {} already enqueued", entry.dedup_key);
            return Ok(false);
        }

        debug!("Side effect {} enqueued as {}", entry.dedup_key, entry.id);
        Ok(true)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEntry>, OutboxError> {
        let mut conn = self.get_connection().await?;

        let count = isize::try_from(limit).unwrap_or(isize::MAX);
        let ids: Vec<String> = conn
            .zrangebyscore_limit(DUE_KEY, "-inf", now.timestamp_millis(), 0, count)
            .await?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let data: Option<String> = conn.hget(format!("{}:{}", ENTRY_KEY_PREFIX, id), "data").await?;
            match data {
                Some(data) => entries.push(serde_json::from_str(&data)?),
                None => {
                    warn!("Outbox entry {} missing its data, dropping", id);
                    let _: () = conn.zrem(DUE_KEY, &id).await?;
                }
            }
        }

        Ok(entries)
    }

    async fn mark_delivered(&self, entry_id: Uuid) -> Result<(), OutboxError> {
        let mut conn = self.get_connection().await?;
        let _: () = conn.zrem(DUE_KEY, entry_id.to_string()).await?;
        let _: () = conn.del(Self::entry_key(entry_id)).await?;
        Ok(())
    }

    async fn mark_failed(&self, entry: OutboxEntry) -> Result<(), OutboxError> {
        let mut conn = self.get_connection().await?;

        let exists: bool = conn.exists(Self::entry_key(entry.id)).await?;
        if !exists {
            return Ok(());
        }

        Self::store_entry(&mut conn, &entry).await?;
        if entry.parked {
            let _: () = conn.zrem(DUE_KEY, entry.id.to_string()).await?;
            let _: () = conn.sadd(PARKED_KEY, entry.id.to_string()).await?;
        } else {
            let _: () = conn
                .zadd(DUE_KEY, entry.id.to_string(), entry.next_attempt_at.timestamp_millis())
                .await?;
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize, OutboxError> {
        let mut conn = self.get_connection().await?;
        let count: usize = conn.zcard(DUE_KEY).await?;
        Ok(count)
    }
}

// ==============================================================================
// DISPATCHER
// ==============================================================================

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_attempts: u32,
    pub call_timeout: StdDuration,
    pub batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            call_timeout: StdDuration::from_secs(3),
            batch_size: 50,
        }
    }
}

/// Delivers outbox entries to billing and notification, retrying with exponential backoff.
///
/// Failures never touch appointment state. An entry that keeps failing is parked after
/// `max_attempts` and left for an operator.
///
/// Entries the outbox refused to record are held in memory instead. `drain_due` offers
/// them back to the outbox and delivers them directly while it keeps refusing.
pub struct SideEffectDispatcher {
    outbox: Arc<dyn Outbox>,
    billing: Arc<dyn BillingGateway>,
    notifications: Arc<dyn NotificationGateway>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    stranded: Mutex<Vec<OutboxEntry>>,
}

impl SideEffectDispatcher {
    pub fn new(
        outbox: Arc<dyn Outbox>,
        billing: Arc<dyn BillingGateway>,
        notifications: Arc<dyn NotificationGateway>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            outbox,
            billing,
            notifications,
            clock,
            config,
            stranded: Mutex::new(Vec::new()),
        }
    }

    /// Unrecorded entries still waiting for delivery, parked ones included.
    pub async fn stranded_count(&self) -> usize {
        self.stranded.lock().await.len()
    }

    async fn perform(&self, entry: &OutboxEntry) -> Result<(), CollaboratorError> {
        let call = async {
            match &entry.effect {
                SideEffect::Bill { kind, percent } => {
                    let bill_id = self
                        .billing
                        .create_bill(entry.appointment_id, *kind, *percent, &entry.dedup_key)
                        .await?;
                    info!("Bill {} created for appointment {}", bill_id, entry.appointment_id);
                    Ok::<(), CollaboratorError>(())
                }
                SideEffect::Notify { event } => {
                    self.notifications
                        .notify(entry.appointment_id, *event, &entry.dedup_key)
                        .await
                }
            }
        };

        let service = match entry.effect {
            SideEffect::Bill { .. } => "billing",
            SideEffect::Notify { .. } => "notification",
        };

        tokio::time::timeout(self.config.call_timeout, call)
            .await
            .unwrap_or(Err(CollaboratorError::Timeout { service }))
    }

    fn record_failure(&self, entry: &mut OutboxEntry, error: &CollaboratorError) {
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());

        if entry.attempts >= self.config.max_attempts {
            entry.parked = true;
            error!(
                "Side effect for appointment {} failed {} times, parking: {}",
                entry.appointment_id, entry.attempts, error
            );
        } else {
            entry.next_attempt_at = self.clock.now() + backoff(entry.attempts);
            warn!(
                "Side effect attempt {} failed, retrying at {}: {}",
                entry.attempts, entry.next_attempt_at, error
            );
        }
    }

    /// One delivery attempt. Returns whether the entry was delivered.
    #[instrument(skip(self, entry), fields(entry_id = %entry.id, dedup_key = %entry.dedup_key))]
    pub async fn deliver(&self, mut entry: OutboxEntry) -> bool {
        match self.perform(&entry).await {
            Ok(()) => {
                if let Err(e) = self.outbox.mark_delivered(entry.id).await {
                    error!("Delivered side effect but could not clear it from the outbox: {}", e);
                }
                debug!("Side effect delivered");
                true
            }
            Err(e) => {
                self.record_failure(&mut entry, &e);
                if let Err(e) = self.outbox.mark_failed(entry).await {
                    error!("Could not record failed side effect attempt: {}", e);
                }
                false
            }
        }
    }

    /// Delivery attempt for an entry the outbox could not record. On failure the entry
    /// is kept in memory and retried by `drain_due`.
    #[instrument(skip(self, entry), fields(entry_id = %entry.id, dedup_key = %entry.dedup_key))]
    pub async fn deliver_unrecorded(&self, mut entry: OutboxEntry) -> bool {
        match self.perform(&entry).await {
            Ok(()) => {
                debug!("Unrecorded side effect delivered");
                true
            }
            Err(e) => {
                self.record_failure(&mut entry, &e);
                self.stranded.lock().await.push(entry);
                false
            }
        }
    }

    async fn retry_stranded(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<OutboxEntry> = {
            let mut stranded = self.stranded.lock().await;
            let (due, waiting): (Vec<OutboxEntry>, Vec<OutboxEntry>) = stranded
                .drain(..)
                .partition(|entry| !entry.parked && entry.next_attempt_at <= now);
            *stranded = waiting;
            due
        };

        let mut delivered = 0;
        for entry in due {
            match self.outbox.enqueue(entry.clone()).await {
                Ok(_) => debug!("Side effect {} recorded in the outbox after all", entry.dedup_key),
                Err(e) => {
                    warn!("Outbox still refusing side effect {}: {}", entry.dedup_key, e);
                    if self.deliver_unrecorded(entry).await {
                        delivered += 1;
                    }
                }
            }
        }
        delivered
    }

    /// Attempt every due entry once. Returns how many were delivered.
    pub async fn drain_due(&self) -> Result<usize, OutboxError> {
        let mut delivered = self.retry_stranded().await;

        let due = self.outbox.due(self.clock.now(), self.config.batch_size).await?;
        if due.is_empty() {
            return Ok(delivered);
        }

        debug!("Dispatching {} due side effects", due.len());
        for entry in due {
            if self.deliver(entry).await {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, poll_interval: StdDuration, mut shutdown: watch::Receiver<bool>) {
        info!("Side-effect dispatcher started, polling every {:?}", poll_interval);
        let mut ticker = tokio::time::interval(poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_due().await {
                        error!("Failed to read due side effects: {}", e);
                    }
                }
                _ = async { let _ = shutdown.wait_for(|stopped| *stopped).await; } => break,
            }
        }

        info!("Side-effect dispatcher stopped");
    }
}
