//! Transactions: receipts for asynchronous writes.
//!
//! The store is a bounded id→transaction map guarded by a single mutex, with
//! a background sweeper that evicts terminal entries past their TTL. Status
//! transitions are monotonic; anything outside the allowed table is rejected.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{SdkError, SdkResult};

/// Status of a write transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Created, not yet admitted to the write queue.
    #[default]
    Unknown,
    /// Queued, waiting for a worker.
    Pending,
    /// A worker is executing the handler write.
    Writing,
    /// The write completed.
    Done,
    /// The write failed or timed out.
    Error,
}

impl Status {
    /// Whether the transaction can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Whether the transition `self → to` is allowed.
    pub fn can_transition(&self, to: Status) -> bool {
        matches!(
            (self, to),
            (Self::Unknown, Status::Pending)
                | (Self::Unknown, Status::Error)
                | (Self::Pending, Status::Writing)
                | (Self::Pending, Status::Done)
                | (Self::Pending, Status::Error)
                | (Self::Writing, Status::Done)
                | (Self::Writing, Status::Error)
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Pending => write!(f, "pending"),
            Self::Writing => write!(f, "writing"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Receipt for one asynchronous write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub status: Status,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub updated_at: i64,
    /// Device id and write data, for the operator.
    pub context: String,
    /// Failure detail once the status is `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Transaction {
    fn new(context: String) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            status: Status::Unknown,
            created_at: now,
            updated_at: now,
            context,
            message: None,
        }
    }
}

struct Inner {
    entries: HashMap<String, Transaction>,
    /// Insertion order, oldest first; used for capacity eviction.
    order: VecDeque<String>,
}

/// Bounded, TTL-expiring transaction store.
pub struct TransactionStore {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl TransactionStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Create a new transaction in the `unknown` state.
    ///
    /// At capacity, the oldest terminal transaction is evicted first.
    /// Non-terminal transactions are never evicted; when every entry is
    /// outstanding the insert is admitted over capacity and the sweeper
    /// restores the bound once writes settle.
    pub async fn create(&self, context: String) -> Transaction {
        let transaction = Transaction::new(context);
        let mut inner = self.inner.lock().await;

        if inner.entries.len() >= self.capacity {
            let evict = inner
                .order
                .iter()
                .find(|id| {
                    inner
                        .entries
                        .get(id.as_str())
                        .is_some_and(|t| t.status.is_terminal())
                })
                .cloned();
            match evict {
                Some(id) => {
                    inner.entries.remove(&id);
                    inner.order.retain(|entry| entry != &id);
                }
                None => warn!(
                    capacity = self.capacity,
                    "transaction store at capacity with no terminal entries; admitting over capacity"
                ),
            }
        }

        inner.order.push_back(transaction.id.clone());
        inner
            .entries
            .insert(transaction.id.clone(), transaction.clone());
        transaction
    }

    /// Snapshot of a transaction.
    pub async fn get(&self, id: &str) -> Option<Transaction> {
        self.inner.lock().await.entries.get(id).cloned()
    }

    /// Ids of all retained transactions, oldest first.
    pub async fn ids(&self) -> Vec<String> {
        self.inner.lock().await.order.iter().cloned().collect()
    }

    /// Transition a transaction, refreshing its update time.
    pub async fn update(
        &self,
        id: &str,
        status: Status,
        message: Option<String>,
    ) -> SdkResult<Transaction> {
        let mut inner = self.inner.lock().await;
        let transaction = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| SdkError::NotFound(format!("transaction {}", id)))?;

        if !transaction.status.can_transition(status) {
            return Err(SdkError::InvalidArgument(format!(
                "transaction {}: invalid transition {} -> {}",
                id, transaction.status, status
            )));
        }

        transaction.status = status;
        transaction.updated_at = chrono::Utc::now().timestamp_millis();
        if message.is_some() {
            transaction.message = message;
        }
        Ok(transaction.clone())
    }

    /// Current number of retained transactions.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }

    /// Evict terminal transactions older than the TTL. Returns the number of
    /// evicted entries. The lock is held only for the scan itself.
    pub async fn sweep(&self) -> usize {
        let cutoff = chrono::Utc::now().timestamp_millis() - self.ttl.as_millis() as i64;
        let mut inner = self.inner.lock().await;

        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|t| t.status.is_terminal() && t.updated_at < cutoff)
            .map(|t| t.id.clone())
            .collect();
        for id in &expired {
            inner.entries.remove(id);
        }
        if !expired.is_empty() {
            inner.order.retain(|id| !expired.contains(id));
        }
        expired.len()
    }

    /// Spawn the background sweeper. It ticks until the token is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = store.sweep().await;
                        if evicted > 0 {
                            debug!(evicted, "transaction sweep");
                        }
                    }
                }
            }
        })
    }
}
