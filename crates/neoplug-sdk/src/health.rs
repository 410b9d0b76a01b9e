//! Plugin health: named periodic checks and an on-demand snapshot.
//!
//! Each registered check gets its own runner task. A check that panics is
//! reported as failing with the panic payload as its message rather than
//! taking the runner down.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Result of one health check invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Failing,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failing => write!(f, "failing"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome of a check run.
#[derive(Debug, Clone, Default)]
pub struct CheckOutcome {
    pub status: HealthStatus,
    pub message: String,
}

impl CheckOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Ok,
            message: message.into(),
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: message.into(),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Failing,
            message: message.into(),
        }
    }
}

/// A named periodic health check.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> CheckOutcome;
}

/// Snapshot of one check's latest state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSnapshot {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    /// Milliseconds since the Unix epoch; 0 when the check has not run yet.
    pub updated_at: i64,
}

/// Snapshot of the whole registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Worst status across all checks.
    pub status: HealthStatus,
    pub checks: Vec<CheckSnapshot>,
}

struct RegisteredCheck {
    check: Arc<dyn HealthCheck>,
    interval: Duration,
    state: Arc<RwLock<CheckSnapshot>>,
}

/// Registry of periodic health checks.
#[derive(Default)]
pub struct HealthRegistry {
    checks: RwLock<Vec<RegisteredCheck>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a check with its cadence.
    pub async fn register(&self, check: Arc<dyn HealthCheck>, interval: Duration) {
        let state = Arc::new(RwLock::new(CheckSnapshot {
            name: check.name().to_string(),
            status: HealthStatus::Unknown,
            message: String::new(),
            updated_at: 0,
        }));
        self.checks.write().await.push(RegisteredCheck {
            check,
            interval,
            state,
        });
    }

    /// Spawn one runner task per registered check.
    pub async fn start(&self, token: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let checks = self.checks.read().await;
        checks
            .iter()
            .map(|registered| {
                let check = Arc::clone(&registered.check);
                let state = Arc::clone(&registered.state);
                let interval = registered.interval;
                let token = token.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = ticker.tick() => {
                                let outcome = run_check(Arc::clone(&check)).await;
                                let mut snapshot = state.write().await;
                                snapshot.status = outcome.status;
                                snapshot.message = outcome.message;
                                snapshot.updated_at = chrono::Utc::now().timestamp_millis();
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// Current snapshot of every check.
    pub async fn snapshot(&self) -> HealthSnapshot {
        let checks = self.checks.read().await;
        let mut snapshots = Vec::with_capacity(checks.len());
        for registered in checks.iter() {
            snapshots.push(registered.state.read().await.clone());
        }

        let status = overall_status(&snapshots);
        HealthSnapshot {
            status,
            checks: snapshots,
        }
    }

    pub async fn check_count(&self) -> usize {
        self.checks.read().await.len()
    }
}

fn overall_status(checks: &[CheckSnapshot]) -> HealthStatus {
    let mut status = HealthStatus::Ok;
    for check in checks {
        match check.status {
            HealthStatus::Failing => return HealthStatus::Failing,
            HealthStatus::Degraded => status = HealthStatus::Degraded,
            HealthStatus::Unknown if status == HealthStatus::Ok => {
                status = HealthStatus::Unknown;
            }
            _ => {}
        }
    }
    if checks.is_empty() {
        HealthStatus::Ok
    } else {
        status
    }
}

/// Run a check in its own task so a panic converts to a failing outcome.
async fn run_check(check: Arc<dyn HealthCheck>) -> CheckOutcome {
    let name = check.name().to_string();
    let handle = tokio::spawn(async move { check.check().await });
    match handle.await {
        Ok(outcome) => outcome,
        Err(e) => {
            let message = if e.is_panic() {
                match e.into_panic().downcast::<String>() {
                    Ok(msg) => *msg,
                    Err(payload) => match payload.downcast::<&'static str>() {
                        Ok(msg) => (*msg).to_string(),
                        Err(_) => "health check panicked".to_string(),
                    },
                }
            } else {
                "health check was cancelled".to_string()
            };
            warn!(check = %name, message = %message, "health check panicked");
            CheckOutcome::failing(message)
        }
    }
}

/// Utilisation thresholds shared by the built-in queue checks.
fn utilisation_outcome(name: &str, len: usize, capacity: usize) -> CheckOutcome {
    if capacity == 0 {
        return CheckOutcome::ok(format!("{} unbounded", name));
    }
    let pct = len * 100 / capacity;
    let message = format!("{} at {}% ({}/{})", name, pct, len, capacity);
    if pct >= 100 {
        CheckOutcome::failing(message)
    } else if pct >= 90 {
        CheckOutcome::degraded(message)
    } else {
        CheckOutcome::ok(message)
    }
}

/// Built-in check reporting utilisation of a bounded channel.
pub struct QueueUtilizationCheck<T> {
    name: String,
    sender: async_channel::Sender<T>,
}

impl<T> QueueUtilizationCheck<T> {
    pub fn new(name: impl Into<String>, sender: async_channel::Sender<T>) -> Self {
        Self {
            name: name.into(),
            sender,
        }
    }
}

#[async_trait]
impl<T: Send + Sync> HealthCheck for QueueUtilizationCheck<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> CheckOutcome {
        utilisation_outcome(
            &self.name,
            self.sender.len(),
            self.sender.capacity().unwrap_or(0),
        )
    }
}

/// Shared listener counters surfaced through [`ListenerHealthCheck`].
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Currently running listener workers.
    pub active: std::sync::atomic::AtomicUsize,
    /// Total listener restarts since start.
    pub restarts: std::sync::atomic::AtomicUsize,
    /// Listeners abandoned after exhausting their restart budget.
    pub dead: std::sync::atomic::AtomicUsize,
}

/// Built-in check surfacing listener restart storms.
pub struct ListenerHealthCheck {
    stats: Arc<ListenerStats>,
    /// Cumulative restarts beyond which the check degrades.
    restart_threshold: usize,
}

impl ListenerHealthCheck {
    pub fn new(stats: Arc<ListenerStats>, restart_threshold: usize) -> Self {
        Self {
            stats,
            restart_threshold,
        }
    }
}

#[async_trait]
impl HealthCheck for ListenerHealthCheck {
    fn name(&self) -> &str {
        "listeners"
    }

    async fn check(&self) -> CheckOutcome {
        use std::sync::atomic::Ordering;
        let active = self.stats.active.load(Ordering::Relaxed);
        let restarts = self.stats.restarts.load(Ordering::Relaxed);
        let dead = self.stats.dead.load(Ordering::Relaxed);

        let message = format!(
            "{} active, {} restarts, {} dead",
            active, restarts, dead
        );
        if dead > 0 {
            CheckOutcome::failing(message)
        } else if restarts > self.restart_threshold {
            CheckOutcome::degraded(message)
        } else {
            CheckOutcome::ok(message)
        }
    }
}
