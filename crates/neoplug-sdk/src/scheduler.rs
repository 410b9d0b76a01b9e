//! The data manager: read, listen, and write scheduling over the device
//! catalog.
//!
//! Three concurrent activities run against the frozen catalog:
//!
//! - a read loop invoking read/bulk-read handlers on a fixed cadence, in
//!   serial or parallel mode;
//! - one long-running listener worker per listen-capable device, restarted
//!   with backoff on failure;
//! - a write pipeline: one shared bounded queue, fanned out to per-device
//!   lanes so writes to a single device stay FIFO while devices interleave,
//!   with a semaphore bounding concurrent handler invocations.
//!
//! Completed readings flow through a single publisher task into the reading
//! cache and the broadcast channel, which preserves per-device publication
//! order.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::ReadingCache;
use crate::config::{ListenSettings, PluginSettings, ReadMode};
use crate::device::{Device, DeviceHandler, ReadingSink, WriteData};
use crate::error::{SdkError, SdkResult};
use crate::health::ListenerStats;
use crate::manager::DeviceManager;
use crate::reading::{ReadContext, Reading};
use crate::transaction::{Status, Transaction, TransactionStore};

/// Lifecycle state of the data manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataManagerState {
    New,
    Initialized,
    Running,
    Stopping,
    Stopped,
}

impl DataManagerState {
    fn can_transition(&self, to: DataManagerState) -> bool {
        matches!(
            (self, to),
            (Self::New, DataManagerState::Initialized)
                | (Self::Initialized, DataManagerState::Running)
                | (Self::Running, DataManagerState::Stopping)
                | (Self::Stopping, DataManagerState::Stopped)
        )
    }
}

impl std::fmt::Display for DataManagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Initialized => write!(f, "initialized"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// One queued write.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub transaction: String,
    pub device: Uuid,
    pub data: WriteData,
}

/// What the read loop schedules in one iteration.
enum ReadUnit {
    /// One per-device read.
    Single(Arc<Device>),
    /// One bulk call covering every device of a bulk-only handler.
    Bulk(Arc<dyn DeviceHandler>, Vec<Arc<Device>>),
}

/// FIFO lane serializing writes against one device.
///
/// The lane buffer is bounded so a slow device backs pressure up through the
/// dispatcher into the shared write queue instead of buffering without limit.
struct WriteLane {
    tx: async_channel::Sender<WriteRequest>,
    rx: async_channel::Receiver<WriteRequest>,
    busy: AtomicBool,
}

impl WriteLane {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self {
            tx,
            rx,
            busy: AtomicBool::new(false),
        }
    }

    async fn push(&self, request: WriteRequest) {
        // The lane never closes while the manager is alive.
        let _ = self.tx.send(request).await;
    }

    fn pop(&self) -> Option<WriteRequest> {
        self.rx.try_recv().ok()
    }

    fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Claim the lane for draining; false when a drainer already owns it.
    fn try_claim(&self) -> bool {
        !self.busy.swap(true, Ordering::SeqCst)
    }

    fn release(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Counts in-flight lane drainers so stop can wait for the queue to settle.
#[derive(Default)]
struct WriteTracker {
    active: AtomicUsize,
    notify: Notify,
}

impl WriteTracker {
    fn started(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    fn finished(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// The read/write/listen scheduler.
pub struct DataManager {
    settings: PluginSettings,
    devices: Arc<DeviceManager>,
    transactions: Arc<TransactionStore>,
    cache: Arc<ReadingCache>,

    bus: broadcast::Sender<Reading>,
    read_tx: async_channel::Sender<ReadContext>,
    read_rx: async_channel::Receiver<ReadContext>,
    write_tx: async_channel::Sender<WriteRequest>,
    write_rx: async_channel::Receiver<WriteRequest>,

    state: Mutex<DataManagerState>,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,

    lanes: Arc<DashMap<Uuid, Arc<WriteLane>>>,
    write_permits: Arc<Semaphore>,
    write_tracker: Arc<WriteTracker>,
    accepting_writes: Arc<AtomicBool>,
    /// Set once the stop grace period elapses; queued writes fail fast.
    abort_writes: Arc<AtomicBool>,
    listener_stats: Arc<ListenerStats>,
}

impl DataManager {
    pub fn new(
        settings: PluginSettings,
        devices: Arc<DeviceManager>,
        transactions: Arc<TransactionStore>,
        cache: Arc<ReadingCache>,
        token: CancellationToken,
    ) -> Self {
        let (read_tx, read_rx) = async_channel::bounded(settings.read.channel_size.max(1));
        let (write_tx, write_rx) = async_channel::bounded(settings.write.queue_size.max(1));
        let (bus, _) = broadcast::channel(settings.read.channel_size.max(1));

        Self {
            write_permits: Arc::new(Semaphore::new(settings.write.workers.max(1))),
            settings,
            devices,
            transactions,
            cache,
            bus,
            read_tx,
            read_rx,
            write_tx,
            write_rx,
            state: Mutex::new(DataManagerState::New),
            token,
            tasks: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(None),
            lanes: Arc::new(DashMap::new()),
            write_tracker: Arc::new(WriteTracker::default()),
            accepting_writes: Arc::new(AtomicBool::new(false)),
            abort_writes: Arc::new(AtomicBool::new(false)),
            listener_stats: Arc::new(ListenerStats::default()),
        }
    }

    pub async fn state(&self) -> DataManagerState {
        *self.state.lock().await
    }

    async fn transition(&self, to: DataManagerState) -> SdkResult<()> {
        let mut state = self.state.lock().await;
        if !state.can_transition(to) {
            return Err(SdkError::Fatal(format!(
                "invalid data manager transition: {} -> {}",
                state, to
            )));
        }
        debug!(from = %state, to = %to, "data manager state change");
        *state = to;
        Ok(())
    }

    /// Validate the frozen catalog against the scheduler configuration.
    pub async fn init(&self) -> SdkResult<()> {
        for handler in self.devices.handler_names().await {
            let bound = self.devices.devices_for_handler(&handler).await;
            if bound.is_empty() {
                debug!(handler = %handler, "handler has no devices");
            }
        }

        let devices = self.devices.devices().await;
        let readable = devices.iter().filter(|d| d.is_readable()).count();
        let writable = devices.iter().filter(|d| d.is_writable()).count();
        let listeners = devices.iter().filter(|d| d.is_listener()).count();
        info!(
            devices = devices.len(),
            readable,
            writable,
            listeners,
            mode = ?self.settings.read.mode,
            "data manager initialized"
        );

        self.transition(DataManagerState::Initialized).await
    }

    /// Spawn all workers: listeners first, then the read loop, then the
    /// write pipeline and the transaction sweeper.
    pub async fn start(self: &Arc<Self>) -> SdkResult<()> {
        self.transition(DataManagerState::Running).await?;

        let mut tasks = self.tasks.lock().await;

        // The publisher must be up before anything produces readings.
        tasks.push(self.spawn_publisher());

        if self.settings.listen.enabled {
            for device in self.devices.devices().await {
                if device.is_listener() {
                    tasks.push(self.spawn_listener(device));
                }
            }
        }

        if self.settings.read.enabled {
            let units = self.read_units().await;
            if !units.is_empty() {
                tasks.push(self.spawn_read_loop(units));
            }
        }

        if self.settings.write.enabled {
            let mut dispatcher = self.dispatcher.lock().await;
            *dispatcher = Some(self.spawn_write_dispatcher());
            self.accepting_writes.store(true, Ordering::SeqCst);
        }

        tasks.push(
            self.transactions
                .spawn_sweeper(self.settings.transaction.sweep_interval(), self.token.clone()),
        );

        info!("data manager running");
        Ok(())
    }

    /// Stop all workers: stop accepting writes, cancel listeners and the
    /// read loop, drain the write queue within the grace period, then shut
    /// everything down.
    pub async fn stop(&self) -> SdkResult<()> {
        self.transition(DataManagerState::Stopping).await?;

        self.accepting_writes.store(false, Ordering::SeqCst);
        self.write_tx.close();
        self.token.cancel();

        let grace = self.settings.shutdown.grace_period();
        let dispatcher = self.dispatcher.lock().await.take();
        let tracker = Arc::clone(&self.write_tracker);
        let drain = async move {
            if let Some(handle) = dispatcher {
                let _ = handle.await;
            }
            tracker.wait_idle().await;
        };
        tokio::pin!(drain);
        if tokio::time::timeout(grace, &mut drain).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "write queue did not drain within the grace period; failing queued writes"
            );
            // Remaining queued writes fail fast; the in-flight one is bounded
            // by its device write timeout.
            self.abort_writes.store(true, Ordering::SeqCst);
            drain.await;
        }

        // Late read results are discarded from here on.
        self.read_tx.close();

        let mut tasks = self.tasks.lock().await;
        for task in tasks.iter() {
            task.abort();
        }
        for task in tasks.drain(..) {
            let _ = task.await;
        }

        self.transition(DataManagerState::Stopped).await?;
        info!("data manager stopped");
        Ok(())
    }

    /// Subscribe to the broadcast reading channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Reading> {
        self.bus.subscribe()
    }

    pub(crate) fn read_channel(&self) -> async_channel::Sender<ReadContext> {
        self.read_tx.clone()
    }

    pub(crate) fn write_channel(&self) -> async_channel::Sender<WriteRequest> {
        self.write_tx.clone()
    }

    pub(crate) fn listener_stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.listener_stats)
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Create transactions for the payloads and admit them to the write
    /// queue. Returns the created transactions in enqueue order.
    pub async fn write(
        &self,
        device: &Arc<Device>,
        payloads: Vec<WriteData>,
    ) -> SdkResult<Vec<Transaction>> {
        if !self.settings.write.enabled {
            return Err(SdkError::Unsupported("writes are disabled".into()));
        }
        if !device.is_writable() {
            return Err(SdkError::Unsupported(format!(
                "device {} is not writable",
                device.id()
            )));
        }
        if payloads.is_empty() {
            return Err(SdkError::InvalidArgument("no write data given".into()));
        }
        if !self.accepting_writes.load(Ordering::SeqCst) {
            return Err(SdkError::Transient(
                "the plugin is not accepting writes".into(),
            ));
        }

        let admission = self.settings.write.admission_timeout();
        let mut accepted = Vec::with_capacity(payloads.len());
        for data in payloads {
            let context = format!("device {} action {}", device.id(), data.action);
            let transaction = self.transactions.create(context).await;
            let request = WriteRequest {
                transaction: transaction.id.clone(),
                device: device.id(),
                data,
            };

            // Mark pending before admission so a fast worker never races the
            // pending transition with its own move to writing.
            let pending = self
                .transactions
                .update(&transaction.id, Status::Pending, None)
                .await?;

            match tokio::time::timeout(admission, self.write_tx.send(request)).await {
                Ok(Ok(())) => {
                    accepted.push(pending);
                }
                Ok(Err(_)) => {
                    let _ = self
                        .transactions
                        .update(
                            &transaction.id,
                            Status::Error,
                            Some("write rejected: the plugin is stopping".into()),
                        )
                        .await;
                    return Err(SdkError::Transient(
                        "write rejected: the plugin is stopping".into(),
                    ));
                }
                Err(_) => {
                    let _ = self
                        .transactions
                        .update(
                            &transaction.id,
                            Status::Error,
                            Some("write rejected: queue full".into()),
                        )
                        .await;
                    return Err(SdkError::QueueFull);
                }
            }
        }
        Ok(accepted)
    }

    // ---- read path ----

    /// Compute the scheduling units once; the catalog is frozen by now.
    async fn read_units(&self) -> Vec<ReadUnit> {
        let mut units = Vec::new();
        for device in self.devices.devices().await {
            if device.capabilities().read {
                units.push(ReadUnit::Single(device));
            }
        }
        for name in self.devices.handler_names().await {
            let Some(handler) = self.devices.handler(&name).await else {
                continue;
            };
            let caps = handler.capabilities();
            if caps.bulk_read && !caps.read {
                let group = self.devices.devices_for_handler(&name).await;
                if !group.is_empty() {
                    units.push(ReadUnit::Bulk(handler, group));
                }
            }
        }
        units
    }

    fn spawn_read_loop(self: &Arc<Self>, units: Vec<ReadUnit>) -> JoinHandle<()> {
        let dm = Arc::clone(self);
        let units = Arc::new(units);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dm.settings.read.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = dm.token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match dm.settings.read.mode {
                    ReadMode::Serial => {
                        for unit in units.iter() {
                            if dm.token.is_cancelled() {
                                break;
                            }
                            dm.run_read_unit(unit).await;
                        }
                    }
                    ReadMode::Parallel => {
                        let mut workers = JoinSet::new();
                        for index in 0..units.len() {
                            let dm = Arc::clone(&dm);
                            let units = Arc::clone(&units);
                            workers.spawn(async move {
                                dm.run_read_unit(&units[index]).await;
                            });
                        }
                        // Barrier: the iteration closes when every worker is done.
                        while workers.join_next().await.is_some() {}
                    }
                }
            }
        })
    }

    async fn run_read_unit(&self, unit: &ReadUnit) {
        match unit {
            ReadUnit::Single(device) => {
                let Ok(handler) = device.handler() else {
                    error!(device = %device.id(), "read scheduled for unbound device");
                    return;
                };
                let target = Arc::clone(device);
                let worker =
                    tokio::spawn(async move { handler.read(&target).await });
                match worker.await {
                    Ok(Ok(readings)) => {
                        self.publish(ReadContext::new(device.id(), readings)).await;
                    }
                    Ok(Err(e)) => {
                        warn!(device = %device.id(), error = %e, "read failed");
                    }
                    Err(e) => {
                        warn!(device = %device.id(), error = %e, "read handler panicked");
                    }
                }
            }
            ReadUnit::Bulk(handler, group) => {
                let handler = Arc::clone(handler);
                let devices = group.clone();
                let first = group.first().map(|d| d.id());
                let worker =
                    tokio::spawn(async move { handler.bulk_read(&devices).await });
                match worker.await {
                    Ok(Ok(contexts)) => {
                        for ctx in contexts {
                            self.publish(ctx).await;
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(device = ?first, error = %e, "bulk read failed");
                    }
                    Err(e) => {
                        warn!(device = ?first, error = %e, "bulk read handler panicked");
                    }
                }
            }
        }
    }

    /// Admit a read context to the publication channel, discarding it when no
    /// slot frees within the admission deadline.
    async fn publish(&self, ctx: ReadContext) {
        let admission = self.settings.read.admission_timeout();
        let device = ctx.device;
        match tokio::time::timeout(admission, self.read_tx.send(ctx)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                debug!(device = %device, "reading discarded: plugin stopping");
            }
            Err(_) => {
                warn!(device = %device, "reading discarded: publication channel full");
            }
        }
    }

    /// Single consumer of the publication channel; preserves per-device
    /// ordering into the cache and the broadcast channel.
    fn spawn_publisher(self: &Arc<Self>) -> JoinHandle<()> {
        let dm = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok(ctx) = dm.read_rx.recv().await {
                let Some(device) = dm.devices.get_device(&ctx.device).await else {
                    warn!(device = %ctx.device, "readings for unknown device discarded");
                    continue;
                };
                for mut reading in ctx.readings {
                    reading.device = ctx.device;
                    match device.apply_transforms(reading) {
                        Ok(reading) => {
                            dm.cache.add(reading.clone());
                            let _ = dm.bus.send(reading);
                        }
                        Err(e) => {
                            warn!(device = %ctx.device, error = %e, "transform failed; reading dropped");
                        }
                    }
                }
            }
        })
    }

    // ---- listen path ----

    fn spawn_listener(self: &Arc<Self>, device: Arc<Device>) -> JoinHandle<()> {
        let dm = Arc::clone(self);
        tokio::spawn(async move {
            let stats = Arc::clone(&dm.listener_stats);
            let settings: ListenSettings = dm.settings.listen.clone();
            stats.active.fetch_add(1, Ordering::Relaxed);

            let mut failures = 0usize;
            loop {
                if dm.token.is_cancelled() {
                    break;
                }
                let Ok(handler) = device.handler() else {
                    error!(device = %device.id(), "listener scheduled for unbound device");
                    break;
                };
                let sink = ReadingSink::new(dm.read_tx.clone());
                let target = Arc::clone(&device);
                let worker =
                    tokio::spawn(async move { handler.listen(&target, sink).await });
                let abort = worker.abort_handle();

                let result = tokio::select! {
                    _ = dm.token.cancelled() => {
                        abort.abort();
                        break;
                    }
                    result = worker => result,
                };

                match result {
                    Ok(Ok(())) => {
                        info!(device = %device.id(), "listener exited cleanly");
                        break;
                    }
                    Ok(Err(e)) => {
                        failures += 1;
                        stats.restarts.fetch_add(1, Ordering::Relaxed);
                        warn!(device = %device.id(), error = %e, failures, "listener failed");
                    }
                    Err(e) => {
                        failures += 1;
                        stats.restarts.fetch_add(1, Ordering::Relaxed);
                        warn!(device = %device.id(), error = %e, failures, "listener panicked");
                    }
                }

                if failures >= settings.max_restarts {
                    stats.dead.fetch_add(1, Ordering::Relaxed);
                    error!(device = %device.id(), failures, "listener abandoned after repeated failures");
                    break;
                }

                let backoff = settings.restart_backoff() * failures as u32;
                tokio::select! {
                    _ = dm.token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            stats.active.fetch_sub(1, Ordering::Relaxed);
        })
    }

    // ---- write path ----

    /// Moves queued writes onto per-device lanes in FIFO order and claims a
    /// drainer for any idle lane. Runs until the write queue is closed and
    /// drained.
    fn spawn_write_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let dm = Arc::clone(self);
        let lane_capacity = self.settings.write.max_per_worker.max(1);
        tokio::spawn(async move {
            while let Ok(request) = dm.write_rx.recv().await {
                let lane = dm
                    .lanes
                    .entry(request.device)
                    .or_insert_with(|| Arc::new(WriteLane::new(lane_capacity)))
                    .clone();
                lane.push(request).await;
                if lane.try_claim() {
                    dm.write_tracker.started();
                    let dm = Arc::clone(&dm);
                    let lane = Arc::clone(&lane);
                    tokio::spawn(async move {
                        dm.drain_lane(&lane).await;
                        dm.write_tracker.finished();
                    });
                }
            }
        })
    }

    /// Execute queued writes for one device, in order, yielding the worker
    /// slot between batches.
    async fn drain_lane(&self, lane: &WriteLane) {
        'claimed: loop {
            let Ok(permit) = Arc::clone(&self.write_permits).acquire_owned().await else {
                return;
            };
            for _ in 0..self.settings.write.max_per_worker.max(1) {
                let Some(request) = lane.pop() else {
                    drop(permit);
                    lane.release();
                    // A push may have raced the release; reclaim if so.
                    if !lane.is_empty() && lane.try_claim() {
                        continue 'claimed;
                    }
                    break 'claimed;
                };
                if self.abort_writes.load(Ordering::SeqCst) {
                    let _ = self
                        .transactions
                        .update(
                            &request.transaction,
                            Status::Error,
                            Some("write cancelled: plugin stopped".into()),
                        )
                        .await;
                    continue;
                }
                self.execute_write(request).await;
            }
        }
    }

    async fn execute_write(&self, request: WriteRequest) {
        let Some(device) = self.devices.get_device(&request.device).await else {
            let _ = self
                .transactions
                .update(
                    &request.transaction,
                    Status::Error,
                    Some(format!("device {} not found", request.device)),
                )
                .await;
            return;
        };

        if let Err(e) = self
            .transactions
            .update(&request.transaction, Status::Writing, None)
            .await
        {
            warn!(transaction = %request.transaction, error = %e, "stale write request");
            return;
        }

        let handler = match device.handler() {
            Ok(handler) => handler,
            Err(e) => {
                let _ = self
                    .transactions
                    .update(&request.transaction, Status::Error, Some(e.to_string()))
                    .await;
                return;
            }
        };

        let timeout = device.write_timeout;
        let target = Arc::clone(&device);
        let data = request.data.clone();
        let worker = tokio::spawn(async move { handler.write(&target, &data).await });
        let abort = worker.abort_handle();

        let (status, message) = match tokio::time::timeout(timeout, worker).await {
            Err(_) => {
                abort.abort();
                warn!(device = %device.id(), transaction = %request.transaction, "write timed out");
                (
                    Status::Error,
                    Some(format!("write timed out after {}ms", timeout.as_millis())),
                )
            }
            Ok(Err(e)) => {
                warn!(device = %device.id(), error = %e, "write handler panicked");
                (Status::Error, Some(format!("write panicked: {}", e)))
            }
            Ok(Ok(Ok(()))) => (Status::Done, None),
            Ok(Ok(Err(e))) => {
                warn!(device = %device.id(), error = %e, "write failed");
                (Status::Error, Some(e.to_string()))
            }
        };

        if let Err(e) = self
            .transactions
            .update(&request.transaction, status, message)
            .await
        {
            warn!(transaction = %request.transaction, error = %e, "unable to finalize transaction");
        }
    }
}
