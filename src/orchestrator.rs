//! The orchestration facade.
//!
//! One [Orchestrator] owns every device registration, transport lifecycle,
//! queue operation, and recovery decision. Callers (CLI, embedding code)
//! talk to the facade only; transports talk back through the tagged device
//! event channel; recovery talks back through its intent channel. Both
//! channels are drained by loops owned here, so no component ever calls
//! back into another mid-operation.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex as StdMutex, MutexGuard, PoisonError,
};

use chrono::Utc;
use dashmap::DashMap;
use tokio::{
    sync::{broadcast, mpsc, Mutex as TokioMutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::{DeviceConfig, FarmConfig},
    error::{Error, Result},
    event::Event,
    job::{FileRef, JobStatus, PrintJob},
    queue::PrintQueue,
    recovery::{Backoff, BreakerConfig, RecoveryIntent, RecoveryManager},
    telemetry::{ConnectionStatus, DeviceSnapshot, PrinterStatus},
    transport::{self, DeviceEvent, EventSender, PrintControl, Transport, TransportEvent, IO_TIMEOUT},
};

/// Broadcast channel capacity for the event surface. Slow subscribers lag
/// rather than block the dispatch loop.
const EVENT_CAPACITY: usize = 256;

/// One registered device: its transport, cached runtime state, and the
/// flags the recovery loops coordinate through.
#[derive(Clone)]
struct Device {
    config: DeviceConfig,
    transport: Arc<TokioMutex<Box<dyn Transport>>>,
    snapshot: Arc<StdMutex<DeviceSnapshot>>,
    reconnect_attempts: Arc<AtomicU32>,
    reconnecting: Arc<AtomicBool>,
    /// Critical fault seen; no automatic reconnection until an explicit
    /// connect.
    isolated: Arc<AtomicBool>,
    /// Set by an operator-requested disconnect so the dispatch loop does not
    /// treat the resulting Disconnected event as a link failure.
    manual_offline: Arc<AtomicBool>,
    health_task: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl Device {
    fn new(config: DeviceConfig, transport: Box<dyn Transport>) -> Self {
        let snapshot = DeviceSnapshot {
            id: config.id.clone(),
            name: config.name.clone(),
            transport: config.transport.kind().to_owned(),
            connection: ConnectionStatus::Disconnected,
            status: PrinterStatus::Offline,
            telemetry: Default::default(),
            circuit: "closed".to_owned(),
            consecutive_failures: 0,
            reconnect_attempts: 0,
            last_update: Utc::now(),
        };
        Self {
            config,
            transport: Arc::new(TokioMutex::new(transport)),
            snapshot: Arc::new(StdMutex::new(snapshot)),
            reconnect_attempts: Arc::new(AtomicU32::new(0)),
            reconnecting: Arc::new(AtomicBool::new(false)),
            isolated: Arc::new(AtomicBool::new(false)),
            manual_offline: Arc::new(AtomicBool::new(false)),
            health_task: Arc::new(StdMutex::new(None)),
        }
    }
}

struct Inner {
    devices: DashMap<String, Device>,
    queue: PrintQueue,
    recovery: RecoveryManager,
    events: broadcast::Sender<Event>,
    device_events: mpsc::UnboundedSender<DeviceEvent>,
    backoff: Backoff,
}

/// The device orchestration facade.
pub struct Orchestrator {
    inner: Arc<Inner>,
    loops: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// New orchestrator with default recovery tuning. Must be created inside
    /// a tokio runtime; the dispatch and intent loops start immediately.
    pub fn new() -> Self {
        Self::with_settings(Backoff::default(), BreakerConfig::default())
    }

    /// New orchestrator with explicit backoff/breaker tuning.
    pub fn with_settings(backoff: Backoff, breaker: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (device_events, device_events_rx) = mpsc::unbounded_channel();
        let (recovery, intents_rx) = RecoveryManager::new(breaker);

        let inner = Arc::new(Inner {
            devices: DashMap::new(),
            queue: PrintQueue::new(),
            recovery,
            events,
            device_events,
            backoff,
        });

        let loops = vec![
            tokio::spawn(dispatch_loop(inner.clone(), device_events_rx)),
            tokio::spawn(intent_loop(inner.clone(), intents_rx)),
        ];
        Self { inner, loops }
    }

    /// Build an orchestrator and register every device in the config.
    /// Devices flagged `auto_connect` start connecting in the background.
    pub fn from_config(config: FarmConfig) -> Result<Self> {
        let orchestrator = Self::new();
        for device in config.devices {
            orchestrator.register_device(device)?;
        }
        Ok(orchestrator)
    }

    /// Subscribe to the outbound event stream. Delivery is at-least-once;
    /// slow subscribers observe lag, not backpressure.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// An event sender tagged with a device id, for wiring custom transports
    /// into this orchestrator's dispatch loop.
    pub fn event_sender(&self, device_id: &str) -> EventSender {
        EventSender::new(device_id, self.inner.device_events.clone())
    }

    /// Register a device, building its transport from config.
    pub fn register_device(&self, config: DeviceConfig) -> Result<()> {
        let events = self.event_sender(&config.id);
        let transport = transport::build(&config, events)?;
        self.register_device_with(config, transport)
    }

    /// Register a device with an externally constructed transport. The
    /// transport must emit on a sender from [Orchestrator::event_sender].
    pub fn register_device_with(&self, config: DeviceConfig, transport: Box<dyn Transport>) -> Result<()> {
        config.validate()?;
        if self.inner.devices.contains_key(&config.id) {
            return Err(Error::DuplicateDevice(config.id));
        }

        let id = config.id.clone();
        let auto_connect = config.auto_connect;
        let device = Device::new(config, transport);
        self.inner.queue.add_device(&id);
        self.start_health_loop(&device);
        self.inner.devices.insert(id.clone(), device);
        info!(device = %id, "device registered");

        if auto_connect {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = connect_device(&inner, &id).await {
                    warn!(device = %id, error = %e, "initial connect failed");
                }
            });
        }
        Ok(())
    }

    /// Remove a device: disconnect, cancel every job bound to it, drop its
    /// breaker state.
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        let (_, device) = self
            .inner
            .devices
            .remove(device_id)
            .ok_or_else(|| Error::NotFound(format!("device {device_id}")))?;

        if let Some(task) = lock(&device.health_task).take() {
            task.abort();
        }
        let was_connected = lock(&device.snapshot).connection == ConnectionStatus::Connected;
        device.manual_offline.store(true, Ordering::SeqCst);
        if let Err(e) = device.transport.lock().await.disconnect().await {
            warn!(device = device_id, error = %e, "disconnect during removal failed");
        }

        for job in self.inner.queue.purge_device(device_id) {
            self.inner.emit(Event::JobCancelled {
                job_id: job.id,
                device_id: device_id.to_owned(),
            });
        }
        self.inner.recovery.forget(device_id);
        if was_connected {
            self.inner.emit(Event::DeviceDisconnected {
                device_id: device_id.to_owned(),
            });
        }
        info!(device = device_id, "device removed");
        Ok(())
    }

    /// Connect a device. Fails fast with [Error::CircuitOpen] while its
    /// breaker is open.
    pub async fn connect(&self, device_id: &str) -> Result<()> {
        connect_device(&self.inner, device_id).await
    }

    /// Disconnect a device. Idempotent; disconnecting an already offline
    /// device does nothing and emits nothing.
    pub async fn disconnect(&self, device_id: &str) -> Result<()> {
        let device = self.inner.device(device_id)?;
        device.manual_offline.store(true, Ordering::SeqCst);
        let mut transport = device.transport.lock().await;
        transport.disconnect().await
    }

    /// Send one raw command to a device. A command that times out is retried
    /// once before the failure counts against the breaker.
    pub async fn send_command(&self, device_id: &str, command: &str) -> Result<String> {
        let device = self.inner.device(device_id)?;
        self.inner.recovery.check(device_id)?;

        let result = {
            let mut transport = device.transport.lock().await;
            match transport.send_command(command).await {
                Err(Error::CommandTimeout { .. }) => {
                    debug!(device = device_id, command, "command timed out, retrying once");
                    transport.send_command(command).await
                }
                other => other,
            }
        };
        match result {
            Ok(response) => {
                self.inner.recovery.on_success(device_id);
                Ok(response)
            }
            Err(e) => {
                let busy = self.inner.queue.current_job(device_id).is_some();
                self.inner.recovery.on_failure(device_id, &e, busy);
                Err(e)
            }
        }
    }

    /// Runtime snapshot for one device. Always answers from cached state;
    /// a disconnected or struggling device reads as offline with its last
    /// known telemetry, never as an error or a hang.
    pub fn status(&self, device_id: &str) -> Result<DeviceSnapshot> {
        let device = self.inner.device(device_id)?;
        Ok(self.inner.overlay(&device))
    }

    /// Snapshots for every registered device.
    pub fn all_statuses(&self) -> Vec<DeviceSnapshot> {
        self.inner
            .devices
            .iter()
            .map(|entry| self.inner.overlay(&entry))
            .collect()
    }

    /// Submit a print job for a device. The job queues immediately; if the
    /// device is idle it is promoted and started in the background.
    pub fn submit_job(&self, device_id: &str, file: FileRef, priority: u8) -> Result<Uuid> {
        let device = self.inner.device(device_id)?;
        if !device.config.enabled {
            return Err(Error::Validation(format!("device {device_id} is disabled")));
        }
        let status = lock(&device.snapshot).status;
        if device.isolated.load(Ordering::SeqCst) || status == PrinterStatus::Error {
            return Err(Error::Validation(format!(
                "device {device_id} is in an error state and not accepting jobs"
            )));
        }
        let job = PrintJob::new(device_id, file, priority)?;
        let id = self.inner.queue.submit(job)?;
        self.inner.emit_queue(device_id);
        spawn_pump(&self.inner, device_id);
        Ok(id)
    }

    /// Cancel a job in any non-terminal state. Queued jobs are just marked;
    /// for an active job the device is told to stop, best effort.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<PrintJob> {
        let cancelled = self.inner.queue.cancel(job_id)?;
        let device_id = cancelled.job.device_id.clone();

        if cancelled.was_active {
            if let Ok(device) = self.inner.device(&device_id) {
                let result = device.transport.lock().await.control_print(PrintControl::Cancel).await;
                if let Err(e) = result {
                    // The job is already terminal; hardware stop is best
                    // effort.
                    warn!(device = %device_id, job = %job_id, error = %e, "stop sequence failed");
                }
                if lock(&device.snapshot).connection == ConnectionStatus::Connected {
                    self.inner.set_status(&device, PrinterStatus::Idle);
                }
            }
        }
        self.inner.emit(Event::JobCancelled {
            job_id,
            device_id: device_id.clone(),
        });
        self.inner.emit_queue(&device_id);
        spawn_pump(&self.inner, &device_id);
        Ok(cancelled.job)
    }

    /// Pause the currently printing job.
    pub async fn pause_job(&self, job_id: Uuid) -> Result<PrintJob> {
        let job = self
            .inner
            .queue
            .job(job_id)
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        if job.status != JobStatus::Printing {
            return Err(Error::InvalidState {
                job: job_id,
                from: job.status.label().into(),
                to: JobStatus::Paused.label().into(),
            });
        }
        let device = self.inner.device(&job.device_id)?;
        device.transport.lock().await.control_print(PrintControl::Pause).await?;

        let job = self.inner.queue.mark(job_id, JobStatus::Paused)?;
        self.inner.set_status(&device, PrinterStatus::Paused);
        self.inner.emit(Event::JobPaused {
            job_id,
            device_id: job.device_id.clone(),
        });
        Ok(job)
    }

    /// Resume a paused job.
    pub async fn resume_job(&self, job_id: Uuid) -> Result<PrintJob> {
        let job = self
            .inner
            .queue
            .job(job_id)
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        if job.status != JobStatus::Paused {
            return Err(Error::InvalidState {
                job: job_id,
                from: job.status.label().into(),
                to: JobStatus::Printing.label().into(),
            });
        }
        let device = self.inner.device(&job.device_id)?;
        device.transport.lock().await.control_print(PrintControl::Resume).await?;

        let job = self.inner.queue.mark(job_id, JobStatus::Printing)?;
        self.inner.set_status(&device, PrinterStatus::Printing);
        self.inner.emit(Event::JobResumed {
            job_id,
            device_id: job.device_id.clone(),
        });
        Ok(job)
    }

    /// Move a queued job to a new position in its device's queue.
    pub fn reorder_job(&self, job_id: Uuid, position: usize) -> Result<()> {
        self.inner.queue.reorder(job_id, position)?;
        if let Some(job) = self.inner.queue.job(job_id) {
            self.inner.emit_queue(&job.device_id);
        }
        Ok(())
    }

    /// Look up one job.
    pub fn job(&self, job_id: Uuid) -> Option<PrintJob> {
        self.inner.queue.job(job_id)
    }

    /// Every job for one device, queue order.
    pub fn device_queue(&self, device_id: &str) -> Result<Vec<PrintJob>> {
        self.inner.device(device_id)?;
        Ok(self.inner.queue.jobs_for_device(device_id))
    }

    /// Every job across the farm.
    pub fn queue(&self) -> Vec<PrintJob> {
        self.inner.queue.all_jobs()
    }

    fn start_health_loop(&self, device: &Device) {
        let inner = self.inner.clone();
        let interval = device.config.health_check_interval();
        let checked = device.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                health_check(&inner, &checked).await;
            }
        });
        *lock(&device.health_task) = Some(task);
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        for entry in self.inner.devices.iter() {
            if let Some(task) = lock(&entry.health_task).take() {
                task.abort();
            }
        }
        for task in self.loops.drain(..) {
            task.abort();
        }
    }
}

impl Inner {
    fn device(&self, device_id: &str) -> Result<Device> {
        self.devices
            .get(device_id)
            .map(|d| d.clone())
            .ok_or_else(|| Error::NotFound(format!("device {device_id}")))
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_queue(&self, device_id: &str) {
        self.emit(Event::QueueUpdated {
            device_id: device_id.to_owned(),
            jobs: self.queue.jobs_for_device(device_id),
        });
    }

    /// Cached snapshot with live recovery counters overlaid.
    fn overlay(&self, device: &Device) -> DeviceSnapshot {
        let mut snapshot = lock(&device.snapshot).clone();
        snapshot.circuit = self.recovery.circuit_label(&device.config.id).to_owned();
        snapshot.consecutive_failures = self.recovery.consecutive_failures(&device.config.id);
        snapshot.reconnect_attempts = device.reconnect_attempts.load(Ordering::SeqCst);
        snapshot
    }

    fn set_status(&self, device: &Device, status: PrinterStatus) {
        let mut snapshot = lock(&device.snapshot);
        snapshot.status = status;
        snapshot.last_update = Utc::now();
    }

    fn mark_offline(&self, device: &Device) {
        let mut snapshot = lock(&device.snapshot);
        let offline = snapshot.clone().offline();
        *snapshot = offline;
        snapshot.last_update = Utc::now();
    }
}

async fn connect_device(inner: &Arc<Inner>, device_id: &str) -> Result<()> {
    let device = inner.device(device_id)?;
    inner.recovery.check(device_id)?;

    device.isolated.store(false, Ordering::SeqCst);
    device.manual_offline.store(false, Ordering::SeqCst);
    {
        let mut snapshot = lock(&device.snapshot);
        snapshot.connection = ConnectionStatus::Connecting;
        snapshot.last_update = Utc::now();
    }

    let result = device.transport.lock().await.connect().await;
    match result {
        Ok(()) => {
            inner.recovery.on_success(device_id);
            device.reconnect_attempts.store(0, Ordering::SeqCst);
            Ok(())
        }
        Err(e) => {
            inner.mark_offline(&device);
            inner.recovery.on_failure(device_id, &e, false);
            Err(e)
        }
    }
}

/// Run [pump] on its own task. The start sequence holds the device's
/// transport lock through upload deadlines, so it never runs on the
/// dispatch loop; one slow device must not stall event delivery for the
/// rest of the farm.
fn spawn_pump(inner: &Arc<Inner>, device_id: &str) {
    let inner = inner.clone();
    let device_id = device_id.to_owned();
    tokio::spawn(async move { pump(&inner, &device_id).await });
}

/// Try to promote and start the next queued job on a free, idle device.
async fn pump(inner: &Arc<Inner>, device_id: &str) {
    let Ok(device) = inner.device(device_id) else {
        return;
    };
    {
        let snapshot = lock(&device.snapshot);
        if snapshot.connection != ConnectionStatus::Connected
            || snapshot.status != PrinterStatus::Idle
        {
            return;
        }
    }
    if inner.recovery.check(device_id).is_err() {
        return;
    }
    let promoted = match inner.queue.promote(device_id) {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(e) => {
            warn!(device = device_id, error = %e, "promotion failed");
            return;
        }
    };
    inner.emit_queue(device_id);

    match start_job(&device, &promoted).await {
        Ok(()) => {
            if let Err(e) = inner.queue.mark(promoted.id, JobStatus::Printing) {
                // The device can report completion before we get here (tiny
                // prints); the dispatch loop already settled the job then.
                debug!(job = %promoted.id, error = %e, "job settled before start mark");
                return;
            }
            inner.recovery.on_success(device_id);
            inner.set_status(&device, PrinterStatus::Printing);
            inner.emit(Event::JobStarted {
                job_id: promoted.id,
                device_id: device_id.to_owned(),
            });
        }
        Err(e) => {
            warn!(device = device_id, job = %promoted.id, error = %e, "job start failed");
            let _ = inner.queue.mark(promoted.id, JobStatus::Failed);
            inner.recovery.on_failure(device_id, &e, false);
            inner.emit(Event::JobFailed {
                job_id: promoted.id,
                device_id: device_id.to_owned(),
                message: e.to_string(),
            });
            inner.emit_queue(device_id);
        }
    }
}

/// Run the start sequence for a promoted job: resolve the file content,
/// then upload+start or stream depending on the transport's capabilities.
async fn start_job(device: &Device, job: &PrintJob) -> Result<()> {
    let content = match (&job.file.content, &job.file.path) {
        (Some(content), _) => content.clone(),
        (None, Some(path)) => tokio::fs::read_to_string(path).await?,
        (None, None) => {
            return Err(Error::Validation(format!("job {} has no file content", job.id)));
        }
    };

    let mut transport = device.transport.lock().await;
    if transport.supports_file_based_print() {
        transport.upload_file(&job.file.name, content.as_bytes()).await?;
        transport.start_print(&job.file.name, None).await?;
    } else {
        transport.start_print(&job.file.name, Some(&content)).await?;
    }
    Ok(())
}

async fn health_check(inner: &Arc<Inner>, device: &Device) {
    let device_id = device.config.id.clone();
    {
        let snapshot = lock(&device.snapshot);
        if snapshot.connection != ConnectionStatus::Connected {
            return;
        }
    }
    if inner.recovery.check(&device_id).is_err() {
        return;
    }

    let result = {
        let mut transport = device.transport.lock().await;
        timeout(IO_TIMEOUT, transport.poll_status()).await
    };
    match result {
        Ok(Ok(telemetry)) => {
            inner.recovery.on_success(&device_id);
            let snapshot = {
                let mut snapshot = lock(&device.snapshot);
                snapshot.telemetry.merge(&telemetry);
                snapshot.last_update = Utc::now();
                snapshot.clone()
            };
            inner.emit(Event::DeviceStatusUpdate {
                device_id,
                snapshot,
            });
        }
        Ok(Err(e)) => {
            warn!(device = %device_id, error = %e, "health check failed");
            let busy = inner.queue.current_job(&device_id).is_some();
            inner.recovery.on_failure(&device_id, &e, busy);
        }
        Err(_) => {
            let e = Error::CommandTimeout {
                device: device_id.clone(),
                command: "status poll".to_owned(),
            };
            warn!(device = %device_id, "health check deadline exceeded");
            let busy = inner.queue.current_job(&device_id).is_some();
            inner.recovery.on_failure(&device_id, &e, busy);
        }
    }
}

/// Drain the tagged transport event channel: update cached state, feed
/// recovery, republish on the broadcast surface, promote when devices go
/// idle.
async fn dispatch_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<DeviceEvent>) {
    while let Some(DeviceEvent { device_id, event }) = rx.recv().await {
        let Ok(device) = inner.device(&device_id) else {
            debug!(device = %device_id, "event for unregistered device dropped");
            continue;
        };
        match event {
            TransportEvent::Connected => {
                {
                    let mut snapshot = lock(&device.snapshot);
                    snapshot.connection = ConnectionStatus::Connected;
                    snapshot.status = PrinterStatus::Idle;
                    snapshot.last_update = Utc::now();
                }
                inner.recovery.on_success(&device_id);
                device.reconnect_attempts.store(0, Ordering::SeqCst);
                inner.emit(Event::DeviceConnected {
                    device_id: device_id.clone(),
                });
                spawn_pump(&inner, &device_id);
            }
            TransportEvent::Disconnected => {
                inner.mark_offline(&device);
                inner.emit(Event::DeviceDisconnected {
                    device_id: device_id.clone(),
                });
                let requested = device.manual_offline.swap(false, Ordering::SeqCst);
                if !requested && !device.isolated.load(Ordering::SeqCst) {
                    // Unsolicited link drop: suspend whatever was printing
                    // and let recovery schedule the reconnect.
                    if let Some(job) = inner.queue.current_job(&device_id) {
                        if job.status == JobStatus::Printing {
                            if inner.queue.mark(job.id, JobStatus::Paused).is_ok() {
                                inner.emit(Event::JobPaused {
                                    job_id: job.id,
                                    device_id: device_id.clone(),
                                });
                            }
                        }
                    }
                    let e = Error::Connection {
                        device: device_id.clone(),
                        message: "link dropped".to_owned(),
                    };
                    inner.recovery.on_failure(&device_id, &e, false);
                }
            }
            TransportEvent::Telemetry(telemetry) => {
                let snapshot = {
                    let mut snapshot = lock(&device.snapshot);
                    snapshot.telemetry.merge(&telemetry);
                    snapshot.last_update = Utc::now();
                    snapshot.clone()
                };
                inner.emit(Event::DeviceStatusUpdate {
                    device_id,
                    snapshot,
                });
            }
            TransportEvent::StatusChanged { from, to } => {
                inner.set_status(&device, to);
                inner.emit(Event::DeviceStatusChanged {
                    device_id: device_id.clone(),
                    from,
                    to,
                });
                if to == PrinterStatus::Idle {
                    spawn_pump(&inner, &device_id);
                }
            }
            TransportEvent::PrintProgress(progress) => {
                if let Some(job) = inner.queue.current_job(&device_id) {
                    if let Ok(job) = inner.queue.set_progress(job.id, progress) {
                        inner.emit(Event::JobProgress {
                            job_id: job.id,
                            device_id,
                            progress: job.progress,
                        });
                    }
                }
            }
            TransportEvent::PrintFinished => {
                if let Some(job) = inner.queue.current_job(&device_id) {
                    // A very fast print can finish before the start sequence
                    // marked it printing; bridge the start here so consumers
                    // still see it.
                    if job.status == JobStatus::Preparing
                        && inner.queue.mark(job.id, JobStatus::Printing).is_ok()
                    {
                        inner.emit(Event::JobStarted {
                            job_id: job.id,
                            device_id: device_id.clone(),
                        });
                    }
                    match inner.queue.mark(job.id, JobStatus::Completed) {
                        Ok(_) => {
                            inner.emit(Event::JobCompleted {
                                job_id: job.id,
                                device_id: device_id.clone(),
                            });
                            inner.emit_queue(&device_id);
                        }
                        Err(e) => {
                            warn!(job = %job.id, error = %e, "completion mark failed");
                        }
                    }
                }
                inner.set_status(&device, PrinterStatus::Idle);
                spawn_pump(&inner, &device_id);
            }
            TransportEvent::Error { message, unrecoverable } => {
                inner.emit(Event::DeviceError {
                    device_id: device_id.clone(),
                    message: message.clone(),
                    unrecoverable,
                });
                let busy = inner.queue.current_job(&device_id).is_some();
                if unrecoverable {
                    let e = Error::UnrecoverableDevice {
                        device: device_id.clone(),
                        message,
                    };
                    inner.recovery.on_failure(&device_id, &e, busy);
                } else {
                    inner.recovery.on_device_report(&device_id, &message, busy);
                }
            }
        }
    }
}

/// Drain recovery intents and apply them to transports and the queue.
async fn intent_loop(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<RecoveryIntent>) {
    while let Some(intent) = rx.recv().await {
        match intent {
            RecoveryIntent::Reconnect { device_id } => {
                let Ok(device) = inner.device(&device_id) else {
                    continue;
                };
                if !device.config.auto_connect
                    || device.isolated.load(Ordering::SeqCst)
                    || device.manual_offline.load(Ordering::SeqCst)
                    || device.reconnecting.swap(true, Ordering::SeqCst)
                {
                    continue;
                }
                tokio::spawn(reconnect_with_backoff(inner.clone(), device));
            }
            RecoveryIntent::PauseCurrentJob { device_id, reason } => {
                let Ok(device) = inner.device(&device_id) else {
                    continue;
                };
                let Some(job) = inner.queue.current_job(&device_id) else {
                    continue;
                };
                if job.status != JobStatus::Printing {
                    continue;
                }
                info!(device = %device_id, job = %job.id, reason = %reason, "pausing job for recovery");
                let result = device.transport.lock().await.control_print(PrintControl::Pause).await;
                if let Err(e) = result {
                    warn!(device = %device_id, error = %e, "recovery pause failed");
                }
                if inner.queue.mark(job.id, JobStatus::Paused).is_ok() {
                    inner.set_status(&device, PrinterStatus::Paused);
                    inner.emit(Event::JobPaused {
                        job_id: job.id,
                        device_id,
                    });
                }
            }
            RecoveryIntent::Isolate { device_id, reason } => {
                isolate(&inner, &device_id, &reason).await;
            }
        }
    }
}

/// Critical fault: fail the current job, tear the link down, and stay down
/// until an operator explicitly reconnects.
async fn isolate(inner: &Arc<Inner>, device_id: &str, reason: &str) {
    let Ok(device) = inner.device(device_id) else {
        return;
    };
    warn!(device = device_id, reason, "isolating device after critical fault");
    device.isolated.store(true, Ordering::SeqCst);
    device.manual_offline.store(true, Ordering::SeqCst);

    if let Some(job) = inner.queue.current_job(device_id) {
        if let Ok(job) = inner.queue.mark(job.id, JobStatus::Failed) {
            inner.emit(Event::JobFailed {
                job_id: job.id,
                device_id: device_id.to_owned(),
                message: reason.to_owned(),
            });
            inner.emit_queue(device_id);
        }
    }

    {
        let mut transport = device.transport.lock().await;
        if let Err(e) = transport.control_print(PrintControl::Cancel).await {
            debug!(device = device_id, error = %e, "stop sequence during isolation failed");
        }
        if let Err(e) = transport.disconnect().await {
            warn!(device = device_id, error = %e, "disconnect during isolation failed");
        }
    }
    {
        let mut snapshot = lock(&device.snapshot);
        snapshot.connection = ConnectionStatus::Disconnected;
        snapshot.status = PrinterStatus::Error;
        snapshot.last_update = Utc::now();
    }
}

/// Reconnect with exponential backoff until success or the attempt budget
/// is spent, then report the give-up.
async fn reconnect_with_backoff(inner: Arc<Inner>, device: Device) {
    let device_id = device.config.id.clone();
    let max_attempts = device.config.max_reconnect_attempts;

    for attempt in 0..max_attempts {
        tokio::time::sleep(inner.backoff.delay(attempt)).await;
        // An operator override (isolation, manual disconnect, removal) wins
        // over automatic reconnection.
        if device.isolated.load(Ordering::SeqCst)
            || device.manual_offline.load(Ordering::SeqCst)
            || inner.devices.get(&device_id).is_none()
        {
            device.reconnecting.store(false, Ordering::SeqCst);
            return;
        }
        device.reconnect_attempts.store(attempt + 1, Ordering::SeqCst);
        info!(device = %device_id, attempt = attempt + 1, max_attempts, "reconnecting");

        let result = device.transport.lock().await.connect().await;
        match result {
            Ok(()) => {
                device.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                warn!(device = %device_id, attempt = attempt + 1, error = %e, "reconnect attempt failed");
            }
        }
    }

    device.reconnecting.store(false, Ordering::SeqCst);
    inner.mark_offline(&device);
    inner.emit(Event::ReconnectFailed {
        device_id,
        attempts: max_attempts,
    });
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
