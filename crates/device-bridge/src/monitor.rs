//! Bridge Monitor
//!
//! Adapter between the debug bridge and the [`ConnectionTracker`]. The
//! bridge calls us on its own thread; every callback is queued and handled
//! by a single dispatcher task so the transport thread never blocks and
//! events for one serial reach the tracker in the order they were reported.
//!
//! Also the only place that issues device-scoped commands: shell, batch
//! file transfer and port forwarding.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::scheduler::Scheduler;
use crate::shell::{run_shell, ProcessError};
use crate::tracker::ConnectionTracker;
use crate::transfer::{run_batch, TransferDirection, TransferReport};
use crate::transport::{
    BridgeListener, BridgeTransport, ClientChange, ClientInfo, DebuggerStatus, DeviceChange,
    DeviceHandle, TransportError,
};

enum BridgeEvent {
    Connected(Arc<dyn DeviceHandle>),
    Disconnected(String),
    Changed(Arc<dyn DeviceHandle>, DeviceChange),
    /// Resolved once every event queued before it has been handled
    Barrier(oneshot::Sender<()>),
}

/// serial → AVD name, each entry stamped with the generation it was stored under
#[derive(Debug, Default)]
pub struct AvdNameCache {
    entries: HashMap<String, (String, u64)>,
    next_generation: u64,
}

impl AvdNameCache {
    /// Store `name` for `serial`, returning the new entry's generation
    pub fn insert(&mut self, serial: &str, name: &str) -> u64 {
        self.next_generation += 1;
        self.entries
            .insert(serial.to_string(), (name.to_string(), self.next_generation));
        self.next_generation
    }

    pub fn get(&self, serial: &str) -> Option<&str> {
        self.entries.get(serial).map(|(name, _)| name.as_str())
    }

    pub fn generation(&self, serial: &str) -> Option<u64> {
        self.entries.get(serial).map(|(_, generation)| *generation)
    }

    /// Remove the entry only if it is still the one stored under `generation`
    pub fn remove_if(&mut self, serial: &str, generation: u64) -> bool {
        match self.entries.get(serial) {
            Some((_, current)) if *current == generation => {
                self.entries.remove(serial);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Sequence-stamped record of the disconnects the dispatcher has handled
#[derive(Debug, Default)]
struct Departures {
    seq: u64,
    last: HashMap<String, u64>,
}

impl Departures {
    fn record(&mut self, serial: &str) {
        self.seq += 1;
        self.last.insert(serial.to_string(), self.seq);
    }

    fn mark(&self) -> u64 {
        self.seq
    }

    /// Whether `serial` was disconnected after `mark` was taken
    fn since(&self, mark: u64, serial: &str) -> bool {
        self.last.get(serial).is_some_and(|seq| *seq > mark)
    }
}

pub struct BridgeMonitor {
    tracker: Arc<ConnectionTracker>,
    scheduler: Scheduler,
    transport: RwLock<Option<Arc<dyn BridgeTransport>>>,
    devices: RwLock<HashMap<String, Arc<dyn DeviceHandle>>>,
    avd_names: Mutex<AvdNameCache>,
    departures: Mutex<Departures>,
    waiting_debugger: Mutex<Vec<ClientInfo>>,
    queue: mpsc::UnboundedSender<BridgeEvent>,
    weak: Weak<Self>,
}

impl BridgeMonitor {
    /// Create the monitor and its dispatcher task on the scheduler's runtime
    pub fn new(tracker: Arc<ConnectionTracker>, scheduler: Scheduler) -> Arc<Self> {
        let (queue, events) = mpsc::unbounded_channel();

        let monitor = Arc::new_cyclic(|weak| Self {
            tracker,
            scheduler: scheduler.clone(),
            transport: RwLock::new(None),
            devices: RwLock::new(HashMap::new()),
            avd_names: Mutex::new(AvdNameCache::default()),
            departures: Mutex::new(Departures::default()),
            waiting_debugger: Mutex::new(Vec::new()),
            queue,
            weak: weak.clone(),
        });

        scheduler.spawn(dispatch(Arc::downgrade(&monitor), events));
        monitor
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    /// Attach to `transport` and reconcile its device list with ours.
    ///
    /// Devices we hold that the bridge no longer reports are disconnected,
    /// devices it reports that we do not hold are connected. Calling this
    /// again with the same transport only reconciles.
    pub async fn start(&self, transport: Arc<dyn BridgeTransport>) -> Result<(), TransportError> {
        let attach = {
            let mut current = self.transport.write();
            let same = current
                .as_ref()
                .map(|t| Arc::as_ptr(t) as *const () == Arc::as_ptr(&transport) as *const ())
                .unwrap_or(false);
            *current = Some(Arc::clone(&transport));
            !same
        };

        if attach {
            let listener: Arc<dyn BridgeListener> = Arc::new(MonitorListener {
                monitor: self.weak.clone(),
            });
            transport.add_listener(listener);
            debug!("Bridge listener registered");
        }

        // Let anything already queued land in the device map first
        self.barrier().await;
        let mark = self.departures.lock().mark();

        let snapshot = transport.devices().await.map_err(|e| {
            error!("Unable to enumerate bridge devices: {}", e);
            e
        })?;

        // Events raised while enumerating
        self.barrier().await;

        let reported: HashMap<String, Arc<dyn DeviceHandle>> = snapshot
            .into_iter()
            .map(|device| (device.serial_number().to_string(), device))
            .collect();
        let known: HashSet<String> = self.devices.read().keys().cloned().collect();
        let departed: HashSet<String> = {
            let departures = self.departures.lock();
            reported
                .keys()
                .filter(|serial| departures.since(mark, serial))
                .cloned()
                .collect()
        };

        let mut gone = 0;
        for serial in known.iter().filter(|s| !reported.contains_key(*s)) {
            self.enqueue(BridgeEvent::Disconnected(serial.clone()));
            gone += 1;
        }

        let mut new = 0;
        for (serial, device) in reported {
            if departed.contains(&serial) {
                debug!("[{}] left while enumerating, not reconnecting", serial);
                continue;
            }
            if !known.contains(&serial) {
                self.enqueue(BridgeEvent::Connected(device));
                new += 1;
            }
        }

        self.barrier().await;
        info!("Bridge monitor started: {} new, {} gone", new, gone);
        Ok(())
    }

    // ---- bridge callbacks ----

    pub fn on_device_connected(&self, device: Arc<dyn DeviceHandle>) {
        self.enqueue(BridgeEvent::Connected(device));
    }

    pub fn on_device_disconnected(&self, device: Arc<dyn DeviceHandle>) {
        self.enqueue(BridgeEvent::Disconnected(device.serial_number().to_string()));
    }

    pub fn on_device_changed(&self, device: Arc<dyn DeviceHandle>, change: DeviceChange) {
        self.enqueue(BridgeEvent::Changed(device, change));
    }

    /// Track clients suspended until a debugger attaches
    pub fn on_client_changed(&self, client: ClientInfo, change: ClientChange) {
        if !change.contains(ClientChange::DEBUGGER_STATUS) {
            return;
        }

        let mut waiting = self.waiting_debugger.lock();
        waiting.retain(|c| !(c.serial == client.serial && c.pid == client.pid));
        if client.debugger == DebuggerStatus::Waiting {
            info!(
                "[{}] pid {} waiting for debugger{}",
                client.serial,
                client.pid,
                client.app_name.as_deref().map(|a| format!(" ({})", a)).unwrap_or_default()
            );
            waiting.push(client);
        }
    }

    pub fn clients_waiting_for_debugger(&self) -> Vec<ClientInfo> {
        self.waiting_debugger.lock().clone()
    }

    /// Remove and return the first waiting client running `app_name`
    pub fn take_waiting_client(&self, app_name: &str) -> Option<ClientInfo> {
        let mut waiting = self.waiting_debugger.lock();
        let position = waiting
            .iter()
            .position(|c| c.app_name.as_deref() == Some(app_name))?;
        Some(waiting.remove(position))
    }

    // ---- device operations ----

    pub fn device(&self, serial: &str) -> Option<Arc<dyn DeviceHandle>> {
        self.devices.read().get(serial).cloned()
    }

    pub fn serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.devices.read().keys().cloned().collect();
        serials.sort();
        serials
    }

    pub async fn is_device_online(&self, serial: &str) -> bool {
        match self.device(serial) {
            Some(device) => device.is_online().await,
            None => false,
        }
    }

    pub async fn is_device_offline(&self, serial: &str) -> bool {
        match self.device(serial) {
            Some(device) => device.is_offline().await,
            None => false,
        }
    }

    /// AVD name of the emulator on `serial`, if it has been resolved
    pub fn avd_name(&self, serial: &str) -> Option<String> {
        if let Some(name) = self.avd_names.lock().get(serial) {
            return Some(name.to_string());
        }
        self.device(serial)
            .filter(|d| d.is_emulator())
            .and_then(|_| self.tracker.name_of(serial))
    }

    pub async fn execute_shell_command(
        &self,
        serial: &str,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<String, ProcessError> {
        let device = self.device(serial).ok_or_else(|| {
            warn!("[{}] shell `{}` on unknown device", serial, command);
            ProcessError::DeviceNotFound(serial.to_string())
        })?;
        run_shell(&device, command, timeout, cancel).await
    }

    /// Push `local[i]` to `remote[i]` for every i
    pub async fn push_files(
        &self,
        serial: &str,
        local: &[PathBuf],
        remote: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TransferReport {
        let pairs = local
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .zip(remote.iter().cloned())
            .collect();
        self.transfer(serial, TransferDirection::Push, local.len(), remote.len(), pairs, timeout, cancel)
            .await
    }

    /// Pull `remote[i]` into `local[i]` for every i
    pub async fn pull_files(
        &self,
        serial: &str,
        remote: &[String],
        local: &[PathBuf],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TransferReport {
        let pairs = remote
            .iter()
            .cloned()
            .zip(local.iter().map(|p| p.to_string_lossy().into_owned()))
            .collect();
        self.transfer(serial, TransferDirection::Pull, remote.len(), local.len(), pairs, timeout, cancel)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn transfer(
        &self,
        serial: &str,
        direction: TransferDirection,
        sources: usize,
        destinations: usize,
        pairs: Vec<(String, String)>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TransferReport {
        if sources != destinations {
            warn!("[{}] {}: {} sources but {} destinations", serial, direction, sources, destinations);
            return TransferReport::invalid(format!(
                "{} sources but {} destinations",
                sources, destinations
            ));
        }

        let Some(device) = self.device(serial) else {
            warn!("[{}] {} on unknown device", serial, direction);
            return TransferReport::invalid(format!("Device {} not found", serial));
        };

        let report = run_batch(&device, direction, pairs, timeout, cancel).await;
        if report.status.is_error() {
            error!("[{}] {} failed:\n{}", serial, direction, report.status.message);
        }
        report
    }

    pub async fn create_forward(
        &self,
        serial: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<(), ProcessError> {
        let device = self
            .device(serial)
            .ok_or_else(|| ProcessError::DeviceNotFound(serial.to_string()))?;

        device
            .create_forward(local_port, remote_port)
            .await
            .map_err(|e| {
                error!("[{}] forward tcp:{} -> tcp:{} failed: {}", serial, local_port, remote_port, e);
                ProcessError::Transport {
                    serial: serial.to_string(),
                    reason: e.to_string(),
                }
            })?;

        info!("[{}] forwarding tcp:{} -> tcp:{}", serial, local_port, remote_port);
        Ok(())
    }

    // ---- dispatcher ----

    fn enqueue(&self, event: BridgeEvent) {
        if self.queue.send(event).is_err() {
            warn!("Bridge event dropped: dispatcher stopped");
        }
    }

    async fn barrier(&self) {
        let (tx, rx) = oneshot::channel();
        self.enqueue(BridgeEvent::Barrier(tx));
        let _ = rx.await;
    }

    async fn handle(&self, event: BridgeEvent) {
        match event {
            BridgeEvent::Connected(device) => self.handle_connected(device).await,
            BridgeEvent::Disconnected(serial) => self.handle_disconnected(&serial),
            BridgeEvent::Changed(device, change) => {
                let serial = device.serial_number().to_string();
                if !self.devices.read().contains_key(&serial) {
                    self.handle_connected(device).await;
                    return;
                }
                if change.contains(DeviceChange::STATE) {
                    self.remember_avd_name(&device).await;
                }
                self.tracker.device_changed(device, change).await;
            }
            BridgeEvent::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn handle_connected(&self, device: Arc<dyn DeviceHandle>) {
        let serial = device.serial_number().to_string();
        debug!("[{}] bridge reported device", serial);

        self.devices.write().insert(serial.clone(), Arc::clone(&device));
        if device.is_emulator() {
            self.remember_avd_name(&device).await;
        } else {
            self.tracker.registry().get_or_create_physical_profile(&serial);
        }

        self.tracker.device_connected(device).await;
    }

    fn handle_disconnected(&self, serial: &str) {
        if self.devices.write().remove(serial).is_none() {
            debug!("[{}] disconnect for unknown device", serial);
        }

        self.waiting_debugger.lock().retain(|c| c.serial != serial);
        self.departures.lock().record(serial);
        self.tracker.device_disconnected(serial);
        self.schedule_avd_name_cleanup(serial);
    }

    async fn remember_avd_name(&self, device: &Arc<dyn DeviceHandle>) {
        if !device.is_emulator() {
            return;
        }
        if let Some(name) = device.avd_name().await {
            self.avd_names.lock().insert(device.serial_number(), &name);
        }
    }

    /// Drop the cached AVD name later, unless the serial reconnected meanwhile
    fn schedule_avd_name_cleanup(&self, serial: &str) {
        let Some(generation) = self.avd_names.lock().generation(serial) else {
            return;
        };

        let monitor = self.weak.clone();
        let serial = serial.to_string();
        self.scheduler.spawn(async move {
            let Some(monitor) = monitor.upgrade() else {
                return;
            };
            if monitor.avd_names.lock().remove_if(&serial, generation) {
                debug!("[{}] AVD name forgotten", serial);
            } else {
                debug!("[{}] AVD name kept: device reconnected", serial);
            }
        });
    }
}

async fn dispatch(monitor: Weak<BridgeMonitor>, mut events: mpsc::UnboundedReceiver<BridgeEvent>) {
    while let Some(event) = events.recv().await {
        let Some(monitor) = monitor.upgrade() else {
            break;
        };
        monitor.handle(event).await;
    }
    debug!("Bridge dispatcher stopped");
}

/// Registered with the transport; holds the monitor weakly so the
/// transport's listener list does not keep it alive
struct MonitorListener {
    monitor: Weak<BridgeMonitor>,
}

impl BridgeListener for MonitorListener {
    fn on_device_connected(&self, device: Arc<dyn DeviceHandle>) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.on_device_connected(device);
        }
    }

    fn on_device_disconnected(&self, device: Arc<dyn DeviceHandle>) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.on_device_disconnected(device);
        }
    }

    fn on_device_changed(&self, device: Arc<dyn DeviceHandle>, change: DeviceChange) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.on_device_changed(device, change);
        }
    }

    fn on_client_changed(&self, client: ClientInfo, change: ClientChange) {
        if let Some(monitor) = self.monitor.upgrade() {
            monitor.on_client_changed(client, change);
        }
    }
}

impl std::fmt::Debug for BridgeMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeMonitor")
            .field("devices", &self.devices.read().len())
            .field("avd_names", &self.avd_names.lock().len())
            .field("waiting_debugger", &self.waiting_debugger.lock().len())
            .finish()
    }
}
