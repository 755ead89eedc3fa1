//! In-memory bridge used by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devlink_core::DeviceConfig;
use devlink_device_bridge::{
    BridgeListener, BridgeTransport, ClientChange, ClientInfo, DeviceChange, DeviceContext, DeviceHandle,
    DeviceProfile, DeviceStartListener, ShellOutputReceiver, SyncProgressMonitor, SyncService, TransportError,
};
use parking_lot::Mutex;

pub const BOOT_PROBE: &str = "getprop sys.boot_completed";
pub const PM_PROBE: &str = "pm get-max-users";

/// Scripted answer to one shell command
#[derive(Debug, Clone)]
pub enum ShellReply {
    Output(String),
    /// The bridge refuses the command
    Reject(String),
    /// Never answers
    Hang,
}

#[derive(Debug, Default)]
struct TransferLog {
    failing: HashSet<String>,
    done: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct FakeDevice {
    serial: String,
    emulator: bool,
    online: AtomicBool,
    booted: AtomicBool,
    pm_ready: AtomicBool,
    avd_name: Mutex<Option<String>>,
    properties: Mutex<HashMap<String, String>>,
    replies: Mutex<HashMap<String, ShellReply>>,
    commands: Mutex<Vec<String>>,
    transfers: Arc<Mutex<TransferLog>>,
    forwards: Mutex<Vec<(u16, u16)>>,
}

impl FakeDevice {
    fn new(serial: &str, emulator: bool, avd_name: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            serial: serial.to_string(),
            emulator,
            online: AtomicBool::new(true),
            booted: AtomicBool::new(false),
            pm_ready: AtomicBool::new(false),
            avd_name: Mutex::new(avd_name.map(String::from)),
            properties: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            transfers: Arc::new(Mutex::new(TransferLog::default())),
            forwards: Mutex::new(Vec::new()),
        })
    }

    pub fn physical(serial: &str) -> Arc<Self> {
        Self::new(serial, false, None)
    }

    pub fn emulator(serial: &str, avd_name: Option<&str>) -> Arc<Self> {
        Self::new(serial, true, avd_name)
    }

    /// Booted with a responsive package manager
    pub fn ready(self: Arc<Self>) -> Arc<Self> {
        self.set_booted(true);
        self.set_pm_ready(true);
        self
    }

    pub fn offline(self: Arc<Self>) -> Arc<Self> {
        self.set_online(false);
        self
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_booted(&self, booted: bool) {
        self.booted.store(booted, Ordering::SeqCst);
    }

    pub fn set_pm_ready(&self, ready: bool) {
        self.pm_ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_avd_name(&self, name: &str) {
        *self.avd_name.lock() = Some(name.to_string());
    }

    pub fn set_property(&self, key: &str, value: &str) {
        self.properties.lock().insert(key.to_string(), value.to_string());
    }

    pub fn reply(&self, command: &str, reply: ShellReply) {
        self.replies.lock().insert(command.to_string(), reply);
    }

    pub fn fail_transfer_to(&self, destination: &str) {
        self.transfers.lock().failing.insert(destination.to_string());
    }

    pub fn transferred(&self) -> Vec<(String, String)> {
        self.transfers.lock().done.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn command_count(&self, command: &str) -> usize {
        self.commands.lock().iter().filter(|c| *c == command).count()
    }

    pub fn forwards(&self) -> Vec<(u16, u16)> {
        self.forwards.lock().clone()
    }

    fn answer(&self, command: &str) -> ShellReply {
        if let Some(reply) = self.replies.lock().get(command) {
            return reply.clone();
        }
        match command {
            BOOT_PROBE => {
                let value = if self.booted.load(Ordering::SeqCst) { "1\n" } else { "\n" };
                ShellReply::Output(value.to_string())
            }
            PM_PROBE => {
                let value = if self.pm_ready.load(Ordering::SeqCst) {
                    "Maximum supported users: 4\n"
                } else {
                    "Error: Could not access the Package Manager.  Is the system running?\n"
                };
                ShellReply::Output(value.to_string())
            }
            _ => ShellReply::Output(String::new()),
        }
    }
}

#[async_trait]
impl DeviceHandle for FakeDevice {
    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn is_emulator(&self) -> bool {
        self.emulator
    }

    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn is_offline(&self) -> bool {
        !self.online.load(Ordering::SeqCst)
    }

    async fn property(&self, key: &str) -> Result<Option<String>, TransportError> {
        Ok(self.properties.lock().get(key).cloned())
    }

    async fn avd_name(&self) -> Option<String> {
        if !self.emulator {
            return None;
        }
        self.avd_name.lock().clone()
    }

    async fn execute_shell_command(
        &self,
        command: &str,
        receiver: Arc<dyn ShellOutputReceiver>,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        self.commands.lock().push(command.to_string());

        match self.answer(command) {
            ShellReply::Output(output) => {
                receiver.add_output(output.as_bytes());
                receiver.flush();
                Ok(())
            }
            ShellReply::Reject(reason) => Err(TransportError::Rejected(reason)),
            ShellReply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }

    async fn sync_service(&self) -> Result<Box<dyn SyncService>, TransportError> {
        Ok(Box::new(FakeSync {
            log: Arc::clone(&self.transfers),
        }))
    }

    async fn create_forward(&self, local_port: u16, remote_port: u16) -> Result<(), TransportError> {
        self.forwards.lock().push((local_port, remote_port));
        Ok(())
    }
}

struct FakeSync {
    log: Arc<Mutex<TransferLog>>,
}

impl FakeSync {
    fn record(&self, source: String, destination: String, monitor: &dyn SyncProgressMonitor) -> Result<(), TransportError> {
        monitor.start(1);
        let mut log = self.log.lock();
        if log.failing.contains(&destination) {
            return Err(TransportError::Sync(format!("remote object '{}' does not exist", destination)));
        }
        log.done.push((source, destination));
        monitor.advance(1);
        Ok(())
    }
}

#[async_trait]
impl SyncService for FakeSync {
    async fn push_file(
        &self,
        local: &Path,
        remote: &str,
        monitor: &dyn SyncProgressMonitor,
    ) -> Result<(), TransportError> {
        self.record(local.to_string_lossy().into_owned(), remote.to_string(), monitor)
    }

    async fn pull_file(
        &self,
        remote: &str,
        local: &Path,
        monitor: &dyn SyncProgressMonitor,
    ) -> Result<(), TransportError> {
        self.record(remote.to_string(), local.to_string_lossy().into_owned(), monitor)
    }
}

/// Bridge whose device list and events are driven by the test
#[derive(Default)]
pub struct FakeTransport {
    devices: Mutex<Vec<Arc<FakeDevice>>>,
    listeners: Mutex<Vec<Arc<dyn BridgeListener>>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn listeners(&self) -> Vec<Arc<dyn BridgeListener>> {
        self.listeners.lock().clone()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Replace the device list without raising any event, as after a bridge restart
    pub fn set_snapshot(&self, devices: Vec<Arc<FakeDevice>>) {
        *self.devices.lock() = devices;
    }

    pub fn attach(&self, device: Arc<FakeDevice>) {
        self.devices.lock().push(Arc::clone(&device));
        for listener in self.listeners() {
            listener.on_device_connected(device.clone());
        }
    }

    pub fn detach(&self, serial: &str) {
        let removed = {
            let mut devices = self.devices.lock();
            let position = devices.iter().position(|d| d.serial_number() == serial);
            position.map(|p| devices.remove(p))
        };
        if let Some(device) = removed {
            for listener in self.listeners() {
                listener.on_device_disconnected(device.clone());
            }
        }
    }

    pub fn change(&self, device: &Arc<FakeDevice>, change: DeviceChange) {
        for listener in self.listeners() {
            listener.on_device_changed(device.clone(), change);
        }
    }

    pub fn client_changed(&self, client: ClientInfo, change: ClientChange) {
        for listener in self.listeners() {
            listener.on_client_changed(client.clone(), change);
        }
    }
}

#[async_trait]
impl BridgeTransport for FakeTransport {
    async fn devices(&self) -> Result<Vec<Arc<dyn DeviceHandle>>, TransportError> {
        Ok(self
            .devices
            .lock()
            .iter()
            .map(|d| Arc::clone(d) as Arc<dyn DeviceHandle>)
            .collect())
    }

    fn add_listener(&self, listener: Arc<dyn BridgeListener>) {
        self.listeners.lock().push(listener);
    }
}

/// Listener that records every callback it receives
#[derive(Default)]
pub struct RecordingListener {
    calls: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl DeviceStartListener for RecordingListener {
    fn on_device_start(&self, device: Arc<DeviceProfile>) {
        self.calls.lock().push(format!("start:{}", device.name()));
    }

    fn on_error(&self, message: &str) {
        self.calls.lock().push(format!("error:{}", message));
    }

    fn on_timeout(&self, name: &str) {
        self.calls.lock().push(format!("timeout:{}", name));
    }
}

/// Fast polling so tests finish in milliseconds
pub fn fast_config(poll_ms: u64, max_start_ms: u64) -> DeviceConfig {
    DeviceConfig {
        poll_interval_ms: poll_ms,
        max_start_time_ms: max_start_ms,
        shell_timeout_ms: 100,
        transfer_timeout_ms: 1000,
        ..DeviceConfig::default()
    }
}

pub async fn started_context(config: DeviceConfig, transport: &Arc<FakeTransport>) -> DeviceContext {
    let context = DeviceContext::from_current(config).unwrap();
    let bridge: Arc<dyn BridgeTransport> = transport.clone();
    context.monitor().start(bridge).await.unwrap();
    context
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
