//! ADB (Android Debug Bridge) transport
//!
//! A [`BridgeTransport`] backed by the `adb` command line tool. The device
//! list comes from `adb devices -l`; [`AdbBridge::watch`] polls it and turns
//! the differences between snapshots into listener callbacks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{
    BridgeListener, BridgeTransport, DeviceChange, DeviceHandle, ShellOutputReceiver, SyncProgressMonitor,
    SyncService, TransportError,
};

/// ADB errors
#[derive(Debug, thiserror::Error)]
pub enum AdbError {
    #[error("ADB not found")]
    NotFound,
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("ADB command failed: {0}")]
    CommandFailed(String),
    #[error("ADB command timed out after {0:?}")]
    Timeout(Duration),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<AdbError> for TransportError {
    fn from(e: AdbError) -> Self {
        match e {
            AdbError::DeviceNotFound(serial) => TransportError::DeviceNotFound(serial),
            AdbError::CommandFailed(msg) if is_rejection(&msg) => TransportError::Rejected(msg),
            AdbError::CommandFailed(msg) => TransportError::Io(msg),
            AdbError::Timeout(_) => TransportError::Timeout,
            other => TransportError::Io(other.to_string()),
        }
    }
}

/// adb's own complaints about the device rather than the command
fn is_rejection(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    ["device offline", "not found", "unauthorized", "no devices/emulators"]
        .iter()
        .any(|marker| stderr.contains(marker))
}

/// Device state as printed by `adb devices`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdbState {
    /// Device is online and ready
    Online,
    Offline,
    /// Not authorized (need to accept on device)
    Unauthorized,
    Bootloader,
    Recovery,
    Unknown,
}

impl AdbState {
    pub fn parse(s: &str) -> Self {
        match s {
            "device" => AdbState::Online,
            "offline" => AdbState::Offline,
            "unauthorized" => AdbState::Unauthorized,
            "bootloader" => AdbState::Bootloader,
            "recovery" => AdbState::Recovery,
            _ => AdbState::Unknown,
        }
    }
}

/// One line of `adb devices -l`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbDeviceEntry {
    pub serial: String,
    pub state: AdbState,
    pub model: Option<String>,
    pub product: Option<String>,
}

/// Parse the output of `adb devices -l`
pub fn parse_devices(output: &str) -> Vec<AdbDeviceEntry> {
    let mut devices = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("List of devices") || line.starts_with('*') {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }

        let mut model = None;
        let mut product = None;
        for part in parts.iter().skip(2) {
            if let Some(value) = part.strip_prefix("model:") {
                model = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("product:") {
                product = Some(value.to_string());
            }
        }

        devices.push(AdbDeviceEntry {
            serial: parts[0].to_string(),
            state: AdbState::parse(parts[1]),
            model,
            product,
        });
    }

    devices
}

/// First line of `adb emu avd name`, unless the console answered with an error
pub fn parse_avd_name(output: &str) -> Option<String> {
    let first = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    if first == "OK" || first.starts_with("KO") || first.contains("error") {
        return None;
    }
    Some(first.to_string())
}

/// What changed between two `adb devices` snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotChange {
    Added(String),
    Removed(String),
    StateChanged(String),
}

pub fn diff_snapshots(previous: &HashMap<String, AdbState>, current: &[AdbDeviceEntry]) -> Vec<SnapshotChange> {
    let mut changes = Vec::new();

    for entry in current {
        match previous.get(&entry.serial) {
            None => changes.push(SnapshotChange::Added(entry.serial.clone())),
            Some(state) if *state != entry.state => {
                changes.push(SnapshotChange::StateChanged(entry.serial.clone()))
            }
            Some(_) => {}
        }
    }

    let mut removed: Vec<&String> = previous
        .keys()
        .filter(|serial| !current.iter().any(|e| &e.serial == *serial))
        .collect();
    removed.sort();
    changes.extend(removed.into_iter().map(|s| SnapshotChange::Removed(s.clone())));

    changes
}

/// ADB Client
#[derive(Debug, Clone)]
pub struct AdbClient {
    adb_path: PathBuf,
}

impl AdbClient {
    /// Client for the `adb` of the SDK at `sdk_path`
    pub fn new(sdk_path: &Path) -> Self {
        let platform_tools = sdk_path.join("platform-tools");
        let adb_path = if cfg!(windows) {
            platform_tools.join("adb.exe")
        } else {
            platform_tools.join("adb")
        };
        Self { adb_path }
    }

    pub fn adb_path(&self) -> &Path {
        &self.adb_path
    }

    pub fn is_available(&self) -> bool {
        self.adb_path.exists()
    }

    fn command(&self) -> Result<Command, AdbError> {
        if !self.adb_path.exists() {
            return Err(AdbError::NotFound);
        }
        let mut command = Command::new(&self.adb_path);
        command.kill_on_drop(true);
        Ok(command)
    }

    /// Run an ADB command
    pub async fn run(&self, args: &[&str]) -> Result<String, AdbError> {
        debug!("adb {:?}", args);

        let output = self.command()?.args(args).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AdbError::CommandFailed(stderr.trim().to_string()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run an ADB command for a specific device
    pub async fn run_for_device(&self, serial: &str, args: &[&str]) -> Result<String, AdbError> {
        let mut full_args = vec!["-s", serial];
        full_args.extend(args);
        self.run(&full_args).await
    }

    pub async fn start_server(&self) -> Result<(), AdbError> {
        self.run(&["start-server"]).await?;
        Ok(())
    }

    /// List connected devices
    pub async fn list_devices(&self) -> Result<Vec<AdbDeviceEntry>, AdbError> {
        let output = self.run(&["devices", "-l"]).await?;
        Ok(parse_devices(&output))
    }
}

/// Upper bound on state, property and AVD name queries
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// A device handle that talks to `adb -s <serial>`
#[derive(Debug)]
pub struct AdbDevice {
    client: AdbClient,
    serial: String,
    query_timeout: Duration,
}

impl AdbDevice {
    pub fn new(client: AdbClient, serial: impl Into<String>, query_timeout: Duration) -> Self {
        Self {
            client,
            serial: serial.into(),
            query_timeout,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Short adb request; the child is killed if it outlives `query_timeout`
    async fn query(&self, args: &[&str]) -> Result<String, AdbError> {
        tokio::time::timeout(self.query_timeout, self.client.run_for_device(&self.serial, args))
            .await
            .map_err(|_| AdbError::Timeout(self.query_timeout))?
    }

    async fn state(&self) -> AdbState {
        match self.query(&["get-state"]).await {
            Ok(output) => AdbState::parse(output.trim()),
            Err(e) => {
                debug!("[{}] get-state failed: {}", self.serial, e);
                AdbState::Unknown
            }
        }
    }
}

#[async_trait]
impl DeviceHandle for AdbDevice {
    fn serial_number(&self) -> &str {
        &self.serial
    }

    fn is_emulator(&self) -> bool {
        self.serial.starts_with("emulator-")
    }

    async fn is_online(&self) -> bool {
        self.state().await == AdbState::Online
    }

    async fn is_offline(&self) -> bool {
        self.state().await == AdbState::Offline
    }

    async fn property(&self, key: &str) -> Result<Option<String>, TransportError> {
        let output = self.query(&["shell", "getprop", key]).await?;
        let value = output.trim();
        Ok((!value.is_empty()).then(|| value.to_string()))
    }

    async fn avd_name(&self) -> Option<String> {
        if !self.is_emulator() {
            return None;
        }
        match self.query(&["emu", "avd", "name"]).await {
            Ok(output) => parse_avd_name(&output),
            Err(e) => {
                debug!("[{}] AVD name not available: {}", self.serial, e);
                None
            }
        }
    }

    async fn execute_shell_command(
        &self,
        command: &str,
        receiver: Arc<dyn ShellOutputReceiver>,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut child = self
            .client
            .command()?
            .args(["-s", self.serial.as_str(), "shell", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child.stdout.take();
        let run = async {
            if let Some(mut stdout) = stdout {
                let mut buf = [0u8; 4096];
                loop {
                    let n = stdout.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    receiver.add_output(&buf[..n]);
                    if receiver.is_cancelled() {
                        return Ok::<_, std::io::Error>(None);
                    }
                }
            }
            child.wait_with_output().await.map(Some)
        };

        let output = match tokio::time::timeout(timeout, run).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout),
        };

        let Some(output) = output else {
            debug!("[{}] shell `{}` cancelled", self.serial, command);
            return Ok(());
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_rejection(&stderr) {
                return Err(TransportError::Rejected(stderr));
            }
        }

        receiver.flush();
        Ok(())
    }

    async fn sync_service(&self) -> Result<Box<dyn SyncService>, TransportError> {
        Ok(Box::new(AdbSync {
            client: self.client.clone(),
            serial: self.serial.clone(),
        }))
    }

    async fn create_forward(&self, local_port: u16, remote_port: u16) -> Result<(), TransportError> {
        let local = format!("tcp:{}", local_port);
        let remote = format!("tcp:{}", remote_port);
        self.client
            .run_for_device(&self.serial, &["forward", &local, &remote])
            .await?;
        Ok(())
    }
}

/// `adb push` / `adb pull`, one file per call
struct AdbSync {
    client: AdbClient,
    serial: String,
}

impl AdbSync {
    async fn transfer(&self, args: &[&str], size: u64, monitor: &dyn SyncProgressMonitor) -> Result<(), TransportError> {
        if monitor.is_cancelled() {
            return Err(TransportError::Sync("cancelled".to_string()));
        }

        monitor.start(size);
        self.client
            .run_for_device(&self.serial, args)
            .await
            .map_err(|e| match e {
                AdbError::CommandFailed(msg) => TransportError::Sync(msg),
                other => other.into(),
            })?;
        monitor.advance(size);
        Ok(())
    }
}

#[async_trait]
impl SyncService for AdbSync {
    async fn push_file(
        &self,
        local: &Path,
        remote: &str,
        monitor: &dyn SyncProgressMonitor,
    ) -> Result<(), TransportError> {
        let size = tokio::fs::metadata(local).await?.len();
        let local = local.to_string_lossy();
        self.transfer(&["push", &local, remote], size, monitor).await
    }

    async fn pull_file(
        &self,
        remote: &str,
        local: &Path,
        monitor: &dyn SyncProgressMonitor,
    ) -> Result<(), TransportError> {
        let local = local.to_string_lossy();
        self.transfer(&["pull", remote, &local], 1, monitor).await
    }
}

/// Bridge transport over the adb CLI
pub struct AdbBridge {
    client: AdbClient,
    query_timeout: Duration,
    known: RwLock<HashMap<String, (Arc<AdbDevice>, AdbState)>>,
    listeners: RwLock<Vec<Arc<dyn BridgeListener>>>,
}

impl AdbBridge {
    pub fn new(client: AdbClient) -> Self {
        Self {
            client,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            known: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Bound the per-device queries made by the handles this bridge hands out
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn client(&self) -> &AdbClient {
        &self.client
    }

    /// Poll `adb devices` every `interval` until `token` is cancelled
    pub async fn watch(&self, interval: Duration, token: CancellationToken) {
        info!("Watching adb devices every {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.refresh().await {
                warn!("adb devices failed: {}", e);
            }
        }
        debug!("adb watcher stopped");
    }

    /// Take a snapshot, notify listeners of what changed and return the handles
    async fn refresh(&self) -> Result<Vec<Arc<AdbDevice>>, AdbError> {
        let entries = self.client.list_devices().await?;

        let (changes, handles, removed) = {
            let mut known = self.known.write();
            let previous: HashMap<String, AdbState> =
                known.iter().map(|(s, (_, state))| (s.clone(), *state)).collect();
            let changes = diff_snapshots(&previous, &entries);

            let mut removed = Vec::new();
            for change in &changes {
                if let SnapshotChange::Removed(serial) = change {
                    if let Some((device, _)) = known.remove(serial) {
                        removed.push(device);
                    }
                }
            }

            let mut handles = Vec::with_capacity(entries.len());
            for entry in &entries {
                let slot = known.entry(entry.serial.clone()).or_insert_with(|| {
                    (
                        Arc::new(AdbDevice::new(
                            self.client.clone(),
                            entry.serial.clone(),
                            self.query_timeout,
                        )),
                        entry.state,
                    )
                });
                slot.1 = entry.state;
                handles.push(Arc::clone(&slot.0));
            }
            (changes, handles, removed)
        };

        if !changes.is_empty() {
            self.notify(&changes, &handles, &removed);
        }
        Ok(handles)
    }

    fn notify(&self, changes: &[SnapshotChange], handles: &[Arc<AdbDevice>], removed: &[Arc<AdbDevice>]) {
        let listeners = self.listeners.read().clone();
        let find = |list: &[Arc<AdbDevice>], serial: &str| list.iter().find(|d| d.serial == serial).cloned();

        for change in changes {
            match change {
                SnapshotChange::Added(serial) => {
                    if let Some(device) = find(handles, serial) {
                        debug!("[{}] adb: attached", serial);
                        for listener in &listeners {
                            listener.on_device_connected(device.clone());
                        }
                    }
                }
                SnapshotChange::StateChanged(serial) => {
                    if let Some(device) = find(handles, serial) {
                        debug!("[{}] adb: state changed", serial);
                        for listener in &listeners {
                            listener.on_device_changed(device.clone(), DeviceChange::STATE);
                        }
                    }
                }
                SnapshotChange::Removed(serial) => {
                    if let Some(device) = find(removed, serial) {
                        debug!("[{}] adb: detached", serial);
                        for listener in &listeners {
                            listener.on_device_disconnected(device.clone());
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BridgeTransport for AdbBridge {
    async fn devices(&self) -> Result<Vec<Arc<dyn DeviceHandle>>, TransportError> {
        let handles = self.refresh().await?;
        Ok(handles
            .into_iter()
            .map(|d| d as Arc<dyn DeviceHandle>)
            .collect())
    }

    fn add_listener(&self, listener: Arc<dyn BridgeListener>) {
        self.listeners.write().push(listener);
    }
}

impl std::fmt::Debug for AdbBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbBridge")
            .field("adb", &self.client.adb_path)
            .field("devices", &self.known.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES: &str = "List of devices attached\n\
        emulator-5554          device product:sdk_gphone64_x86_64 model:sdk_gphone64_x86_64 device:emu64xa transport_id:1\n\
        R58M123ABC             unauthorized usb:1-1 transport_id:2\n\
        \n";

    #[test]
    fn test_parse_devices() {
        let devices = parse_devices(DEVICES);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].serial, "emulator-5554");
        assert_eq!(devices[0].state, AdbState::Online);
        assert_eq!(devices[0].model.as_deref(), Some("sdk_gphone64_x86_64"));
        assert_eq!(devices[1].state, AdbState::Unauthorized);
        assert_eq!(devices[1].model, None);
    }

    #[test]
    fn test_parse_daemon_banner() {
        let output = "* daemon not running; starting now at tcp:5037\n* daemon started successfully\nList of devices attached\n\n";
        assert!(parse_devices(output).is_empty());
    }

    #[test]
    fn test_parse_avd_name() {
        assert_eq!(parse_avd_name("Pixel_7_API_34\r\nOK\r\n").as_deref(), Some("Pixel_7_API_34"));
        assert_eq!(parse_avd_name("OK\n"), None);
        assert_eq!(parse_avd_name("KO: unknown command\n"), None);
        assert_eq!(parse_avd_name(""), None);
    }

    #[test]
    fn test_diff_snapshots() {
        let previous: HashMap<String, AdbState> = [
            ("A".to_string(), AdbState::Online),
            ("B".to_string(), AdbState::Offline),
        ]
        .into_iter()
        .collect();
        let current = parse_devices("B device\nC offline\n");

        let changes = diff_snapshots(&previous, &current);
        assert_eq!(
            changes,
            vec![
                SnapshotChange::StateChanged("B".into()),
                SnapshotChange::Added("C".into()),
                SnapshotChange::Removed("A".into()),
            ]
        );
    }

    #[test]
    fn test_rejection_mapping() {
        let err: TransportError = AdbError::CommandFailed("error: device offline".into()).into();
        assert!(matches!(err, TransportError::Rejected(_)));
        let err: TransportError = AdbError::CommandFailed("permission denied".into()).into();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[test]
    fn test_client_path() {
        let client = AdbClient::new(Path::new("/opt/sdk"));
        assert!(client.adb_path().ends_with(if cfg!(windows) { "adb.exe" } else { "adb" }));
        assert!(!client.is_available());
    }

    #[test]
    fn test_timeout_mapping() {
        let err: TransportError = AdbError::Timeout(Duration::from_millis(100)).into();
        assert!(matches!(err, TransportError::Timeout));
    }

    /// An SDK whose `adb` sleeps instead of answering
    #[cfg(unix)]
    fn hanging_sdk() -> tempfile::TempDir {
        use std::os::unix::fs::PermissionsExt;

        let sdk = tempfile::tempdir().unwrap();
        let tools = sdk.path().join("platform-tools");
        std::fs::create_dir_all(&tools).unwrap();
        let adb = tools.join("adb");
        std::fs::write(&adb, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&adb, std::fs::Permissions::from_mode(0o755)).unwrap();
        sdk
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_device_queries_give_up_on_a_stuck_adb() {
        let sdk = hanging_sdk();
        let device = AdbDevice::new(
            AdbClient::new(sdk.path()),
            "emulator-5554",
            Duration::from_millis(200),
        );

        let started = std::time::Instant::now();
        assert!(!device.is_online().await);
        assert!(!device.is_offline().await);
        assert_eq!(device.avd_name().await, None);
        assert!(matches!(
            device.property("sys.boot_completed").await,
            Err(TransportError::Timeout)
        ));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_bridge_query_timeout() {
        let bridge = AdbBridge::new(AdbClient::new(Path::new("/opt/sdk")));
        assert_eq!(bridge.query_timeout, DEFAULT_QUERY_TIMEOUT);
        let bridge = bridge.with_query_timeout(Duration::from_millis(750));
        assert_eq!(bridge.query_timeout, Duration::from_millis(750));
    }
}
