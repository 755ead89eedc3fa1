//! Debug bridge transport contract
//!
//! The bridge itself is an external collaborator. These traits describe
//! what the lifecycle manager needs from it: an enumeration snapshot, an
//! event stream delivered through [`BridgeListener`], and per-device
//! shell / file-transfer / forwarding primitives.

use std::fmt;
use std::ops::BitOr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Errors raised by a transport primitive
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The bridge refused the command, usually because the device dropped
    #[error("command rejected: {0}")]
    Rejected(String),
    #[error("device did not answer in time")]
    Timeout,
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("sync failed: {0}")]
    Sync(String),
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Which aspects of a device changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceChange(u32);

impl DeviceChange {
    /// Online/offline/unauthorized state
    pub const STATE: DeviceChange = DeviceChange(0x0001);
    /// Client (process) list
    pub const CLIENT_LIST: DeviceChange = DeviceChange(0x0002);
    /// Build properties became available
    pub const BUILD_INFO: DeviceChange = DeviceChange(0x0004);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: DeviceChange) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DeviceChange {
    type Output = DeviceChange;

    fn bitor(self, rhs: DeviceChange) -> DeviceChange {
        DeviceChange(self.0 | rhs.0)
    }
}

/// Which aspects of a client changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientChange(u32);

impl ClientChange {
    pub const NAME: ClientChange = ClientChange(0x0001);
    pub const DEBUGGER_STATUS: ClientChange = ClientChange(0x0002);

    pub fn contains(&self, other: ClientChange) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ClientChange {
    type Output = ClientChange;

    fn bitor(self, rhs: ClientChange) -> ClientChange {
        ClientChange(self.0 | rhs.0)
    }
}

/// Debugger attachment of a client process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerStatus {
    Default,
    /// Suspended until a debugger attaches
    Waiting,
    Attached,
    Error,
}

/// A debuggable process running on a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub serial: String,
    pub pid: u32,
    pub app_name: Option<String>,
    pub debugger: DebuggerStatus,
}

/// Receives shell command output as it is produced
pub trait ShellOutputReceiver: Send + Sync {
    fn add_output(&self, data: &[u8]);
    /// Called once the command has finished producing output
    fn flush(&self);
    fn is_cancelled(&self) -> bool;
}

/// Progress callbacks for a single file transfer
pub trait SyncProgressMonitor: Send + Sync {
    fn start(&self, total_work: u64);
    fn advance(&self, work: u64);
    fn is_cancelled(&self) -> bool;
}

/// File push/pull service for one device
#[async_trait]
pub trait SyncService: Send + Sync {
    async fn push_file(
        &self,
        local: &Path,
        remote: &str,
        monitor: &dyn SyncProgressMonitor,
    ) -> Result<(), TransportError>;

    async fn pull_file(
        &self,
        remote: &str,
        local: &Path,
        monitor: &dyn SyncProgressMonitor,
    ) -> Result<(), TransportError>;
}

/// A device as seen by the bridge
#[async_trait]
pub trait DeviceHandle: Send + Sync + fmt::Debug {
    fn serial_number(&self) -> &str;

    fn is_emulator(&self) -> bool;

    async fn is_online(&self) -> bool;

    async fn is_offline(&self) -> bool;

    async fn property(&self, key: &str) -> Result<Option<String>, TransportError>;

    /// AVD name of an emulator; `None` until boot has progressed far enough
    async fn avd_name(&self) -> Option<String>;

    /// Run `command`, streaming output into `receiver`, and flush it on completion
    async fn execute_shell_command(
        &self,
        command: &str,
        receiver: Arc<dyn ShellOutputReceiver>,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    async fn sync_service(&self) -> Result<Box<dyn SyncService>, TransportError>;

    async fn create_forward(&self, local_port: u16, remote_port: u16) -> Result<(), TransportError>;
}

/// Callbacks delivered on the transport's own thread.
///
/// Implementations must return quickly and hand real work off elsewhere.
pub trait BridgeListener: Send + Sync {
    fn on_device_connected(&self, device: Arc<dyn DeviceHandle>);
    fn on_device_disconnected(&self, device: Arc<dyn DeviceHandle>);
    fn on_device_changed(&self, device: Arc<dyn DeviceHandle>, change: DeviceChange);
    fn on_client_changed(&self, client: ClientInfo, change: ClientChange);
}

/// The debug bridge connection
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    /// Devices currently known to the bridge
    async fn devices(&self) -> Result<Vec<Arc<dyn DeviceHandle>>, TransportError>;

    fn add_listener(&self, listener: Arc<dyn BridgeListener>);
}
