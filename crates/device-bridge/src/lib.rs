//! devlink device bridge
//!
//! Device connection lifecycle management:
//! - Device registry (profiles, AVD metadata)
//! - Connection tracker (per-serial readiness state machine)
//! - Bridge monitor (transport adapter, shell, file transfer)
//! - Launch coordinator (start a device, wait for it to be ready)
//! - ADB-backed transport and emulator launcher

pub mod adb;
pub mod avd;
pub mod compat;
pub mod context;
pub mod device;
pub mod emulator;
pub mod events;
pub mod index;
pub mod launch;
pub mod listener;
pub mod monitor;
pub mod registry;
pub mod scheduler;
pub mod shell;
pub mod state;
pub mod status;
pub mod tracker;
pub mod transfer;
pub mod transport;

pub use adb::{AdbBridge, AdbClient, AdbDevice, AdbError, DEFAULT_QUERY_TIMEOUT};
pub use avd::{AvdCatalog, AvdError, AvdInfo};
pub use compat::{is_compatible, ProjectRequirements};
pub use context::DeviceContext;
pub use device::{DeviceProfile, DeviceType, ProfileDetails};
pub use emulator::{EmulatorLauncher, EmulatorOptions};
pub use events::DeviceEvent;
pub use launch::{ChannelListener, LaunchCoordinator, LaunchError, LaunchInfo, LaunchOutcome, Launcher, PhysicalLauncher};
pub use listener::{DeviceStartListener, PendingLaunch};
pub use monitor::BridgeMonitor;
pub use registry::DeviceRegistry;
pub use scheduler::Scheduler;
pub use shell::ProcessError;
pub use state::ConnectionState;
pub use status::{Severity, Status};
pub use tracker::ConnectionTracker;
pub use transfer::{FileTransferResult, TransferReport};
pub use transport::{
    BridgeListener, BridgeTransport, ClientChange, ClientInfo, DebuggerStatus, DeviceChange, DeviceHandle,
    ShellOutputReceiver, SyncProgressMonitor, SyncService, TransportError,
};

/// Default ADB port
pub const DEFAULT_ADB_PORT: u16 = 5037;

/// Emulator console port range
pub const EMULATOR_PORT_RANGE: std::ops::Range<u16> = 5554..5586;

/// Get next available emulator console port
pub fn next_emulator_port(used_ports: &[u16]) -> Option<u16> {
    EMULATOR_PORT_RANGE
        .step_by(2)
        .find(|port| !used_ports.contains(port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_emulator_port() {
        assert_eq!(next_emulator_port(&[]), Some(5554));
        assert_eq!(next_emulator_port(&[5554, 5556]), Some(5558));
        let all: Vec<u16> = EMULATOR_PORT_RANGE.step_by(2).collect();
        assert_eq!(next_emulator_port(&all), None);
    }
}
