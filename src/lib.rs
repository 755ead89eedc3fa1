//! devlink - Android device connection lifecycle manager
//!
//! ## Architecture
//!
//! - `devlink-core`: configuration, error taxonomy, event bus
//! - `devlink-device-bridge`: device registry, connection tracker, bridge
//!   monitor, launch coordinator and the adb-backed transport
//!
//! This crate adds the `devlink` command line on top of them.

#![warn(clippy::all)]

pub mod commands;

pub use devlink_core as core;
pub use devlink_device_bridge as bridge;

/// Prelude module for convenient imports
pub mod prelude {
    pub use devlink_core::{AppConfig, DeviceConfig, DevlinkError};
    pub use devlink_device_bridge::{
        AdbBridge, AdbClient, ConnectionState, DeviceContext, DeviceEvent, DeviceProfile, EmulatorLauncher,
        LaunchInfo, LaunchOutcome,
    };
}
