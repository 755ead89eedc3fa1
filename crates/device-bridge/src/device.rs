//! Device Profiles
//!
//! A profile is the long-lived identity of a device, keyed by its logical
//! name. Connection state lives in the tracker, not here.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::launch::{LaunchInfo, Launcher};

/// Device type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// Physical device connected via USB/WiFi
    Physical,
    /// Android emulator
    Emulator,
}

/// Mutable metadata of a profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDetails {
    /// Human-facing name (AVD display name or device model)
    pub display_name: String,
    /// Platform identifier, e.g. "android-34"
    pub target_hash: Option<String>,
    /// SDK/API level
    pub api_level: Option<u32>,
}

/// The launch currently bound to a profile
#[derive(Clone)]
struct ActiveLaunch {
    app_name: String,
    launcher: Arc<dyn Launcher>,
}

/// One device instance, identified by its logical name.
///
/// Equality and hashing use the name only.
pub struct DeviceProfile {
    name: String,
    device_type: DeviceType,
    details: RwLock<ProfileDetails>,
    launch: Mutex<Option<ActiveLaunch>>,
}

impl DeviceProfile {
    pub fn new(name: impl Into<String>, device_type: DeviceType, details: ProfileDetails) -> Self {
        let name = name.into();
        let mut details = details;
        if details.display_name.is_empty() {
            details.display_name = name.replace('_', " ");
        }

        Self {
            name,
            device_type,
            details: RwLock::new(details),
            launch: Mutex::new(None),
        }
    }

    /// Profile for a physical device, named by its serial number
    pub fn physical(serial: impl Into<String>) -> Self {
        let serial = serial.into();
        let details = ProfileDetails {
            display_name: serial.clone(),
            ..Default::default()
        };
        Self::new(serial, DeviceType::Physical, details)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Check if this is an emulator
    pub fn is_emulator(&self) -> bool {
        self.device_type == DeviceType::Emulator
    }

    pub fn details(&self) -> ProfileDetails {
        self.details.read().clone()
    }

    pub fn display_name(&self) -> String {
        self.details.read().display_name.clone()
    }

    pub fn api_level(&self) -> Option<u32> {
        self.details.read().api_level
    }

    pub fn target_hash(&self) -> Option<String> {
        self.details.read().target_hash.clone()
    }

    /// Apply metadata learned from the device or its AVD config
    pub fn update_details<F>(&self, updater: F)
    where
        F: FnOnce(&mut ProfileDetails),
    {
        let mut details = self.details.write();
        updater(&mut details);
    }

    /// Bind a launch to this profile, replacing any previous one
    pub fn attach_launch(&self, info: &LaunchInfo) {
        *self.launch.lock() = Some(ActiveLaunch {
            app_name: info.app_name.clone(),
            launcher: Arc::clone(&info.launcher),
        });
    }

    /// Clear the launch fields once the launch has ended
    pub fn reset_launch(&self) {
        self.launch.lock().take();
    }

    /// Name of the application being launched, if any
    pub fn launching_app(&self) -> Option<String> {
        self.launch.lock().as_ref().map(|l| l.app_name.clone())
    }

    pub fn launcher(&self) -> Option<Arc<dyn Launcher>> {
        self.launch.lock().as_ref().map(|l| Arc::clone(&l.launcher))
    }
}

impl PartialEq for DeviceProfile {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for DeviceProfile {}

impl Hash for DeviceProfile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceProfile")
            .field("name", &self.name)
            .field("device_type", &self.device_type)
            .field("details", &*self.details.read())
            .field("launching", &self.launching_app())
            .finish()
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let details = self.details.read();
        if details.display_name == self.name {
            f.write_str(&self.name)
        } else {
            write!(f, "{} ({})", details.display_name, self.name)
        }
    }
}
