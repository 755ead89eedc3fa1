//! Device Registry
//!
//! Authoritative set of device profiles, independent of connection state.
//! Profiles are created lazily on first lookup and never removed, so a
//! device that disconnects keeps its identity and metadata when it returns.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::avd::AvdInfo;
use crate::device::{DeviceProfile, DeviceType};

#[derive(Default)]
pub struct DeviceRegistry {
    profiles: RwLock<HashMap<String, Arc<DeviceProfile>>>,
    avds: RwLock<HashMap<String, AvdInfo>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember AVD metadata used when emulator profiles are created.
    ///
    /// Existing emulator profiles only get fields they are still missing.
    pub fn load_avds(&self, avds: impl IntoIterator<Item = AvdInfo>) {
        let mut known = self.avds.write();
        let profiles = self.profiles.read();

        for avd in avds {
            if let Some(profile) = profiles.get(&avd.name) {
                let details = avd.profile_details();
                profile.update_details(|current| {
                    if current.api_level.is_none() {
                        current.api_level = details.api_level;
                    }
                    if current.target_hash.is_none() {
                        current.target_hash = details.target_hash;
                    }
                });
            }
            known.insert(avd.name.clone(), avd);
        }
    }

    pub fn avd(&self, name: &str) -> Option<AvdInfo> {
        self.avds.read().get(name).cloned()
    }

    pub fn avd_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.avds.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the emulator profile for `avd_name`, creating it on first use
    pub fn get_or_create_emulator_profile(&self, avd_name: &str) -> Arc<DeviceProfile> {
        if let Some(profile) = self.get(avd_name) {
            return profile;
        }

        let details = self
            .avds
            .read()
            .get(avd_name)
            .map(AvdInfo::profile_details)
            .unwrap_or_default();

        self.get_or_insert(avd_name, || {
            DeviceProfile::new(avd_name, DeviceType::Emulator, details)
        })
    }

    /// Get the physical profile for `name` (its serial), creating it on first use
    pub fn get_or_create_physical_profile(&self, name: &str) -> Arc<DeviceProfile> {
        if let Some(profile) = self.get(name) {
            return profile;
        }

        self.get_or_insert(name, || DeviceProfile::physical(name))
    }

    fn get_or_insert<F>(&self, name: &str, create: F) -> Arc<DeviceProfile>
    where
        F: FnOnce() -> DeviceProfile,
    {
        let mut profiles = self.profiles.write();
        Arc::clone(profiles.entry(name.to_string()).or_insert_with(|| {
            let profile = create();
            debug!("Registered {:?} profile {}", profile.device_type(), name);
            Arc::new(profile)
        }))
    }

    pub fn get(&self, name: &str) -> Option<Arc<DeviceProfile>> {
        self.profiles.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.profiles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All profiles, in no particular order
    pub fn all_profiles(&self) -> Vec<Arc<DeviceProfile>> {
        self.profiles.read().values().cloned().collect()
    }

    /// All profiles ordered by `compare`
    pub fn all_profiles_by<F>(&self, mut compare: F) -> Vec<Arc<DeviceProfile>>
    where
        F: FnMut(&DeviceProfile, &DeviceProfile) -> Ordering,
    {
        let mut profiles = self.all_profiles();
        profiles.sort_by(|a, b| compare(a, b));
        profiles
    }

    /// Emulators first, then physical devices, each by display name
    pub fn all_profiles_sorted(&self) -> Vec<Arc<DeviceProfile>> {
        self.all_profiles_by(default_order)
    }
}

/// Default listing order: emulators before physical devices, then by
/// display name, then by logical name
pub fn default_order(a: &DeviceProfile, b: &DeviceProfile) -> Ordering {
    let rank = |p: &DeviceProfile| if p.is_emulator() { 0 } else { 1 };
    rank(a)
        .cmp(&rank(b))
        .then_with(|| a.display_name().to_lowercase().cmp(&b.display_name().to_lowercase()))
        .then_with(|| a.name().cmp(b.name()))
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("profiles", &self.len())
            .field("avds", &self.avds.read().len())
            .finish()
    }
}
