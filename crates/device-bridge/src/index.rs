//! Serial ↔ name index
//!
//! Devices are reported by the bridge under a transport serial number but
//! addressed by callers under their logical name (AVD name for emulators,
//! serial number for physical devices). Both directions live behind a
//! single lock so they can never disagree.
//!
//! An entry is added once the logical name of a connected serial is known
//! and removed when that serial disconnects.

use std::collections::HashMap;

use parking_lot::RwLock;

#[derive(Default)]
struct Entries {
    by_serial: HashMap<String, String>,
    by_name: HashMap<String, String>,
}

/// Bidirectional serial ↔ logical name index
#[derive(Default)]
pub struct SerialIndex {
    entries: RwLock<Entries>,
}

impl SerialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `serial` to `name`, dropping any stale binding either side had
    pub fn insert(&self, serial: &str, name: &str) {
        let mut entries = self.entries.write();

        if let Some(old_name) = entries.by_serial.remove(serial) {
            entries.by_name.remove(&old_name);
        }
        if let Some(old_serial) = entries.by_name.remove(name) {
            entries.by_serial.remove(&old_serial);
        }

        entries.by_serial.insert(serial.to_string(), name.to_string());
        entries.by_name.insert(name.to_string(), serial.to_string());
    }

    /// Remove the binding for `serial`, returning the name it was bound to
    pub fn remove_serial(&self, serial: &str) -> Option<String> {
        let mut entries = self.entries.write();
        let name = entries.by_serial.remove(serial)?;
        entries.by_name.remove(&name);
        Some(name)
    }

    pub fn name_of(&self, serial: &str) -> Option<String> {
        self.entries.read().by_serial.get(serial).cloned()
    }

    pub fn serial_of(&self, name: &str) -> Option<String> {
        self.entries.read().by_name.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().by_serial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
