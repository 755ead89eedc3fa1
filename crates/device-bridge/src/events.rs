//! Device lifecycle events published on the event bus

use serde::{Deserialize, Serialize};

use crate::state::ConnectionState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// The bridge reported a serial that is now being tracked
    Connected { serial: String },
    /// A serial moved between readiness phases
    StateChanged {
        serial: String,
        name: Option<String>,
        from: ConnectionState,
        to: ConnectionState,
    },
    /// A device finished booting and is registered under `name`
    Ready { serial: String, name: String },
    /// The bridge no longer reports the serial
    Disconnected { serial: String, name: Option<String> },
}

impl DeviceEvent {
    pub fn serial(&self) -> &str {
        match self {
            DeviceEvent::Connected { serial }
            | DeviceEvent::StateChanged { serial, .. }
            | DeviceEvent::Ready { serial, .. }
            | DeviceEvent::Disconnected { serial, .. } => serial,
        }
    }
}
