//! Connection State
//!
//! Readiness phases a device walks through after the bridge reports it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-serial connection state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not attached to the bridge (initial state, re-entered on disconnect)
    Disconnected,
    /// Reported by the bridge but not yet responsive
    Connecting,
    /// Emulator whose AVD name cannot be queried yet
    WaitingForAvdName,
    /// Booting; waiting for the package manager to answer
    WaitingForPackageManager,
    /// Able to install and run applications
    Ready,
    /// Gave up waiting for readiness
    Failed(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::WaitingForAvdName => "waiting-for-avd-name",
            ConnectionState::WaitingForPackageManager => "waiting-for-package-manager",
            ConnectionState::Ready => "ready",
            ConnectionState::Failed(_) => "failed",
        }
    }

    /// Ready and Failed end a readiness attempt
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Failed(_))
    }

    /// States in which a readiness poll is running
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::WaitingForAvdName
                | ConnectionState::WaitingForPackageManager
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    /// Position along the readiness walk; Failed sits outside it
    pub fn phase(&self) -> Option<u8> {
        match self {
            ConnectionState::Disconnected => Some(0),
            ConnectionState::Connecting => Some(1),
            ConnectionState::WaitingForAvdName => Some(2),
            ConnectionState::WaitingForPackageManager => Some(3),
            ConnectionState::Ready => Some(4),
            ConnectionState::Failed(_) => None,
        }
    }

    /// Whether the tracker may move from `self` to `next`
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Disconnected, Disconnected) => false,
            (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, WaitingForAvdName) => true,
            (Connecting, WaitingForPackageManager) => true,
            (WaitingForAvdName, WaitingForPackageManager) => true,
            (WaitingForPackageManager, Ready) => true,
            (Connecting | WaitingForAvdName | WaitingForPackageManager, Failed(_)) => true,
            _ => false,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;
    use super::*;

    #[test]
    fn test_forward_walk() {
        assert!(Disconnected.can_transition_to(&Connecting));
        assert!(Connecting.can_transition_to(&WaitingForAvdName));
        assert!(Connecting.can_transition_to(&WaitingForPackageManager));
        assert!(WaitingForAvdName.can_transition_to(&WaitingForPackageManager));
        assert!(WaitingForPackageManager.can_transition_to(&Ready));
    }

    #[test]
    fn test_no_skipping_or_going_back() {
        assert!(!Disconnected.can_transition_to(&Ready));
        assert!(!Connecting.can_transition_to(&Ready));
        assert!(!WaitingForAvdName.can_transition_to(&Ready));
        assert!(!WaitingForPackageManager.can_transition_to(&WaitingForAvdName));
        assert!(!Ready.can_transition_to(&Connecting));
    }

    #[test]
    fn test_terminal_states() {
        let failed = Failed("timeout".into());
        assert!(Ready.is_terminal());
        assert!(failed.is_terminal());
        assert!(!Ready.can_transition_to(&Failed("late".into())));
        assert!(!failed.can_transition_to(&Ready));
        assert!(failed.can_transition_to(&Disconnected));
        assert!(Ready.can_transition_to(&Disconnected));
        assert!(!Disconnected.can_transition_to(&Disconnected));
    }

    #[test]
    fn test_display() {
        assert_eq!(Ready.to_string(), "ready");
        assert_eq!(Failed("boom".into()).to_string(), "failed (boom)");
        assert_eq!(Failed("x".into()).phase(), None);
        assert!(Connecting.phase() < WaitingForPackageManager.phase());
    }
}
