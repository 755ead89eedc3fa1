//! Launch listeners
//!
//! Exactly one of `on_device_start`, `on_error` or `on_timeout` fires per
//! launch attempt. [`PendingLaunch`] enforces that: the first caller to
//! claim it delivers, everyone after that is ignored.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::DeviceProfile;

/// Receives the outcome of a device start request
pub trait DeviceStartListener: Send + Sync {
    fn on_device_start(&self, device: Arc<DeviceProfile>);
    fn on_error(&self, message: &str);
    fn on_timeout(&self, name: &str);
}

/// A launch waiting for its device to become ready
pub struct PendingLaunch {
    name: String,
    listener: Arc<dyn DeviceStartListener>,
    profile: Option<Arc<DeviceProfile>>,
    signalled: AtomicBool,
    done: CancellationToken,
}

impl PendingLaunch {
    pub fn new(
        name: impl Into<String>,
        listener: Arc<dyn DeviceStartListener>,
        profile: Option<Arc<DeviceProfile>>,
    ) -> Self {
        Self {
            name: name.into(),
            listener,
            profile,
            signalled: AtomicBool::new(false),
            done: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled.load(Ordering::Acquire)
    }

    /// Cancelled as soon as the launch has been signalled
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    fn claim(&self) -> bool {
        let won = self
            .signalled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if won {
            self.done.cancel();
            if let Some(profile) = &self.profile {
                profile.reset_launch();
            }
        } else {
            debug!("Launch on {} already signalled", self.name);
        }
        won
    }

    /// Returns whether this call delivered the notification
    pub fn device_started(&self, device: Arc<DeviceProfile>) -> bool {
        if !self.claim() {
            return false;
        }
        info!("Device {} is ready", self.name);
        self.listener.on_device_start(device);
        true
    }

    pub fn error(&self, message: &str) -> bool {
        if !self.claim() {
            return false;
        }
        warn!("Launch on {} failed: {}", self.name, message);
        self.listener.on_error(message);
        true
    }

    pub fn timeout(&self) -> bool {
        if !self.claim() {
            return false;
        }
        warn!("Timeout device {} waiting to go online", self.name);
        self.listener.on_timeout(&self.name);
        true
    }
}

impl fmt::Debug for PendingLaunch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLaunch")
            .field("name", &self.name)
            .field("signalled", &self.is_signalled())
            .finish()
    }
}
