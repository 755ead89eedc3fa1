//! Launch Coordinator
//!
//! Turns one application-launch request into a device start plus a wait for
//! the tracker's readiness signal, bounded by the configured max start time.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::device::DeviceProfile;
use crate::listener::DeviceStartListener;
use crate::scheduler::Scheduler;
use crate::tracker::ConnectionTracker;

/// Launch errors
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Emulator executable not found")]
    NotFound,
    #[error("AVD not found: {0}")]
    AvdNotFound(String),
    #[error("Failed to start emulator: {0}")]
    StartFailed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Brings a device up so it can be reached over the bridge
pub trait Launcher: Send + Sync + fmt::Debug {
    /// Start the device without waiting for it to boot
    fn start_emulator(&self, device: &DeviceProfile) -> Result<(), LaunchError>;
}

/// Physical devices are already running
#[derive(Debug, Default, Clone, Copy)]
pub struct PhysicalLauncher;

impl Launcher for PhysicalLauncher {
    fn start_emulator(&self, device: &DeviceProfile) -> Result<(), LaunchError> {
        debug!("{} is a physical device, nothing to start", device.name());
        Ok(())
    }
}

/// One attempt to run an application on a specific device
#[derive(Debug, Clone)]
pub struct LaunchInfo {
    pub app_name: String,
    pub launcher: Arc<dyn Launcher>,
    pub device: Arc<DeviceProfile>,
}

impl LaunchInfo {
    pub fn new(app_name: impl Into<String>, launcher: Arc<dyn Launcher>, device: Arc<DeviceProfile>) -> Self {
        Self {
            app_name: app_name.into(),
            launcher,
            device,
        }
    }
}

/// How a launch ended
#[derive(Debug, Clone)]
pub enum LaunchOutcome {
    Started(Arc<DeviceProfile>),
    Error(String),
    Timeout(String),
}

/// Listener that forwards the single outcome over a oneshot channel
pub struct ChannelListener {
    tx: Mutex<Option<oneshot::Sender<LaunchOutcome>>>,
}

impl ChannelListener {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<LaunchOutcome>) {
        let (tx, rx) = oneshot::channel();
        let listener = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
        });
        (listener, rx)
    }

    fn send(&self, outcome: LaunchOutcome) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(outcome);
        }
    }
}

impl DeviceStartListener for ChannelListener {
    fn on_device_start(&self, device: Arc<DeviceProfile>) {
        self.send(LaunchOutcome::Started(device));
    }

    fn on_error(&self, message: &str) {
        self.send(LaunchOutcome::Error(message.to_string()));
    }

    fn on_timeout(&self, name: &str) {
        self.send(LaunchOutcome::Timeout(name.to_string()));
    }
}

pub struct LaunchCoordinator {
    tracker: Arc<ConnectionTracker>,
    scheduler: Scheduler,
}

impl LaunchCoordinator {
    pub fn new(tracker: Arc<ConnectionTracker>, scheduler: Scheduler) -> Self {
        Self { tracker, scheduler }
    }

    /// Start the launch's device and notify `listener` once it is ready.
    ///
    /// Returns whether the start request itself went through, not whether
    /// the device became ready. A device that is already ready is signalled
    /// right away without being started again.
    pub fn start_device(&self, launch: &LaunchInfo, listener: Arc<dyn DeviceStartListener>) -> bool {
        let device = &launch.device;
        let name = device.name();

        let pending = self
            .tracker
            .register_launch(name, listener, Some(Arc::clone(device)));
        device.attach_launch(launch);

        if self.tracker.is_ready(name) {
            self.tracker.remove_launch(&pending);
            pending.device_started(Arc::clone(device));
            return true;
        }

        info!("Starting {} for {}", device, launch.app_name);
        if let Err(e) = launch.launcher.start_emulator(device) {
            self.tracker
                .report_device_failure(name, &format!("Unable to start {}: {}", name, e));
            return false;
        }

        let max_start = self.tracker.config().max_start_time();
        let tracker = Arc::clone(&self.tracker);
        let timed = Arc::clone(&pending);
        self.scheduler.once(max_start, pending.done_token(), move || async move {
            tracker.launch_timed_out(&timed);
        });

        debug!("Waiting up to {:?} for {}", max_start, name);
        true
    }

    /// Start the device and wait for the launch outcome
    pub async fn launch_and_wait(&self, launch: &LaunchInfo) -> LaunchOutcome {
        let (listener, outcome) = ChannelListener::new();
        // A failed start has already been reported through the listener
        let _ = self.start_device(launch, listener);

        match outcome.await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Launch on {} ended without an outcome", launch.device.name());
                LaunchOutcome::Error(format!("Launch on {} was abandoned", launch.device.name()))
            }
        }
    }
}

impl fmt::Debug for LaunchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchCoordinator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_physical_launcher_is_noop() {
        let profile = DeviceProfile::physical("R58M123");
        assert!(PhysicalLauncher.start_emulator(&profile).is_ok());
    }

    #[tokio::test]
    async fn test_channel_listener_keeps_first_outcome() {
        let (listener, rx) = ChannelListener::new();
        listener.on_timeout("Pixel_7");
        listener.on_error("late");

        match rx.await {
            Ok(LaunchOutcome::Timeout(name)) => assert_eq!(name, "Pixel_7"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
