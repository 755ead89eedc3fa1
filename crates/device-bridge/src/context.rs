//! Device context
//!
//! Wires the registry, tracker, monitor and launch coordinator together and
//! hands them out. Components receive what they need at construction; there
//! is no global lookup.

use std::sync::Arc;

use devlink_core::{DeviceConfig, DevlinkError, EventBus, EventSubscription};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::avd::AvdCatalog;
use crate::compat::{is_compatible, ProjectRequirements};
use crate::device::DeviceProfile;
use crate::events::DeviceEvent;
use crate::launch::LaunchCoordinator;
use crate::monitor::BridgeMonitor;
use crate::registry::DeviceRegistry;
use crate::scheduler::Scheduler;
use crate::status::Severity;
use crate::tracker::ConnectionTracker;

pub struct DeviceContext {
    config: DeviceConfig,
    registry: Arc<DeviceRegistry>,
    events: Arc<EventBus<DeviceEvent>>,
    scheduler: Scheduler,
    tracker: Arc<ConnectionTracker>,
    monitor: Arc<BridgeMonitor>,
    coordinator: LaunchCoordinator,
    shutdown: CancellationToken,
}

impl DeviceContext {
    /// Build every component on `runtime`
    pub fn new(config: DeviceConfig, runtime: Handle) -> Self {
        let scheduler = Scheduler::new(runtime);
        let registry = Arc::new(DeviceRegistry::new());
        let events = Arc::new(EventBus::new());
        let tracker = ConnectionTracker::new(
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&events),
            scheduler.clone(),
        );
        let monitor = BridgeMonitor::new(Arc::clone(&tracker), scheduler.clone());
        let coordinator = LaunchCoordinator::new(Arc::clone(&tracker), scheduler.clone());

        Self {
            config,
            registry,
            events,
            scheduler,
            tracker,
            monitor,
            coordinator,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build on the runtime of the calling task
    pub fn from_current(config: DeviceConfig) -> Result<Self, DevlinkError> {
        let runtime = Handle::try_current()
            .map_err(|e| DevlinkError::InvalidState(format!("no tokio runtime: {}", e)))?;
        Ok(Self::new(config, runtime))
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus<DeviceEvent>> {
        &self.events
    }

    pub fn subscribe(&self) -> EventSubscription<DeviceEvent> {
        self.events.subscribe()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    pub fn monitor(&self) -> &Arc<BridgeMonitor> {
        &self.monitor
    }

    pub fn coordinator(&self) -> &LaunchCoordinator {
        &self.coordinator
    }

    /// Cancelled by [`DeviceContext::shutdown`]; long-running watchers hang off it
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        info!("Shutting down device context");
        self.shutdown.cancel();
    }

    /// Register every AVD found by `catalog` as an emulator profile
    pub async fn load_avds(&self, catalog: &AvdCatalog) -> usize {
        match catalog.list_avds().await {
            Ok(avds) => {
                let count = avds.len();
                let names: Vec<String> = avds.iter().map(|a| a.name.clone()).collect();
                self.registry.load_avds(avds);
                for name in &names {
                    self.registry.get_or_create_emulator_profile(name);
                }
                info!("Loaded {} AVDs from {}", count, catalog.avd_home().display());
                count
            }
            Err(e) => {
                warn!("Unable to read AVDs from {}: {}", catalog.avd_home().display(), e);
                0
            }
        }
    }

    pub fn all_devices(&self) -> Vec<Arc<DeviceProfile>> {
        self.registry.all_profiles()
    }

    pub fn all_devices_sorted(&self) -> Vec<Arc<DeviceProfile>> {
        self.registry.all_profiles_sorted()
    }

    /// Sorted devices the project can run on, with their verdict.
    ///
    /// `Error` verdicts are left out; `Cancel` means the project gave no
    /// requirement and every device is listed.
    pub fn compatible_devices(&self, project: &ProjectRequirements) -> Vec<(Arc<DeviceProfile>, Severity)> {
        self.all_devices_sorted()
            .into_iter()
            .map(|device| {
                let verdict = is_compatible(project, &device);
                (device, verdict)
            })
            .filter(|(_, verdict)| *verdict != Severity::Error)
            .collect()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("registry", &self.registry)
            .field("tracker", &self.tracker)
            .field("monitor", &self.monitor)
            .finish()
    }
}
