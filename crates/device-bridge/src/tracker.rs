//! Connection Tracker
//!
//! Per-serial state machine that walks a device from "reported by the
//! bridge" to "ready to install and run applications":
//!
//! ```text
//! Disconnected → Connecting → [WaitingForAvdName] → WaitingForPackageManager → Ready
//!                     └──────────────┴──────────────────────┴──→ Failed
//! any state ──(disconnect / offline / failure report / launch timeout)──→ Disconnected
//! ```
//!
//! Each connection gets a single periodic poll that drives the waiting
//! phases. The poll and the bridge callbacks both go through
//! `transition`, which applies a change only if the
//! connection generation still matches and the move is legal, so a late
//! poll can never overwrite a disconnect.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};

use devlink_core::{DeviceConfig, EventBus};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::device::DeviceProfile;
use crate::events::DeviceEvent;
use crate::index::SerialIndex;
use crate::listener::{DeviceStartListener, PendingLaunch};
use crate::registry::DeviceRegistry;
use crate::scheduler::Scheduler;
use crate::shell::{run_shell, ProcessError};
use crate::state::ConnectionState;
use crate::transport::{DeviceChange, DeviceHandle};

const DISCONNECTED_REASON: &str = "device disconnected";
const OFFLINE_REASON: &str = "device offline";
const LAUNCH_TIMEOUT_REASON: &str = "launch timed out";

#[derive(Default)]
struct Connection {
    state: ConnectionState,
    handle: Option<Arc<dyn DeviceHandle>>,
    poll: Option<CancellationToken>,
    /// Bumped on every (re)connect and disconnect; stale polls compare against it
    generation: u64,
}

pub struct ConnectionTracker {
    config: DeviceConfig,
    registry: Arc<DeviceRegistry>,
    events: Arc<EventBus<DeviceEvent>>,
    scheduler: Scheduler,
    index: SerialIndex,
    connections: RwLock<HashMap<String, Connection>>,
    launches: RwLock<HashMap<String, Arc<PendingLaunch>>>,
    weak: Weak<Self>,
}

impl Connection {
    /// Stop the walk and settle on `Disconnected`, passing through
    /// `Failed(reason)` first if the device was still waiting.
    ///
    /// Returns the transitions applied, oldest first.
    fn stand_down(&mut self, failed: Option<&str>) -> Vec<(ConnectionState, ConnectionState)> {
        if let Some(poll) = self.poll.take() {
            poll.cancel();
        }
        self.generation += 1;

        let mut applied = Vec::new();
        if let Some(reason) = failed {
            if self.state.is_waiting() {
                let to = ConnectionState::Failed(reason.to_string());
                let from = std::mem::replace(&mut self.state, to.clone());
                applied.push((from, to));
            }
        }
        if self.state != ConnectionState::Disconnected {
            let from = std::mem::replace(&mut self.state, ConnectionState::Disconnected);
            applied.push((from, ConnectionState::Disconnected));
        }
        applied
    }
}

impl ConnectionTracker {
    pub fn new(
        config: DeviceConfig,
        registry: Arc<DeviceRegistry>,
        events: Arc<EventBus<DeviceEvent>>,
        scheduler: Scheduler,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            registry,
            events,
            scheduler,
            index: SerialIndex::new(),
            connections: RwLock::new(HashMap::new()),
            launches: RwLock::new(HashMap::new()),
            weak: weak.clone(),
        })
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

    // ---- queries ----

    /// Current state of `serial`; unknown serials are Disconnected
    pub fn state(&self, serial: &str) -> ConnectionState {
        self.connections
            .read()
            .get(serial)
            .map(|c| c.state.clone())
            .unwrap_or_default()
    }

    /// Current state of the device known as `name`
    pub fn state_of(&self, name: &str) -> ConnectionState {
        self.index
            .serial_of(name)
            .map(|serial| self.state(&serial))
            .unwrap_or_default()
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.state_of(name).is_ready()
    }

    pub fn serial_of(&self, name: &str) -> Option<String> {
        self.index.serial_of(name)
    }

    pub fn name_of(&self, serial: &str) -> Option<String> {
        self.index.name_of(serial)
    }

    /// Serials currently attached to the bridge, with their state
    pub fn connections(&self) -> Vec<(String, ConnectionState)> {
        let mut list: Vec<_> = self
            .connections
            .read()
            .iter()
            .filter(|(_, c)| c.handle.is_some())
            .map(|(s, c)| (s.clone(), c.state.clone()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    // ---- bridge events ----

    /// The bridge reported `device`. Starts the readiness walk if it is online.
    pub async fn device_connected(&self, device: Arc<dyn DeviceHandle>) {
        let serial = device.serial_number().to_string();

        if !device.is_online().await {
            debug!("[{}] reported but not online yet", serial);
            let mut connections = self.connections.write();
            let connection = connections.entry(serial).or_default();
            if connection.state == ConnectionState::Disconnected {
                connection.handle = Some(device);
            }
            return;
        }

        self.begin(serial, device).await;
    }

    /// The bridge reported a change on `device`.
    ///
    /// A state change to online restarts the walk from `Disconnected`; a
    /// state change away from online abandons it.
    pub async fn device_changed(&self, device: Arc<dyn DeviceHandle>, change: DeviceChange) {
        let serial = device.serial_number().to_string();

        if change.contains(DeviceChange::STATE) {
            let online = device.is_online().await;
            let state = self.state(&serial);
            if online && state == ConnectionState::Disconnected {
                self.begin(serial, device).await;
                return;
            }
            if !online && state != ConnectionState::Disconnected {
                self.device_offline(&serial);
                return;
            }
        }

        if change.contains(DeviceChange::BUILD_INFO) {
            if let Some(profile) = self.name_of(&serial).and_then(|n| self.registry.get(&n)) {
                self.refresh_details(&device, &profile).await;
            }
        }
    }

    /// The bridge no longer reports `serial`.
    ///
    /// A pending launch is failed before the state changes. A device that
    /// was still waiting passes through `Failed` on its way to `Disconnected`.
    pub fn device_disconnected(&self, serial: &str) {
        let name = self.index.name_of(serial);

        if let Some(name) = &name {
            if let Some(pending) = self.take_launch(name) {
                pending.error(&format!("Device {} disconnected", name));
            }
        }

        {
            let mut connections = self.connections.write();
            if let Some(connection) = connections.get_mut(serial) {
                connection.handle = None;
                for (from, to) in connection.stand_down(Some(DISCONNECTED_REASON)) {
                    self.publish(serial, name.clone(), from, to);
                }
            }
            self.events.emit(DeviceEvent::Disconnected {
                serial: serial.to_string(),
                name: name.clone(),
            });
        }

        self.index.remove_serial(serial);
        info!("[{}] disconnected{}", serial, describe_name(name.as_deref()));
    }

    /// Explicit failure report for the device known as `name`.
    ///
    /// Notifies its pending launch (once) and moves the device to
    /// `Disconnected`; it re-enters the walk on its next state change.
    pub fn report_device_failure(&self, name: &str, message: &str) {
        error!("Device {} failed: {}", name, message);

        if let Some(pending) = self.take_launch(name) {
            pending.error(message);
        }

        self.stand_down_named(name, None);
    }

    /// The device behind `serial` is still attached but no longer online.
    ///
    /// Its handle is kept so the next online state change restarts the walk.
    fn device_offline(&self, serial: &str) {
        let name = self.index.name_of(serial);
        warn!("[{}] went offline{}", serial, describe_name(name.as_deref()));

        if let Some(name) = &name {
            if let Some(pending) = self.take_launch(name) {
                pending.error(&format!("Device {} went offline", name));
            }
        }

        let mut connections = self.connections.write();
        if let Some(connection) = connections.get_mut(serial) {
            for (from, to) in connection.stand_down(Some(OFFLINE_REASON)) {
                self.publish(serial, name.clone(), from, to);
            }
        }
    }

    /// Move the device known as `name`, if attached, to `Disconnected`
    fn stand_down_named(&self, name: &str, failed: Option<&str>) {
        let Some(serial) = self.index.serial_of(name) else {
            return;
        };

        let mut connections = self.connections.write();
        if let Some(connection) = connections.get_mut(&serial) {
            for (from, to) in connection.stand_down(failed) {
                self.publish(&serial, Some(name.to_string()), from, to);
            }
        }
    }

    // ---- launches ----

    /// Register `listener` to hear about the device known as `name`.
    ///
    /// A launch already pending for the same name is failed as superseded.
    pub fn register_launch(
        &self,
        name: &str,
        listener: Arc<dyn DeviceStartListener>,
        profile: Option<Arc<DeviceProfile>>,
    ) -> Arc<PendingLaunch> {
        let pending = Arc::new(PendingLaunch::new(name, listener, profile));
        let previous = self
            .launches
            .write()
            .insert(name.to_string(), Arc::clone(&pending));

        if let Some(previous) = previous {
            previous.error(&format!("Launch on {} superseded by a newer launch", name));
        }
        pending
    }

    pub fn take_launch(&self, name: &str) -> Option<Arc<PendingLaunch>> {
        self.launches.write().remove(name)
    }

    pub fn has_pending_launch(&self, name: &str) -> bool {
        self.launches.read().contains_key(name)
    }

    /// Remove `pending` if it is still the launch registered for its name
    pub fn remove_launch(&self, pending: &Arc<PendingLaunch>) -> bool {
        let mut launches = self.launches.write();
        match launches.get(pending.name()) {
            Some(current) if Arc::ptr_eq(current, pending) => {
                launches.remove(pending.name());
                true
            }
            _ => false,
        }
    }

    /// The launch timer for `pending` expired.
    ///
    /// If the timeout is the launch's signal, the device it was waiting for
    /// stops its walk so a late `Ready` cannot follow the timeout.
    pub fn launch_timed_out(&self, pending: &Arc<PendingLaunch>) {
        self.remove_launch(pending);
        if !pending.timeout() {
            return;
        }

        self.stand_down_named(pending.name(), Some(LAUNCH_TIMEOUT_REASON));
    }

    // ---- state machine ----

    async fn begin(&self, serial: String, device: Arc<dyn DeviceHandle>) {
        if !device.is_emulator() {
            self.index.insert(&serial, &serial);
        }

        let token = CancellationToken::new();
        let generation = {
            let mut connections = self.connections.write();
            let connection = connections.entry(serial.clone()).or_default();
            if !connection.state.can_transition_to(&ConnectionState::Connecting) {
                debug!("[{}] already {}, ignoring connect", serial, connection.state);
                return;
            }

            connection.generation += 1;
            connection.handle = Some(Arc::clone(&device));
            connection.poll = Some(token.clone());
            let from = std::mem::replace(&mut connection.state, ConnectionState::Connecting);

            self.events.emit(DeviceEvent::Connected {
                serial: serial.clone(),
            });
            self.publish(&serial, self.index.name_of(&serial), from, ConnectionState::Connecting);
            connection.generation
        };
        info!("[{}] connecting", serial);

        let next = if device.is_emulator() {
            match device.avd_name().await {
                Some(avd) => {
                    self.index.insert(&serial, &avd);
                    ConnectionState::WaitingForPackageManager
                }
                None => ConnectionState::WaitingForAvdName,
            }
        } else {
            ConnectionState::WaitingForPackageManager
        };

        if self.transition(&serial, generation, next, None) {
            self.spawn_poll(serial, generation, token);
        }
    }

    fn spawn_poll(&self, serial: String, generation: u64, token: CancellationToken) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let max_ticks = self.config.max_poll_ticks();
        let cancel = token.clone();

        self.scheduler
            .periodic(self.config.poll_interval(), token, move |tick| {
                let this = Arc::clone(&this);
                let serial = serial.clone();
                let cancel = cancel.clone();
                async move { this.poll_once(&serial, generation, tick, max_ticks, &cancel).await }
            });
    }

    async fn poll_once(
        &self,
        serial: &str,
        generation: u64,
        tick: u64,
        max_ticks: u64,
        cancel: &CancellationToken,
    ) -> ControlFlow<()> {
        let Some((state, device)) = self.current(serial, generation) else {
            return ControlFlow::Break(());
        };

        match state {
            ConnectionState::WaitingForAvdName => {
                if let Some(avd) = device.avd_name().await {
                    debug!("[{}] AVD name is {}", serial, avd);
                    self.index.insert(serial, &avd);
                    return if self.transition(
                        serial,
                        generation,
                        ConnectionState::WaitingForPackageManager,
                        None,
                    ) {
                        ControlFlow::Continue(())
                    } else {
                        ControlFlow::Break(())
                    };
                }
            }
            ConnectionState::WaitingForPackageManager => {
                match self.probe_ready(&device, cancel).await {
                    Ok(true) => {
                        self.mark_ready(serial, generation, &device).await;
                        return ControlFlow::Break(());
                    }
                    Ok(false) => {
                        debug!("[{}] not ready yet (poll {}/{})", serial, tick, max_ticks);
                    }
                    Err(ProcessError::Cancelled) => return ControlFlow::Break(()),
                    Err(e) if e.is_retryable() => {
                        debug!("[{}] readiness probe timed out (poll {}/{})", serial, tick, max_ticks);
                    }
                    Err(e) => {
                        error!("[{}] readiness probe failed: {}", serial, e);
                        self.fail(serial, generation, format!("error waiting for package manager: {}", e));
                        return ControlFlow::Break(());
                    }
                }
            }
            _ => return ControlFlow::Break(()),
        }

        if tick >= max_ticks {
            let reason = match state {
                ConnectionState::WaitingForAvdName => "timeout waiting for AVD name",
                _ => "timeout waiting for package manager",
            };
            self.time_out(serial, generation, reason);
            return ControlFlow::Break(());
        }

        ControlFlow::Continue(())
    }

    /// Boot completed and the package manager answers
    async fn probe_ready(
        &self,
        device: &Arc<dyn DeviceHandle>,
        cancel: &CancellationToken,
    ) -> Result<bool, ProcessError> {
        let timeout = self.config.shell_timeout();

        let boot = run_shell(
            device,
            &format!("getprop {}", self.config.boot_completed_property),
            timeout,
            cancel,
        )
        .await?;
        if boot.trim() != "1" {
            return Ok(false);
        }

        let pm = run_shell(device, &self.config.package_manager_probe, timeout, cancel).await?;
        Ok(pm.contains(&self.config.package_manager_ready_marker))
    }

    async fn mark_ready(&self, serial: &str, generation: u64, device: &Arc<dyn DeviceHandle>) {
        let Some(name) = self.index.name_of(serial) else {
            self.fail(serial, generation, "ready but no logical name is known".to_string());
            return;
        };

        let profile = if device.is_emulator() {
            self.registry.get_or_create_emulator_profile(&name)
        } else {
            self.registry.get_or_create_physical_profile(&name)
        };
        self.refresh_details(device, &profile).await;

        let ready = DeviceEvent::Ready {
            serial: serial.to_string(),
            name: name.clone(),
        };
        if !self.transition(serial, generation, ConnectionState::Ready, Some(ready)) {
            return;
        }

        if let Some(pending) = self.take_launch(&name) {
            pending.device_started(profile);
        }
    }

    /// Hard failure while waiting
    fn fail(&self, serial: &str, generation: u64, reason: String) {
        if !self.transition(serial, generation, ConnectionState::Failed(reason.clone()), None) {
            return;
        }

        let name = self.index.name_of(serial).unwrap_or_else(|| serial.to_string());
        if let Some(pending) = self.take_launch(&name) {
            pending.error(&format!("Device {} failed: {}", name, reason));
        }
    }

    /// Readiness deadline passed
    fn time_out(&self, serial: &str, generation: u64, reason: &str) {
        warn!("[{}] {}", serial, reason);
        if !self.transition(serial, generation, ConnectionState::Failed(reason.to_string()), None) {
            return;
        }

        let name = self.index.name_of(serial).unwrap_or_else(|| serial.to_string());
        if let Some(pending) = self.take_launch(&name) {
            pending.timeout();
        }
    }

    /// Apply `to` if `generation` is still current and the move is legal.
    ///
    /// Events are published under the connection lock so subscribers see
    /// the transitions of one serial in the order they were applied.
    fn transition(
        &self,
        serial: &str,
        generation: u64,
        to: ConnectionState,
        then: Option<DeviceEvent>,
    ) -> bool {
        let mut connections = self.connections.write();
        let Some(connection) = connections.get_mut(serial) else {
            return false;
        };

        if connection.generation != generation || !connection.state.can_transition_to(&to) {
            debug!(
                "[{}] dropping transition {} -> {} (generation {}/{})",
                serial, connection.state, to, generation, connection.generation
            );
            return false;
        }

        if to.is_terminal() {
            if let Some(poll) = connection.poll.take() {
                poll.cancel();
            }
        }

        let from = std::mem::replace(&mut connection.state, to.clone());
        info!("[{}] {} -> {}", serial, from, to);
        self.publish(serial, self.index.name_of(serial), from, to);
        if let Some(event) = then {
            self.events.emit(event);
        }
        true
    }

    fn publish(&self, serial: &str, name: Option<String>, from: ConnectionState, to: ConnectionState) {
        self.events.emit(DeviceEvent::StateChanged {
            serial: serial.to_string(),
            name,
            from,
            to,
        });
    }

    fn current(&self, serial: &str, generation: u64) -> Option<(ConnectionState, Arc<dyn DeviceHandle>)> {
        let connections = self.connections.read();
        let connection = connections.get(serial)?;
        if connection.generation != generation {
            return None;
        }
        let handle = connection.handle.clone()?;
        Some((connection.state.clone(), handle))
    }

    /// Fill profile metadata from the device's build properties
    async fn refresh_details(&self, device: &Arc<dyn DeviceHandle>, profile: &Arc<DeviceProfile>) {
        let api_level = match device.property("ro.build.version.sdk").await {
            Ok(value) => value.and_then(|v| v.trim().parse::<u32>().ok()),
            Err(e) => {
                debug!("[{}] could not read SDK level: {}", device.serial_number(), e);
                None
            }
        };
        let model = if profile.is_emulator() {
            None
        } else {
            device.property("ro.product.model").await.ok().flatten()
        };

        profile.update_details(|details| {
            if let Some(level) = api_level {
                details.api_level = Some(level);
                if details.target_hash.is_none() {
                    details.target_hash = Some(format!("android-{}", level));
                }
            }
            if let Some(model) = model {
                let model = model.trim().replace('_', " ");
                if !model.is_empty() && details.display_name == profile.name() {
                    details.display_name = model;
                }
            }
        });
    }
}

fn describe_name(name: Option<&str>) -> String {
    name.map(|n| format!(" ({})", n)).unwrap_or_default()
}

impl std::fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("connections", &self.connections.read().len())
            .field("launches", &self.launches.read().len())
            .finish()
    }
}
