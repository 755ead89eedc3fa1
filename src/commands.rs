//! CLI commands for devlink
//!
//! Every command runs against a [`Session`]: an adb-backed bridge attached
//! to a freshly built device context.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use devlink_core::AppConfig;
use devlink_device_bridge::{
    AdbBridge, AdbClient, AvdCatalog, BridgeTransport, ConnectionState, DeviceContext, DeviceEvent,
    DeviceProfile, EmulatorLauncher, EmulatorOptions, LaunchInfo, LaunchOutcome, next_emulator_port,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A connected device context plus the adb watcher feeding it
pub struct Session {
    pub config: AppConfig,
    pub sdk_path: PathBuf,
    pub context: DeviceContext,
    pub bridge: Arc<AdbBridge>,
    watcher: JoinHandle<()>,
}

impl Session {
    /// Find adb, load AVDs, attach the monitor and start watching
    pub async fn connect(config: AppConfig) -> Result<Self> {
        let sdk_path = config
            .android
            .resolve_sdk_path()
            .ok_or_else(|| anyhow!("Android SDK not found; set ANDROID_HOME or android.sdk_path"))?;

        let client = AdbClient::new(&sdk_path);
        if !client.is_available() {
            bail!("adb not found at {}", client.adb_path().display());
        }
        if let Err(e) = client.start_server().await {
            warn!("Unable to start the adb server: {}", e);
        }

        let context = DeviceContext::from_current(config.devices.clone())?;
        context
            .load_avds(&AvdCatalog::new(config.android.resolve_avd_home()))
            .await;

        let bridge = Arc::new(AdbBridge::new(client).with_query_timeout(config.devices.shell_timeout()));
        let transport: Arc<dyn BridgeTransport> = bridge.clone();
        context
            .monitor()
            .start(transport)
            .await
            .context("Unable to enumerate devices")?;

        let watcher = {
            let bridge = Arc::clone(&bridge);
            let token = context.shutdown_token();
            let interval = config.devices.bridge_poll_interval();
            tokio::spawn(async move { bridge.watch(interval, token).await })
        };

        info!("Session ready (SDK at {})", sdk_path.display());
        Ok(Self {
            config,
            sdk_path,
            context,
            bridge,
            watcher,
        })
    }

    pub async fn close(self) {
        self.context.shutdown();
        let _ = self.watcher.await;
    }
}

/// Cancelled on Ctrl-C
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });
    token
}

/// One line of `devlink devices`
#[derive(Debug, Serialize)]
pub struct DeviceRow {
    pub name: String,
    pub display_name: String,
    pub emulator: bool,
    pub api_level: Option<u32>,
    pub target: Option<String>,
    pub serial: Option<String>,
    pub state: ConnectionState,
}

impl DeviceRow {
    pub fn new(profile: &DeviceProfile, serial: Option<String>, state: ConnectionState) -> Self {
        let details = profile.details();
        Self {
            name: profile.name().to_string(),
            display_name: details.display_name,
            emulator: profile.is_emulator(),
            api_level: details.api_level,
            target: details.target_hash,
            serial,
            state,
        }
    }

    pub fn line(&self) -> String {
        let kind = if self.emulator { "emulator" } else { "device" };
        let api = self
            .api_level
            .map(|level| format!("API {}", level))
            .unwrap_or_else(|| "API ?".to_string());
        format!(
            "{:<28} {:<9} {:<7} {:<16} {}",
            self.name,
            kind,
            api,
            self.serial.as_deref().unwrap_or("-"),
            self.state
        )
    }
}

/// Console ports taken by the emulators among `serials`
pub fn emulator_ports(serials: &[String]) -> Vec<u16> {
    serials
        .iter()
        .filter_map(|serial| serial.strip_prefix("emulator-"))
        .filter_map(|port| port.parse().ok())
        .collect()
}

/// Human-readable form of a lifecycle event
pub fn describe_event(event: &DeviceEvent) -> String {
    match event {
        DeviceEvent::Connected { serial } => format!("[{}] connected", serial),
        DeviceEvent::StateChanged { serial, name, from, to } => match name {
            Some(name) if name != serial => format!("[{}] {}: {} -> {}", serial, name, from, to),
            _ => format!("[{}] {} -> {}", serial, from, to),
        },
        DeviceEvent::Ready { serial, name } => format!("[{}] {} is ready", serial, name),
        DeviceEvent::Disconnected { serial, .. } => format!("[{}] disconnected", serial),
    }
}

/// List known devices
pub struct DevicesCommand {
    pub json: bool,
}

impl DevicesCommand {
    pub async fn execute(&self, session: &Session) -> Result<()> {
        let tracker = session.context.tracker();
        let rows: Vec<DeviceRow> = session
            .context
            .all_devices_sorted()
            .iter()
            .map(|profile| {
                let serial = tracker.serial_of(profile.name());
                DeviceRow::new(profile, serial, tracker.state_of(profile.name()))
            })
            .collect();

        if self.json {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        } else if rows.is_empty() {
            println!("No devices");
        } else {
            for row in &rows {
                println!("{}", row.line());
            }
        }
        Ok(())
    }
}

/// Print lifecycle events until Ctrl-C
pub struct WatchCommand {
    pub json: bool,
}

impl WatchCommand {
    pub async fn execute(&self, session: &Session) -> Result<()> {
        let events = session.context.subscribe();
        let stop = ctrl_c_token();

        for (serial, state) in session.context.tracker().connections() {
            println!("[{}] {}", serial, state);
        }

        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for event in events.drain() {
                if self.json {
                    println!("{}", serde_json::to_string(&event)?);
                } else {
                    println!("{}", describe_event(&event));
                }
            }
        }
        Ok(())
    }
}

/// Run a shell command on one device
pub struct ShellCommand {
    pub serial: String,
    pub command: Vec<String>,
    pub timeout: Option<Duration>,
}

impl ShellCommand {
    pub async fn execute(&self, session: &Session) -> Result<()> {
        let command = self.command.join(" ");
        let timeout = self
            .timeout
            .unwrap_or_else(|| session.config.devices.shell_timeout());

        let output = session
            .context
            .monitor()
            .execute_shell_command(&self.serial, &command, timeout, &ctrl_c_token())
            .await?;
        print!("{}", output);
        Ok(())
    }
}

/// Push or pull one file
pub struct TransferCommand {
    pub serial: String,
    pub push: bool,
    pub local: PathBuf,
    pub remote: String,
}

impl TransferCommand {
    pub async fn execute(&self, session: &Session) -> Result<()> {
        let monitor = session.context.monitor();
        let timeout = session.config.devices.transfer_timeout();
        let cancel = ctrl_c_token();
        let local = [self.local.clone()];
        let remote = [self.remote.clone()];

        let report = if self.push {
            monitor
                .push_files(&self.serial, &local, &remote, timeout, &cancel)
                .await
        } else {
            monitor
                .pull_files(&self.serial, &remote, &local, timeout, &cancel)
                .await
        };

        for line in report.lines() {
            println!("{}", line);
        }
        if report.status.is_cancel() {
            bail!("Transfer cancelled");
        }
        if !report.is_ok() {
            bail!("{}", report.status.message);
        }
        Ok(())
    }
}

/// Start an emulator and wait until it is ready
pub struct LaunchCommand {
    pub avd: String,
    pub app: String,
    pub headless: bool,
}

impl LaunchCommand {
    pub async fn execute(&self, session: &Session) -> Result<()> {
        let registry = session.context.registry();
        if registry.avd(&self.avd).is_none() {
            bail!(
                "Unknown AVD {}; available: {}",
                self.avd,
                registry.avd_names().join(", ")
            );
        }

        let mut options = if self.headless {
            EmulatorOptions::headless()
        } else {
            EmulatorOptions::default()
        };
        options.port = next_emulator_port(&emulator_ports(&session.context.monitor().serials()));

        let launcher = Arc::new(EmulatorLauncher::new(session.sdk_path.clone(), options));
        if !launcher.is_available() {
            bail!("emulator not found at {}", launcher.emulator_path().display());
        }

        let profile = registry.get_or_create_emulator_profile(&self.avd);
        let launch = LaunchInfo::new(self.app.clone(), launcher.clone(), profile);

        info!(
            "Waiting up to {:?} for {}",
            session.config.devices.max_start_time(),
            self.avd
        );
        match session.context.coordinator().launch_and_wait(&launch).await {
            LaunchOutcome::Started(device) => {
                let serial = session.context.tracker().serial_of(device.name());
                println!("{} is ready on {}", device, serial.as_deref().unwrap_or("?"));
                Ok(())
            }
            LaunchOutcome::Error(message) => {
                launcher.stop_all();
                bail!(message)
            }
            LaunchOutcome::Timeout(name) => {
                launcher.stop_all();
                bail!("Timeout waiting for {} to come online", name)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlink_device_bridge::DeviceType;
    use devlink_device_bridge::ProfileDetails;

    #[test]
    fn test_describe_event() {
        let event = DeviceEvent::StateChanged {
            serial: "emulator-5554".into(),
            name: Some("Pixel_7".into()),
            from: ConnectionState::Connecting,
            to: ConnectionState::WaitingForAvdName,
        };
        assert_eq!(
            describe_event(&event),
            "[emulator-5554] Pixel_7: connecting -> waiting-for-avd-name"
        );

        let event = DeviceEvent::StateChanged {
            serial: "R58M123".into(),
            name: Some("R58M123".into()),
            from: ConnectionState::WaitingForPackageManager,
            to: ConnectionState::Ready,
        };
        assert_eq!(describe_event(&event), "[R58M123] waiting-for-package-manager -> ready");
    }

    #[test]
    fn test_emulator_ports() {
        let serials = vec![
            "emulator-5554".to_string(),
            "R58M123".to_string(),
            "emulator-5558".to_string(),
            "emulator-x".to_string(),
        ];
        let ports = emulator_ports(&serials);
        assert_eq!(ports, vec![5554, 5558]);
        assert_eq!(next_emulator_port(&ports), Some(5556));
    }

    #[test]
    fn test_device_row() {
        let profile = DeviceProfile::new(
            "Pixel_7",
            DeviceType::Emulator,
            ProfileDetails {
                api_level: Some(34),
                target_hash: Some("android-34".into()),
                ..Default::default()
            },
        );
        let row = DeviceRow::new(&profile, Some("emulator-5554".into()), ConnectionState::Ready);

        assert_eq!(row.display_name, "Pixel 7");
        assert!(row.line().starts_with("Pixel_7"));
        assert!(row.line().contains("API 34"));
        assert!(row.line().contains("emulator-5554"));

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["target"], "android-34");
        assert_eq!(json["state"], "Ready");
    }
}
