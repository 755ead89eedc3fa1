//! Emulator Launcher
//!
//! Starts SDK emulator processes for AVD profiles. Starting returns as soon
//! as the process is spawned; readiness is the tracker's business.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::DeviceProfile;
use crate::launch::{LaunchError, Launcher};

/// Emulator launch options
#[derive(Debug, Clone, Default)]
pub struct EmulatorOptions {
    /// GPU mode (auto, host, swiftshader_indirect, etc.)
    pub gpu: Option<String>,
    pub no_audio: bool,
    pub no_window: bool,
    pub no_boot_anim: bool,
    /// Memory size in MB
    pub memory: Option<u32>,
    pub wipe_data: bool,
    pub cold_boot: bool,
    /// Console port; picked from the free emulator ports when unset
    pub port: Option<u16>,
    pub extra_args: Vec<String>,
}

impl EmulatorOptions {
    /// Options for headless/CI environments
    pub fn headless() -> Self {
        Self {
            gpu: Some("swiftshader_indirect".to_string()),
            no_audio: true,
            no_window: true,
            no_boot_anim: true,
            ..Default::default()
        }
    }

    /// Convert to command line arguments
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(ref gpu) = self.gpu {
            args.push("-gpu".to_string());
            args.push(gpu.clone());
        }
        if self.no_audio {
            args.push("-no-audio".to_string());
        }
        if self.no_window {
            args.push("-no-window".to_string());
        }
        if self.no_boot_anim {
            args.push("-no-boot-anim".to_string());
        }
        if let Some(memory) = self.memory {
            args.push("-memory".to_string());
            args.push(memory.to_string());
        }
        if self.wipe_data {
            args.push("-wipe-data".to_string());
        }
        if self.cold_boot {
            args.push("-no-snapshot-load".to_string());
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// An emulator process we spawned
#[derive(Debug)]
struct EmulatorInstance {
    avd_name: String,
    port: u16,
    process: Child,
}

impl EmulatorInstance {
    fn is_running(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }
}

#[derive(Debug)]
pub struct EmulatorLauncher {
    sdk_path: PathBuf,
    options: EmulatorOptions,
    instances: Mutex<Vec<EmulatorInstance>>,
}

impl EmulatorLauncher {
    pub fn new(sdk_path: impl Into<PathBuf>, options: EmulatorOptions) -> Self {
        Self {
            sdk_path: sdk_path.into(),
            options,
            instances: Mutex::new(Vec::new()),
        }
    }

    pub fn sdk_path(&self) -> &Path {
        &self.sdk_path
    }

    /// Get the emulator executable path
    pub fn emulator_path(&self) -> PathBuf {
        let emulator_dir = self.sdk_path.join("emulator");
        if cfg!(windows) {
            emulator_dir.join("emulator.exe")
        } else {
            emulator_dir.join("emulator")
        }
    }

    pub fn is_available(&self) -> bool {
        self.emulator_path().exists()
    }

    /// Arguments for starting `avd_name` on console `port`
    pub fn command_args(&self, avd_name: &str, port: u16) -> Vec<String> {
        let mut args = vec![
            "-avd".to_string(),
            avd_name.to_string(),
            "-port".to_string(),
            port.to_string(),
        ];
        args.extend(self.options.to_args());
        args
    }

    pub fn is_running(&self, avd_name: &str) -> bool {
        let mut instances = self.instances.lock();
        instances.retain_mut(|i| i.is_running());
        instances.iter().any(|i| i.avd_name == avd_name)
    }

    /// Kill every emulator this launcher started
    pub fn stop_all(&self) {
        let mut instances = self.instances.lock();
        for instance in instances.iter_mut() {
            match instance.process.kill() {
                Ok(()) => info!("Killed emulator: {}", instance.avd_name),
                Err(e) => warn!("Unable to kill emulator {}: {}", instance.avd_name, e),
            }
            let _ = instance.process.wait();
        }
        instances.clear();
    }
}

impl Launcher for EmulatorLauncher {
    fn start_emulator(&self, device: &DeviceProfile) -> Result<(), LaunchError> {
        if !device.is_emulator() {
            return Ok(());
        }

        let avd_name = device.name();
        let emulator = self.emulator_path();
        if !emulator.exists() {
            return Err(LaunchError::NotFound);
        }

        let mut instances = self.instances.lock();
        instances.retain_mut(|i| i.is_running());
        if instances.iter().any(|i| i.avd_name == avd_name) {
            debug!("Emulator {} already running", avd_name);
            return Ok(());
        }

        let used: Vec<u16> = instances.iter().map(|i| i.port).collect();
        let port = match self.options.port {
            Some(port) => port,
            None => crate::next_emulator_port(&used)
                .ok_or_else(|| LaunchError::StartFailed("no free emulator port".to_string()))?,
        };

        let args = self.command_args(avd_name, port);
        info!("Launching emulator {} on port {}", avd_name, port);
        debug!("Emulator args: {:?}", args);

        let process = Command::new(&emulator)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        instances.push(EmulatorInstance {
            avd_name: avd_name.to_string(),
            port,
            process,
        });
        Ok(())
    }
}
