//! Simulator configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    pub sim: SimSettings,
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub device: DeviceSettings,
}

/// How bus events reach the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// The worker executes every event as soon as it arrives
    Immediate,
    /// The peripheral thread pushes into the ring, the worker pumps it
    Buffered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimSettings {
    pub log_level: String,
    pub mode: Mode,
    #[serde(default = "SimSettings::default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub enable_sof: bool,
}

impl SimSettings {
    fn default_queue_capacity() -> usize {
        stack::DEFAULT_QUEUE_CAPACITY
    }
}

/// Script of the simulated host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// SOF ticks sent once the device is configured
    #[serde(default = "BusSettings::default_frames")]
    pub frames: u32,
    /// Delay between SOF ticks (full speed is 1000us)
    #[serde(default = "BusSettings::default_frame_interval")]
    pub frame_interval_us: u64,
    /// Frame after which the host stops the bus (0 = never)
    #[serde(default = "BusSettings::default_suspend_after")]
    pub suspend_after_frames: u32,
    /// Chance that the peripheral abandons a start
    #[serde(default)]
    pub start_glitch_probability: f64,
    /// Host enables remote wakeup and the device uses it to end the suspend
    #[serde(default = "BusSettings::default_remote_wakeup")]
    pub remote_wakeup: bool,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            frames: Self::default_frames(),
            frame_interval_us: Self::default_frame_interval(),
            suspend_after_frames: Self::default_suspend_after(),
            start_glitch_probability: 0.0,
            remote_wakeup: Self::default_remote_wakeup(),
        }
    }
}

impl BusSettings {
    fn default_frames() -> u32 {
        2000
    }

    fn default_frame_interval() -> u64 {
        1000
    }

    fn default_suspend_after() -> u32 {
        1000
    }

    fn default_remote_wakeup() -> bool {
        true
    }
}

/// Identity published in the device and string descriptors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: 0x1209,
            product_id: 0x0001,
            manufacturer: "usbd".to_string(),
            product: "usbd simulated device".to_string(),
            serial: "SIM0001".to_string(),
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            sim: SimSettings {
                log_level: "info".to_string(),
                mode: Mode::Buffered,
                queue_capacity: SimSettings::default_queue_capacity(),
                enable_sof: false,
            },
            bus: BusSettings::default(),
            device: DeviceSettings::default(),
        }
    }
}

impl SimConfig {
    /// Load configuration from the specified path
    ///
    /// Without a path only the default location is tried.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref()),
            None => {
                let default = Self::default_path();
                if !default.exists() {
                    return Err(anyhow!("No configuration file found, using defaults"));
                }
                default
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: SimConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbd-sim").join("sim.toml")
        } else {
            PathBuf::from(".config/usbd-sim/sim.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.sim.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.sim.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.sim.mode == Mode::Buffered && self.sim.queue_capacity == 0 {
            return Err(anyhow!("queue_capacity must be non-zero in buffered mode"));
        }

        let p = self.bus.start_glitch_probability;
        if !(0.0..=1.0).contains(&p) {
            return Err(anyhow!(
                "Invalid start_glitch_probability {}, must be within [0, 1]",
                p
            ));
        }

        Ok(())
    }
}
