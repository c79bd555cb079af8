use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::infrastructure::bluetooth::protocol::{self, SensorIdMap};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            console_logging_enabled: default_true(),
            file_logging_enabled: default_false(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_target: default_true(),
            ansi_colors: default_true(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "frames_head_tracker".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// Advertised-name prefix accepted as a match when a peripheral does not
    /// advertise the head-tracking service UUID.
    #[serde(default = "default_name_prefix")]
    pub device_name_prefix: String,

    /// Sensor wire-id assignment. Firmware revisions disagree about the
    /// accelerometer/gyroscope ids; override after confirming on hardware.
    #[serde(default)]
    pub sensor_ids: SensorIdMap,

    /// Rotation-stream update period while tracking, in milliseconds.
    /// Must be one of the periods the firmware accepts.
    #[serde(default = "default_rotation_period")]
    pub rotation_period_ms: u16,

    /// How long a config write may stay unacknowledged/unconfirmed before it
    /// fails. BLE writes can silently never complete.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            device_name_prefix: default_name_prefix(),
            sensor_ids: SensorIdMap::default(),
            rotation_period_ms: default_rotation_period(),
            write_timeout_ms: default_write_timeout(),
            log_settings: LogSettings::default(),
        }
    }
}

fn default_name_prefix() -> String {
    protocol::DEVICE_NAME_PREFIX.to_string()
}
fn default_rotation_period() -> u16 {
    80
}
fn default_write_timeout() -> u64 {
    3000
}

impl TrackerSettings {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Loads and persists [`TrackerSettings`] as JSON in the user config
/// directory.
pub struct SettingsService {
    settings: TrackerSettings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("FramesHeadTracker");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<TrackerSettings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &TrackerSettings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut TrackerSettings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let settings = TrackerSettings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let back: TrackerSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back.device_name_prefix, protocol::DEVICE_NAME_PREFIX);
        assert_eq!(back.rotation_period_ms, 80);
        assert_eq!(back.write_timeout_ms, 3000);
        assert_eq!(back.sensor_ids, SensorIdMap::default());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: TrackerSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.rotation_period_ms, 80);
        assert!(protocol::is_valid_period(settings.rotation_period_ms));
    }
}
