use crate::ble_common;
use crate::link::DiscoveryFilter;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    /// Directory for diagnostic log files. Unset = no file logging.
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub ble: BleSettings,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub controls: ControlSettings,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BleSettings {
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_command_uuid")]
    pub command_uuid: String,
    #[serde(default = "default_name_prefixes")]
    pub name_prefixes: Vec<String>,
    #[serde(default = "default_scan_seconds")]
    pub scan_seconds: u64,
    /// Pick this advertised name when several robots are in range.
    #[serde(default)]
    pub preferred_device: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SerialSettings {
    /// Port path; unset = first USB serial port.
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_baud_rate")]
    pub flash_baud_rate: u32,
    /// Firmware image offered by the flash prompt.
    #[serde(default)]
    pub firmware: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ControlSettings {
    #[serde(default = "default_forward")]
    pub forward: String,
    #[serde(default = "default_backward")]
    pub backward: String,
    #[serde(default = "default_left")]
    pub left: String,
    #[serde(default = "default_right")]
    pub right: String,
    #[serde(default = "default_stop")]
    pub stop: String,
    /// Dead man's switch: send `stop` when a direction is released.
    #[serde(default)]
    pub send_stop_on_release: bool,
    #[serde(default)]
    pub speed_min: u16,
    #[serde(default = "default_speed_max")]
    pub speed_max: u16,
    #[serde(default = "default_speed_initial")]
    pub speed_initial: u16,
    #[serde(default = "default_speed_step")]
    pub speed_step: u16,
}

fn default_service_uuid() -> String {
    ble_common::NUS_SERVICE_UUID.to_string()
}
fn default_command_uuid() -> String {
    ble_common::NUS_RX_UUID.to_string()
}
fn default_name_prefixes() -> Vec<String> {
    vec!["Super".to_string(), "ESP32".to_string(), "Robot".to_string()]
}
fn default_scan_seconds() -> u64 {
    10
}
fn default_baud_rate() -> u32 {
    115_200
}
fn default_forward() -> String {
    "F".to_string()
}
fn default_backward() -> String {
    "B".to_string()
}
fn default_left() -> String {
    "L".to_string()
}
fn default_right() -> String {
    "R".to_string()
}
fn default_stop() -> String {
    "S".to_string()
}
fn default_speed_max() -> u16 {
    255
}
fn default_speed_initial() -> u16 {
    150
}
fn default_speed_step() -> u16 {
    10
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            service_uuid: default_service_uuid(),
            command_uuid: default_command_uuid(),
            name_prefixes: default_name_prefixes(),
            scan_seconds: default_scan_seconds(),
            preferred_device: None,
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            flash_baud_rate: default_baud_rate(),
            firmware: None,
        }
    }
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            forward: default_forward(),
            backward: default_backward(),
            left: default_left(),
            right: default_right(),
            stop: default_stop(),
            send_stop_on_release: false,
            speed_min: 0,
            speed_max: default_speed_max(),
            speed_initial: default_speed_initial(),
            speed_step: default_speed_step(),
        }
    }
}

impl BleSettings {
    /// Build the discovery filter, validating the configured UUIDs.
    pub fn filter(&self) -> Result<DiscoveryFilter, String> {
        let service = Uuid::parse_str(&self.service_uuid)
            .map_err(|e| format!("Invalid service_uuid '{}': {}", self.service_uuid, e))?;
        let command = Uuid::parse_str(&self.command_uuid)
            .map_err(|e| format!("Invalid command_uuid '{}': {}", self.command_uuid, e))?;
        Ok(DiscoveryFilter {
            service,
            command,
            name_prefixes: self.name_prefixes.clone(),
            preferred_name: self.preferred_device.clone(),
            scan_window: std::time::Duration::from_secs(self.scan_seconds.max(1)),
        })
    }
}

/// `<config_dir>/robolink/settings.toml`
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("robolink")
        .join("settings.toml")
}

/// Load settings from `path`. On first run the defaults are written there.
pub fn load_settings(path: &Path) -> Result<Settings, String> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read settings: {}", e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse settings: {}", e))
    } else {
        let settings = Settings::default();
        save_settings(path, &settings)?;
        tlog!("[settings] Wrote default settings to {}", path.display());
        Ok(settings)
    }
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<(), String> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| format!("Failed to create config dir: {}", e))?;
    }
    let content = toml::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    std::fs::write(path, content).map_err(|e| format!("Failed to write settings: {}", e))
}
