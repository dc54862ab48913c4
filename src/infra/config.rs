//! Configuration loading from TOML files
//!
//! Config file is selected via `--config <path>` (default: config/dev.toml).
//! Every section is optional; a missing or unreadable file yields defaults.

use crate::domain::inventory::LONG_TERM_SHELF_LIFE_DAYS;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Environment variable overriding `recognition.api_key`
pub const CLASSIFIER_API_KEY_ENV: &str = "FRIDGE_CLASSIFIER_API_KEY";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// Serial sensor board plus capture command; falls back to the simulator
    Physical,
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Identifier used as MQTT client id and notification source prefix
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: "fridge".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub mode: HardwareMode,
    pub serial_device: String,
    pub serial_baud: u32,
    /// Still-capture command; `{output}` is replaced by the frame path
    pub capture_command: Vec<String>,
    pub capture_dir: String,
    pub capture_timeout_ms: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            mode: HardwareMode::Physical,
            serial_device: "/dev/ttyUSB0".to_string(),
            serial_baud: 9600,
            capture_command: vec![
                "rpicam-still".to_string(),
                "-n".to_string(),
                "-t".to_string(),
                "1".to_string(),
                "-o".to_string(),
                "{output}".to_string(),
            ],
            capture_dir: "captures".to_string(),
            capture_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    pub debounce_ms: u64,
    /// Rising edge fires below this distance
    pub near_cm: f64,
    /// Detector re-arms at or above this distance
    pub far_cm: f64,
    pub queue_capacity: usize,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self { debounce_ms: 500, near_cm: 50.0, far_cm: 60.0, queue_capacity: 64 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub queue_capacity: usize,
    pub handler_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { queue_capacity: 1024, handler_timeout_ms: 5000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Upper bound for obtaining a frame, camera contention included
    pub capture_wait_ms: u64,
    pub busy_retry_ms: u64,
    /// Upper bound for the whole recognition phase, retries included
    pub recognition_timeout_ms: u64,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self { capture_wait_ms: 5000, busy_retry_ms: 100, recognition_timeout_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub attempt_timeout_ms: u64,
    pub default_shelf_life_days: u32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/classify".to_string(),
            api_key: None,
            max_attempts: 3,
            base_backoff_ms: 500,
            attempt_timeout_ms: 8000,
            default_shelf_life_days: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub snapshot_file: String,
    pub expiring_soon_days: i64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self { snapshot_file: "inventory.json".to_string(), expiring_soon_days: 2 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Per-subscriber buffer; a subscriber that falls this far behind is dropped
    pub subscriber_buffer: usize,
    pub reconnect_delay_secs: u64,
    pub mqtt_enabled: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_topic: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            reconnect_delay_secs: 5,
            mqtt_enabled: false,
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_topic: "fridge/events".to_string(),
            mqtt_username: None,
            mqtt_password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// HTTP port for /metrics, /inventory, /recommendations (0 to disable)
    pub http_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 10, http_port: 9090 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub site: SiteConfig,
    pub hardware: HardwareConfig,
    pub signals: SignalsConfig,
    pub bus: BusConfig,
    pub correlator: CorrelatorConfig,
    pub recognition: RecognitionConfig,
    pub inventory: InventoryConfig,
    pub notify: NotifyConfig,
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    hardware: HardwareConfig,
    signals: SignalsConfig,
    bus: BusConfig,
    correlator: CorrelatorConfig,
    recognition: RecognitionConfig,
    inventory: InventoryConfig,
    notify: NotifyConfig,
    metrics: MetricsConfig,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let mut recognition = toml_config.recognition;
        if let Ok(key) = env::var(CLASSIFIER_API_KEY_ENV) {
            if !key.is_empty() {
                recognition.api_key = Some(key);
            }
        }

        if recognition.default_shelf_life_days > LONG_TERM_SHELF_LIFE_DAYS {
            warn!(
                configured = %recognition.default_shelf_life_days,
                max = %LONG_TERM_SHELF_LIFE_DAYS,
                "default_shelf_life_clamped"
            );
            recognition.default_shelf_life_days = LONG_TERM_SHELF_LIFE_DAYS;
        }

        let mut signals = toml_config.signals;
        if signals.far_cm < signals.near_cm {
            warn!(near_cm = %signals.near_cm, far_cm = %signals.far_cm, "proximity_far_below_near_clamped");
            signals.far_cm = signals.near_cm;
        }

        Self {
            site_id: toml_config.site.id,
            hardware: toml_config.hardware,
            signals,
            bus: toml_config.bus,
            correlator: toml_config.correlator,
            recognition,
            inventory: toml_config.inventory,
            notify: toml_config.notify,
            metrics: toml_config.metrics,
            config_file,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    // Hardware
    pub fn hardware_mode(&self) -> HardwareMode {
        self.hardware.mode
    }

    pub fn serial_device(&self) -> &str {
        &self.hardware.serial_device
    }

    pub fn serial_baud(&self) -> u32 {
        self.hardware.serial_baud
    }

    pub fn capture_command(&self) -> &[String] {
        &self.hardware.capture_command
    }

    pub fn capture_dir(&self) -> PathBuf {
        PathBuf::from(&self.hardware.capture_dir)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.hardware.capture_timeout_ms)
    }

    // Signal conditioning
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.signals.debounce_ms)
    }

    pub fn proximity_near_cm(&self) -> f64 {
        self.signals.near_cm
    }

    pub fn proximity_far_cm(&self) -> f64 {
        self.signals.far_cm
    }

    pub fn signal_queue_capacity(&self) -> usize {
        self.signals.queue_capacity.max(1)
    }

    // Bus
    pub fn bus_queue_capacity(&self) -> usize {
        self.bus.queue_capacity.max(1)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.bus.handler_timeout_ms)
    }

    // Correlator
    pub fn capture_wait(&self) -> Duration {
        Duration::from_millis(self.correlator.capture_wait_ms)
    }

    pub fn busy_retry_interval(&self) -> Duration {
        Duration::from_millis(self.correlator.busy_retry_ms)
    }

    pub fn recognition_timeout(&self) -> Duration {
        Duration::from_millis(self.correlator.recognition_timeout_ms)
    }

    // Recognition
    pub fn classifier_endpoint(&self) -> &str {
        &self.recognition.endpoint
    }

    pub fn classifier_api_key(&self) -> Option<&str> {
        self.recognition.api_key.as_deref()
    }

    pub fn recognition_max_attempts(&self) -> u32 {
        self.recognition.max_attempts.max(1)
    }

    pub fn recognition_base_backoff(&self) -> Duration {
        Duration::from_millis(self.recognition.base_backoff_ms)
    }

    pub fn recognition_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.recognition.attempt_timeout_ms)
    }

    /// Shelf life for fallback items, `1..=LONG_TERM_SHELF_LIFE_DAYS`
    pub fn default_shelf_life_days(&self) -> u32 {
        self.recognition.default_shelf_life_days.clamp(1, LONG_TERM_SHELF_LIFE_DAYS)
    }

    // Inventory
    pub fn snapshot_file(&self) -> &str {
        &self.inventory.snapshot_file
    }

    pub fn expiring_soon(&self) -> chrono::Duration {
        chrono::Duration::days(self.inventory.expiring_soon_days)
    }

    // Notifications
    pub fn subscriber_buffer(&self) -> usize {
        self.notify.subscriber_buffer.max(1)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.notify.reconnect_delay_secs)
    }

    pub fn mqtt_enabled(&self) -> bool {
        self.notify.mqtt_enabled
    }

    pub fn mqtt_host(&self) -> &str {
        &self.notify.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.notify.mqtt_port
    }

    pub fn mqtt_topic(&self) -> &str {
        &self.notify.mqtt_topic
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.notify.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.notify.mqtt_password.as_deref()
    }

    // Metrics
    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs.max(1)
    }

    pub fn http_port(&self) -> u16 {
        self.metrics.http_port
    }

    /// Builder for tests: simulated hardware, snapshot in `dir`, no HTTP, short timings
    pub fn for_tests(dir: &Path) -> Self {
        let mut config = Self::default();
        config.hardware.mode = HardwareMode::Simulated;
        config.hardware.capture_dir = dir.join("captures").display().to_string();
        config.hardware.capture_timeout_ms = 1000;
        config.inventory.snapshot_file = dir.join("inventory.json").display().to_string();
        config.metrics.http_port = 0;
        config.recognition.base_backoff_ms = 10;
        config.recognition.attempt_timeout_ms = 500;
        config.correlator.capture_wait_ms = 1000;
        config.correlator.busy_retry_ms = 10;
        config.correlator.recognition_timeout_ms = 5000;
        config
    }

    pub fn with_recognition_timeout_ms(mut self, ms: u64) -> Self {
        self.correlator.recognition_timeout_ms = ms;
        self
    }
}
