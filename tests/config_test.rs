//! Integration tests for configuration loading

use fridge_gateway::infra::{Config, HardwareMode};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "kitchen"

[hardware]
mode = "simulated"
serial_device = "/dev/ttyAMA0"
serial_baud = 115200
capture_timeout_ms = 3000

[signals]
debounce_ms = 300
near_cm = 40.0
far_cm = 55.0

[correlator]
capture_wait_ms = 4000
recognition_timeout_ms = 20000

[recognition]
endpoint = "http://classifier.local/v1/classify"
max_attempts = 5
base_backoff_ms = 250
default_shelf_life_days = 5

[inventory]
snapshot_file = "/var/lib/fridge/inventory.json"
expiring_soon_days = 3

[notify]
reconnect_delay_secs = 2
mqtt_enabled = true
mqtt_host = "broker.local"
mqtt_topic = "home/fridge"

[metrics]
interval_secs = 15
http_port = 9191
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "kitchen");
    assert_eq!(config.hardware_mode(), HardwareMode::Simulated);
    assert_eq!(config.serial_device(), "/dev/ttyAMA0");
    assert_eq!(config.serial_baud(), 115200);
    assert_eq!(config.capture_timeout(), Duration::from_millis(3000));
    assert_eq!(config.debounce_window(), Duration::from_millis(300));
    assert_eq!(config.proximity_near_cm(), 40.0);
    assert_eq!(config.proximity_far_cm(), 55.0);
    assert_eq!(config.capture_wait(), Duration::from_millis(4000));
    assert_eq!(config.recognition_timeout(), Duration::from_secs(20));
    assert_eq!(config.classifier_endpoint(), "http://classifier.local/v1/classify");
    assert_eq!(config.recognition_max_attempts(), 5);
    assert_eq!(config.recognition_base_backoff(), Duration::from_millis(250));
    assert_eq!(config.default_shelf_life_days(), 5);
    assert_eq!(config.snapshot_file(), "/var/lib/fridge/inventory.json");
    assert_eq!(config.expiring_soon(), chrono::Duration::days(3));
    assert_eq!(config.reconnect_delay(), Duration::from_secs(2));
    assert!(config.mqtt_enabled());
    assert_eq!(config.mqtt_host(), "broker.local");
    assert_eq!(config.mqtt_port(), 1883);
    assert_eq!(config.mqtt_topic(), "home/fridge");
    assert_eq!(config.metrics_interval_secs(), 15);
    assert_eq!(config.http_port(), 9191);
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml");
    assert_eq!(config.config_file(), "default");
    assert_eq!(config.hardware_mode(), HardwareMode::Physical);
    assert_eq!(config.mqtt_host(), "localhost");
    assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
    assert_eq!(config.recognition_timeout(), Duration::from_secs(30));
}

#[test]
fn test_invalid_toml_is_an_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[signals\ndebounce_ms = ").unwrap();
    temp_file.flush().unwrap();

    let err = Config::from_file(temp_file.path()).unwrap_err();
    assert!(format!("{err:#}").contains("Failed to parse config file"));
}

#[test]
fn test_unknown_hardware_mode_is_rejected() {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(b"[hardware]\nmode = \"quantum\"\n").unwrap();
    temp_file.flush().unwrap();

    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_dev_config_parses() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/dev.toml");
    let config = Config::from_file(path).unwrap();
    assert_eq!(config.hardware_mode(), HardwareMode::Simulated);
    assert!(!config.mqtt_enabled());
}
