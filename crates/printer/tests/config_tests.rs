//! Integration tests for configuration parsing
//!
//! Tests loading, saving and validating the printer configuration file.

use printer::config::{PrinterConfig, load_config};
use std::fs;
use std::time::Duration;

const FULL_CONFIG: &str = r#"
[general]
log_level = "debug"

[printer]
vendor_id = 0x0483
product_id = 0x5743

[transfer]
timeout_secs = 30
queue_depth = 4

[permission]
timeout_ms = 250
"#;

#[test]
fn test_load_full_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("printer.toml");
    fs::write(&path, FULL_CONFIG).unwrap();

    let config = PrinterConfig::load(Some(path)).unwrap();
    assert_eq!(config.general.log_level, "debug");
    assert_eq!(config.printer.ids(), Some((0x0483, 0x5743)));
    assert_eq!(config.permission.timeout(), Duration::from_millis(250));

    let settings = config.adapter_settings();
    assert_eq!(settings.transfer_timeout, Duration::from_secs(30));
    assert_eq!(settings.queue_depth, 4);
}

#[test]
fn test_empty_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("printer.toml");
    fs::write(&path, "").unwrap();

    let config = PrinterConfig::load(Some(path)).unwrap();
    assert_eq!(config, PrinterConfig::default());
}

#[test]
fn test_partial_sections_fill_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("printer.toml");
    fs::write(&path, "[transfer]\nqueue_depth = 2\n").unwrap();

    let config = PrinterConfig::load(Some(path)).unwrap();
    assert_eq!(config.transfer.queue_depth, 2);
    assert_eq!(config.transfer.timeout_secs, 100);
    assert_eq!(config.general.log_level, "info");
}

#[test]
fn test_invalid_values_rejected() {
    let dir = tempfile::tempdir().unwrap();

    let cases = [
        "[general]\nlog_level = \"loud\"\n",
        "[transfer]\ntimeout_secs = 0\n",
        "[printer]\nvendor_id = 0x0483\n",
        "[printer]\nvendor_id = 70000\nproduct_id = 1\n",
        "[transfer]\nqueue_depth = \"many\"\n",
    ];

    for (i, content) in cases.iter().enumerate() {
        let path = dir.path().join(format!("bad-{}.toml", i));
        fs::write(&path, content).unwrap();
        assert!(
            PrinterConfig::load(Some(path)).is_err(),
            "accepted invalid config: {}",
            content
        );
    }
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    assert!(PrinterConfig::load(Some(path)).is_err());
}

#[test]
fn test_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("printer.toml");

    let mut config = PrinterConfig::default();
    config.printer.vendor_id = Some(0x0416);
    config.printer.product_id = Some(0x5011);
    config.transfer.timeout_secs = 10;
    config.save(&path).unwrap();

    let reloaded = load_config(path.to_str().unwrap()).unwrap();
    assert_eq!(reloaded, config);
}

#[test]
fn test_default_path_location() {
    let path = PrinterConfig::default_path();
    assert!(path.ends_with("escpos-usb/printer.toml"));
}
