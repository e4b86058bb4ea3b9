//! Integration tests for configuration parsing
//!
//! Tests driver configuration parsing, including:
//! - Minimal and full files
//! - Section defaults
//! - Invalid values
//! - Save/load round trip through the filesystem

use driver::config::DriverConfig;
use std::time::Duration;

const FULL_CONFIG: &str = r#"
[driver]
log_level = "debug"

[device]
vendor_id = "0x045e"
product_id = "0x028e"
name = "Xbox 360 Controller"
interface = 0

[transfers]
writes_in_flight = 4
drain_timeout_ms = 2000
poll_slice_ms = 50
event_queue = 64
"#;

mod parsing {
    use super::*;

    #[test]
    fn test_full_config() {
        let config = DriverConfig::parse(FULL_CONFIG).unwrap();

        assert_eq!(config.driver.log_level, "debug");
        assert_eq!(config.vendor_id().unwrap(), 0x045e);
        assert_eq!(config.product_id().unwrap(), 0x028e);
        assert_eq!(config.device.name, "Xbox 360 Controller");
        assert_eq!(config.transfers.writes_in_flight, 4);
        assert_eq!(config.poll_slice(), Duration::from_millis(50));
        assert_eq!(
            config.device_options().drain_timeout,
            Duration::from_millis(2000)
        );
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = DriverConfig::parse("").unwrap();

        assert_eq!(config.vendor_id().unwrap(), 0x046d);
        assert_eq!(config.product_id().unwrap(), 0xc21d);
        assert_eq!(config.device.name, "Gamepad F310");
        assert_eq!(config.transfers.writes_in_flight, 8);
        assert_eq!(config.transfers.drain_timeout_ms, 5000);
    }

    #[test]
    fn test_partial_transfers_section() {
        let config = DriverConfig::parse(
            r#"
[transfers]
drain_timeout_ms = 1000
"#,
        )
        .unwrap();

        assert_eq!(config.transfers.drain_timeout_ms, 1000);
        assert_eq!(config.transfers.writes_in_flight, 8);
        assert_eq!(config.transfers.event_queue, 256);
    }

    #[test]
    fn test_device_name_and_interface_default() {
        let config = DriverConfig::parse(
            r#"
[device]
vendor_id = "0x046d"
product_id = "0xc21f"
"#,
        )
        .unwrap();

        assert_eq!(config.product_id().unwrap(), 0xc21f);
        assert_eq!(config.device.name, "Gamepad F310");
        assert_eq!(config.device.interface, 0);
    }
}

mod invalid {
    use super::*;

    #[test]
    fn test_bad_vendor_id() {
        let err = DriverConfig::parse(
            r#"
[device]
vendor_id = "046d"
product_id = "0xc21d"
"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_missing_product_id() {
        let err = DriverConfig::parse(
            r#"
[device]
vendor_id = "0x046d"
"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_zero_permits() {
        let err = DriverConfig::parse(
            r#"
[transfers]
writes_in_flight = 0
"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_unknown_log_level() {
        let err = DriverConfig::parse(
            r#"
[driver]
log_level = "verbose"
"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_not_toml() {
        assert!(DriverConfig::parse("this is = = not toml").is_err());
    }
}

mod files {
    use super::*;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("driver.toml");

        let mut config = DriverConfig::default();
        config.device.name = "Test Pad".to_string();
        config.transfers.poll_slice_ms = 20;
        config.save(&path).unwrap();

        let loaded = DriverConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.device.name, "Test Pad");
        assert_eq!(loaded.transfers.poll_slice_ms, 20);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(DriverConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driver.toml");
        std::fs::write(&path, "[transfers]\npoll_slice_ms = 0\n").unwrap();

        assert!(DriverConfig::load(Some(path)).is_err());
    }
}
