//! Integration tests for simulator configuration files
//!
//! Tests the TOML layout the simulator reads, including:
//! - Minimal config relying on section defaults
//! - Full config with every section
//! - Values the loader must reject
//!
//! Run with: `cargo test -p sim --test config_tests`

use std::fs;

mod sim_config {
    use super::*;

    const MINIMAL_SIM_CONFIG: &str = r#"
[sim]
log_level = "info"
mode = "buffered"
"#;

    const FULL_SIM_CONFIG: &str = r#"
[sim]
log_level = "debug"
mode = "immediate"
queue_capacity = 64
enable_sof = true

[bus]
frames = 500
frame_interval_us = 125
suspend_after_frames = 250
start_glitch_probability = 0.25
remote_wakeup = false

[device]
vendor_id = 0x1209
product_id = 0x0042
manufacturer = "Example Labs"
product = "Loopback Gadget"
serial = "LB-0001"
"#;

    #[test]
    fn test_parse_minimal_sim_config() {
        let config: toml::Value = toml::from_str(MINIMAL_SIM_CONFIG).unwrap();

        let sim = config.get("sim").unwrap();
        assert_eq!(sim.get("log_level").unwrap().as_str().unwrap(), "info");
        assert_eq!(sim.get("mode").unwrap().as_str().unwrap(), "buffered");
        assert!(sim.get("queue_capacity").is_none());
        assert!(config.get("bus").is_none());
    }

    #[test]
    fn test_parse_full_sim_config() {
        let config: toml::Value = toml::from_str(FULL_SIM_CONFIG).unwrap();

        let sim = config.get("sim").unwrap();
        assert_eq!(sim.get("mode").unwrap().as_str().unwrap(), "immediate");
        assert_eq!(sim.get("queue_capacity").unwrap().as_integer().unwrap(), 64);
        assert!(sim.get("enable_sof").unwrap().as_bool().unwrap());

        let bus = config.get("bus").unwrap();
        assert_eq!(bus.get("frames").unwrap().as_integer().unwrap(), 500);
        assert_eq!(
            bus.get("frame_interval_us").unwrap().as_integer().unwrap(),
            125
        );
        assert_eq!(
            bus.get("start_glitch_probability")
                .unwrap()
                .as_float()
                .unwrap(),
            0.25
        );
        assert!(!bus.get("remote_wakeup").unwrap().as_bool().unwrap());

        let device = config.get("device").unwrap();
        assert_eq!(device.get("vendor_id").unwrap().as_integer().unwrap(), 0x1209);
        assert_eq!(device.get("product_id").unwrap().as_integer().unwrap(), 0x42);
        assert_eq!(
            device.get("product").unwrap().as_str().unwrap(),
            "Loopback Gadget"
        );
    }

    #[test]
    fn test_config_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.toml");
        fs::write(&path, FULL_SIM_CONFIG).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let config: toml::Value = toml::from_str(&content).unwrap();
        assert_eq!(
            config["device"]["serial"].as_str().unwrap(),
            "LB-0001"
        );
    }
}

mod invalid_configs {
    #[test]
    fn test_unknown_mode_is_a_string_not_an_enum() {
        // Accepted by TOML; rejected later by the typed loader
        let config: toml::Value = toml::from_str("[sim]\nmode = \"turbo\"\n").unwrap();
        assert_eq!(config["sim"]["mode"].as_str().unwrap(), "turbo");
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let result: Result<toml::Value, _> = toml::from_str("[sim\nmode = buffered");
        assert!(result.is_err());
    }

    #[test]
    fn test_probability_out_of_range_parses_as_float() {
        let config: toml::Value =
            toml::from_str("[bus]\nstart_glitch_probability = 1.5\n").unwrap();
        let p = config["bus"]["start_glitch_probability"].as_float().unwrap();
        assert!(!(0.0..=1.0).contains(&p));
    }
}
