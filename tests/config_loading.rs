//! Settings loading from TOML files and `PICO_` environment variables.

use pico_daq::config::Settings;
use pico_daq::error::PicoError;
use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn clear_env() {
    for (key, _) in std::env::vars() {
        if key.starts_with("PICO_") {
            std::env::remove_var(key);
        }
    }
}

#[test]
#[serial]
fn minimal_file_uses_defaults() {
    clear_env();
    let file = write_config("[serial]\nport = \"/dev/ttyACM0\"\n");

    let settings = Settings::load_from(file.path()).unwrap();
    assert_eq!(settings.serial.port, "/dev/ttyACM0");
    assert_eq!(settings.serial.baud_rate, 230_400);
    assert_eq!(settings.session.timeout_budget, 3);
    assert_eq!(settings.markers.curve_end, vec!["+", "-"]);
    assert_eq!(settings.logging.level, "info");
}

#[test]
#[serial]
fn environment_overrides_file() {
    clear_env();
    let file = write_config(
        r#"
[serial]
port = "/dev/ttyUSB0"
read_timeout_ms = 500

[session]
timeout_budget = 2
"#,
    );

    std::env::set_var("PICO_SERIAL__PORT", "/dev/ttyUSB7");
    std::env::set_var("PICO_SESSION__TIMEOUT_BUDGET", "5");
    let settings = Settings::load_from(file.path());
    clear_env();

    let settings = settings.unwrap();
    assert_eq!(settings.serial.port, "/dev/ttyUSB7");
    assert_eq!(settings.serial.read_timeout_ms, 500);
    assert_eq!(settings.session.timeout_budget, 5);
}

#[test]
#[serial]
fn from_env_only() {
    clear_env();
    std::env::set_var("PICO_SERIAL__PORT", "COM4");
    std::env::set_var("PICO_LOGGING__LEVEL", "debug");
    let settings = Settings::from_env();
    clear_env();

    let settings = settings.unwrap();
    assert_eq!(settings.serial.port, "COM4");
    assert_eq!(settings.logging.level, "debug");
}

#[test]
#[serial]
fn invalid_values_rejected() {
    clear_env();
    let file = write_config("[serial]\nport = \"/dev/ttyUSB0\"\n\n[session]\ntimeout_budget = 0\n");
    let err = Settings::load_from(file.path()).unwrap_err();
    assert!(matches!(err, PicoError::Validation(ref msg) if msg.contains("timeout_budget")));

    let file = write_config(
        "[serial]\nport = \"/dev/ttyUSB0\"\n\n[markers]\npackage_start = \"*\"\n",
    );
    let err = Settings::load_from(file.path()).unwrap_err();
    assert!(err.to_string().contains("collides"));
}

#[test]
#[serial]
fn malformed_file_is_config_error() {
    clear_env();
    let file = write_config("[serial]\nport = \"/dev/ttyUSB0\"\nbaud_rate = \"fast\"\n");
    let err = Settings::load_from(file.path()).unwrap_err();
    assert!(matches!(err, PicoError::Config(_)));
}

#[test]
#[serial]
fn shipped_config_loads() {
    clear_env();
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/pico.toml");
    let settings = Settings::load_from(path).unwrap();
    assert_eq!(settings.serial.probe_command, "t");

    // rendering and reloading keeps every value
    let file = write_config(&settings.to_toml_string().unwrap());
    assert_eq!(Settings::load_from(file.path()).unwrap(), settings);
}
