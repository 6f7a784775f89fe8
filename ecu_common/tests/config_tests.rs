//! Integration coverage for `ConfigLoader` against real files on disk.
//!
//! `config.rs`'s own unit tests cover the loader against a single
//! `NamedTempFile`; this exercises it the way a binary actually does at
//! startup — a config directory with a named file in it — and a nested,
//! validated struct shaped like a real calibration file.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tempfile::TempDir;

use ecu_common::config::{ConfigError, ConfigLoader};

/// A calibration file shaped like a real firmware config: nested tables,
/// `deny_unknown_fields`, and a `validate()` pass layered on top of `serde`.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
struct DemoConfig {
    tooth_count_total: u16,
    safety: DemoSafety,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
struct DemoSafety {
    over_rev_rpm: u16,
    over_rev_clear_rpm: u16,
}

impl DemoConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(8..=200).contains(&self.tooth_count_total) {
            return Err(ConfigError::ValidationError(format!(
                "tooth_count_total {} out of range [8, 200]",
                self.tooth_count_total
            )));
        }
        if self.safety.over_rev_clear_rpm >= self.safety.over_rev_rpm {
            return Err(ConfigError::ValidationError(
                "safety.over_rev_clear_rpm must be below safety.over_rev_rpm".into(),
            ));
        }
        Ok(())
    }
}

/// Write a valid `ecu.toml` into `dir` and return its path.
fn write_valid_toml(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("ecu.toml");
    fs::write(
        &path,
        r#"
tooth_count_total = 58

[safety]
over_rev_rpm = 7500
over_rev_clear_rpm = 6800
"#,
    )
    .unwrap();
    path
}

/// Test: loading a config file that does not exist in an otherwise-valid
/// directory surfaces `FileNotFound`, not a generic I/O error.
#[test]
fn load_missing_file_in_existing_directory() {
    let tmp = TempDir::new().unwrap();
    let result = DemoConfig::load(&tmp.path().join("ecu.toml"));
    assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
}

/// Test: a file with unknown fields is rejected at parse time via
/// `deny_unknown_fields`, before `validate()` ever runs.
#[test]
fn unknown_field_rejected_at_parse_time() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("ecu.toml");
    fs::write(
        &path,
        r#"
tooth_count_total = 58
bogus_field = true

[safety]
over_rev_rpm = 7500
over_rev_clear_rpm = 6800
"#,
    )
    .unwrap();

    let result = DemoConfig::load(&path);
    assert!(matches!(result, Err(ConfigError::ParseError(_))));
}

/// Test: a well-formed file loads and round-trips through to a passing
/// `validate()` call.
#[test]
fn valid_file_loads_and_validates() {
    let tmp = TempDir::new().unwrap();
    let path = write_valid_toml(tmp.path());

    let cfg = DemoConfig::load(&path).unwrap();
    assert_eq!(cfg.tooth_count_total, 58);
    assert!(cfg.validate().is_ok());
}

/// Test: inverted over-rev hysteresis parses fine but fails `validate()`.
#[test]
fn inverted_hysteresis_fails_validation_not_parsing() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("ecu.toml");
    fs::write(
        &path,
        r#"
tooth_count_total = 58

[safety]
over_rev_rpm = 6000
over_rev_clear_rpm = 6800
"#,
    )
    .unwrap();

    let cfg = DemoConfig::load(&path).expect("syntactically valid TOML should parse");
    assert!(matches!(cfg.validate(), Err(ConfigError::ValidationError(_))));
}

/// Test: `load_from_str` takes the same in-memory path the firmware's own
/// round-trip tests use, independent of any file on disk.
#[test]
fn load_from_str_matches_file_backed_load() {
    let tmp = TempDir::new().unwrap();
    let path = write_valid_toml(tmp.path());
    let from_file = DemoConfig::load(&path).unwrap();

    let toml_str = fs::read_to_string(&path).unwrap();
    let from_str = DemoConfig::load_from_str(&toml_str).unwrap();

    assert_eq!(from_file, from_str);
}
