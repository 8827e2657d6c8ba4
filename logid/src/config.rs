//! The JSON configuration file of the daemon.

use std::{
    collections::HashMap,
    fs,
    io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use logid_hidpp::options::Options;
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/logid.json";

#[derive(Clone, PartialEq, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Tunables of the HID++ core.
    pub options: Options,

    /// The default `tracing` filter, overridden by `RUST_LOG`.
    pub log_level: Option<String>,

    /// Settings applied to every device whose name matches the key.
    pub devices: HashMap<String, DeviceSettings>,
}

#[derive(Clone, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSettings {
    /// The sensor resolution. Rounded to the closest supported value.
    pub dpi: Option<u16>,

    pub smartshift: Option<SmartShiftSettings>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmartShiftSettings {
    /// Whether the ratchet is engaged.
    pub on: bool,

    /// The wheel speed disengaging the ratchet, `255` keeps it engaged.
    #[serde(default)]
    pub threshold: Option<u8>,

    /// The force needed to disengage the ratchet, if the device supports
    /// tuning it.
    #[serde(default)]
    pub torque: Option<u8>,
}

impl Config {
    /// Loads the configuration. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no configuration file, using defaults");
                return Ok(Self::default());
            },
            Err(err) => {
                return Err(err).with_context(|| format!("could not read {}", path.display()));
            },
        };

        Self::parse(&raw).with_context(|| format!("invalid configuration in {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceSettings> {
        self.devices.get(name)
    }
}

pub fn default_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_settings() {
        let config = Config::parse(
            r#"{
                "options": { "io_timeout_ms": 1000 },
                "devices": {
                    "MX Master 3S": {
                        "dpi": 1600,
                        "smartshift": { "on": true, "threshold": 12 }
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.options.io_timeout_ms, 1000);
        assert_eq!(config.options.software_id, Options::default().software_id);

        let settings = config.device("MX Master 3S").unwrap();
        assert_eq!(settings.dpi, Some(1600));
        assert_eq!(
            settings.smartshift,
            Some(SmartShiftSettings {
                on: true,
                threshold: Some(12),
                torque: None,
            })
        );
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(Config::parse(r#"{ "devics": {} }"#).is_err());
    }

    #[test]
    fn missing_files_yield_defaults() {
        let config = Config::load(Path::new("/nonexistent/logid.json")).unwrap();
        assert_eq!(config, Config::default());
    }
}
