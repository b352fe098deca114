//! Code for the configuration of the application.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The configuration of the application: every printer the farm manages.
#[derive(Default, Debug, Clone, Deserialize, Serialize)]
pub struct FarmConfig {
    /// The devices this instance manages.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl FarmConfig {
    /// Parse a configuration from a toml file.
    pub fn from_file(file: &Path) -> Result<Self> {
        let config = std::fs::read_to_string(file)?;
        Self::from_str(&config)
    }

    /// Parse a configuration from a toml string.
    pub fn from_str(config: &str) -> Result<Self> {
        let config: FarmConfig =
            toml::from_str(config).map_err(|e| Error::Validation(format!("bad config: {e}")))?;
        for device in &config.devices {
            device.validate()?;
        }
        Ok(config)
    }

    /// Get the configuration for a single device by id.
    pub fn device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == id)
    }
}

/// Registration record for one managed printer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Stable identifier, unique across the farm.
    pub id: String,

    /// Human-readable name shown to operators.
    pub name: String,

    /// How to reach the hardware.
    pub transport: TransportConfig,

    /// Disabled devices are kept registered but refuse new jobs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Connect as soon as the device is registered.
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    /// Give up on automatic reconnection after this many attempts.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Interval between orchestrator health-check polls.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

impl DeviceConfig {
    /// Reject configs that can never work before they reach the registry.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("device id must not be empty".into()));
        }
        if let TransportConfig::Serial { port, baud, .. } = &self.transport {
            if port.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "device {}: serial port must not be empty",
                    self.id
                )));
            }
            if *baud == 0 {
                return Err(Error::Validation(format!("device {}: baud must be non-zero", self.id)));
            }
        }
        if let TransportConfig::Network { base_url, .. } = &self.transport {
            if base_url.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "device {}: base_url must not be empty",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Interval between health-check polls, as a [Duration].
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Transport-specific connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Line-oriented G-code printer on a serial port.
    Serial {
        /// Serial port path (`/dev/ttyUSB0`, `COM3`, ...).
        port: String,
        /// Baud rate of the serial connection.
        #[serde(default = "default_baud")]
        baud: u32,
        /// Which firmware dialect to use for pause/resume/cancel sequences.
        #[serde(default)]
        firmware: crate::transport::FirmwareKind,
    },

    /// Printer exposing an HTTP+JSON control API.
    Network {
        /// Base URL of the control API (`http://voron.local:7125`).
        base_url: String,
        /// Optional API key sent as the `X-Api-Key` header.
        #[serde(default)]
        api_key: Option<String>,
        /// Relative endpoint paths, overridable per vendor.
        #[serde(default)]
        endpoints: EndpointMap,
    },

    /// A transport that accepts everything and talks to nothing. Used for
    /// dry runs and tests.
    Noop,
}

impl TransportConfig {
    /// Short label for logs and status output.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Serial { .. } => "serial",
            TransportConfig::Network { .. } => "network",
            TransportConfig::Noop => "noop",
        }
    }
}

/// Relative paths of the control endpoints a network printer must expose.
/// Differing vendor APIs are adapted here, in config, without code changes --
/// provided they fit the {status, command, upload, job} shape.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EndpointMap {
    /// GET: current printer state and telemetry.
    pub status: String,
    /// POST: run a single protocol command.
    pub command: String,
    /// POST (multipart): upload a file to print.
    pub upload: String,
    /// POST: job control (start/pause/resume/cancel), action appended.
    pub job: String,
    /// GET: lightweight version probe used by the connect handshake.
    pub version: String,
}

impl Default for EndpointMap {
    fn default() -> Self {
        // Moonraker-shaped defaults.
        Self {
            status: "/printer/objects/query?webhooks&virtual_sdcard&print_stats&extruder&heater_bed&toolhead".into(),
            command: "/printer/gcode/script".into(),
            upload: "/server/files/upload".into(),
            job: "/printer/print".into(),
            version: "/printer/info".into(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_baud() -> u32 {
    115_200
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_health_check_interval_ms() -> u64 {
    15_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_from_str_serial_and_network() {
        let config = r#"
            [[devices]]
            id = "prusa-1"
            name = "Prusa MK3 (bench)"
            transport = { kind = "serial", port = "/dev/ttyUSB0", baud = 250000 }

            [[devices]]
            id = "voron-1"
            name = "Voron 2.4"
            auto_connect = false
            transport = { kind = "network", base_url = "http://voron.local:7125" }
        "#;
        let config = FarmConfig::from_str(config).unwrap();
        assert_eq!(config.devices.len(), 2);

        let prusa = config.device("prusa-1").unwrap();
        assert!(prusa.enabled);
        assert!(prusa.auto_connect);
        assert_eq!(prusa.max_reconnect_attempts, 5);
        match &prusa.transport {
            TransportConfig::Serial { port, baud, .. } => {
                assert_eq!(port, "/dev/ttyUSB0");
                assert_eq!(*baud, 250_000);
            }
            other => panic!("expected serial transport, got {other:?}"),
        }

        let voron = config.device("voron-1").unwrap();
        assert!(!voron.auto_connect);
        match &voron.transport {
            TransportConfig::Network { endpoints, api_key, .. } => {
                assert!(api_key.is_none());
                assert_eq!(endpoints.upload, "/server/files/upload");
            }
            other => panic!("expected network transport, got {other:?}"),
        }

        assert!(config.device("nope").is_none());
    }

    #[test]
    fn test_config_rejects_empty_port() {
        let config = r#"
            [[devices]]
            id = "p1"
            name = "bad"
            transport = { kind = "serial", port = "" }
        "#;
        assert!(FarmConfig::from_str(config).is_err());
    }

    #[test]
    fn test_config_rejects_empty_id() {
        let config = r#"
            [[devices]]
            id = ""
            name = "bad"
            transport = { kind = "noop" }
        "#;
        assert!(FarmConfig::from_str(config).is_err());
    }
}
