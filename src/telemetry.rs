//! Device-reported state: connection status, printer status, and telemetry
//! snapshots (temperatures, position, progress).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the link to the hardware currently stands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No link.
    #[default]
    Disconnected,
    /// Handshake in flight.
    Connecting,
    /// Link established, polling active.
    Connected,
}

/// What the printer itself is doing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrinterStatus {
    /// Connected and not printing.
    Idle,
    /// Heaters ramping toward target.
    Heating,
    /// Actively printing.
    Printing,
    /// Print suspended, state retained.
    Paused,
    /// The device reported an error condition.
    Error,
    /// Unreachable, or status could not be read.
    #[default]
    Offline,
}

/// A single heater reading: current and target, in degrees Celsius.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct HeaterReading {
    /// Measured temperature.
    pub current: f64,
    /// Commanded target; 0.0 when the heater is off.
    pub target: f64,
}

/// Toolhead position, in millimeters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Position {
    /// X axis.
    pub x: f64,
    /// Y axis.
    pub y: f64,
    /// Z axis.
    pub z: f64,
}

/// Last-known device telemetry. Values may be stale; `captured_at` says how
/// stale.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct Telemetry {
    /// Hotend temperature reading.
    pub hotend: HeaterReading,
    /// Bed temperature reading.
    pub bed: HeaterReading,
    /// Toolhead position, if the device reports one.
    pub position: Option<Position>,
    /// Print progress in percent, if a job is running.
    pub progress: Option<f64>,
    /// When this snapshot was taken.
    pub captured_at: DateTime<Utc>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            hotend: HeaterReading::default(),
            bed: HeaterReading::default(),
            position: None,
            progress: None,
            captured_at: Utc::now(),
        }
    }
}

impl Telemetry {
    /// Merge newer readings into this snapshot, keeping fields the newer
    /// report did not carry.
    pub fn merge(&mut self, newer: &Telemetry) {
        if newer.hotend != HeaterReading::default() {
            self.hotend = newer.hotend;
        }
        if newer.bed != HeaterReading::default() {
            self.bed = newer.bed;
        }
        if newer.position.is_some() {
            self.position = newer.position;
        }
        if newer.progress.is_some() {
            self.progress = newer.progress;
        }
        self.captured_at = newer.captured_at;
    }
}

/// Externally visible runtime state for one device. This is what status
/// queries return; it is always available, even for a dead device.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeviceSnapshot {
    /// Device id.
    pub id: String,
    /// Human-readable name from config.
    pub name: String,
    /// Transport kind label (`serial`/`network`/`noop`).
    pub transport: String,
    /// Link state.
    pub connection: ConnectionStatus,
    /// Printer state. Never `Printing` unless `connection` is `Connected`.
    pub status: PrinterStatus,
    /// Last-known telemetry, possibly stale.
    pub telemetry: Telemetry,
    /// Circuit breaker state label (`closed`/`open`/`half_open`).
    pub circuit: String,
    /// Consecutive failures recorded by recovery.
    pub consecutive_failures: u32,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
    /// When any field last changed.
    pub last_update: DateTime<Utc>,
}

impl DeviceSnapshot {
    /// Degrade this snapshot to offline: the status becomes [PrinterStatus::Offline]
    /// while the last-known telemetry is retained, stale-but-labeled.
    pub fn offline(mut self) -> Self {
        self.connection = ConnectionStatus::Disconnected;
        self.status = PrinterStatus::Offline;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_unreported_fields() {
        let mut telemetry = Telemetry {
            hotend: HeaterReading { current: 210.0, target: 215.0 },
            bed: HeaterReading { current: 60.0, target: 60.0 },
            position: Some(Position { x: 10.0, y: 20.0, z: 0.3 }),
            progress: Some(42.0),
            ..Default::default()
        };

        // A bare temperature report with no position or progress.
        let newer = Telemetry {
            hotend: HeaterReading { current: 212.0, target: 215.0 },
            bed: HeaterReading { current: 60.5, target: 60.0 },
            ..Default::default()
        };
        telemetry.merge(&newer);

        assert_eq!(telemetry.hotend.current, 212.0);
        assert_eq!(telemetry.position, Some(Position { x: 10.0, y: 20.0, z: 0.3 }));
        assert_eq!(telemetry.progress, Some(42.0));
    }

    #[test]
    fn offline_snapshot_keeps_telemetry() {
        let snapshot = DeviceSnapshot {
            id: "p1".into(),
            name: "bench".into(),
            transport: "serial".into(),
            connection: ConnectionStatus::Connected,
            status: PrinterStatus::Printing,
            telemetry: Telemetry {
                hotend: HeaterReading { current: 200.0, target: 200.0 },
                ..Default::default()
            },
            circuit: "closed".into(),
            consecutive_failures: 0,
            reconnect_attempts: 0,
            last_update: Utc::now(),
        };

        let offline = snapshot.offline();
        assert_eq!(offline.status, PrinterStatus::Offline);
        assert_eq!(offline.connection, ConnectionStatus::Disconnected);
        assert_eq!(offline.telemetry.hotend.current, 200.0);
    }
}
