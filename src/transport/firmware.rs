//! Firmware-dialect command sequences.
//!
//! Pause/resume/cancel over a raw serial link are G-code injection, and the
//! right codes differ per firmware. The profile keeps those sequences
//! pluggable per device instead of hardcoding one vendor's dialect.

use serde::{Deserialize, Serialize};

/// Which stock profile a device uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareKind {
    /// Marlin with SD-card style pause/resume (`M25`/`M24`).
    #[default]
    Marlin,
    /// Klipper's native pause/resume macros.
    Klipper,
}

impl FirmwareKind {
    /// The command sequences for this dialect.
    pub fn profile(&self) -> FirmwareProfile {
        match self {
            FirmwareKind::Marlin => FirmwareProfile {
                pause: vec!["M25".into()],
                resume: vec!["M24".into()],
                // Cancel is pause plus heater shutdown; there is no single
                // abort code in this dialect.
                cancel: vec!["M25".into(), "M104 S0".into(), "M140 S0".into()],
                firmware_query: "M115".into(),
                temperature_query: "M105".into(),
                position_query: "M114".into(),
            },
            FirmwareKind::Klipper => FirmwareProfile {
                pause: vec!["PAUSE".into()],
                resume: vec!["RESUME".into()],
                cancel: vec!["CANCEL_PRINT".into()],
                firmware_query: "M115".into(),
                temperature_query: "M105".into(),
                position_query: "M114".into(),
            },
        }
    }
}

/// The concrete command sequences a serial transport sends for each control
/// operation.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FirmwareProfile {
    /// Commands that suspend the current print.
    pub pause: Vec<String>,
    /// Commands that resume a suspended print.
    pub resume: Vec<String>,
    /// Commands that abort the print and shut heaters down.
    pub cancel: Vec<String>,
    /// Handshake query for firmware identification.
    pub firmware_query: String,
    /// Heartbeat temperature query.
    pub temperature_query: String,
    /// Position query.
    pub position_query: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marlin_cancel_shuts_heaters_down() {
        let profile = FirmwareKind::Marlin.profile();
        assert_eq!(profile.cancel.first().map(String::as_str), Some("M25"));
        assert!(profile.cancel.iter().any(|c| c == "M104 S0"));
        assert!(profile.cancel.iter().any(|c| c == "M140 S0"));
    }

    #[test]
    fn kinds_roundtrip_through_serde() {
        let kind: FirmwareKind = serde_json::from_str("\"klipper\"").unwrap();
        assert_eq!(kind, FirmwareKind::Klipper);
        assert_eq!(kind.profile().pause, vec!["PAUSE".to_owned()]);
    }
}
