//! Device transports.
//!
//! One [Transport] mediates all communication with one physical printer,
//! over a serial port or a vendor HTTP API. Both speak the same capability
//! set; optional capabilities (file upload, file-based print control) are
//! feature-probed via [Transport::supports_file_based_print] rather than
//! downcast at call sites.

pub mod correlate;
pub mod firmware;
pub mod network;
pub mod noop;
#[cfg(feature = "serial")]
pub mod serial;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    config::{DeviceConfig, TransportConfig},
    error::Result,
    telemetry::{PrinterStatus, Telemetry},
};

pub use firmware::{FirmwareKind, FirmwareProfile};
pub use network::NetworkTransport;
pub use noop::NoopTransport;
#[cfg(feature = "serial")]
pub use serial::SerialTransport;

/// Default deadline for connect handshakes and single commands.
pub const IO_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Default deadline for file uploads.
pub const UPLOAD_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Something a transport observed, tagged with its device id on the shared
/// channel the orchestrator's dispatch loop drains.
#[derive(Clone, Debug)]
pub struct DeviceEvent {
    /// Which device this came from.
    pub device_id: String,
    /// What happened.
    pub event: TransportEvent,
}

/// The uniform event stream every transport emits.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// Handshake completed; polling is running.
    Connected,
    /// Link torn down (on request or by failure).
    Disconnected,
    /// Fresh telemetry readings.
    Telemetry(Telemetry),
    /// The device's own status changed between two polls.
    StatusChanged {
        /// Status at the previous poll.
        from: PrinterStatus,
        /// Status now.
        to: PrinterStatus,
    },
    /// Progress tick for an in-flight print driven by this transport.
    PrintProgress(f64),
    /// The device reported the current print finished.
    PrintFinished,
    /// An error line or transport failure.
    Error {
        /// Description, as close to the device's wording as possible.
        message: String,
        /// True for critical faults that must not be retried.
        unrecoverable: bool,
    },
}

/// Cloneable handle a transport uses to put events on the orchestrator's
/// channel.
#[derive(Clone, Debug)]
pub struct EventSender {
    device_id: String,
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl EventSender {
    /// Tag `tx` with a device id.
    pub fn new(device_id: impl Into<String>, tx: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        Self {
            device_id: device_id.into(),
            tx,
        }
    }

    /// The device this sender is tagged with.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Emit an event. Errors (orchestrator gone during shutdown) are
    /// ignored.
    pub fn send(&self, event: TransportEvent) {
        let _ = self.tx.send(DeviceEvent {
            device_id: self.device_id.clone(),
            event,
        });
    }
}

/// Print-control actions for an in-flight job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrintControl {
    /// Suspend the current print.
    Pause,
    /// Resume a paused print.
    Resume,
    /// Abort the current print.
    Cancel,
}

/// The capability set every transport implements.
#[async_trait]
pub trait Transport: Send {
    /// Transport kind label (`serial`/`network`/`noop`).
    fn kind(&self) -> &'static str;

    /// Whether the link is currently up.
    fn is_connected(&self) -> bool;

    /// Whether this transport can accept a file and run the print natively
    /// ([Transport::upload_file] + job control). Serial printers cannot;
    /// they stream protocol commands instead.
    fn supports_file_based_print(&self) -> bool;

    /// Establish the link and run the handshake, bounded by [IO_TIMEOUT].
    /// Emits [TransportEvent::Connected] and starts telemetry polling on
    /// success.
    async fn connect(&mut self) -> Result<()>;

    /// Stop polling and release the link. Idempotent: disconnecting an
    /// already-disconnected transport is a no-op and emits nothing.
    async fn disconnect(&mut self) -> Result<()>;

    /// Submit one protocol command and return the raw response.
    async fn send_command(&mut self, command: &str) -> Result<String>;

    /// Read a fresh telemetry snapshot from the device.
    async fn poll_status(&mut self) -> Result<Telemetry>;

    /// Stage a file on the device ([TransportEvent] free; network only).
    async fn upload_file(&mut self, file_name: &str, content: &[u8]) -> Result<()>;

    /// Begin printing. Network transports start a previously uploaded file;
    /// the serial transport streams `content` line by line, emitting
    /// [TransportEvent::PrintProgress] / [TransportEvent::PrintFinished].
    async fn start_print(&mut self, file_name: &str, content: Option<&str>) -> Result<()>;

    /// Pause/resume/cancel the current print. The serial transport
    /// translates these through its [FirmwareProfile].
    async fn control_print(&mut self, action: PrintControl) -> Result<()>;
}

/// Construct the right transport for a device's config, wired to emit on
/// `events`.
pub fn build(config: &DeviceConfig, events: EventSender) -> Result<Box<dyn Transport>> {
    match &config.transport {
        #[cfg(feature = "serial")]
        TransportConfig::Serial { port, baud, firmware } => Ok(Box::new(SerialTransport::new(
            port.clone(),
            *baud,
            firmware.profile(),
            events,
        ))),
        #[cfg(not(feature = "serial"))]
        TransportConfig::Serial { .. } => Err(crate::error::Error::UnsupportedCapability(
            "built without the `serial` feature".into(),
        )),
        TransportConfig::Network {
            base_url,
            api_key,
            endpoints,
        } => Ok(Box::new(NetworkTransport::new(
            base_url.clone(),
            api_key.clone(),
            endpoints.clone(),
            events,
        ))),
        TransportConfig::Noop => Ok(Box::new(NoopTransport::new(events))),
    }
}
