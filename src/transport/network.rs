//! Transport for printers exposing an HTTP+JSON control API.
//!
//! The wire shape follows Moonraker (status query, gcode script endpoint,
//! multipart upload, print job control), but every path comes from the
//! device's [EndpointMap], so vendors with the same four-endpoint shape are
//! a config change, not a code change.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart;
use serde::Deserialize;
use tokio::{task::JoinHandle, time::Duration};
use tracing::{debug, warn};

use crate::{
    config::EndpointMap,
    error::{Error, Result},
    telemetry::{HeaterReading, Position, PrinterStatus, Telemetry},
    transport::{EventSender, PrintControl, Transport, TransportEvent, IO_TIMEOUT, UPLOAD_TIMEOUT},
};

/// Interval between status polls while connected.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
struct Webhooks {
    #[serde(default)]
    state: String,
    #[serde(default)]
    state_message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
struct VirtualSdcard {
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    is_active: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
struct PrintStats {
    #[serde(default)]
    state: String,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
struct Heater {
    #[serde(default)]
    temperature: f64,
    #[serde(default)]
    target: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
struct Toolhead {
    #[serde(default)]
    position: Vec<f64>,
}

/// The slice of the device's status object this transport reads.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
struct StatusPayload {
    #[serde(default)]
    webhooks: Webhooks,
    #[serde(default)]
    virtual_sdcard: VirtualSdcard,
    #[serde(default)]
    print_stats: PrintStats,
    #[serde(default)]
    extruder: Heater,
    #[serde(default)]
    heater_bed: Heater,
    #[serde(default)]
    toolhead: Toolhead,
}

#[derive(Clone, Debug, Deserialize)]
struct QueryResponse {
    status: StatusPayload,
}

#[derive(Clone, Debug, Deserialize)]
struct QueryResponseWrapper {
    result: QueryResponse,
}

fn map_status(payload: &StatusPayload) -> (PrinterStatus, Telemetry) {
    let status = match payload.webhooks.state.as_str() {
        "shutdown" | "error" => PrinterStatus::Error,
        _ => match payload.print_stats.state.as_str() {
            "printing" => PrinterStatus::Printing,
            "paused" => PrinterStatus::Paused,
            "error" => PrinterStatus::Error,
            _ => {
                // Idle with the hotend still ramping reads as heating.
                let hotend = &payload.extruder;
                if hotend.target > 0.0 && hotend.temperature < hotend.target - 3.0 {
                    PrinterStatus::Heating
                } else {
                    PrinterStatus::Idle
                }
            }
        },
    };

    let position = match payload.toolhead.position.as_slice() {
        [x, y, z, ..] => Some(Position { x: *x, y: *y, z: *z }),
        _ => None,
    };
    let telemetry = Telemetry {
        hotend: HeaterReading {
            current: payload.extruder.temperature,
            target: payload.extruder.target,
        },
        bed: HeaterReading {
            current: payload.heater_bed.temperature,
            target: payload.heater_bed.target,
        },
        position,
        progress: payload
            .virtual_sdcard
            .is_active
            .then_some(payload.virtual_sdcard.progress * 100.0),
        captured_at: Utc::now(),
    };
    (status, telemetry)
}

/// Everything the poll loop shares with the owning transport.
struct Shared {
    last_status: StdMutex<Option<PrinterStatus>>,
    telemetry: StdMutex<Telemetry>,
}

/// Transport for a printer with an HTTP control API.
pub struct NetworkTransport {
    base_url: String,
    api_key: Option<String>,
    endpoints: EndpointMap,
    events: EventSender,
    client: reqwest::Client,
    shared: Arc<Shared>,
    poll_task: Option<JoinHandle<()>>,
    poll_interval: Duration,
}

impl NetworkTransport {
    /// New, disconnected transport for the given API.
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        endpoints: EndpointMap,
        events: EventSender,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(IO_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            endpoints,
            events,
            client,
            shared: Arc::new(Shared {
                last_status: StdMutex::new(None),
                telemetry: StdMutex::new(Telemetry::default()),
            }),
            poll_task: None,
            poll_interval: POLL_INTERVAL,
        }
    }

    fn device_id(&self) -> &str {
        self.events.device_id()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_key(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-Api-Key", key),
            None => request,
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.poll_task.is_none() {
            return Err(Error::NotConnected(self.device_id().to_owned()));
        }
        Ok(())
    }

    fn command_error(&self, command: &str, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::CommandTimeout {
                device: self.device_id().to_owned(),
                command: command.to_owned(),
            }
        } else {
            Error::Http(e)
        }
    }

    async fn fetch_status(&self) -> Result<(PrinterStatus, Telemetry)> {
        let response: QueryResponseWrapper = self
            .with_key(self.client.get(self.url(&self.endpoints.status)))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(map_status(&response.result.status))
    }

    async fn job_control(&self, action: &str) -> Result<()> {
        self.with_key(self.client.post(self.url(&format!("{}/{}", self.endpoints.job, action))))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl Transport for NetworkTransport {
    fn kind(&self) -> &'static str {
        "network"
    }

    fn is_connected(&self) -> bool {
        self.poll_task.is_some()
    }

    fn supports_file_based_print(&self) -> bool {
        true
    }

    async fn connect(&mut self) -> Result<()> {
        if self.poll_task.is_some() {
            return Ok(());
        }

        // Version probe doubles as the reachability handshake; the client's
        // own timeout bounds it.
        self.with_key(self.client.get(self.url(&self.endpoints.version)))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::Connection {
                device: self.device_id().to_owned(),
                message: e.to_string(),
            })?;

        let poller = Poller {
            client: self.client.clone(),
            url: self.url(&self.endpoints.status),
            api_key: self.api_key.clone(),
            events: self.events.clone(),
            shared: self.shared.clone(),
        };
        self.poll_task = Some(tokio::spawn(poller.run(self.poll_interval)));
        self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(task) = self.poll_task.take() else {
            return Ok(());
        };
        task.abort();
        *lock(&self.shared.last_status) = None;
        self.events.send(TransportEvent::Disconnected);
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> Result<String> {
        self.ensure_connected()?;
        let response = self
            .with_key(self.client.post(self.url(&self.endpoints.command)))
            .query(&[("script", command)])
            .send()
            .await
            .map_err(|e| self.command_error(command, e))?
            .error_for_status()
            .map_err(Error::Http)?;
        response.text().await.map_err(Error::Http)
    }

    async fn poll_status(&mut self) -> Result<Telemetry> {
        self.ensure_connected()?;
        let (status, telemetry) = self.fetch_status().await?;
        *lock(&self.shared.last_status) = Some(status);
        *lock(&self.shared.telemetry) = telemetry;
        Ok(telemetry)
    }

    async fn upload_file(&mut self, file_name: &str, content: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        let part = multipart::Part::bytes(content.to_owned())
            .file_name(file_name.to_owned())
            .mime_str("text/x-gcode")
            .map_err(Error::Http)?;
        let form = multipart::Form::new().text("root", "gcodes").part("file", part);

        self.with_key(self.client.post(self.url(&self.endpoints.upload)))
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.command_error(file_name, e))?
            .error_for_status()
            .map_err(Error::Http)?;
        Ok(())
    }

    async fn start_print(&mut self, file_name: &str, _content: Option<&str>) -> Result<()> {
        self.ensure_connected()?;
        self.with_key(self.client.post(self.url(&format!("{}/start", self.endpoints.job))))
            .form(&[("filename", file_name)])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn control_print(&mut self, action: PrintControl) -> Result<()> {
        self.ensure_connected()?;
        match action {
            PrintControl::Pause => self.job_control("pause").await,
            PrintControl::Resume => self.job_control("resume").await,
            PrintControl::Cancel => self.job_control("cancel").await,
        }
    }
}

impl Drop for NetworkTransport {
    fn drop(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Background status poll: fetches on an interval, diffs the mapped status
/// against the previous poll, and emits the differences as events.
struct Poller {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    events: EventSender,
    shared: Arc<Shared>,
}

impl Poller {
    async fn run(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.fetch().await {
                Ok(payload) => self.apply(&payload),
                Err(e) => {
                    warn!(device = self.events.device_id(), error = %e, "status poll failed");
                    self.events.send(TransportEvent::Error {
                        message: format!("status poll failed: {e}"),
                        unrecoverable: false,
                    });
                }
            }
        }
    }

    async fn fetch(&self) -> Result<StatusPayload> {
        let mut request = self.client.get(&self.url);
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }
        let response: QueryResponseWrapper =
            request.send().await?.error_for_status()?.json().await?;
        Ok(response.result.status)
    }

    fn apply(&self, payload: &StatusPayload) {
        let (status, telemetry) = map_status(payload);
        *lock(&self.shared.telemetry) = telemetry;
        self.events.send(TransportEvent::Telemetry(telemetry));

        let previous = lock(&self.shared.last_status).replace(status);
        if let Some(previous) = previous {
            if previous != status {
                debug!(
                    device = self.events.device_id(),
                    from = ?previous,
                    to = ?status,
                    "device status changed"
                );
                self.events.send(TransportEvent::StatusChanged {
                    from: previous,
                    to: status,
                });
            }
            // The device runs file-based prints on its own; completion shows
            // up as a printing-to-idle edge.
            if previous == PrinterStatus::Printing && status == PrinterStatus::Idle {
                self.events.send(TransportEvent::PrintFinished);
            }
        }
        if status == PrinterStatus::Printing {
            if let Some(progress) = telemetry.progress {
                self.events.send(TransportEvent::PrintProgress(progress));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn payload(json: &str) -> StatusPayload {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn maps_printing_state_with_progress() {
        let payload = payload(
            r#"{
                "webhooks": {"state": "ready", "state_message": ""},
                "virtual_sdcard": {"progress": 0.421, "is_active": true},
                "print_stats": {"state": "printing", "filename": "benchy.gcode"},
                "extruder": {"temperature": 214.8, "target": 215.0},
                "heater_bed": {"temperature": 60.0, "target": 60.0},
                "toolhead": {"position": [10.0, 20.0, 0.3, 118.2]}
            }"#,
        );
        let (status, telemetry) = map_status(&payload);
        assert_eq!(status, PrinterStatus::Printing);
        assert_eq!(telemetry.progress, Some(42.1));
        assert_eq!(telemetry.hotend.current, 214.8);
        assert_eq!(telemetry.position, Some(Position { x: 10.0, y: 20.0, z: 0.3 }));
    }

    #[test]
    fn heating_is_derived_from_heater_targets() {
        let payload = payload(
            r#"{
                "webhooks": {"state": "ready"},
                "print_stats": {"state": "standby"},
                "extruder": {"temperature": 80.0, "target": 215.0}
            }"#,
        );
        let (status, _) = map_status(&payload);
        assert_eq!(status, PrinterStatus::Heating);
    }

    #[test]
    fn firmware_shutdown_wins_over_job_state() {
        let payload = payload(
            r#"{
                "webhooks": {"state": "shutdown", "state_message": "MCU lost"},
                "print_stats": {"state": "printing"}
            }"#,
        );
        let (status, _) = map_status(&payload);
        assert_eq!(status, PrinterStatus::Error);
    }

    #[test]
    fn partial_payload_maps_to_idle() {
        // Vendors that omit objects still map; missing fields default.
        let (status, telemetry) = map_status(&payload(r#"{"webhooks": {"state": "ready"}}"#));
        assert_eq!(status, PrinterStatus::Idle);
        assert_eq!(telemetry.progress, None);
        assert_eq!(telemetry.position, None);
    }

    #[test]
    fn base_url_joins_without_double_slash() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = NetworkTransport::new(
            "http://voron.local:7125/".into(),
            None,
            EndpointMap::default(),
            EventSender::new("v1", tx),
        );
        assert!(transport.url("/printer/info").starts_with("http://voron.local:7125/printer"));
        assert!(!transport.url("/printer/info").contains("//printer"));
    }
}
