//! A transport that accepts everything and talks to nothing.
//!
//! Used for dry runs and for exercising the orchestrator without hardware.
//! Behavior is scriptable through a shared [NoopBehavior] handle: canned
//! command responses, injected failures, instant print completion.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    error::{Error, Result},
    telemetry::Telemetry,
    transport::{EventSender, PrintControl, Transport, TransportEvent},
};

/// Shared knobs scripting what a [NoopTransport] does. Everything here can
/// be flipped while the transport is live.
#[derive(Default)]
pub struct NoopBehavior {
    /// Refuse connect attempts.
    pub fail_connect: AtomicBool,
    /// Time out every command.
    pub fail_commands: AtomicBool,
    /// Answer prints by immediately reporting progress and completion.
    pub auto_complete_prints: AtomicBool,
    /// Artificial delay before a print start returns, simulating a slow
    /// upload or warm-up.
    pub start_print_delay: StdMutex<Duration>,
    /// Canned responses per command; anything else answers `ok`.
    pub responses: StdMutex<HashMap<String, String>>,
    /// Telemetry returned by status polls.
    pub telemetry: StdMutex<Telemetry>,
    /// Every command and control action the transport accepted, in order.
    pub log: StdMutex<Vec<String>>,
}

impl NoopBehavior {
    fn record(&self, entry: impl Into<String>) {
        lock(&self.log).push(entry.into());
    }

    /// Snapshot of the accepted-command log.
    pub fn recorded(&self) -> Vec<String> {
        lock(&self.log).clone()
    }
}

/// Transport that no-ops, well, everything.
pub struct NoopTransport {
    events: EventSender,
    behavior: Arc<NoopBehavior>,
    connected: bool,
}

impl NoopTransport {
    /// New transport with default (always succeed) behavior.
    pub fn new(events: EventSender) -> Self {
        Self::with_behavior(events, Arc::new(NoopBehavior::default()))
    }

    /// New transport driven by an externally held behavior handle.
    pub fn with_behavior(events: EventSender, behavior: Arc<NoopBehavior>) -> Self {
        Self {
            events,
            behavior,
            connected: false,
        }
    }

    /// The behavior handle, for scripting after construction.
    pub fn behavior(&self) -> Arc<NoopBehavior> {
        self.behavior.clone()
    }

    fn device_id(&self) -> &str {
        self.events.device_id()
    }

    fn ensure_connected(&self) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected(self.device_id().to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for NoopTransport {
    fn kind(&self) -> &'static str {
        "noop"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn supports_file_based_print(&self) -> bool {
        true
    }

    async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        if self.behavior.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Connection {
                device: self.device_id().to_owned(),
                message: "injected connect failure".into(),
            });
        }
        self.connected = true;
        self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.events.send(TransportEvent::Disconnected);
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> Result<String> {
        self.ensure_connected()?;
        if self.behavior.fail_commands.load(Ordering::SeqCst) {
            return Err(Error::CommandTimeout {
                device: self.device_id().to_owned(),
                command: command.to_owned(),
            });
        }
        self.behavior.record(command);
        let response = lock(&self.behavior.responses)
            .get(command)
            .cloned()
            .unwrap_or_else(|| "ok".to_owned());
        Ok(response)
    }

    async fn poll_status(&mut self) -> Result<Telemetry> {
        self.ensure_connected()?;
        if self.behavior.fail_commands.load(Ordering::SeqCst) {
            return Err(Error::CommandTimeout {
                device: self.device_id().to_owned(),
                command: "status".to_owned(),
            });
        }
        Ok(*lock(&self.behavior.telemetry))
    }

    async fn upload_file(&mut self, file_name: &str, _content: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        self.behavior.record(format!("upload {file_name}"));
        Ok(())
    }

    async fn start_print(&mut self, file_name: &str, _content: Option<&str>) -> Result<()> {
        self.ensure_connected()?;
        let delay = *lock(&self.behavior.start_print_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.behavior.record(format!("print {file_name}"));
        if self.behavior.auto_complete_prints.load(Ordering::SeqCst) {
            self.events.send(TransportEvent::PrintProgress(50.0));
            self.events.send(TransportEvent::PrintProgress(100.0));
            self.events.send(TransportEvent::PrintFinished);
        }
        Ok(())
    }

    async fn control_print(&mut self, action: PrintControl) -> Result<()> {
        self.ensure_connected()?;
        let label = match action {
            PrintControl::Pause => "pause",
            PrintControl::Resume => "resume",
            PrintControl::Cancel => "cancel",
        };
        self.behavior.record(label);
        Ok(())
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn transport() -> (NoopTransport, mpsc::UnboundedReceiver<crate::transport::DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (NoopTransport::new(EventSender::new("n1", tx)), rx)
    }

    #[tokio::test]
    async fn canned_responses_and_log() {
        let (mut transport, _rx) = transport();
        transport.connect().await.unwrap();

        lock(&transport.behavior.responses).insert("M115".into(), "FIRMWARE_NAME:Noop".into());
        assert_eq!(transport.send_command("M115").await.unwrap(), "FIRMWARE_NAME:Noop");
        assert_eq!(transport.send_command("G28").await.unwrap(), "ok");
        assert_eq!(transport.behavior.recorded(), vec!["M115".to_owned(), "G28".to_owned()]);
    }

    #[tokio::test]
    async fn injected_connect_failure() {
        let (mut transport, _rx) = transport();
        transport.behavior.fail_connect.store(true, Ordering::SeqCst);
        assert!(matches!(
            transport.connect().await.unwrap_err(),
            Error::Connection { .. }
        ));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn auto_complete_emits_finish() {
        let (mut transport, mut rx) = transport();
        transport.connect().await.unwrap();
        transport
            .behavior
            .auto_complete_prints
            .store(true, Ordering::SeqCst);
        transport.start_print("benchy.gcode", None).await.unwrap();

        let mut finished = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.event, TransportEvent::PrintFinished) {
                finished = true;
            }
        }
        assert!(finished);
    }
}
