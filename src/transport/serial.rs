//! Serial (USB) G-code transport.
//!
//! Responses share one line stream with autoreports and error chatter, and
//! the firmware offers no request ids, so all outbound commands funnel
//! through a single writer task (one at a time, small inter-command delay)
//! and a [CommandLedger] pairs each with the next ack line. A hung command
//! times out on its own without stalling the commands behind it.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{sleep, sleep_until, timeout, Duration, Instant},
};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    recovery::is_critical_fault,
    telemetry::Telemetry,
    transport::{
        correlate::{classify_line, parse_position, parse_temperatures, CommandLedger, SerialLine},
        EventSender, FirmwareProfile, PrintControl, Transport, TransportEvent, IO_TIMEOUT,
    },
};

/// Delay between consecutive writes; overlapping writes are not guaranteed
/// orderable by firmware.
const INTER_COMMAND_DELAY: Duration = Duration::from_millis(30);

/// How long to let the firmware finish booting before the handshake.
const BOOT_SILENCE: Duration = Duration::from_millis(1500);

/// Heartbeat interval for the temperature poll.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

struct WireCommand {
    line: String,
    reply: oneshot::Sender<Result<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Running,
    Paused,
    Aborted,
}

struct SerialLink {
    cmd_tx: mpsc::Sender<WireCommand>,
    telemetry: Arc<StdMutex<Telemetry>>,
    stream_state: watch::Sender<StreamState>,
    tasks: Vec<JoinHandle<()>>,
}

impl SerialLink {
    fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Transport for a G-code printer on a serial port.
pub struct SerialTransport {
    port: String,
    baud: u32,
    profile: FirmwareProfile,
    events: EventSender,
    boot_silence: Duration,
    command_timeout: Duration,
    heartbeat: Duration,
    link: Option<SerialLink>,
}

impl SerialTransport {
    /// New, disconnected transport for the given port.
    pub fn new(port: String, baud: u32, profile: FirmwareProfile, events: EventSender) -> Self {
        Self {
            port,
            baud,
            profile,
            events,
            boot_silence: BOOT_SILENCE,
            command_timeout: IO_TIMEOUT,
            heartbeat: HEARTBEAT_INTERVAL,
            link: None,
        }
    }

    fn device_id(&self) -> &str {
        self.events.device_id()
    }

    /// Wire reader/writer/heartbeat tasks onto an open stream. Split out
    /// from [SerialTransport::connect] so tests can drive the protocol over
    /// an in-memory duplex instead of a real port.
    fn attach<W, R>(&mut self, writer: W, reader: R)
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let ledger = Arc::new(StdMutex::new(CommandLedger::new(self.device_id())));
        let telemetry = Arc::new(StdMutex::new(Telemetry::default()));
        let (cmd_tx, cmd_rx) = mpsc::channel::<WireCommand>(32);
        let (stream_state, _) = watch::channel(StreamState::Running);

        let writer_task = tokio::spawn(write_loop(
            writer,
            cmd_rx,
            ledger.clone(),
            self.command_timeout,
        ));
        let reader_task = tokio::spawn(read_loop(
            reader,
            ledger.clone(),
            telemetry.clone(),
            self.events.clone(),
        ));
        let heartbeat_task = tokio::spawn(heartbeat_loop(
            cmd_tx.clone(),
            self.profile.temperature_query.clone(),
            self.heartbeat,
        ));

        self.link = Some(SerialLink {
            cmd_tx,
            telemetry,
            stream_state,
            tasks: vec![writer_task, reader_task, heartbeat_task],
        });
    }

    fn link(&self) -> Result<&SerialLink> {
        self.link
            .as_ref()
            .ok_or_else(|| Error::NotConnected(self.device_id().to_owned()))
    }

    async fn issue(&self, line: &str) -> Result<String> {
        let link = self.link()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        link.cmd_tx
            .send(WireCommand {
                line: line.to_owned(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::NotConnected(self.device_id().to_owned()))?;
        // An extra outer deadline covers time spent queued behind other
        // commands; the ledger's own deadline starts at write time.
        match timeout(self.command_timeout * 2, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) | Err(_) => Err(Error::CommandTimeout {
                device: self.device_id().to_owned(),
                command: line.to_owned(),
            }),
        }
    }

    async fn run_sequence(&self, sequence: &[String]) -> Result<()> {
        for command in sequence {
            self.issue(command).await?;
        }
        Ok(())
    }

    async fn handshake(&mut self) -> Result<()> {
        let firmware_query = self.profile.firmware_query.clone();
        let temperature_query = self.profile.temperature_query.clone();
        let handshake = async {
            let info = self.issue(&firmware_query).await?;
            debug!(device = self.device_id(), info = %info, "firmware identified");
            self.issue(&temperature_query).await?;
            Ok::<(), Error>(())
        };
        timeout(IO_TIMEOUT, handshake)
            .await
            .map_err(|_| Error::Connection {
                device: self.device_id().to_owned(),
                message: "handshake timed out".into(),
            })?
    }

    fn teardown(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.shutdown();
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> &'static str {
        "serial"
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn supports_file_based_print(&self) -> bool {
        false
    }

    async fn connect(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }

        let stream = open_port(&self.port, self.baud).map_err(|e| Error::Connection {
            device: self.device_id().to_owned(),
            message: e.to_string(),
        })?;

        // Opening the port resets most boards; give the firmware its boot
        // window before talking to it.
        sleep(self.boot_silence).await;

        let (reader, writer) = tokio::io::split(stream);
        self.attach(writer, reader);

        if let Err(e) = self.handshake().await {
            self.teardown();
            return Err(e);
        }

        self.events.send(TransportEvent::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.link.is_none() {
            return Ok(());
        }
        self.teardown();
        self.events.send(TransportEvent::Disconnected);
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> Result<String> {
        self.issue(command).await
    }

    async fn poll_status(&mut self) -> Result<Telemetry> {
        let response = self.issue(&self.profile.temperature_query.clone()).await?;
        // The reader already merged the ack payload into the cache; the
        // response is parsed again here only to validate the read.
        if parse_temperatures(&response).is_none() {
            debug!(device = self.device_id(), response = %response, "status read without temperatures");
        }
        let link = self.link()?;
        Ok(*link.telemetry.lock().unwrap_or_else(PoisonError::into_inner))
    }

    async fn upload_file(&mut self, _file_name: &str, _content: &[u8]) -> Result<()> {
        Err(Error::UnsupportedCapability(
            "serial printers do not accept file uploads".into(),
        ))
    }

    async fn start_print(&mut self, file_name: &str, content: Option<&str>) -> Result<()> {
        let content = content.ok_or_else(|| {
            Error::UnsupportedCapability("serial printing needs inline command content".into())
        })?;
        let link = self.link()?;
        let _ = link.stream_state.send(StreamState::Running);

        let lines: Vec<String> = content
            .lines()
            .map(|s| match s.split_once(';') {
                Some((command, _)) => command.trim().to_owned(),
                None => s.trim().to_owned(),
            })
            .filter(|s| !s.is_empty())
            .collect();
        if lines.is_empty() {
            return Err(Error::Validation(format!("{file_name} contains no commands")));
        }

        let cmd_tx = link.cmd_tx.clone();
        let mut state_rx = link.stream_state.subscribe();
        let events = self.events.clone();
        let command_timeout = self.command_timeout;
        let streamer = tokio::spawn(async move {
            let total = lines.len();
            for (sent, line) in lines.into_iter().enumerate() {
                // Hold here while paused; bail when aborted.
                loop {
                    let state = *state_rx.borrow();
                    match state {
                        StreamState::Running => break,
                        StreamState::Aborted => return,
                        StreamState::Paused => {
                            if state_rx.changed().await.is_err() {
                                return;
                            }
                        }
                    }
                }

                let (reply_tx, reply_rx) = oneshot::channel();
                if cmd_tx
                    .send(WireCommand {
                        line,
                        reply: reply_tx,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                match timeout(command_timeout * 2, reply_rx).await {
                    Ok(Ok(Ok(_))) => {}
                    Ok(Ok(Err(e))) => {
                        events.send(TransportEvent::Error {
                            message: format!("print stream failed: {e}"),
                            unrecoverable: false,
                        });
                        return;
                    }
                    _ => {
                        events.send(TransportEvent::Error {
                            message: "print stream stalled waiting for ack".into(),
                            unrecoverable: false,
                        });
                        return;
                    }
                }
                events.send(TransportEvent::PrintProgress(
                    (sent + 1) as f64 / total as f64 * 100.0,
                ));
            }
            events.send(TransportEvent::PrintFinished);
        });
        if let Some(link) = self.link.as_mut() {
            link.tasks.push(streamer);
        }
        Ok(())
    }

    async fn control_print(&mut self, action: PrintControl) -> Result<()> {
        let profile = self.profile.clone();
        match action {
            PrintControl::Pause => {
                let link = self.link()?;
                let _ = link.stream_state.send(StreamState::Paused);
                self.run_sequence(&profile.pause).await
            }
            PrintControl::Resume => {
                self.run_sequence(&profile.resume).await?;
                let link = self.link()?;
                let _ = link.stream_state.send(StreamState::Running);
                Ok(())
            }
            PrintControl::Cancel => {
                let link = self.link()?;
                let _ = link.stream_state.send(StreamState::Aborted);
                // Best effort: the job is already logically cancelled by the
                // queue, so a dead link here is reported, not fatal.
                if let Err(e) = self.run_sequence(&profile.cancel).await {
                    warn!(device = self.device_id(), error = %e, "cancel sequence failed");
                }
                Ok(())
            }
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn open_port(port: &str, baud: u32) -> tokio_serial::Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;
    tokio_serial::new(port, baud).open_native_async()
}

async fn write_loop<W>(
    mut writer: W,
    mut cmd_rx: mpsc::Receiver<WireCommand>,
    ledger: Arc<StdMutex<CommandLedger>>,
    command_timeout: Duration,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    while let Some(cmd) = cmd_rx.recv().await {
        let line = format!("{}\r\n", cmd.line);
        {
            let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
            ledger.push(cmd.line, cmd.reply, Instant::now() + command_timeout);
        }
        if writer.write_all(line.as_bytes()).await.is_err() || writer.flush().await.is_err() {
            // The reader observes the same broken stream and fails the
            // ledger; just stop accepting commands.
            break;
        }
        sleep(INTER_COMMAND_DELAY).await;
    }
}

async fn read_loop<R>(
    reader: R,
    ledger: Arc<StdMutex<CommandLedger>>,
    telemetry: Arc<StdMutex<Telemetry>>,
    events: EventSender,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let deadline = {
            let ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
            ledger
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_millis(500))
        };

        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    handle_line(&line, &ledger, &telemetry, &events);
                }
                Ok(None) => {
                    let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
                    ledger.fail_all("serial stream closed");
                    events.send(TransportEvent::Error {
                        message: "serial stream closed".into(),
                        unrecoverable: false,
                    });
                    events.send(TransportEvent::Disconnected);
                    return;
                }
                Err(e) => {
                    let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
                    ledger.fail_all(&e.to_string());
                    events.send(TransportEvent::Error {
                        message: format!("serial read failed: {e}"),
                        unrecoverable: false,
                    });
                    events.send(TransportEvent::Disconnected);
                    return;
                }
            },
            _ = sleep_until(deadline) => {
                let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
                let failed = ledger.fail_expired(Instant::now());
                if failed > 0 {
                    debug!(failed, "expired pending serial commands");
                }
            }
        }
    }
}

fn handle_line(
    line: &str,
    ledger: &Arc<StdMutex<CommandLedger>>,
    telemetry: &Arc<StdMutex<Telemetry>>,
    events: &EventSender,
) {
    match classify_line(line) {
        SerialLine::Ack(payload) => {
            if !payload.is_empty() {
                merge_report(&payload, telemetry, events);
            }
            let mut ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
            ledger.resolve_ack(&payload);
        }
        SerialLine::Report(report) => {
            merge_report(&report, telemetry, events);
        }
        SerialLine::Fault(message) => {
            events.send(TransportEvent::Error {
                unrecoverable: is_critical_fault(&message),
                message,
            });
        }
        SerialLine::Busy => {
            // Command still running; the ledger deadline covers the worst
            // case.
        }
        SerialLine::Start => {
            debug!("firmware boot banner");
        }
        SerialLine::Other(line) => {
            debug!(line = %line, "unhandled serial line");
        }
    }
}

fn merge_report(report: &str, telemetry: &Arc<StdMutex<Telemetry>>, events: &EventSender) {
    let mut update = Telemetry::default();
    let mut parsed = false;
    if let Some((hotend, bed)) = parse_temperatures(report) {
        update.hotend = hotend;
        update.bed = bed;
        parsed = true;
    }
    if let Some(position) = parse_position(report) {
        update.position = Some(position);
        parsed = true;
    }
    if !parsed {
        return;
    }
    let snapshot = {
        let mut telemetry = telemetry.lock().unwrap_or_else(PoisonError::into_inner);
        telemetry.merge(&update);
        *telemetry
    };
    events.send(TransportEvent::Telemetry(snapshot));
}

async fn heartbeat_loop(cmd_tx: mpsc::Sender<WireCommand>, query: String, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await; // immediate first tick, skip it
    loop {
        ticker.tick().await;
        let (reply_tx, reply_rx) = oneshot::channel();
        if cmd_tx
            .send(WireCommand {
                line: query.clone(),
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return;
        }
        // The reader merges the payload into telemetry; the heartbeat only
        // cares that the link still answers.
        let _ = reply_rx.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DeviceEvent, FirmwareKind};
    use pretty_assertions::assert_eq;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    /// A scripted firmware on the far end of an in-memory duplex: answers
    /// M105 with a temperature ack and everything else with a bare ok,
    /// except commands listed in `ignore`, which get no answer at all.
    fn fake_firmware(
        stream: tokio::io::DuplexStream,
        ignore: &'static [&'static str],
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(stream);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_owned();
                if ignore.iter().any(|i| *i == line) {
                    continue;
                }
                let reply = if line == "M105" {
                    "ok T:210.00 /215.00 B:60.00 /60.00\n"
                } else if line == "M115" {
                    "ok FIRMWARE_NAME:Marlin 2.1\n"
                } else {
                    "ok\n"
                };
                if write.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        })
    }

    fn transport_on_duplex(
        ignore: &'static [&'static str],
    ) -> (
        SerialTransport,
        mpsc::UnboundedReceiver<DeviceEvent>,
        JoinHandle<()>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (local, remote) = duplex(4096);
        let firmware = fake_firmware(remote, ignore);

        let mut transport = SerialTransport::new(
            "/dev/null".into(),
            115_200,
            FirmwareKind::Marlin.profile(),
            EventSender::new("p1", events_tx),
        );
        transport.command_timeout = Duration::from_millis(250);
        transport.heartbeat = Duration::from_secs(60);
        let (reader, writer) = tokio::io::split(local);
        transport.attach(writer, reader);
        (transport, events_rx, firmware)
    }

    #[tokio::test]
    async fn commands_resolve_against_scripted_firmware() {
        let (mut transport, _events, _fw) = transport_on_duplex(&[]);

        let response = transport.send_command("M105").await.unwrap();
        assert_eq!(response, "T:210.00 /215.00 B:60.00 /60.00");

        let response = transport.send_command("G28").await.unwrap();
        assert_eq!(response, "");
    }

    #[tokio::test]
    async fn ack_payload_updates_telemetry() {
        let (mut transport, _events, _fw) = transport_on_duplex(&[]);

        let telemetry = transport.poll_status().await.unwrap();
        assert_eq!(telemetry.hotend.current, 210.0);
        assert_eq!(telemetry.hotend.target, 215.0);
        assert_eq!(telemetry.bed.current, 60.0);
    }

    #[tokio::test]
    async fn unanswered_command_times_out_without_blocking_next() {
        let (mut transport, _events, _fw) = transport_on_duplex(&["M400"]);

        let err = transport.send_command("M400").await.unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));

        // The stream is still usable and correlation is still aligned.
        let response = transport.send_command("M105").await.unwrap();
        assert!(response.starts_with("T:"));
    }

    #[tokio::test]
    async fn send_while_disconnected_is_not_connected_error() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let mut transport = SerialTransport::new(
            "/dev/null".into(),
            115_200,
            FirmwareKind::Marlin.profile(),
            EventSender::new("p1", events_tx),
        );
        let err = transport.send_command("M105").await.unwrap_err();
        assert!(matches!(err, Error::NotConnected(_)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (mut transport, mut events, _fw) = transport_on_duplex(&[]);

        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();

        let mut disconnects = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event.event, TransportEvent::Disconnected) {
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn streamed_print_reports_progress_and_finish() {
        let (mut transport, mut events, _fw) = transport_on_duplex(&[]);

        transport
            .start_print("square.gcode", Some("G28 ; home\nG1 X10\n; comment only\nG1 Y10\n"))
            .await
            .unwrap();

        let mut progress = Vec::new();
        let mut finished = false;
        while let Some(event) = events.recv().await {
            match event.event {
                TransportEvent::PrintProgress(pct) => progress.push(pct),
                TransportEvent::PrintFinished => {
                    finished = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(finished);
        assert_eq!(progress.len(), 3); // comment-only lines are stripped
        assert!((progress.last().copied().unwrap() - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn upload_is_a_typed_capability_gap() {
        let (mut transport, _events, _fw) = transport_on_duplex(&[]);
        assert!(!transport.supports_file_based_print());
        let err = transport.upload_file("a.gcode", b"G28").await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedCapability(_)));
    }
}
