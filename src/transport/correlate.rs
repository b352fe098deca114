//! Request/response correlation for the line-oriented serial protocol.
//!
//! The wire protocol carries no request ids: a command goes out, and some
//! later `ok` line acknowledges it. Correlation is therefore strictly FIFO
//! with a bounded wait per command. Unsolicited lines (temperature
//! autoreports, error strings, `busy` chatter) are classified here and never
//! resolve a pending command.

use std::collections::VecDeque;

use tokio::{sync::oneshot, time::Instant};
use tracing::debug;

use crate::{
    error::{Error, Result},
    telemetry::{HeaterReading, Position},
};

/// What a received line means.
#[derive(Clone, Debug, PartialEq)]
pub enum SerialLine {
    /// Acknowledgement; resolves the oldest pending command. Carries
    /// whatever trailed the `ok` token (often a temperature report).
    Ack(String),
    /// Unsolicited telemetry autoreport.
    Report(String),
    /// Firmware error line, without the `Error:` prefix.
    Fault(String),
    /// `busy` keep-alive; the command is still running.
    Busy,
    /// Firmware boot banner.
    Start,
    /// Anything else (echo chatter, comments).
    Other(String),
}

/// Classify one received line.
pub fn classify_line(line: &str) -> SerialLine {
    let trimmed = line.trim();
    if trimmed == "ok" {
        return SerialLine::Ack(String::new());
    }
    if let Some(rest) = trimmed.strip_prefix("ok ") {
        return SerialLine::Ack(rest.to_owned());
    }
    if let Some(rest) = trimmed.strip_prefix("Error:").or_else(|| trimmed.strip_prefix("!!")) {
        return SerialLine::Fault(rest.trim().to_owned());
    }
    if trimmed.starts_with("echo:busy") || trimmed.starts_with("busy:") {
        return SerialLine::Busy;
    }
    // Boot banner: the firmware finished resetting. Match on the end of the
    // line because leftover buffer bytes may precede it.
    if trimmed.ends_with("start") {
        return SerialLine::Start;
    }
    if trimmed.starts_with("T:") || trimmed.starts_with("X:") {
        return SerialLine::Report(trimmed.to_owned());
    }
    SerialLine::Other(trimmed.to_owned())
}

/// Parse hotend/bed readings out of a `T:210.0 /215.0 B:60.0 /60.0` report.
pub fn parse_temperatures(report: &str) -> Option<(HeaterReading, HeaterReading)> {
    let hotend = parse_reading(report, "T:")?;
    let bed = parse_reading(report, "B:").unwrap_or_default();
    Some((hotend, bed))
}

fn parse_reading(report: &str, prefix: &str) -> Option<HeaterReading> {
    let start = report.find(prefix)? + prefix.len();
    let rest = &report[start..];
    let mut parts = rest.split_whitespace();
    let current: f64 = parts.next()?.parse().ok()?;
    let target = parts
        .next()
        .and_then(|t| t.strip_prefix('/'))
        .and_then(|t| t.parse().ok())
        .unwrap_or(0.0);
    Some(HeaterReading { current, target })
}

/// Parse a toolhead position out of an `X:10.0 Y:20.0 Z:0.3 ...` report.
pub fn parse_position(report: &str) -> Option<Position> {
    let axis = |prefix: &str| -> Option<f64> {
        let start = report.find(prefix)? + prefix.len();
        report[start..].split_whitespace().next()?.parse().ok()
    };
    Some(Position {
        x: axis("X:")?,
        y: axis("Y:")?,
        z: axis("Z:")?,
    })
}

struct Pending {
    command: String,
    reply: oneshot::Sender<Result<String>>,
    deadline: Instant,
}

/// FIFO of in-flight commands, each holding its resolution channel and a
/// deadline. Expiry fails one entry without blocking those behind it.
#[derive(Default)]
pub struct CommandLedger {
    pending: VecDeque<Pending>,
    device_id: String,
}

impl CommandLedger {
    /// New ledger; `device_id` is only used to label errors.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            pending: VecDeque::new(),
            device_id: device_id.into(),
        }
    }

    /// Register an outbound command awaiting its ack.
    pub fn push(&mut self, command: impl Into<String>, reply: oneshot::Sender<Result<String>>, deadline: Instant) {
        self.pending.push_back(Pending {
            command: command.into(),
            reply,
            deadline,
        });
    }

    /// An ack arrived: resolve the oldest pending command with the ack
    /// payload. Returns false when nothing was pending (a stray ack, e.g.
    /// for an entry that already expired).
    pub fn resolve_ack(&mut self, payload: &str) -> bool {
        match self.pending.pop_front() {
            Some(entry) => {
                // Receiver may be gone if the caller gave up; that is fine,
                // the ack is consumed either way so FIFO order holds.
                let _ = entry.reply.send(Ok(payload.to_owned()));
                true
            }
            None => {
                debug!(device = %self.device_id, "ack with no pending command");
                false
            }
        }
    }

    /// Fail every entry whose deadline has passed. Entries are pushed in
    /// send order with equal timeouts, so expired entries are always at the
    /// front.
    pub fn fail_expired(&mut self, now: Instant) -> usize {
        let mut failed = 0;
        while self.pending.front().is_some_and(|head| head.deadline <= now) {
            if let Some(entry) = self.pending.pop_front() {
                let _ = entry.reply.send(Err(Error::CommandTimeout {
                    device: self.device_id.clone(),
                    command: entry.command,
                }));
                failed += 1;
            }
        }
        failed
    }

    /// The earliest deadline, for the reader loop's expiry timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.front().map(|p| p.deadline)
    }

    /// Fail everything outstanding (link torn down).
    pub fn fail_all(&mut self, reason: &str) {
        for entry in self.pending.drain(..) {
            let _ = entry.reply.send(Err(Error::Connection {
                device: self.device_id.clone(),
                message: reason.to_owned(),
            }));
        }
    }

    /// Number of in-flight commands.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn classify_ack_variants() {
        assert_eq!(classify_line("ok"), SerialLine::Ack(String::new()));
        assert_eq!(
            classify_line("ok T:210.0 /215.0 B:60.0 /60.0"),
            SerialLine::Ack("T:210.0 /215.0 B:60.0 /60.0".into())
        );
    }

    #[test]
    fn classify_unsolicited_lines() {
        assert_eq!(
            classify_line(" T:25.4 /0.0 B:24.1 /0.0"),
            SerialLine::Report("T:25.4 /0.0 B:24.1 /0.0".into())
        );
        assert_eq!(
            classify_line("Error:Thermal Runaway, system stopped!"),
            SerialLine::Fault("Thermal Runaway, system stopped!".into())
        );
        assert_eq!(classify_line("echo:busy: processing"), SerialLine::Busy);
        assert_eq!(classify_line("start"), SerialLine::Start);
        assert_eq!(classify_line("echo:SD card ok"), SerialLine::Other("echo:SD card ok".into()));
    }

    #[test]
    fn parse_marlin_temperature_report() {
        let (hotend, bed) = parse_temperatures("T:210.32 /215.00 B:60.11 /60.00 @:95 B@:38").unwrap();
        assert_eq!(hotend.current, 210.32);
        assert_eq!(hotend.target, 215.00);
        assert_eq!(bed.current, 60.11);
        assert_eq!(bed.target, 60.00);
    }

    #[test]
    fn parse_position_report() {
        let pos = parse_position("X:10.00 Y:20.00 Z:0.30 E:12.10 Count X:800 Y:1600 Z:120").unwrap();
        assert_eq!(pos.x, 10.0);
        assert_eq!(pos.y, 20.0);
        assert_eq!(pos.z, 0.3);
        assert!(parse_position("T:210.0 /215.0").is_none());
    }

    #[tokio::test]
    async fn acks_resolve_in_fifo_order() {
        let mut ledger = CommandLedger::new("p1");
        let deadline = Instant::now() + Duration::from_secs(10);

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        ledger.push("G28", tx1, deadline);
        ledger.push("M105", tx2, deadline);

        assert!(ledger.resolve_ack(""));
        assert!(ledger.resolve_ack("T:210.0 /215.0"));
        assert!(!ledger.resolve_ack("stray"));

        assert_eq!(rx1.await.unwrap().unwrap(), "");
        assert_eq!(rx2.await.unwrap().unwrap(), "T:210.0 /215.0");
    }

    #[tokio::test]
    async fn expiry_fails_one_entry_without_blocking_the_next() {
        let mut ledger = CommandLedger::new("p1");
        let now = Instant::now();

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        ledger.push("M400", tx1, now); // already past due
        ledger.push("M105", tx2, now + Duration::from_secs(10));

        assert_eq!(ledger.fail_expired(now), 1);
        assert!(matches!(rx1.await.unwrap(), Err(Error::CommandTimeout { .. })));

        // The next command still resolves normally.
        assert!(ledger.resolve_ack("T:20.0 /0.0"));
        assert_eq!(rx2.await.unwrap().unwrap(), "T:20.0 /0.0");
    }

    #[tokio::test]
    async fn fail_all_drains_everything() {
        let mut ledger = CommandLedger::new("p1");
        let deadline = Instant::now() + Duration::from_secs(10);
        let (tx1, rx1) = oneshot::channel();
        ledger.push("G28", tx1, deadline);

        ledger.fail_all("port closed");
        assert!(ledger.is_empty());
        assert!(matches!(rx1.await.unwrap(), Err(Error::Connection { .. })));
    }
}
