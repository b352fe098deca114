//! Failure classification, per-device circuit breakers, and reconnect
//! backoff.
//!
//! Recovery never touches a transport. It watches failures, keeps breaker
//! state, and emits [RecoveryIntent]s on a channel the orchestrator drains;
//! the orchestrator stays the single owner of every transport lifecycle and
//! no reentrant call stacks form between the two.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Circuit breaker state for one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; requests pass through.
    Closed,
    /// Too many failures; requests are rejected until the cooldown elapses.
    Open,
    /// Cooldown elapsed; the next request is allowed through as a probe.
    HalfOpen,
}

impl CircuitState {
    /// Lower-case label for snapshots and logs.
    pub fn label(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Thresholds and cooldown for the breaker.
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Consecutive command failures before the breaker opens.
    pub command_threshold: u32,
    /// Consecutive connection failures before the breaker opens. Connection
    /// failures are tracked separately from command failures.
    pub connection_threshold: u32,
    /// How long an open breaker rejects requests before going half-open.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            command_threshold: 3,
            connection_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Per-device failure-isolation state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    command_failures: u32,
    connection_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    /// A closed breaker with the given thresholds.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            command_failures: 0,
            connection_failures: 0,
            opened_at: None,
        }
    }

    /// Whether a request may go to the hardware right now. An open breaker
    /// whose cooldown has elapsed moves to half-open and lets this one
    /// request through as a probe; further requests are rejected until the
    /// probe resolves. Returns the remaining cooldown otherwise.
    pub fn allow(&mut self) -> std::result::Result<(), Duration> {
        match self.state {
            CircuitState::Closed => Ok(()),
            // Exactly one in-flight probe while half-open.
            CircuitState::HalfOpen => Err(Duration::ZERO),
            CircuitState::Open => {
                let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or(self.config.cooldown);
                if elapsed >= self.config.cooldown {
                    debug!("breaker cooldown elapsed, going half-open");
                    self.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(self.config.cooldown - elapsed)
                }
            }
        }
    }

    /// A request succeeded: close the breaker and reset failure counts.
    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            info!(prev = self.state.label(), "device recovered, closing breaker");
        }
        self.state = CircuitState::Closed;
        self.command_failures = 0;
        self.connection_failures = 0;
        self.opened_at = None;
    }

    /// A command failed. Returns true when this failure tripped the breaker.
    pub fn record_command_failure(&mut self) -> bool {
        self.command_failures += 1;
        self.trip_if_needed(self.command_failures >= self.config.command_threshold)
    }

    /// A connect attempt failed. Returns true when this failure tripped the
    /// breaker.
    pub fn record_connection_failure(&mut self) -> bool {
        self.connection_failures += 1;
        self.trip_if_needed(self.connection_failures >= self.config.connection_threshold)
    }

    fn trip_if_needed(&mut self, over_threshold: bool) -> bool {
        match self.state {
            // A failed half-open probe re-opens immediately and restarts the
            // cooldown.
            CircuitState::HalfOpen => {
                warn!("half-open probe failed, reopening breaker");
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
                true
            }
            CircuitState::Closed if over_threshold => {
                warn!(
                    command_failures = self.command_failures,
                    connection_failures = self.connection_failures,
                    "failure threshold reached, opening breaker"
                );
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Consecutive failures (whichever class is higher).
    pub fn consecutive_failures(&self) -> u32 {
        self.command_failures.max(self.connection_failures)
    }
}

/// Exponential backoff with a cap: `delay = min(base * 2^attempt, max)`.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    /// First delay.
    pub base: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    /// Delay before the given (zero-based) attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(attempt.min(16)));
        exp.min(self.max)
    }
}

/// What recovery decided should happen next for a device.
#[derive(Clone, Debug, PartialEq)]
pub enum RecoveryIntent {
    /// Schedule a reconnect attempt after the backoff delay.
    Reconnect {
        /// Device to reconnect.
        device_id: String,
    },
    /// Pause the device's current job; the connection stays up.
    PauseCurrentJob {
        /// Device whose job should pause.
        device_id: String,
        /// Operator-visible reason.
        reason: String,
    },
    /// Cancel the device's current job and disconnect without auto-reconnect.
    Isolate {
        /// Device to isolate.
        device_id: String,
        /// The critical fault as the device reported it.
        reason: String,
    },
}

/// How a failure should be handled, per the classification table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient command timeout: retry the command once, then count it.
    CommandTimeout,
    /// The link dropped: schedule backoff reconnect.
    ConnectionLost,
    /// Critical, non-recoverable device fault: cancel, disconnect, stay down.
    Critical,
    /// Device-reported but recoverable: pause the job, keep the link.
    Recoverable,
    /// Not a hardware problem (validation errors, commands sent before
    /// connect); recovery ignores it.
    NotHardware,
}

/// Classify an error into a recovery handling class.
pub fn classify(err: &Error) -> FailureKind {
    match err {
        Error::CommandTimeout { .. } => FailureKind::CommandTimeout,
        // NotConnected is the caller's mistake (command before connect), not
        // a link the transport observed dropping; it never counts against
        // the breaker.
        Error::Connection { .. } => FailureKind::ConnectionLost,
        Error::UnrecoverableDevice { .. } => FailureKind::Critical,
        Error::Io(_) | Error::Http(_) => FailureKind::ConnectionLost,
        #[cfg(feature = "serial")]
        Error::Serial(_) => FailureKind::ConnectionLost,
        _ => FailureKind::NotHardware,
    }
}

/// Firmware error strings that mean the hardware must not be driven further.
const CRITICAL_FAULTS: &[&str] = &[
    "thermal runaway",
    "heating failed",
    "mintemp",
    "maxtemp",
    "printer halted",
    "kill() called",
];

/// Whether a device-reported error line is a critical, non-recoverable
/// fault (thermal runaway and friends).
pub fn is_critical_fault(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    CRITICAL_FAULTS.iter().any(|needle| lower.contains(needle))
}

/// Per-device breakers plus the intent channel the orchestrator drains.
pub struct RecoveryManager {
    breakers: DashMap<String, std::sync::Mutex<CircuitBreaker>>,
    config: BreakerConfig,
    intents: mpsc::UnboundedSender<RecoveryIntent>,
}

impl RecoveryManager {
    /// New manager; the receiver side goes to the orchestrator's intent loop.
    pub fn new(config: BreakerConfig) -> (Self, mpsc::UnboundedReceiver<RecoveryIntent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                breakers: DashMap::new(),
                config,
                intents: tx,
            },
            rx,
        )
    }

    fn with_breaker<R>(&self, device_id: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let entry = self
            .breakers
            .entry(device_id.to_owned())
            .or_insert_with(|| std::sync::Mutex::new(CircuitBreaker::new(self.config)));
        let mut breaker = entry.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut breaker)
    }

    /// Gate a connect/command attempt on the breaker. Fails with
    /// [Error::CircuitOpen] without touching hardware while the breaker is
    /// open.
    pub fn check(&self, device_id: &str) -> Result<()> {
        self.with_breaker(device_id, |b| b.allow()).map_err(|retry_after| Error::CircuitOpen {
            device: device_id.to_owned(),
            retry_after,
        })
    }

    /// Record a successful operation.
    pub fn on_success(&self, device_id: &str) {
        self.with_breaker(device_id, |b| b.record_success());
    }

    /// Record a failure and emit the intents the classification table calls
    /// for. `has_current_job` gates the job-level intents.
    pub fn on_failure(&self, device_id: &str, err: &Error, has_current_job: bool) {
        match classify(err) {
            FailureKind::CommandTimeout => {
                let tripped = self.with_breaker(device_id, |b| b.record_command_failure());
                if tripped {
                    debug!(device = device_id, "breaker tripped on command failures");
                }
            }
            FailureKind::ConnectionLost => {
                self.with_breaker(device_id, |b| b.record_connection_failure());
                self.send(RecoveryIntent::Reconnect {
                    device_id: device_id.to_owned(),
                });
            }
            FailureKind::Critical => {
                self.send(RecoveryIntent::Isolate {
                    device_id: device_id.to_owned(),
                    reason: err.to_string(),
                });
            }
            FailureKind::Recoverable => {
                if has_current_job {
                    self.send(RecoveryIntent::PauseCurrentJob {
                        device_id: device_id.to_owned(),
                        reason: err.to_string(),
                    });
                }
            }
            FailureKind::NotHardware => {}
        }
    }

    /// A device reported an error line on its own (no command failed).
    pub fn on_device_report(&self, device_id: &str, message: &str, has_current_job: bool) {
        if is_critical_fault(message) {
            self.send(RecoveryIntent::Isolate {
                device_id: device_id.to_owned(),
                reason: message.to_owned(),
            });
        } else if has_current_job {
            self.send(RecoveryIntent::PauseCurrentJob {
                device_id: device_id.to_owned(),
                reason: message.to_owned(),
            });
        }
    }

    /// Breaker state label for snapshots.
    pub fn circuit_label(&self, device_id: &str) -> &'static str {
        if self.breakers.contains_key(device_id) {
            self.with_breaker(device_id, |b| b.state().label())
        } else {
            CircuitState::Closed.label()
        }
    }

    /// Consecutive failure count for snapshots.
    pub fn consecutive_failures(&self, device_id: &str) -> u32 {
        if self.breakers.contains_key(device_id) {
            self.with_breaker(device_id, |b| b.consecutive_failures())
        } else {
            0
        }
    }

    /// Drop breaker state for a removed device.
    pub fn forget(&self, device_id: &str) {
        self.breakers.remove(device_id);
    }

    fn send(&self, intent: RecoveryIntent) {
        // The receiver only goes away on shutdown; dropping intents then is
        // fine.
        let _ = self.intents.send(intent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            command_threshold: 3,
            connection_threshold: 5,
            cooldown: Duration::from_millis(20),
        }
    }

    #[test]
    fn breaker_opens_after_command_threshold() {
        let mut b = CircuitBreaker::new(fast_config());
        assert!(!b.record_command_failure());
        assert!(!b.record_command_failure());
        assert!(b.record_command_failure());
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.allow().is_err());
    }

    #[test]
    fn connection_failures_use_their_own_threshold() {
        let mut b = CircuitBreaker::new(fast_config());
        for _ in 0..4 {
            assert!(!b.record_connection_failure());
        }
        assert!(b.record_connection_failure());
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn open_breaker_reports_remaining_cooldown() {
        let mut b = CircuitBreaker::new(BreakerConfig {
            cooldown: Duration::from_secs(60),
            ..fast_config()
        });
        for _ in 0..3 {
            b.record_command_failure();
        }
        let remaining = b.allow().unwrap_err();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(50));
    }

    #[test]
    fn half_open_probe_success_closes() {
        let mut b = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            b.record_command_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(b.allow().is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[test]
    fn half_open_admits_a_single_probe() {
        let mut b = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            b.record_command_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(b.allow().is_ok());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        // Probe in flight; nothing else passes until it resolves.
        assert!(b.allow().is_err());
        b.record_success();
        assert!(b.allow().is_ok());
    }

    #[test]
    fn half_open_probe_failure_reopens() {
        let mut b = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            b.record_command_failure();
        }
        std::thread::sleep(Duration::from_millis(25));
        assert!(b.allow().is_ok());
        assert!(b.record_command_failure());
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.allow().is_err());
    }

    #[test]
    fn backoff_is_nondecreasing_and_capped() {
        let backoff = Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        };
        let mut last = Duration::ZERO;
        for attempt in 0..12 {
            let delay = backoff.delay(attempt);
            assert!(delay >= last);
            assert!(delay <= Duration::from_secs(30));
            last = delay;
        }
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(10), Duration::from_secs(30));
    }

    #[test]
    fn thermal_runaway_is_critical() {
        assert!(is_critical_fault("Error:Thermal Runaway, system stopped! Heater_ID: 0"));
        assert!(is_critical_fault("Error:MINTEMP triggered, system stopped!"));
        assert!(!is_critical_fault("echo:busy: processing"));
    }

    #[test]
    fn classification_table() {
        assert_eq!(
            classify(&Error::CommandTimeout {
                device: "d1".into(),
                command: "M105".into()
            }),
            FailureKind::CommandTimeout
        );
        assert_eq!(
            classify(&Error::Connection {
                device: "d1".into(),
                message: "refused".into()
            }),
            FailureKind::ConnectionLost
        );
        assert_eq!(
            classify(&Error::UnrecoverableDevice {
                device: "d1".into(),
                message: "thermal runaway".into()
            }),
            FailureKind::Critical
        );
        assert_eq!(classify(&Error::Validation("x".into())), FailureKind::NotHardware);
        assert_eq!(classify(&Error::NotFound("x".into())), FailureKind::NotHardware);
        assert_eq!(classify(&Error::NotConnected("d1".into())), FailureKind::NotHardware);
    }

    #[tokio::test]
    async fn manager_rejects_while_open_and_emits_reconnect() {
        let (manager, mut intents) = RecoveryManager::new(BreakerConfig {
            command_threshold: 2,
            connection_threshold: 5,
            cooldown: Duration::from_secs(60),
        });

        let timeout = Error::CommandTimeout {
            device: "d1".into(),
            command: "G28".into(),
        };
        manager.on_failure("d1", &timeout, false);
        manager.on_failure("d1", &timeout, false);
        assert_eq!(manager.circuit_label("d1"), "open");
        assert!(matches!(manager.check("d1"), Err(Error::CircuitOpen { .. })));

        let drop = Error::Connection {
            device: "d2".into(),
            message: "reset by peer".into(),
        };
        manager.on_failure("d2", &drop, false);
        assert_eq!(
            intents.recv().await,
            Some(RecoveryIntent::Reconnect { device_id: "d2".into() })
        );
    }

    #[tokio::test]
    async fn critical_report_isolates() {
        let (manager, mut intents) = RecoveryManager::new(BreakerConfig::default());
        manager.on_device_report("d1", "Error:Thermal Runaway, system stopped!", true);
        match intents.recv().await {
            Some(RecoveryIntent::Isolate { device_id, .. }) => assert_eq!(device_id, "d1"),
            other => panic!("expected isolate intent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recoverable_report_pauses_only_with_current_job() {
        let (manager, mut intents) = RecoveryManager::new(BreakerConfig::default());
        manager.on_device_report("d1", "echo:Filament runout detected", false);
        manager.on_device_report("d1", "echo:Filament runout detected", true);
        match intents.recv().await {
            Some(RecoveryIntent::PauseCurrentJob { device_id, .. }) => assert_eq!(device_id, "d1"),
            other => panic!("expected pause intent, got {other:?}"),
        }
    }
}
