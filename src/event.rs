//! Outbound event surface.
//!
//! Every device and job state transition the orchestrator observes is
//! republished here for the event-broadcaster collaborator. Delivery is
//! at-least-once: recovery-driven replays can duplicate a transition, so
//! consumers must treat these idempotently.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    job::PrintJob,
    telemetry::{DeviceSnapshot, PrinterStatus},
};

/// A state transition visible to external consumers.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A device finished its connect handshake.
    DeviceConnected {
        /// Device id.
        device_id: String,
    },

    /// A device link went down, either on request or by failure.
    DeviceDisconnected {
        /// Device id.
        device_id: String,
    },

    /// Fresh runtime state for a device.
    DeviceStatusUpdate {
        /// Device id.
        device_id: String,
        /// Full snapshot at the time of the update.
        snapshot: DeviceSnapshot,
    },

    /// A device reported or caused an error.
    DeviceError {
        /// Device id.
        device_id: String,
        /// Human-readable description.
        message: String,
        /// True when the fault is critical and the device will not be
        /// auto-reconnected.
        unrecoverable: bool,
    },

    /// The device's printer status changed from one value to another.
    DeviceStatusChanged {
        /// Device id.
        device_id: String,
        /// Previous status.
        from: PrinterStatus,
        /// New status.
        to: PrinterStatus,
    },

    /// Automatic reconnection gave up after exhausting its attempts.
    ReconnectFailed {
        /// Device id.
        device_id: String,
        /// How many attempts were made.
        attempts: u32,
    },

    /// A job was promoted and the device confirmed the print start.
    JobStarted {
        /// Job id.
        job_id: Uuid,
        /// Device the job runs on.
        device_id: String,
    },

    /// Progress tick for the current job.
    JobProgress {
        /// Job id.
        job_id: Uuid,
        /// Device the job runs on.
        device_id: String,
        /// Percent complete.
        progress: f64,
    },

    /// The current job was paused.
    JobPaused {
        /// Job id.
        job_id: Uuid,
        /// Device the job runs on.
        device_id: String,
    },

    /// The current job resumed printing.
    JobResumed {
        /// Job id.
        job_id: Uuid,
        /// Device the job runs on.
        device_id: String,
    },

    /// The current job finished.
    JobCompleted {
        /// Job id.
        job_id: Uuid,
        /// Device the job ran on.
        device_id: String,
    },

    /// The current job failed for good.
    JobFailed {
        /// Job id.
        job_id: Uuid,
        /// Device the job ran on.
        device_id: String,
        /// Why.
        message: String,
    },

    /// A job was cancelled (queued or in flight).
    JobCancelled {
        /// Job id.
        job_id: Uuid,
        /// Device the job was bound to.
        device_id: String,
    },

    /// The ordering or content of a device's queue changed.
    QueueUpdated {
        /// Device whose queue changed.
        device_id: String,
        /// Snapshot of the queue, front first.
        jobs: Vec<PrintJob>,
    },
}

impl Event {
    /// The device this event concerns.
    pub fn device_id(&self) -> &str {
        match self {
            Event::DeviceConnected { device_id }
            | Event::DeviceDisconnected { device_id }
            | Event::DeviceStatusUpdate { device_id, .. }
            | Event::DeviceError { device_id, .. }
            | Event::DeviceStatusChanged { device_id, .. }
            | Event::ReconnectFailed { device_id, .. }
            | Event::JobStarted { device_id, .. }
            | Event::JobProgress { device_id, .. }
            | Event::JobPaused { device_id, .. }
            | Event::JobResumed { device_id, .. }
            | Event::JobCompleted { device_id, .. }
            | Event::JobFailed { device_id, .. }
            | Event::JobCancelled { device_id, .. }
            | Event::QueueUpdated { device_id, .. } => device_id,
        }
    }
}
