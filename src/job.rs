//! Print jobs and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Highest priority a job may carry.
pub const MAX_PRIORITY: u8 = 10;

/// Lifecycle state of a print job.
///
/// ```text
/// queued -> preparing -> printing -> completed
///                 \         |  ^
///                  \        v  |
///                   \     paused
///                    \      |
///  {queued,preparing,printing,paused} -> cancelled
///       {preparing,printing,paused}  -> failed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its device to become idle.
    Queued,
    /// Promoted; file transfer / warm-up in flight.
    Preparing,
    /// The device confirmed the print started.
    Printing,
    /// Suspended, either explicitly or by recovery.
    Paused,
    /// The device reported the print done.
    Completed,
    /// Gave up after an unrecoverable device error.
    Failed,
    /// Removed on request.
    Cancelled,
}

impl JobStatus {
    /// Whether the job is done for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Whether the job occupies its device's current-job slot.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Preparing | JobStatus::Printing | JobStatus::Paused)
    }

    /// Whether moving to `next` is a legal edge of the state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Preparing) => true,
            (Preparing, Printing) => true,
            (Printing, Paused) => true,
            (Paused, Printing) => true,
            (Printing, Completed) => true,
            (Preparing | Printing | Paused, Failed) => true,
            (Queued | Preparing | Printing | Paused, Cancelled) => true,
            _ => false,
        }
    }

    /// Lower-case label, matching the serde representation.
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Preparing => "preparing",
            JobStatus::Printing => "printing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// The file a job should print: a named reference to a path on disk, or
/// inline G-code content.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FileRef {
    /// Display name (`benchy.gcode`).
    pub name: String,
    /// Path on the local filesystem, if the content lives there.
    pub path: Option<std::path::PathBuf>,
    /// Inline content, if the caller submitted bytes directly.
    pub content: Option<String>,
}

impl FileRef {
    /// A reference to a file on disk.
    pub fn path(name: impl Into<String>, path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: Some(path.into()),
            content: None,
        }
    }

    /// Inline content submitted directly.
    pub fn inline(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            content: Some(content.into()),
        }
    }

    fn is_empty(&self) -> bool {
        self.name.trim().is_empty() || (self.path.is_none() && self.content.is_none())
    }
}

/// Per-job print settings.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct JobSettings {
    /// Target hotend temperature, degrees Celsius.
    pub hotend_temp: Option<f64>,
    /// Target bed temperature, degrees Celsius.
    pub bed_temp: Option<f64>,
    /// Print speed as a percentage of the sliced feedrate.
    pub speed_percent: Option<u16>,
}

/// One request to print a file on a specific device.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PrintJob {
    /// Unique job id.
    pub id: Uuid,
    /// The device this job is bound to.
    pub device_id: String,
    /// What to print.
    pub file: FileRef,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// 0 (lowest) ..= 10 (highest).
    pub priority: u8,
    /// Progress in percent while printing.
    pub progress: f64,
    /// Slicer estimate for the whole job, seconds.
    pub estimated_duration_sec: Option<u64>,
    /// Remaining time estimate, seconds.
    pub remaining_duration_sec: Option<u64>,
    /// When the job left the queue.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Retry counter, bumped when recovery restarts the job.
    pub attempt: u32,
    /// Temperatures and speed overrides.
    pub settings: JobSettings,
    /// Submission time, used for FIFO tie-breaks.
    pub submitted_at: DateTime<Utc>,
}

impl PrintJob {
    /// Create a new queued job. Fails with [Error::Validation] if the file
    /// reference is empty or the priority is out of bounds; no partial side
    /// effects.
    pub fn new(device_id: impl Into<String>, file: FileRef, priority: u8) -> Result<Self> {
        if file.is_empty() {
            return Err(Error::Validation("job file reference must not be empty".into()));
        }
        if priority > MAX_PRIORITY {
            return Err(Error::Validation(format!(
                "priority {priority} out of bounds (0..={MAX_PRIORITY})"
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            file,
            status: JobStatus::Queued,
            priority,
            progress: 0.0,
            estimated_duration_sec: None,
            remaining_duration_sec: None,
            started_at: None,
            ended_at: None,
            attempt: 0,
            settings: JobSettings::default(),
            submitted_at: Utc::now(),
        })
    }

    /// Move the job to `next`, stamping `started_at`/`ended_at` as the state
    /// machine requires. Illegal edges fail with [Error::InvalidState].
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidState {
                job: self.id,
                from: self.status.label().into(),
                to: next.label().into(),
            });
        }
        if self.status == JobStatus::Queued && next == JobStatus::Preparing {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn job() -> PrintJob {
        PrintJob::new("d1", FileRef::inline("benchy.gcode", "G28\nG1 X10"), 5).unwrap()
    }

    #[test]
    fn happy_path_transitions() {
        let mut j = job();
        j.transition(JobStatus::Preparing).unwrap();
        assert!(j.started_at.is_some());
        j.transition(JobStatus::Printing).unwrap();
        j.transition(JobStatus::Paused).unwrap();
        j.transition(JobStatus::Printing).unwrap();
        j.transition(JobStatus::Completed).unwrap();
        assert!(j.ended_at.is_some());
        assert!(j.status.is_terminal());
    }

    #[test]
    fn queued_cannot_complete_directly() {
        let mut j = job();
        let err = j.transition(JobStatus::Completed).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(j.status, JobStatus::Queued);
    }

    #[test]
    fn terminal_states_are_final() {
        let mut j = job();
        j.transition(JobStatus::Cancelled).unwrap();
        assert!(j.transition(JobStatus::Preparing).is_err());
        assert!(j.transition(JobStatus::Printing).is_err());
    }

    #[test]
    fn cancellation_stamps_ended_at() {
        let mut j = job();
        j.transition(JobStatus::Preparing).unwrap();
        j.transition(JobStatus::Cancelled).unwrap();
        assert!(j.ended_at.is_some());
    }

    #[test]
    fn rejects_empty_file_and_bad_priority() {
        assert!(PrintJob::new("d1", FileRef::inline("", ""), 5).is_err());
        assert!(PrintJob::new(
            "d1",
            FileRef::inline("a.gcode", "G28"),
            MAX_PRIORITY + 1
        )
        .is_err());
    }

    #[test]
    fn active_states_occupy_device_slot() {
        assert!(JobStatus::Preparing.is_active());
        assert!(JobStatus::Printing.is_active());
        assert!(JobStatus::Paused.is_active());
        assert!(!JobStatus::Queued.is_active());
        assert!(!JobStatus::Completed.is_active());
    }
}
