//! Per-device print queues.
//!
//! The queue exclusively owns [PrintJob] records and their ordering. Each
//! device's job list sits behind its own mutex inside the registry map, so
//! queue operations for one device are serialized (single writer) while
//! different devices proceed independently. The one invariant everything
//! here defends: at most one job per device is ever in an active state
//! (preparing/printing/paused).

use std::sync::{Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{Error, Result},
    job::{JobStatus, PrintJob},
};

/// How many terminal jobs to retain per device before eviction.
const HISTORY_LIMIT: usize = 64;

#[derive(Default)]
struct DeviceQueue {
    /// All jobs for this device, including terminal history. Ordering among
    /// `queued` jobs is the submission/reorder ordering; selection applies
    /// priority on top of it.
    jobs: Vec<PrintJob>,
    /// The single job currently occupying the device, if any.
    current: Option<Uuid>,
}

impl DeviceQueue {
    fn job_mut(&mut self, id: Uuid) -> Option<&mut PrintJob> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    /// Index of the best queued candidate: highest priority, FIFO within a
    /// priority class (stable by current ordering).
    fn next_index(&self) -> Option<usize> {
        self.jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.status == JobStatus::Queued)
            .max_by(|(ia, a), (ib, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.submitted_at.cmp(&a.submitted_at))
                    .then(ib.cmp(ia))
            })
            .map(|(i, _)| i)
    }

    fn evict_history(&mut self) {
        let terminal = self.jobs.iter().filter(|j| j.status.is_terminal()).count();
        if terminal > HISTORY_LIMIT {
            let mut to_drop = terminal - HISTORY_LIMIT;
            self.jobs.retain(|j| {
                if to_drop > 0 && j.status.is_terminal() {
                    to_drop -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }
}

/// The farm-wide queue: one [DeviceQueue] per registered device plus a
/// global job-id index.
#[derive(Default)]
pub struct PrintQueue {
    devices: DashMap<String, Mutex<DeviceQueue>>,
    index: DashMap<Uuid, String>,
}

/// Outcome of a cancellation, so the caller knows whether a device-level
/// stop sequence is warranted.
#[derive(Clone, Debug)]
pub struct Cancelled {
    /// The job after the terminal mark.
    pub job: PrintJob,
    /// True when the job was occupying the device (preparing/printing/paused).
    pub was_active: bool,
}

impl PrintQueue {
    /// New, empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the queue slot for a newly registered device.
    pub fn add_device(&self, device_id: &str) {
        self.devices.entry(device_id.to_owned()).or_default();
    }

    /// Drop a device's queue, cancelling every non-terminal job. Returns the
    /// jobs cancelled by the purge so the caller can emit per-job events.
    pub fn purge_device(&self, device_id: &str) -> Vec<PrintJob> {
        let Some((_, queue)) = self.devices.remove(device_id) else {
            return Vec::new();
        };
        let mut queue = queue.into_inner().unwrap_or_else(PoisonError::into_inner);

        let mut cancelled = Vec::new();
        for job in queue.jobs.iter_mut() {
            self.index.remove(&job.id);
            if !job.status.is_terminal() {
                if job.transition(JobStatus::Cancelled).is_ok() {
                    cancelled.push(job.clone());
                }
            }
        }
        info!(device = device_id, cancelled = cancelled.len(), "purged device queue");
        cancelled
    }

    /// Enqueue a job. The job must already be validated ([PrintJob::new])
    /// and its device registered here.
    pub fn submit(&self, job: PrintJob) -> Result<Uuid> {
        let device_id = job.device_id.clone();
        let queue = self
            .devices
            .get(&device_id)
            .ok_or_else(|| Error::NotFound(format!("device {device_id}")))?;
        let mut queue = lock(&queue);

        let id = job.id;
        debug!(device = %device_id, job = %id, priority = job.priority, "job queued");
        queue.jobs.push(job);
        drop(queue);

        self.index.insert(id, device_id);
        Ok(id)
    }

    /// Promote the best queued job to `preparing`, if the device is free.
    /// Returns the promoted job, or `None` when the device is occupied or
    /// has nothing queued.
    pub fn promote(&self, device_id: &str) -> Result<Option<PrintJob>> {
        let queue = self
            .devices
            .get(device_id)
            .ok_or_else(|| Error::NotFound(format!("device {device_id}")))?;
        let mut queue = lock(&queue);

        if queue.current.is_some() {
            return Ok(None);
        }
        let Some(idx) = queue.next_index() else {
            return Ok(None);
        };

        let id = queue.jobs[idx].id;
        queue.jobs[idx].transition(JobStatus::Preparing)?;
        queue.current = Some(id);
        info!(device = device_id, job = %id, "job promoted to preparing");
        Ok(Some(queue.jobs[idx].clone()))
    }

    /// Apply a state-machine transition to a job. Terminal transitions
    /// release the device's current-job slot and stamp `ended_at`.
    pub fn mark(&self, job_id: Uuid, next: JobStatus) -> Result<PrintJob> {
        let (device_id, queue) = self.queue_for_job(job_id)?;
        let mut queue = lock(&queue);

        let job = queue
            .job_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        job.transition(next)?;
        let snapshot = job.clone();

        if next.is_terminal() {
            if queue.current == Some(job_id) {
                queue.current = None;
            }
            queue.evict_history();
        }
        debug!(device = %device_id, job = %job_id, status = next.label(), "job transitioned");
        Ok(snapshot)
    }

    /// Record a progress tick for a printing job.
    pub fn set_progress(&self, job_id: Uuid, progress: f64) -> Result<PrintJob> {
        let (_, queue) = self.queue_for_job(job_id)?;
        let mut queue = lock(&queue);
        let job = queue
            .job_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        job.progress = progress.clamp(0.0, 100.0);
        if let Some(total) = job.estimated_duration_sec {
            job.remaining_duration_sec = Some(((100.0 - job.progress) / 100.0 * total as f64) as u64);
        }
        Ok(job.clone())
    }

    /// Cancel a job. Queued jobs are simply marked; active jobs are marked
    /// immediately (so no promotion considers the device busy with them) and
    /// `was_active` tells the caller to best-effort stop the hardware.
    /// Cancelling always succeeds once the job exists and is non-terminal.
    pub fn cancel(&self, job_id: Uuid) -> Result<Cancelled> {
        let (device_id, queue) = self.queue_for_job(job_id)?;
        let mut queue = lock(&queue);

        let job = queue
            .job_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        let was_active = job.status.is_active();
        job.transition(JobStatus::Cancelled)?;
        let snapshot = job.clone();

        if queue.current == Some(job_id) {
            queue.current = None;
        }
        info!(device = %device_id, job = %job_id, was_active, "job cancelled");
        Ok(Cancelled { job: snapshot, was_active })
    }

    /// Move a `queued` job to a new position among its device's queued jobs.
    /// Any other status is rejected with [Error::InvalidState].
    pub fn reorder(&self, job_id: Uuid, position: usize) -> Result<()> {
        let (device_id, queue) = self.queue_for_job(job_id)?;
        let mut queue = lock(&queue);

        let Some(from) = queue.jobs.iter().position(|j| j.id == job_id) else {
            return Err(Error::NotFound(format!("job {job_id}")));
        };
        if queue.jobs[from].status != JobStatus::Queued {
            return Err(Error::InvalidState {
                job: job_id,
                from: queue.jobs[from].status.label().into(),
                to: "reordered".into(),
            });
        }

        // Positions are relative to the queued subset; splice the job back
        // in before the queued job currently holding the target slot.
        let job = queue.jobs.remove(from);
        let queued_positions: Vec<usize> = queue
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.status == JobStatus::Queued)
            .map(|(i, _)| i)
            .collect();
        let insert_at = queued_positions
            .get(position)
            .copied()
            .unwrap_or(queue.jobs.len());
        // Reordering to the front also outbids priority: bump to the head
        // job's priority so selection honors the operator's intent.
        let mut job = job;
        if position == 0 {
            let top = queue
                .jobs
                .iter()
                .filter(|j| j.status == JobStatus::Queued)
                .map(|j| j.priority)
                .max()
                .unwrap_or(job.priority);
            job.priority = job.priority.max(top);
            job.submitted_at = queue
                .jobs
                .iter()
                .filter(|j| j.status == JobStatus::Queued)
                .map(|j| j.submitted_at)
                .min()
                .map(|t| t - chrono::Duration::milliseconds(1))
                .unwrap_or(job.submitted_at);
        }
        queue.jobs.insert(insert_at, job);
        debug!(device = %device_id, job = %job_id, position, "job reordered");
        Ok(())
    }

    /// The job currently occupying a device, if any.
    pub fn current_job(&self, device_id: &str) -> Option<PrintJob> {
        let queue = self.devices.get(device_id)?;
        let queue = lock(&queue);
        let id = queue.current?;
        queue.jobs.iter().find(|j| j.id == id).cloned()
    }

    /// Look up a single job.
    pub fn job(&self, job_id: Uuid) -> Option<PrintJob> {
        let (_, queue) = self.queue_for_job(job_id).ok()?;
        let queue = lock(&queue);
        queue.jobs.iter().find(|j| j.id == job_id).cloned()
    }

    /// All jobs for one device, queue order.
    pub fn jobs_for_device(&self, device_id: &str) -> Vec<PrintJob> {
        self.devices
            .get(device_id)
            .map(|q| lock(&q).jobs.clone())
            .unwrap_or_default()
    }

    /// Every job across every device.
    pub fn all_jobs(&self) -> Vec<PrintJob> {
        let mut jobs = Vec::new();
        for entry in self.devices.iter() {
            jobs.extend(lock(&entry).jobs.iter().cloned());
        }
        jobs
    }

    /// Reload persisted jobs at startup. Leftover active jobs are demoted
    /// back to `queued` (a fresh process has no device mid-print), which
    /// keeps the one-current-job invariant trivially true after a restart.
    pub fn reconcile(&self, jobs: Vec<PrintJob>) {
        for mut job in jobs {
            if job.status.is_active() {
                warn!(job = %job.id, status = job.status.label(), "demoting leftover active job to queued");
                job.status = JobStatus::Queued;
                job.started_at = None;
                job.attempt += 1;
            }
            let Some(queue) = self.devices.get(&job.device_id) else {
                warn!(job = %job.id, device = %job.device_id, "dropping job for unknown device");
                continue;
            };
            self.index.insert(job.id, job.device_id.clone());
            lock(&queue).jobs.push(job);
        }
    }

    fn queue_for_job(&self, job_id: Uuid) -> Result<(String, dashmap::mapref::one::Ref<'_, String, Mutex<DeviceQueue>>)> {
        let device_id = self
            .index
            .get(&job_id)
            .map(|d| d.value().clone())
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        let queue = self
            .devices
            .get(&device_id)
            .ok_or_else(|| Error::NotFound(format!("device {device_id}")))?;
        Ok((device_id, queue))
    }
}

fn lock(m: &Mutex<DeviceQueue>) -> MutexGuard<'_, DeviceQueue> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::FileRef;
    use pretty_assertions::assert_eq;

    fn queue_with_device(id: &str) -> PrintQueue {
        let q = PrintQueue::new();
        q.add_device(id);
        q
    }

    fn submit(q: &PrintQueue, device: &str, priority: u8) -> Uuid {
        let job = PrintJob::new(device, FileRef::inline("part.gcode", "G28"), priority).unwrap();
        q.submit(job).unwrap()
    }

    #[test]
    fn higher_priority_promotes_first() {
        let q = queue_with_device("d1");
        let j1 = submit(&q, "d1", 5);
        let j2 = submit(&q, "d1", 8);

        let promoted = q.promote("d1").unwrap().unwrap();
        assert_eq!(promoted.id, j2);
        assert_eq!(promoted.status, JobStatus::Preparing);

        // Device occupied; j1 stays queued.
        assert!(q.promote("d1").unwrap().is_none());
        assert_eq!(q.job(j1).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn equal_priority_breaks_ties_fifo() {
        let q = queue_with_device("d1");
        let j1 = submit(&q, "d1", 5);
        let _j2 = submit(&q, "d1", 5);

        let promoted = q.promote("d1").unwrap().unwrap();
        assert_eq!(promoted.id, j1);
    }

    #[test]
    fn at_most_one_active_job_per_device() {
        let q = queue_with_device("d1");
        submit(&q, "d1", 5);
        submit(&q, "d1", 5);
        submit(&q, "d1", 9);

        q.promote("d1").unwrap().unwrap();
        assert!(q.promote("d1").unwrap().is_none());

        let active: Vec<_> = q
            .jobs_for_device("d1")
            .into_iter()
            .filter(|j| j.status.is_active())
            .collect();
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn cancelling_active_job_frees_device() {
        let q = queue_with_device("d1");
        let j1 = submit(&q, "d1", 5);
        let j3 = submit(&q, "d1", 3);

        let promoted = q.promote("d1").unwrap().unwrap();
        assert_eq!(promoted.id, j1);
        q.mark(j1, JobStatus::Printing).unwrap();

        let cancelled = q.cancel(j1).unwrap();
        assert!(cancelled.was_active);
        assert_eq!(cancelled.job.status, JobStatus::Cancelled);
        assert!(cancelled.job.ended_at.is_some());

        // Next queued job promotes now that the slot is free.
        let next = q.promote("d1").unwrap().unwrap();
        assert_eq!(next.id, j3);
    }

    #[test]
    fn cancelling_queued_job_is_not_active() {
        let q = queue_with_device("d1");
        let j1 = submit(&q, "d1", 5);
        let cancelled = q.cancel(j1).unwrap();
        assert!(!cancelled.was_active);
    }

    #[test]
    fn reorder_to_front_changes_selection() {
        let q = queue_with_device("d1");
        let _j1 = submit(&q, "d1", 5);
        let j2 = submit(&q, "d1", 5);

        q.reorder(j2, 0).unwrap();
        let promoted = q.promote("d1").unwrap().unwrap();
        assert_eq!(promoted.id, j2);
    }

    #[test]
    fn reorder_rejects_non_queued() {
        let q = queue_with_device("d1");
        let j1 = submit(&q, "d1", 5);
        q.promote("d1").unwrap().unwrap();
        q.mark(j1, JobStatus::Printing).unwrap();

        let err = q.reorder(j1, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn submit_to_unknown_device_fails() {
        let q = PrintQueue::new();
        let job = PrintJob::new("ghost", FileRef::inline("a.gcode", "G28"), 1).unwrap();
        assert!(matches!(q.submit(job), Err(Error::NotFound(_))));
    }

    #[test]
    fn purge_cancels_non_terminal_jobs() {
        let q = queue_with_device("d1");
        let j1 = submit(&q, "d1", 5);
        let _j2 = submit(&q, "d1", 2);
        q.promote("d1").unwrap().unwrap();
        q.mark(j1, JobStatus::Printing).unwrap();

        let cancelled = q.purge_device("d1");
        assert_eq!(cancelled.len(), 2);
        assert!(cancelled.iter().all(|j| j.status == JobStatus::Cancelled));
        assert!(q.jobs_for_device("d1").is_empty());
    }

    #[test]
    fn reconcile_demotes_leftover_active_jobs() {
        let q = queue_with_device("d1");
        let mut job = PrintJob::new("d1", FileRef::inline("a.gcode", "G28"), 4).unwrap();
        job.status = JobStatus::Printing;

        q.reconcile(vec![job]);
        let jobs = q.jobs_for_device("d1");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Queued);
        assert_eq!(jobs[0].attempt, 1);
        assert!(q.current_job("d1").is_none());
    }

    #[test]
    fn progress_updates_remaining_estimate() {
        let q = queue_with_device("d1");
        let j1 = submit(&q, "d1", 5);
        q.promote("d1").unwrap();
        q.mark(j1, JobStatus::Printing).unwrap();

        {
            // Estimated duration comes from the device/file; fake one in.
            let (_, entry) = q.queue_for_job(j1).unwrap();
            lock(&entry).job_mut(j1).unwrap().estimated_duration_sec = Some(1000);
        }
        let job = q.set_progress(j1, 25.0).unwrap();
        assert_eq!(job.remaining_duration_sec, Some(750));
    }
}
