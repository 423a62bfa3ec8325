//! Tracing and telemetry instrumentation for tapeq.
//!
//! Helper functions for creating tracing spans and recording queue, mount and
//! garbage-collection events. All functions work both with and without the
//! `metrics` feature flag; with it enabled they also update Prometheus.
//!
//! # Example
//!
//! ```ignore
//! use tapeq::telemetry::{pop_span, record_jobs_popped};
//!
//! let span = pop_span("V00001", 42);
//! let _enter = span.enter();
//! record_jobs_popped("V00001", 10);
//! ```

use std::time::{Duration, Instant};

use tracing::{Span, info_span};

/// Create a tracing span for queueing jobs onto a tape's queue.
#[must_use]
pub fn enqueue_span(vid: impl AsRef<str>, jobs: usize) -> Span {
    info_span!("tapeq.enqueue", vid = %vid.as_ref(), jobs = jobs)
}

/// Create a tracing span for one `get_next_job_batch` call.
///
/// # Arguments
/// * `vid` - The mounted tape
/// * `mount_id` - The mount transaction id
#[must_use]
pub fn pop_span(vid: impl AsRef<str>, mount_id: u64) -> Span {
    info_span!("tapeq.pop", vid = %vid.as_ref(), mount_id = mount_id)
}

/// Create a tracing span for flushing success reports.
#[must_use]
pub fn flush_span(vid: impl AsRef<str>, jobs: usize) -> Span {
    info_span!("tapeq.flush", vid = %vid.as_ref(), jobs = jobs)
}

/// Create a tracing span for collecting one dead agent.
///
/// # Arguments
/// * `collector` - Address of the collecting agent
/// * `dead_agent` - Address of the agent being collected
#[must_use]
pub fn gc_span(collector: impl AsRef<str>, dead_agent: impl AsRef<str>) -> Span {
    info_span!(
        "tapeq.gc",
        collector = %collector.as_ref(),
        dead_agent = %dead_agent.as_ref(),
    )
}

/// Record jobs added to a tape's queue.
pub fn record_jobs_queued(vid: impl AsRef<str>, count: usize) {
    tracing::info!(vid = %vid.as_ref(), count = count, "jobs queued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_jobs_queued(vid.as_ref(), count as f64);
}

/// Record jobs handed to a mount.
pub fn record_jobs_popped(vid: impl AsRef<str>, count: usize) {
    tracing::debug!(vid = %vid.as_ref(), count = count, "jobs popped");

    #[cfg(feature = "metrics")]
    crate::metrics::record_jobs_popped(vid.as_ref(), count as f64);
}

/// Record the end of a job's life on a mount.
///
/// # Arguments
/// * `vid` - The tape the job was read from
/// * `status` - One of `success`, `requeued`, `failed`
pub fn record_job_finished(vid: impl AsRef<str>, status: impl AsRef<str>) {
    tracing::debug!(
        vid = %vid.as_ref(),
        status = %status.as_ref(),
        "job finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(vid.as_ref(), status.as_ref());
}

/// Record a disk system struck out of a mount for lack of space.
pub fn record_disk_system_full(
    vid: impl AsRef<str>,
    disk_system: impl AsRef<str>,
) {
    tracing::warn!(
        vid = %vid.as_ref(),
        disk_system = %disk_system.as_ref(),
        "disk system full, excluded for the rest of the mount"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_disk_system_full(disk_system.as_ref());
}

/// Record the outcome of collecting one object.
pub fn record_gc_object(
    address: impl AsRef<str>,
    object_type: impl AsRef<str>,
    outcome: impl AsRef<str>,
) {
    tracing::info!(
        address = %address.as_ref(),
        object_type = %object_type.as_ref(),
        outcome = %outcome.as_ref(),
        "object garbage collected"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_gc_object(object_type.as_ref(), outcome.as_ref());
}

/// Update the queue depth gauge.
pub fn set_queue_depth(vid: impl AsRef<str>, depth: u64) {
    tracing::debug!(vid = %vid.as_ref(), depth = depth, "queue depth updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(vid.as_ref(), depth as f64);
}

/// Start timing a batch selection.
pub fn record_batch_start() -> BatchTimer {
    BatchTimer {
        start: Instant::now(),
    }
}

/// Finish timing a batch selection.
pub fn record_batch_end(timer: BatchTimer, vid: impl AsRef<str>, jobs: usize) {
    let duration_secs = timer.elapsed().as_secs_f64();
    tracing::debug!(
        vid = %vid.as_ref(),
        jobs = jobs,
        duration_secs = duration_secs,
        "batch selected"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_batch_duration(vid.as_ref(), duration_secs);
}

/// Opaque handle returned by [`record_batch_start`].
#[derive(Debug)]
pub struct BatchTimer {
    start: Instant,
}

impl BatchTimer {
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry());
        assert_eq!(enqueue_span("V1", 3).metadata().unwrap().name(), "tapeq.enqueue");
        assert_eq!(pop_span("V1", 7).metadata().unwrap().name(), "tapeq.pop");
        assert_eq!(flush_span("V1", 3).metadata().unwrap().name(), "tapeq.flush");
        assert_eq!(gc_span("gc", "dead").metadata().unwrap().name(), "tapeq.gc");
    }

    #[test]
    fn test_batch_timer() {
        let timer = record_batch_start();
        std::thread::sleep(Duration::from_millis(1));
        assert!(timer.elapsed().as_nanos() > 0);
        record_batch_end(timer, "V1", 0);
    }
}
