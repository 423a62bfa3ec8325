//! Prometheus metrics instrumentation for tapeq.
//!
//! All metrics are conditionally compiled behind the `metrics` feature flag.
//!
//! # Metrics
//!
//! ## Counters
//! - `tapeq_jobs_queued_total` - Jobs added to retrieve queues
//! - `tapeq_jobs_popped_total` - Jobs handed to mounts
//! - `tapeq_jobs_finished_total` - Jobs reported by mounts, by outcome
//! - `tapeq_disk_system_full_total` - Disk systems struck out of a mount
//! - `tapeq_gc_objects_total` - Objects handled by the garbage collector
//!
//! ## Gauges
//! - `tapeq_queue_depth` - Jobs queued per tape
//!
//! ## Histograms
//! - `tapeq_batch_duration_seconds` - Time to select one job batch
#![cfg(feature = "metrics")]

use prometheus::{CounterVec, GaugeVec, HistogramVec, Opts, Registry, exponential_buckets};
use std::sync::LazyLock;

/// Global Prometheus registry for tapeq metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels:
/// - `vid`: The tape the queue belongs to
pub static JOBS_QUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("tapeq_jobs_queued_total", "Total number of jobs queued");
    CounterVec::new(opts, &["vid"]).expect("tapeq_jobs_queued_total metric creation failed")
});

/// Labels:
/// - `vid`: The mounted tape
pub static JOBS_POPPED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("tapeq_jobs_popped_total", "Total number of jobs popped by mounts");
    CounterVec::new(opts, &["vid"]).expect("tapeq_jobs_popped_total metric creation failed")
});

/// Labels:
/// - `vid`: The mounted tape
/// - `status`: success, requeued or failed
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "tapeq_jobs_finished_total",
        "Total number of jobs reported by mounts",
    );
    CounterVec::new(opts, &["vid", "status"])
        .expect("tapeq_jobs_finished_total metric creation failed")
});

/// Labels:
/// - `disk_system`: The disk system found full
pub static DISK_SYSTEM_FULL_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "tapeq_disk_system_full_total",
        "Total number of times a disk system was struck out of a mount",
    );
    CounterVec::new(opts, &["disk_system"])
        .expect("tapeq_disk_system_full_total metric creation failed")
});

/// Labels:
/// - `object_type`: Type of the collected object
/// - `outcome`: What the collector did with it
pub static GC_OBJECTS_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "tapeq_gc_objects_total",
        "Total number of objects handled by the garbage collector",
    );
    CounterVec::new(opts, &["object_type", "outcome"])
        .expect("tapeq_gc_objects_total metric creation failed")
});

/// Labels:
/// - `vid`: The tape the queue belongs to
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("tapeq_queue_depth", "Current number of queued jobs per tape");
    GaugeVec::new(opts, &["vid"]).expect("tapeq_queue_depth metric creation failed")
});

/// Labels:
/// - `vid`: The mounted tape
pub static BATCH_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "tapeq_batch_duration_seconds",
        "Time spent selecting one job batch",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["vid"])
        .expect("tapeq_batch_duration_seconds metric creation failed")
});

/// Register all metrics with the global registry.
///
/// Calling it more than once is harmless.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_QUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_POPPED_TOTAL.clone()),
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(DISK_SYSTEM_FULL_TOTAL.clone()),
        Box::new(GC_OBJECTS_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(BATCH_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_jobs_queued(vid: &str, count: f64) {
    JOBS_QUEUED_TOTAL.with_label_values(&[vid]).inc_by(count);
}

pub fn record_jobs_popped(vid: &str, count: f64) {
    JOBS_POPPED_TOTAL.with_label_values(&[vid]).inc_by(count);
}

pub fn record_job_finished(vid: &str, status: &str) {
    JOBS_FINISHED_TOTAL.with_label_values(&[vid, status]).inc();
}

pub fn record_disk_system_full(disk_system: &str) {
    DISK_SYSTEM_FULL_TOTAL.with_label_values(&[disk_system]).inc();
}

pub fn record_gc_object(object_type: &str, outcome: &str) {
    GC_OBJECTS_TOTAL
        .with_label_values(&[object_type, outcome])
        .inc();
}

pub fn set_queue_depth(vid: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[vid]).set(depth);
}

pub fn observe_batch_duration(vid: &str, duration_secs: f64) {
    BATCH_DURATION_SECONDS
        .with_label_values(&[vid])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
