//! Run-time counters for devmon's own behavior
//!
//! Every drop, eviction and restart in the pipeline is counted here so that
//! downstream collaborators -- dashboards, alerting, an operator with
//! `grep` -- can see what the agent has been up to. The registry is an
//! explicit object constructed once at boot and passed by reference to the
//! units that write to it; there are no process-wide statics to couple
//! against.

use metric::{Sample, Unit};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters shared by the sampler, forwarder and supervisor.
///
/// Writers bump the fields directly with `fetch_add(_, Ordering::Relaxed)`.
/// The counts are monotonic for the life of the process.
#[derive(Debug, Default)]
pub struct Report {
    /// Total samples pushed into the buffer.
    pub samples: AtomicUsize,
    /// Total probe reads that failed and emitted the unavailable sentinel.
    pub sampling_errors: AtomicUsize,
    /// Total samples evicted from a full buffer, oldest first.
    pub evictions: AtomicUsize,
    /// Total batches acknowledged by the collector.
    pub delivered_batches: AtomicUsize,
    /// Total samples acknowledged by the collector.
    pub delivered_samples: AtomicUsize,
    /// Total transient delivery failures observed, across all attempts.
    pub transient_failures: AtomicUsize,
    /// Total batches dropped, whether by retry exhaustion, permanent
    /// rejection or shutdown abandonment.
    pub dropped_batches: AtomicUsize,
    /// Total samples lost inside dropped batches.
    pub dropped_samples: AtomicUsize,
    /// Total supervised unit restarts.
    pub restarts: AtomicUsize,
}

impl Report {
    /// Create a zeroed Report.
    pub fn new() -> Report {
        Report::default()
    }

    /// The current counters as `devmon.*` self-telemetry Samples.
    ///
    /// The sampler appends these to each tick so the agent's own health
    /// rides the same pipe as the host metrics it reports on.
    pub fn snapshot(&self) -> Vec<Sample> {
        let read = |c: &AtomicUsize| c.load(Ordering::Relaxed) as f64;
        vec![
            Sample::new("devmon.samples", read(&self.samples), Unit::Count),
            Sample::new(
                "devmon.sampling_errors",
                read(&self.sampling_errors),
                Unit::Count,
            ),
            Sample::new("devmon.evictions", read(&self.evictions), Unit::Count),
            Sample::new(
                "devmon.delivered_batches",
                read(&self.delivered_batches),
                Unit::Count,
            ),
            Sample::new(
                "devmon.delivered_samples",
                read(&self.delivered_samples),
                Unit::Count,
            ),
            Sample::new(
                "devmon.transient_failures",
                read(&self.transient_failures),
                Unit::Count,
            ),
            Sample::new(
                "devmon.dropped_batches",
                read(&self.dropped_batches),
                Unit::Count,
            ),
            Sample::new(
                "devmon.dropped_samples",
                read(&self.dropped_samples),
                Unit::Count,
            ),
            Sample::new("devmon.restarts", read(&self.restarts), Unit::Count),
        ]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn snapshot_reflects_counts() {
        let report = Report::new();
        report.evictions.fetch_add(3, Ordering::Relaxed);
        report.dropped_batches.fetch_add(1, Ordering::Relaxed);

        let snap = report.snapshot();
        let find = |name: &str| {
            snap.iter()
                .find(|s| s.name == name)
                .map(|s| s.value)
                .unwrap()
        };
        assert_eq!(find("devmon.evictions"), 3.0);
        assert_eq!(find("devmon.dropped_batches"), 1.0);
        assert_eq!(find("devmon.restarts"), 0.0);
    }
}
