//! Bounded in-memory sample queue
//!
//! The buffer sits between the sampler and the forwarder: one writer, one
//! reader, fixed capacity chosen at boot. When the collector is unreachable
//! the buffer fills; once full, the oldest sample is evicted to admit the
//! newest. Bounded memory is the contract -- an agent on a small board must
//! never trade RAM for delivery guarantees.
//!
//! Samples are handed to the forwarder exactly once: a sample returned by
//! `drain` is gone from the buffer and will not be seen by a later `drain`.

use metric::Sample;
use report::Report;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::sync::atomic::Ordering;

/// A bounded FIFO of Samples pending delivery.
pub struct Buffer {
    inner: Mutex<Inner>,
    capacity: usize,
    report: Arc<Report>,
}

struct Inner {
    queue: VecDeque<Sample>,
    // monotonically increasing push count, used to tag evictions in trace
    // output
    next_seq: u64,
}

impl Buffer {
    /// Create a Buffer holding at most `capacity` samples. `capacity` must
    /// be at least 1.
    pub fn new(capacity: usize, report: Arc<Report>) -> Buffer {
        assert!(capacity > 0);
        Buffer {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                next_seq: 0,
            }),
            capacity: capacity,
            report: report,
        }
    }

    /// Append a Sample, evicting the oldest if the Buffer is full.
    ///
    /// O(1), never blocks beyond the mutex. Evictions are counted in the
    /// shared `Report`.
    pub fn push(&self, sample: Sample) {
        let mut inner = self.lock();
        if inner.queue.len() >= self.capacity {
            let oldest_seq = inner.next_seq.wrapping_sub(inner.queue.len() as u64);
            if let Some(evicted) = inner.queue.pop_front() {
                self.report.evictions.fetch_add(1, Ordering::Relaxed);
                trace!(
                    "evicted {} (seq {}) to admit seq {}",
                    evicted.name,
                    oldest_seq,
                    inner.next_seq
                );
            }
        }
        inner.queue.push_back(sample);
        inner.next_seq = inner.next_seq.wrapping_add(1);
    }

    /// Remove and return up to `max` of the oldest Samples.
    ///
    /// Atomic with respect to `push`: a concurrent push lands either before
    /// or after the whole drain. No sample is ever returned twice.
    pub fn drain(&self, max: usize) -> Vec<Sample> {
        let mut inner = self.lock();
        let n = ::std::cmp::min(max, inner.queue.len());
        inner.queue.drain(..n).collect()
    }

    /// Number of Samples currently held.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// True if no Samples are held.
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// The fixed capacity chosen at construction.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> ::std::sync::MutexGuard<Inner> {
        // A unit that panics mid-push is restarted by the supervisor; its
        // poisoned lock must not wedge the peer unit. The deque itself is
        // never left half-mutated by the operations above.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use metric::{Sample, Unit};
    use quickcheck::{QuickCheck, TestResult};
    use report::Report;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    fn sample(value: f64) -> Sample {
        Sample::new("test.metric", value, Unit::Count)
    }

    fn values(samples: &[Sample]) -> Vec<u64> {
        samples.iter().map(|s| s.value as u64).collect()
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let report = Arc::new(Report::new());
        let buffer = Buffer::new(3, Arc::clone(&report));
        for v in &[1.0, 2.0, 3.0, 4.0] {
            buffer.push(sample(*v));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(report.evictions.load(Ordering::Relaxed), 1);

        let drained = buffer.drain(2);
        assert_eq!(values(&drained), vec![2, 3]);
        assert_eq!(buffer.len(), 1);

        let rest = buffer.drain(10);
        assert_eq!(values(&rest), vec![4]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_of_empty_buffer_is_empty() {
        let buffer = Buffer::new(4, Arc::new(Report::new()));
        assert!(buffer.drain(16).is_empty());
    }

    #[test]
    fn retains_most_recent_at_capacity() {
        fn inner(capacity: usize, total: usize) -> TestResult {
            if capacity == 0 || capacity > 1_024 || total > 4_096 {
                return TestResult::discard();
            }
            let report = Arc::new(Report::new());
            let buffer = Buffer::new(capacity, Arc::clone(&report));
            for v in 0..total {
                buffer.push(sample(v as f64));
            }

            let expected_len = ::std::cmp::min(capacity, total);
            let drained = buffer.drain(total + 1);
            if drained.len() != expected_len {
                return TestResult::failed();
            }
            // the survivors are exactly the most recent pushes, in insertion
            // order
            let expected: Vec<u64> =
                ((total - expected_len)..total).map(|v| v as u64).collect();
            if values(&drained) != expected {
                return TestResult::failed();
            }
            let evicted = total - expected_len;
            if report.evictions.load(Ordering::Relaxed) != evicted {
                return TestResult::failed();
            }
            TestResult::passed()
        }
        QuickCheck::new().quickcheck(inner as fn(usize, usize) -> TestResult);
    }

    #[test]
    fn no_sample_is_drained_twice() {
        fn inner(total: usize, drains: Vec<usize>) -> TestResult {
            if total > 2_048 {
                return TestResult::discard();
            }
            let buffer = Buffer::new(4_096, Arc::new(Report::new()));
            for v in 0..total {
                buffer.push(sample(v as f64));
            }

            let mut seen: Vec<u64> = Vec::new();
            for d in drains {
                seen.extend(values(&buffer.drain(d % 128)));
            }
            seen.extend(values(&buffer.drain(total + 1)));

            // every sample exactly once, in order
            let expected: Vec<u64> = (0..total).map(|v| v as u64).collect();
            if seen != expected {
                return TestResult::failed();
            }
            TestResult::passed()
        }
        QuickCheck::new().quickcheck(inner as fn(usize, Vec<usize>) -> TestResult);
    }
}
