//! Sample and batch types, plus their wire encoding
//!
//! A `Sample` is one timestamped metric reading. Samples are immutable once
//! built: the sampler creates them, the buffer holds them, the forwarder
//! groups them into `Batch`es and ships them. A batch is bounded both by
//! sample count and by the byte size of its wire encoding.

use serde_json::Value;
use std::f64;
use time;

/// The measurement unit a `Sample` carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unit {
    /// A percentage, 0.0 to 100.0.
    Percent,
    /// Degrees Celsius.
    Celsius,
    /// Gigabytes, base 1024.
    Gigabytes,
    /// Megahertz.
    Megahertz,
    /// A unit-interval state flag, 1.0 active / 0.0 inactive.
    State,
    /// A monotonic count of events.
    Count,
}

impl Unit {
    /// The wire name of the unit.
    pub fn name(&self) -> &'static str {
        match *self {
            Unit::Percent => "percent",
            Unit::Celsius => "celsius",
            Unit::Gigabytes => "gigabytes",
            Unit::Megahertz => "megahertz",
            Unit::State => "state",
            Unit::Count => "count",
        }
    }
}

/// One timestamped metric reading.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// The metric name, dotted lower-case.
    pub name: String,
    /// The reading. `f64::NAN` is the designated unavailable sentinel; see
    /// `Sample::unavailable`.
    pub value: f64,
    /// The unit of `value`.
    pub unit: Unit,
    /// Wall-clock stamp, seconds since the epoch.
    pub time: i64,
    /// Monotonic stamp, nanoseconds since process start. Survives wall
    /// clock steps, which small boards without RTCs are prone to at boot.
    pub uptime_ns: u64,
}

impl Sample {
    /// Create a new Sample stamped with the current clocks.
    pub fn new<S>(name: S, value: f64, unit: Unit) -> Sample
    where
        S: Into<String>,
    {
        Sample {
            name: name.into(),
            value: value,
            unit: unit,
            time: time::now(),
            uptime_ns: time::uptime_ns(),
        }
    }

    /// Create a Sample whose reading could not be taken.
    ///
    /// The sentinel is NAN in memory and `null` on the wire. A failed probe
    /// emits this rather than failing the whole tick.
    pub fn unavailable<S>(name: S, unit: Unit) -> Sample
    where
        S: Into<String>,
    {
        Sample::new(name, f64::NAN, unit)
    }

    /// True if this Sample carries the unavailable sentinel.
    pub fn is_unavailable(&self) -> bool {
        self.value.is_nan()
    }

    /// Overwrite the wall-clock stamp.
    pub fn timestamp(mut self, time: i64) -> Sample {
        self.time = time;
        self
    }

    /// The wire encoding of this Sample.
    ///
    /// `Value::from` maps non-finite floats to `null`, which is exactly the
    /// treatment the unavailable sentinel wants.
    pub fn json(&self) -> Value {
        json!({
            "timestamp": self.time,
            "metric": self.name,
            "value": Value::from(self.value),
            "unit": self.unit.name(),
        })
    }

    /// Length in bytes of this Sample's wire encoding.
    pub fn encoded_sz(&self) -> usize {
        self.json().to_string().len()
    }
}

/// A bounded, ordered group of Samples sent in one transmission.
#[derive(Debug)]
pub struct Batch {
    samples: Vec<Sample>,
    bytes: usize,
    max_samples: usize,
    max_bytes: usize,
}

impl Batch {
    /// Create an empty Batch with the given bounds. `max_samples` must be
    /// at least 1.
    pub fn new(max_samples: usize, max_bytes: usize) -> Batch {
        assert!(max_samples > 0);
        // pre-allocation only; an absurd max_samples must not pre-allocate
        // an absurd vector
        let cap = ::std::cmp::min(max_samples, 1_024);
        Batch {
            samples: Vec::with_capacity(cap),
            bytes: 0,
            max_samples: max_samples,
            max_bytes: max_bytes,
        }
    }

    /// Add a Sample, or hand it back if the Batch is full.
    ///
    /// A batch is full once it holds `max_samples` or once the next sample
    /// would push its encoded size past `max_bytes`. A sample whose own
    /// encoding exceeds `max_bytes` is still accepted into an empty batch --
    /// it cannot be subdivided and silently dropping it would be worse.
    pub fn push(&mut self, sample: Sample) -> Option<Sample> {
        if self.samples.len() >= self.max_samples {
            return Some(sample);
        }
        let sz = sample.encoded_sz();
        if !self.samples.is_empty() && (self.bytes + sz) > self.max_bytes {
            return Some(sample);
        }
        self.bytes += sz;
        self.samples.push(sample);
        None
    }

    /// Number of Samples held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True if no Samples are held.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Accumulated wire size of the held Samples, in bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// The wire encoding: a JSON array of Sample records.
    pub fn json(&self) -> String {
        let records: Vec<Value> = self.samples.iter().map(|s| s.json()).collect();
        Value::Array(records).to_string()
    }

    /// Borrow the held Samples, oldest first.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

/// Greedily split `samples` into Batches that respect both bounds.
///
/// Order is preserved: concatenating the returned batches yields the input
/// sequence.
pub fn pack(samples: Vec<Sample>, max_samples: usize, max_bytes: usize) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut batch = Batch::new(max_samples, max_bytes);
    for sample in samples {
        if let Some(rejected) = batch.push(sample) {
            batches.push(batch);
            batch = Batch::new(max_samples, max_bytes);
            let overflow = batch.push(rejected);
            assert!(overflow.is_none());
        }
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}
