//! Batch delivery with retry, backoff and at-most-once drop
//!
//! The forwarder drains the buffer, packs samples into bounded batches and
//! transmits them to the collector. Delivery is at-most-once: a batch that
//! exhausts its retry budget, is rejected outright or is abandoned at
//! shutdown is dropped and counted, never re-queued. Bounded memory beats
//! guaranteed delivery on the hardware this agent targets.
//!
//! The retry loop is a tagged-variant state machine -- Idle, Sending,
//! Backoff -- driven here and inspectable by tests through a fake
//! `Transport`.

use buffer::Buffer;
use constants;
use hyper;
use hyper::header::ContentType;
use hyper::net::{HttpStream, NetworkConnector};
use hyper::status::StatusClass;
use metric::{self, Batch};
use mio;
use report::Report;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use time;
use url::Url;

/// Why a transmission did not succeed.
#[derive(Debug, PartialEq)]
pub enum DeliveryError {
    /// The collector could not be reached or answered with a server-side
    /// failure. Retried under the backoff policy.
    Transient(String),
    /// The collector rejected the batch itself. Dropped immediately; a
    /// malformed batch will be malformed on every retry.
    Permanent(String),
}

/// Where the forwarder is in its delivery cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeliveryState {
    /// Nothing in flight.
    Idle,
    /// A transmit attempt is underway.
    Sending,
    /// Waiting out a delay before retrying a failed batch.
    Backoff {
        /// Failed attempts so far for the in-flight batch.
        attempt: u32,
        /// The deterministic delay being waited out, pre-jitter.
        delay: Duration,
    },
}

/// A way of getting a Batch to the collector.
///
/// The production implementation is `HttpTransport`; tests inject scripted
/// fakes to drive the state machine without a network.
pub trait Transport {
    /// Attempt one transmission of `batch`.
    fn transmit(&mut self, batch: &Batch) -> Result<(), DeliveryError>;
}

/// Configuration for the forwarder.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderConfig {
    /// The collector URL batches are POSTed to. `http` only.
    pub endpoint: String,
    /// Transmissions attempted per batch before it is dropped.
    pub max_attempts: u32,
    /// First retry delay, milliseconds.
    pub base_delay_ms: u64,
    /// Retry delay ceiling, milliseconds.
    pub max_delay_ms: u64,
    /// Most samples drained per cycle and allowed in one batch.
    pub batch_size: usize,
    /// Byte bound on one batch's wire encoding.
    pub max_batch_bytes: usize,
    /// Bound on connect, read and write time for one transmission,
    /// milliseconds.
    pub transmit_timeout_ms: u64,
    /// Idle wait between drain cycles, milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> ForwarderConfig {
        ForwarderConfig {
            endpoint: "http://127.0.0.1:8000/v1/samples".to_string(),
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            batch_size: 512,
            max_batch_bytes: 262_144,
            transmit_timeout_ms: 10_000,
            poll_interval_ms: 500,
        }
    }
}

enum Wait {
    Elapsed,
    Shutdown,
}

/// The forwarding unit.
pub struct Forwarder<T: Transport> {
    buffer: Arc<Buffer>,
    transport: T,
    config: ForwarderConfig,
    report: Arc<Report>,
    state: DeliveryState,
}

impl<T: Transport> Forwarder<T> {
    /// Create a new Forwarder draining `buffer` through `transport`.
    pub fn new(
        buffer: Arc<Buffer>,
        transport: T,
        config: ForwarderConfig,
        report: Arc<Report>,
    ) -> Forwarder<T> {
        Forwarder {
            buffer: buffer,
            transport: transport,
            config: config,
            report: report,
            state: DeliveryState::Idle,
        }
    }

    /// The current delivery state.
    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Drain and deliver until shutdown.
    ///
    /// Waits are poll timeouts so the supervisor can cancel a backoff or an
    /// idle period through the SYSTEM token. On shutdown whatever remains
    /// buffered gets one last single-attempt flush; an in-flight batch
    /// already waiting out a backoff is abandoned instead.
    pub fn run(&mut self, poll: mio::Poll) {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            if let Wait::Shutdown = self.pause(&poll, interval) {
                break;
            }
            if let Wait::Shutdown = self.cycle(&poll) {
                break;
            }
        }
        self.flush_remaining();
    }

    /// One drain-and-deliver pass over everything currently buffered.
    fn cycle(&mut self, poll: &mio::Poll) -> Wait {
        loop {
            let samples = self.buffer.drain(self.config.batch_size);
            if samples.is_empty() {
                return Wait::Elapsed;
            }
            let batches =
                metric::pack(samples, self.config.batch_size, self.config.max_batch_bytes);
            for batch in batches {
                if let Wait::Shutdown = self.deliver(batch, poll) {
                    return Wait::Shutdown;
                }
            }
        }
    }

    /// Push one batch through the Idle/Sending/Backoff machine.
    fn deliver(&mut self, batch: Batch, poll: &mio::Poll) -> Wait {
        let mut attempt: u32 = 0;
        self.state = DeliveryState::Sending;
        loop {
            attempt += 1;
            match self.transport.transmit(&batch) {
                Ok(()) => {
                    debug!(
                        "delivered batch of {} samples on attempt {}",
                        batch.len(),
                        attempt
                    );
                    self.report.delivered_batches.fetch_add(1, Ordering::Relaxed);
                    self.report
                        .delivered_samples
                        .fetch_add(batch.len(), Ordering::Relaxed);
                    self.state = DeliveryState::Idle;
                    return Wait::Elapsed;
                }
                Err(DeliveryError::Permanent(reason)) => {
                    error!("collector rejected batch, dropping: {}", reason);
                    self.drop_batch(&batch);
                    return Wait::Elapsed;
                }
                Err(DeliveryError::Transient(reason)) => {
                    self.report
                        .transient_failures
                        .fetch_add(1, Ordering::Relaxed);
                    if attempt >= self.config.max_attempts {
                        error!(
                            "dropping batch of {} samples after {} attempts: {}",
                            batch.len(),
                            attempt,
                            reason
                        );
                        self.drop_batch(&batch);
                        return Wait::Elapsed;
                    }
                    let delay = time::backoff(
                        attempt,
                        Duration::from_millis(self.config.base_delay_ms),
                        Duration::from_millis(self.config.max_delay_ms),
                    );
                    debug!(
                        "transmit attempt {} failed ({}), retrying in {:?}",
                        attempt, reason, delay
                    );
                    self.state = DeliveryState::Backoff {
                        attempt: attempt,
                        delay: delay,
                    };
                    if let Wait::Shutdown = self.pause(poll, time::jitter(delay)) {
                        warn!(
                            "abandoning in-flight batch of {} samples at shutdown",
                            batch.len()
                        );
                        self.drop_batch(&batch);
                        return Wait::Shutdown;
                    }
                    self.state = DeliveryState::Sending;
                }
            }
        }
    }

    fn drop_batch(&mut self, batch: &Batch) {
        self.report.dropped_batches.fetch_add(1, Ordering::Relaxed);
        self.report
            .dropped_samples
            .fetch_add(batch.len(), Ordering::Relaxed);
        self.state = DeliveryState::Idle;
    }

    /// Grace flush at shutdown: one attempt per remaining batch, no
    /// retries.
    fn flush_remaining(&mut self) {
        loop {
            let samples = self.buffer.drain(self.config.batch_size);
            if samples.is_empty() {
                return;
            }
            let batches =
                metric::pack(samples, self.config.batch_size, self.config.max_batch_bytes);
            for batch in batches {
                match self.transport.transmit(&batch) {
                    Ok(()) => {
                        self.report.delivered_batches.fetch_add(1, Ordering::Relaxed);
                        self.report
                            .delivered_samples
                            .fetch_add(batch.len(), Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!("batch lost in shutdown flush: {:?}", e);
                        self.drop_batch(&batch);
                    }
                }
            }
        }
    }

    /// Wait out `dur` or return early on the SYSTEM token.
    fn pause(&self, poll: &mio::Poll, dur: Duration) -> Wait {
        let mut events = mio::Events::with_capacity(1024);
        match poll.poll(&mut events, Some(dur)) {
            Ok(_) => {
                for event in &events {
                    if event.token() == constants::SYSTEM {
                        return Wait::Shutdown;
                    }
                }
                Wait::Elapsed
            }
            Err(e) => panic!("Failed during poll {:?}", e),
        }
    }
}

/// Resolves the collector and connects each candidate address under a
/// deadline.
struct TimedConnector {
    timeout: Duration,
}

impl NetworkConnector for TimedConnector {
    type Stream = HttpStream;

    fn connect(&self, host: &str, port: u16, scheme: &str) -> hyper::Result<HttpStream> {
        if scheme != "http" {
            return Err(hyper::Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "only http endpoints are supported",
            )));
        }
        let addrs = (host, port).to_socket_addrs()?;
        let mut last = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(HttpStream(stream)),
                Err(e) => {
                    info!(
                        "Unable to connect to collector at {} using addr {} with error {}",
                        host, addr, e
                    );
                    last = Some(e);
                }
            }
        }
        Err(hyper::Error::Io(last.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
        })))
    }
}

/// The production Transport: JSON batches POSTed over HTTP.
pub struct HttpTransport {
    client: hyper::Client,
    endpoint: String,
}

impl HttpTransport {
    /// Create an HttpTransport for the configured endpoint.
    ///
    /// Validates the endpoint URL up front so a typo fails the boot, not
    /// the first delivery.
    pub fn new(config: &ForwarderConfig) -> Result<HttpTransport, String> {
        let url = Url::parse(&config.endpoint)
            .map_err(|e| format!("invalid endpoint {}: {}", config.endpoint, e))?;
        if url.scheme() != "http" {
            return Err(format!(
                "endpoint {} must use the http scheme",
                config.endpoint
            ));
        }
        if url.host_str().is_none() {
            return Err(format!("endpoint {} has no host", config.endpoint));
        }
        let timeout = Duration::from_millis(config.transmit_timeout_ms);
        let mut client = hyper::Client::with_connector(TimedConnector { timeout: timeout });
        client.set_read_timeout(Some(timeout));
        client.set_write_timeout(Some(timeout));
        Ok(HttpTransport {
            client: client,
            endpoint: config.endpoint.clone(),
        })
    }
}

impl Transport for HttpTransport {
    fn transmit(&mut self, batch: &Batch) -> Result<(), DeliveryError> {
        let body = batch.json();
        let res = self.client
            .post(self.endpoint.as_str())
            .header(ContentType::json())
            .body(body.as_str())
            .send();
        match res {
            Ok(resp) => match resp.status.class() {
                StatusClass::Success => Ok(()),
                StatusClass::ClientError => Err(DeliveryError::Permanent(format!(
                    "collector answered {}",
                    resp.status
                ))),
                _ => Err(DeliveryError::Transient(format!(
                    "collector answered {}",
                    resp.status
                ))),
            },
            Err(e) => Err(DeliveryError::Transient(format!("{}", e))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use buffer::Buffer;
    use metric::{Sample, Unit};
    use report::Report;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    /// A Transport that answers from a script and records what it saw.
    struct FakeTransport {
        script: Vec<Result<(), DeliveryError>>,
        calls: usize,
        delivered: Vec<String>,
    }

    impl FakeTransport {
        fn new(script: Vec<Result<(), DeliveryError>>) -> FakeTransport {
            FakeTransport {
                script: script,
                calls: 0,
                delivered: Vec::new(),
            }
        }
    }

    impl Transport for FakeTransport {
        fn transmit(&mut self, batch: &Batch) -> Result<(), DeliveryError> {
            let idx = self.calls;
            self.calls += 1;
            match self.script.get(idx) {
                Some(&Ok(())) => {
                    self.delivered.push(batch.json());
                    Ok(())
                }
                Some(&Err(ref e)) => Err(clone_err(e)),
                None => Ok(()),
            }
        }
    }

    fn clone_err(e: &DeliveryError) -> DeliveryError {
        match *e {
            DeliveryError::Transient(ref s) => DeliveryError::Transient(s.clone()),
            DeliveryError::Permanent(ref s) => DeliveryError::Permanent(s.clone()),
        }
    }

    fn transient() -> Result<(), DeliveryError> {
        Err(DeliveryError::Transient("connection refused".to_string()))
    }

    fn forwarder(
        script: Vec<Result<(), DeliveryError>>,
        config: ForwarderConfig,
    ) -> (Forwarder<FakeTransport>, Arc<Buffer>, Arc<Report>) {
        let report = Arc::new(Report::new());
        let buffer = Arc::new(Buffer::new(1_024, Arc::clone(&report)));
        let fwd = Forwarder::new(
            Arc::clone(&buffer),
            FakeTransport::new(script),
            config,
            Arc::clone(&report),
        );
        (fwd, buffer, report)
    }

    fn quick_config() -> ForwarderConfig {
        let mut config = ForwarderConfig::default();
        config.base_delay_ms = 10;
        config.max_delay_ms = 100;
        config
    }

    fn push_some(buffer: &Buffer, n: usize) {
        for i in 0..n {
            buffer.push(Sample::new("test.metric", i as f64, Unit::Count));
        }
    }

    #[test]
    fn delivers_on_first_attempt() {
        let (mut fwd, buffer, report) = forwarder(vec![Ok(())], quick_config());
        push_some(&buffer, 3);

        let poll = mio::Poll::new().unwrap();
        fwd.cycle(&poll);

        assert_eq!(fwd.transport.calls, 1);
        assert_eq!(fwd.state(), DeliveryState::Idle);
        assert_eq!(report.delivered_batches.load(Ordering::Relaxed), 1);
        assert_eq!(report.delivered_samples.load(Ordering::Relaxed), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn retries_through_transient_failures() {
        // fails twice, succeeds on the third attempt
        let (mut fwd, buffer, report) = forwarder(
            vec![transient(), transient(), Ok(())],
            quick_config(),
        );
        push_some(&buffer, 2);

        let poll = mio::Poll::new().unwrap();
        let start = Instant::now();
        fwd.cycle(&poll);

        assert_eq!(fwd.transport.calls, 3);
        assert_eq!(fwd.state(), DeliveryState::Idle);
        assert_eq!(report.delivered_batches.load(Ordering::Relaxed), 1);
        assert_eq!(report.transient_failures.load(Ordering::Relaxed), 2);
        assert_eq!(report.dropped_batches.load(Ordering::Relaxed), 0);
        // backoff waits of at least base + 2*base must have elapsed
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn drops_batch_after_max_attempts() {
        let script = vec![
            transient(),
            transient(),
            transient(),
            transient(),
            transient(),
        ];
        let (mut fwd, buffer, report) = forwarder(script, quick_config());
        push_some(&buffer, 4);

        let poll = mio::Poll::new().unwrap();
        fwd.cycle(&poll);

        assert_eq!(fwd.transport.calls, 5);
        assert_eq!(fwd.state(), DeliveryState::Idle);
        assert_eq!(report.dropped_batches.load(Ordering::Relaxed), 1);
        assert_eq!(report.dropped_samples.load(Ordering::Relaxed), 4);
        assert_eq!(report.delivered_batches.load(Ordering::Relaxed), 0);
        // dropped, not re-queued
        assert!(buffer.is_empty());
    }

    #[test]
    fn permanent_rejection_drops_without_retry() {
        let script = vec![
            Err(DeliveryError::Permanent("400 Bad Request".to_string())),
        ];
        let (mut fwd, buffer, report) = forwarder(script, quick_config());
        push_some(&buffer, 2);

        let poll = mio::Poll::new().unwrap();
        fwd.cycle(&poll);

        assert_eq!(fwd.transport.calls, 1);
        assert_eq!(fwd.state(), DeliveryState::Idle);
        assert_eq!(report.dropped_batches.load(Ordering::Relaxed), 1);
        assert_eq!(report.transient_failures.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn large_drains_split_into_bounded_batches() {
        let mut config = quick_config();
        config.batch_size = 4;
        let (mut fwd, buffer, report) = forwarder(Vec::new(), config);
        push_some(&buffer, 10);

        let poll = mio::Poll::new().unwrap();
        fwd.cycle(&poll);

        // 10 samples at 4 per batch: 4 + 4 + 2
        assert_eq!(fwd.transport.calls, 3);
        assert_eq!(report.delivered_samples.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn shutdown_during_backoff_abandons_the_batch() {
        let mut config = quick_config();
        config.base_delay_ms = 60_000;
        config.max_delay_ms = 60_000;
        let (mut fwd, buffer, report) = forwarder(vec![transient()], config);
        push_some(&buffer, 1);

        let poll = mio::Poll::new().unwrap();
        let (registration, readiness) = mio::Registration::new2();
        poll.register(
            &registration,
            ::constants::SYSTEM,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        ).unwrap();
        readiness.set_readiness(mio::Ready::readable()).unwrap();

        let start = Instant::now();
        if let Wait::Elapsed = fwd.cycle(&poll) {
            panic!("expected shutdown to interrupt the backoff wait");
        }

        // returned well before the 60s backoff
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(report.dropped_batches.load(Ordering::Relaxed), 1);
        assert_eq!(fwd.state(), DeliveryState::Idle);
    }

    #[test]
    fn flush_remaining_makes_single_attempts() {
        let (mut fwd, buffer, report) =
            forwarder(vec![transient(), Ok(())], quick_config());
        push_some(&buffer, 1);
        fwd.flush_remaining();
        // the one transient failure drops the batch; no retries at shutdown
        assert_eq!(fwd.transport.calls, 1);
        assert_eq!(report.dropped_batches.load(Ordering::Relaxed), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn http_transport_rejects_bad_endpoints() {
        let mut config = ForwarderConfig::default();
        config.endpoint = "https://collector.example.com/v1/samples".to_string();
        assert!(HttpTransport::new(&config).is_err());

        config.endpoint = "not a url at all".to_string();
        assert!(HttpTransport::new(&config).is_err());

        config.endpoint = "http://collector.example.com/v1/samples".to_string();
        assert!(HttpTransport::new(&config).is_ok());
    }
}
