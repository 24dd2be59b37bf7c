//! Unit lifecycle management
//!
//! The supervisor owns the sampling and forwarding units for the life of
//! the process. Each unit runs on its own thread with a mio poll whose
//! SYSTEM token carries the shutdown signal. A unit that panics is
//! restarted -- with its own pacing delay -- up to a configured budget;
//! past the budget the process exits non-zero, on the theory that a unit
//! crashing that often has something wrong an operator must see.
//!
//! Ordinary retryable failures never reach the supervisor: the forwarder
//! absorbs those into its backoff policy. Only a panic counts as a crash.

use constants;
use mio;
use report::Report;
use std::process;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use time;

/// Configuration for supervision.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Restarts allowed per unit before the process exits non-zero.
    pub max_restarts: usize,
}

impl Default for SupervisorConfig {
    fn default() -> SupervisorConfig {
        SupervisorConfig { max_restarts: 3 }
    }
}

struct Unit {
    name: &'static str,
    monitor: thread::JoinHandle<()>,
    // refreshed by the monitor on every (re)spawn so shutdown always
    // signals the live incarnation
    readiness: Arc<Mutex<Option<mio::SetReadiness>>>,
}

/// Owner of the running units.
pub struct Supervisor {
    units: Vec<Unit>,
    shutting_down: Arc<AtomicBool>,
}

impl Supervisor {
    /// Create a Supervisor with no units.
    pub fn new() -> Supervisor {
        Supervisor {
            units: Vec::new(),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn `unit` on its own thread under restart supervision.
    ///
    /// The unit body must be re-invokable: it is called again, with a fresh
    /// poll, after every crash inside the budget. A clean return is final
    /// and ends supervision of the unit.
    pub fn spawn<F>(
        &mut self,
        name: &'static str,
        config: &SupervisorConfig,
        report: Arc<Report>,
        unit: F,
    ) where
        F: Fn(mio::Poll) + Send + Sync + 'static,
    {
        let readiness = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&readiness);
        let shutting_down = Arc::clone(&self.shutting_down);
        let max_restarts = config.max_restarts;
        let unit = Arc::new(unit);

        let monitor = thread::spawn(move || {
            let mut restarts: usize = 0;
            loop {
                let poller = mio::Poll::new().expect("could not create poll");
                let (registration, set_readiness) = mio::Registration::new2();
                *slot.lock().expect("readiness slot poisoned") = Some(set_readiness);

                let body = Arc::clone(&unit);
                let handle = thread::spawn(move || {
                    poller
                        .register(
                            &registration,
                            constants::SYSTEM,
                            mio::Ready::readable(),
                            mio::PollOpt::edge(),
                        )
                        .expect("Failed to register system pipe");
                    body(poller);
                });

                match handle.join() {
                    Ok(()) => {
                        debug!("{} exited cleanly", name);
                        break;
                    }
                    Err(_) => {
                        if shutting_down.load(Ordering::SeqCst) {
                            break;
                        }
                        restarts += 1;
                        report.restarts.fetch_add(1, Ordering::Relaxed);
                        if restarts > max_restarts {
                            error!(
                                "{} exceeded its restart budget of {}, exiting",
                                name, max_restarts
                            );
                            process::exit(1);
                        }
                        warn!(
                            "{} crashed, restarting ({} of {} allowed)",
                            name, restarts, max_restarts
                        );
                        time::delay(restarts as u32);
                    }
                }
            }
        });

        self.units.push(Unit {
            name: name,
            monitor: monitor,
            readiness: readiness,
        });
    }

    /// Signal every unit to stop and wait for them to finish.
    pub fn shutdown(self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        for unit in self.units {
            info!("Signaling shutdown to {}", unit.name);
            if let Some(readiness) = unit.readiness
                .lock()
                .expect("readiness slot poisoned")
                .take()
            {
                readiness
                    .set_readiness(mio::Ready::readable())
                    .expect("Failed to notify unit of shutdown");
            }
            unit.monitor.join().expect("Failed during join");
        }
    }

    /// Wait for every unit to finish without signaling them. Used when the
    /// units are expected to run to completion on their own.
    pub fn join(self) {
        for unit in self.units {
            unit.monitor.join().expect("Failed during join");
        }
    }
}

impl Default for Supervisor {
    fn default() -> Supervisor {
        Supervisor::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use report::Report;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn restarts_a_crashing_unit_within_budget() {
        let report = Arc::new(Report::new());
        let mut supervisor = Supervisor::new();
        let config = SupervisorConfig { max_restarts: 3 };

        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invocations);
        supervisor.spawn("crashy", &config, Arc::clone(&report), move |_poll| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            // panic twice, then settle down
            if n < 2 {
                panic!("synthetic crash {}", n);
            }
        });

        supervisor.join();
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        assert_eq!(report.restarts.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn clean_exit_is_not_restarted() {
        let report = Arc::new(Report::new());
        let mut supervisor = Supervisor::new();
        let config = SupervisorConfig::default();

        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invocations);
        supervisor.spawn("calm", &config, Arc::clone(&report), move |_poll| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        supervisor.join();
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(report.restarts.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn shutdown_reaches_a_polling_unit() {
        let report = Arc::new(Report::new());
        let mut supervisor = Supervisor::new();
        let config = SupervisorConfig::default();

        supervisor.spawn("waiter", &config, report, move |poll| loop {
            let mut events = mio::Events::with_capacity(64);
            poll.poll(&mut events, None).expect("poll failed");
            for event in &events {
                if event.token() == ::constants::SYSTEM {
                    return;
                }
            }
        });

        // give the unit a beat to reach its poll, then stop it
        ::std::thread::sleep(::std::time::Duration::from_millis(50));
        supervisor.shutdown();
    }
}
