#![allow(unknown_lints)]

extern crate chan_signal;
extern crate chrono;
extern crate devmon;
extern crate fern;

#[macro_use]
extern crate log;

use chrono::Utc;
use devmon::buffer::Buffer;
use devmon::forwarder::{Forwarder, HttpTransport};
use devmon::report::Report;
use devmon::sampler::Sampler;
use devmon::supervisor::Supervisor;
use devmon::{config, time};
use std::process;
use std::sync::Arc;
use std::thread;

fn main() {
    let args = config::parse_args();

    let level = match args.verbose {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    // signal registration must happen before any threads are spawned
    let signal =
        chan_signal::notify(&[chan_signal::Signal::INT, chan_signal::Signal::TERM]);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                record.target(),
                Utc::now().to_rfc3339(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply()
        .expect("could not set up logging");

    info!("devmon - {}", args.version);

    let report = Arc::new(Report::new());
    let buffer = Arc::new(Buffer::new(args.buffer_capacity, Arc::clone(&report)));

    let mut supervisor = Supervisor::new();

    {
        let buffer = Arc::clone(&buffer);
        let report = Arc::clone(&report);
        let config = args.sampler.clone();
        supervisor.spawn(
            "sampler",
            &args.supervisor,
            Arc::clone(&report),
            move |poll| {
                Sampler::new(Arc::clone(&buffer), Arc::clone(&report), config.clone())
                    .run(poll);
            },
        );
    }

    {
        let buffer = Arc::clone(&buffer);
        let report = Arc::clone(&report);
        let config = args.forwarder.clone();
        supervisor.spawn(
            "forwarder",
            &args.supervisor,
            Arc::clone(&report),
            move |poll| match HttpTransport::new(&config) {
                Ok(transport) => {
                    Forwarder::new(
                        Arc::clone(&buffer),
                        transport,
                        config.clone(),
                        Arc::clone(&report),
                    ).run(poll);
                }
                Err(e) => {
                    error!("Configuration error for forwarder: {}", e);
                    process::exit(1);
                }
            },
        );
    }

    thread::spawn(move || {
        time::update_time();
    });

    signal.recv().unwrap();
    info!("shutdown signal received");
    supervisor.shutdown();
}
