//! Provides the CLI option parser
//!
//! Used to parse the argv/config file into a struct that
//! the agent can consume and use as configuration data.

use clap::{App, Arg};
use forwarder::ForwarderConfig;
use sampler::SamplerConfig;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use supervisor::SupervisorConfig;
use toml;

const VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

fn default_version() -> String {
    VERSION.unwrap_or("unknown").to_string()
}

/// Big configuration struct for the devmon executable
///
/// This struct is what we construct from parsing the devmon configuration.
/// It is not intended to be created by external clients. Please see
/// documentation on `parse_args` in this module for more details.
#[derive(Debug)]
pub struct Args {
    /// The verbosity setting of devmon. The higher the value the more
    /// chatty devmon gets.
    pub verbose: u64,
    /// Devmon version string. This is set automatically.
    pub version: String,
    /// Samples the buffer may hold before evicting its oldest.
    pub buffer_capacity: usize,
    /// See `sampler::Sampler` for more.
    pub sampler: SamplerConfig,
    /// See `forwarder::Forwarder` for more.
    pub forwarder: ForwarderConfig,
    /// See `supervisor::Supervisor` for more.
    pub supervisor: SupervisorConfig,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            verbose: 0,
            version: default_version(),
            buffer_capacity: 4_096,
            sampler: SamplerConfig::default(),
            forwarder: ForwarderConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

/// Parse the devmon configuration arguments
///
/// This function will read the environment arguments and construct an
/// `Args`. Most devmon configuration will be stored in an on-disk file. See
/// `devmon --help` for more information.
pub fn parse_args() -> Args {
    let args = App::new("devmon")
        .version(VERSION.unwrap_or("unknown"))
        .about("development environment telemetry, sampled and shipped")
        .arg(
            Arg::with_name("config-file")
                .long("config")
                .short("C")
                .value_name("config")
                .required(true)
                .help("The config file to feed in.")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Turn on verbose output."),
        )
        .get_matches();

    let verb = if args.is_present("verbose") {
        args.occurrences_of("verbose")
    } else {
        0
    };

    if let Some(filename) = args.value_of("config-file") {
        let mut fp = match File::open(filename) {
            Err(e) => panic!("Could not open file {} with error {}", filename, e),
            Ok(fp) => fp,
        };

        let mut buffer = String::new();
        fp.read_to_string(&mut buffer).unwrap();
        parse_config_file(&buffer, verb)
    } else {
        unreachable!();
    }
}

/// Parse the devmon configuration file.
///
/// The file is TOML: a `buffer-capacity` key at the top level and
/// `[sampler]`, `[forwarder]` and `[supervisor]` tables, all optional. An
/// example lives in the README.
pub fn parse_config_file(buffer: &str, verbosity: u64) -> Args {
    let mut args = Args::default();
    let value: toml::Value = toml::from_str(buffer).expect("could not parse config file");

    args.verbose = verbosity;

    args.buffer_capacity = value
        .get("buffer-capacity")
        .map(|c| {
            let c = c.as_integer().expect("could not parse buffer-capacity");
            assert!(c > 0, "buffer-capacity must be positive");
            c as usize
        })
        .unwrap_or(args.buffer_capacity);

    if let Some(tbl) = value.get("sampler") {
        let res = &mut args.sampler;

        res.interval = tbl.get("interval")
            .map(|i| {
                let i = i.as_integer().expect("could not parse sampler.interval");
                assert!(i > 0, "sampler.interval must be positive");
                i as u64
            })
            .unwrap_or(res.interval);

        res.services = tbl.get("services")
            .map(|s| {
                s.as_array()
                    .expect("could not parse sampler.services")
                    .iter()
                    .map(|v| {
                        v.as_str()
                            .expect("sampler.services entries must be strings")
                            .to_string()
                    })
                    .collect()
            })
            .unwrap_or_else(|| res.services.clone());

        res.thermal_path = tbl.get("thermal_path")
            .map(|p| {
                PathBuf::from(p.as_str().expect("could not parse sampler.thermal_path"))
            })
            .unwrap_or_else(|| res.thermal_path.clone());

        res.cpufreq_path = tbl.get("cpufreq_path")
            .map(|p| {
                PathBuf::from(p.as_str().expect("could not parse sampler.cpufreq_path"))
            })
            .unwrap_or_else(|| res.cpufreq_path.clone());

        res.disk_path = tbl.get("disk_path")
            .map(|p| PathBuf::from(p.as_str().expect("could not parse sampler.disk_path")))
            .unwrap_or_else(|| res.disk_path.clone());

        res.high_temperature = tbl.get("high_temperature")
            .map(|t| {
                t.as_float()
                    .expect("could not parse sampler.high_temperature")
            })
            .unwrap_or(res.high_temperature);

        res.high_memory = tbl.get("high_memory")
            .map(|t| t.as_float().expect("could not parse sampler.high_memory"))
            .unwrap_or(res.high_memory);
    }

    if let Some(tbl) = value.get("forwarder") {
        let res = &mut args.forwarder;

        res.endpoint = tbl.get("endpoint")
            .map(|e| {
                e.as_str()
                    .expect("could not parse forwarder.endpoint")
                    .to_string()
            })
            .unwrap_or_else(|| res.endpoint.clone());

        res.max_attempts = tbl.get("max_attempts")
            .map(|m| {
                let m = m.as_integer()
                    .expect("could not parse forwarder.max_attempts");
                assert!(m > 0, "forwarder.max_attempts must be positive");
                m as u32
            })
            .unwrap_or(res.max_attempts);

        res.base_delay_ms = tbl.get("base_delay_ms")
            .map(|d| {
                d.as_integer()
                    .expect("could not parse forwarder.base_delay_ms") as u64
            })
            .unwrap_or(res.base_delay_ms);

        res.max_delay_ms = tbl.get("max_delay_ms")
            .map(|d| {
                d.as_integer()
                    .expect("could not parse forwarder.max_delay_ms") as u64
            })
            .unwrap_or(res.max_delay_ms);

        res.batch_size = tbl.get("batch_size")
            .map(|b| {
                let b = b.as_integer().expect("could not parse forwarder.batch_size");
                assert!(b > 0, "forwarder.batch_size must be positive");
                b as usize
            })
            .unwrap_or(res.batch_size);

        res.max_batch_bytes = tbl.get("max_batch_bytes")
            .map(|b| {
                b.as_integer()
                    .expect("could not parse forwarder.max_batch_bytes") as usize
            })
            .unwrap_or(res.max_batch_bytes);

        res.transmit_timeout_ms = tbl.get("transmit_timeout_ms")
            .map(|t| {
                t.as_integer()
                    .expect("could not parse forwarder.transmit_timeout_ms")
                    as u64
            })
            .unwrap_or(res.transmit_timeout_ms);

        res.poll_interval_ms = tbl.get("poll_interval_ms")
            .map(|p| {
                p.as_integer()
                    .expect("could not parse forwarder.poll_interval_ms")
                    as u64
            })
            .unwrap_or(res.poll_interval_ms);
    }

    if let Some(tbl) = value.get("supervisor") {
        args.supervisor.max_restarts = tbl.get("max_restarts")
            .map(|m| {
                m.as_integer()
                    .expect("could not parse supervisor.max_restarts")
                    as usize
            })
            .unwrap_or(args.supervisor.max_restarts);
    }

    args
}
