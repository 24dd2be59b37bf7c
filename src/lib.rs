//! Devmon is a telemetry agent for development boards. It samples the
//! health of a small Linux machine -- CPU, memory, disk, SoC temperature,
//! the services a development environment leans on -- and ships the
//! readings to a collector over HTTP, riding out flaky links with bounded
//! local buffering. Devmon has minimal CPU and memory requirements and
//! degrades by shedding its oldest data, never by growing without bound.
//!
//! Why you might choose to use devmon:
//!
//!  * You develop on hardware that overheats, swaps and drops off the
//!    network, and you want to see it happening.
//!  * You need buffering and retry between a flaky device and your
//!    collector, not a heavyweight metrics pipeline.
//!  * You want the agent supervised: crashed loops restart, runaway crash
//!    loops kill the process loudly.
#![allow(unknown_lints)]
#![deny(trivial_numeric_casts, missing_docs, unstable_features, unused_import_braces)]
extern crate chrono;
extern crate clap;
extern crate hyper;
extern crate libc;
extern crate mio;
extern crate rand;
extern crate serde;
extern crate toml;
extern crate url;

#[macro_use]
extern crate log;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate serde_json;

#[cfg(test)]
extern crate quickcheck;

pub mod buffer;
pub mod config;
pub mod constants;
pub mod forwarder;
pub mod metric;
pub mod report;
pub mod sampler;
pub mod supervisor;
pub mod time;
