//! Periodic system metric sampling
//!
//! The sampler is devmon's one source: every `interval` seconds it probes
//! the host -- CPU, memory, disk, thermal zone, service states -- and pushes
//! the readings into the shared buffer. A probe that cannot be read emits
//! the unavailable sentinel instead of failing the tick; the sampler never
//! blocks on the forwarder, the network or a full buffer.

use buffer::Buffer;
use constants;
use libc;
use metric::{Sample, Unit};
use mio;
use report::Report;
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::mem;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Configuration for the sampler.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    /// Seconds between ticks.
    pub interval: u64,
    /// Systemd services to check with `systemctl is-active`.
    pub services: Vec<String>,
    /// The sysfs thermal zone file, millidegrees Celsius.
    pub thermal_path: PathBuf,
    /// The sysfs current-frequency file, kHz.
    pub cpufreq_path: PathBuf,
    /// Mount point measured by the disk probe.
    pub disk_path: PathBuf,
    /// Degrees Celsius above which a warning is logged.
    pub high_temperature: f64,
    /// Memory used percent above which a warning is logged.
    pub high_memory: f64,
}

impl Default for SamplerConfig {
    fn default() -> SamplerConfig {
        SamplerConfig {
            interval: 5,
            services: vec![
                "ssh".to_string(),
                "docker".to_string(),
                "nginx".to_string(),
                "postgresql".to_string(),
            ],
            thermal_path: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
            cpufreq_path: PathBuf::from(
                "/sys/devices/system/cpu/cpu0/cpufreq/scaling_cur_freq",
            ),
            disk_path: PathBuf::from("/"),
            high_temperature: 80.0,
            high_memory: 90.0,
        }
    }
}

/// Aggregate jiffy counts from one `/proc/stat` reading.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CpuTotals {
    idle: u64,
    total: u64,
}

struct MemReadings {
    used_percent: f64,
    available_gb: f64,
    swap_used_percent: f64,
    swap_free_gb: f64,
}

/// The sampling unit.
pub struct Sampler {
    buffer: Arc<Buffer>,
    report: Arc<Report>,
    config: SamplerConfig,
    // previous tick's jiffy totals; None until the first tick has run
    cpu_prev: Option<CpuTotals>,
}

impl Sampler {
    /// Create a new Sampler feeding `buffer`.
    pub fn new(buffer: Arc<Buffer>, report: Arc<Report>, config: SamplerConfig) -> Sampler {
        Sampler {
            buffer: buffer,
            report: report,
            config: config,
            cpu_prev: None,
        }
    }

    /// Tick until shutdown.
    ///
    /// The poll timeout doubles as the sampling cadence: an empty poll is a
    /// tick, an event on the SYSTEM token is the supervisor asking us to
    /// stop.
    pub fn run(&mut self, poll: mio::Poll) {
        let interval = Duration::from_secs(self.config.interval);
        loop {
            let mut events = mio::Events::with_capacity(1024);
            match poll.poll(&mut events, Some(interval)) {
                Ok(_) => {
                    for event in &events {
                        if event.token() == constants::SYSTEM {
                            return;
                        }
                    }
                    self.tick();
                }
                Err(e) => panic!("Failed during poll {:?}", e),
            }
        }
    }

    /// Run every probe once and push the results.
    pub fn tick(&mut self) {
        let mut samples = Vec::with_capacity(32);
        self.cpu(&mut samples);
        self.memory(&mut samples);
        self.disk(&mut samples);
        self.thermal(&mut samples);
        self.services(&mut samples);
        samples.extend(self.report.snapshot());

        self.report
            .samples
            .fetch_add(samples.len(), Ordering::Relaxed);
        for sample in samples {
            self.buffer.push(sample);
        }
    }

    fn cpu(&mut self, samples: &mut Vec<Sample>) {
        match read_file("/proc/stat") {
            Ok(buf) => {
                let percent = match parse_stat(&buf) {
                    Some(cur) => {
                        let percent = self.cpu_prev
                            .and_then(|prev| cpu_percent(prev, cur));
                        self.cpu_prev = Some(cur);
                        percent
                    }
                    None => {
                        self.mark_error("cpu", "unparseable /proc/stat");
                        None
                    }
                };
                match percent {
                    // no delta on the first tick
                    Some(p) => samples.push(Sample::new("cpu.percent", p, Unit::Percent)),
                    None => {
                        samples.push(Sample::unavailable("cpu.percent", Unit::Percent))
                    }
                }

                let ncpus = count_cpus(&buf);
                match read_file("/proc/loadavg").ok().and_then(|b| parse_loadavg(&b)) {
                    Some((l1, l5, l15)) if ncpus > 0 => {
                        let norm = |l: f64| l / ncpus as f64 * 100.0;
                        samples.push(Sample::new("cpu.load.1min", norm(l1), Unit::Percent));
                        samples.push(Sample::new("cpu.load.5min", norm(l5), Unit::Percent));
                        samples
                            .push(Sample::new("cpu.load.15min", norm(l15), Unit::Percent));
                    }
                    _ => {
                        self.mark_error("cpu", "unreadable /proc/loadavg");
                        samples.push(Sample::unavailable("cpu.load.1min", Unit::Percent));
                        samples.push(Sample::unavailable("cpu.load.5min", Unit::Percent));
                        samples.push(Sample::unavailable("cpu.load.15min", Unit::Percent));
                    }
                }
            }
            Err(e) => {
                self.mark_error("cpu", &format!("unreadable /proc/stat: {}", e));
                samples.push(Sample::unavailable("cpu.percent", Unit::Percent));
                samples.push(Sample::unavailable("cpu.load.1min", Unit::Percent));
                samples.push(Sample::unavailable("cpu.load.5min", Unit::Percent));
                samples.push(Sample::unavailable("cpu.load.15min", Unit::Percent));
            }
        }

        let freq = read_file(&self.config.cpufreq_path).ok();
        match freq.and_then(|b| parse_scaled(&b, 1_000.0)) {
            // scaling_cur_freq reports kHz
            Some(mhz) => samples.push(Sample::new("cpu.frequency", mhz, Unit::Megahertz)),
            None => {
                self.mark_error("cpu", "unreadable cpufreq");
                samples.push(Sample::unavailable("cpu.frequency", Unit::Megahertz));
            }
        }
    }

    fn memory(&mut self, samples: &mut Vec<Sample>) {
        match read_file("/proc/meminfo").ok().and_then(|b| parse_meminfo(&b)) {
            Some(mem) => {
                if mem.used_percent > self.config.high_memory {
                    warn!(
                        "high memory usage detected: {:.1}% used",
                        mem.used_percent
                    );
                }
                samples.push(Sample::new(
                    "mem.used_percent",
                    mem.used_percent,
                    Unit::Percent,
                ));
                samples.push(Sample::new(
                    "mem.available",
                    mem.available_gb,
                    Unit::Gigabytes,
                ));
                samples.push(Sample::new(
                    "swap.used_percent",
                    mem.swap_used_percent,
                    Unit::Percent,
                ));
                samples.push(Sample::new("swap.free", mem.swap_free_gb, Unit::Gigabytes));
            }
            None => {
                self.mark_error("memory", "unreadable /proc/meminfo");
                samples.push(Sample::unavailable("mem.used_percent", Unit::Percent));
                samples.push(Sample::unavailable("mem.available", Unit::Gigabytes));
                samples.push(Sample::unavailable("swap.used_percent", Unit::Percent));
                samples.push(Sample::unavailable("swap.free", Unit::Gigabytes));
            }
        }
    }

    fn disk(&mut self, samples: &mut Vec<Sample>) {
        match statvfs(&self.config.disk_path) {
            Some((used_percent, free_gb)) => {
                samples.push(Sample::new("disk.used_percent", used_percent, Unit::Percent));
                samples.push(Sample::new("disk.free", free_gb, Unit::Gigabytes));
            }
            None => {
                self.mark_error("disk", "statvfs failed");
                samples.push(Sample::unavailable("disk.used_percent", Unit::Percent));
                samples.push(Sample::unavailable("disk.free", Unit::Gigabytes));
            }
        }
    }

    fn thermal(&mut self, samples: &mut Vec<Sample>) {
        let buf = read_file(&self.config.thermal_path).ok();
        // the thermal zone reports millidegrees
        match buf.and_then(|b| parse_scaled(&b, 1_000.0)) {
            Some(celsius) => {
                if celsius > self.config.high_temperature {
                    warn!("high temperature detected: {:.1}C", celsius);
                }
                samples.push(Sample::new("thermal.cpu", celsius, Unit::Celsius));
            }
            None => {
                self.mark_error("thermal", "unreadable thermal zone");
                samples.push(Sample::unavailable("thermal.cpu", Unit::Celsius));
            }
        }
    }

    fn services(&mut self, samples: &mut Vec<Sample>) {
        for service in &self.config.services {
            let name = format!("service.{}", service);
            match Command::new("systemctl")
                .arg("is-active")
                .arg(service)
                .output()
            {
                Ok(output) => {
                    let active = String::from_utf8_lossy(&output.stdout).trim() == "active";
                    if !active {
                        warn!("service {} is not running", service);
                    }
                    let value = if active { 1.0 } else { 0.0 };
                    samples.push(Sample::new(name, value, Unit::State));
                }
                Err(e) => {
                    self.report.sampling_errors.fetch_add(1, Ordering::Relaxed);
                    debug!("could not check service {} with error {}", service, e);
                    samples.push(Sample::unavailable(name, Unit::State));
                }
            }
        }
    }

    fn mark_error(&self, probe: &str, reason: &str) {
        self.report.sampling_errors.fetch_add(1, Ordering::Relaxed);
        debug!("{} probe failed: {}", probe, reason);
    }
}

fn read_file<P: AsRef<Path>>(path: P) -> ::std::io::Result<String> {
    let mut fp = File::open(path)?;
    let mut buffer = String::new();
    fp.read_to_string(&mut buffer)?;
    Ok(buffer)
}

/// Pull the aggregate cpu line out of a `/proc/stat` reading.
fn parse_stat(buf: &str) -> Option<CpuTotals> {
    let line = buf.lines().find(|l| {
        l.starts_with("cpu ")
    })?;
    let fields: Vec<u64> = line.split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 5 {
        return None;
    }
    // fields: user nice system idle iowait [irq softirq steal ...]
    let idle = fields[3] + fields[4];
    let total = fields.iter().sum();
    Some(CpuTotals {
        idle: idle,
        total: total,
    })
}

/// Number of `cpuN` lines in a `/proc/stat` reading.
fn count_cpus(buf: &str) -> usize {
    buf.lines()
        .filter(|l| {
            l.starts_with("cpu") && l.as_bytes().get(3).map_or(false, u8::is_ascii_digit)
        })
        .count()
}

/// Busy percentage between two jiffy totals. None when no time has passed.
fn cpu_percent(prev: CpuTotals, cur: CpuTotals) -> Option<f64> {
    let total = cur.total.checked_sub(prev.total)?;
    if total == 0 {
        return None;
    }
    let idle = cur.idle.saturating_sub(prev.idle);
    Some((1.0 - idle as f64 / total as f64) * 100.0)
}

/// The three load averages from a `/proc/loadavg` reading.
fn parse_loadavg(buf: &str) -> Option<(f64, f64, f64)> {
    let mut fields = buf.split_whitespace();
    let l1 = fields.next()?.parse().ok()?;
    let l5 = fields.next()?.parse().ok()?;
    let l15 = fields.next()?.parse().ok()?;
    Some((l1, l5, l15))
}

/// A single integer reading divided by `scale`, e.g. millidegrees or kHz
/// files under sysfs.
fn parse_scaled(buf: &str, scale: f64) -> Option<f64> {
    let raw: f64 = buf.trim().parse().ok()?;
    Some(raw / scale)
}

const KB_PER_GB: f64 = 1_048_576.0;

/// Memory and swap figures from a `/proc/meminfo` reading, kB fields.
fn parse_meminfo(buf: &str) -> Option<MemReadings> {
    let field = |name: &str| -> Option<f64> {
        buf.lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    let swap_total = field("SwapTotal:")?;
    let swap_free = field("SwapFree:")?;
    if total <= 0.0 {
        return None;
    }
    // a swapless board reports 0% used, not a sentinel
    let swap_used_percent = if swap_total > 0.0 {
        (swap_total - swap_free) / swap_total * 100.0
    } else {
        0.0
    };
    Some(MemReadings {
        used_percent: (1.0 - available / total) * 100.0,
        available_gb: available / KB_PER_GB,
        swap_used_percent: swap_used_percent,
        swap_free_gb: swap_free / KB_PER_GB,
    })
}

/// Used percent and free gigabytes for the filesystem at `path`.
fn statvfs(path: &Path) -> Option<(f64, f64)> {
    let cpath = CString::new(path.to_str()?).ok()?;
    let mut vfs: libc::statvfs = unsafe { mem::zeroed() };
    let res = unsafe { libc::statvfs(cpath.as_ptr(), &mut vfs) };
    if res != 0 {
        return None;
    }
    let blocks = vfs.f_blocks as f64;
    let avail = vfs.f_bavail as f64;
    let frsize = vfs.f_frsize as f64;
    if blocks <= 0.0 {
        return None;
    }
    let used_percent = (1.0 - avail / blocks) * 100.0;
    let free_gb = avail * frsize / 1_073_741_824.0;
    Some((used_percent, free_gb))
}
