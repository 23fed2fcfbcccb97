//! Host resource utilisation read from procfs and `statvfs(3)`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::debug;

use super::{Reading, Sampler};

/// Pause between host readings.
pub const SYSTEM_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Window over which CPU utilisation is averaged.
pub const CPU_AVERAGING_WINDOW: Duration = Duration::from_secs(1);

pub const CPU_USAGE: &str = "CPU_Usage";
pub const RAM_USAGE: &str = "RAM_Usage";
pub const DISK_USAGE: &str = "Disk_Usage";

/// Samples CPU, memory and root filesystem utilisation as percentages.
#[derive(Debug, Clone)]
pub struct SystemSampler {
    proc_root: PathBuf,
    disk_path: PathBuf,
    cpu_window: Duration,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            disk_path: PathBuf::from("/"),
            cpu_window: CPU_AVERAGING_WINDOW,
        }
    }

    /// Read procfs from `proc_root` and filesystem usage for `disk_path`.
    pub fn with_paths(proc_root: impl Into<PathBuf>, disk_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            disk_path: disk_path.into(),
            cpu_window: CPU_AVERAGING_WINDOW,
        }
    }

    fn read_cpu_times(&self) -> Result<CpuTimes> {
        let path = self.proc_root.join("stat");
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        parse_cpu_times(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn read_memory_percent(&self) -> Result<f64> {
        let path = self.proc_root.join("meminfo");
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        memory_percent(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for SystemSampler {
    fn name(&self) -> &'static str {
        "system"
    }

    fn interval(&self) -> Duration {
        SYSTEM_SAMPLE_INTERVAL
    }

    async fn sample(&mut self) -> Result<Vec<Reading>> {
        let before = self.read_cpu_times()?;
        tokio::time::sleep(self.cpu_window).await;
        let after = self.read_cpu_times()?;

        let cpu = cpu_percent(&before, &after);
        let ram = self.read_memory_percent()?;
        let disk = disk_percent(&filesystem_usage(&self.disk_path)?);

        debug!(cpu, ram, disk, "sampled host utilisation");

        Ok(vec![
            Reading::new(CPU_USAGE, clamp_percent(cpu)),
            Reading::new(RAM_USAGE, clamp_percent(ram)),
            Reading::new(DISK_USAGE, clamp_percent(disk)),
        ])
    }
}

/// Aggregate CPU time counters from the first line of `/proc/stat`, in ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub idle: u64,
}

impl CpuTimes {
    fn total(&self) -> u64 {
        self.busy.saturating_add(self.idle)
    }
}

fn parse_cpu_times(stat: &str) -> Result<CpuTimes> {
    let line = stat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .context("missing aggregate cpu line")?;

    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|f| f.parse::<u64>())
        .collect::<Result<_, _>>()
        .context("non-numeric cpu counter")?;

    if fields.len() < 4 {
        bail!("cpu line has {} counters, expected at least 4", fields.len());
    }

    // user nice system idle iowait irq softirq steal [guest guest_nice]
    // guest time is already included in user/nice.
    let field = |i: usize| fields.get(i).copied().unwrap_or(0);
    let idle = field(3).saturating_add(field(4));
    let busy = [0, 1, 2, 5, 6, 7]
        .iter()
        .fold(0u64, |acc, &i| acc.saturating_add(field(i)));

    Ok(CpuTimes { busy, idle })
}

/// Busy share of the CPU time elapsed between two snapshots.
pub fn cpu_percent(before: &CpuTimes, after: &CpuTimes) -> f64 {
    let total = after.total().saturating_sub(before.total());
    if total == 0 {
        return 0.0;
    }
    let busy = after.busy.saturating_sub(before.busy);
    busy as f64 / total as f64 * 100.0
}

/// Used memory share from `/proc/meminfo` contents.
fn memory_percent(meminfo: &str) -> Result<f64> {
    let field = |name: &str| -> Option<u64> {
        meminfo.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse::<u64>().ok()
        })
    };

    let total = field("MemTotal").context("missing MemTotal")?;
    if total == 0 {
        bail!("MemTotal is zero");
    }

    let available = match field("MemAvailable") {
        Some(v) => v,
        None => {
            let free = field("MemFree").context("missing MemFree")?;
            free.saturating_add(field("Buffers").unwrap_or(0))
                .saturating_add(field("Cached").unwrap_or(0))
        }
    };

    let used = total.saturating_sub(available);
    Ok(used as f64 / total as f64 * 100.0)
}

/// Byte counts reported by `statvfs` for one filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsUsage {
    pub total: u64,
    pub free: u64,
    /// Free space available to unprivileged users.
    pub available: u64,
}

/// Used share of a filesystem, excluding blocks reserved for root.
pub fn disk_percent(usage: &FsUsage) -> f64 {
    let used = usage.total.saturating_sub(usage.free);
    let visible = used.saturating_add(usage.available);
    if visible == 0 {
        return 0.0;
    }
    used as f64 / visible as f64 * 100.0
}

#[cfg(unix)]
fn filesystem_usage(path: &Path) -> Result<FsUsage> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path {} contains a NUL byte", path.display()))?;

    // SAFETY: `statvfs` is plain old data, so an all-zero value is valid.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: `c_path` is a valid NUL-terminated string and `stat` is a valid
    // out-pointer for the duration of the call.
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs {}", path.display()));
    }

    let block = stat.f_frsize as u64;
    Ok(FsUsage {
        total: (stat.f_blocks as u64).saturating_mul(block),
        free: (stat.f_bfree as u64).saturating_mul(block),
        available: (stat.f_bavail as u64).saturating_mul(block),
    })
}

#[cfg(not(unix))]
fn filesystem_usage(path: &Path) -> Result<FsUsage> {
    bail!("filesystem usage for {} is only supported on Unix", path.display())
}

fn clamp_percent(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "cpu  100 5 50 800 20 3 2 0 0 0\n\
                        cpu0 50 2 25 400 10 1 1 0 0 0\n\
                        intr 12345\n";

    #[test]
    fn test_parse_cpu_times() {
        let t = parse_cpu_times(STAT).expect("parse");
        assert_eq!(t.idle, 820);
        assert_eq!(t.busy, 160);
    }

    #[test]
    fn test_parse_cpu_times_short_kernel_line() {
        let t = parse_cpu_times("cpu 1 2 3 4\n").expect("parse");
        assert_eq!(t, CpuTimes { busy: 6, idle: 4 });
    }

    #[test]
    fn test_parse_cpu_times_missing_line() {
        assert!(parse_cpu_times("cpu0 1 2 3 4\n").is_err());
        assert!(parse_cpu_times("cpu 1 2\n").is_err());
    }

    #[test]
    fn test_cpu_percent() {
        let before = CpuTimes { busy: 100, idle: 300 };
        let after = CpuTimes { busy: 130, idle: 370 };
        assert!((cpu_percent(&before, &after) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_percent_no_elapsed_ticks() {
        let t = CpuTimes { busy: 5, idle: 5 };
        assert_eq!(cpu_percent(&t, &t), 0.0);
    }

    #[test]
    fn test_memory_percent_uses_available() {
        let meminfo = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        assert!((memory_percent(meminfo).expect("parse") - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_memory_percent_fallback_without_available() {
        let meminfo = "MemTotal: 1000 kB\nMemFree: 100 kB\nBuffers: 50 kB\nCached: 350 kB\n";
        assert!((memory_percent(meminfo).expect("parse") - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_memory_percent_fallback_saturates() {
        let max = u64::MAX;
        let meminfo =
            format!("MemTotal: 1000 kB\nMemFree: {max} kB\nBuffers: {max} kB\nCached: 1 kB\n");
        assert_eq!(memory_percent(&meminfo).expect("parse"), 0.0);
    }

    #[test]
    fn test_memory_percent_missing_total() {
        assert!(memory_percent("MemFree: 1 kB\n").is_err());
        assert!(memory_percent("MemTotal: 0 kB\nMemFree: 0 kB\n").is_err());
    }

    #[test]
    fn test_disk_percent_excludes_reserved_blocks() {
        let usage = FsUsage {
            total: 1000,
            free: 400,
            available: 300,
        };
        // used = 600, visible = 600 + 300
        assert!((disk_percent(&usage) - 600.0 / 900.0 * 100.0).abs() < 1e-9);
        assert_eq!(disk_percent(&FsUsage::default()), 0.0);
    }

    #[test]
    fn test_clamp_percent() {
        assert_eq!(clamp_percent(-1.0), 0.0);
        assert_eq!(clamp_percent(101.0), 100.0);
        assert_eq!(clamp_percent(f64::NAN), 0.0);
        assert_eq!(clamp_percent(42.0), 42.0);
    }

    #[cfg(unix)]
    #[test]
    fn test_filesystem_usage_of_tempdir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let usage = filesystem_usage(tmp.path()).expect("statvfs");
        assert!(usage.total > 0);
        assert!(usage.free <= usage.total);
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_sample_from_fake_procfs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("stat"), STAT).expect("write stat");
        fs::write(
            tmp.path().join("meminfo"),
            "MemTotal: 2000 kB\nMemAvailable: 500 kB\n",
        )
        .expect("write meminfo");

        let mut sampler = SystemSampler::with_paths(tmp.path(), tmp.path());
        let readings = sampler.sample().await.expect("sample");

        let names: Vec<_> = readings.iter().map(|r| r.name).collect();
        assert_eq!(names, vec![CPU_USAGE, RAM_USAGE, DISK_USAGE]);
        // Identical snapshots: no ticks elapsed.
        assert_eq!(readings[0].value, 0.0);
        assert!((readings[1].value - 75.0).abs() < 1e-9);
        assert!((0.0..=100.0).contains(&readings[2].value));
    }
}
