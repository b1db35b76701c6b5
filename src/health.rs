//! One-shot system metrics for health reports.
//!
//! Reads the same Linux sources as a metrics daemon would, but as a single
//! snapshot per request: `/proc/stat` (sampled twice for a usage delta),
//! the first thermal zone that answers, `/proc/meminfo`, `statvfs` on the
//! data partition, and `/proc/uptime`. Every field is best effort; a sensor
//! that does not exist is simply omitted.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;

/// CPU sampling window for the usage delta.
const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(200);

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_usage_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_temp_celsius: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_used_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_total_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_used_gb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_total_gb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_usage_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
}

/// Gather a performance snapshot for the health report.
pub async fn snapshot(data_dir: &Path) -> Performance {
    let mut perf = Performance::default();

    if let Ok(first) = read_cpu_totals() {
        tokio::time::sleep(CPU_SAMPLE_WINDOW).await;
        if let Ok(second) = read_cpu_totals() {
            let total = second.total.saturating_sub(first.total);
            let idle = second.idle.saturating_sub(first.idle);
            if total > 0 {
                perf.cpu_usage_percent =
                    Some((total - idle) as f64 / total as f64 * 100.0);
            }
        }
    }

    perf.cpu_temp_celsius = read_cpu_temp();

    if let Ok((used, total)) = read_memory_info() {
        perf.memory_used_mb = Some(used / (1024 * 1024));
        perf.memory_total_mb = Some(total / (1024 * 1024));
        if total > 0 {
            perf.memory_usage_percent = Some(used as f64 / total as f64 * 100.0);
        }
    }

    if let Ok((used, total)) = read_disk_usage(data_dir) {
        perf.disk_used_gb = Some(used / (1024 * 1024 * 1024));
        perf.disk_total_gb = Some(total / (1024 * 1024 * 1024));
        if total > 0 {
            perf.disk_usage_percent = Some(used as f64 / total as f64 * 100.0);
        }
    }

    perf.uptime_seconds = read_uptime();

    perf
}

struct CpuTotals {
    total: u64,
    idle: u64,
}

fn read_cpu_totals() -> std::io::Result<CpuTotals> {
    let content = fs::read_to_string("/proc/stat")?;
    let cpu_line = content
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or_else(|| std::io::Error::other("no cpu line in /proc/stat"))?;

    let fields: Vec<u64> = cpu_line
        .split_whitespace()
        .skip(1)
        .take(7)
        .filter_map(|s| s.parse().ok())
        .collect();

    if fields.len() < 7 {
        return Err(std::io::Error::other("short /proc/stat cpu line"));
    }

    Ok(CpuTotals {
        total: fields.iter().sum(),
        idle: fields[3] + fields[4],
    })
}

fn read_cpu_temp() -> Option<f32> {
    let paths = [
        "/sys/class/thermal/thermal_zone0/temp",
        "/sys/class/hwmon/hwmon0/temp1_input",
    ];

    for path in paths {
        if let Ok(content) = fs::read_to_string(path) {
            if let Ok(millidegrees) = content.trim().parse::<i64>() {
                return Some(millidegrees as f32 / 1000.0);
            }
        }
    }
    None
}

/// (used, total) bytes from /proc/meminfo.
fn read_memory_info() -> std::io::Result<(u64, u64)> {
    let content = fs::read_to_string("/proc/meminfo")?;

    let mut total = 0u64;
    let mut available = 0u64;
    for line in content.lines() {
        if line.starts_with("MemTotal:") {
            total = parse_meminfo_kib(line).unwrap_or(0) * 1024;
        } else if line.starts_with("MemAvailable:") {
            available = parse_meminfo_kib(line).unwrap_or(0) * 1024;
        }
    }

    Ok((total.saturating_sub(available), total))
}

fn parse_meminfo_kib(line: &str) -> Option<u64> {
    line.split_whitespace().nth(1)?.parse().ok()
}

/// (used, total) bytes on the filesystem containing `path`.
#[cfg(unix)]
fn read_disk_usage(path: &Path) -> std::io::Result<(u64, u64)> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::other("invalid path"))?;
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let total = stat.f_blocks as u64 * stat.f_frsize as u64;
        let available = stat.f_bavail as u64 * stat.f_frsize as u64;
        Ok((total - available, total))
    }
}

#[cfg(not(unix))]
fn read_disk_usage(_path: &Path) -> std::io::Result<(u64, u64)> {
    Err(std::io::Error::other("disk usage unsupported"))
}

fn read_uptime() -> Option<u64> {
    let content = fs::read_to_string("/proc/uptime").ok()?;
    let secs: f64 = content.split_whitespace().next()?.parse().ok()?;
    Some(secs as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_line_parses() {
        assert_eq!(parse_meminfo_kib("MemTotal:        3980448 kB"), Some(3980448));
        assert_eq!(parse_meminfo_kib("MemTotal:"), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn snapshot_populates_core_fields() {
        let perf = snapshot(Path::new("/")).await;
        assert!(perf.memory_total_mb.unwrap_or(0) > 0);
        assert!(perf.uptime_seconds.is_some());
        assert!(perf.disk_total_gb.is_some());
    }
}
