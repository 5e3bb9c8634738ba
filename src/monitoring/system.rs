//! Process-wide resource readings from `/proc`. Every reader returns zero
//! where the file is unavailable, so non-Linux hosts simply report nothing.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Linux always reports `/proc/self/stat` times in 100 Hz ticks.
const USER_HZ: f64 = 100.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub cores: usize,
    pub rss_bytes: u64,
    pub memory_total_bytes: u64,
    pub memory_available_bytes: u64,
    /// Whole-machine CPU load since the previous reading, `0.0..=1.0`.
    pub system_load: f64,
    /// This process's share of all cores since the previous reading, `0.0..=1.0`.
    pub process_load: f64,
}

impl SystemStats {
    pub fn collect() -> Self {
        let cores = cores();
        let (memory_total_bytes, memory_available_bytes) = read_meminfo();
        Self {
            cores,
            rss_bytes: process_rss_bytes(),
            memory_total_bytes,
            memory_available_bytes,
            system_load: read_system_load(),
            process_load: (read_process_cpu_load() / cores as f64).clamp(0.0, 1.0),
        }
    }
}

pub fn cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn kb_field(line: &str) -> Option<u64> {
    line.split_whitespace()
        .nth(1)
        .and_then(|v| v.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

pub fn process_rss_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|s| s.lines().find(|l| l.starts_with("VmRSS:")).and_then(kb_field))
        .unwrap_or(0)
}

fn read_meminfo() -> (u64, u64) {
    let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") else {
        return (0, 0);
    };
    let mut total = 0;
    let mut available = 0;
    for line in meminfo.lines() {
        if line.starts_with("MemTotal:") {
            total = kb_field(line).unwrap_or(0);
        } else if line.starts_with("MemAvailable:") {
            available = kb_field(line).unwrap_or(0);
        }
    }
    (total, available)
}

/// Human readable size, e.g. `12.50 MB`.
pub fn format_bytes(bytes: u64) -> String {
    let kb = bytes as f64 / 1024.0;
    if kb < 1024.0 {
        format!("{:.2} KB", kb)
    } else if kb < 1024.0 * 1024.0 {
        format!("{:.2} MB", kb / 1024.0)
    } else {
        format!("{:.2} GB", kb / (1024.0 * 1024.0))
    }
}

fn read_system_load() -> f64 {
    static PREV_IDLE: AtomicU64 = AtomicU64::new(0);
    static PREV_TOTAL: AtomicU64 = AtomicU64::new(0);

    let Ok(stat) = std::fs::read_to_string("/proc/stat") else {
        return 0.0;
    };
    let parts: Vec<&str> = stat.lines().next().unwrap_or("").split_whitespace().collect();
    if parts.len() < 5 || parts[0] != "cpu" {
        return 0.0;
    }

    let total: u64 = parts[1..].iter().filter_map(|p| p.parse::<u64>().ok()).sum();
    let idle = parts[4].parse::<u64>().unwrap_or(0);

    let prev_idle = PREV_IDLE.swap(idle, Ordering::Relaxed);
    let prev_total = PREV_TOTAL.swap(total, Ordering::Relaxed);
    if prev_total == 0 {
        return 0.0;
    }

    let d_idle = idle.saturating_sub(prev_idle);
    let d_total = total.saturating_sub(prev_total);
    if d_total == 0 {
        return 0.0;
    }
    d_total.saturating_sub(d_idle) as f64 / d_total as f64
}

/// CPU time of this process over wall time since the previous call, in cores.
fn read_process_cpu_load() -> f64 {
    static PREV_CPU: AtomicU64 = AtomicU64::new(0);
    static PREV_WALL: AtomicU64 = AtomicU64::new(0);

    let Ok(stat) = std::fs::read_to_string("/proc/self/stat") else {
        return 0.0;
    };
    // The command name may contain spaces; fields are counted after its closing ')'.
    let Some(close) = stat.rfind(')') else {
        return 0.0;
    };
    let fields: Vec<&str> = stat[close + 1..].split_whitespace().collect();
    let utime: u64 = fields.get(11).and_then(|v| v.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.get(12).and_then(|v| v.parse().ok()).unwrap_or(0);
    let cpu_ticks = utime + stime;

    let uptime_secs: f64 = std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse().ok()))
        .unwrap_or(0.0);
    let wall_ticks = (uptime_secs * USER_HZ) as u64;

    let prev_cpu = PREV_CPU.swap(cpu_ticks, Ordering::Relaxed);
    let prev_wall = PREV_WALL.swap(wall_ticks, Ordering::Relaxed);
    if prev_wall == 0 {
        return 0.0;
    }

    let d_wall = wall_ticks.saturating_sub(prev_wall);
    if d_wall == 0 {
        return 0.0;
    }
    cpu_ticks.saturating_sub(prev_cpu) as f64 / d_wall as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_sizes() {
        assert_eq!(format_bytes(512 * 1024), "512.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 / 2), "1.50 MB");
        assert_eq!(format_bytes(2 * 1024 * 1024 * 1024), "2.00 GB");
    }

    #[test]
    fn loads_stay_in_range() {
        let stats = SystemStats::collect();
        assert!(stats.cores >= 1);
        assert!((0.0..=1.0).contains(&stats.system_load));
        assert!((0.0..=1.0).contains(&stats.process_load));
    }
}
