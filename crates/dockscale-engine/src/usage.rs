//! Resource usage derived from a raw Docker stats sample.
//!
//! The arithmetic mirrors what `docker stats` prints so numbers reported by the
//! control plane line up with the CLI.

use bollard::container::{MemoryStatsStats, Stats};
use chrono::{DateTime, Utc};
use dockscale_common::UsageSnapshot;

pub fn snapshot_from_stats(stats: &Stats) -> UsageSnapshot {
    let online_cpus = stats
        .cpu_stats
        .online_cpus
        .filter(|n| *n > 0)
        .or_else(|| {
            stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|per_cpu| per_cpu.len() as u64)
        })
        .unwrap_or(1);

    let cpu = cpu_percent(
        stats.cpu_stats.cpu_usage.total_usage,
        stats.precpu_stats.cpu_usage.total_usage,
        stats.cpu_stats.system_cpu_usage.unwrap_or(0),
        stats.precpu_stats.system_cpu_usage.unwrap_or(0),
        online_cpus,
    );

    let inactive = match &stats.memory_stats.stats {
        Some(MemoryStatsStats::V1(v1)) => v1.total_inactive_file,
        Some(MemoryStatsStats::V2(v2)) => v2.inactive_file,
        None => 0,
    };
    let memory_usage = working_set(stats.memory_stats.usage.unwrap_or(0), inactive);
    let memory_limit = stats.memory_stats.limit.unwrap_or(0);

    let (rx, tx) = stats
        .networks
        .as_ref()
        .map(|networks| {
            networks.values().fold((0u64, 0u64), |(rx, tx), net| {
                (rx.saturating_add(net.rx_bytes), tx.saturating_add(net.tx_bytes))
            })
        })
        .unwrap_or((0, 0));

    let (block_read, block_write) = stats
        .blkio_stats
        .io_service_bytes_recursive
        .as_ref()
        .map(|entries| {
            entries.iter().fold((0u64, 0u64), |(r, w), entry| {
                match entry.op.to_ascii_lowercase().as_str() {
                    "read" => (r.saturating_add(entry.value), w),
                    "write" => (r, w.saturating_add(entry.value)),
                    _ => (r, w),
                }
            })
        })
        .unwrap_or((0, 0));

    UsageSnapshot {
        read_at: DateTime::parse_from_rfc3339(&stats.read)
            .ok()
            .map(|read| read.with_timezone(&Utc)),
        cpu_percent: cpu,
        online_cpus,
        memory_usage_bytes: memory_usage,
        memory_limit_bytes: memory_limit,
        memory_percent: percent(memory_usage, memory_limit),
        network_rx_bytes: rx,
        network_tx_bytes: tx,
        block_read_bytes: block_read,
        block_write_bytes: block_write,
        pids: stats.pids_stats.current.unwrap_or(0),
    }
}

/// CPU utilisation across all online CPUs, `docker stats` style.
pub fn cpu_percent(
    total_usage: u64,
    prev_total_usage: u64,
    system_usage: u64,
    prev_system_usage: u64,
    online_cpus: u64,
) -> f64 {
    let cpu_delta = total_usage as f64 - prev_total_usage as f64;
    let system_delta = system_usage as f64 - prev_system_usage as f64;
    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }
    (cpu_delta / system_delta) * online_cpus as f64 * 100.0
}

/// Memory usage without reclaimable page cache.
pub fn working_set(usage: u64, inactive_file: u64) -> u64 {
    if inactive_file < usage {
        usage - inactive_file
    } else {
        usage
    }
}

pub fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_percent() {
        // 50ms of CPU over 100ms of system time on 4 CPUs
        let pct = cpu_percent(150_000_000, 100_000_000, 1_100_000_000, 1_000_000_000, 4);
        assert!((pct - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cpu_percent_without_previous_sample() {
        assert_eq!(cpu_percent(100, 100, 1_000, 1_000, 2), 0.0);
        assert_eq!(cpu_percent(100, 200, 1_000, 900, 2), 0.0);
    }

    #[test]
    fn test_working_set() {
        assert_eq!(working_set(1_000, 200), 800);
        // Cache larger than usage means the counters are inconsistent; keep raw usage.
        assert_eq!(working_set(100, 200), 100);
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(50, 200), 25.0);
        assert_eq!(percent(50, 0), 0.0);
    }
}
