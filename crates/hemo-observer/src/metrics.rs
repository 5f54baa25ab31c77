//! Metric derivation from raw runtime counters.

use hemo_proto::HealthMetrics;
use hemo_runtime::StatsSample;

/// CPU percentage from consecutive cumulative counters:
/// `(cpu_delta / sys_delta) * online_cpus * 100`.
///
/// A zero system delta yields 0. There is no upper clamp; values above 100%
/// are legal on multi-core hosts.
pub fn cpu_percent(sample: &StatsSample) -> f64 {
    let cpu_delta = sample.cpu_total_usage.saturating_sub(sample.precpu_total_usage) as f64;
    let sys_delta = sample
        .system_cpu_usage
        .saturating_sub(sample.presystem_cpu_usage) as f64;

    if sys_delta == 0.0 {
        return 0.0;
    }

    ((cpu_delta / sys_delta) * sample.online_cpus.max(1) as f64 * 100.0).max(0.0)
}

/// Memory percentage excluding page cache: `(usage - inactive_file) / limit`.
///
/// A zero limit yields 0; the result is clamped to [0, 100].
pub fn memory_percent(sample: &StatsSample) -> f64 {
    if sample.memory_limit == 0 {
        return 0.0;
    }
    let actual = sample
        .memory_usage
        .saturating_sub(sample.memory_inactive_file) as f64;
    (actual / sample.memory_limit as f64 * 100.0).clamp(0.0, 100.0)
}

/// Full metric snapshot: CPU/memory percentages plus network and block I/O
/// summed across interfaces and Read/Write entries.
pub fn derive(sample: &StatsSample) -> HealthMetrics {
    let mut network_rx_bytes = 0u64;
    let mut network_tx_bytes = 0u64;
    for iface in &sample.interfaces {
        network_rx_bytes += iface.rx_bytes;
        network_tx_bytes += iface.tx_bytes;
    }

    let mut blkio_read_bytes = 0u64;
    let mut blkio_write_bytes = 0u64;
    for entry in &sample.blkio {
        match entry.op.as_str() {
            "Read" => blkio_read_bytes += entry.value,
            "Write" => blkio_write_bytes += entry.value,
            _ => {}
        }
    }

    HealthMetrics {
        cpu_percent: cpu_percent(sample),
        memory_percent: memory_percent(sample),
        memory_usage: sample.memory_usage,
        memory_limit: sample.memory_limit,
        network_rx_bytes,
        network_tx_bytes,
        blkio_read_bytes,
        blkio_write_bytes,
    }
}
