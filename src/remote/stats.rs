// Reduce a raw Docker stats response to the metrics kept on container records.

use crate::models::ResourceMetrics;
use bollard::models::ContainerStatsResponse;

/// cpu% is the container's share of the system cpu delta, scaled by online cpus.
/// Returns `None` when the response carries no cpu sample (container not running).
pub fn metrics_from_stats(s: &ContainerStatsResponse) -> Option<ResourceMetrics> {
    let cpu_stats = s.cpu_stats.as_ref()?;
    let precpu_stats = s.precpu_stats.as_ref();

    let total = cpu_stats.cpu_usage.as_ref()?.total_usage.unwrap_or(0) as i64;
    let pre_total = precpu_stats
        .and_then(|p| p.cpu_usage.as_ref())
        .and_then(|u| u.total_usage)
        .unwrap_or(0) as i64;
    let system = cpu_stats.system_cpu_usage.unwrap_or(0) as i64;
    let pre_system = precpu_stats
        .and_then(|p| p.system_cpu_usage)
        .unwrap_or(0) as i64;

    let cpu_delta = total - pre_total;
    let system_delta = system - pre_system;
    let online = cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
    let cpu_percent = if system_delta > 0 && cpu_delta >= 0 {
        let raw = (cpu_delta as f64 / system_delta as f64) * online * 100.0;
        (raw * 100.0).round() / 100.0
    } else {
        0.0
    };

    let memory_usage_bytes = s.memory_stats.as_ref().and_then(|m| m.usage).unwrap_or(0);
    let memory_limit_bytes = s.memory_stats.as_ref().and_then(|m| m.limit).unwrap_or(0);

    Some(ResourceMetrics {
        cpu_percent,
        memory_usage_bytes,
        memory_limit_bytes,
    })
}
