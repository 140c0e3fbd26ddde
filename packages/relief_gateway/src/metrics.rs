//! Gateway counters
//!
//! Lightweight atomics surfaced through the health endpoint.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct GatewayMetrics {
    // Connection metrics
    /// Currently registered sessions
    pub active_connections: AtomicU64,
    /// Sessions registered since startup
    pub total_connections: AtomicU64,

    // Event metrics
    /// Events accepted by the broadcaster
    pub events_published: AtomicU64,
    /// Per-session deliveries that were queued
    pub deliveries: AtomicU64,
    /// Per-session deliveries skipped (full queue or session mid-teardown)
    pub deliveries_skipped: AtomicU64,

    // Error metrics
    /// Handler failures converted by the error envelope
    pub handler_failures: AtomicU64,

    /// Gateway start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // Event tracking
    pub fn event_published(&self, delivered: usize, skipped: usize) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        self.deliveries_skipped
            .fetch_add(skipped as u64, Ordering::Relaxed);
    }

    pub fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Uptime in fractional seconds
    pub fn uptime_secs(&self) -> f64 {
        self.start_time
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            events: EventMetrics {
                published: self.events_published.load(Ordering::Relaxed),
                delivered: self.deliveries.load(Ordering::Relaxed),
                skipped: self.deliveries_skipped.load(Ordering::Relaxed),
            },
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connections: ConnectionMetrics,
    pub events: EventMetrics,
    pub handler_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetrics {
    pub published: u64,
    pub delivered: u64,
    pub skipped: u64,
}

/// Process memory figures; fields are absent where the platform cannot report them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rss_kb: Option<u64>,
}

impl MemoryStats {
    pub fn sample() -> Self {
        let (virtual_bytes, rss_bytes) = statm().unzip();
        Self {
            rss_bytes,
            virtual_bytes,
            max_rss_kb: max_rss_kb(),
        }
    }
}

/// (virtual, resident) bytes from /proc/self/statm.
#[cfg(target_os = "linux")]
fn statm() -> Option<(u64, u64)> {
    use nix::unistd::{SysconfVar, sysconf};
    let page_size = sysconf(SysconfVar::PAGE_SIZE).ok().flatten()? as u64;
    let raw = std::fs::read_to_string("/proc/self/statm").ok()?;
    let mut fields = raw.split_whitespace().map(|f| f.parse::<u64>().ok());
    let size = fields.next()??;
    let resident = fields.next()??;
    Some((size * page_size, resident * page_size))
}

#[cfg(not(target_os = "linux"))]
fn statm() -> Option<(u64, u64)> {
    None
}

#[cfg(unix)]
fn max_rss_kb() -> Option<u64> {
    use nix::sys::resource::{UsageWho, getrusage};
    getrusage(UsageWho::RUSAGE_SELF)
        .ok()
        .map(|usage| usage.max_rss().max(0) as u64)
}

#[cfg(not(unix))]
fn max_rss_kb() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = GatewayMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);

        metrics.connection_closed();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_event_tracking() {
        let metrics = GatewayMetrics::new();
        metrics.event_published(3, 1);
        metrics.event_published(2, 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events.published, 2);
        assert_eq!(snapshot.events.delivered, 5);
        assert_eq!(snapshot.events.skipped, 1);
    }

    #[test]
    fn test_uptime_is_monotonic() {
        let metrics = GatewayMetrics::new();
        let first = metrics.uptime_secs();
        assert!(first >= 0.0);
        assert!(metrics.uptime_secs() >= first);
        assert_eq!(GatewayMetrics::default().uptime_secs(), 0.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memory_sample_on_linux() {
        let stats = MemoryStats::sample();
        assert!(stats.rss_bytes.unwrap_or(0) > 0);
        assert!(stats.max_rss_kb.is_some());
    }
}
