use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::proxy::PeerIdentifier;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// Process-wide bookkeeping: per-upstream error counters and the table of
/// live tunnels. Cheap no-op when monitoring is disabled.
#[derive(Clone, Default)]
pub struct AppMonitor {
    inner: Option<Arc<MonitorInner>>,
}

#[derive(Default)]
struct MonitorInner {
    errors: Mutex<HashMap<String, u64>>,
    tunnels: Mutex<HashMap<u64, Arc<TunnelStats>>>,
    next_id: AtomicU64,
    /// Cumulative bytes across closed tunnels.
    total_uploaded: AtomicU64,
    total_downloaded: AtomicU64,
}

pub struct TunnelStats {
    pub rule: String,
    pub downstream: String,
    pub upstream: String,
    pub peer: String,
    pub peer_identifiers: Vec<PeerIdentifier>,
    pub bound_addr: String,
    pub connect_latency: Duration,
    pub bytes_uploaded: AtomicU64,
    pub bytes_downloaded: AtomicU64,
    /// Cancelling this tears the tunnel down.
    pub cancel: CancellationToken,
}

impl AppMonitor {
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: enabled.then(|| Arc::new(MonitorInner::default())),
        }
    }

    /// Arms the monitor and starts the periodic snapshot reporter. `path`
    /// names the export root a scraper would use; the registry itself is
    /// in-process only.
    pub fn start(&self, path: &str) {
        let Some(inner) = &self.inner else {
            return;
        };
        info!(path, "app monitor started");
        let inner = Arc::downgrade(inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let snapshot = AppMonitor { inner: Some(inner) };
                info!(
                    active_tunnels = snapshot.active_tunnels(),
                    bytes_up = snapshot.total_bytes_uploaded(),
                    bytes_down = snapshot.total_bytes_downloaded(),
                    upstream_errors = ?snapshot.error_counts(),
                    "monitor snapshot"
                );
                for t in snapshot.tunnels() {
                    debug!(
                        rule = %t.rule,
                        downstream = %t.downstream,
                        upstream = %t.upstream,
                        peer = %t.peer,
                        peer_ids = ?t.peer_identifiers,
                        bound = %t.bound_addr,
                        latency_ms = t.connect_latency.as_millis() as u64,
                        bytes_up = t.bytes_uploaded.load(Ordering::Relaxed),
                        bytes_down = t.bytes_downloaded.load(Ordering::Relaxed),
                        "live tunnel"
                    );
                }
            }
        });
    }

    /// Records a failed connect attempt against an upstream.
    pub fn add_error(&self, upstream: &str) {
        if let Some(inner) = &self.inner {
            *inner
                .errors
                .lock()
                .unwrap()
                .entry(upstream.to_owned())
                .or_insert(0) += 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn open_tunnel_monitor(
        &self,
        rule: &str,
        downstream: &str,
        upstream: &str,
        peer: String,
        peer_identifiers: Vec<PeerIdentifier>,
        bound_addr: String,
        connect_latency: Duration,
        cancel: CancellationToken,
    ) -> TunnelMonitor {
        let Some(inner) = &self.inner else {
            return TunnelMonitor {
                stats: None,
                registry: None,
                id: 0,
            };
        };
        let stats = Arc::new(TunnelStats {
            rule: rule.to_owned(),
            downstream: downstream.to_owned(),
            upstream: upstream.to_owned(),
            peer,
            peer_identifiers,
            bound_addr,
            connect_latency,
            bytes_uploaded: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            cancel,
        });
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        inner.tunnels.lock().unwrap().insert(id, stats.clone());
        TunnelMonitor {
            stats: Some(stats),
            registry: Some(inner.clone()),
            id,
        }
    }

    pub fn error_counts(&self) -> HashMap<String, u64> {
        match &self.inner {
            Some(inner) => inner.errors.lock().unwrap().clone(),
            None => HashMap::new(),
        }
    }

    pub fn error_count(&self, upstream: &str) -> u64 {
        self.error_counts().get(upstream).copied().unwrap_or(0)
    }

    pub fn active_tunnels(&self) -> usize {
        match &self.inner {
            Some(inner) => inner.tunnels.lock().unwrap().len(),
            None => 0,
        }
    }

    /// Snapshot of the live tunnel table.
    pub fn tunnels(&self) -> Vec<Arc<TunnelStats>> {
        match &self.inner {
            Some(inner) => inner.tunnels.lock().unwrap().values().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn total_bytes_uploaded(&self) -> u64 {
        self.inner
            .as_ref()
            .map_or(0, |i| i.total_uploaded.load(Ordering::Relaxed))
    }

    pub fn total_bytes_downloaded(&self) -> u64 {
        self.inner
            .as_ref()
            .map_or(0, |i| i.total_downloaded.load(Ordering::Relaxed))
    }
}

/// Byte accounting for one tunnel. The two relay halves increment counters
/// concurrently; the relay orchestrator closes it exactly once.
pub struct TunnelMonitor {
    stats: Option<Arc<TunnelStats>>,
    registry: Option<Arc<MonitorInner>>,
    id: u64,
}

impl TunnelMonitor {
    pub fn inc_bytes_uploaded(&self, n: u64) {
        if let Some(stats) = &self.stats {
            stats.bytes_uploaded.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn inc_bytes_downloaded(&self, n: u64) {
        if let Some(stats) = &self.stats {
            stats.bytes_downloaded.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn close(self) {
        let (Some(stats), Some(registry)) = (&self.stats, &self.registry) else {
            return;
        };
        registry.tunnels.lock().unwrap().remove(&self.id);
        registry
            .total_uploaded
            .fetch_add(stats.bytes_uploaded.load(Ordering::Relaxed), Ordering::Relaxed);
        registry.total_downloaded.fetch_add(
            stats.bytes_downloaded.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        info!(
            downstream = %stats.downstream,
            upstream = %stats.upstream,
            rule = %stats.rule,
            bytes_up = stats.bytes_uploaded.load(Ordering::Relaxed),
            bytes_down = stats.bytes_downloaded.load(Ordering::Relaxed),
            "tunnel closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(monitor: &AppMonitor) -> TunnelMonitor {
        monitor.open_tunnel_monitor(
            "r",
            "ds",
            "us",
            "127.0.0.1:9".to_owned(),
            Vec::new(),
            "0.0.0.0:0".to_owned(),
            Duration::from_millis(1),
            CancellationToken::new(),
        )
    }

    #[test]
    fn counters_accumulate_into_totals() {
        let monitor = AppMonitor::new(true);
        let tunnel = open(&monitor);
        tunnel.inc_bytes_uploaded(5);
        tunnel.inc_bytes_uploaded(3);
        tunnel.inc_bytes_downloaded(7);
        tunnel.close();
        assert_eq!(monitor.total_bytes_uploaded(), 8);
        assert_eq!(monitor.total_bytes_downloaded(), 7);
    }

    #[test]
    fn close_removes_tunnel_from_registry() {
        let monitor = AppMonitor::new(true);
        let tunnel = open(&monitor);
        assert_eq!(monitor.active_tunnels(), 1);
        tunnel.close();
        assert_eq!(monitor.active_tunnels(), 0);
    }

    #[test]
    fn errors_count_per_upstream() {
        let monitor = AppMonitor::new(true);
        monitor.add_error("u1");
        monitor.add_error("u1");
        monitor.add_error("u2");
        assert_eq!(monitor.error_count("u1"), 2);
        assert_eq!(monitor.error_count("u2"), 1);
        assert_eq!(monitor.error_count("u3"), 0);
    }

    #[test]
    fn disabled_monitor_is_inert() {
        let monitor = AppMonitor::new(false);
        let tunnel = open(&monitor);
        tunnel.inc_bytes_uploaded(5);
        assert_eq!(monitor.active_tunnels(), 0);
        monitor.add_error("u1");
        assert_eq!(monitor.error_count("u1"), 0);
        tunnel.close();
        assert_eq!(monitor.total_bytes_uploaded(), 0);
    }
}
