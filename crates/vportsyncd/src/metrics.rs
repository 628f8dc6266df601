//! Prometheus metrics collection for vportsyncd
//!
//! Counts device events and the outcome of every step the dispatcher takes,
//! exposed via the `/metrics` endpoint.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Prometheus metrics collector for vportsyncd
#[derive(Clone)]
pub struct MetricsCollector {
    // Counters
    events: CounterVec,
    unmanaged_events: Counter,
    vports_detached: Counter,
    notifications_sent: Counter,
    notifications_dropped: Counter,
    build_failures: Counter,
    sysfs_resyncs: Counter,
    sysfs_failures: Counter,

    // Gauges
    ports: Gauge,
    netlink_connected: Gauge,

    // Histograms
    event_latency_seconds: Histogram,

    registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events = CounterVec::new(
            Opts::new("vportsyncd_events_total", "Device events received by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(events.clone()))?;

        let unmanaged_events = Counter::new(
            "vportsyncd_unmanaged_events_total",
            "Device events for interfaces without a vport",
        )?;
        registry.register(Box::new(unmanaged_events.clone()))?;

        let vports_detached = Counter::new(
            "vportsyncd_vports_detached_total",
            "Vports detached after their device was unregistered",
        )?;
        registry.register(Box::new(vports_detached.clone()))?;

        let notifications_sent = Counter::new(
            "vportsyncd_notifications_sent_total",
            "Vport notifications delivered to at least one listener",
        )?;
        registry.register(Box::new(notifications_sent.clone()))?;

        let notifications_dropped = Counter::new(
            "vportsyncd_notifications_dropped_total",
            "Vport notifications that reached no listener",
        )?;
        registry.register(Box::new(notifications_dropped.clone()))?;

        let build_failures = Counter::new(
            "vportsyncd_build_failures_total",
            "Vport notifications that could not be built",
        )?;
        registry.register(Box::new(build_failures.clone()))?;

        let sysfs_resyncs = Counter::new(
            "vportsyncd_sysfs_resyncs_total",
            "Sysfs entries re-created after an interface rename",
        )?;
        registry.register(Box::new(sysfs_resyncs.clone()))?;

        let sysfs_failures = Counter::new(
            "vportsyncd_sysfs_failures_total",
            "Sysfs entries that could not be re-created",
        )?;
        registry.register(Box::new(sysfs_failures.clone()))?;

        let ports = Gauge::new("vportsyncd_ports", "Vports attached to the datapath")?;
        registry.register(Box::new(ports.clone()))?;

        let netlink_connected = Gauge::new(
            "vportsyncd_netlink_connected",
            "Netlink socket status (1=open, 0=closed)",
        )?;
        registry.register(Box::new(netlink_connected.clone()))?;

        let event_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "vportsyncd_event_latency_seconds",
                "Device event handling latency in seconds",
            )
            .buckets(vec![0.00001, 0.0001, 0.001, 0.01, 0.1]),
        )?;
        registry.register(Box::new(event_latency_seconds.clone()))?;

        Ok(Self {
            events,
            unmanaged_events,
            vports_detached,
            notifications_sent,
            notifications_dropped,
            build_failures,
            sysfs_resyncs,
            sysfs_failures,
            ports,
            netlink_connected,
            event_latency_seconds,
            registry: Arc::new(registry),
        })
    }

    /// Record a received device event
    pub fn record_event(&self, kind: &str) {
        self.events.with_label_values(&[kind]).inc();
    }

    pub fn record_unmanaged(&self) {
        self.unmanaged_events.inc();
    }

    pub fn record_detach(&self) {
        self.vports_detached.inc();
    }

    pub fn record_notification_sent(&self) {
        self.notifications_sent.inc();
    }

    pub fn record_notification_dropped(&self) {
        self.notifications_dropped.inc();
    }

    pub fn record_build_failure(&self) {
        self.build_failures.inc();
    }

    pub fn record_sysfs_resync(&self) {
        self.sysfs_resyncs.inc();
    }

    pub fn record_sysfs_failure(&self) {
        self.sysfs_failures.inc();
    }

    /// Set attached port count
    pub fn set_ports(&self, count: usize) {
        self.ports.set(count as f64);
    }

    /// Set netlink socket status
    pub fn set_netlink_connected(&self, connected: bool) {
        self.netlink_connected
            .set(if connected { 1.0 } else { 0.0 });
    }

    /// Start event latency timer
    pub fn start_event_latency(&self) -> prometheus::HistogramTimer {
        self.event_latency_seconds.start_timer()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = vec![];
        encoder.encode(&self.registry.gather(), &mut buf).ok();
        String::from_utf8(buf).unwrap_or_else(|_| String::from("# Error encoding metrics\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        assert!(MetricsCollector::new().is_ok());
    }

    #[test]
    fn test_record_event_by_kind() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_event("unregister");
        collector.record_event("unregister");
        collector.record_event("changename");
        let metrics = collector.gather_metrics();
        assert!(metrics.contains("vportsyncd_events_total{kind=\"unregister\"} 2"));
        assert!(metrics.contains("vportsyncd_events_total{kind=\"changename\"} 1"));
    }

    #[test]
    fn test_record_outcomes() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_detach();
        collector.record_build_failure();
        collector.record_notification_dropped();
        let metrics = collector.gather_metrics();
        assert!(metrics.contains("vportsyncd_vports_detached_total 1"));
        assert!(metrics.contains("vportsyncd_build_failures_total 1"));
        assert!(metrics.contains("vportsyncd_notifications_dropped_total 1"));
        assert!(metrics.contains("vportsyncd_notifications_sent_total 0"));
    }

    #[test]
    fn test_set_ports() {
        let collector = MetricsCollector::new().unwrap();
        collector.set_ports(12);
        assert!(collector.gather_metrics().contains("vportsyncd_ports 12"));
    }

    #[test]
    fn test_set_netlink_connected() {
        let collector = MetricsCollector::new().unwrap();
        collector.set_netlink_connected(true);
        assert!(collector.gather_metrics().contains("vportsyncd_netlink_connected 1"));
    }

    #[test]
    fn test_event_latency_histogram() {
        let collector = MetricsCollector::new().unwrap();
        drop(collector.start_event_latency());
        assert!(collector
            .gather_metrics()
            .contains("vportsyncd_event_latency_seconds_bucket"));
    }
}
