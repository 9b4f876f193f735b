// Prometheus metrics for the daemon
//
// One private registry (not the prometheus default one) so tests and the
// status server see exactly these families.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    /// 1 while the event stream is open. connection: daemon | subscription
    pub stream_connected: IntGaugeVec,
    /// connection: daemon | subscription
    pub stream_reconnects: IntCounterVec,
    /// result: ok | failed | timeout
    pub keepalive_probes: IntCounterVec,
    /// result: ok | failed | unauthorized
    pub heartbeats: IntCounterVec,
    pub registered_agents: IntGauge,
    /// outcome: delivered | handler_failed | claim_lost | unresolved | inboxed | ignored | error
    pub messages_routed: IntCounterVec,
}

impl Metrics {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("agentlink".to_string()), None)?;

        let stream_connected = IntGaugeVec::new(
            Opts::new("stream_connected", "Whether the bus event stream is open"),
            &["connection"],
        )?;
        let stream_reconnects = IntCounterVec::new(
            Opts::new(
                "stream_reconnects_total",
                "Successful reconnects of the bus event stream",
            ),
            &["connection"],
        )?;
        let keepalive_probes = IntCounterVec::new(
            Opts::new("keepalive_probes_total", "Keepalive probes issued on a silent stream"),
            &["result"],
        )?;
        let heartbeats = IntCounterVec::new(
            Opts::new("heartbeats_total", "Agent heartbeat refreshes"),
            &["result"],
        )?;
        let registered_agents =
            IntGauge::new("registered_agents", "Agents registered by this daemon")?;
        let messages_routed = IntCounterVec::new(
            Opts::new("messages_routed_total", "Inbound messages by routing outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(stream_connected.clone()))?;
        registry.register(Box::new(stream_reconnects.clone()))?;
        registry.register(Box::new(keepalive_probes.clone()))?;
        registry.register(Box::new(heartbeats.clone()))?;
        registry.register(Box::new(registered_agents.clone()))?;
        registry.register(Box::new(messages_routed.clone()))?;

        // The daemon's stream is always reported, connected or not.
        stream_connected.with_label_values(&[DAEMON_CONNECTION]).set(0);

        Ok(Self {
            registry,
            stream_connected,
            stream_reconnects,
            keepalive_probes,
            heartbeats,
            registered_agents,
            messages_routed,
        })
    }

    /// Text exposition of every family in the registry.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// `connection` label of the daemon's own event stream.
pub const DAEMON_CONNECTION: &str = "daemon";
/// `connection` label of a stream owned by a subscription registry.
pub const SUBSCRIPTION_CONNECTION: &str = "subscription";

/// Process-wide metrics.
pub static METRICS: Lazy<Metrics> = Lazy::new(|| {
    // Names and label sets are static; registration can only fail on a
    // duplicate, which a fresh private registry never has.
    Metrics::new().unwrap_or_else(|e| panic!("metric registration failed: {}", e))
});

pub fn record_heartbeat(result: &str) {
    METRICS.heartbeats.with_label_values(&[result]).inc();
}

pub fn record_routed(outcome: &str) {
    METRICS.messages_routed.with_label_values(&[outcome]).inc();
}
