//! Prometheus metrics for the relay
//!
//! Each core owns its own registry; hosts scrape it through
//! [`RelayMetrics::gather`] and expose it however they like.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// All relay metrics in one place
#[derive(Clone)]
pub struct RelayMetrics {
    pub registry: Registry,

    // Outbound
    pub published_total: IntCounter,
    pub publish_failures_total: IntCounter,
    pub publish_rejected_total: IntCounterVec,

    // Inbound
    pub received_total: IntCounter,
    pub dropped_total: IntCounterVec,
    pub routed_total: IntCounterVec,

    // Connection
    pub reconnect_attempts_total: IntCounter,
    pub connection_state: IntGauge,
    pub notifications_total: IntCounter,

    // Channels
    pub channels_active: IntGauge,
    pub channels_reclaimed_total: IntCounter,
}

impl RelayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let published_total = IntCounter::with_opts(Opts::new(
            "chatrelay_published_total",
            "Messages handed to the broker successfully",
        ))
        .unwrap();

        let publish_failures_total = IntCounter::with_opts(Opts::new(
            "chatrelay_publish_failures_total",
            "Accepted messages the broker did not take",
        ))
        .unwrap();

        let publish_rejected_total = IntCounterVec::new(
            Opts::new(
                "chatrelay_publish_rejected_total",
                "Outbound messages refused before dispatch, by reason",
            ),
            &["reason"],
        )
        .unwrap();

        let received_total = IntCounter::with_opts(Opts::new(
            "chatrelay_received_total",
            "Inbound messages delivered by the broker",
        ))
        .unwrap();

        let dropped_total = IntCounterVec::new(
            Opts::new(
                "chatrelay_dropped_total",
                "Inbound messages dropped by the receive pipeline, by reason",
            ),
            &["reason"],
        )
        .unwrap();

        let routed_total = IntCounterVec::new(
            Opts::new(
                "chatrelay_routed_total",
                "Inbound messages handed to the host, by display category",
            ),
            &["category"],
        )
        .unwrap();

        let reconnect_attempts_total = IntCounter::with_opts(Opts::new(
            "chatrelay_reconnect_attempts_total",
            "Connect attempts made by the supervisor",
        ))
        .unwrap();

        let connection_state = IntGauge::with_opts(Opts::new(
            "chatrelay_connection_state",
            "0=disconnected 1=connecting 2=connected 3=suspended 4=failed",
        ))
        .unwrap();

        let notifications_total = IntCounter::with_opts(Opts::new(
            "chatrelay_notifications_total",
            "User-visible error notifications shown",
        ))
        .unwrap();

        let channels_active = IntGauge::with_opts(Opts::new(
            "chatrelay_channels_active",
            "Channels currently attached",
        ))
        .unwrap();

        let channels_reclaimed_total = IntCounter::with_opts(Opts::new(
            "chatrelay_channels_reclaimed_total",
            "Idle channels detached by the sweep",
        ))
        .unwrap();

        registry
            .register(Box::new(published_total.clone()))
            .unwrap();
        registry
            .register(Box::new(publish_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(publish_rejected_total.clone()))
            .unwrap();
        registry.register(Box::new(received_total.clone())).unwrap();
        registry.register(Box::new(dropped_total.clone())).unwrap();
        registry.register(Box::new(routed_total.clone())).unwrap();
        registry
            .register(Box::new(reconnect_attempts_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connection_state.clone()))
            .unwrap();
        registry
            .register(Box::new(notifications_total.clone()))
            .unwrap();
        registry
            .register(Box::new(channels_active.clone()))
            .unwrap();
        registry
            .register(Box::new(channels_reclaimed_total.clone()))
            .unwrap();

        Self {
            registry,
            published_total,
            publish_failures_total,
            publish_rejected_total,
            received_total,
            dropped_total,
            routed_total,
            reconnect_attempts_total,
            connection_state,
            notifications_total,
            channels_active,
            channels_reclaimed_total,
        }
    }

    pub fn publish_rejected(&self, reason: &str) {
        self.publish_rejected_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn publish_finished(&self, ok: bool) {
        if ok {
            self.published_total.inc();
        } else {
            self.publish_failures_total.inc();
        }
    }

    pub fn dropped(&self, reason: &str) {
        self.dropped_total.with_label_values(&[reason]).inc();
    }

    pub fn routed(&self, category: &str) {
        self.routed_total.with_label_values(&[category]).inc();
    }

    /// Text exposition of every metric
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = RelayMetrics::new();
        assert_eq!(metrics.published_total.get(), 0);
        assert_eq!(metrics.channels_active.get(), 0);
    }

    #[test]
    fn test_labelled_counters() {
        let metrics = RelayMetrics::new();
        metrics.publish_rejected("spam");
        metrics.publish_rejected("spam");
        metrics.dropped("duplicate");
        metrics.routed("world");

        assert_eq!(
            metrics
                .publish_rejected_total
                .with_label_values(&["spam"])
                .get(),
            2
        );
        assert_eq!(
            metrics.dropped_total.with_label_values(&["duplicate"]).get(),
            1
        );
    }

    #[test]
    fn test_gather_renders_text() {
        let metrics = RelayMetrics::new();
        metrics.publish_finished(true);
        metrics.publish_finished(false);

        let text = metrics.gather();
        assert!(text.contains("chatrelay_published_total 1"));
        assert!(text.contains("chatrelay_publish_failures_total 1"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = RelayMetrics::new();
        let b = RelayMetrics::new();
        a.received_total.inc();
        assert_eq!(b.received_total.get(), 0);
    }
}
