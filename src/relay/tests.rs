//! Relay core tests against the in-memory broker

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::*;
use crate::clock::ManualClock;
use crate::transport::{LinkState, MemoryBroker, TransportError, TransportEvent};

#[derive(Default)]
struct RecordingSink {
    routed: Mutex<Vec<RoutedMessage>>,
    notifications: Mutex<Vec<(String, Severity)>>,
}

impl HostSink for RecordingSink {
    fn on_routed_message(&self, message: RoutedMessage) {
        self.routed.lock().push(message);
    }

    fn on_notification(&self, message: &str, severity: Severity) {
        self.notifications.lock().push((message.to_string(), severity));
    }
}

struct Fixture {
    core: RelayCore,
    broker: MemoryBroker,
    sink: Arc<RecordingSink>,
    clock: Arc<ManualClock>,
}

fn fixture() -> Fixture {
    let broker = MemoryBroker::new();
    let sink = Arc::new(RecordingSink::default());
    let clock = Arc::new(ManualClock::new(1_000));
    let core = RelayCore::builder(
        RelayConfig::default(),
        Arc::new(broker.clone()),
        sink.clone(),
    )
    .clock(clock.clone())
    .without_supervisor()
    .build();

    Fixture {
        core,
        broker,
        sink,
        clock,
    }
}

/// Broker publishes other than presence traffic
fn chat_published(broker: &MemoryBroker) -> Vec<(String, bytes::Bytes)> {
    broker
        .published()
        .into_iter()
        .filter(|(topic, _)| !topic.starts_with("pr:"))
        .collect()
}

async fn logged_in() -> Fixture {
    let f = fixture();
    f.core.on_login_state_changed("Bob", 301, "<img=2>");
    f.core.flush().await;
    f
}

#[tokio::test]
async fn test_login_attaches_session_topics() {
    let f = logged_in().await;

    assert_eq!(f.core.connection_state(), ConnectionState::Connected);
    assert!(f.core.is_connected());
    assert_eq!(f.broker.subscribe_count("w:301"), 1);
    assert_eq!(f.broker.subscribe_count("p:Bob"), 1);
    assert_eq!(f.broker.subscribe_count("pr:301"), 1);
    assert_eq!(f.broker.connect_count(), 1);

    let status = f.core.snapshot_status();
    assert_eq!(status.len(), 3);
    assert!(status.values().all(|active| *active));
    assert_eq!(f.core.metrics().connection_state.get(), 2);
    assert_eq!(f.core.metrics().channels_active.get(), 3);
}

#[tokio::test]
async fn test_start_is_noop_while_connected() {
    let f = logged_in().await;
    f.core.start("Bob");
    f.core.flush().await;
    assert_eq!(f.broker.connect_count(), 1);
}

#[tokio::test]
async fn test_report_is_gated_per_partition() {
    let f = logged_in().await;

    f.core
        .inner
        .report(RelayError::TransportConnect(TransportError::Timeout));
    f.core
        .inner
        .report(RelayError::TransportConnect(TransportError::Timeout));
    assert_eq!(f.sink.notifications.lock().len(), 1);

    f.clock.advance(Duration::from_secs(30 * 60));
    f.core
        .inner
        .report(RelayError::TransportConnect(TransportError::Timeout));

    let notes = f.sink.notifications.lock();
    assert_eq!(notes.len(), 2);
    assert_eq!(notes[0].1, Severity::Error);
    assert_eq!(f.core.metrics().notifications_total.get(), 2);
}

#[tokio::test]
async fn test_capacity_errors_get_capacity_message() {
    let f = logged_in().await;
    f.core.inner.report(RelayError::Publish {
        topic: "w:301".to_string(),
        source: TransportError::Rejected {
            code: Some(42910),
            message: "Rate limit exceeded".to_string(),
        },
    });

    let notes = f.sink.notifications.lock();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].0, ErrorClass::Capacity.user_message());
    assert_eq!(notes[0].1, Severity::Warning);
}

#[tokio::test]
async fn test_validation_and_parse_errors_never_notify() {
    let f = logged_in().await;
    f.core
        .inner
        .report(RelayError::Validation(Rejection::RateLimited));
    f.core.inner.report(RelayError::Parse("bad json".to_string()));
    assert!(f.sink.notifications.lock().is_empty());
}

#[tokio::test]
async fn test_link_drop_marks_pending_until_reconnect() {
    let f = logged_in().await;

    f.broker.drop_all_links(
        LinkState::Disconnected,
        Some(TransportError::ConnectionLost("reset by peer".to_string())),
    );
    f.core.flush().await;

    assert_eq!(f.core.connection_state(), ConnectionState::Disconnected);
    assert!(!f.core.is_connected());
    assert!(f.core.snapshot_status().values().all(|active| !active));
    assert_eq!(f.sink.notifications.lock().len(), 1);

    // Not yet due: first retry waits the base delay
    f.core.tick();
    assert_eq!(f.core.connection_state(), ConnectionState::Disconnected);

    f.clock.advance(Duration::from_secs(10));
    f.core.tick();
    assert_eq!(f.core.connection_state(), ConnectionState::Connecting);
    f.core.flush().await;

    assert!(f.core.is_connected());
    assert_eq!(f.broker.connect_count(), 2);
    assert_eq!(f.broker.subscribe_count("w:301"), 2);
    assert_eq!(f.broker.subscribe_count("p:Bob"), 2);
}

#[tokio::test]
async fn test_events_from_closed_connection_are_ignored() {
    let f = logged_in().await;
    let stale = f.core.inner.connection.epoch() - 1;

    f.core
        .inner
        .events
        .send(TransportEvent::StateChanged {
            epoch: stale,
            state: LinkState::Failed,
            error: Some(TransportError::Timeout),
        })
        .unwrap();
    f.core.flush().await;

    assert!(f.core.is_connected());
    assert!(f.sink.notifications.lock().is_empty());
}

#[tokio::test]
async fn test_failed_subscribe_is_retried_by_supervisor() {
    let f = logged_in().await;
    f.broker.fail_subscribe(
        "c:Iron Men",
        TransportError::Rejected {
            code: Some(40160),
            message: "not permitted".to_string(),
        },
    );

    f.core.on_clan_changed(Some("Iron Men"));
    f.core.flush().await;

    assert_eq!(f.core.snapshot_status().get("c:Iron Men"), Some(&false));
    assert!(!f.core.is_connected());
    assert_eq!(f.sink.notifications.lock().len(), 1);

    f.broker.clear_faults();
    f.core.tick();
    f.core.flush().await;

    assert_eq!(f.core.snapshot_status().get("c:Iron Men"), Some(&true));
    assert!(f.core.is_connected());
    assert_eq!(f.broker.subscribe_count("c:Iron Men"), 2);
}

#[tokio::test]
async fn test_sweep_reclaims_idle_channels_but_keeps_session_topics() {
    let f = logged_in().await;
    let extra = TopicId::parse("f:Someone").unwrap();
    f.core.subscribe(&extra);
    f.core.flush().await;
    assert_eq!(f.broker.subscribers("f:Someone"), 1);

    f.clock.advance(Duration::from_secs(6 * 60));
    f.core.tick();
    f.core.flush().await;

    assert_eq!(f.broker.unsubscribe_count("f:Someone"), 1);
    assert_eq!(f.broker.subscribers("f:Someone"), 0);
    assert!(!f.core.snapshot_status().contains_key("f:Someone"));
    assert_eq!(f.core.snapshot_status().len(), 3);
    assert_eq!(f.core.metrics().channels_reclaimed_total.get(), 1);
}

#[tokio::test]
async fn test_unsubscribe_without_connection_removes_immediately() {
    let f = fixture();
    let topic = TopicId::parse("c:Clan").unwrap();
    f.core.subscribe(&topic);
    assert_eq!(f.core.snapshot_status().get("c:Clan"), Some(&false));

    f.core.unsubscribe(&topic);
    assert!(f.core.snapshot_status().is_empty());
    f.core.flush().await;
    assert_eq!(f.broker.subscribe_count("c:Clan"), 0);
}

#[tokio::test]
async fn test_update_prefs_clamps_combat_level() {
    let f = fixture();
    f.core.update_prefs(DisplayPrefs {
        read_only: true,
        hide_spam: false,
        min_combat_level: 500,
    });
    assert_eq!(f.core.prefs().min_combat_level, 126);
    assert!(f.core.prefs().read_only);

    f.core.update_prefs(DisplayPrefs {
        min_combat_level: 0,
        ..DisplayPrefs::default()
    });
    assert_eq!(f.core.prefs().min_combat_level, 3);
}

#[tokio::test]
async fn test_shutdown_drains_queued_publish_then_rejects() {
    let f = logged_in().await;

    let receipt = f
        .core
        .publish(MessageKind::World, "bye all", TopicId::world(301), None)
        .unwrap();
    f.core.shutdown().await;

    assert!(receipt.outcome().await);
    assert_eq!(chat_published(&f.broker).len(), 1);
    // Enter at login, leave on the way out
    let presence: Vec<String> = f
        .broker
        .published()
        .into_iter()
        .map(|(topic, _)| topic)
        .filter(|topic| topic.starts_with("pr:"))
        .collect();
    assert_eq!(presence, vec!["pr:301", "pr:301"]);
    assert_eq!(f.broker.open_links(), 0);
    assert_eq!(f.core.connection_state(), ConnectionState::Disconnected);

    f.clock.advance(Duration::from_secs(1));
    assert_eq!(
        f.core
            .publish(MessageKind::World, "again", TopicId::world(301), None)
            .err(),
        Some(Rejection::ShuttingDown)
    );
}

#[tokio::test]
async fn test_stats_reports_tables() {
    let f = logged_in().await;
    f.core
        .on_local_message_composed(MessageKind::World, "hello", "Bob", None, None)
        .unwrap();
    f.core.flush().await;

    let stats = f.core.stats();
    assert_eq!(stats.state, ConnectionState::Connected);
    assert_eq!(stats.reconnect_attempts, 0);
    assert_eq!(stats.channels.len(), 3);
    assert_eq!(stats.presence_members, 0);
    assert_eq!(stats.filter.rate_limited_senders, 1);
    assert_eq!(stats.filter.dedup_entries, 1);
}

#[tokio::test]
async fn test_zero_supervisor_interval_does_not_kill_supervisor() {
    let broker = MemoryBroker::new();
    let mut config = RelayConfig::default();
    config.reconnect.supervisor_interval = Duration::ZERO;
    let core = RelayCore::builder(
        config,
        Arc::new(broker.clone()),
        Arc::new(RecordingSink::default()),
    )
    .build();

    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let finished = core
        .supervisor
        .lock()
        .as_ref()
        .map(|handle| handle.is_finished());
    assert_eq!(finished, Some(false));
    core.shutdown().await;
}
