//! Reconnect supervisor
//!
//! Wakes on a fixed interval and:
//! - starts a new connect attempt once the backoff delay has passed
//! - retries channels whose subscribe failed
//! - sweeps the per-sender tables and reclaims idle channels

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::connection::ConnectionState;
use super::dispatch::Command;
use super::Inner;
use crate::clock::millis;

/// Shortest wake-up period the supervisor accepts
pub(crate) const MIN_PERIOD: Duration = Duration::from_millis(100);

/// Configured interval, raised to [`MIN_PERIOD`]
pub(crate) fn period(configured: Duration) -> Duration {
    configured.max(MIN_PERIOD)
}

pub(crate) async fn run(inner: Arc<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if inner.is_shutting_down() {
            break;
        }
        inner.supervise_once();
    }

    debug!("Supervisor stopped");
}

impl Inner {
    pub(super) fn supervise_once(&self) {
        if self.is_shutting_down() {
            return;
        }
        let now_ms = self.clock.now_millis();
        let session = self.session();

        if let Some(session) = &session {
            match self.connection.state() {
                ConnectionState::Connected => {
                    for topic in self.registry.failed_topics() {
                        if self.registry.retry(&topic) {
                            debug!("Retrying subscribe to '{}'", topic);
                            self.enqueue(Command::Subscribe { topic });
                        }
                    }
                }
                ConnectionState::Connecting => {}
                _ => {
                    if self.connection.due_for_retry(now_ms) {
                        self.start(&session.identity);
                    }
                }
            }
        }

        if now_ms >= self.next_sweep_ms.load(Ordering::SeqCst) {
            self.next_sweep_ms.store(
                now_ms.saturating_add(millis(self.config.limits.sweep_interval)),
                Ordering::SeqCst,
            );
            self.filter.cleanup();
            let keep = session
                .as_ref()
                .map(|s| s.topics())
                .unwrap_or_default();
            self.reclaim(self.config.limits.idle_reclaim, &keep);
        }

        self.refresh_gauges();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_never_below_floor() {
        assert_eq!(period(Duration::ZERO), MIN_PERIOD);
        assert_eq!(period(Duration::from_millis(5)), MIN_PERIOD);
        assert_eq!(period(Duration::from_secs(10)), Duration::from_secs(10));
    }
}
