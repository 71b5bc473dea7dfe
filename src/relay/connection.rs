//! Connection Lifecycle Manager
//!
//! Owns the broker connection handle and its state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected | Failed
//!   ^                              |
//!   +---- Disconnected/Suspended <-+  (link dropped)
//! ```
//!
//! Every connect attempt gets a fresh epoch. Transport events tagged with
//! an older epoch belong to a connection that was closed or replaced and
//! are ignored.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::clock::millis;
use crate::config::ReconnectConfig;
use crate::transport::{Connection, LinkState};

/// Relay connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Suspended,
    Failed,
}

impl ConnectionState {
    /// Value exported on the connection state gauge
    pub fn as_gauge(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Suspended => 3,
            ConnectionState::Failed => 4,
        }
    }

    /// Whether the supervisor may start a new attempt from this state
    pub fn is_down(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Suspended | ConnectionState::Failed
        )
    }
}

impl From<LinkState> for ConnectionState {
    fn from(state: LinkState) -> Self {
        match state {
            LinkState::Connected => ConnectionState::Connected,
            LinkState::Disconnected => ConnectionState::Disconnected,
            LinkState::Suspended => ConnectionState::Suspended,
            LinkState::Failed => ConnectionState::Failed,
        }
    }
}

/// Reconnect delay after `attempts` tries
///
/// `min(max_delay, base_delay * 2^min(attempts / 3, max_exponent))`
pub fn backoff_delay(config: &ReconnectConfig, attempts: u32) -> Duration {
    let exponent = (attempts / 3).min(config.max_exponent).min(31);
    config
        .base_delay
        .saturating_mul(1u32 << exponent)
        .min(config.max_delay)
}

/// Connection handle and state, each behind its own lock
pub struct ConnectionManager {
    config: ReconnectConfig,
    state: RwLock<ConnectionState>,
    handle: Mutex<Option<Arc<dyn Connection>>>,
    epoch: AtomicU64,
    attempts: AtomicU64,
    /// Earliest time the supervisor may retry
    retry_at_ms: AtomicU64,
    /// Closed by the caller; the supervisor leaves it down until the next start
    held: AtomicBool,
}

impl ConnectionManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: RwLock::new(ConnectionState::Disconnected),
            handle: Mutex::new(None),
            epoch: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            retry_at_ms: AtomicU64::new(0),
            held: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    pub fn attempts(&self) -> u32 {
        u32::try_from(self.attempts.load(Ordering::SeqCst)).unwrap_or(u32::MAX)
    }

    /// Move to Connecting unless an attempt is already running or up
    ///
    /// Returns the epoch of the new attempt. The check and the transition
    /// happen under the state lock, so concurrent callers cannot both win.
    pub fn begin_connect(&self) -> Option<u64> {
        let mut state = self.state.write();
        if matches!(
            *state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return None;
        }
        *state = ConnectionState::Connecting;
        Some(self.epoch.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Count one connect attempt
    pub fn record_attempt(&self) -> u32 {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        u32::try_from(n).unwrap_or(u32::MAX)
    }

    /// Install a fresh connection for `epoch`
    ///
    /// Fails (returning the handle) if the attempt was superseded.
    pub fn install(
        &self,
        epoch: u64,
        connection: Arc<dyn Connection>,
    ) -> Result<(), Arc<dyn Connection>> {
        let mut state = self.state.write();
        if !self.is_current(epoch) {
            return Err(connection);
        }
        *self.handle.lock() = Some(connection);
        *state = ConnectionState::Connected;
        self.attempts.store(0, Ordering::SeqCst);
        self.retry_at_ms.store(0, Ordering::SeqCst);
        info!("Connected (epoch {})", epoch);
        Ok(())
    }

    /// Current connection, if any
    pub fn handle(&self) -> Option<Arc<dyn Connection>> {
        self.handle.lock().clone()
    }

    /// Detach the shared handle and invalidate the epoch
    ///
    /// Operations started after this fail fast; the caller closes the
    /// returned handle off the hot path.
    pub fn take(&self, next: ConnectionState) -> Option<Arc<dyn Connection>> {
        let mut state = self.state.write();
        let handle = self.handle.lock().take();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if *state != next {
            debug!("Connection state {:?} -> {:?}", *state, next);
        }
        *state = next;
        handle
    }

    /// A transport event for `epoch` reported a drop
    pub fn drop_link(&self, epoch: u64, next: ConnectionState) -> Option<Option<Arc<dyn Connection>>> {
        if !self.is_current(epoch) {
            return None;
        }
        Some(self.take(next))
    }

    /// An attempt for `epoch` failed
    pub fn fail_attempt(&self, epoch: u64) -> bool {
        let mut state = self.state.write();
        if !self.is_current(epoch) {
            return false;
        }
        *state = ConnectionState::Failed;
        true
    }

    /// Schedule the next retry using the current attempt count
    pub fn schedule_retry(&self, now_ms: u64) -> Duration {
        let delay = backoff_delay(&self.config, self.attempts());
        self.retry_at_ms
            .store(now_ms.saturating_add(millis(delay)), Ordering::SeqCst);
        delay
    }

    /// Whether the supervisor should start a new attempt now
    pub fn due_for_retry(&self, now_ms: u64) -> bool {
        !self.is_held()
            && self.state().is_down()
            && now_ms >= self.retry_at_ms.load(Ordering::SeqCst)
    }

    /// Keep the connection down until [`release_hold`](Self::release_hold)
    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release_hold(&self) {
        self.held.store(false, Ordering::SeqCst);
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn reset_backoff(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.retry_at_ms.store(0, Ordering::SeqCst);
    }
}
