//! Keepalive watchdog for a client connection.
//!
//! The monitor is a plain state machine driven by timestamps. The connection
//! records transitions as they happen and polls it on a timer; the poll says
//! whether the connection should be reopened or force-closed.

use cable_core::Backoff;
use std::time::Duration;
use tokio::time::Instant;

/// Connection state as seen by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// No usable transport.
    Disconnected,
    /// A transport was opened and the welcome has not arrived yet.
    Connecting,
    /// Welcome received.
    Connected,
}

/// What the connection must do after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    /// Nothing to do.
    None,
    /// Open a fresh transport.
    Reopen,
    /// The transport is stale: close it and treat the connection as lost.
    ForceClose,
}

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between polls.
    pub poll_interval: Duration,
    /// Interval at which the server sends pings.
    pub ping_interval: Duration,
    /// Delay schedule between reconnect attempts.
    pub reconnect_backoff: Backoff,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            ping_interval: Duration::from_secs(3),
            reconnect_backoff: Backoff::new(Duration::from_secs(3), Duration::from_secs(30))
                .with_jitter(0.15),
        }
    }
}

impl MonitorConfig {
    /// Silence after which a connected transport is presumed dead:
    /// `max(3 * ping_interval, ping_interval + 5s)`.
    pub fn stale_threshold(&self) -> Duration {
        (self.ping_interval * 3).max(self.ping_interval + Duration::from_secs(5))
    }
}

/// Liveness tracker for one client connection.
#[derive(Debug, Clone)]
pub struct ConnectionMonitor {
    config: MonitorConfig,
    state: MonitorState,
    running: bool,
    pinged_at: Option<Instant>,
    connected_at: Option<Instant>,
    connecting_at: Option<Instant>,
    disconnected_at: Option<Instant>,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
}

impl ConnectionMonitor {
    /// Create a stopped monitor in the disconnected state.
    pub fn new(config: MonitorConfig) -> Self {
        let reconnect_delay = config.reconnect_backoff.delay_for_attempt(0);
        Self {
            config,
            state: MonitorState::Disconnected,
            running: false,
            pinged_at: None,
            connected_at: None,
            connecting_at: None,
            disconnected_at: None,
            reconnect_attempts: 0,
            reconnect_delay,
        }
    }

    /// Monitor configuration.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Begin supervising. Returns false if already running.
    pub fn start(&mut self) -> bool {
        if self.running {
            return false;
        }
        self.running = true;
        true
    }

    /// Stop supervising. Polls become no-ops.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Whether the monitor is supervising.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Current state.
    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Reconnect attempts since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Delay before the next reconnect attempt.
    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    /// Time of the last ping.
    pub fn pinged_at(&self) -> Option<Instant> {
        self.pinged_at
    }

    /// Time of the last successful connect.
    pub fn connected_at(&self) -> Option<Instant> {
        self.connected_at
    }

    /// Time of the last disconnect.
    pub fn disconnected_at(&self) -> Option<Instant> {
        self.disconnected_at
    }

    /// A transport is being opened.
    pub fn record_connecting(&mut self, now: Instant) {
        self.state = MonitorState::Connecting;
        self.connecting_at = Some(now);
    }

    /// The server welcomed the connection.
    pub fn record_connect(&mut self, now: Instant) {
        self.state = MonitorState::Connected;
        self.connected_at = Some(now);
        self.pinged_at = Some(now);
        self.disconnected_at = None;
        self.reconnect_attempts = 0;
        self.reconnect_delay = self.config.reconnect_backoff.delay_for_attempt(0);
    }

    /// The transport closed.
    pub fn record_disconnect(&mut self, now: Instant) {
        self.state = MonitorState::Disconnected;
        self.disconnected_at = Some(now);
        self.reconnect_delay = self
            .config
            .reconnect_backoff
            .delay_for_attempt(self.reconnect_attempts);
    }

    /// A ping arrived.
    pub fn record_ping(&mut self, now: Instant) {
        self.pinged_at = Some(now);
    }

    /// Whether a connected transport has been silent past the threshold.
    pub fn is_stale(&self, now: Instant) -> bool {
        match self.pinged_at.or(self.connected_at) {
            Some(last) => now.saturating_duration_since(last) > self.config.stale_threshold(),
            None => false,
        }
    }

    /// Decide what the connection must do at `now`.
    pub fn poll(&mut self, now: Instant) -> MonitorAction {
        if !self.running {
            return MonitorAction::None;
        }

        match self.state {
            MonitorState::Connected => {
                if self.is_stale(now) {
                    self.record_disconnect(now);
                    MonitorAction::ForceClose
                } else {
                    MonitorAction::None
                }
            }
            MonitorState::Disconnected => match self.disconnected_at {
                Some(at) if now.saturating_duration_since(at) >= self.reconnect_delay => {
                    self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
                    self.record_connecting(now);
                    MonitorAction::Reopen
                }
                _ => MonitorAction::None,
            },
            MonitorState::Connecting => match self.connecting_at {
                Some(at) if now.saturating_duration_since(at) > self.config.stale_threshold() => {
                    self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
                    self.record_connecting(now);
                    MonitorAction::Reopen
                }
                _ => MonitorAction::None,
            },
        }
    }
}
