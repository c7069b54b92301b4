//! Push channel health classification and reconnect backoff.
//!
//! ```text
//! Healthy ──closed──▶ Degraded
//!    ▲                   │
//!    │ subscribed     error/timeout
//!    │                   ▼
//!    └──────────────── Failed ──(reconnect)──▶ Healthy
//! ```
//!
//! The tracker is driven only by channel lifecycle signals. Each error or
//! timeout bumps the reconnect attempt and yields a delay of
//! `min(base * 2^attempt, cap)`; once the attempt count exceeds the maximum
//! no further reconnect is scheduled and the caller must rely on polling.

use crate::operation::exponential_delay;
use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// Health classification of the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Failed,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Failed => write!(f, "failed"),
        }
    }
}

/// Lifecycle signal reported by the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Subscribed,
    TimedOut,
    ChannelError,
    Closed,
    Connecting,
}

/// Snapshot of channel health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_connected_at: Option<Timestamp>,
    pub reconnect_attempt: u32,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_connected_at: None,
            reconnect_attempt: 0,
        }
    }
}

/// Reconnect tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
        }
    }
}

/// What the caller should do about reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Nothing to schedule
    None,
    /// Reconnect after the given delay (milliseconds)
    After { delay_ms: u64, attempt: u32 },
    /// The attempt limit was exceeded; stop reconnecting
    GiveUp { attempts: u32 },
}

/// A processed lifecycle signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub previous: HealthState,
    pub current: HealthState,
    pub reconnect: ReconnectDecision,
}

impl HealthTransition {
    /// Whether the state changed.
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }

    /// Whether the channel just left the healthy state.
    pub fn left_healthy(&self) -> bool {
        self.previous == HealthState::Healthy && self.current != HealthState::Healthy
    }

    /// Whether the channel just became healthy again.
    pub fn recovered(&self) -> bool {
        self.previous != HealthState::Healthy && self.current == HealthState::Healthy
    }
}

/// State machine classifying push channel health.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionHealthTracker {
    config: BackoffConfig,
    health: ConnectionHealth,
}

impl ConnectionHealthTracker {
    /// Create a tracker in the healthy state.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            health: ConnectionHealth::default(),
        }
    }

    /// Current health snapshot.
    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    /// Backoff configuration.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn state(&self) -> HealthState {
        self.health.state
    }

    pub fn is_healthy(&self) -> bool {
        self.health.state == HealthState::Healthy
    }

    /// Delay for the current reconnect attempt.
    pub fn get_reconnect_delay(&self) -> u64 {
        exponential_delay(
            self.config.base_delay_ms,
            self.config.max_delay_ms,
            self.health.reconnect_attempt,
        )
    }

    /// Whether the attempt count has exceeded the configured maximum.
    pub fn has_max_reconnect_attempts_reached(&self) -> bool {
        self.health.reconnect_attempt > self.config.max_reconnect_attempts
    }

    /// Process a lifecycle signal observed at `now`.
    pub fn observe(&mut self, status: ChannelStatus, now: Timestamp) -> HealthTransition {
        let previous = self.health.state;

        let reconnect = match status {
            ChannelStatus::Subscribed => {
                self.health.state = HealthState::Healthy;
                self.health.consecutive_failures = 0;
                self.health.reconnect_attempt = 0;
                self.health.consecutive_successes =
                    self.health.consecutive_successes.saturating_add(1);
                self.health.last_connected_at = Some(now);
                ReconnectDecision::None
            }
            ChannelStatus::ChannelError | ChannelStatus::TimedOut => {
                self.health.state = HealthState::Failed;
                self.health.consecutive_successes = 0;
                self.health.consecutive_failures =
                    self.health.consecutive_failures.saturating_add(1);
                self.health.reconnect_attempt = self.health.reconnect_attempt.saturating_add(1);

                if self.has_max_reconnect_attempts_reached() {
                    ReconnectDecision::GiveUp {
                        attempts: self.health.reconnect_attempt,
                    }
                } else {
                    ReconnectDecision::After {
                        delay_ms: self.get_reconnect_delay(),
                        attempt: self.health.reconnect_attempt,
                    }
                }
            }
            ChannelStatus::Closed => {
                if self.health.state == HealthState::Healthy {
                    self.health.state = HealthState::Degraded;
                }
                self.health.consecutive_successes = 0;
                ReconnectDecision::None
            }
            ChannelStatus::Connecting => ReconnectDecision::None,
        };

        HealthTransition {
            previous,
            current: self.health.state,
            reconnect,
        }
    }
}
