// ── Connection supervisor policy ──
//
// Reconnect configuration, backoff calculation and the scheduler state
// machine that guarantees at most one pending reconnect at a time. The
// session's event loop owns the actual timer; this module only decides
// whether and when it should exist.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── ReconnectConfig ──────────────────────────────────────────────────

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum BackoffStrategy {
    /// Wait `initial_delay` before every attempt.
    Fixed,
    /// Double from `initial_delay` up to `max_delay`, with jitter.
    #[default]
    Exponential,
}

/// Backoff configuration for reconnecting after an unexpected close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Reconnect at all. Default: true.
    pub enabled: bool,

    pub strategy: BackoffStrategy,

    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum consecutive attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: BackoffStrategy::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Delay before reconnect attempt number `attempt` (zero-based).
///
/// Exponential: `min(initial * 2^attempt, max)` scaled by a deterministic
/// +-25% jitter, never above `max`. Fixed: always `initial`.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let max = config.max_delay.as_secs_f64();
    match config.strategy {
        BackoffStrategy::Fixed => config.initial_delay.min(config.max_delay),
        BackoffStrategy::Exponential => {
            let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
            let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
            let capped = base.min(max);

            // Seeded from the attempt number so clients spread out without
            // needing a random source.
            let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
            let with_jitter = (capped * jitter_factor).clamp(0.0, max);

            Duration::from_secs_f64(with_jitter)
        }
    }
}

// ── ReconnectScheduler ───────────────────────────────────────────────

/// Tracks whether a reconnect is scheduled and how many have been tried.
///
/// Repeated disconnect notifications before the timer fires never stack:
/// only the first one yields a delay.
#[derive(Debug, Clone)]
pub struct ReconnectScheduler {
    config: ReconnectConfig,
    attempt: u32,
    scheduled: bool,
    closed: bool,
}

impl ReconnectScheduler {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: 0,
            scheduled: false,
            closed: false,
        }
    }

    /// A channel closed unexpectedly. Returns the delay to wait before the
    /// next attempt, or `None` if no new timer should be started.
    pub fn on_disconnect(&mut self) -> Option<Duration> {
        if self.closed || !self.config.enabled || self.scheduled {
            return None;
        }
        if self
            .config
            .max_retries
            .is_some_and(|max| self.attempt >= max)
        {
            tracing::error!(
                max_retries = self.attempt,
                "reconnection limit reached, giving up"
            );
            return None;
        }
        self.scheduled = true;
        Some(calculate_backoff(self.attempt, &self.config))
    }

    /// The reconnect timer fired. Returns the one-based attempt number.
    pub fn on_timer_fired(&mut self) -> u32 {
        self.scheduled = false;
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }

    /// A channel opened; the next outage starts from the first delay again.
    pub fn on_connected(&mut self) {
        self.attempt = 0;
        self.scheduled = false;
    }

    /// Manual close: cancel any pending timer and refuse new ones.
    pub fn close(&mut self) {
        self.closed = true;
        self.scheduled = false;
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    /// Attempts made since the last successful connect.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
