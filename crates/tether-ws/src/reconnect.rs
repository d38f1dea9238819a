//! Retry loop with exponential backoff and symmetric jitter.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tether_core::BackoffPolicy;
use tether_settings::ReconnectSettings;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::WsError;
use crate::metrics::{
    WS_RECONNECT_ATTEMPTS_TOTAL, WS_RECONNECT_FAILURES_TOTAL, WS_RECONNECT_SUCCESS_TOTAL,
    record_error,
};

/// Retry budget and delay policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReconnectConfig {
    /// Attempts per failure episode; `0` retries forever.
    pub max_retries: u32,
    /// Delay growth.
    pub backoff: BackoffPolicy,
}

impl ReconnectConfig {
    /// Policy from settings.
    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff: settings.backoff(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from_settings(&ReconnectSettings::default())
    }
}

/// Attempt counter and the un-jittered delay for the next attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectState {
    /// Attempts made in the current episode.
    pub attempts: u32,
    /// Delay before the next attempt, before jitter.
    pub current_delay: Duration,
}

/// Progress notifications from [`Reconnector::run`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconnectEvent {
    /// About to wait `delay` before attempt number `attempt` (1-based).
    Waiting {
        /// Attempt number.
        attempt: u32,
        /// Jittered delay.
        delay: Duration,
    },
    /// Attempt number `attempt` failed.
    Failed {
        /// Attempt number.
        attempt: u32,
        /// Why it failed.
        error: WsError,
    },
}

/// How a retry episode ended.
#[derive(Debug)]
pub enum ReconnectOutcome<T> {
    /// A dial succeeded.
    Connected {
        /// What the dial produced.
        value: T,
        /// Attempts it took.
        attempts: u32,
    },
    /// The budget ran out; carries [`WsError::MaxRetriesExceeded`].
    Exhausted(WsError),
    /// Stopped or cancelled while waiting or dialing.
    Cancelled,
}

/// Drives retries for one endpoint.
#[derive(Debug)]
pub struct Reconnector {
    config: ReconnectConfig,
    state: Mutex<ReconnectState>,
    stop: CancellationToken,
}

impl Reconnector {
    /// Create a reconnector with a fresh state.
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            state: Mutex::new(ReconnectState {
                attempts: 0,
                current_delay: config.backoff.initial(),
            }),
            config,
            stop: CancellationToken::new(),
        }
    }

    /// Policy in effect.
    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// State snapshot.
    pub fn state(&self) -> ReconnectState {
        *self.state.lock()
    }

    /// Back to zero attempts and the initial delay.
    pub fn reset(&self) {
        *self.state.lock() = ReconnectState {
            attempts: 0,
            current_delay: self.config.backoff.initial(),
        };
    }

    /// Abort any wait or dial in progress. Permanent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Whether [`stop`](Self::stop) was called.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Claim the next attempt: its number and jittered delay, or `None` when
    /// the budget is spent.
    pub fn next_attempt(&self) -> Option<(u32, Duration)> {
        let mut state = self.state.lock();
        if self.config.max_retries > 0 && state.attempts >= self.config.max_retries {
            return None;
        }
        state.attempts += 1;
        let delay = self.config.backoff.jitter_random(state.current_delay);
        state.current_delay = self.config.backoff.grow(state.current_delay);
        Some((state.attempts, delay))
    }

    /// Wait and dial until a dial succeeds, the budget runs out, or either
    /// `cancel` or [`stop`](Self::stop) fires.
    ///
    /// State is reset when the episode ends in success or exhaustion.
    pub async fn run<T, D, Fut, O>(
        &self,
        cancel: &CancellationToken,
        mut dial: D,
        mut observe: O,
    ) -> ReconnectOutcome<T>
    where
        D: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, WsError>>,
        O: FnMut(ReconnectEvent),
    {
        loop {
            let Some((attempt, delay)) = self.next_attempt() else {
                let attempts = self.state().attempts;
                self.reset();
                let err = WsError::MaxRetriesExceeded { attempts };
                counter!(WS_RECONNECT_FAILURES_TOTAL).increment(1);
                record_error(&err);
                warn!(attempts, "reconnect attempts exhausted");
                return ReconnectOutcome::Exhausted(err);
            };

            observe(ReconnectEvent::Waiting { attempt, delay });
            tokio::select! {
                biased;
                () = self.stop.cancelled() => return ReconnectOutcome::Cancelled,
                () = cancel.cancelled() => return ReconnectOutcome::Cancelled,
                () = tokio::time::sleep(delay) => {}
            }

            counter!(WS_RECONNECT_ATTEMPTS_TOTAL).increment(1);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            info!(attempt, delay_ms, "reconnect attempt");
            let result = tokio::select! {
                biased;
                () = self.stop.cancelled() => return ReconnectOutcome::Cancelled,
                () = cancel.cancelled() => return ReconnectOutcome::Cancelled,
                result = dial(attempt) => result,
            };

            match result {
                Ok(value) => {
                    self.reset();
                    counter!(WS_RECONNECT_SUCCESS_TOTAL).increment(1);
                    info!(attempts = attempt, "reconnected");
                    return ReconnectOutcome::Connected {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    warn!(attempt, error = %error, "reconnect attempt failed");
                    observe(ReconnectEvent::Failed { attempt, error });
                }
            }
        }
    }
}
