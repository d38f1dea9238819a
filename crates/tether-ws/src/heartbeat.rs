//! Liveness probing for a single connection.
//!
//! At every tick the manager checks whether the previous ping was answered.
//! Timeout is declared when either enabled condition holds: the number of
//! consecutive unanswered pings reaches `max_miss_count`, or the time since
//! the last pong exceeds `timeout`. A zero count or `None` timeout disables
//! that check. On timeout the registered callback runs once and the manager
//! stops for good; a fresh manager is needed for the next connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use tether_settings::HeartbeatSettings;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::errors::{Result, WsError};
use crate::metrics::{WS_HEARTBEAT_MISSED_TOTAL, WS_HEARTBEAT_TIMEOUTS_TOTAL};

type TimeoutCallback = Box<dyn FnOnce(WsError) + Send>;

/// Ping cadence and timeout policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between pings.
    pub interval: Duration,
    /// Maximum silence since the last pong.
    pub timeout: Option<Duration>,
    /// Consecutive unanswered pings tolerated; `0` disables the check.
    pub max_miss_count: u32,
}

impl HeartbeatConfig {
    /// Client-side policy from settings.
    pub fn from_settings(settings: &HeartbeatSettings) -> Self {
        Self {
            interval: settings.interval(),
            timeout: settings.timeout(),
            max_miss_count: settings.max_miss_count,
        }
    }

    /// Server-side policy: ping every `ping_interval`, give up after
    /// `pong_timeout` of silence.
    pub fn server(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            interval: ping_interval,
            timeout: Some(pong_timeout),
            max_miss_count: 0,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::from_settings(&HeartbeatSettings::default())
    }
}

/// Last-pong timestamp and consecutive-miss counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatState {
    last_pong: Instant,
    missed: u32,
    awaiting: bool,
}

/// What a tick decided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tick {
    /// Send a ping; `missed` is set when the previous one went unanswered.
    Ping {
        /// The previous ping was not answered.
        missed: bool,
    },
    /// The peer is considered dead.
    TimedOut(WsError),
}

impl HeartbeatState {
    /// Fresh state as of `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            last_pong: now,
            missed: 0,
            awaiting: false,
        }
    }

    /// A pong arrived.
    pub fn record_pong(&mut self, now: Instant) {
        self.last_pong = now;
        self.missed = 0;
        self.awaiting = false;
    }

    /// Consecutive unanswered pings.
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// When the last pong arrived.
    pub fn last_pong(&self) -> Instant {
        self.last_pong
    }

    /// Advance one interval.
    pub fn tick(&mut self, now: Instant, config: &HeartbeatConfig) -> Tick {
        let missed = self.awaiting;
        if missed {
            self.missed += 1;
        }
        let since = now.saturating_duration_since(self.last_pong);
        let by_count = config.max_miss_count > 0 && self.missed >= config.max_miss_count;
        let by_silence = config.timeout.is_some_and(|limit| since > limit);
        if by_count || by_silence {
            return Tick::TimedOut(WsError::HeartbeatTimeout {
                missed: self.missed,
                since,
            });
        }
        self.awaiting = true;
        Tick::Ping { missed }
    }
}

/// How a heartbeat run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The peer stopped answering.
    TimedOut(WsError),
    /// [`HeartbeatManager::stop`] was called.
    Stopped,
    /// The connection closed on its own.
    ConnectionClosed,
}

/// Runs the ping loop for one connection.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<Mutex<HeartbeatState>>,
    cancel: CancellationToken,
    running: AtomicBool,
    on_timeout: Mutex<Option<TimeoutCallback>>,
}

impl HeartbeatManager {
    /// Create a manager; nothing runs until [`run`](Self::run).
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(HeartbeatState::new(Instant::now()))),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            on_timeout: Mutex::new(None),
        }
    }

    /// Register the callback invoked once on timeout.
    pub fn on_timeout(&self, callback: impl FnOnce(WsError) + Send + 'static) {
        *self.on_timeout.lock() = Some(Box::new(callback));
    }

    /// Policy in effect.
    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Current state snapshot.
    pub fn state(&self) -> HeartbeatState {
        *self.state.lock()
    }

    /// Stop the loop. Permanent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the manager has stopped (explicitly or by timing out).
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ping `conn` until timeout, stop, or close.
    pub async fn run(&self, conn: &Arc<Connection>) -> Result<HeartbeatResult> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(WsError::AlreadyRunning("heartbeat"));
        }
        if self.is_stopped() {
            return Ok(HeartbeatResult::Stopped);
        }

        *self.state.lock() = HeartbeatState::new(Instant::now());
        let state = Arc::clone(&self.state);
        conn.set_pong_handler(move || state.lock().record_pong(Instant::now()));

        let result = self.ping_loop(conn).await;
        conn.clear_pong_handler();
        Ok(result)
    }

    async fn ping_loop(&self, conn: &Arc<Connection>) -> HeartbeatResult {
        let interval = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return HeartbeatResult::Stopped,
                () = conn.closed() => return HeartbeatResult::ConnectionClosed,
                _ = ticker.tick() => {}
            }

            let tick = self.state.lock().tick(Instant::now(), &self.config);
            match tick {
                Tick::TimedOut(err) => {
                    counter!(WS_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
                    warn!(conn_id = %conn.id(), error = %err, "heartbeat timeout");
                    self.cancel.cancel();
                    let callback = self.on_timeout.lock().take();
                    if let Some(callback) = callback {
                        callback(err.clone());
                    }
                    return HeartbeatResult::TimedOut(err);
                }
                Tick::Ping { missed } => {
                    if missed {
                        counter!(WS_HEARTBEAT_MISSED_TOTAL).increment(1);
                        debug!(conn_id = %conn.id(), missed = self.state.lock().missed(), "pong missed");
                    }
                    match conn.ping() {
                        Ok(()) => {}
                        Err(WsError::Closed) => return HeartbeatResult::ConnectionClosed,
                        Err(err) => debug!(conn_id = %conn.id(), error = %err, "ping not queued"),
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for HeartbeatManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatManager")
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::handler::Handler;
    use crate::transport::{Transport, memory_pair};
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    fn quiet() -> ConnectionConfig {
        ConnectionConfig {
            read_timeout: None,
            ..ConnectionConfig::default()
        }
    }

    fn cfg(interval_ms: u64, timeout_ms: Option<u64>, max_miss: u32) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(interval_ms),
            timeout: timeout_ms.map(Duration::from_millis),
            max_miss_count: max_miss,
        }
    }

    /// A started connection whose peer never answers.
    fn silent() -> (Arc<Connection>, Transport) {
        let (a, b) = memory_pair(64);
        let conn = Connection::new(a, quiet());
        conn.start(Handler::noop()).unwrap();
        (conn, b)
    }

    #[test]
    fn tick_counts_consecutive_misses() {
        let t0 = Instant::now();
        let c = cfg(1000, None, 3);
        let mut s = HeartbeatState::new(t0);
        assert_eq!(s.tick(t0, &c), Tick::Ping { missed: false });
        assert_eq!(s.tick(t0, &c), Tick::Ping { missed: true });
        assert_eq!(s.tick(t0, &c), Tick::Ping { missed: true });
        assert_matches!(
            s.tick(t0, &c),
            Tick::TimedOut(WsError::HeartbeatTimeout { missed: 3, .. })
        );
    }

    #[test]
    fn pong_resets_misses() {
        let t0 = Instant::now();
        let c = cfg(1000, None, 2);
        let mut s = HeartbeatState::new(t0);
        let _ = s.tick(t0, &c);
        let _ = s.tick(t0, &c);
        assert_eq!(s.missed(), 1);
        s.record_pong(t0);
        assert_eq!(s.missed(), 0);
        assert_eq!(s.tick(t0, &c), Tick::Ping { missed: false });
    }

    #[test]
    fn silence_timeout_independent_of_count() {
        let t0 = Instant::now();
        let c = cfg(1000, Some(2500), 0);
        let mut s = HeartbeatState::new(t0);
        assert_matches!(s.tick(t0 + Duration::from_secs(1), &c), Tick::Ping { .. });
        assert_matches!(s.tick(t0 + Duration::from_secs(2), &c), Tick::Ping { .. });
        assert_matches!(
            s.tick(t0 + Duration::from_secs(3), &c),
            Tick::TimedOut(WsError::HeartbeatTimeout { .. })
        );
    }

    #[test]
    fn both_checks_disabled_never_times_out() {
        let t0 = Instant::now();
        let c = cfg(1000, None, 0);
        let mut s = HeartbeatState::new(t0);
        for i in 0..100 {
            assert_matches!(s.tick(t0 + Duration::from_secs(i), &c), Tick::Ping { .. });
        }
    }

    #[test]
    fn server_config_uses_silence_only() {
        let c = HeartbeatConfig::server(Duration::from_secs(54), Duration::from_secs(60));
        assert_eq!(c.max_miss_count, 0);
        assert_eq!(c.timeout, Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_and_callback_fires_once() {
        let (conn, _peer) = silent();
        let hb = HeartbeatManager::new(cfg(1000, None, 3));
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        hb.on_timeout(move |err| {
            assert_matches!(err, WsError::HeartbeatTimeout { missed: 3, .. });
            let _ = f.fetch_add(1, Ordering::SeqCst);
        });

        let started = Instant::now();
        let result = hb.run(&conn).await.unwrap();
        assert_matches!(result, HeartbeatResult::TimedOut(_));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(5));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(hb.is_stopped());
        // Does not restart.
        assert_matches!(hb.run(&conn).await, Err(WsError::AlreadyRunning(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn responsive_peer_stays_alive() {
        let (a, b) = memory_pair(64);
        let conn = Connection::new(a, quiet());
        let peer = Connection::new(b, quiet());
        conn.start(Handler::noop()).unwrap();
        peer.start(Handler::noop()).unwrap();

        let hb = Arc::new(HeartbeatManager::new(cfg(1000, Some(2500), 2)));
        let runner = {
            let hb = Arc::clone(&hb);
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { hb.run(&conn).await })
        };
        tokio::time::sleep(Duration::from_secs(10)).await;
        hb.stop();
        assert_eq!(runner.await.unwrap().unwrap(), HeartbeatResult::Stopped);
        assert_eq!(hb.state().missed(), 0);
        assert!(!conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn connection_close_ends_run() {
        let (conn, _peer) = silent();
        let hb = HeartbeatManager::new(cfg(1000, None, 0));
        let c = Arc::clone(&conn);
        let _closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            c.close();
        });
        assert_eq!(hb.run(&conn).await.unwrap(), HeartbeatResult::ConnectionClosed);
    }

    #[tokio::test]
    async fn stopped_before_run_returns_immediately() {
        let (conn, _peer) = silent();
        let hb = HeartbeatManager::new(HeartbeatConfig::default());
        hb.stop();
        assert_eq!(hb.run(&conn).await.unwrap(), HeartbeatResult::Stopped);
    }
}
