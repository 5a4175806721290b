//! Idle-timeout supervision for queue consumers.
//!
//! A consumer that blocks on an empty queue would otherwise run forever.
//! The supervisor samples the time since the last delivery on a background
//! task and cancels the consume loop once it exceeds the configured timeout,
//! or as soon as the parent token is cancelled by an operator interrupt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default interval between idle checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Why a supervised consume loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// No message arrived for longer than the idle timeout.
    IdleTimeout,
    /// The parent token was cancelled (operator interrupt, fleet teardown).
    Interrupted,
    /// The consume loop stopped on its own, e.g. after a fatal error.
    LoopExited,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::IdleTimeout => write!(f, "idle timeout"),
            ShutdownReason::Interrupted => write!(f, "interrupted"),
            ShutdownReason::LoopExited => write!(f, "loop exited"),
        }
    }
}

/// Last-activity timestamp shared between the consume loop and the supervisor.
///
/// Stored as milliseconds since the clock's origin in an atomic.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    origin: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    /// Creates a clock whose last activity is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Records activity at the current instant.
    pub fn touch(&self) {
        self.last_ms.fetch_max(self.now_ms(), Ordering::SeqCst);
    }

    /// Time elapsed since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_ms.load(Ordering::SeqCst);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }
}

/// Background timer that stops a consume loop after an idle period.
#[derive(Debug, Clone)]
pub struct IdleSupervisor {
    timeout: Duration,
    poll_interval: Duration,
    clock: ActivityClock,
}

impl IdleSupervisor {
    /// Creates a supervisor with the default poll interval.
    pub fn new(timeout: Duration, clock: ActivityClock) -> Self {
        Self {
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            clock,
        }
    }

    /// Sets how often the idle time is sampled.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn clock(&self) -> &ActivityClock {
        &self.clock
    }

    /// Spawns the timer task.
    ///
    /// `parent` is the external interrupt source; `stop` is the token the
    /// consume loop watches. The task cancels `stop` on idle timeout or
    /// parent cancellation, and exits quietly with `LoopExited` if `stop` is
    /// cancelled by someone else.
    pub fn spawn(self, parent: CancellationToken, stop: CancellationToken) -> JoinHandle<ShutdownReason> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = parent.cancelled() => {
                        info!("Interrupt received, stopping consumer");
                        stop.cancel();
                        return ShutdownReason::Interrupted;
                    }
                    _ = stop.cancelled() => {
                        return ShutdownReason::LoopExited;
                    }
                    _ = ticker.tick() => {
                        let idle = self.clock.idle_for();
                        if idle > self.timeout {
                            info!(
                                idle_secs = idle.as_secs_f64(),
                                timeout_secs = self.timeout.as_secs_f64(),
                                "Idle timeout hit, stopping consumer"
                            );
                            stop.cancel();
                            return ShutdownReason::IdleTimeout;
                        }
                        debug!(idle_ms = idle.as_millis() as u64, "Consumer idle check");
                    }
                }
            }
        })
    }
}
