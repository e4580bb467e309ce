//! Session countdown.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Fired once when the remaining time reaches the warning threshold.
    Warning { remaining: Duration },
    /// Fired once at zero.
    Expired,
}

/// Pure one-second countdown. Each event fires at most once.
#[derive(Debug, Clone)]
pub struct Countdown {
    remaining: u64,
    warn_at: u64,
    warned: bool,
    expired: bool,
}

impl Countdown {
    pub fn new(duration: Duration, warning: Duration) -> Self {
        Self {
            remaining: duration.as_secs(),
            warn_at: warning.as_secs(),
            warned: false,
            expired: false,
        }
    }

    pub fn remaining(&self) -> Duration {
        Duration::from_secs(self.remaining)
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Advance one second.
    pub fn tick(&mut self) -> Option<TimerEvent> {
        if self.expired {
            return None;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.expired = true;
            return Some(TimerEvent::Expired);
        }
        if !self.warned && self.remaining <= self.warn_at {
            self.warned = true;
            return Some(TimerEvent::Warning {
                remaining: self.remaining(),
            });
        }
        None
    }
}

/// Runs a [`Countdown`] on the tokio clock and forwards its events.
pub struct SessionTimer {
    shutdown: Mutex<Option<CancellationToken>>,
    remaining: watch::Receiver<Duration>,
}

impl SessionTimer {
    /// Start counting down. Events are delivered on `events`, converted into
    /// the receiver's event type.
    pub fn start<T>(duration: Duration, warning: Duration, events: mpsc::UnboundedSender<T>) -> Self
    where
        T: From<TimerEvent> + Send + 'static,
    {
        let mut countdown = Countdown::new(duration, warning);
        let (remaining_tx, remaining) = watch::channel(countdown.remaining());
        let token = CancellationToken::new();
        let cancelled = token.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + TICK, TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            info!(secs = duration.as_secs(), "Session timer started");
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let event = countdown.tick();
                        remaining_tx.send_replace(countdown.remaining());
                        if let Some(event) = event {
                            if events.send(T::from(event)).is_err() {
                                break;
                            }
                        }
                        if countdown.is_expired() {
                            break;
                        }
                    }
                }
            }
            debug!(remaining = countdown.remaining().as_secs(), "Session timer finished");
        });

        Self {
            shutdown: Mutex::new(Some(token)),
            remaining,
        }
    }

    /// Stop and clear the timer. Idempotent.
    pub fn stop(&self) {
        if let Ok(mut slot) = self.shutdown.lock() {
            if let Some(token) = slot.take() {
                token.cancel();
            }
        }
    }

    /// Time left, updated once per tick.
    pub fn subscribe(&self) -> watch::Receiver<Duration> {
        self.remaining.clone()
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
