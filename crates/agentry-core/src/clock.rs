//! Injectable time source.
//!
//! Components read wall-clock time and wait out backoff delays through a
//! `Clock` so tests can observe the waits without sleeping. Periodic loops
//! still use `tokio::time::interval` directly.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Boxed future returned by [`Clock::sleep`].
pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Time capability shared by the runtime components.
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Resolve after `duration` has passed on this clock.
    fn sleep(&self, duration: Duration) -> SleepFuture;
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Production clock backed by `chrono::Utc` and `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> SleepFuture {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Virtual clock that records every requested sleep and returns at once.
///
/// `now()` advances by the total slept duration, so timestamps taken after a
/// backoff reflect the wait.
#[derive(Debug)]
pub struct RecordingClock {
    origin: DateTime<Utc>,
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingClock {
    pub fn new() -> Self {
        Self {
            origin: Utc::now(),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Sum of all recorded sleeps, saturating at `Duration::MAX`.
    pub fn total_slept(&self) -> Duration {
        self.sleeps()
            .iter()
            .fold(Duration::ZERO, |total, slept| total.saturating_add(*slept))
    }
}

impl Default for RecordingClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RecordingClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.total_slept()).unwrap_or(chrono::Duration::MAX);
        self.origin
            .checked_add_signed(elapsed)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn sleep(&self, duration: Duration) -> SleepFuture {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        Box::pin(tokio::task::yield_now())
    }
}
