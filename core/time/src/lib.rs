//! Time abstraction used across the workspace.
//!
//! Components never call `std::time::Instant::now()` directly; they take a
//! [`Clock`] instead. Production code constructs `Clock::real()`, while tests
//! construct a [`FakeClock`] and advance it explicitly, which makes every
//! time-dependent code path (cache expiration, rate limiting, idle cutoffs)
//! deterministic.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;

pub use time::Duration;

/// Wall-clock time. Not monotonic, may jump on NTP adjustments.
pub type Utc = time::OffsetDateTime;

/// Arbitrary process-wide anchor for converting `std::time::Instant` into an
/// [`Instant`]. The absolute value of an `Instant` is meaningless; only
/// differences are.
static PROCESS_EPOCH: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);

/// Monotonic instant, comparable across the process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(Duration);

impl Instant {
    fn from_std(t: std::time::Instant) -> Self {
        Instant(t.duration_since(*PROCESS_EPOCH).try_into().unwrap_or(Duration::MAX))
    }

    pub fn saturating_sub(self, earlier: Instant) -> Duration {
        (self.0 - earlier.0).max(Duration::ZERO)
    }
}

impl std::ops::Sub for Instant {
    type Output = Duration;
    fn sub(self, other: Instant) -> Duration {
        self.0 - other.0
    }
}

impl std::ops::Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, d: Duration) -> Instant {
        Instant(self.0 + d)
    }
}

impl std::ops::Sub<Duration> for Instant {
    type Output = Instant;
    fn sub(self, d: Duration) -> Instant {
        Instant(self.0 - d)
    }
}

fn to_std(d: Duration) -> std::time::Duration {
    std::time::Duration::try_from(d).unwrap_or(std::time::Duration::ZERO)
}

/// Clock handle, cheap to clone.
#[derive(Clone)]
pub struct Clock(ClockInner);

#[derive(Clone)]
enum ClockInner {
    Real,
    Fake(FakeClock),
}

impl Clock {
    pub fn real() -> Clock {
        Clock(ClockInner::Real)
    }

    pub fn now(&self) -> Instant {
        match &self.0 {
            ClockInner::Real => Instant::from_std(std::time::Instant::now()),
            ClockInner::Fake(fake) => fake.now(),
        }
    }

    pub fn now_utc(&self) -> Utc {
        match &self.0 {
            ClockInner::Real => Utc::now_utc(),
            ClockInner::Fake(fake) => fake.now_utc(),
        }
    }

    pub async fn sleep(&self, d: Duration) {
        match &self.0 {
            ClockInner::Real => tokio::time::sleep(to_std(d)).await,
            ClockInner::Fake(fake) => {
                let t = fake.now() + d;
                fake.sleep_until(t).await
            }
        }
    }

    pub async fn sleep_until(&self, t: Instant) {
        match &self.0 {
            ClockInner::Real => {
                let now = self.now();
                if t > now {
                    tokio::time::sleep(to_std(t - now)).await;
                }
            }
            ClockInner::Fake(fake) => fake.sleep_until(t).await,
        }
    }
}

struct FakeState {
    instant: Instant,
    utc: Utc,
}

struct FakeClockInner {
    state: Mutex<FakeState>,
    /// Bumped on every advance() so that pending sleeps re-check the clock.
    advanced: tokio::sync::watch::Sender<()>,
}

/// Manually driven clock for tests. `advance()` wakes every pending sleep
/// whose deadline has been reached; time never moves on its own.
#[derive(Clone)]
pub struct FakeClock(Arc<FakeClockInner>);

impl FakeClock {
    pub fn new(utc: Utc) -> Self {
        let (advanced, _) = tokio::sync::watch::channel(());
        FakeClock(Arc::new(FakeClockInner {
            state: Mutex::new(FakeState { instant: Instant(Duration::ZERO), utc }),
            advanced,
        }))
    }

    pub fn clock(&self) -> Clock {
        Clock(ClockInner::Fake(self.clone()))
    }

    pub fn now(&self) -> Instant {
        self.0.state.lock().instant
    }

    pub fn now_utc(&self) -> Utc {
        self.0.state.lock().utc
    }

    pub fn advance(&self, d: Duration) {
        assert!(d >= Duration::ZERO);
        {
            let mut state = self.0.state.lock();
            state.instant = state.instant + d;
            state.utc += d;
        }
        self.0.advanced.send_replace(());
    }

    pub fn set_utc(&self, utc: Utc) {
        self.0.state.lock().utc = utc;
        self.0.advanced.send_replace(());
    }

    pub async fn sleep_until(&self, t: Instant) {
        let mut sub = self.0.advanced.subscribe();
        while self.now() < t {
            if sub.changed().await.is_err() {
                // Sender lives as long as self; unreachable.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(Utc::UNIX_EPOCH)
    }
}

/// Fixed-period ticker driven by an explicit clock, usable with both the real
/// and the fake clock.
pub struct Interval {
    next: Instant,
    period: Duration,
}

impl Interval {
    pub fn new(next: Instant, period: Duration) -> Self {
        Self { next, period }
    }

    pub async fn tick(&mut self, clock: &Clock) {
        clock.sleep_until(self.next).await;
        // The next tick is scheduled relative to the deadline, not to the time
        // the caller got around to awaiting it.
        self.next = self.next + self.period;
    }
}
