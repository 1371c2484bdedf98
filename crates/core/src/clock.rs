use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

/// Time source for every bounded wait in the engine.
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created.
    fn now(&self) -> Duration;
    fn sleep(&self, d: Duration);
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, d: Duration) {
        thread::sleep(d);
    }
}

/// Clock that never blocks: `sleep` advances time instantly.
#[derive(Default)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, d: Duration) {
        self.state.lock().unwrap().now += d;
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().unwrap().sleeps.clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.state.lock().unwrap().now
    }

    fn sleep(&self, d: Duration) {
        let mut s = self.state.lock().unwrap();
        s.now += d;
        s.sleeps.push(d);
    }
}

/// `base` plus a uniform offset in `-spread..=spread`, floored at zero.
pub fn jittered(base: Duration, spread: Duration) -> Duration {
    if spread.is_zero() {
        return base;
    }
    let spread_ms = spread.as_millis() as i64;
    let offset = rand::thread_rng().gen_range(-spread_ms..=spread_ms);
    let ms = (base.as_millis() as i64 + offset).max(0);
    Duration::from_millis(ms as u64)
}

pub fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
