use std::time::Duration;
use tokio::time::Instant;

/// Millisecond tick counter. It wraps after ~49 days, so ticks are only ever compared through
///  [tick_diff].
pub type Tick = u32;

/// signed difference `a - b`, correct across wraparound as long as the ticks are less than
///  ~24 days apart
pub fn tick_diff(a: Tick, b: Tick) -> i32 {
    a.wrapping_sub(b) as i32
}

/// `true` if more than `interval` has passed from `since` to `now`
pub fn elapsed_more_than(now: Tick, since: Tick, interval: Duration) -> bool {
    tick_diff(now, since) as i64 > interval.as_millis() as i64
}

pub fn tick_minus(now: Tick, millis: u32) -> Tick {
    now.wrapping_sub(millis)
}

/// Monotonic source of ticks for code driving the transport
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Tick;
}

/// Ticks measured from the moment of creation, based on tokio's clock (which honors
///  `tokio::time::pause()` in tests)
pub struct TokioClock {
    epoch: Instant,
}

impl TokioClock {
    pub fn new() -> TokioClock {
        TokioClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Tick {
        // truncation is the wraparound
        self.epoch.elapsed().as_millis() as Tick
    }
}
