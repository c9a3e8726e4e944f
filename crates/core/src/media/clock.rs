use std::time::{Duration, Instant};

/// Sleeps shorter than this are skipped; the next tick absorbs them.
pub const DEAD_ZONE: Duration = Duration::from_millis(30);

/// Converts media time produced into wall-clock sleep.
///
/// Tracks the total virtual duration handed out since `start`. Each
/// [`tick`](Self::tick) returns how far the media is ahead of real time,
/// or zero when it is within [`DEAD_ZONE`] or behind. Because the sum is
/// cumulative, oversleeping on one tick shortens the next rather than
/// accumulating drift.
#[derive(Debug)]
pub struct WallClock {
    start: Instant,
    duration: Duration,
}

impl WallClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self {
            start,
            duration: Duration::ZERO,
        }
    }

    /// Virtual time produced so far.
    pub fn produced(&self) -> Duration {
        self.duration
    }

    /// Record `d` more media time and return the sleep needed now.
    pub fn tick(&mut self, d: Duration) -> Duration {
        self.tick_at(d, Instant::now())
    }

    pub fn tick_at(&mut self, d: Duration, now: Instant) -> Duration {
        self.duration += d;
        let elapsed = now.saturating_duration_since(self.start);
        match self.duration.checked_sub(elapsed) {
            Some(ahead) if ahead > DEAD_ZONE => ahead,
            _ => Duration::ZERO,
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}
