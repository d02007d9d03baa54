//! # Tick Loop
//!
//! Fixed-timestep pacing for the game-logic thread.
//!
//! ```text
//! loop {
//!     ticks.wait_for_next_tick();
//!     while ticks.should_tick() {
//!         let start = ticks.begin_tick();
//!         runtime.tick(&mut world, update)?;   // cycle, update, flush
//!         ticks.end_tick(start);
//!     }
//! }
//! ```

use std::time::{Duration, Instant};

/// Below this, waiting spins instead of sleeping.
const SPIN_THRESHOLD: Duration = Duration::from_micros(500);

/// Fixed-timestep tick controller.
#[derive(Debug)]
pub struct TickLoop {
    tick_duration: Duration,
    last_tick: Instant,
    accumulator: Duration,
    tick_count: u64,
    stats: TickStats,
}

/// Tick timing statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickStats {
    /// Fastest tick observed, in microseconds.
    pub min_tick_us: u64,
    /// Slowest tick observed, in microseconds.
    pub max_tick_us: u64,
    /// Rolling average, in microseconds.
    pub avg_tick_us: u64,
    /// Ticks that overran their budget.
    pub late_ticks: u64,
    /// Ticks measured.
    pub total_ticks: u64,
}

impl TickStats {
    fn fresh(tick_duration: Duration) -> Self {
        Self {
            min_tick_us: u64::MAX,
            max_tick_us: 0,
            avg_tick_us: micros(tick_duration),
            late_ticks: 0,
            total_ticks: 0,
        }
    }

    /// Share of late ticks, in percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn late_percent(&self) -> f64 {
        self.late_ticks as f64 / self.total_ticks.max(1) as f64 * 100.0
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

impl TickLoop {
    /// Creates a loop running `tick_rate` times per second.
    ///
    /// A rate of zero is treated as one.
    #[must_use]
    pub fn new(tick_rate: u32) -> Self {
        let tick_duration = Duration::from_micros(1_000_000 / u64::from(tick_rate.max(1)));
        Self {
            tick_duration,
            last_tick: Instant::now(),
            accumulator: Duration::ZERO,
            tick_count: 0,
            stats: TickStats::fresh(tick_duration),
        }
    }

    /// Returns true while a tick is due. Call in a loop until it returns
    /// false.
    #[must_use]
    pub fn should_tick(&mut self) -> bool {
        let now = Instant::now();
        self.accumulator += now.duration_since(self.last_tick);
        self.last_tick = now;
        self.accumulator >= self.tick_duration
    }

    /// Marks the start of a tick and returns its start time.
    #[must_use]
    pub fn begin_tick(&mut self) -> Instant {
        self.accumulator = self.accumulator.saturating_sub(self.tick_duration);
        self.tick_count += 1;
        Instant::now()
    }

    /// Marks the end of the tick started at `start`.
    pub fn end_tick(&mut self, start: Instant) {
        let duration = start.elapsed();
        let us = micros(duration);

        let stats = &mut self.stats;
        stats.total_ticks += 1;
        stats.min_tick_us = stats.min_tick_us.min(us);
        stats.max_tick_us = stats.max_tick_us.max(us);
        stats.avg_tick_us = stats.avg_tick_us.saturating_mul(15).saturating_add(us) / 16;

        if duration > self.tick_duration {
            stats.late_ticks += 1;
            tracing::warn!(tick = self.tick_count, took_us = us, budget_us = micros(self.tick_duration), "late tick");
        }
    }

    /// Sleeps until the next tick is due, spinning for the last stretch.
    pub fn wait_for_next_tick(&self) {
        let elapsed = self.last_tick.elapsed();
        if elapsed >= self.tick_duration {
            return;
        }
        let remaining = self.tick_duration - elapsed;
        if remaining > SPIN_THRESHOLD * 2 {
            std::thread::sleep(remaining - SPIN_THRESHOLD);
        }
        while self.last_tick.elapsed() < self.tick_duration {
            std::hint::spin_loop();
        }
    }

    /// Ticks begun so far.
    #[must_use]
    pub const fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Timing statistics.
    #[must_use]
    pub const fn stats(&self) -> &TickStats {
        &self.stats
    }

    /// Target tick duration.
    #[must_use]
    pub const fn tick_duration(&self) -> Duration {
        self.tick_duration
    }

    /// Clears the statistics.
    pub fn reset_stats(&mut self) {
        self.stats = TickStats::fresh(self.tick_duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_duration_from_rate() {
        assert_eq!(TickLoop::new(20).tick_duration(), Duration::from_millis(50));
        assert_eq!(TickLoop::new(0).tick_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_tick_execution() {
        let mut ticks = TickLoop::new(1000);
        std::thread::sleep(Duration::from_millis(5));
        assert!(ticks.should_tick());

        let start = ticks.begin_tick();
        ticks.end_tick(start);
        assert_eq!(ticks.tick_count(), 1);
        assert_eq!(ticks.stats().total_ticks, 1);
    }

    #[test]
    fn test_stats_tracking() {
        let mut ticks = TickLoop::new(1000);
        for _ in 0..10 {
            std::thread::sleep(Duration::from_micros(100));
            while ticks.should_tick() {
                let start = ticks.begin_tick();
                std::thread::sleep(Duration::from_micros(50));
                ticks.end_tick(start);
            }
        }

        let stats = *ticks.stats();
        assert!(stats.total_ticks > 0);
        assert!(stats.min_tick_us > 0);
        assert!(stats.min_tick_us <= stats.max_tick_us);

        ticks.reset_stats();
        assert_eq!(ticks.stats().total_ticks, 0);
    }
}
