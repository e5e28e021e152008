//! Sliding windows backing the circuit breaker's failure and slow-call rates
//!
//! A count-based window keeps the most recent `size` outcomes in a ring
//! buffer. A time-based window keeps one bucket per second for the last
//! `size` seconds and evicts buckets as time advances. Both maintain running
//! totals so recording and snapshotting never rescan the whole history.

use tokio::time::Instant;

/// Classified outcome of one recorded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    SlowSuccess,
    SlowFailure,
}

impl Outcome {
    pub fn new(failed: bool, slow: bool) -> Self {
        match (failed, slow) {
            (false, false) => Outcome::Success,
            (true, false) => Outcome::Failure,
            (false, true) => Outcome::SlowSuccess,
            (true, true) => Outcome::SlowFailure,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Outcome::Failure | Outcome::SlowFailure)
    }

    pub fn is_slow(self) -> bool {
        matches!(self, Outcome::SlowSuccess | Outcome::SlowFailure)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Totals {
    calls: u32,
    failed: u32,
    slow: u32,
    slow_failed: u32,
}

impl Totals {
    fn add(&mut self, outcome: Outcome) {
        self.calls += 1;
        if outcome.is_failure() {
            self.failed += 1;
        }
        if outcome.is_slow() {
            self.slow += 1;
        }
        if outcome == Outcome::SlowFailure {
            self.slow_failed += 1;
        }
    }

    fn remove(&mut self, outcome: Outcome) {
        self.calls = self.calls.saturating_sub(1);
        if outcome.is_failure() {
            self.failed = self.failed.saturating_sub(1);
        }
        if outcome.is_slow() {
            self.slow = self.slow.saturating_sub(1);
        }
        if outcome == Outcome::SlowFailure {
            self.slow_failed = self.slow_failed.saturating_sub(1);
        }
    }

    fn subtract(&mut self, other: Totals) {
        self.calls = self.calls.saturating_sub(other.calls);
        self.failed = self.failed.saturating_sub(other.failed);
        self.slow = self.slow.saturating_sub(other.slow);
        self.slow_failed = self.slow_failed.saturating_sub(other.slow_failed);
    }
}

/// Aggregated view of a window at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub total_calls: u32,
    pub failed_calls: u32,
    pub slow_calls: u32,
    pub slow_failed_calls: u32,
    pub minimum_number_of_calls: u32,
}

impl WindowSnapshot {
    pub fn successful_calls(&self) -> u32 {
        self.total_calls - self.failed_calls
    }

    /// Percentage of failed calls, or -1.0 below the minimum call count
    pub fn failure_rate(&self) -> f32 {
        self.rate(self.failed_calls)
    }

    /// Percentage of slow calls, or -1.0 below the minimum call count
    pub fn slow_call_rate(&self) -> f32 {
        self.rate(self.slow_calls)
    }

    fn rate(&self, count: u32) -> f32 {
        if self.total_calls == 0 || self.total_calls < self.minimum_number_of_calls {
            return -1.0;
        }
        count as f32 * 100.0 / self.total_calls as f32
    }
}

#[derive(Debug)]
pub struct CountWindow {
    slots: Box<[Option<Outcome>]>,
    head: usize,
    totals: Totals,
    minimum_number_of_calls: u32,
}

impl CountWindow {
    /// The effective minimum never exceeds the window size.
    pub fn new(size: u32, minimum_number_of_calls: u32) -> Self {
        let size = size.max(1);
        Self {
            slots: vec![None; size as usize].into_boxed_slice(),
            head: 0,
            totals: Totals::default(),
            minimum_number_of_calls: minimum_number_of_calls.min(size),
        }
    }

    pub fn record(&mut self, outcome: Outcome) {
        if let Some(evicted) = self.slots[self.head].replace(outcome) {
            self.totals.remove(evicted);
        }
        self.totals.add(outcome);
        self.head = (self.head + 1) % self.slots.len();
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        snapshot(self.totals, self.minimum_number_of_calls)
    }
}

#[derive(Debug)]
pub struct TimeWindow {
    origin: Instant,
    /// Per-second totals, indexed by `second % len`
    buckets: Box<[Totals]>,
    /// Most recent second the window has been advanced to
    current: u64,
    totals: Totals,
    minimum_number_of_calls: u32,
}

impl TimeWindow {
    pub fn new(seconds: u32, minimum_number_of_calls: u32, now: Instant) -> Self {
        let seconds = seconds.max(1);
        Self {
            origin: now,
            buckets: vec![Totals::default(); seconds as usize].into_boxed_slice(),
            current: 0,
            totals: Totals::default(),
            minimum_number_of_calls,
        }
    }

    pub fn record(&mut self, outcome: Outcome, now: Instant) {
        let idx = self.advance(now);
        self.buckets[idx].add(outcome);
        self.totals.add(outcome);
    }

    pub fn snapshot(&mut self, now: Instant) -> WindowSnapshot {
        self.advance(now);
        snapshot(self.totals, self.minimum_number_of_calls)
    }

    /// Evict every bucket that fell out of the window and return the index
    /// of the bucket for `now`.
    fn advance(&mut self, now: Instant) -> usize {
        let len = self.buckets.len() as u64;
        let second = now.saturating_duration_since(self.origin).as_secs();

        if second > self.current {
            let steps = (second - self.current).min(len);
            for offset in 0..steps {
                let bucket = &mut self.buckets[((second - offset) % len) as usize];
                self.totals.subtract(*bucket);
                *bucket = Totals::default();
            }
            self.current = second;
        }

        // Late records for an instant before `current` land in the current bucket.
        (self.current % len) as usize
    }
}

fn snapshot(totals: Totals, minimum_number_of_calls: u32) -> WindowSnapshot {
    WindowSnapshot {
        total_calls: totals.calls,
        failed_calls: totals.failed,
        slow_calls: totals.slow,
        slow_failed_calls: totals.slow_failed,
        minimum_number_of_calls,
    }
}

/// Either window flavour behind one interface.
#[derive(Debug)]
pub enum SlidingWindow {
    Count(CountWindow),
    Time(TimeWindow),
}

impl SlidingWindow {
    pub fn record(&mut self, outcome: Outcome, now: Instant) {
        match self {
            SlidingWindow::Count(window) => window.record(outcome),
            SlidingWindow::Time(window) => window.record(outcome, now),
        }
    }

    pub fn snapshot(&mut self, now: Instant) -> WindowSnapshot {
        match self {
            SlidingWindow::Count(window) => window.snapshot(),
            SlidingWindow::Time(window) => window.snapshot(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rates_undefined_below_minimum() {
        let mut window = CountWindow::new(10, 4);
        window.record(Outcome::Failure);
        window.record(Outcome::Failure);
        window.record(Outcome::Failure);

        let snap = window.snapshot();
        assert_eq!(snap.total_calls, 3);
        assert_eq!(snap.failure_rate(), -1.0);
        assert_eq!(snap.slow_call_rate(), -1.0);

        window.record(Outcome::Success);
        assert_eq!(window.snapshot().failure_rate(), 75.0);
    }

    #[test]
    fn test_count_window_evicts_oldest() {
        let mut window = CountWindow::new(3, 1);
        window.record(Outcome::Failure);
        window.record(Outcome::SlowFailure);
        window.record(Outcome::Success);
        window.record(Outcome::SlowSuccess);

        let snap = window.snapshot();
        assert_eq!(snap.total_calls, 3);
        assert_eq!(snap.failed_calls, 1);
        assert_eq!(snap.slow_calls, 2);
        assert_eq!(snap.slow_failed_calls, 1);
        assert_eq!(snap.successful_calls(), 2);
    }

    #[test]
    fn test_count_window_caps_minimum_at_size() {
        let mut window = CountWindow::new(2, 100);
        window.record(Outcome::Failure);
        window.record(Outcome::Success);
        assert_eq!(window.snapshot().failure_rate(), 50.0);
    }

    #[test]
    fn test_time_window_discards_expired_buckets() {
        let start = Instant::now();
        let mut window = TimeWindow::new(3, 1, start);

        window.record(Outcome::Failure, start);
        window.record(Outcome::Success, start + Duration::from_secs(1));
        window.record(Outcome::Success, start + Duration::from_secs(2));
        assert_eq!(window.snapshot(start + Duration::from_secs(2)).total_calls, 3);

        // second 0 falls out of the window
        let snap = window.snapshot(start + Duration::from_secs(3));
        assert_eq!(snap.total_calls, 2);
        assert_eq!(snap.failed_calls, 0);

        // long idle gap clears everything
        let snap = window.snapshot(start + Duration::from_secs(60));
        assert_eq!(snap.total_calls, 0);
        assert_eq!(snap.failure_rate(), -1.0);
    }

    #[test]
    fn test_time_window_same_second_shares_bucket() {
        let start = Instant::now();
        let mut window = TimeWindow::new(2, 2, start);
        window.record(Outcome::SlowFailure, start + Duration::from_millis(100));
        window.record(Outcome::Success, start + Duration::from_millis(900));

        let snap = window.snapshot(start + Duration::from_millis(950));
        assert_eq!(snap.total_calls, 2);
        assert_eq!(snap.failure_rate(), 50.0);
        assert_eq!(snap.slow_call_rate(), 50.0);
    }
}
