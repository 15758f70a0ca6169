// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Rolling latency statistics via Welford's online algorithm.
//!
//! Samples accumulate into a "next" buffer under a spin lock;
//! [`Latency::roll`] swaps "next" into "curr" and computes `stddev` for
//! the buffer just rotated in, leaving "curr" immutable (and therefore
//! lock-free to read) until the next roll.

use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, Default)]
struct Stats {
    count: u64,
    min: f64,
    max: f64,
    mean: f64,
    m2: f64,
    stddev: f64,
}

/// A snapshot of the rolled-in statistics, safe to read without locking.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LatencySnapshot {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
}

pub struct Latency {
    curr: Mutex<Stats>,
    next: Mutex<Stats>,
}

impl Latency {
    pub fn new() -> Self {
        Self {
            curr: Mutex::new(Stats::default()),
            next: Mutex::new(Stats::default()),
        }
    }

    /// Fold one new observation into the "next" buffer.
    pub fn on_sample(&self, value: f64) {
        let mut next = self.next.lock();
        let delta = value - next.mean;
        next.count += 1;
        next.mean += delta / next.count as f64;
        next.m2 += delta * (value - next.mean);

        if next.min == 0.0 || value < next.min {
            next.min = value;
        }
        if next.max == 0.0 || value > next.max {
            next.max = value;
        }
    }

    /// Rotate "next" into "curr", computing `stddev` for the freshly
    /// rotated buffer, and reset "next" to start a new window.
    pub fn roll(&self) {
        let mut next = self.next.lock();
        let mut rolled = std::mem::take(&mut *next);
        drop(next);

        rolled.stddev = if rolled.count > 1 {
            (rolled.m2 / (rolled.count - 1) as f64).sqrt()
        } else {
            0.0
        };

        *self.curr.lock() = rolled;
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let curr = self.curr.lock();
        LatencySnapshot {
            count: curr.count,
            min: curr.min,
            max: curr.max,
            mean: curr.mean,
            stddev: curr.stddev,
        }
    }
}

impl Default for Latency {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_latency_rolls_to_all_zero_snapshot() {
        let lat = Latency::new();
        lat.roll();
        assert_eq!(lat.snapshot(), LatencySnapshot::default());
    }

    #[test]
    fn mean_and_stddev_match_known_sample_set() {
        let lat = Latency::new();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            lat.on_sample(v);
        }
        lat.roll();
        let snap = lat.snapshot();
        assert_eq!(snap.count, 8);
        assert!((snap.mean - 5.0).abs() < 1e-9);
        assert!((snap.stddev - 2.0).abs() < 1e-9);
        assert_eq!(snap.min, 2.0);
        assert_eq!(snap.max, 9.0);
    }

    #[test]
    fn single_sample_has_zero_stddev() {
        let lat = Latency::new();
        lat.on_sample(42.0);
        lat.roll();
        assert_eq!(lat.snapshot().stddev, 0.0);
    }

    #[test]
    fn roll_starts_a_fresh_window() {
        let lat = Latency::new();
        lat.on_sample(10.0);
        lat.roll();
        assert_eq!(lat.snapshot().count, 1);
        lat.roll();
        assert_eq!(lat.snapshot().count, 0);
    }
}
