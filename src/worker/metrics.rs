//! Per-stream processing metrics and the adaptive frame-skip decision
//!
//! The worker keeps a short window of recent processing times. When user
//! code is slower than the stream's frame interval, the worker falls behind
//! real time; the skip budget accumulates the excess and converts it into
//! whole frames whose `process` stage is bypassed. Over a sustained window
//! the processed/total ratio settles at `min(1, 1 / (avg_time * fps))`, so
//! skipped plus processed frames together keep pace with the producer.

use std::collections::VecDeque;
use std::time::Duration;

/// Only the most recent measurements matter for pacing.
const TIME_WINDOW: usize = 4;

#[derive(Debug, Default)]
pub struct ProcessingMetrics {
    times: VecDeque<Duration>,
    n_skipped: u32,
    skip_budget: f64,
}

impl ProcessingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the processing time of a non-skipped frame and reset the
    /// consecutive-skip counter.
    pub fn record(&mut self, elapsed: Duration, fps: f64) {
        if self.times.len() == TIME_WINDOW {
            self.times.pop_front();
        }
        self.times.push_back(elapsed);
        self.n_skipped = 0;
        if fps > 0.0 {
            // A frame costing more than its interval leaves the worker
            // behind by the excess, measured in frame intervals.
            let behind = self.average().as_secs_f64() * fps - 1.0;
            self.skip_budget = (self.skip_budget + behind).max(0.0);
        }
    }

    /// Whether the next frame's `process` stage should be skipped to keep
    /// pace with the stream.
    pub fn should_skip(&self, fps: f64) -> bool {
        if self.times.is_empty() || fps <= 0.0 {
            return false;
        }
        self.skip_budget >= 1.0
    }

    /// Account one skipped frame.
    pub fn count_skip(&mut self) {
        self.n_skipped += 1;
        self.skip_budget = (self.skip_budget - 1.0).max(0.0);
    }

    /// Consecutive frames skipped since the last processed one.
    pub fn consecutive_skips(&self) -> u32 {
        self.n_skipped
    }

    pub fn average(&self) -> Duration {
        if self.times.is_empty() {
            return Duration::ZERO;
        }
        self.times.iter().sum::<Duration>() / self.times.len() as u32
    }

    /// Stream boundary: measurements from one stream say nothing about the
    /// next.
    pub fn reset(&mut self) {
        self.times.clear();
        self.n_skipped = 0;
        self.skip_budget = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::{ProcessingMetrics, TIME_WINDOW};
    use std::time::Duration;

    /// Run `total` frames through the skip decision with a fixed hook cost,
    /// returning how many were processed.
    fn simulate(total: u32, hook_cost: Duration, fps: f64) -> u32 {
        let mut metrics = ProcessingMetrics::new();
        let mut processed = 0;
        for _ in 0..total {
            if metrics.should_skip(fps) {
                metrics.count_skip();
            } else {
                metrics.record(hook_cost, fps);
                processed += 1;
            }
        }
        processed
    }

    #[test]
    fn first_frame_is_always_processed() {
        let metrics = ProcessingMetrics::new();
        assert!(!metrics.should_skip(30.0));
    }

    #[test]
    fn fast_hooks_never_skip() {
        let processed = simulate(200, Duration::from_millis(10), 30.0);
        assert_eq!(processed, 200);
    }

    #[test]
    fn slow_hook_ratio_matches_the_budget() {
        // 40 ms of processing at 30 fps can keep up with 1/1.2 of the frames
        let processed = simulate(200, Duration::from_millis(40), 30.0);
        let ratio = processed as f64 / 200.0;
        assert!((ratio - 1.0 / 1.2).abs() < 0.1, "ratio was {}", ratio);
    }

    #[test]
    fn very_slow_hook_skips_most_frames() {
        // 100 ms at 30 fps: every processed frame costs three intervals
        let processed = simulate(300, Duration::from_millis(100), 30.0);
        let ratio = processed as f64 / 300.0;
        assert!((ratio - 1.0 / 3.0).abs() < 0.05, "ratio was {}", ratio);
    }

    #[test]
    fn window_is_bounded_and_favors_recent_times() {
        let mut metrics = ProcessingMetrics::new();
        for _ in 0..10 {
            metrics.record(Duration::from_millis(100), 30.0);
        }
        for _ in 0..TIME_WINDOW {
            metrics.record(Duration::from_millis(4), 30.0);
        }
        assert_eq!(metrics.average(), Duration::from_millis(4));
    }

    #[test]
    fn skip_counter_resets_on_processed_frames() {
        let mut metrics = ProcessingMetrics::new();
        metrics.record(Duration::from_millis(100), 30.0);
        metrics.count_skip();
        metrics.count_skip();
        assert_eq!(metrics.consecutive_skips(), 2);
        metrics.record(Duration::from_millis(100), 30.0);
        assert_eq!(metrics.consecutive_skips(), 0);
    }

    #[test]
    fn reset_clears_everything() {
        let mut metrics = ProcessingMetrics::new();
        metrics.record(Duration::from_millis(500), 30.0);
        metrics.count_skip();
        metrics.reset();
        assert_eq!(metrics.average(), Duration::ZERO);
        assert_eq!(metrics.consecutive_skips(), 0);
        assert!(!metrics.should_skip(30.0));
    }
}
