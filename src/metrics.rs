//! Metrics / health (§4.8, table row "Metrics / Health"): sample-rate
//! tracking, memory high-water mark, and the dispatcher's sustained
//! drop-rate warning.
//!
//! The RSS sampling is ported verbatim from the teacher's `get_memory_mb`
//! in `main.rs` (`/proc/self/status` `VmRSS:` line). The drop-rate window
//! is new, grounded on §4.8's "> 10% over 10s" rule and the `DropCounters`
//! the dispatcher already exposes.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::dispatcher::DropCounters;

/// Reads current resident set size in MB from `/proc/self/status`. Returns
/// 0.0 on platforms without procfs (the teacher's fallback behavior).
pub fn current_rss_mb() -> f64 {
    if let Ok(content) = std::fs::read_to_string("/proc/self/status") {
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                if let Some(value) = rest.split_whitespace().next() {
                    if let Ok(kb) = value.parse::<f64>() {
                        return kb / 1024.0;
                    }
                }
            }
        }
    }
    0.0
}

/// Tracks per-sensor sample counts and their observed rate (Hz) over a
/// fixed window, for the live status and final session summary.
pub struct SampleRateTracker {
    window_secs: f64,
    events: VecDeque<Instant>,
    total: u64,
}

impl SampleRateTracker {
    pub fn new(window_secs: f64) -> Self {
        Self { window_secs, events: VecDeque::new(), total: 0 }
    }

    pub fn record(&mut self, now: Instant) {
        self.total += 1;
        self.events.push_back(now);
        while let Some(front) = self.events.front() {
            if now.duration_since(*front).as_secs_f64() > self.window_secs {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn rate_hz(&self) -> f64 {
        if self.events.len() < 2 {
            return 0.0;
        }
        let span = self
            .events
            .back()
            .unwrap()
            .duration_since(*self.events.front().unwrap())
            .as_secs_f64();
        if span <= 0.0 {
            0.0
        } else {
            (self.events.len() as f64 - 1.0) / span
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Memory high-water mark, sampled on each call to `poll` (§4.12's
/// "current memory RSS MB" is the live point-in-time value; this tracks
/// the session-lifetime peak for the final summary).
#[derive(Default)]
pub struct MemoryTracker {
    peak_mb: f64,
}

impl MemoryTracker {
    pub fn poll(&mut self) -> f64 {
        let current = current_rss_mb();
        self.peak_mb = self.peak_mb.max(current);
        current
    }

    pub fn peak_mb(&self) -> f64 {
        self.peak_mb
    }
}

struct DropSample {
    at: Instant,
    dispatched: u64,
    dropped: u64,
}

/// Watches one filter's dispatcher drop counter against total dispatched
/// volume over a rolling 10s window, warning once the drop rate exceeds
/// 10% (§4.8, §5 "degraded-but-alive" path).
pub struct DropRateMonitor {
    window_secs: f64,
    threshold: f64,
    history: VecDeque<DropSample>,
    warned: bool,
}

impl DropRateMonitor {
    pub fn new() -> Self {
        Self { window_secs: 10.0, threshold: 0.10, history: VecDeque::new(), warned: false }
    }

    /// Returns `Some(rate)` the first time the sustained drop rate crosses
    /// the threshold within a window; stays silent on subsequent polls
    /// until the rate drops back below threshold and re-crosses.
    pub fn poll(&mut self, now: Instant, dispatched: u64, dropped: u64) -> Option<f64> {
        self.history.push_back(DropSample { at: now, dispatched, dropped });
        while let Some(front) = self.history.front() {
            if now.duration_since(front.at).as_secs_f64() > self.window_secs {
                self.history.pop_front();
            } else {
                break;
            }
        }

        let oldest = self.history.front()?;
        let dispatched_delta = dispatched.saturating_sub(oldest.dispatched);
        let dropped_delta = dropped.saturating_sub(oldest.dropped);
        if dispatched_delta == 0 {
            return None;
        }

        let rate = dropped_delta as f64 / dispatched_delta as f64;
        if rate > self.threshold {
            if !self.warned {
                self.warned = true;
                return Some(rate);
            }
        } else {
            self.warned = false;
        }
        None
    }
}

impl Default for DropRateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Bundles one `DropRateMonitor` per filter inlet against the dispatcher's
/// shared counters; `poll` logs a warning for any filter whose sustained
/// drop rate crosses 10% over the last 10s.
pub struct DropRateMonitors {
    ekf13d: DropRateMonitor,
    es_ekf: DropRateMonitor,
    complementary: DropRateMonitor,
}

impl DropRateMonitors {
    pub fn new() -> Self {
        Self {
            ekf13d: DropRateMonitor::new(),
            es_ekf: DropRateMonitor::new(),
            complementary: DropRateMonitor::new(),
        }
    }

    pub fn poll(&mut self, counters: &Arc<DropCounters>) {
        let now = Instant::now();
        let dispatched = counters.dispatched.load(Ordering::Relaxed);

        if let Some(rate) = self.ekf13d.poll(now, dispatched, counters.ekf13d.load(Ordering::Relaxed)) {
            log::warn!(target: "metrics", "ekf13d inlet sustained drop rate {:.1}% over 10s", rate * 100.0);
        }
        if let Some(rate) = self.es_ekf.poll(now, dispatched, counters.es_ekf.load(Ordering::Relaxed)) {
            log::warn!(target: "metrics", "es_ekf inlet sustained drop rate {:.1}% over 10s", rate * 100.0);
        }
        if let Some(rate) = self
            .complementary
            .poll(now, dispatched, counters.complementary.load(Ordering::Relaxed))
        {
            log::warn!(target: "metrics", "complementary inlet sustained drop rate {:.1}% over 10s", rate * 100.0);
        }
    }
}

impl Default for DropRateMonitors {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sample_rate_tracker_reports_zero_with_fewer_than_two_samples() {
        let mut tracker = SampleRateTracker::new(5.0);
        tracker.record(Instant::now());
        assert_eq!(tracker.rate_hz(), 0.0);
    }

    #[test]
    fn memory_tracker_keeps_running_peak() {
        let mut tracker = MemoryTracker::default();
        let first = tracker.poll();
        assert!(tracker.peak_mb() >= first);
    }

    #[test]
    fn drop_rate_monitor_silent_below_threshold() {
        let mut monitor = DropRateMonitor::new();
        let t0 = Instant::now();
        assert_eq!(monitor.poll(t0, 100, 1), None);
        assert_eq!(monitor.poll(t0 + Duration::from_secs(1), 200, 2), None);
    }

    #[test]
    fn drop_rate_monitor_warns_once_above_threshold() {
        let mut monitor = DropRateMonitor::new();
        let t0 = Instant::now();
        monitor.poll(t0, 0, 0);
        let warned = monitor.poll(t0 + Duration::from_secs(1), 100, 50);
        assert!(warned.is_some());
        let silent_again = monitor.poll(t0 + Duration::from_millis(1100), 110, 55);
        assert_eq!(silent_again, None);
    }
}
