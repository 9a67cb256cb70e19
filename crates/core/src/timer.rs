//! High-resolution timing for the frame loop.

use std::time::{Duration, Instant};

/// High-resolution timer for measuring elapsed time.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    last_tick: Instant,
}

impl Timer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
        }
    }

    /// Get the total elapsed time since the timer was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Get the time elapsed since the last call to `tick()`.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        delta
    }

    /// Reset the timer to the current time.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.start = now;
        self.last_tick = now;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Rolling counters for presented frames over a reporting window.
///
/// The loop calls [`FrameStats::record`] once per presented frame and
/// [`FrameStats::take_report`] to obtain and clear the window once it is due.
#[derive(Debug)]
pub struct FrameStats {
    timer: Timer,
    report_every: Duration,
    frames: u64,
    busy: Duration,
    total_frames: u64,
}

/// Summary of one reporting window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub frames: u64,
    pub total_frames: u64,
    pub average_frame_ms: f64,
    pub fps: f64,
}

impl FrameStats {
    pub fn new(report_every: Duration) -> Self {
        Self {
            timer: Timer::new(),
            report_every,
            frames: 0,
            busy: Duration::ZERO,
            total_frames: 0,
        }
    }

    /// Counts one frame that took `frame_time` of wall time.
    pub fn record(&mut self, frame_time: Duration) {
        self.frames += 1;
        self.total_frames += 1;
        self.busy += frame_time;
    }

    #[inline]
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Returns a report once the reporting window has elapsed.
    pub fn take_report(&mut self) -> Option<FrameReport> {
        let window = self.timer.elapsed();
        if window < self.report_every || self.frames == 0 {
            return None;
        }
        let report = FrameReport {
            frames: self.frames,
            total_frames: self.total_frames,
            average_frame_ms: self.busy.as_secs_f64() * 1000.0 / self.frames as f64,
            fps: self.frames as f64 / window.as_secs_f64(),
        };
        self.frames = 0;
        self.busy = Duration::ZERO;
        self.timer.reset();
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_is_monotonic() {
        let mut timer = Timer::new();
        std::thread::sleep(Duration::from_millis(2));
        let first = timer.tick();
        assert!(first >= Duration::from_millis(2));
        assert!(timer.elapsed() >= first);
    }

    #[test]
    fn test_no_report_without_frames() {
        let mut stats = FrameStats::new(Duration::ZERO);
        assert!(stats.take_report().is_none());
    }

    #[test]
    fn test_report_averages_and_clears() {
        let mut stats = FrameStats::new(Duration::ZERO);
        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(20));

        let report = stats.take_report().expect("report due");
        assert_eq!(report.frames, 2);
        assert_eq!(report.total_frames, 2);
        assert!((report.average_frame_ms - 15.0).abs() < 1e-9);

        stats.record(Duration::from_millis(5));
        let report = stats.take_report().expect("report due");
        assert_eq!(report.frames, 1);
        assert_eq!(report.total_frames, 3);
        assert_eq!(stats.total_frames(), 3);
    }
}
